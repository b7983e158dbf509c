//! Application settings management

use crate::PathManager;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Which agent transport the host should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// IPC when an agent command is configured, HTTP otherwise
    #[default]
    Auto,
    Ipc,
    Http,
}

/// Application settings stored in settings.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub transport: TransportPreference,
    /// Command line used to spawn the agent process (e.g. "margin-agent --stdio")
    pub agent_command: Option<String>,
    /// Base URL of the served application (HTTP transport and persistence)
    pub server_url: Option<String>,
    pub poll_interval_ms: u64,
    /// Persistence retry budget
    pub retry_attempts: u32,
    /// Linear backoff unit; attempt N waits N * retry_backoff_ms
    pub retry_backoff_ms: u64,
    /// Model hint forwarded to the agent (e.g. "claude/claude-sonnet-4-5")
    pub default_model: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transport: TransportPreference::Auto,
            agent_command: None,
            server_url: None,
            poll_interval_ms: 500,
            retry_attempts: 3,
            retry_backoff_ms: 1000,
            default_model: None,
        }
    }
}

impl Settings {
    /// Load settings from the settings file. On first run the defaults are
    /// written there so they can be edited.
    pub fn load_or_create() -> Result<Self, String> {
        match PathManager::settings_path() {
            Some(path) => Self::load_or_create_at(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_or_create_at(path: &Path) -> Result<Self, String> {
        if path.exists() {
            return Ok(Self::load_from(path));
        }
        let settings = Self::default();
        settings.save_to(path)?;
        Ok(settings)
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };

        toml::from_str(&content).unwrap_or_default()
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config dir: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;
        fs::write(path, content).map_err(|e| format!("Failed to write settings: {}", e))?;
        Ok(())
    }

    /// Whether the host should drive the agent over the process channel.
    pub fn wants_ipc(&self) -> bool {
        match self.transport {
            TransportPreference::Ipc => true,
            TransportPreference::Http => false,
            TransportPreference::Auto => self.agent_command.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("nope.toml"));
        assert_eq!(settings.poll_interval_ms, 500);
        assert_eq!(settings.retry_attempts, 3);
        assert_eq!(settings.retry_backoff_ms, 1000);
        assert_eq!(settings.transport, TransportPreference::Auto);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "server_url = \"http://localhost:4000\"\npoll_interval_ms = 250\n").unwrap();

        let settings = Settings::load_from(&path);
        assert_eq!(settings.server_url.as_deref(), Some("http://localhost:4000"));
        assert_eq!(settings.poll_interval_ms, 250);
        assert_eq!(settings.retry_attempts, 3);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let settings = Settings {
            transport: TransportPreference::Http,
            default_model: Some("claude/claude-sonnet-4-5".to_string()),
            ..Settings::default()
        };
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path);
        assert_eq!(loaded.transport, TransportPreference::Http);
        assert_eq!(loaded.default_model.as_deref(), Some("claude/claude-sonnet-4-5"));
    }

    #[test]
    fn test_first_run_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("margin").join("settings.toml");

        let settings = Settings::load_or_create_at(&path).unwrap();
        assert_eq!(settings.poll_interval_ms, 500);
        assert!(path.exists());

        // An existing file is read, never overwritten
        fs::write(&path, "transport = \"ipc\"\n").unwrap();
        let settings = Settings::load_or_create_at(&path).unwrap();
        assert_eq!(settings.transport, TransportPreference::Ipc);
        assert_eq!(fs::read_to_string(&path).unwrap(), "transport = \"ipc\"\n");
    }

    #[test]
    fn test_auto_prefers_ipc_only_with_agent_command() {
        let mut settings = Settings::default();
        assert!(!settings.wants_ipc());
        settings.agent_command = Some("margin-agent --stdio".to_string());
        assert!(settings.wants_ipc());
        settings.transport = TransportPreference::Http;
        assert!(!settings.wants_ipc());
    }
}
