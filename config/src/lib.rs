pub mod paths;
pub mod settings;

pub use paths::PathManager;
pub use settings::{Settings, TransportPreference};

use std::path::PathBuf;

/// Load environment variables from .env files.
/// Loads ./.env (project directory) first, then ~/.env (home directory).
/// Call this before parsing CLI args to ensure env vars are available.
pub fn load_env_file() {
    let mut files = vec![PathBuf::from(".env")];
    if let Some(home) = dirs::home_dir() {
        files.push(home.join(".env"));
    }
    load_env_files(&files);
}

/// Load each file in order. A variable that is already set is never
/// overwritten, so the process environment wins, then earlier files.
pub fn load_env_files(files: &[PathBuf]) {
    for file in files {
        dotenv::from_path(file).ok();
    }
}
