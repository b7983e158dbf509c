mod logging;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use config::{PathManager, Settings, TransportPreference, load_env_file};
use margin_core::storage::PersistenceGateway;
use margin_core::{
    AgentEngine, ChangelogStatus, CommentDraft, DocumentPath, DocumentView, EngineOptions,
    HostCapabilities, HttpGateway, HttpTransportConfig, Identity, MemoryGateway, ProcessChannel,
    RetryPolicy, Role, select_transport,
};

use clap_derive::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Copy, Clone, ValueEnum, Debug, PartialEq, Eq)]
#[clap(rename_all = "lowercase")]
enum TransportArg {
    Auto,
    Ipc,
    Http,
}

impl From<TransportArg> for TransportPreference {
    fn from(t: TransportArg) -> Self {
        match t {
            TransportArg::Auto => TransportPreference::Auto,
            TransportArg::Ipc => TransportPreference::Ipc,
            TransportArg::Http => TransportPreference::Http,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Chat with and hand edits to the document agent", long_about = None)]
struct Args {
    /// Base URL of the served application (persistence and HTTP agent endpoints)
    #[arg(long, env = "MARGIN_SERVER_URL")]
    server_url: Option<String>,

    /// Command line of a local agent process, spoken to over stdin/stdout
    #[arg(long, env = "MARGIN_AGENT_COMMAND")]
    agent_command: Option<String>,

    /// Model name forwarded to the agent
    #[arg(long, env = "MARGIN_MODEL")]
    model: Option<String>,

    #[arg(long, value_enum)]
    transport: Option<TransportArg>,

    /// Write logs here instead of the default log file
    #[arg(long, env = "MARGIN_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a chat message about a document and stream the reply
    Chat {
        document: String,
        message: String,
        /// Selected text to send along as context
        #[arg(long)]
        context: Option<String>,
    },
    /// Leave comments on a document and send them to the agent as one edit
    Edit {
        document: String,
        /// Comment as "selected text::instruction" with an optional "::line"
        #[arg(long = "comment", required = true)]
        comments: Vec<String>,
    },
    /// Print the active session, comments and changelog of a document
    History { document: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    let args = Args::parse();

    if let Some(path) = &args.log_file {
        PathManager::set_log_file(path.clone());
    }
    if let Err(e) = PathManager::ensure_dirs_exist() {
        eprintln!("[margin] Failed to create data directories: {}", e);
    }
    logging::init_logging();

    let mut settings = Settings::load_or_create().unwrap_or_else(|e| {
        tracing::warn!("Could not write default settings: {}", e);
        Settings::default()
    });
    if let Some(url) = &args.server_url {
        settings.server_url = Some(url.clone());
    }
    if let Some(command) = &args.agent_command {
        settings.agent_command = Some(command.clone());
    }
    if let Some(model) = &args.model {
        settings.default_model = Some(model.clone());
    }
    if let Some(transport) = args.transport {
        settings.transport = transport.into();
    }

    let engine = build_engine(&settings)?;
    tracing::info!(transport = %engine.transport_kind(), "Engine ready");

    match args.command {
        Command::Chat {
            document,
            message,
            context,
        } => chat(&engine, DocumentPath::new(document), &message, context).await,
        Command::Edit { document, comments } => {
            edit(&engine, DocumentPath::new(document), &comments).await
        }
        Command::History { document } => history(&engine, DocumentPath::new(document)).await,
    }
}

fn build_engine(settings: &Settings) -> Result<AgentEngine> {
    let gateway: Arc<dyn PersistenceGateway> = match &settings.server_url {
        Some(url) => Arc::new(HttpGateway::new(url.clone())?),
        None => {
            tracing::warn!("No server URL configured, history is kept in memory only");
            Arc::new(MemoryGateway::new())
        }
    };

    let mut capabilities = HostCapabilities::default();
    if settings.wants_ipc() {
        let command = settings
            .agent_command
            .as_deref()
            .ok_or_else(|| anyhow!("IPC transport requested but no agent command is configured"))?;
        let channel = ProcessChannel::spawn(command).context("Failed to start agent process")?;
        capabilities = HostCapabilities::with_channel(Arc::new(channel));
    } else if settings.server_url.is_none() {
        bail!("Set MARGIN_SERVER_URL or MARGIN_AGENT_COMMAND to reach an agent");
    }

    let http = HttpTransportConfig::new(settings.server_url.clone().unwrap_or_default())
        .with_poll_interval(Duration::from_millis(settings.poll_interval_ms));
    let transport = select_transport(capabilities, http)?;

    Ok(AgentEngine::new(
        gateway,
        transport,
        EngineOptions {
            retry: RetryPolicy::new(
                settings.retry_attempts,
                Duration::from_millis(settings.retry_backoff_ms),
            ),
            model: settings.default_model.clone(),
        },
    ))
}

async fn chat(
    engine: &AgentEngine,
    document: DocumentPath,
    message: &str,
    context: Option<String>,
) -> Result<()> {
    engine.open_document(&document).await?;
    engine.send_message(&document, message, context).await?;

    let (view, streamed) = follow(engine, &document).await?;
    let Some(reply) = view.messages.last().filter(|m| m.role == Role::Assistant) else {
        println!();
        return Ok(());
    };
    if reply.is_error {
        println!();
        bail!("{}", reply.content);
    }
    match reply.content.strip_prefix(streamed.as_str()) {
        Some(rest) => println!("{}", rest),
        None => println!("\n{}", reply.content),
    }
    Ok(())
}

async fn edit(engine: &AgentEngine, document: DocumentPath, comments: &[String]) -> Result<()> {
    engine.open_document(&document).await?;

    let mut batch = Vec::with_capacity(comments.len());
    for raw in comments {
        let draft = parse_comment(raw)?;
        batch.push(Identity::Persisted(engine.add_comment(&document, draft).await?));
    }
    engine.send_edit_batch(&document, &batch).await?;

    let (view, _) = follow(engine, &document).await?;
    println!();
    if let Some(entry) = view.changelog.first() {
        println!("[{:?}] {}", entry.status, entry.summary);
        if entry.status == ChangelogStatus::Error {
            bail!("edit failed: {}", entry.summary);
        }
    }
    Ok(())
}

async fn history(engine: &AgentEngine, document: DocumentPath) -> Result<()> {
    engine.open_document(&document).await?;
    let view = engine.snapshot(&document);

    match &view.active_session_id {
        Some(id) => println!("Session {} ({} total)", id, view.sessions.len()),
        None => println!("No sessions"),
    }
    for message in &view.messages {
        let role = match message.role {
            Role::User => "you",
            Role::Assistant => "agent",
        };
        println!("{}: {}", role, message.content);
    }
    if !view.comments.is_empty() {
        println!("\nComments:");
        for comment in &view.comments {
            println!(
                "  [{}] \"{}\": {}",
                comment.status, comment.selected_text, comment.instruction
            );
        }
    }
    if !view.changelog.is_empty() {
        println!("\nChangelog:");
        for entry in &view.changelog {
            println!(
                "  {} [{:?}] {}",
                entry.created_at.format("%Y-%m-%d %H:%M"),
                entry.status,
                entry.summary
            );
        }
    }
    Ok(())
}

/// Print streamed output until the document settles. Ctrl-C cancels.
///
/// Returns the settled view and the text already printed.
async fn follow(engine: &AgentEngine, document: &DocumentPath) -> Result<(DocumentView, String)> {
    let mut changes = engine.subscribe();
    let mut printed = String::new();
    let mut stdout = std::io::stdout();

    loop {
        let view = engine.snapshot(document);
        if view.stream_output != printed {
            match view.stream_output.strip_prefix(printed.as_str()) {
                Some(rest) => write!(stdout, "{}", rest)?,
                None => write!(stdout, "\n{}", view.stream_output)?,
            }
            stdout.flush()?;
            printed = view.stream_output.clone();
        }
        if view.pending.is_none() && !view.is_streaming {
            return Ok((view, printed));
        }

        tokio::select! {
            changed = changes.changed() => changed.context("engine stopped")?,
            _ = tokio::signal::ctrl_c() => {
                match engine.cancel(document).await {
                    Ok(()) => eprintln!("\n[margin] cancelled"),
                    Err(e) => tracing::warn!(error = %e, "Cancel ignored"),
                }
            }
        }
    }
}

fn parse_comment(raw: &str) -> Result<CommentDraft> {
    let mut parts = raw.split("::");
    let selected_text = parts.next().unwrap_or_default().trim();
    let instruction = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("comment {:?} has no instruction", raw))?;
    let line_hint = parts
        .next()
        .map(|line| line.trim().parse::<u32>())
        .transpose()
        .with_context(|| format!("comment {:?} has an invalid line number", raw))?;

    Ok(CommentDraft {
        selected_text: selected_text.to_string(),
        instruction: instruction.to_string(),
        line_hint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_comment_with_line() {
        let draft = parse_comment("the old intro::tighten this::12").unwrap();
        assert_eq!(draft.selected_text, "the old intro");
        assert_eq!(draft.instruction, "tighten this");
        assert_eq!(draft.line_hint, Some(12));
    }

    #[test]
    fn test_parse_comment_without_line() {
        let draft = parse_comment("heading::make it a question").unwrap();
        assert_eq!(draft.line_hint, None);
    }

    #[test]
    fn test_parse_comment_rejects_missing_instruction() {
        assert!(parse_comment("just a selection").is_err());
        assert!(parse_comment("sel::  ").is_err());
        assert!(parse_comment("sel::fix::abc").is_err());
    }
}
