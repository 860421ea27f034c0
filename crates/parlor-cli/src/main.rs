//! Parlor CLI: inspect, fork, delete and compact persisted chat sessions.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parlor_config::{CliOverrides, ParlorConfig};
use parlor_session::{
    CompactError, Compactor, ContextInfo, ExtractiveSummarizer, JsonFilePersister, MAIN_SESSION,
    Session, SessionError, SessionStore, archive_markdown, fork_key, session_key,
};
use parlor_types::{Message, ParlorError, preview};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Width of message previews in listings.
const PREVIEW_BYTES: usize = 60;

#[derive(Parser)]
#[command(name = "parlor", version, about = "Inspect and maintain Parlor chat sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Data directory (overrides PARLOR_DATA_DIR and the config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// History cap applied to loaded sessions
    #[arg(long, global = true)]
    max_history: Option<usize>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// List stored sessions
    List {
        #[arg(long)]
        channel: Option<String>,
        /// Requires --channel; lists the user's main session and forks
        #[arg(long, requires = "channel")]
        user: Option<String>,
    },
    /// Print the messages of a session
    Show {
        key: String,
        /// Only the most recent N messages
        #[arg(long)]
        last: Option<usize>,
    },
    /// Show token usage of a session
    Stats { key: String },
    /// Fork the main session of a user under a new name
    Fork {
        channel: String,
        user: String,
        name: String,
    },
    /// Delete the main session of a user, or one of its forks
    Delete {
        channel: String,
        user: String,
        /// Fork to delete instead of the main session
        name: Option<String>,
    },
    /// Summarize old history of a session
    Compact {
        key: String,
        /// Compact even when under the token budget
        #[arg(long)]
        force: bool,
        /// Write the summarized messages to a markdown archive
        #[arg(long)]
        archive: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config = load_config(CliOverrides {
        data_dir: cli.data_dir,
        max_history: cli.max_history,
    })?;

    let persister = Arc::new(
        JsonFilePersister::new(&config.data_dir)
            .await
            .with_context(|| format!("Failed to open {}", config.data_dir.display()))?,
    );
    let store = SessionStore::new()
        .with_max_history(config.max_history)
        .with_persister(Arc::clone(&persister) as Arc<dyn parlor_session::Persister>);
    let restored = store
        .restore()
        .await
        .context("Failed to load stored sessions")?;
    tracing::debug!(restored, dir = %persister.sessions_dir().display(), "sessions loaded");

    let outcome = run(cli.command, &store, &persister, &config).await;
    store.flush().await;
    Ok(outcome?)
}

async fn run(
    command: Command,
    store: &SessionStore,
    persister: &JsonFilePersister,
    config: &ParlorConfig,
) -> Result<(), ParlorError> {
    match command {
        Command::List { channel, user } => {
            list_sessions(store, channel.as_deref(), user.as_deref());
            Ok(())
        }
        Command::Show { key, last } => {
            let session = lookup(store, &key)?;
            let messages = match last {
                Some(n) => session.get_history(n),
                None => session.get_all_messages(),
            };
            for msg in &messages {
                print_message(msg);
            }
            Ok(())
        }
        Command::Stats { key } => {
            let session = lookup(store, &key)?;
            let info = ContextInfo::estimate(
                &session.get_all_messages(),
                config.compaction.max_tokens,
            );
            println!("{key}");
            println!("{}", info.format_detailed());
            if let Some(model) = session.model() {
                println!("  Model:   {model}");
            }
            if let Some(profile) = session.profile() {
                println!("  Profile: {profile}");
            }
            Ok(())
        }
        Command::Fork {
            channel,
            user,
            name,
        } => {
            let fork = store.fork(&channel, &user, &name)?;
            store.persist(&fork);
            eprintln!("Created {} ({} messages)", fork.key(), fork.len());
            Ok(())
        }
        Command::Delete {
            channel,
            user,
            name,
        } => {
            let key = delete_target(&channel, &user, name.as_deref());
            if !store.delete_key(&key) {
                return Err(SessionError::NotFound { key }.into());
            }
            eprintln!("Deleted {key}");
            Ok(())
        }
        Command::Compact {
            key,
            force,
            archive,
        } => {
            let session = lookup(store, &key)?;
            compact(store, persister, config, &session, force, archive).await
        }
    }
}

fn load_config(overrides: CliOverrides) -> Result<ParlorConfig> {
    ParlorConfig::load(overrides).context("Failed to load configuration")
}

/// Key removed by `delete`: the main session, or the named fork.
fn delete_target(channel: &str, user: &str, name: Option<&str>) -> String {
    let base = session_key(channel, user);
    match name {
        Some(name) if name != MAIN_SESSION => fork_key(&base, name),
        _ => base,
    }
}

fn lookup(store: &SessionStore, key: &str) -> Result<Arc<Session>, SessionError> {
    store.get_by_key(key).ok_or_else(|| SessionError::NotFound {
        key: key.to_string(),
    })
}

fn list_sessions(store: &SessionStore, channel: Option<&str>, user: Option<&str>) {
    let keys: Vec<String> = match (channel, user) {
        (Some(channel), Some(user)) => store
            .list_user_sessions(channel, user)
            .into_iter()
            .map(|entry| entry.key)
            .collect(),
        (Some(channel), None) => {
            let prefix = format!("{channel}:");
            store
                .keys()
                .into_iter()
                .filter(|k| k.starts_with(&prefix))
                .collect()
        }
        _ => store.keys(),
    };

    if keys.is_empty() {
        eprintln!("No saved sessions.");
        return;
    }
    for key in &keys {
        let Some(session) = store.get_by_key(key) else {
            continue;
        };
        let last = session.get_history(1);
        let text = last.first().map(|m| preview(&m.text, PREVIEW_BYTES));
        println!(
            "{:<32} {:>4} msgs  {}  {}",
            key,
            session.len(),
            session.updated_at().format("%Y-%m-%d %H:%M"),
            text.as_deref().unwrap_or("(empty)")
        );
    }
}

fn print_message(msg: &Message) {
    let author = if msg.is_summary() {
        "summary"
    } else if msg.from_bot {
        "bot"
    } else {
        "user"
    };
    println!("[{}] {author}:", msg.timestamp.format("%Y-%m-%d %H:%M:%S"));
    for line in msg.text.lines() {
        println!("  {line}");
    }
}

async fn compact(
    store: &SessionStore,
    persister: &JsonFilePersister,
    config: &ParlorConfig,
    session: &Session,
    force: bool,
    archive: bool,
) -> Result<(), ParlorError> {
    let compactor = Compactor::new(Arc::new(ExtractiveSummarizer), config.compaction);
    let result = match compactor.compact_session(session, force).await {
        Ok(result) => result,
        Err(CompactError::NotSmaller { before, after }) => {
            eprintln!("Nothing gained: summary would grow history ({before} -> {after} tokens).");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if !result.compacted() {
        if force {
            eprintln!("Nothing to compact: recent messages already fit the budget.");
        } else {
            eprintln!("Under budget; use --force to compact anyway.");
        }
        return Ok(());
    }

    store.persist(session);
    eprintln!(
        "Compacted {}: removed {} messages, {} remaining (~{} -> ~{} tokens).",
        session.key(),
        result.messages_removed(),
        session.len(),
        result.tokens_before,
        result.tokens_after
    );

    if archive {
        let path = persister
            .write_compaction_archive(session.key(), &archive_markdown(&result.discarded))
            .await?;
        eprintln!("Archive saved to: {}", path.display());
    }
    Ok(())
}
