//! CLI commands for TinyExchange using clap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::{get_settings_path, load_settings_or_default, save_settings, Settings};
use crate::logging::{self, LOG_FILE_PREFIX};
use crate::pickup::{PickupEngine, QueueRepository, SessionRegistry, SqliteQueueRepository, TakeFromQueue};

/// TinyExchange - credential/proof exchange and message pickup for agents.
#[derive(Parser)]
#[command(name = "tinyexchange")]
#[command(version = "0.1.0")]
#[command(about = "Inspect and operate a TinyExchange mediator queue", long_about = None)]
pub struct Commands {
    /// Queue database (defaults to the configured path)
    #[arg(long, global = true, env = "TINYEXCHANGE_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Queue operations
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },

    /// Settings
    #[command(subcommand)]
    Config(ConfigCommand),

    /// View logs
    Logs {
        /// Only lines containing this text
        #[arg(long)]
        filter: Option<String>,

        /// Number of trailing lines
        #[arg(long, default_value_t = 120)]
        lines: usize,
    },
}

#[derive(Subcommand)]
pub enum QueueCommand {
    /// Count messages waiting for a connection
    Count {
        connection_id: String,

        #[arg(long)]
        recipient_key: Option<String>,
    },

    /// Queue a message for a connection
    Add {
        connection_id: String,

        /// Payload text (ignored with --file)
        payload: Option<String>,

        /// Read the payload from a file
        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(long)]
        recipient_key: Option<String>,
    },

    /// Show (and optionally remove) the oldest messages
    Take {
        connection_id: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,

        #[arg(long)]
        recipient_key: Option<String>,

        /// Remove the messages as they are read
        #[arg(long)]
        remove: bool,
    },

    /// Acknowledge (remove) messages by id
    Ack {
        connection_id: String,

        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective settings
    Show,

    /// Write default settings
    Init {
        /// Overwrite an existing settings file
        #[arg(long)]
        force: bool,
    },
}

impl Commands {
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Queue { action } => cmd_queue(action, self.db.as_deref()).await,
            Command::Config(cmd) => cmd_config(cmd).await,
            Command::Logs { filter, lines } => cmd_logs(filter.as_deref(), *lines).await,
        }
    }
}

// Command implementations

fn open_queue(settings: &Settings, db: Option<&Path>) -> Result<SqliteQueueRepository> {
    let path = match db {
        Some(path) => path.to_path_buf(),
        None => settings.storage.queue_db_path()?,
    };
    Ok(SqliteQueueRepository::open(path)?)
}

async fn cmd_queue(action: &QueueCommand, db: Option<&Path>) -> Result<()> {
    let settings = load_settings_or_default();
    let queue = Arc::new(open_queue(&settings, db)?);

    match action {
        QueueCommand::Count {
            connection_id,
            recipient_key,
        } => {
            let count = queue
                .get_available_message_count(connection_id, recipient_key.as_deref())
                .await?;
            println!("{} message(s) queued for {}", count, connection_id);
        }
        QueueCommand::Add {
            connection_id,
            payload,
            file,
            recipient_key,
        } => {
            let bytes = match (file, payload) {
                (Some(file), _) => std::fs::read(file)?,
                (None, Some(payload)) => payload.as_bytes().to_vec(),
                (None, None) => anyhow::bail!("Give a payload or --file"),
            };
            let engine = PickupEngine::new(queue.clone(), Arc::new(SessionRegistry::new()), settings.pickup.clone());
            let id = engine
                .queue_message(connection_id, recipient_key.as_deref(), bytes)
                .await?;
            println!("Queued message: {}", id);
        }
        QueueCommand::Take {
            connection_id,
            limit,
            recipient_key,
            remove,
        } => {
            let messages = queue
                .take_from_queue(
                    TakeFromQueue::new(connection_id.as_str())
                        .recipient_key(recipient_key.clone())
                        .limit(*limit)
                        .keep_messages(!remove),
                )
                .await?;
            println!("Messages for {} ({}):", connection_id, messages.len());
            for msg in messages {
                let received = chrono::DateTime::from_timestamp_millis(msg.received_at)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| msg.received_at.to_string());
                println!(
                    "  {}  {}  {} bytes{}",
                    msg.id,
                    received,
                    msg.encrypted_payload.len(),
                    msg.recipient_key
                        .as_deref()
                        .map(|k| format!("  key={}", k))
                        .unwrap_or_default()
                );
            }
        }
        QueueCommand::Ack { connection_id, ids } => {
            let removed = queue.remove_messages(connection_id, ids).await?;
            let left = queue.get_available_message_count(connection_id, None).await?;
            println!("Removed {} message(s), {} left", removed, left);
        }
    }

    Ok(())
}

async fn cmd_config(cmd: &ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            let settings = load_settings_or_default();
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        ConfigCommand::Init { force } => {
            let path = get_settings_path()?;
            if path.exists() && !force {
                println!("Settings already exist at {} (use --force to overwrite)", path.display());
                return Ok(());
            }
            let path = save_settings(&Settings::default())?;
            println!("Wrote default settings to {}", path.display());
        }
    }
    Ok(())
}

/// Newest daily log file in `log_dir`.
fn latest_log_file(log_dir: &Path) -> Result<Option<PathBuf>> {
    if !log_dir.exists() {
        return Ok(None);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(LOG_FILE_PREFIX))
        })
        .collect();
    files.sort();
    Ok(files.pop())
}

async fn cmd_logs(filter: Option<&str>, lines: usize) -> Result<()> {
    let log_dir = logging::log_dir()?;
    let Some(file) = latest_log_file(&log_dir)? else {
        println!("No log files in {}", log_dir.display());
        return Ok(());
    };
    let content = std::fs::read_to_string(&file)?;
    let mut shown: Vec<&str> = content.lines().collect();
    if let Some(needle) = filter {
        let needle = needle.to_lowercase();
        shown.retain(|l| l.to_lowercase().contains(&needle));
    }
    let start = shown.len().saturating_sub(lines);
    for line in &shown[start..] {
        println!("{}", line);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_queue_commands() {
        let args = Commands::try_parse_from(["tinyexchange", "queue", "take", "conn-1", "--limit", "3", "--remove"]).unwrap();
        match args.command {
            Command::Queue {
                action: QueueCommand::Take { connection_id, limit, remove, .. },
            } => {
                assert_eq!(connection_id, "conn-1");
                assert_eq!(limit, 3);
                assert!(remove);
            }
            _ => panic!("parsed the wrong command"),
        }

        assert!(Commands::try_parse_from(["tinyexchange", "queue", "ack", "conn-1"]).is_err());
    }

    #[tokio::test]
    async fn test_queue_commands_against_temp_db() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("queue.db");

        let add = QueueCommand::Add {
            connection_id: "conn-1".to_string(),
            payload: Some("hello".to_string()),
            file: None,
            recipient_key: None,
        };
        cmd_queue(&add, Some(db.as_path())).await.unwrap();
        cmd_queue(&add, Some(db.as_path())).await.unwrap();

        let queue = SqliteQueueRepository::open(&db).unwrap();
        let taken = queue.take_from_queue(TakeFromQueue::new("conn-1")).await.unwrap();
        assert_eq!(taken.len(), 2);

        let ack = QueueCommand::Ack {
            connection_id: "conn-1".to_string(),
            ids: vec![taken[0].id.clone()],
        };
        cmd_queue(&ack, Some(db.as_path())).await.unwrap();
        assert_eq!(queue.get_available_message_count("conn-1", None).await.unwrap(), 1);
    }

    #[test]
    fn test_latest_log_file_picks_newest() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("tinyexchange.log.2026-10-01"), "old").unwrap();
        std::fs::write(dir.path().join("tinyexchange.log.2026-10-02"), "new").unwrap();
        std::fs::write(dir.path().join("other.txt"), "x").unwrap();

        let latest = latest_log_file(dir.path()).unwrap().unwrap();
        assert!(latest.ends_with("tinyexchange.log.2026-10-02"));
        assert!(latest_log_file(&dir.path().join("missing")).unwrap().is_none());
    }
}
