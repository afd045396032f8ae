//! Chime: cron-scheduled webhook messages
//!
//! Main binary with subcommands:
//! - `daemon`: Scheduler loop, delivery workers and result handler
//! - `add`, `edit`, `enable`, `disable`, `delete`: Manage tasks
//! - `list`, `show`: Inspect tasks and their recent deliveries
//! - `send`, `run`: One-off deliveries

use std::path::PathBuf;
use std::time::Duration;

use chime_scheduler::{DeliveryConfig, RetryPolicy, TaskDefinition, TaskId, config};
use chime_store::SqliteTaskStore;
use chrono::{FixedOffset, Offset, Utc};
use clap::{Args, Parser, Subcommand};
use miette::{Result, miette};
use mockable::{Clock, DefaultClock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod admin;
mod daemon;

/// Parse a UTC offset such as `+08:00`, `-0530`, `+8` or `UTC`.
fn parse_offset(s: &str) -> Result<FixedOffset, String> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("utc") || s == "Z" {
        return Ok(Utc.fix());
    }

    let invalid = || format!("invalid UTC offset '{}', expected e.g. +08:00 or -05:30", s);
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => return Err(invalid()),
    };

    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if !(0..60).contains(&minutes) {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chime")
        .join("tasks.db")
}

#[derive(Parser)]
#[command(name = "chime")]
#[command(about = "Cron-scheduled webhook messages", long_about = None)]
struct Cli {
    /// Task database path
    #[arg(long, global = true, env = "CHIME_DB")]
    db: Option<PathBuf>,

    /// Offset cron expressions are evaluated in
    #[arg(long, global = true, env = "CHIME_UTC_OFFSET", value_parser = parse_offset, default_value = "+00:00")]
    utc_offset: FixedOffset,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DaemonArgs {
    /// Upper bound in seconds on the scheduler's sleep between ticks
    #[arg(long, env = "CHIME_POLL_INTERVAL", default_value_t = config::DEFAULT_POLL_INTERVAL_SECS)]
    poll_interval: u64,

    /// Deadline in seconds for each store call
    #[arg(long, env = "CHIME_STORE_TIMEOUT", default_value_t = config::DEFAULT_STORE_TIMEOUT_SECS)]
    store_timeout: u64,

    /// Deadline in seconds for each webhook call
    #[arg(long, env = "CHIME_DELIVERY_TIMEOUT", default_value_t = config::DEFAULT_DELIVERY_TIMEOUT_SECS)]
    delivery_timeout: u64,

    /// Maximum deliveries in flight
    #[arg(long, env = "CHIME_CONCURRENCY", default_value_t = config::DEFAULT_DELIVERY_CONCURRENCY)]
    concurrency: usize,

    /// Retries per occurrence after the scheduled attempt fails
    #[arg(long, env = "CHIME_MAX_RETRIES", default_value_t = config::DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Delay in seconds before the first retry
    #[arg(long, env = "CHIME_RETRY_BASE_DELAY", default_value_t = config::DEFAULT_RETRY_BASE_SECS)]
    retry_base_delay: u64,

    /// Cap in seconds on the retry delay
    #[arg(long, env = "CHIME_RETRY_MAX_DELAY", default_value_t = config::DEFAULT_RETRY_MAX_SECS)]
    retry_max_delay: u64,

    /// Consecutive failed occurrences before a task is disabled (0 = never)
    #[arg(long, env = "CHIME_FAILURE_THRESHOLD", default_value_t = config::DEFAULT_FAILURE_THRESHOLD)]
    failure_threshold: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon
    Daemon(DaemonArgs),

    /// Add a scheduled task
    Add {
        /// Task name
        #[arg(long)]
        name: String,

        /// Webhook URL
        #[arg(long)]
        endpoint: String,

        /// Message body
        #[arg(long)]
        content: String,

        /// Cron expression or phrase such as "每天9点"
        #[arg(long)]
        schedule: String,

        /// Message type
        #[arg(long, default_value = "text")]
        message_type: String,

        /// External identifier; generated when omitted
        #[arg(long)]
        uuid: Option<String>,

        /// Create the task disabled
        #[arg(long)]
        disabled: bool,
    },

    /// List all tasks
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one task with its recent deliveries
    Show {
        id: TaskId,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Change fields of a task
    Edit {
        id: TaskId,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        endpoint: Option<String>,

        #[arg(long)]
        content: Option<String>,

        #[arg(long)]
        schedule: Option<String>,

        #[arg(long)]
        message_type: Option<String>,
    },

    /// Enable a task
    Enable { id: TaskId },

    /// Disable a task
    Disable { id: TaskId },

    /// Delete a task
    Delete { id: TaskId },

    /// Send a one-off message to a webhook
    Send {
        #[arg(long)]
        endpoint: String,

        #[arg(long)]
        content: String,

        #[arg(long, default_value = "text")]
        message_type: String,

        /// Deadline in seconds
        #[arg(long, default_value_t = config::DEFAULT_DELIVERY_TIMEOUT_SECS)]
        timeout: u64,
    },

    /// Deliver a task now without changing its schedule
    Run {
        id: TaskId,

        /// Deadline in seconds
        #[arg(long, default_value_t = config::DEFAULT_DELIVERY_TIMEOUT_SECS)]
        timeout: u64,
    },
}

/// Resolve the database path, creating its parent directory.
fn prepare_db_path(db: Option<PathBuf>) -> Result<PathBuf> {
    let path = db.unwrap_or_else(default_db_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| miette!("failed to create data directory: {}", e))?;
    }
    Ok(path)
}

fn open_store(db: Option<PathBuf>) -> Result<SqliteTaskStore> {
    let path = prepare_db_path(db)?;
    SqliteTaskStore::open(&path).map_err(|e| miette!("failed to open task database: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chime=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let offset = cli.utc_offset;
    let clock = DefaultClock;

    match cli.command {
        Commands::Daemon(args) => {
            daemon::run(daemon::DaemonConfig {
                db_path: prepare_db_path(cli.db)?,
                utc_offset: offset,
                poll_interval: Duration::from_secs(args.poll_interval),
                store_timeout: Duration::from_secs(args.store_timeout),
                delivery: DeliveryConfig {
                    timeout: Duration::from_secs(args.delivery_timeout),
                    concurrency: args.concurrency,
                },
                retry: RetryPolicy {
                    max_retries: args.max_retries,
                    base_delay: Duration::from_secs(args.retry_base_delay),
                    max_delay: Duration::from_secs(args.retry_max_delay),
                    failure_threshold: args.failure_threshold,
                },
            })
            .await
        }
        Commands::Add {
            name,
            endpoint,
            content,
            schedule,
            message_type,
            uuid,
            disabled,
        } => {
            let store = open_store(cli.db)?;
            let task = admin::add(
                &store,
                &clock,
                offset,
                TaskDefinition {
                    uuid,
                    name,
                    endpoint,
                    message_type,
                    message_content: content,
                    schedule,
                    enabled: !disabled,
                },
            )
            .await?;
            println!("{}", admin::format_task_line(&task, offset));
            Ok(())
        }
        Commands::List { json } => {
            let store = open_store(cli.db)?;
            let tasks = store
                .list_all()
                .map_err(|e| miette!("failed to list tasks: {}", e))?;
            if json {
                println!("{}", to_json(&tasks)?);
            } else if tasks.is_empty() {
                println!("no tasks");
            } else {
                for task in &tasks {
                    println!("{}", admin::format_task_line(task, offset));
                }
            }
            Ok(())
        }
        Commands::Show { id, json } => {
            let store = open_store(cli.db)?;
            let task = admin::find(&store, id)?;
            let outcomes = store
                .recent_outcomes(id, admin::RECENT_OUTCOMES)
                .map_err(|e| miette!("failed to read outcomes: {}", e))?;
            if json {
                println!(
                    "{}",
                    to_json(&serde_json::json!({ "task": task, "outcomes": outcomes }))?
                );
            } else {
                print!("{}", admin::format_task_detail(&task, &outcomes, offset));
            }
            Ok(())
        }
        Commands::Edit {
            id,
            name,
            endpoint,
            content,
            schedule,
            message_type,
        } => {
            let store = open_store(cli.db)?;
            let request = admin::EditRequest {
                name,
                endpoint,
                message_type,
                message_content: content,
                schedule,
            };
            let task = admin::edit(&store, id, request, clock.utc(), offset)?;
            println!("{}", admin::format_task_line(&task, offset));
            Ok(())
        }
        Commands::Enable { id } => {
            let store = open_store(cli.db)?;
            admin::set_enabled(&store, id, true, clock.utc())
        }
        Commands::Disable { id } => {
            let store = open_store(cli.db)?;
            admin::set_enabled(&store, id, false, clock.utc())
        }
        Commands::Delete { id } => {
            let store = open_store(cli.db)?;
            admin::delete(&store, id)
        }
        Commands::Send {
            endpoint,
            content,
            message_type,
            timeout,
        } => {
            admin::send(
                &endpoint,
                &message_type,
                &content,
                Duration::from_secs(timeout),
            )
            .await?;
            println!("delivered");
            Ok(())
        }
        Commands::Run { id, timeout } => {
            let store = open_store(cli.db)?;
            let outcome =
                admin::run_now(&store, id, &clock, Duration::from_secs(timeout)).await?;
            match outcome.reason {
                Some(reason) => Err(miette!("delivery failed: {}", reason)),
                None => {
                    println!("delivered");
                    Ok(())
                }
            }
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| miette!("failed to encode JSON: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("UTC").unwrap(), Utc.fix());
        assert_eq!(parse_offset("+00:00").unwrap(), Utc.fix());
        assert_eq!(
            parse_offset("+08:00").unwrap(),
            FixedOffset::east_opt(8 * 3600).unwrap()
        );
        assert_eq!(
            parse_offset("-0530").unwrap(),
            FixedOffset::west_opt(5 * 3600 + 30 * 60).unwrap()
        );
        assert_eq!(
            parse_offset("+8").unwrap(),
            FixedOffset::east_opt(8 * 3600).unwrap()
        );
    }

    #[test]
    fn test_parse_offset_rejects_garbage() {
        assert!(parse_offset("08:00").is_err());
        assert!(parse_offset("+8:75").is_err());
        assert!(parse_offset("+30:00").is_err());
        assert!(parse_offset("+ab").is_err());
    }

    #[test]
    fn test_cli_daemon_defaults() {
        let cli = Cli::try_parse_from(["chime", "daemon"]).unwrap();
        assert_eq!(cli.utc_offset, Utc.fix());
        match cli.command {
            Commands::Daemon(args) => {
                assert_eq!(args.poll_interval, config::DEFAULT_POLL_INTERVAL_SECS);
                assert_eq!(args.concurrency, config::DEFAULT_DELIVERY_CONCURRENCY);
                assert_eq!(args.failure_threshold, config::DEFAULT_FAILURE_THRESHOLD);
            }
            _ => panic!("expected daemon command"),
        }
    }

    #[test]
    fn test_cli_add_with_global_flags() {
        let cli = Cli::try_parse_from([
            "chime",
            "add",
            "--name",
            "Standup",
            "--endpoint",
            "https://example.com/hook",
            "--content",
            "stand up!",
            "--schedule",
            "每天9点",
            "--utc-offset",
            "+08:00",
            "--db",
            "/tmp/chime.db",
        ])
        .unwrap();

        assert_eq!(cli.utc_offset, FixedOffset::east_opt(8 * 3600).unwrap());
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/chime.db")));
        match cli.command {
            Commands::Add {
                schedule,
                message_type,
                disabled,
                ..
            } => {
                assert_eq!(schedule, "每天9点");
                assert_eq!(message_type, "text");
                assert!(!disabled);
            }
            _ => panic!("expected add command"),
        }
    }

    #[test]
    fn test_cli_requires_id() {
        assert!(Cli::try_parse_from(["chime", "show"]).is_err());
        assert!(Cli::try_parse_from(["chime", "run", "abc"]).is_err());
    }
}
