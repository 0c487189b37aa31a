//! outbox_tool - inspect and maintain the decision outbox offline
//!
//! Run against the agent database while the daemon is stopped, or alongside
//! it (SQLite WAL allows concurrent readers).

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use edge_agent::queue::QueueSettings;
use edge_agent::{DecisionQueue, DeliveryRoute, Health, SystemClock};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the agent database.
    #[arg(long, env = "EDGE_AGENT_DB_PATH", default_value = "edge_agent.db")]
    db_path: String,
    /// Print JSON instead of text.
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue depth, archive and quarantine counts.
    Stats,
    /// Undelivered entries, oldest first.
    Pending {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Entries archived after rejection or retention expiry.
    Archived {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Drop acknowledged entries and archive those past retention.
    Purge {
        /// Retention for undelivered entries, in seconds.
        #[arg(long, default_value_t = 60 * 60 * 24 * 7)]
        retention_secs: u64,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut settings = QueueSettings::default();
    if let Command::Purge { retention_secs } = args.command {
        settings.retention_ms = retention_secs.saturating_mul(1_000);
    }
    let queue = DecisionQueue::open(
        &args.db_path,
        settings,
        Arc::new(SystemClock),
        Arc::new(Health::new()),
    )?;

    match args.command {
        Command::Stats => {
            let stats = queue.stats()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("pending:       {}", stats.pending);
                println!("due now:       {}", stats.due);
                println!("delivered:     {}", stats.delivered);
                println!("fallback sent: {}", stats.fallback_sent);
                println!("archived:      {}", stats.archived);
                println!("quarantined:   {}", stats.quarantined);
                match stats.oldest_pending_age_ms {
                    Some(age) => println!("oldest:        {}s", age / 1_000),
                    None => println!("oldest:        -"),
                }
            }
        }
        Command::Pending { limit } => {
            let entries = queue.pending(limit)?;
            if args.json {
                let records: Vec<_> = entries.iter().map(|e| &e.record).collect();
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for entry in &entries {
                    let route = match entry.route {
                        DeliveryRoute::Primary => "primary".to_string(),
                        DeliveryRoute::FallbackSent { count, .. } => format!("fallback x{}", count),
                    };
                    println!(
                        "{} {} attempts={} next={} route={} last_error={}",
                        entry.event_id(),
                        entry.record.decision,
                        entry.attempt_count,
                        entry.next_attempt_at,
                        route,
                        entry.last_error.as_deref().unwrap_or("-")
                    );
                }
                println!("{} pending shown", entries.len());
            }
        }
        Command::Archived { limit } => {
            let archived = queue.list_archived(limit)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&archived)?);
            } else {
                for entry in &archived {
                    println!(
                        "{} archived_at={} attempts={} reason={}",
                        entry.event_id, entry.archived_at, entry.attempt_count, entry.reason
                    );
                }
                println!("{} archived shown", archived.len());
            }
        }
        Command::Purge { .. } => {
            let report = queue.purge()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "removed {} delivered, archived {} expired",
                    report.delivered_removed, report.expired_archived
                );
            }
        }
    }
    Ok(())
}
