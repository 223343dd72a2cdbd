use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use slotwatch_sync::{load_seen, status_report, WatchConfig, WatchPipeline};

#[derive(Debug, Parser)]
#[command(name = "slotwatch")]
#[command(about = "Watch a booking page and publish new slots as an RSS feed")]
struct Cli {
    /// Config file; defaults to $SLOTWATCH_CONFIG, then ./slotwatch.yaml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll once, publish any new slots and remember what was seen
    Run {
        /// Read a saved page instead of fetching the source
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the remembered slots and the current feed entries
    Status {
        #[arg(long)]
        json: bool,
    },
}

/// Initialize tracing from RUST_LOG (default `info`) and SLOTWATCH_LOG_FORMAT.
/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let builder = tracing_subscriber::registry().with(filter);

    match std::env::var("SLOTWATCH_LOG_FORMAT").as_deref() {
        Ok("json") => {
            let _ = builder.with(fmt_layer.json().flatten_event(true)).try_init();
        }
        _ => {
            let _ = builder.with(fmt_layer.compact()).try_init();
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<WatchConfig> {
    let path = WatchConfig::resolve_path(path);
    WatchConfig::from_env(Some(path.clone()))
        .with_context(|| format!("loading config {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        fixture: None,
        json: false,
    });

    match command {
        Commands::Run { fixture, json } => {
            let mut config = load_config(cli.config)?;
            if fixture.is_some() {
                config.fixture_path = fixture;
            }
            let summary = WatchPipeline::new(config)?.run_once().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "run complete: current={} new={} feed_written={} feed_entries={} fetch_failed={}",
                    summary.current_slots,
                    summary.new_slots.len(),
                    summary.feed_written,
                    summary.feed_entries,
                    summary.fetch_failed
                );
                for slot in &summary.new_slots {
                    println!("  + {slot}");
                }
            }
            if summary.fetch_failed {
                tracing::warn!("source could not be read; seen-state left untouched");
            }
        }
        Commands::Status { json } => {
            let config = load_config(cli.config)?;
            if json {
                let seen = load_seen(&config).await;
                let value = serde_json::json!({
                    "state_file": config.state_file,
                    "feed_file": config.feed_file,
                    "seen_policy": config.seen_policy,
                    "seen": seen,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("{}", status_report(&config).await?);
            }
        }
    }

    Ok(())
}
