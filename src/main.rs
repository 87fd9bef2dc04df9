use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dnscensus::config::{Config, LoggingConfig};
use dnscensus::run::{RunStatus, RunSummary};
use dnscensus::storage::SqliteRecorder;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "dnscensus",
    about = "DNS resolution census: probe target lists against resolvers and record what they answer",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (default: ./dnscensus.toml)
    #[arg(long, short, global = true, env = "DNSCENSUS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every target against every configured DNS server
    Collect,

    /// List stored runs
    Runs {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show one run's summary
    Show {
        /// Run identifier
        run_id: i64,

        /// Also print every stored result
        #[arg(long)]
        results: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration file and exit
    CheckConfig,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = Config::locate(explicit);
    Config::load(&path).with_context(|| format!("cannot use configuration {}", path.display()))
}

fn print_summary(s: &RunSummary) {
    let t = &s.tally;
    let o = &t.outcomes;
    println!("Run {} ({})", s.run_id, s.tag);
    println!("  Status:     {}", s.status);
    println!("  Started:    {}", s.started_at.to_rfc3339());
    match s.finished_at {
        Some(f) => println!("  Finished:   {}", f.to_rfc3339()),
        None => println!("  Finished:   -"),
    }
    println!("  Servers:    {}", s.config.dns_servers.join(", "));
    println!(
        "  Targets:    {} probed, {} excluded, {} skipped",
        t.targets_probed, t.targets_excluded, t.targets_skipped
    );
    println!(
        "  Results:    {} written, {} failed to store",
        t.results_written, t.results_failed
    );
    println!(
        "  Outcomes:   {} resolved, {} nxdomain, {} timeout, {} server-error, {} malformed",
        o.resolved, o.nxdomain, o.timeout, o.server_error, o.malformed_response
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Collect => {
            let config = load_config(cli.config.as_deref())?;
            init_tracing(&config.logging);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received; draining in-flight probes");
                    on_signal.cancel();
                }
            });

            let outcome = dnscensus::collect(&config, cancel).await?;

            let recorder = SqliteRecorder::open(&config.database.path)?;
            let summary = recorder.run_summary(outcome.run_id)?;
            println!();
            print_summary(&summary);
            if let Some(reason) = &outcome.failure {
                println!("  Failure:    {}", reason);
            }
            println!();

            if outcome.status == RunStatus::Failed {
                std::process::exit(2);
            }
        }
        Commands::Runs { json } => {
            let config = load_config(cli.config.as_deref())?;
            init_tracing(&config.logging);
            let recorder = SqliteRecorder::open(&config.database.path)?;
            let runs = recorder.list_runs()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No runs found.");
            } else {
                println!(
                    "{:<6} | {:<11} | {:<25} | {:>8} | {:>8}",
                    "Run", "Status", "Started", "Targets", "Results"
                );
                println!("{:-<6}-|-{:-<11}-|-{:-<25}-|-{:-<8}-|-{:-<8}", "", "", "", "", "");
                for r in runs {
                    println!(
                        "{:<6} | {:<11} | {:<25} | {:>8} | {:>8}",
                        r.run_id,
                        r.status,
                        r.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        r.tally.targets_probed,
                        r.tally.results_written
                    );
                }
            }
        }
        Commands::Show {
            run_id,
            results,
            json,
        } => {
            let config = load_config(cli.config.as_deref())?;
            init_tracing(&config.logging);
            let recorder = SqliteRecorder::open(&config.database.path)?;
            let summary = recorder
                .run_summary(run_id)
                .with_context(|| format!("cannot show run {run_id}"))?;
            let rows = if results {
                recorder.results(run_id)?
            } else {
                Vec::new()
            };

            if json {
                let doc = serde_json::json!({ "run": summary, "results": rows });
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                print_summary(&summary);
                for r in rows {
                    let addrs: Vec<String> = r
                        .addresses
                        .iter()
                        .map(|a| match (&a.country_code, a.asn) {
                            (Some(cc), Some(asn)) => format!("{} [{} AS{}]", a.address, cc, asn),
                            (Some(cc), None) => format!("{} [{}]", a.address, cc),
                            (None, Some(asn)) => format!("{} [AS{}]", a.address, asn),
                            (None, None) => a.address.clone(),
                        })
                        .collect();
                    println!(
                        "  {:<40} {:<22} {:<18} {}",
                        r.target,
                        r.server,
                        r.outcome,
                        addrs.join(", ")
                    );
                }
            }
        }
        Commands::CheckConfig => {
            let path = Config::locate(cli.config.as_deref());
            let config = load_config(Some(&path))?;
            config
                .validate()
                .with_context(|| format!("invalid configuration {}", path.display()))?;
            println!(
                "Configuration {} is valid ({} DNS server(s), concurrency {}).",
                path.display(),
                config.run.dns_servers.len(),
                config.run.concurrency
            );
        }
    }

    Ok(())
}
