//! Delegation Router CLI
//!
//! Inspect delegation status, route write-sets and wait for transaction
//! settlement against the base ledger or a delegated venue.

// Compiler warning configuration
#![deny(unused_imports)]
#![deny(unused_mut)]
#![deny(unused_variables)]
#![warn(dead_code)]
#![warn(unused_must_use)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use delegation_router::config::MonitoringConfig;
use delegation_router::metrics::metrics;
use delegation_router::{
    Commitment, ConfirmOptions, ConfirmationOutcome, DelegationRecord, DelegationRouter, RouterConfig,
    RouterError, VenueId,
};
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::path::Path;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "router.toml", env = "ROUTER_CONFIG")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print Prometheus metrics before exiting
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Delegation status of each account
    Status {
        #[arg(required = true)]
        addresses: Vec<String>,
    },
    /// Venue for a write-set
    Route {
        #[arg(required = true)]
        addresses: Vec<String>,
    },
    /// Wait for a transaction to reach a commitment level
    Confirm {
        signature: String,

        /// Venue identity; the base ledger when omitted
        #[arg(long)]
        venue: Option<String>,

        #[arg(long, default_value = "confirmed")]
        commitment: Commitment,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)?;
    init_logging(args.verbose, &config.monitoring)?;

    info!("Starting delegation router v{}", env!("CARGO_PKG_VERSION"));
    let router = DelegationRouter::from_config(&config).context("Failed to build router")?;

    let result = run(&router, args.command).await;

    if args.print_metrics {
        print!("{}", metrics().gather_text());
    }
    result
}

async fn run(router: &DelegationRouter, command: Command) -> Result<()> {
    match command {
        Command::Status { addresses } => {
            for address in parse_pubkeys(&addresses)? {
                match router.track(&address).await {
                    Ok(DelegationRecord::Delegated { venue }) => println!("{} delegated {}", address, venue),
                    Ok(DelegationRecord::Undelegated) => println!("{} undelegated", address),
                    Err(e) => println!("{} unknown ({})", address, e),
                }
            }
        }
        Command::Route { addresses } => {
            let write_set = parse_pubkeys(&addresses)?;
            match router.resolve_write_set(write_set).await {
                Ok(route) => println!("{}", route),
                Err(RouterError::Conflict { venues }) => {
                    let venues: Vec<String> = venues.iter().map(ToString::to_string).collect();
                    println!("conflict: {}", venues.join(", "));
                }
                Err(e) => return Err(e).context("Routing failed"),
            }
        }
        Command::Confirm {
            signature,
            venue,
            commitment,
        } => {
            let signature = Signature::from_str(&signature)
                .with_context(|| format!("Invalid signature {}", signature))?;
            let registry = router.resolver().registry();
            let route = match venue {
                Some(venue) => {
                    let venue = VenueId::from_str(&venue)
                        .with_context(|| format!("Invalid venue identity {}", venue))?;
                    registry.venue(&venue)?
                }
                None => registry.base(),
            };

            let cancel = CancellationToken::new();
            let ctrl_c = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted, cancelling confirmation");
                        cancel.cancel();
                    }
                })
            };

            let outcome = router
                .confirm(&route, &signature, commitment, ConfirmOptions::default().with_cancel(cancel))
                .await;
            ctrl_c.abort();

            match outcome? {
                ConfirmationOutcome::Confirmed(status) => match &status.err {
                    None => println!("{} {} at slot {}", signature, status.commitment, status.slot),
                    Some(err) => println!("{} failed at slot {}: {}", signature, status.slot, err),
                },
                ConfirmationOutcome::TimedOut { waited, .. } => {
                    println!("{} not {} after {:?}", signature, commitment, waited);
                }
            }
        }
    }
    Ok(())
}

fn parse_pubkeys(raw: &[String]) -> Result<Vec<Pubkey>> {
    raw.iter()
        .map(|s| Pubkey::from_str(s).with_context(|| format!("Invalid address {}", s)))
        .collect()
}

/// Initialize logging subsystem
fn init_logging(verbose: bool, monitoring: &MonitoringConfig) -> Result<()> {
    let default_filter = if verbose {
        "delegation_router=debug,info".to_string()
    } else {
        monitoring
            .log_filter
            .clone()
            .unwrap_or_else(|| "delegation_router=info,warn".to_string())
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if monitoring.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()?;
    }

    Ok(())
}

/// Load configuration from file, falling back to environment variables
fn load_config(path: &str) -> Result<RouterConfig> {
    if Path::new(path).exists() {
        RouterConfig::from_file_with_env(path)
            .with_context(|| format!("Failed to load config from {}", path))
    } else {
        dotenvy::dotenv().ok();
        RouterConfig::from_env()
            .with_context(|| format!("Config file '{}' not found and environment is incomplete", path))
    }
}
