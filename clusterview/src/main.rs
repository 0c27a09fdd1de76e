mod cli;
mod server;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use clusterview_cluster::discovery::registry_from_config;
use clusterview_cluster::{AggregatorConfig, HealthAggregator, HttpConnector, VerificationSession};
use clusterview_core::{logging, Config, Endpoint, LastObservation, PollOutcome};

use cli::{Cli, Command};
use server::AppState;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // 1. Load configuration, then fold in command-line overrides
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;

    let peers = config
        .peers
        .resolve(config.management.credentials().as_ref())?;
    let aggregator = build_aggregator(&config)?;

    match cli.command {
        Command::Verify(_) => verify(&config, aggregator, &peers).await,
        Command::Connections(_) => {
            require_peers(&peers)?;
            let report = aggregator.test_connections(&peers).await;
            print!("{}", report.render_text());
            Ok(if report.all_succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Serve(_) => {
            if peers.is_empty() {
                warn!("No peers configured; the cluster view will be empty");
            }
            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                server::shutdown_signal().await;
                signal_token.cancel();
            });

            let state = AppState {
                aggregator,
                peers: Arc::new(peers),
            };
            server::serve(&config.http_address(), state, shutdown).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_aggregator(config: &Config) -> Result<HealthAggregator> {
    let connector = HttpConnector::from_config(config)?;
    let registry = registry_from_config(config)?;
    info!(backend = %config.registry.backend, "Peer registry initialized");

    Ok(HealthAggregator::new(
        Arc::new(connector),
        registry,
        AggregatorConfig::from_config(config),
    ))
}

fn require_peers(peers: &[Endpoint]) -> Result<()> {
    if peers.is_empty() {
        return Err(anyhow::anyhow!(
            "No peers configured; use --peer, or --domain-uid with --server"
        ));
    }
    Ok(())
}

async fn verify(config: &Config, aggregator: HealthAggregator, peers: &[Endpoint]) -> Result<ExitCode> {
    require_peers(peers)?;

    let session = VerificationSession::new(aggregator);
    let cancel = session.cancellation_token();
    tokio::spawn(async move {
        server::shutdown_signal().await;
        cancel.cancel();
    });

    let policy = config.poll.policy();
    info!(
        session = %session.id(),
        peers = peers.len(),
        timeout_seconds = policy.timeout.as_secs(),
        "Verifying cluster health"
    );

    let outcome = session
        .verify_cluster_healthy(peers, &config.peers.expected_members, &policy)
        .await;
    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to clean up verification session");
    }

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(report) = e.last_report() {
                print!("{}", report.render_text());
            }
            return Err(e.into());
        }
    };

    match outcome {
        PollOutcome::Succeeded(report) => {
            print!("{}", report.render_text());
            Ok(ExitCode::SUCCESS)
        }
        PollOutcome::TimedOut(last) => {
            error!("Cluster did not become healthy within {}s", policy.timeout.as_secs());
            match last {
                Some(LastObservation::Value(report)) => print!("{}", report.render_text()),
                Some(LastObservation::Error(e)) => eprintln!("Last error: {e}"),
                None => eprintln!("No poll completed within the time budget"),
            }
            Ok(ExitCode::FAILURE)
        }
        PollOutcome::Cancelled => {
            warn!("Verification cancelled");
            Ok(ExitCode::FAILURE)
        }
    }
}
