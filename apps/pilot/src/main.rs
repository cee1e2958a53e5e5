use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use pilot_core::cli::{Cli, Command};
use pilot_core::collaborators::{LocalSettings, LoggingEntityManager, LoggingTransferListener};
use pilot_core::config::PilotConfig;
use pilot_core::credentials::CredentialStore;
use pilot_core::runtime::Pilot;
use pilot_core::session::{MutualTlsDialer, SessionState};
use pilot_core::telemetry::logging;
use pilot_core::transfer::{HttpObjectStore, TransferOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;
    let config = PilotConfig::try_from(&cli).context("invalid configuration")?;

    let credentials =
        CredentialStore::open(&config.credentials).context("failed to load client credentials")?;
    let dialer = MutualTlsDialer::new(credentials, config.connect_timeout);
    let store = HttpObjectStore::new(config.http_timeout).context("failed to build http client")?;

    let mut pilot = Pilot::new(
        &config,
        Arc::new(dialer),
        Arc::new(store),
        Arc::new(LoggingTransferListener),
        Box::new(LoggingEntityManager::new()),
        Box::new(LocalSettings::new(
            &config.username,
            config.sensitivity,
            config.discrete,
        )),
    );

    let command = cli.subcommand();
    info!(
        endpoint = %config.endpoint,
        user = %config.username,
        ?command,
        "pilot starting"
    );

    let result = match command {
        Command::Run => run(&mut pilot, &config).await,
        other => one_shot(&mut pilot, &config, other).await,
    };
    pilot.disconnect();
    result
}

/// Runs the owner loop until Ctrl-C.
async fn run(pilot: &mut Pilot, config: &PilotConfig) -> Result<()> {
    pilot.connect();
    let mut ticker = interval(config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last = Instant::now();
    let mut reported = pilot.session_state();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let dt = now.duration_since(last).as_secs_f32();
                last = now;
                for outcome in pilot.tick(dt) {
                    log_outcome(&outcome);
                }
                let state = pilot.session_state();
                if state != reported {
                    info!(?state, "session state changed");
                    reported = state;
                }
                if reported.is_terminal() {
                    warn!("control session ended");
                    return Ok(());
                }
            }
            _ = signal::ctrl_c() => {
                info!("interrupt received; shutting down");
                return Ok(());
            }
        }
    }
}

/// Connects, issues a single transfer request and ticks until it settles.
async fn one_shot(pilot: &mut Pilot, config: &PilotConfig, command: Command) -> Result<()> {
    pilot.connect();
    let mut ticker = interval(config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last = Instant::now();

    let mut dt = || {
        let now = Instant::now();
        let dt = now.duration_since(last).as_secs_f32();
        last = now;
        dt
    };

    loop {
        ticker.tick().await;
        pilot.tick(dt());
        match pilot.session_state() {
            SessionState::Connected => break,
            SessionState::Failed(reason) => bail!("connection failed: {reason:?}"),
            SessionState::Closed => bail!("connection closed before it was ready"),
            _ => {}
        }
    }

    match command {
        Command::Upload { path } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let key = pilot.save_and_upload(&bytes).await?;
            info!(key = %key, "upload requested");
        }
        Command::Delete { timestamp } => {
            let key = pilot.delete_capture(timestamp)?;
            info!(key = %key, "delete requested");
        }
        Command::Sync => {
            let listed = pilot.sync()?;
            info!(listed, "sync requested");
        }
        Command::Run => return Err(anyhow!("run is not a one-shot command")),
    }

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let outcomes = pilot.tick(dt());
                for outcome in &outcomes {
                    log_outcome(outcome);
                }
                if let Some(outcome) = outcomes.into_iter().next() {
                    return outcome_result(outcome);
                }
            }
            _ = signal::ctrl_c() => bail!("interrupted before the transfer finished"),
        }
    }
}

fn outcome_result(outcome: TransferOutcome) -> Result<()> {
    match outcome {
        TransferOutcome::Finished { result, .. } => result.map_err(Into::into),
        TransferOutcome::SyncFinished(summary) if summary.is_clean() => Ok(()),
        TransferOutcome::SyncFinished(summary) => Err(anyhow!(
            "sync incomplete: {} failed, abandoned: {}",
            summary.failed,
            summary.abandoned
        )),
    }
}

fn log_outcome(outcome: &TransferOutcome) {
    match outcome {
        TransferOutcome::Finished {
            kind,
            key,
            result: Ok(()),
            ..
        } => info!(%kind, key = ?key.as_ref().map(ToString::to_string), "transfer finished"),
        TransferOutcome::Finished {
            kind,
            key,
            result: Err(err),
            ..
        } => error!(
            %kind,
            key = ?key.as_ref().map(ToString::to_string),
            error = %err,
            "transfer failed"
        ),
        TransferOutcome::SyncFinished(summary) => info!(
            downloaded = summary.downloaded,
            uploaded = summary.uploaded,
            failed = summary.failed,
            abandoned = summary.abandoned,
            "sync finished"
        ),
    }
}
