mod alert;
mod bme280;
mod config;
mod gpio;
mod light;
mod mcp9808;
mod mqtt;
mod orchestrator;
mod pump;
mod ranging;
mod sensors;
#[cfg(feature = "sim")]
mod sim;
mod state;
mod telemetry;
mod watchdog;
mod web;
mod window;

use anyhow::{Context, Result};
use std::sync::Arc;
use time::UtcOffset;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Settings;
use mqtt::MqttPublisher;
use orchestrator::Orchestrator;
use state::SystemState;
use watchdog::WifiConnect;
use window::Clock;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // The local offset can only be read safely while the process is still
    // single-threaded, so capture it before the runtime starts.
    let offset = UtcOffset::current_local_offset().unwrap_or_else(|e| {
        warn!("local UTC offset unavailable ({e}), light schedule runs on UTC");
        UtcOffset::UTC
    });

    let settings = Settings::from_env();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(run(settings, Clock::Wall(offset)))
}

async fn run(settings: Settings, clock: Clock) -> Result<()> {
    info!(device_id = %settings.device_id, config = %settings.config_path.display(), "hydro rig starting");

    // ── Shared state (ephemeral, for the status api) ────────────────
    let status = SystemState::shared(&settings.device_id);
    status.write().await.record_system("rig starting".to_string());

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    // ── Status api ──────────────────────────────────────────────────
    let web = tokio::spawn(web::serve(settings.web_port, status.clone(), shutdown.clone()));

    // ── Rig ─────────────────────────────────────────────────────────
    let publisher = Arc::new(MqttPublisher::new(&settings.mqtt, &settings.device_id, status.clone()));
    let recovery = Arc::new(WifiConnect::new(&settings.recovery_program, &settings.recovery_ssid));

    let mut rig = match Orchestrator::start(&settings, clock, publisher, recovery, status, &shutdown).await {
        Ok(rig) => rig,
        Err(e) if shutdown.is_cancelled() => {
            info!("shut down during startup: {e:#}");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let outcome = tokio::select! {
        _ = shutdown.cancelled() => {
            info!("shutdown requested");
            Ok(())
        }
        err = rig.fault() => {
            error!("{err:#}");
            Err(err)
        }
    };

    if let Err(e) = rig.stop().await {
        warn!("{e:#}");
    }
    shutdown.cancel();
    match web.await {
        Ok(Err(e)) => warn!("{e:#}"),
        Err(e) => warn!("status api task failed: {e}"),
        Ok(Ok(())) => {}
    }
    outcome
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    shutdown.cancel();
}
