//! Bootstrap and mode dispatch, grounded on `server_yahoo::main`'s
//! config/logging/lock bring-up and ctrl-c-or-SIGTERM `select!` shutdown.

use anyhow::Result;
use riverwatch_core::adapters::legacy::LegacyAdapter;
use riverwatch_core::adapters::modern::ModernAdapter;
use riverwatch_core::blended::BlendedBackend;
use riverwatch_core::community::CommunityClient;
use riverwatch_core::config::{Config, RunMode};
use riverwatch_core::http::HttpClient;
use riverwatch_core::model::BackendKind;
use riverwatch_core::overlay::OverlayFetcher;
use riverwatch_core::poll_loop::{ManualOverrides, PollLoop, PollLoopConfig};
use riverwatch_core::state::StateStore;
use riverwatch_core::{logging, CoreError, SystemClock};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use url::Url;

const DEFAULT_LEGACY_BASE: &str = "https://waterservices.example.org/nwis/iv/";
const DEFAULT_MODERN_BASE: &str = "https://api.example.org/ogc/features/";

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::load();

    if let Err(e) = logging::setup_logging(&config.log_dir, &config.log_level) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("fatal error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<ExitCode> {
    let state_path = config.resolved_state_file();
    let gauges = config.load_gauges()?;

    let lock = match StateStore::acquire_lock(&state_path) {
        Ok(lock) => lock,
        Err(CoreError::LockContended { path }) => {
            log::error!("another writer already holds the state file lock at {path:?}");
            return Ok(ExitCode::from(2));
        }
        Err(e) => return Err(e.into()),
    };

    let http = Arc::new(HttpClient::new(Duration::from_secs(10)));
    let legacy_base = Url::parse(
        &std::env::var("RIVERWATCH_LEGACY_BASE").unwrap_or_else(|_| DEFAULT_LEGACY_BASE.to_string()),
    )?;
    let modern_base = Url::parse(
        &std::env::var("RIVERWATCH_MODERN_BASE").unwrap_or_else(|_| DEFAULT_MODERN_BASE.to_string()),
    )?;

    let legacy = Arc::new(LegacyAdapter::new(http.clone(), legacy_base));
    let modern = Arc::new(ModernAdapter::new(http.clone(), modern_base));
    let backend = BlendedBackend::new(legacy, modern);

    let api_backend: BackendKind = config.usgs_backend.into();
    let overrides = ManualOverrides::default();
    let poll_config = PollLoopConfig {
        state_path: state_path.clone(),
        min_retry_seconds: config.min_retry_seconds,
        max_retry_seconds: config.max_retry_seconds,
        backfill_hours: config.backfill_hours,
        api_backend,
        community_publish: config.community_publish,
    };

    let mut poll_loop = PollLoop::new(gauges, backend, Arc::new(SystemClock), poll_config, overrides.clone());

    if let Some(forecast_base) = &config.forecast_base {
        poll_loop = poll_loop.with_overlay(OverlayFetcher::new(
            http.clone(),
            forecast_base.clone(),
            config.forecast_hours,
        ));
    }

    if let Some(community_base) = &config.community_base {
        let url = Url::parse(community_base)?;
        poll_loop = poll_loop.with_community(Arc::new(CommunityClient::new(http.clone(), url)));
    }

    let poll_loop = Arc::new(poll_loop);

    let exit_code = match config.mode {
        RunMode::Once => run_once(poll_loop.clone()).await?,
        RunMode::Adaptive => run_adaptive(poll_loop.clone()).await?,
        RunMode::Tui => {
            log::warn!("--mode tui has no interactive frontend in this build; running adaptive instead");
            run_adaptive(poll_loop.clone()).await?
        }
    };

    drop(lock);
    Ok(exit_code)
}

/// One-shot: run a single fetch/update/commit cycle, print the resulting
/// table, then exit (spec §6 `--mode once`).
async fn run_once(poll_loop: Arc<PollLoop>) -> Result<ExitCode> {
    match poll_loop.run_once().await {
        Ok(doc) => {
            print_table(&doc);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            log::error!("one-shot poll failed: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_table(doc: &riverwatch_core::StateDocument) {
    println!("{:<16} {:>20} {:>10} {:>10}", "gauge_id", "last_timestamp", "stage", "flow");
    for (gauge_id, state) in &doc.gauges {
        println!(
            "{:<16} {:>20} {:>10} {:>10}",
            gauge_id,
            state
                .last_timestamp
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            state.last_stage.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
            state.last_flow.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
        );
    }
}

async fn run_adaptive(poll_loop: Arc<PollLoop>) -> Result<ExitCode> {
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let loop_rx = shutdown_tx.subscribe();

    let loop_handle = tokio::spawn({
        let poll_loop = poll_loop.clone();
        async move { poll_loop.run(loop_rx).await }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("ctrl-c received, initiating shutdown");
        }
        _ = wait_for_sigterm() => {
            log::info!("SIGTERM received, initiating shutdown");
        }
    }

    let _ = shutdown_tx.send(());
    match loop_handle.await {
        Ok(Ok(())) => Ok(ExitCode::SUCCESS),
        Ok(Err(e)) => {
            log::error!("poll loop exited with error: {e}");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            log::error!("poll loop task panicked: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn wait_for_sigterm() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
