//! Configuration (ambient stack): CLI surface plus optional JSON file
//! override, layered the way `yahoo_logic::config::load_config` does —
//! command-line/env values win, the file fills in whatever wasn't set on
//! the command line.

use crate::model::BackendKind;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

/// How the process should run once configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Poll once, print a table, exit.
    Once,
    /// Run the adaptive poll loop headlessly until signaled to stop.
    Adaptive,
    /// Run the interactive terminal UI.
    Tui,
}

/// Which metric the presentation layer should chart by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartMetric {
    Stage,
    Flow,
}

/// Which upstream backend policy to run (spec §6 `--usgs-backend`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    Blended,
    Legacy,
    Modern,
}

impl From<BackendChoice> for BackendKind {
    fn from(choice: BackendChoice) -> Self {
        match choice {
            BackendChoice::Blended => BackendKind::Blended,
            BackendChoice::Legacy => BackendKind::Legacy,
            BackendChoice::Modern => BackendKind::Modern,
        }
    }
}

/// The clap-facing parse target. Every field that has a real default lives
/// here as `Option<T>` with no `default_value`, so the parser can tell "not
/// given on the command line" apart from "given, happens to match the
/// default" — the distinction `Config::load` needs to let a config file's
/// value through when the CLI is silent on a field.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Adaptive poller for river-gauge telemetry")]
struct Cli {
    #[clap(long, env = "RIVERWATCH_CONFIG_PATH")]
    config_path: Option<PathBuf>,

    #[clap(long, value_enum)]
    mode: Option<RunMode>,

    #[clap(long, env = "RIVERWATCH_STATE_FILE")]
    state_file: Option<PathBuf>,

    #[clap(long, env = "RIVERWATCH_GAUGES_FILE")]
    gauges_file: Option<PathBuf>,

    #[clap(long)]
    min_retry_seconds: Option<u64>,

    #[clap(long)]
    max_retry_seconds: Option<u64>,

    #[clap(long)]
    backfill_hours: Option<u32>,

    #[clap(long)]
    forecast_base: Option<String>,

    #[clap(long)]
    forecast_hours: Option<u32>,

    #[clap(long, value_enum)]
    usgs_backend: Option<BackendChoice>,

    #[clap(long)]
    community_base: Option<String>,

    /// A bare `clap` flag has no "unset" state distinct from "not passed",
    /// so a config file can only turn this on, never force it off against
    /// the flag (see `Config::load`).
    #[clap(long, default_value_t = false)]
    community_publish: bool,

    #[clap(long)]
    ui_tick_sec: Option<f64>,

    #[clap(long, value_enum)]
    chart_metric: Option<ChartMetric>,

    /// Same caveat as `community_publish`: file can enable, not disable.
    #[clap(long, default_value_t = false)]
    debug: bool,

    #[clap(long, env = "RIVERWATCH_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[clap(long, env = "RIVERWATCH_LOG_LEVEL")]
    log_level: Option<String>,
}

/// Mirrors [`Cli`] field-for-field so `Config::load` can layer a JSON file
/// under whatever the command line left unset.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FileConfig {
    config_path: Option<PathBuf>,
    mode: Option<RunMode>,
    state_file: Option<PathBuf>,
    gauges_file: Option<PathBuf>,
    min_retry_seconds: Option<u64>,
    max_retry_seconds: Option<u64>,
    backfill_hours: Option<u32>,
    forecast_base: Option<String>,
    forecast_hours: Option<u32>,
    usgs_backend: Option<BackendChoice>,
    community_base: Option<String>,
    community_publish: Option<bool>,
    ui_tick_sec: Option<f64>,
    chart_metric: Option<ChartMetric>,
    debug: Option<bool>,
    log_dir: Option<PathBuf>,
    log_level: Option<String>,
}

/// Fully resolved configuration: every field here has its final, concrete
/// value, CLI/env taking precedence over the config file, which in turn
/// takes precedence over the hardcoded default.
#[derive(Debug, Clone)]
pub struct Config {
    pub config_path: Option<PathBuf>,
    pub mode: RunMode,
    pub state_file: Option<PathBuf>,
    /// JSON array of `{gauge_id, site_no, display_name, lat?, lon?}`
    /// declaring the primary gauge roster. Not part of the spec's CLI
    /// surface proper — the spec assumes a roster exists but doesn't name
    /// how it's supplied, so this fills that gap the way `yahoo_ws_url`
    /// fills the equivalent slot for the teacher's single-stream server.
    pub gauges_file: Option<PathBuf>,
    pub min_retry_seconds: u64,
    pub max_retry_seconds: u64,
    pub backfill_hours: u32,
    pub forecast_base: Option<String>,
    pub forecast_hours: u32,
    pub usgs_backend: BackendChoice,
    pub community_base: Option<String>,
    pub community_publish: bool,
    pub ui_tick_sec: f64,
    pub chart_metric: ChartMetric,
    pub debug: bool,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl Config {
    /// Parse CLI/env args, then layer in a JSON config file if one is
    /// named and readable; CLI/env arguments always win over the file,
    /// which in turn wins over the hardcoded default. The two plain `bool`
    /// flags (`debug`, `community_publish`) are the one exception: `clap`
    /// gives them no way to distinguish "not passed" from "passed as
    /// false", so the file can only turn them on, never override a CLI
    /// flag off.
    pub fn load() -> Self {
        let cli = Cli::parse();

        let file = cli
            .config_path
            .as_ref()
            .and_then(|path| fs::read_to_string(path).ok())
            .and_then(|raw| serde_json::from_str::<FileConfig>(&raw).ok())
            .unwrap_or_default();

        Config {
            config_path: cli.config_path.or(file.config_path),
            mode: cli.mode.or(file.mode).unwrap_or(RunMode::Adaptive),
            state_file: cli.state_file.or(file.state_file),
            gauges_file: cli.gauges_file.or(file.gauges_file),
            min_retry_seconds: cli.min_retry_seconds.or(file.min_retry_seconds).unwrap_or(60),
            max_retry_seconds: cli.max_retry_seconds.or(file.max_retry_seconds).unwrap_or(300),
            backfill_hours: cli.backfill_hours.or(file.backfill_hours).unwrap_or(6),
            forecast_base: cli.forecast_base.or(file.forecast_base),
            forecast_hours: cli.forecast_hours.or(file.forecast_hours).unwrap_or(72),
            usgs_backend: cli.usgs_backend.or(file.usgs_backend).unwrap_or(BackendChoice::Blended),
            community_base: cli.community_base.or(file.community_base),
            community_publish: cli.community_publish || file.community_publish.unwrap_or(false),
            ui_tick_sec: cli.ui_tick_sec.or(file.ui_tick_sec).unwrap_or(0.15),
            chart_metric: cli.chart_metric.or(file.chart_metric).unwrap_or(ChartMetric::Stage),
            debug: cli.debug || file.debug.unwrap_or(false),
            log_dir: cli.log_dir.or(file.log_dir).unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: cli.log_level.or(file.log_level).unwrap_or_else(|| "info".to_string()),
        }
    }

    /// Resolve the state-file path, defaulting to `~/.streamvis_state.json`
    /// per spec §6 when neither flag nor env var names one.
    pub fn resolved_state_file(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".streamvis_state.json")
        })
    }

    /// Load the primary gauge roster from `gauges_file`, or an empty roster
    /// if none was given.
    pub fn load_gauges(&self) -> anyhow::Result<Vec<crate::model::Gauge>> {
        let Some(path) = &self.gauges_file else {
            return Ok(Vec::new());
        };
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
