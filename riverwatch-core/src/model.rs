//! Persisted data model: gauges, per-gauge state, process-wide meta, and the
//! optional forecast overlay. Mirrors the state document shape in spec §3/§6.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A single physical measurement station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gauge {
    pub gauge_id: String,
    pub site_no: String,
    pub display_name: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// `true` for gauges declared in static configuration; `false` for
    /// ones discovered via nearby-search, which are evictable.
    pub primary: bool,
}

/// A single observation reported upstream, or read back from history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub stage: Option<f64>,
    pub flow: Option<f64>,
}

/// A raw reading returned by an upstream adapter for one gauge.
#[derive(Debug, Clone, Copy)]
pub struct GaugeReading {
    pub observed_at: DateTime<Utc>,
    pub stage: Option<f64>,
    pub flow: Option<f64>,
}

pub const HISTORY_CAP: usize = 120;
pub const LATENCY_SAMPLES_CAP: usize = 120;

pub const MEAN_INTERVAL_MIN_SEC: f64 = 900.0;
pub const MEAN_INTERVAL_MAX_SEC: f64 = 21_600.0;

/// Per-gauge persisted state (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaugeState {
    pub last_timestamp: Option<DateTime<Utc>>,
    pub last_stage: Option<f64>,
    pub last_flow: Option<f64>,

    pub mean_interval_sec: f64,
    pub cadence_mult: Option<u32>,
    pub cadence_fit: f64,
    pub phase_offset_sec: Option<f64>,

    pub latency_loc_sec: f64,
    pub latency_scale_sec: f64,
    pub latency_window: Option<(f64, f64)>,
    pub latency_samples: VecDeque<f64>,

    pub no_update_polls: u32,
    pub polls_per_update_ewma: f64,
    #[serde(default)]
    pub last_poll_ts: Option<DateTime<Utc>>,

    pub history: VecDeque<Observation>,

    pub next_eta: Option<DateTime<Utc>>,

    /// Recent raw inter-update deltas in seconds, used by the cadence
    /// learner's grid-fit search. Capped at 24 entries (spec §4.4).
    #[serde(default)]
    pub recent_deltas_sec: VecDeque<f64>,
}

impl Default for GaugeState {
    fn default() -> Self {
        Self {
            last_timestamp: None,
            last_stage: None,
            last_flow: None,
            mean_interval_sec: MEAN_INTERVAL_MIN_SEC,
            cadence_mult: None,
            cadence_fit: 0.0,
            phase_offset_sec: None,
            latency_loc_sec: 600.0,
            latency_scale_sec: 100.0,
            latency_window: None,
            latency_samples: VecDeque::new(),
            no_update_polls: 0,
            polls_per_update_ewma: 0.0,
            last_poll_ts: None,
            history: VecDeque::new(),
            next_eta: None,
            recent_deltas_sec: VecDeque::new(),
        }
    }
}

/// Which upstream protocol a reading/decision came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Blended,
    Legacy,
    Modern,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Blended
    }
}

/// EWMA latency/variance statistics kept per backend by the blended layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackendStat {
    pub ewma_latency_ms: f64,
    pub ewma_variance_ms2: f64,
    pub samples: u64,
}

impl Default for BackendStat {
    fn default() -> Self {
        Self {
            ewma_latency_ms: 0.0,
            ewma_variance_ms2: 0.0,
            samples: 0,
        }
    }
}

/// Process-wide state (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub state_version: u32,
    pub backfill_hours: u32,
    /// Wall-clock of the last historical backfill fetch; `None` means one
    /// hasn't run yet, which makes it due immediately (spec: "at startup").
    #[serde(default)]
    pub last_backfill_at: Option<DateTime<Utc>>,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub api_backend: BackendKind,
    pub last_backend_used: Option<BackendKind>,
    pub legacy_stats: BackendStat,
    pub modern_stats: BackendStat,
    /// Set when `load()` had to repair a corrupt or incoherent document.
    #[serde(default)]
    pub load_repaired: bool,
}

pub const CURRENT_STATE_VERSION: u32 = 1;

impl Default for Meta {
    fn default() -> Self {
        Self {
            state_version: CURRENT_STATE_VERSION,
            backfill_hours: 6,
            last_backfill_at: None,
            last_fetch_at: None,
            last_success_at: None,
            last_failure_at: None,
            next_poll_at: None,
            api_backend: BackendKind::Blended,
            last_backend_used: None,
            legacy_stats: BackendStat::default(),
            modern_stats: BackendStat::default(),
            load_repaired: false,
        }
    }
}

/// Optional per-gauge forecast/cross-check overlay (spec §4.9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlayState {
    pub points: VecDeque<Observation>,
    pub last_refresh_at: Option<DateTime<Utc>>,
}

/// Derived, read-only overlay summary (never persisted, computed on read).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OverlaySummary {
    pub max_stage_3h: Option<f64>,
    pub max_flow_3h: Option<f64>,
    pub max_stage_24h: Option<f64>,
    pub max_flow_24h: Option<f64>,
    pub max_stage_full: Option<f64>,
    pub max_flow_full: Option<f64>,
    pub amplitude_bias_stage: Option<f64>,
    pub amplitude_ratio_stage: Option<f64>,
    pub peak_time_offset_sec: Option<i64>,
}

/// A summary row adopted from (or published to) the optional community
/// aggregator (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityPrior {
    pub cadence_mult: Option<u32>,
    pub cadence_fit: f64,
    pub phase_offset_sec: Option<f64>,
    pub latency_loc_sec: f64,
    pub latency_scale_sec: f64,
    pub samples: u64,
    pub updated_at: DateTime<Utc>,
}
