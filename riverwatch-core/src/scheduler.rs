//! Scheduler (C9): turns per-gauge predictions into a single next wake time,
//! plus a standalone error-backoff sequence for fetch failures.

use crate::model::GaugeState;
use crate::predictor::{self, Prediction};
use chrono::{DateTime, Duration, Utc};

const FINE_STEP_MIN_SEC: f64 = 15.0;
const FINE_STEP_MAX_SEC: f64 = 30.0;
const FINE_LATENCY_SCALE_CEILING_SEC: f64 = 60.0;
const FINE_MEAN_INTERVAL_CEILING_SEC: f64 = 3600.0;
const COARSE_HEADSTART_SEC: f64 = 30.0;

/// Which policy produced a gauge's proposed next poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Fine,
    Coarse,
}

#[derive(Debug, Clone, Copy)]
pub struct GaugeProposal {
    pub regime: Regime,
    pub next_poll_at: DateTime<Utc>,
}

/// Propose this gauge's next poll time given its current prediction.
///
/// `min_retry_seconds` is reused as the coarse regime's floor per spec §4.7;
/// it is distinct from the error-backoff sequence in [`ErrorBackoff`].
pub fn propose(gauge: &GaugeState, now: DateTime<Utc>, min_retry_seconds: u64) -> Option<GaugeProposal> {
    let pred = predictor::predict(gauge, now)?;
    Some(propose_from_prediction(&pred, now, gauge, min_retry_seconds))
}

fn propose_from_prediction(
    pred: &Prediction,
    now: DateTime<Utc>,
    gauge: &GaugeState,
    min_retry_seconds: u64,
) -> GaugeProposal {
    let d = (pred.next_api_visible_at - now).num_milliseconds() as f64 / 1000.0;
    let w = pred.latency_half_width_sec;

    let is_fine = gauge.latency_scale_sec <= FINE_LATENCY_SCALE_CEILING_SEC
        && gauge.mean_interval_sec <= FINE_MEAN_INTERVAL_CEILING_SEC
        && d.abs() <= w;

    if is_fine {
        // Interpolate from FINE_STEP_MIN at the window center to
        // FINE_STEP_MAX at its edges, floored at 15s.
        let edge_fraction = if w > 0.0 { (d.abs() / w).clamp(0.0, 1.0) } else { 0.0 };
        let step = (FINE_STEP_MIN_SEC + edge_fraction * (FINE_STEP_MAX_SEC - FINE_STEP_MIN_SEC))
            .max(FINE_STEP_MIN_SEC);
        GaugeProposal {
            regime: Regime::Fine,
            next_poll_at: now + Duration::milliseconds((step * 1000.0) as i64),
        }
    } else {
        let candidate = (d - COARSE_HEADSTART_SEC).min(gauge.mean_interval_sec / 2.0);
        let step = candidate.max(min_retry_seconds as f64);
        GaugeProposal {
            regime: Regime::Coarse,
            next_poll_at: now + Duration::milliseconds((step * 1000.0) as i64),
        }
    }
}

/// Pick the earliest proposal across all gauges; `None` if none produced one
/// (e.g. an empty fleet, or every gauge still awaiting its first reading).
pub fn earliest(proposals: &[GaugeProposal]) -> Option<DateTime<Utc>> {
    proposals.iter().map(|p| p.next_poll_at).min()
}

/// Standalone error-backoff sequence, doubling on each failure and resetting
/// on success. Governs only retry-after-failure timing, never normal cadence
/// (spec §4.7/§9).
#[derive(Debug, Clone, Copy)]
pub struct ErrorBackoff {
    min_retry_seconds: u64,
    max_retry_seconds: u64,
    current_seconds: u64,
}

impl ErrorBackoff {
    pub fn new(min_retry_seconds: u64, max_retry_seconds: u64) -> Self {
        Self {
            min_retry_seconds,
            max_retry_seconds,
            current_seconds: min_retry_seconds,
        }
    }

    /// Record a failure and return the sleep duration before the next retry.
    pub fn on_failure(&mut self) -> Duration {
        let sleep_secs = self.current_seconds;
        self.current_seconds = (self.current_seconds.saturating_mul(2)).min(self.max_retry_seconds);
        Duration::seconds(sleep_secs as i64)
    }

    /// Reset the sequence back to the floor after a successful fetch.
    pub fn on_success(&mut self) {
        self.current_seconds = self.min_retry_seconds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs)
    }

    fn fine_gauge() -> GaugeState {
        let mut gauge = GaugeState::default();
        gauge.last_timestamp = Some(ts(0));
        gauge.mean_interval_sec = 900.0;
        gauge.latency_loc_sec = 600.0;
        gauge.latency_scale_sec = 20.0; // within fine ceiling
        gauge
    }

    #[test]
    fn fine_regime_proposes_short_step_near_window() {
        let gauge = fine_gauge();
        // next_api_visible_at = ts(900) + 600s = ts(1500); call right at that moment.
        let proposal = propose(&gauge, ts(1500), 60).unwrap();
        assert_eq!(proposal.regime, Regime::Fine);
        let step = (proposal.next_poll_at - ts(1500)).num_seconds();
        assert!((15..=30).contains(&step));
    }

    #[test]
    fn coarse_regime_applies_when_far_from_window() {
        let mut gauge = fine_gauge();
        gauge.latency_scale_sec = 20.0;
        let proposal = propose(&gauge, ts(0), 60).unwrap();
        assert_eq!(proposal.regime, Regime::Coarse);
    }

    #[test]
    fn coarse_regime_respects_min_retry_floor() {
        let mut gauge = fine_gauge();
        gauge.mean_interval_sec = 900.0;
        // now is already past next_api_visible_at minus headstart, so the
        // raw candidate would be negative/small; min_retry_seconds floors it.
        let proposal = propose(&gauge, ts(1490), 60).unwrap();
        assert!(proposal.next_poll_at >= ts(1490) + Duration::seconds(60) || proposal.regime == Regime::Fine);
    }

    #[test]
    fn earliest_picks_the_soonest_proposal() {
        let proposals = vec![
            GaugeProposal { regime: Regime::Fine, next_poll_at: ts(500) },
            GaugeProposal { regime: Regime::Coarse, next_poll_at: ts(100) },
        ];
        assert_eq!(earliest(&proposals), Some(ts(100)));
    }

    #[test]
    fn error_backoff_doubles_and_caps() {
        let mut backoff = ErrorBackoff::new(60, 300);
        assert_eq!(backoff.on_failure(), Duration::seconds(60));
        assert_eq!(backoff.on_failure(), Duration::seconds(120));
        assert_eq!(backoff.on_failure(), Duration::seconds(240));
        assert_eq!(backoff.on_failure(), Duration::seconds(300));
        backoff.on_success();
        assert_eq!(backoff.on_failure(), Duration::seconds(60));
    }
}
