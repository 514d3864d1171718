//! Predictor (C8): combines the cadence learner's grid/phase estimate and the
//! latency estimator's location/scale into a predicted next-observation time,
//! next-API-visible time, and a latency half-width.

use crate::model::GaugeState;
use chrono::{DateTime, Utc};

const GRID_STEP_SEC: f64 = 900.0;
const HALF_WIDTH_MIN_SEC: f64 = 45.0;
const HALF_WIDTH_MAX_SEC: f64 = 300.0;

/// Predicted timing for a gauge's next observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub next_obs_at: DateTime<Utc>,
    pub next_api_visible_at: DateTime<Utc>,
    pub latency_half_width_sec: f64,
}

/// Predict the next observation/visibility pair for a gauge whose last
/// reading landed at `last_timestamp`, relative to `now`. Returns `None` if
/// the gauge has never produced a reading.
pub fn predict(gauge: &GaugeState, now: DateTime<Utc>) -> Option<Prediction> {
    let t0 = gauge.last_timestamp?;

    let next_obs_at = match (gauge.cadence_mult, gauge.phase_offset_sec) {
        (Some(k), Some(phi)) => next_obs_grid(t0, k as f64 * GRID_STEP_SEC, phi, now),
        _ => next_obs_interval(t0, gauge.mean_interval_sec.max(1.0), now),
    };

    let half_width =
        (2.0 * gauge.latency_scale_sec).clamp(HALF_WIDTH_MIN_SEC, HALF_WIDTH_MAX_SEC);
    let next_api_visible_at =
        next_obs_at + chrono::Duration::milliseconds((gauge.latency_loc_sec * 1000.0) as i64);

    Some(Prediction {
        next_obs_at,
        next_api_visible_at,
        latency_half_width_sec: half_width,
    })
}

/// Grid-aware prediction: the smallest `t0 + n*P + (phi - (t0 mod P)) mod P`
/// strictly after `max(now - P/2, t0)`, advancing past an imminent candidate
/// within `P/2` of `t0` rather than skipping it. The `t0` floor matters
/// whenever `now` is called shortly after a reading lands (the common case,
/// since `predict` runs every poll-loop iteration right after `apply_reading`)
/// and `now - t0 < P/2`: without it the search floor falls before `t0` and the
/// already-observed `t0` itself can come back out as the "next" prediction.
fn next_obs_grid(t0: DateTime<Utc>, period_sec: f64, phi: f64, now: DateTime<Utc>) -> DateTime<Utc> {
    let t0_secs = t0.timestamp() as f64;
    let now_secs = now.timestamp() as f64;

    let phase_adjust = (phi - t0_secs.rem_euclid(period_sec)).rem_euclid(period_sec);
    let threshold = (now_secs - period_sec / 2.0).max(t0_secs);

    let mut n = ((threshold - t0_secs - phase_adjust) / period_sec).ceil();
    let mut candidate = t0_secs + n * period_sec + phase_adjust;
    // Guard against floating point nudging the candidate to fall short.
    while candidate <= threshold {
        n += 1.0;
        candidate = t0_secs + n * period_sec + phase_adjust;
    }

    seconds_to_ts(candidate)
}

/// Plain interval-stepping prediction: `t0 + m*I` for the smallest `m` that
/// lands strictly after `now`.
fn next_obs_interval(t0: DateTime<Utc>, interval_sec: f64, now: DateTime<Utc>) -> DateTime<Utc> {
    let t0_secs = t0.timestamp() as f64;
    let now_secs = now.timestamp() as f64;
    if now_secs < t0_secs {
        return t0;
    }
    let m = ((now_secs - t0_secs) / interval_sec).floor() + 1.0;
    seconds_to_ts(t0_secs + m * interval_sec)
}

fn seconds_to_ts(secs: f64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs.floor() as i64, 0).expect("prediction timestamp in range")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs)
    }

    #[test]
    fn no_history_has_no_prediction() {
        let gauge = GaugeState::default();
        assert!(predict(&gauge, ts(0)).is_none());
    }

    #[test]
    fn interval_fallback_steps_past_now() {
        let mut gauge = GaugeState::default();
        gauge.last_timestamp = Some(ts(0));
        gauge.mean_interval_sec = 900.0;
        let pred = predict(&gauge, ts(1000)).unwrap();
        assert_eq!(pred.next_obs_at, ts(1800));
    }

    #[test]
    fn grid_prediction_uses_phase() {
        let mut gauge = GaugeState::default();
        gauge.last_timestamp = Some(ts(0));
        gauge.cadence_mult = Some(1);
        gauge.phase_offset_sec = Some(0.0);
        gauge.mean_interval_sec = 900.0;
        let pred = predict(&gauge, ts(100)).unwrap();
        assert_eq!(pred.next_obs_at, ts(900));
    }

    #[test]
    fn half_width_is_clamped() {
        let mut gauge = GaugeState::default();
        gauge.last_timestamp = Some(ts(0));
        gauge.latency_scale_sec = 1.0;
        let pred = predict(&gauge, ts(1)).unwrap();
        assert_eq!(pred.latency_half_width_sec, 45.0);

        gauge.latency_scale_sec = 1000.0;
        let pred = predict(&gauge, ts(1)).unwrap();
        assert_eq!(pred.latency_half_width_sec, 300.0);
    }
}
