//! Cadence learner (C6): turns a stream of observed timestamp deltas into a
//! smoothed `mean_interval_sec`, a grid-fit `(cadence_mult, cadence_fit)`, and
//! a biweight-estimated `phase_offset_sec`.

use crate::model::{GaugeState, MEAN_INTERVAL_MAX_SEC, MEAN_INTERVAL_MIN_SEC};
use chrono::{DateTime, Utc};

const GRID_STEP_SEC: f64 = 900.0;
const GRID_TOLERANCE_SEC: f64 = 180.0;
const GRID_MAX_K: u32 = 24;
const EWMA_ALPHA: f64 = 0.25;
const RECENT_DELTAS_CAP: usize = 24;
const FIT_FLOOR: f64 = 0.6;
const SNAP_UP_RATIO: f64 = 1.25;

/// Feed one observed transition `t_prev -> t_new` into the learner, updating
/// `gauge` in place. `t_prev` is `None` for a gauge's very first observation.
pub fn observe(gauge: &mut GaugeState, t_prev: Option<DateTime<Utc>>, t_new: DateTime<Utc>) {
    let Some(t_prev) = t_prev else { return };

    let delta = (t_new - t_prev).num_milliseconds() as f64 / 1000.0;
    if delta < 60.0 {
        return;
    }

    gauge.recent_deltas_sec.push_back(delta);
    if gauge.recent_deltas_sec.len() > RECENT_DELTAS_CAP {
        gauge.recent_deltas_sec.pop_front();
    }

    let clamped = delta.clamp(MEAN_INTERVAL_MIN_SEC, MEAN_INTERVAL_MAX_SEC);
    let sample = nearest_grid_multiple(clamped)
        .filter(|&(_, distance)| distance <= GRID_TOLERANCE_SEC)
        .map(|(k, _)| k as f64 * GRID_STEP_SEC)
        .unwrap_or(clamped);

    gauge.mean_interval_sec = if gauge.mean_interval_sec <= 0.0 {
        sample
    } else {
        EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * gauge.mean_interval_sec
    }
    .clamp(MEAN_INTERVAL_MIN_SEC, MEAN_INTERVAL_MAX_SEC);

    refit_grid(gauge);
    snap_up(gauge);

    if gauge.cadence_mult.is_some() {
        estimate_phase(gauge);
    }
}

/// Distance from `value` to its nearest multiple of `GRID_STEP_SEC`, along
/// with that multiple's `k`.
fn nearest_grid_multiple(value: f64) -> Option<(u32, f64)> {
    let k = (value / GRID_STEP_SEC).round();
    if k < 1.0 {
        return None;
    }
    let k = k.min(GRID_MAX_K as f64) as u32;
    let distance = (value - k as f64 * GRID_STEP_SEC).abs();
    Some((k, distance))
}

fn refit_grid(gauge: &mut GaugeState) {
    let deltas = &gauge.recent_deltas_sec;
    if deltas.is_empty() {
        gauge.cadence_mult = None;
        gauge.cadence_fit = 0.0;
        return;
    }

    let mut best: Option<(u32, f64, usize)> = None;
    for k in 1..=GRID_MAX_K {
        let target = k as f64 * GRID_STEP_SEC;
        let count = deltas
            .iter()
            .filter(|&&d| (d - target).abs() <= GRID_TOLERANCE_SEC)
            .count();
        let fit = count as f64 / deltas.len() as f64;
        if fit < FIT_FLOOR {
            continue;
        }
        let better = match best {
            None => true,
            Some((best_k, _, best_count)) => k > best_k || (k == best_k && count > best_count),
        };
        if better {
            best = Some((k, fit, count));
        }
    }

    match best {
        Some((k, fit, _)) => {
            gauge.cadence_mult = Some(k);
            gauge.cadence_fit = fit;
        }
        None => {
            gauge.cadence_mult = None;
            gauge.cadence_fit = 0.0;
            gauge.phase_offset_sec = None;
        }
    }
}

fn snap_up(gauge: &mut GaugeState) {
    if gauge.recent_deltas_sec.len() < 3 {
        return;
    }
    let tail: Vec<f64> = gauge
        .recent_deltas_sec
        .iter()
        .rev()
        .take(gauge.recent_deltas_sec.len().max(3))
        .copied()
        .collect();
    let mean = tail.iter().sum::<f64>() / tail.len() as f64;
    if mean > gauge.mean_interval_sec * SNAP_UP_RATIO {
        gauge.mean_interval_sec = mean.clamp(MEAN_INTERVAL_MIN_SEC, MEAN_INTERVAL_MAX_SEC);
    }
}

/// Biweight-estimate `phase_offset_sec` from the most recent timestamps seen
/// against period `P = cadence_mult * GRID_STEP_SEC`. Reuses the raw history
/// buffer's tail rather than re-deriving timestamps; callers that want a
/// tighter phase fit across the whole window call
/// [`refit_phase_from_history`] instead.
///
/// Assumes the caller has already pushed the new observation onto
/// `gauge.history` (as `apply_reading` does before calling [`observe`]), so
/// `history.back()` already *is* `t_new`; it must not be re-added here, or
/// the newest sample gets double-weighted in the biweight fit.
fn estimate_phase(gauge: &mut GaugeState) {
    let Some(k) = gauge.cadence_mult else { return };
    let period = k as f64 * GRID_STEP_SEC;
    if period <= 0.0 {
        return;
    }

    let samples: Vec<f64> = gauge
        .history
        .iter()
        .rev()
        .take(24)
        .map(|obs| obs.timestamp.timestamp() as f64)
        .collect();
    if samples.len() < 3 {
        return;
    }

    gauge.phase_offset_sec = Some(biweight_phase(&samples, period));
}

/// Full biweight phase re-estimation from a gauge's entire retained history,
/// used at load time or after a bulk backfill when `observe` hasn't walked
/// every transition incrementally.
pub fn refit_phase_from_history(gauge: &mut GaugeState) {
    let Some(k) = gauge.cadence_mult else { return };
    let period = k as f64 * GRID_STEP_SEC;
    if period <= 0.0 || gauge.history.len() < 3 {
        return;
    }
    let samples: Vec<f64> = gauge
        .history
        .iter()
        .map(|obs| obs.timestamp.timestamp() as f64)
        .collect();
    gauge.phase_offset_sec = Some(biweight_phase(&samples, period));
}

fn biweight_phase(timestamps: &[f64], period: f64) -> f64 {
    let anchor = timestamps[0].rem_euclid(period);
    let mut phis: Vec<f64> = timestamps
        .iter()
        .map(|&t| {
            let mut phi = t.rem_euclid(period);
            if phi < anchor - period / 2.0 {
                phi += period;
            }
            phi
        })
        .collect();
    phis.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let median = median_of(&phis);
    let mad = mad_of(&phis, median).max(1e-6);
    const C: f64 = 6.0;

    let mut location = median;
    for _ in 0..5 {
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for &phi in &phis {
            let u = (phi - location) / (C * mad);
            if u.abs() >= 1.0 {
                continue;
            }
            let w = (1.0 - u * u).powi(2);
            weighted_sum += w * phi;
            weight_total += w;
        }
        if weight_total <= 0.0 {
            break;
        }
        let next = weighted_sum / weight_total;
        if (next - location).abs() < 1e-6 {
            location = next;
            break;
        }
        location = next;
    }

    location.rem_euclid(period)
}

fn median_of(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

fn mad_of(sorted: &[f64], median: f64) -> f64 {
    let mut deviations: Vec<f64> = sorted.iter().map(|v| (v - median).abs()).collect();
    deviations.sort_by(|a, b| a.partial_cmp(b).unwrap());
    median_of(&deviations) * 1.4826
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs)
    }

    #[test]
    fn first_sample_initializes_mean_interval() {
        let mut gauge = GaugeState::default();
        observe(&mut gauge, None, ts(0));
        assert_eq!(gauge.mean_interval_sec, MEAN_INTERVAL_MIN_SEC);
        assert!(gauge.recent_deltas_sec.is_empty());
    }

    #[test]
    fn sub_minute_delta_is_ignored() {
        let mut gauge = GaugeState::default();
        observe(&mut gauge, Some(ts(0)), ts(30));
        assert!(gauge.recent_deltas_sec.is_empty());
    }

    #[test]
    fn regular_15min_cadence_is_detected() {
        let mut gauge = GaugeState::default();
        let mut prev = ts(0);
        for i in 1..=8 {
            let next = ts(i * 900);
            observe(&mut gauge, Some(prev), next);
            prev = next;
        }
        assert_eq!(gauge.cadence_mult, Some(1));
        assert!(gauge.cadence_fit >= FIT_FLOOR);
        assert!((gauge.mean_interval_sec - 900.0).abs() < 1.0);
    }

    #[test]
    fn irregular_deltas_clear_cadence() {
        let mut gauge = GaugeState::default();
        let mut prev = ts(0);
        let offsets = [901, 1450, 2200, 3100, 905];
        let mut total = 0i64;
        for &d in &offsets {
            total += d;
            let next = ts(total);
            observe(&mut gauge, Some(prev), next);
            prev = next;
        }
        assert!(gauge.cadence_mult.is_none() || gauge.cadence_fit < 1.0);
    }

    #[test]
    fn slow_gauge_snaps_up_mean_interval() {
        let mut gauge = GaugeState::default();
        gauge.mean_interval_sec = MEAN_INTERVAL_MIN_SEC;
        let mut prev = ts(0);
        for i in 1..=4 {
            let next = ts(i * 4 * 900);
            observe(&mut gauge, Some(prev), next);
            prev = next;
        }
        assert!(gauge.mean_interval_sec > MEAN_INTERVAL_MIN_SEC * 1.2);
    }
}
