//! Latency estimator (C7): converts poll/observation timing into a bracketed
//! sample, then refits a robust location/scale pair via iteratively
//! reweighted biweight estimation with a `(600, 100)` prior.

use crate::model::{GaugeState, LATENCY_SAMPLES_CAP};
use chrono::{DateTime, Utc};

const PRIOR_LOCATION_SEC: f64 = 600.0;
const PRIOR_SCALE_SEC: f64 = 100.0;
const LOCATION_TUNING: f64 = 6.0;
const SCALE_TUNING: f64 = 9.0;
const MAX_ITERATIONS: usize = 5;
const CONVERGENCE_EPS: f64 = 1e-6;
const MIN_SAMPLES_FOR_ROBUST_INIT: usize = 3;

/// Feed one new-observation visibility window into the estimator. `t_prev_poll`
/// is the wall-clock of the last poll during which `t_obs` was not yet
/// visible; `t_poll` is the wall-clock at which it became visible.
///
/// Discards the sample on clock skew (`upper < 0`), per spec §7.
pub fn observe(
    gauge: &mut GaugeState,
    t_obs: DateTime<Utc>,
    t_prev_poll: Option<DateTime<Utc>>,
    t_poll: DateTime<Utc>,
) {
    let upper = (t_poll - t_obs).num_milliseconds() as f64 / 1000.0;
    if upper < 0.0 {
        log::warn!("clock skew detected: observation {t_obs} visible before it landed (poll {t_poll}), discarding sample");
        return;
    }
    let lower = t_prev_poll
        .map(|prev| ((prev - t_obs).num_milliseconds() as f64 / 1000.0).max(0.0))
        .unwrap_or(0.0);

    let midpoint = ((lower + upper) / 2.0).clamp(0.0, upper);
    gauge.latency_window = Some((lower, upper));

    gauge.latency_samples.push_back(midpoint);
    if gauge.latency_samples.len() > LATENCY_SAMPLES_CAP {
        gauge.latency_samples.pop_front();
    }

    refit(gauge);
}

fn refit(gauge: &mut GaugeState) {
    let samples: Vec<f64> = gauge.latency_samples.iter().copied().collect();
    if samples.len() < MIN_SAMPLES_FOR_ROBUST_INIT {
        gauge.latency_loc_sec = PRIOR_LOCATION_SEC;
        gauge.latency_scale_sec = PRIOR_SCALE_SEC;
        return;
    }

    let mut sorted = samples.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mut location = median_of(&sorted);
    let mut scale = (mad_of(&sorted, location) * 1.4826).max(1e-6);

    for _ in 0..MAX_ITERATIONS {
        let (next_location, next_scale) = biweight_pass(&samples, location, scale);
        let converged = (next_location - location).abs() < CONVERGENCE_EPS;
        location = next_location;
        scale = next_scale;
        if converged {
            break;
        }
    }

    gauge.latency_loc_sec = location;
    gauge.latency_scale_sec = scale.max(1e-6);
}

fn biweight_pass(samples: &[f64], location: f64, scale: f64) -> (f64, f64) {
    let loc_scale = (LOCATION_TUNING * scale).max(1e-9);
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for &x in samples {
        let u = (x - location) / loc_scale;
        if u.abs() >= 1.0 {
            continue;
        }
        let w = (1.0 - u * u).powi(2);
        weighted_sum += w * x;
        weight_total += w;
    }
    let next_location = if weight_total > 0.0 {
        weighted_sum / weight_total
    } else {
        location
    };

    let var_scale = (SCALE_TUNING * scale).max(1e-9);
    let n = samples.len() as f64;
    let mut num = 0.0;
    let mut denom = 0.0;
    for &x in samples {
        let u = (x - next_location) / var_scale;
        if u.abs() >= 1.0 {
            continue;
        }
        let one_minus_u2 = 1.0 - u * u;
        num += (x - next_location).powi(2) * one_minus_u2.powi(4);
        denom += one_minus_u2 * (1.0 - 5.0 * u * u);
    }
    let next_scale = if denom.abs() > 1e-9 {
        (n * num).sqrt() / denom.abs()
    } else {
        scale
    };

    (next_location, next_scale.max(1e-6))
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
    median_of(&deviations)
}
