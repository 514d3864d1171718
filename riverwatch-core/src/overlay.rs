//! Overlay store (C11): optional per-gauge forecast / cross-check series.
//! Never blocks the poll loop — a failed refresh just leaves previous data
//! intact (spec §4.9).

use crate::http::{HttpClient, HttpOutcome};
use crate::model::{Gauge, Observation, OverlayState, OverlaySummary};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use url::Url;

const REFRESH_INTERVAL_SECS: i64 = 60 * 60;

pub struct OverlayFetcher {
    http: Arc<HttpClient>,
    url_template: String,
    horizon_hours: u32,
}

/// Lenient point shape: numeric strings coerce to floats, missing values to
/// `None` (spec §4.9 "lenient coercion").
#[derive(Debug, Deserialize)]
struct RawPoint {
    timestamp: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient_f64")]
    stage: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    flow: Option<f64>,
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Number(f64),
        Text(String),
        Null,
    }
    Ok(match Option::<Lenient>::deserialize(deserializer)? {
        Some(Lenient::Number(n)) => Some(n),
        Some(Lenient::Text(s)) => s.trim().parse::<f64>().ok(),
        Some(Lenient::Null) | None => None,
    })
}

impl OverlayFetcher {
    pub fn new(http: Arc<HttpClient>, url_template: String, horizon_hours: u32) -> Self {
        Self {
            http,
            url_template,
            horizon_hours,
        }
    }

    fn resolve_url(&self, gauge: &Gauge, nws_lid: Option<&str>) -> Option<Url> {
        let resolved = self
            .url_template
            .replace("{gauge_id}", &gauge.gauge_id)
            .replace("{site_no}", &gauge.site_no)
            .replace("{nws_lid}", nws_lid.unwrap_or(""));
        Url::parse(&resolved).ok()
    }

    /// Refresh `state` for one gauge if the rate limit allows, always
    /// leaving prior data in place on any failure.
    pub async fn refresh(&self, gauge: &Gauge, nws_lid: Option<&str>, state: &mut OverlayState, now: DateTime<Utc>) {
        if let Some(last) = state.last_refresh_at {
            if now - last < Duration::seconds(REFRESH_INTERVAL_SECS) {
                return;
            }
        }

        let Some(url) = self.resolve_url(gauge, nws_lid) else {
            return;
        };

        let points = match self.http.get_json::<Vec<RawPoint>>(url).await {
            Ok(HttpOutcome::Ok(points)) => points,
            _ => return,
        };

        merge_points(state, points, now, self.horizon_hours);
        state.last_refresh_at = Some(now);
    }

    /// Rate-limit probe for tests/diagnostics: whether a refresh attempted
    /// right now would actually dispatch.
    pub fn would_refresh(&self, state: &OverlayState, now: DateTime<Utc>) -> bool {
        state
            .last_refresh_at
            .is_none_or(|last| now - last >= Duration::seconds(REFRESH_INTERVAL_SECS))
    }
}

fn merge_points(state: &mut OverlayState, incoming: Vec<RawPoint>, now: DateTime<Utc>, horizon_hours: u32) {
    use std::collections::BTreeMap;
    let mut by_ts: BTreeMap<DateTime<Utc>, Observation> = state
        .points
        .iter()
        .map(|obs| (obs.timestamp, *obs))
        .collect();

    for point in incoming {
        by_ts.insert(
            point.timestamp,
            Observation {
                timestamp: point.timestamp,
                stage: point.stage,
                flow: point.flow,
            },
        );
    }

    let horizon = Duration::hours(horizon_hours as i64);
    let lower_bound = now - horizon;
    let upper_bound = now + horizon;

    state.points = by_ts
        .into_values()
        .filter(|obs| obs.timestamp >= lower_bound && obs.timestamp <= upper_bound)
        .collect();
}

/// Compute read-only summaries over a merged overlay series plus recent
/// observed history (spec §4.9 step 4).
pub fn summarize(
    overlay: &OverlayState,
    history: &std::collections::VecDeque<Observation>,
    now: DateTime<Utc>,
) -> OverlaySummary {
    let max_stage_3h = max_in_window(&overlay.points, now - Duration::hours(3), now, |o| o.stage);
    let max_flow_3h = max_in_window(&overlay.points, now - Duration::hours(3), now, |o| o.flow);
    let max_stage_24h = max_in_window(&overlay.points, now - Duration::hours(24), now, |o| o.stage);
    let max_flow_24h = max_in_window(&overlay.points, now - Duration::hours(24), now, |o| o.flow);
    let max_stage_full = overlay.points.iter().filter_map(|o| o.stage).fold(None, max_opt);
    let max_flow_full = overlay.points.iter().filter_map(|o| o.flow).fold(None, max_opt);

    let latest_observed = history.back();
    let nearest_forecast = latest_observed.and_then(|obs| nearest_point(&overlay.points, obs.timestamp));

    let amplitude_bias_stage = match (latest_observed.and_then(|o| o.stage), nearest_forecast.and_then(|p| p.stage)) {
        (Some(observed), Some(forecast)) => Some(observed - forecast),
        _ => None,
    };
    let amplitude_ratio_stage = match (latest_observed.and_then(|o| o.stage), nearest_forecast.and_then(|p| p.stage)) {
        (Some(observed), Some(forecast)) if forecast.abs() > 1e-9 => Some(observed / forecast),
        _ => None,
    };

    let observed_peak = history
        .iter()
        .filter_map(|o| o.stage.map(|s| (o.timestamp, s)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
    let forecast_peak = overlay
        .points
        .iter()
        .filter_map(|o| o.stage.map(|s| (o.timestamp, s)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
    let peak_time_offset_sec = match (observed_peak, forecast_peak) {
        (Some((ot, _)), Some((ft, _))) => Some((ft - ot).num_seconds()),
        _ => None,
    };

    OverlaySummary {
        max_stage_3h,
        max_flow_3h,
        max_stage_24h,
        max_flow_24h,
        max_stage_full,
        max_flow_full,
        amplitude_bias_stage,
        amplitude_ratio_stage,
        peak_time_offset_sec,
    }
}

fn max_in_window(
    points: &std::collections::VecDeque<Observation>,
    lower: DateTime<Utc>,
    upper: DateTime<Utc>,
    extract: impl Fn(&Observation) -> Option<f64>,
) -> Option<f64> {
    points
        .iter()
        .filter(|o| o.timestamp >= lower && o.timestamp <= upper)
        .filter_map(extract)
        .fold(None, max_opt)
}

fn max_opt(acc: Option<f64>, value: f64) -> Option<f64> {
    Some(acc.map_or(value, |a| a.max(value)))
}

fn nearest_point(points: &std::collections::VecDeque<Observation>, target: DateTime<Utc>) -> Option<&Observation> {
    points.iter().min_by_key(|o| (o.timestamp - target).num_milliseconds().abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs)
    }

    #[test]
    fn merge_points_dedupes_by_timestamp_last_wins() {
        let mut state = OverlayState::default();
        state.points.push_back(Observation { timestamp: ts(0), stage: Some(1.0), flow: None });

        merge_points(
            &mut state,
            vec![RawPoint { timestamp: ts(0), stage: Some(2.0), flow: Some(5.0) }],
            ts(0),
            72,
        );

        assert_eq!(state.points.len(), 1);
        assert_eq!(state.points[0].stage, Some(2.0));
        assert_eq!(state.points[0].flow, Some(5.0));
    }

    #[test]
    fn merge_points_trims_outside_horizon() {
        let mut state = OverlayState::default();
        merge_points(
            &mut state,
            vec![
                RawPoint { timestamp: ts(-1_000_000), stage: Some(1.0), flow: None },
                RawPoint { timestamp: ts(0), stage: Some(2.0), flow: None },
            ],
            ts(0),
            1,
        );
        assert_eq!(state.points.len(), 1);
        assert_eq!(state.points[0].timestamp, ts(0));
    }

    #[test]
    fn summarize_computes_window_maxima() {
        let mut overlay = OverlayState::default();
        overlay.points.push_back(Observation { timestamp: ts(0), stage: Some(3.0), flow: Some(10.0) });
        overlay.points.push_back(Observation { timestamp: ts(3600 * 2), stage: Some(9.0), flow: Some(20.0) });

        let history = std::collections::VecDeque::new();
        let summary = summarize(&overlay, &history, ts(3600 * 2));
        assert_eq!(summary.max_stage_3h, Some(9.0));
        assert_eq!(summary.max_stage_24h, Some(9.0));
        assert_eq!(summary.max_stage_full, Some(9.0));
    }
}
