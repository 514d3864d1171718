//! Community priors aggregator (optional, spec §6): consumes a shared
//! `summary.json` of other installations' cadence/latency fits, and
//! fire-and-forget publishes this installation's own samples. Built on the
//! same `HttpClient` as the upstream adapters.

use crate::http::{HttpClient, HttpOutcome};
use crate::model::{CommunityPrior, GaugeState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use url::Url;

const MIN_LATENCY_SAMPLES_FOR_CONFIDENCE: usize = 3;
const CADENCE_FIT_CONFIDENCE_FLOOR: f64 = 0.6;
const SUMMARY_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Deserialize)]
pub struct SummaryResponse {
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    pub stations: HashMap<String, CommunityPrior>,
}

#[derive(Debug, Serialize)]
pub struct SamplePayload {
    pub site_no: String,
    pub obs_ts: DateTime<Utc>,
    pub poll_ts: DateTime<Utc>,
    pub lower_sec: f64,
    pub upper_sec: f64,
    pub latency_sec: f64,
}

pub struct CommunityClient {
    http: Arc<HttpClient>,
    base_url: Url,
    last_summary_fetch: Mutex<Option<Instant>>,
}

impl CommunityClient {
    pub fn new(http: Arc<HttpClient>, base_url: Url) -> Self {
        Self {
            http,
            base_url,
            last_summary_fetch: Mutex::new(None),
        }
    }

    /// Fetch `summary.json`, rate-limited to once per 24h; returns `None`
    /// both when skipped by the rate limit and on any fetch/parse failure.
    pub async fn fetch_summary(&self) -> Option<SummaryResponse> {
        {
            let mut last = self.last_summary_fetch.lock().await;
            let due = last.is_none_or(|t| t.elapsed() >= SUMMARY_REFRESH_INTERVAL);
            if !due {
                return None;
            }
            *last = Some(Instant::now());
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut().ok()?.push("summary.json");

        match self.http.get_json::<SummaryResponse>(url).await {
            Ok(HttpOutcome::Ok(body)) => Some(body),
            _ => None,
        }
    }

    /// Fire-and-forget publish of one gauge's latest sample; failures are
    /// ignored per spec §6/§7.
    pub async fn publish_sample(&self, sample: SamplePayload) {
        let mut url = self.base_url.clone();
        let Some(mut segments) = url.path_segments_mut().ok() else {
            return;
        };
        segments.push("sample");
        drop(segments);
        let _ = self.http.post_json(url, &sample).await;
    }
}

/// Local confidence is considered low when there aren't enough latency
/// samples or the cadence grid-fit is weak — the only case a remote prior is
/// adopted (spec §6).
pub fn is_locally_low_confidence(gauge: &GaugeState) -> bool {
    gauge.latency_samples.len() < MIN_LATENCY_SAMPLES_FOR_CONFIDENCE
        || gauge.cadence_fit < CADENCE_FIT_CONFIDENCE_FLOOR
}

/// Adopt a remote prior into local gauge state, only if local confidence is
/// low. Returns whether the prior was applied.
pub fn adopt_prior(gauge: &mut GaugeState, prior: &CommunityPrior) -> bool {
    if !is_locally_low_confidence(gauge) {
        return false;
    }
    gauge.cadence_mult = prior.cadence_mult;
    gauge.cadence_fit = prior.cadence_fit;
    gauge.phase_offset_sec = prior.phase_offset_sec;
    gauge.latency_loc_sec = prior.latency_loc_sec;
    gauge.latency_scale_sec = prior.latency_scale_sec;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confident_gauge() -> GaugeState {
        let mut g = GaugeState::default();
        g.cadence_fit = 0.9;
        for _ in 0..5 {
            g.latency_samples.push_back(600.0);
        }
        g
    }

    #[test]
    fn confident_gauge_rejects_remote_prior() {
        let mut gauge = confident_gauge();
        let prior = CommunityPrior {
            cadence_mult: Some(4),
            cadence_fit: 0.95,
            phase_offset_sec: Some(120.0),
            latency_loc_sec: 700.0,
            latency_scale_sec: 50.0,
            samples: 1000,
            updated_at: Utc::now(),
        };
        assert!(!adopt_prior(&mut gauge, &prior));
        assert_eq!(gauge.cadence_fit, 0.9);
    }

    #[test]
    fn low_confidence_gauge_adopts_remote_prior() {
        let mut gauge = GaugeState::default();
        let prior = CommunityPrior {
            cadence_mult: Some(4),
            cadence_fit: 0.95,
            phase_offset_sec: Some(120.0),
            latency_loc_sec: 700.0,
            latency_scale_sec: 50.0,
            samples: 1000,
            updated_at: Utc::now(),
        };
        assert!(adopt_prior(&mut gauge, &prior));
        assert_eq!(gauge.cadence_mult, Some(4));
        assert_eq!(gauge.latency_loc_sec, 700.0);
    }
}
