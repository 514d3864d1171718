//! Legacy key/value query service adapter.
//!
//! Single batched GET with `sites=<comma>&parameterCd=00060,00065&format=json`,
//! parsing a nested `value.timeSeries[*].values[0].value[*]` structure keyed
//! by variable code (00065 stage, 00060 flow) and `site_no`. Modeled on the
//! single-`ApiClient`-plus-hand-rolled-parser shape of
//! `lib_common::markets::nasdaq::apicall`.

use crate::adapters::{AdapterError, SiteRef, UpstreamAdapter};
use crate::http::{HttpClient, HttpOutcome};
use crate::model::GaugeReading;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

const STAGE_CODE: &str = "00065";
const FLOW_CODE: &str = "00060";

pub struct LegacyAdapter {
    http: Arc<HttpClient>,
    base_url: Url,
}

impl LegacyAdapter {
    pub fn new(http: Arc<HttpClient>, base_url: Url) -> Self {
        Self { http, base_url }
    }
}

#[derive(Debug, Deserialize)]
struct LegacyResponse {
    value: LegacyValue,
}

#[derive(Debug, Deserialize)]
struct LegacyValue {
    #[serde(rename = "timeSeries", default)]
    time_series: Vec<LegacyTimeSeries>,
}

#[derive(Debug, Deserialize)]
struct LegacyTimeSeries {
    #[serde(rename = "sourceInfo")]
    source_info: LegacySourceInfo,
    variable: LegacyVariable,
    values: Vec<LegacyValuesBlock>,
}

#[derive(Debug, Deserialize)]
struct LegacySourceInfo {
    #[serde(rename = "siteCode")]
    site_code: Vec<LegacySiteCode>,
}

#[derive(Debug, Deserialize)]
struct LegacySiteCode {
    value: String,
}

#[derive(Debug, Deserialize)]
struct LegacyVariable {
    #[serde(rename = "variableCode")]
    variable_code: Vec<LegacyVariableCode>,
}

#[derive(Debug, Deserialize)]
struct LegacyVariableCode {
    value: String,
}

#[derive(Debug, Deserialize)]
struct LegacyValuesBlock {
    #[serde(default)]
    value: Vec<LegacyPoint>,
}

#[derive(Debug, Deserialize)]
struct LegacyPoint {
    value: String,
    #[serde(rename = "dateTime")]
    date_time: DateTime<Utc>,
}

#[async_trait]
impl UpstreamAdapter for LegacyAdapter {
    fn name(&self) -> &'static str {
        "legacy"
    }

    async fn fetch(
        &self,
        sites: &[SiteRef],
        modified_since: Option<&str>,
    ) -> Result<HashMap<String, GaugeReading>, AdapterError> {
        if sites.is_empty() {
            return Ok(HashMap::new());
        }

        let site_list = sites
            .iter()
            .map(|s| s.site_no.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let mut url = self.base_url.clone();
        {
            let mut qs = url.query_pairs_mut();
            qs.append_pair("sites", &site_list);
            qs.append_pair("parameterCd", &format!("{FLOW_CODE},{STAGE_CODE}"));
            qs.append_pair("format", "json");
            if let Some(since) = modified_since {
                qs.append_pair("modifiedSince", since);
            }
        }

        let outcome = self
            .http
            .get_json::<LegacyResponse>(url)
            .await
            .map_err(|e| AdapterError::Transport(e.0))?;

        let body = match outcome {
            HttpOutcome::Ok(body) => body,
            HttpOutcome::Status { status, body } => {
                return Err(AdapterError::Transport(format!(
                    "legacy backend returned status {status}: {body}"
                )))
            }
            HttpOutcome::SchemaMismatch { detail, .. } => {
                return Err(AdapterError::Schema(detail))
            }
        };

        let site_to_gauge: HashMap<&str, &str> = sites
            .iter()
            .map(|s| (s.site_no.as_str(), s.gauge_id.as_str()))
            .collect();

        // gauge_id -> (stage, flow, timestamp-of-latest-field-seen)
        let mut acc: HashMap<String, (Option<f64>, Option<f64>, Option<DateTime<Utc>>)> =
            HashMap::new();

        for series in body.value.time_series {
            let Some(site_code) = series.source_info.site_code.first() else {
                continue;
            };
            let Some(gauge_id) = site_to_gauge.get(site_code.value.as_str()) else {
                continue;
            };
            let Some(var_code) = series.variable.variable_code.first() else {
                continue;
            };
            let Some(point) = series.values.first().and_then(|v| v.value.first()) else {
                continue;
            };
            let Ok(parsed) = point.value.parse::<f64>() else {
                continue;
            };

            let entry = acc.entry(gauge_id.to_string()).or_insert((None, None, None));
            match var_code.value.as_str() {
                STAGE_CODE => entry.0 = Some(parsed),
                FLOW_CODE => entry.1 = Some(parsed),
                _ => continue,
            }
            entry.2 = Some(entry.2.map_or(point.date_time, |t| t.max(point.date_time)));
        }

        Ok(acc
            .into_iter()
            .filter_map(|(gauge_id, (stage, flow, observed_at))| {
                observed_at.map(|observed_at| {
                    (
                        gauge_id,
                        GaugeReading {
                            observed_at,
                            stage,
                            flow,
                        },
                    )
                })
            })
            .collect())
    }

    /// Same request shape as `fetch`, but with `period=PT{hours}H` instead
    /// of `modifiedSince`, and keeping every point `values[*].value[*]`
    /// returns instead of only the first (most recent) one.
    async fn fetch_history(
        &self,
        sites: &[SiteRef],
        hours: u32,
        _now: DateTime<Utc>,
    ) -> Result<HashMap<String, Vec<GaugeReading>>, AdapterError> {
        if sites.is_empty() {
            return Ok(HashMap::new());
        }

        let site_list = sites
            .iter()
            .map(|s| s.site_no.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let mut url = self.base_url.clone();
        {
            let mut qs = url.query_pairs_mut();
            qs.append_pair("sites", &site_list);
            qs.append_pair("parameterCd", &format!("{FLOW_CODE},{STAGE_CODE}"));
            qs.append_pair("format", "json");
            qs.append_pair("period", &format!("PT{hours}H"));
        }

        let outcome = self
            .http
            .get_json::<LegacyResponse>(url)
            .await
            .map_err(|e| AdapterError::Transport(e.0))?;

        let body = match outcome {
            HttpOutcome::Ok(body) => body,
            HttpOutcome::Status { status, body } => {
                return Err(AdapterError::Transport(format!(
                    "legacy backend returned status {status}: {body}"
                )))
            }
            HttpOutcome::SchemaMismatch { detail, .. } => {
                return Err(AdapterError::Schema(detail))
            }
        };

        let site_to_gauge: HashMap<&str, &str> = sites
            .iter()
            .map(|s| (s.site_no.as_str(), s.gauge_id.as_str()))
            .collect();

        // gauge_id -> timestamp -> (stage, flow)
        let mut acc: HashMap<String, std::collections::BTreeMap<DateTime<Utc>, (Option<f64>, Option<f64>)>> =
            HashMap::new();

        for series in body.value.time_series {
            let Some(site_code) = series.source_info.site_code.first() else {
                continue;
            };
            let Some(gauge_id) = site_to_gauge.get(site_code.value.as_str()) else {
                continue;
            };
            let Some(var_code) = series.variable.variable_code.first() else {
                continue;
            };

            let by_ts = acc.entry(gauge_id.to_string()).or_default();
            for block in &series.values {
                for point in &block.value {
                    let Ok(parsed) = point.value.parse::<f64>() else {
                        continue;
                    };
                    let entry = by_ts.entry(point.date_time).or_insert((None, None));
                    match var_code.value.as_str() {
                        STAGE_CODE => entry.0 = Some(parsed),
                        FLOW_CODE => entry.1 = Some(parsed),
                        _ => {}
                    }
                }
            }
        }

        Ok(acc
            .into_iter()
            .map(|(gauge_id, by_ts)| {
                let points = by_ts
                    .into_iter()
                    .map(|(observed_at, (stage, flow))| GaugeReading {
                        observed_at,
                        stage,
                        flow,
                    })
                    .collect();
                (gauge_id, points)
            })
            .collect())
    }
}
