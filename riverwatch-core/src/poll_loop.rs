//! Poll loop (C10): the single task that owns state mutation. One iteration
//! is fetch -> per-gauge update -> scheduler recompute -> commit -> sleep,
//! exactly the self-scheduling shape of `cnn_polling::CnnPollingPlugin::run`,
//! generalized from a fixed delay to the adaptive scheduler, and the
//! `select!`-over-`broadcast::Receiver<()>` shutdown shape of
//! `yahoo_logic::monitor::run`.

use crate::adapters::SiteRef;
use crate::blended::{BlendedBackend, DispatchResult};
use crate::cadence;
use crate::clock::Clock;
use crate::community::{self, CommunityClient, SamplePayload};
use crate::error::CoreResult;
use crate::latency;
use crate::model::{BackendKind, Gauge, Observation};
use crate::overlay::OverlayFetcher;
use crate::scheduler::{self, ErrorBackoff};
use crate::state::{StateDocument, StateStore};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Minimum spacing in hours between historical backfills, independent of
/// how many hours of history each one asks for (spec §6: "at startup and
/// periodically (every ~6 hours)").
const BACKFILL_INTERVAL_HOURS: i64 = 6;

/// Non-blocking flags a UI sets to influence the next wake time, without
/// taking the write lock itself (spec §5 "a non-blocking write to a single
/// variable").
#[derive(Clone, Default)]
pub struct ManualOverrides {
    refresh_now: Arc<AtomicBool>,
    forced_refetch: Arc<AtomicBool>,
}

impl ManualOverrides {
    pub fn request_refresh_now(&self) {
        self.refresh_now.store(true, Ordering::SeqCst);
    }

    pub fn request_forced_refetch(&self) {
        self.forced_refetch.store(true, Ordering::SeqCst);
        self.refresh_now.store(true, Ordering::SeqCst);
    }

    fn take_refresh_now(&self) -> bool {
        self.refresh_now.swap(false, Ordering::SeqCst)
    }

    fn take_forced_refetch(&self) -> bool {
        self.forced_refetch.swap(false, Ordering::SeqCst)
    }
}

pub struct PollLoopConfig {
    pub state_path: PathBuf,
    pub min_retry_seconds: u64,
    pub max_retry_seconds: u64,
    pub backfill_hours: u32,
    pub api_backend: BackendKind,
    pub community_publish: bool,
}

pub struct PollLoop {
    gauges: Vec<Gauge>,
    backend: BlendedBackend,
    clock: Arc<dyn Clock>,
    config: PollLoopConfig,
    overrides: ManualOverrides,
    overlay: Option<OverlayFetcher>,
    community: Option<Arc<CommunityClient>>,
}

impl PollLoop {
    pub fn new(
        gauges: Vec<Gauge>,
        backend: BlendedBackend,
        clock: Arc<dyn Clock>,
        config: PollLoopConfig,
        overrides: ManualOverrides,
    ) -> Self {
        Self {
            gauges,
            backend,
            clock,
            config,
            overrides,
            overlay: None,
            community: None,
        }
    }

    /// Attach the optional forecast overlay fetcher (spec §4.9); skipped
    /// entirely if no `--forecast-base` was configured.
    pub fn with_overlay(mut self, overlay: OverlayFetcher) -> Self {
        self.overlay = Some(overlay);
        self
    }

    /// Attach the optional community priors client (spec §6); skipped
    /// entirely if no `--community-base` was configured.
    pub fn with_community(mut self, community: Arc<CommunityClient>) -> Self {
        self.community = Some(community);
        self
    }

    pub fn overrides(&self) -> ManualOverrides {
        self.overrides.clone()
    }

    /// Run the loop until `shutdown` fires. The caller is responsible for
    /// holding the [`crate::state::StateLock`] for the lifetime of this call.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> CoreResult<()> {
        let mut doc = StateStore::load(&self.config.state_path)?;
        let mut backoff = ErrorBackoff::new(self.config.min_retry_seconds, self.config.max_retry_seconds);

        loop {
            let sleep_duration = self.run_iteration(&mut doc, &mut backoff).await?;

            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("poll loop received shutdown signal, exiting");
                    return Ok(());
                }
                _ = tokio::time::sleep(sleep_duration) => {}
                _ = self.wait_for_refresh_flag() => {
                    log::debug!("poll loop woken by manual refresh/forced-refetch flag");
                }
            }
        }
    }

    /// Run exactly one fetch -> per-gauge update -> scheduler recompute ->
    /// commit cycle and return, for `--mode once` (spec §6: "one-shot
    /// table"). Loads and commits the state document itself.
    pub async fn run_once(&self) -> CoreResult<StateDocument> {
        let mut doc = StateStore::load(&self.config.state_path)?;
        let mut backoff = ErrorBackoff::new(self.config.min_retry_seconds, self.config.max_retry_seconds);
        self.run_iteration(&mut doc, &mut backoff).await?;
        Ok(doc)
    }

    /// One fetch/update/schedule/commit cycle; returns how long to sleep
    /// before the next one.
    async fn run_iteration(
        &self,
        doc: &mut StateDocument,
        backoff: &mut ErrorBackoff,
    ) -> CoreResult<std::time::Duration> {
        let forced = self.overrides.take_forced_refetch();
        self.overrides.take_refresh_now();

        let sites: Vec<SiteRef> = self
            .gauges
            .iter()
            .map(|g| SiteRef {
                gauge_id: g.gauge_id.clone(),
                site_no: g.site_no.clone(),
            })
            .collect();

        let poll_ts = self.clock.now_utc();
        self.backfill_if_due(doc, &sites, poll_ts).await;

        let modified_since = self.modified_since_param(doc);

        let mut legacy_stats = doc.meta.legacy_stats;
        let mut modern_stats = doc.meta.modern_stats;

        let dispatch = self
            .backend
            .dispatch(
                self.config.api_backend,
                &sites,
                modified_since.as_deref(),
                &mut legacy_stats,
                &mut modern_stats,
            )
            .await;

        doc.meta.last_fetch_at = Some(poll_ts);

        let sleep_duration = match dispatch {
            Ok(result) => {
                doc.meta.legacy_stats = result.legacy_stats;
                doc.meta.modern_stats = result.modern_stats;
                doc.meta.api_backend = self.config.api_backend;
                doc.meta.last_backend_used = Some(result.backend_used);
                doc.meta.last_success_at = Some(poll_ts);
                backoff.on_success();

                for gauge in &self.gauges {
                    if let Some(reading) = result.readings.get(&gauge.gauge_id) {
                        apply_reading(doc, &gauge.gauge_id, reading, poll_ts, forced);
                    }
                }

                if let Some(overlay) = &self.overlay {
                    for gauge in &self.gauges {
                        let overlay_state = doc.overlay_mut(&gauge.gauge_id);
                        overlay.refresh(gauge, None, overlay_state, poll_ts).await;
                    }
                }

                if let Some(community) = &self.community {
                    self.reconcile_community(doc, community, &result, poll_ts).await;
                }

                for gauge_id in doc.gauges.keys().cloned().collect::<Vec<_>>() {
                    let state = doc.gauge_mut(&gauge_id);
                    state.last_poll_ts = Some(poll_ts);
                    state.next_eta = crate::predictor::predict(state, poll_ts)
                        .map(|p| p.next_api_visible_at);
                }

                let proposals: Vec<_> = doc
                    .gauges
                    .values()
                    .filter_map(|g| scheduler::propose(g, poll_ts, self.config.min_retry_seconds))
                    .collect();
                let next = scheduler::earliest(&proposals)
                    .unwrap_or(poll_ts + chrono::Duration::seconds(self.config.min_retry_seconds as i64));
                doc.meta.next_poll_at = Some(next);

                (next - poll_ts).to_std().unwrap_or(std::time::Duration::ZERO)
            }
            Err(_e) => {
                doc.meta.last_failure_at = Some(poll_ts);
                let backoff_duration = backoff.on_failure();
                doc.meta.next_poll_at = Some(poll_ts + backoff_duration);
                backoff_duration.to_std().unwrap_or(std::time::Duration::ZERO)
            }
        };

        StateStore::save(doc, &self.config.state_path)?;
        Ok(sleep_duration)
    }

    /// Adopt low-confidence gauges' priors from the shared community
    /// summary, then (if enabled) publish this poll's fresh samples back.
    /// Both directions are best-effort: a fetch/publish failure never
    /// surfaces past `CommunityClient` (spec §6/§7).
    async fn reconcile_community(
        &self,
        doc: &mut StateDocument,
        client: &Arc<CommunityClient>,
        result: &DispatchResult,
        poll_ts: DateTime<Utc>,
    ) {
        if let Some(summary) = client.fetch_summary().await {
            for gauge in &self.gauges {
                if let Some(prior) = summary.stations.get(&gauge.site_no) {
                    let state = doc.gauge_mut(&gauge.gauge_id);
                    community::adopt_prior(state, prior);
                }
            }
        }

        if !self.config.community_publish {
            return;
        }
        for gauge in &self.gauges {
            let Some(reading) = result.readings.get(&gauge.gauge_id) else {
                continue;
            };
            let state = doc.gauge(&gauge.gauge_id);
            let Some((lower_sec, upper_sec)) = state.and_then(|s| s.latency_window) else {
                continue;
            };
            let latency_sec = state.map(|s| s.latency_loc_sec).unwrap_or(0.0);
            client
                .publish_sample(SamplePayload {
                    site_no: gauge.site_no.clone(),
                    obs_ts: reading.observed_at,
                    poll_ts,
                    lower_sec,
                    upper_sec,
                    latency_sec,
                })
                .await;
        }
    }

    /// Poll the refresh-now flag at a coarse interval; a flag set by the UI
    /// wakes the select without requiring a dedicated notify channel.
    async fn wait_for_refresh_flag(&self) {
        loop {
            if self.overrides.refresh_now.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    /// Run a historical backfill if one is due: never yet run, or more than
    /// [`BACKFILL_INTERVAL`] since the last one. Seeds each gauge's history
    /// with points older than anything already known, re-anchoring cadence
    /// from the enlarged window. Best-effort: a fetch failure just leaves
    /// `last_backfill_at` unset so the next iteration retries.
    async fn backfill_if_due(&self, doc: &mut StateDocument, sites: &[SiteRef], now: DateTime<Utc>) {
        let due = doc
            .meta
            .last_backfill_at
            .is_none_or(|t| now - t >= chrono::Duration::hours(BACKFILL_INTERVAL_HOURS));
        if !due || sites.is_empty() {
            return;
        }

        let history = match self
            .backend
            .backfill(self.config.api_backend, sites, self.config.backfill_hours, now)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                log::warn!("backfill fetch failed, will retry next iteration: {e}");
                return;
            }
        };

        for gauge in &self.gauges {
            if let Some(points) = history.get(&gauge.gauge_id) {
                merge_backfilled(doc.gauge_mut(&gauge.gauge_id), points);
            }
        }

        doc.meta.last_backfill_at = Some(now);
        log::info!(
            "backfill complete: {} hours of history across {} sites",
            self.config.backfill_hours,
            sites.len()
        );
    }

    /// `modifiedSince=<ISO-8601 duration>` is only safe to send once every
    /// gauge has been seen at least once and every gauge's cadence is ≤ 1h
    /// (spec §4.2).
    fn modified_since_param(&self, doc: &StateDocument) -> Option<String> {
        if self.gauges.is_empty() {
            return None;
        }
        let all_seen_and_fast = self.gauges.iter().all(|g| {
            doc.gauge(&g.gauge_id)
                .is_some_and(|s| s.last_timestamp.is_some() && s.mean_interval_sec <= 3600.0)
        });
        if !all_seen_and_fast {
            return None;
        }
        Some("PT1H".to_string())
    }
}

/// Fold a batch of historical readings into a gauge's state. Only points
/// strictly older than whatever the gauge already knows about are of any
/// use here (newer ones arrive through the live `fetch` path instead), so
/// anything at or after `last_timestamp` is skipped. Cadence is refit once
/// from the whole enlarged history rather than walked transition by
/// transition, since backfilled points carry no real poll-time visibility
/// latency to feed the latency estimator.
fn merge_backfilled(state: &mut crate::model::GaugeState, points: &[crate::model::GaugeReading]) {
    let floor = state.last_timestamp;
    let mut new_points: Vec<_> = points
        .iter()
        .filter(|p| floor.is_none_or(|f| p.observed_at < f))
        .collect();
    if new_points.is_empty() {
        return;
    }
    new_points.sort_by_key(|p| p.observed_at);

    let existing: std::collections::HashSet<DateTime<Utc>> =
        state.history.iter().map(|o| o.timestamp).collect();
    for point in new_points {
        if existing.contains(&point.observed_at) {
            continue;
        }
        state.history.push_back(Observation {
            timestamp: point.observed_at,
            stage: point.stage,
            flow: point.flow,
        });
    }

    let mut ordered: Vec<_> = state.history.iter().copied().collect();
    ordered.sort_by_key(|o| o.timestamp);
    ordered.dedup_by_key(|o| o.timestamp);
    if ordered.len() > crate::model::HISTORY_CAP {
        let drop = ordered.len() - crate::model::HISTORY_CAP;
        ordered.drain(0..drop);
    }
    state.history = ordered.into();

    if state.last_timestamp.is_none() {
        if let Some(latest) = state.history.back() {
            state.last_timestamp = Some(latest.timestamp);
            state.last_stage = latest.stage;
            state.last_flow = latest.flow;
        }
    }

    let timestamps: Vec<DateTime<Utc>> = state.history.iter().map(|o| o.timestamp).collect();
    let mut prev: Option<DateTime<Utc>> = None;
    for ts in timestamps {
        cadence::observe(state, prev, ts);
        prev = Some(ts);
    }
    cadence::refit_phase_from_history(state);
}

fn apply_reading(
    doc: &mut StateDocument,
    gauge_id: &str,
    reading: &crate::model::GaugeReading,
    poll_ts: DateTime<Utc>,
    forced: bool,
) {
    let state = doc.gauge_mut(gauge_id);
    let t_prev_poll = state.last_poll_ts;
    let prior_last_timestamp = state.last_timestamp;

    match prior_last_timestamp {
        Some(last_ts) if reading.observed_at > last_ts => {
            state.history.push_back(Observation {
                timestamp: reading.observed_at,
                stage: reading.stage,
                flow: reading.flow,
            });
            if state.history.len() > crate::model::HISTORY_CAP {
                state.history.pop_front();
            }
            state.last_timestamp = Some(reading.observed_at);
            if reading.stage.is_some() {
                state.last_stage = reading.stage;
            }
            if reading.flow.is_some() {
                state.last_flow = reading.flow;
            }
            state.polls_per_update_ewma = 0.25 * (state.no_update_polls + 1) as f64
                + 0.75 * state.polls_per_update_ewma;
            state.no_update_polls = 0;

            cadence::observe(state, Some(last_ts), reading.observed_at);
            latency::observe(state, reading.observed_at, t_prev_poll, poll_ts);
        }
        Some(last_ts) if reading.observed_at == last_ts => {
            if forced || reading.stage != state.last_stage || reading.flow != state.last_flow {
                if let Some(back) = state.history.back_mut() {
                    if reading.stage.is_some() {
                        back.stage = reading.stage;
                    }
                    if reading.flow.is_some() {
                        back.flow = reading.flow;
                    }
                }
                if reading.stage.is_some() {
                    state.last_stage = reading.stage;
                }
                if reading.flow.is_some() {
                    state.last_flow = reading.flow;
                }
            }
            state.no_update_polls += 1;
        }
        None => {
            state.history.push_back(Observation {
                timestamp: reading.observed_at,
                stage: reading.stage,
                flow: reading.flow,
            });
            state.last_timestamp = Some(reading.observed_at);
            state.last_stage = reading.stage;
            state.last_flow = reading.flow;
            cadence::observe(state, None, reading.observed_at);
        }
        _ => {
            state.no_update_polls += 1;
        }
    }
}
