//! Blended backend (C5): dispatches the legacy/modern upstream adapters
//! according to `meta.api_backend`, tracking per-backend EWMA latency and
//! choosing a preferred backend with hysteresis once enough samples exist.
//! Modeled on `lib_common::core::upstream_manager`'s shared, lock-protected
//! mode state, generalized from a market-hours toggle to a latency-driven one.

use crate::adapters::{AdapterError, SiteRef, UpstreamAdapter};
use crate::model::{BackendKind, BackendStat, GaugeReading};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const EWMA_ALPHA: f64 = 0.2;
const PROBE_SAMPLE_FLOOR: u64 = 10;
const PREFERENCE_HYSTERESIS: f64 = 0.10;
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Outcome of one blended dispatch.
pub struct DispatchResult {
    pub readings: HashMap<String, GaugeReading>,
    pub backend_used: BackendKind,
    pub legacy_stats: BackendStat,
    pub modern_stats: BackendStat,
}

struct ProbeClock {
    last_probe_at: Option<Instant>,
}

/// Coordinates the two upstream adapters behind a single `api_backend`
/// policy. Holds no per-gauge state; `legacy_stats`/`modern_stats` and the
/// preferred backend are its entire mutable footprint.
pub struct BlendedBackend {
    legacy: Arc<dyn UpstreamAdapter>,
    modern: Arc<dyn UpstreamAdapter>,
    probe_interval: Duration,
    probe_clock: Mutex<ProbeClock>,
}

impl BlendedBackend {
    pub fn new(legacy: Arc<dyn UpstreamAdapter>, modern: Arc<dyn UpstreamAdapter>) -> Self {
        Self {
            legacy,
            modern,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_clock: Mutex::new(ProbeClock { last_probe_at: None }),
        }
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Dispatch according to `policy`, updating `legacy_stats`/`modern_stats`
    /// in place and returning the readings plus which backend was used.
    pub async fn dispatch(
        &self,
        policy: BackendKind,
        sites: &[SiteRef],
        modified_since: Option<&str>,
        legacy_stats: &mut BackendStat,
        modern_stats: &mut BackendStat,
    ) -> Result<DispatchResult, AdapterError> {
        match policy {
            BackendKind::Legacy => {
                let (readings, elapsed) = Self::timed_fetch(&self.legacy, sites, modified_since).await?;
                update_stats(legacy_stats, elapsed);
                Ok(DispatchResult {
                    readings,
                    backend_used: BackendKind::Legacy,
                    legacy_stats: *legacy_stats,
                    modern_stats: *modern_stats,
                })
            }
            BackendKind::Modern => {
                let (readings, elapsed) = Self::timed_fetch(&self.modern, sites, modified_since).await?;
                update_stats(modern_stats, elapsed);
                Ok(DispatchResult {
                    readings,
                    backend_used: BackendKind::Modern,
                    legacy_stats: *legacy_stats,
                    modern_stats: *modern_stats,
                })
            }
            BackendKind::Blended => {
                self.dispatch_blended(sites, modified_since, legacy_stats, modern_stats)
                    .await
            }
        }
    }

    /// Historical backfill (spec §6 `--backfill-hours`): not latency
    /// sensitive, so unlike `dispatch` this never races or probes — it
    /// simply asks whichever adapter the policy names (legacy for
    /// `Blended`, since that's the backend every deployment is guaranteed
    /// to have reachable).
    pub async fn backfill(
        &self,
        policy: BackendKind,
        sites: &[SiteRef],
        hours: u32,
        now: DateTime<Utc>,
    ) -> Result<HashMap<String, Vec<GaugeReading>>, AdapterError> {
        let adapter = match policy {
            BackendKind::Modern => &self.modern,
            BackendKind::Legacy | BackendKind::Blended => &self.legacy,
        };
        adapter.fetch_history(sites, hours, now).await
    }

    async fn dispatch_blended(
        &self,
        sites: &[SiteRef],
        modified_since: Option<&str>,
        legacy_stats: &mut BackendStat,
        modern_stats: &mut BackendStat,
    ) -> Result<DispatchResult, AdapterError> {
        let in_probe_mode = legacy_stats.samples < PROBE_SAMPLE_FLOOR
            || modern_stats.samples < PROBE_SAMPLE_FLOOR
            || preferred_backend(legacy_stats, modern_stats).is_none();

        if in_probe_mode {
            return self
                .race_both(sites, modified_since, legacy_stats, modern_stats)
                .await;
        }

        let preferred = preferred_backend(legacy_stats, modern_stats).unwrap_or(BackendKind::Legacy);
        let should_probe_other = {
            let mut clock = self.probe_clock.lock().await;
            let due = clock
                .last_probe_at
                .is_none_or(|t| t.elapsed() >= self.probe_interval);
            if due {
                clock.last_probe_at = Some(Instant::now());
            }
            due
        };

        let (preferred_adapter, other_adapter, preferred_is_legacy) = match preferred {
            BackendKind::Legacy => (&self.legacy, &self.modern, true),
            _ => (&self.modern, &self.legacy, false),
        };

        let primary = Self::timed_fetch(preferred_adapter, sites, modified_since);
        if should_probe_other {
            let secondary = Self::timed_fetch(other_adapter, sites, modified_since);
            let (primary_result, secondary_result) = tokio::join!(primary, secondary);
            let (readings, elapsed) = primary_result?;
            if preferred_is_legacy {
                update_stats(legacy_stats, elapsed);
            } else {
                update_stats(modern_stats, elapsed);
            }
            if let Ok((_, other_elapsed)) = secondary_result {
                if preferred_is_legacy {
                    update_stats(modern_stats, other_elapsed);
                } else {
                    update_stats(legacy_stats, other_elapsed);
                }
            }
            Ok(DispatchResult {
                readings,
                backend_used: preferred,
                legacy_stats: *legacy_stats,
                modern_stats: *modern_stats,
            })
        } else {
            let (readings, elapsed) = primary.await?;
            if preferred_is_legacy {
                update_stats(legacy_stats, elapsed);
            } else {
                update_stats(modern_stats, elapsed);
            }
            Ok(DispatchResult {
                readings,
                backend_used: preferred,
                legacy_stats: *legacy_stats,
                modern_stats: *modern_stats,
            })
        }
    }

    /// Probe phase: dispatch both concurrently and return as soon as either
    /// completes successfully, instead of blocking on both. The loser keeps
    /// running in its own task; if it finishes within a short grace period
    /// its timing still feeds the EWMA, otherwise it's abandoned.
    async fn race_both(
        &self,
        sites: &[SiteRef],
        modified_since: Option<&str>,
        legacy_stats: &mut BackendStat,
        modern_stats: &mut BackendStat,
    ) -> Result<DispatchResult, AdapterError> {
        const GRACE: Duration = Duration::from_millis(500);

        let sites_owned = sites.to_vec();
        let modified_since_owned = modified_since.map(str::to_string);

        let mut legacy_task = tokio::spawn(Self::timed_fetch_owned(
            self.legacy.clone(),
            sites_owned.clone(),
            modified_since_owned.clone(),
        ));
        let mut modern_task = tokio::spawn(Self::timed_fetch_owned(
            self.modern.clone(),
            sites_owned,
            modified_since_owned,
        ));

        tokio::select! {
            legacy_done = &mut legacy_task => {
                match legacy_done {
                    Ok(Ok((readings, elapsed))) => {
                        update_stats(legacy_stats, elapsed);
                        Self::await_loser(modern_task, modern_stats, GRACE).await;
                        Ok(DispatchResult {
                            readings,
                            backend_used: BackendKind::Legacy,
                            legacy_stats: *legacy_stats,
                            modern_stats: *modern_stats,
                        })
                    }
                    _ => match (&mut modern_task).await {
                        Ok(Ok((readings, elapsed))) => {
                            update_stats(modern_stats, elapsed);
                            Ok(DispatchResult {
                                readings,
                                backend_used: BackendKind::Modern,
                                legacy_stats: *legacy_stats,
                                modern_stats: *modern_stats,
                            })
                        }
                        _ => Err(AdapterError::Transport(
                            "both legacy and modern backends failed during probe".to_string(),
                        )),
                    },
                }
            }
            modern_done = &mut modern_task => {
                match modern_done {
                    Ok(Ok((readings, elapsed))) => {
                        update_stats(modern_stats, elapsed);
                        Self::await_loser(legacy_task, legacy_stats, GRACE).await;
                        Ok(DispatchResult {
                            readings,
                            backend_used: BackendKind::Modern,
                            legacy_stats: *legacy_stats,
                            modern_stats: *modern_stats,
                        })
                    }
                    _ => match (&mut legacy_task).await {
                        Ok(Ok((readings, elapsed))) => {
                            update_stats(legacy_stats, elapsed);
                            Ok(DispatchResult {
                                readings,
                                backend_used: BackendKind::Legacy,
                                legacy_stats: *legacy_stats,
                                modern_stats: *modern_stats,
                            })
                        }
                        _ => Err(AdapterError::Transport(
                            "both legacy and modern backends failed during probe".to_string(),
                        )),
                    },
                }
            }
        }
    }

    /// Give the backend that lost the race `grace` to finish on its own;
    /// feed its timing into `stats` if it makes it, otherwise abandon it.
    /// Its result, if any, is simply dropped; the winner already answered.
    async fn await_loser(
        mut loser: tokio::task::JoinHandle<Result<(HashMap<String, GaugeReading>, Duration), AdapterError>>,
        stats: &mut BackendStat,
        grace: Duration,
    ) {
        match tokio::time::timeout(grace, &mut loser).await {
            Ok(Ok(Ok((_, elapsed)))) => update_stats(stats, elapsed),
            Ok(_) => {}
            Err(_) => loser.abort(),
        }
    }

    async fn timed_fetch(
        adapter: &Arc<dyn UpstreamAdapter>,
        sites: &[SiteRef],
        modified_since: Option<&str>,
    ) -> Result<(HashMap<String, GaugeReading>, Duration), AdapterError> {
        let start = Instant::now();
        let readings = adapter.fetch(sites, modified_since).await?;
        Ok((readings, start.elapsed()))
    }

    async fn timed_fetch_owned(
        adapter: Arc<dyn UpstreamAdapter>,
        sites: Vec<SiteRef>,
        modified_since: Option<String>,
    ) -> Result<(HashMap<String, GaugeReading>, Duration), AdapterError> {
        let start = Instant::now();
        let readings = adapter.fetch(&sites, modified_since.as_deref()).await?;
        Ok((readings, start.elapsed()))
    }
}

fn update_stats(stats: &mut BackendStat, elapsed: Duration) {
    let sample_ms = elapsed.as_secs_f64() * 1000.0;
    if stats.samples == 0 {
        stats.ewma_latency_ms = sample_ms;
        stats.ewma_variance_ms2 = 0.0;
    } else {
        let delta = sample_ms - stats.ewma_latency_ms;
        stats.ewma_latency_ms += EWMA_ALPHA * delta;
        stats.ewma_variance_ms2 =
            (1.0 - EWMA_ALPHA) * (stats.ewma_variance_ms2 + EWMA_ALPHA * delta * delta);
    }
    stats.samples += 1;
}

/// The backend whose mean latency is lower by at least 10% (hysteresis);
/// `None` when there isn't yet enough signal to prefer one.
fn preferred_backend(legacy: &BackendStat, modern: &BackendStat) -> Option<BackendKind> {
    if legacy.samples == 0 || modern.samples == 0 {
        return None;
    }
    if modern.ewma_latency_ms <= legacy.ewma_latency_ms * (1.0 - PREFERENCE_HYSTERESIS) {
        Some(BackendKind::Modern)
    } else if legacy.ewma_latency_ms <= modern.ewma_latency_ms * (1.0 - PREFERENCE_HYSTERESIS) {
        Some(BackendKind::Legacy)
    } else {
        None
    }
}
