//! Load/save/lock operations over a [`StateDocument`], plus the
//! normalization pass `load()` always applies (spec §4.1).

use crate::error::{CoreError, CoreResult};
use crate::model::{GaugeState, MEAN_INTERVAL_MAX_SEC, MEAN_INTERVAL_MIN_SEC};
use crate::state::document::StateDocument;
use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

/// Handle to the advisory lock on `<path>.lock`. Releases on `Drop`, so a
/// panic or early return still frees the lock (spec §9 "scoped
/// acquisition").
pub struct StateLock {
    lock_path: PathBuf,
    /// `None` on platforms/filesystems where advisory locking isn't
    /// available; the caller is then the sole writer by convention.
    held: bool,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if self.held {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

/// Durable JSON document store with single-writer protection.
pub struct StateStore;

impl StateStore {
    /// Acquire an exclusive lock on `<path>.lock`.
    ///
    /// Implemented with `O_CREAT|O_EXCL` semantics via
    /// [`OpenOptions::create_new`], which is atomic on every platform Rust
    /// supports and needs no platform-specific advisory-lock syscall. If
    /// the lock file already exists, a second writer is in progress and
    /// this returns [`CoreError::LockContended`].
    pub fn acquire_lock(path: &Path) -> CoreResult<StateLock> {
        let lock_path = Self::lock_path(path);
        match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(_) => Ok(StateLock {
                lock_path,
                held: true,
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(CoreError::LockContended { path: path.to_path_buf() })
            }
            Err(e) => Err(CoreError::Io {
                path: lock_path,
                source: e,
            }),
        }
    }

    pub fn release_lock(lock: StateLock) {
        drop(lock);
    }

    fn lock_path(path: &Path) -> PathBuf {
        let mut s = path.as_os_str().to_owned();
        s.push(".lock");
        PathBuf::from(s)
    }

    /// Load the document at `path`, or a fresh default if absent.
    ///
    /// Never fails on a corrupt document: a parse failure falls back to
    /// `StateDocument::default()` with `meta.load_repaired = true`.
    /// IO errors other than "not found" are surfaced.
    pub fn load(path: &Path) -> CoreResult<StateDocument> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(StateDocument::default());
            }
            Err(e) => {
                return Err(CoreError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let mut doc = match serde_json::from_str::<StateDocument>(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!("state file {path:?} failed to parse ({e}), starting from a fresh document");
                let mut doc = StateDocument::default();
                doc.meta.load_repaired = true;
                doc
            }
        };

        normalize(&mut doc);
        Ok(doc)
    }

    /// Atomically write `doc` to `path` via a sibling `.tmp` file + rename.
    pub fn save(doc: &StateDocument, path: &Path) -> CoreResult<()> {
        let tmp_path = {
            let mut s = path.as_os_str().to_owned();
            s.push(".tmp");
            PathBuf::from(s)
        };

        let body = serde_json::to_vec_pretty(doc).expect("StateDocument is always serializable");
        fs::write(&tmp_path, &body).map_err(|e| CoreError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
        fs::rename(&tmp_path, path).map_err(|e| CoreError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }
}

/// Repair a freshly loaded document in place: dedupe/reorder history, clamp
/// `mean_interval_sec`, drop incoherent `cadence_mult`, and realign the
/// `last_*` fields to the most recent history entry.
fn normalize(doc: &mut StateDocument) {
    for gauge in doc.gauges.values_mut() {
        normalize_gauge(gauge);
    }
}

fn normalize_gauge(gauge: &mut GaugeState) {
    // Dedupe by timestamp, keeping the latest values seen for each, then
    // sort ascending and cap at HISTORY_CAP.
    use std::collections::BTreeMap;
    let mut by_ts: BTreeMap<chrono::DateTime<chrono::Utc>, crate::model::Observation> =
        BTreeMap::new();
    for obs in gauge.history.drain(..) {
        by_ts.insert(obs.timestamp, obs);
    }
    let mut ordered: Vec<_> = by_ts.into_values().collect();
    if ordered.len() > crate::model::HISTORY_CAP {
        let drop = ordered.len() - crate::model::HISTORY_CAP;
        ordered.drain(0..drop);
    }
    gauge.history = ordered.into();

    if let Some(last) = gauge.history.back() {
        gauge.last_timestamp = Some(last.timestamp);
        if last.stage.is_some() {
            gauge.last_stage = last.stage;
        }
        if last.flow.is_some() {
            gauge.last_flow = last.flow;
        }
    }

    gauge.mean_interval_sec = gauge
        .mean_interval_sec
        .clamp(MEAN_INTERVAL_MIN_SEC, MEAN_INTERVAL_MAX_SEC);

    if let Some(_mult) = gauge.cadence_mult {
        if gauge.cadence_fit < 0.6 {
            gauge.cadence_mult = None;
            gauge.phase_offset_sec = None;
            gauge.cadence_fit = 0.0;
        }
    }

    if gauge.latency_scale_sec <= 0.0 {
        gauge.latency_scale_sec = 100.0;
    }

    if gauge.latency_samples.len() > crate::model::LATENCY_SAMPLES_CAP {
        let drop = gauge.latency_samples.len() - crate::model::LATENCY_SAMPLES_CAP;
        for _ in 0..drop {
            gauge.latency_samples.pop_front();
        }
    }
}
