//! # Upstream Adapters (C4)
//!
//! Two concrete query clients translating a "fetch latest observations for
//! this set of site numbers" request into `gauge_id -> GaugeReading`. Both
//! fail soft per spec §4.2: a transport or schema problem yields an empty
//! map plus a typed [`AdapterError`], never a panic.

pub mod legacy;
pub mod modern;

use crate::model::GaugeReading;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// One gauge's adapter-facing identity: the backend-specific site number
/// plus the `gauge_id` keying the output map.
#[derive(Debug, Clone)]
pub struct SiteRef {
    pub gauge_id: String,
    pub site_no: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("schema error: {0}")]
    Schema(String),
}

/// Capability set shared by the legacy and modern upstream clients (spec
/// §9: "dynamic dispatch over adapters").
#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    /// Human-readable backend name, used for logging and `last_backend_used`.
    fn name(&self) -> &'static str;

    /// Fetch the latest observation for each requested site, returning a
    /// best-effort map: sites with no readable data are simply absent from
    /// the result, never an error on their own.
    async fn fetch(
        &self,
        sites: &[SiteRef],
        modified_since: Option<&str>,
    ) -> Result<HashMap<String, GaugeReading>, AdapterError>;

    /// Fetch up to `hours` of history per requested site, ending at `now`,
    /// for the poll loop's startup/periodic backfill (spec §6
    /// `--backfill-hours`: "hours of history... to re-anchor cadence").
    /// Returns each gauge's points in ascending timestamp order; a site
    /// with no readable history is simply absent from the result.
    async fn fetch_history(
        &self,
        sites: &[SiteRef],
        hours: u32,
        now: DateTime<Utc>,
    ) -> Result<HashMap<String, Vec<GaugeReading>>, AdapterError>;
}
