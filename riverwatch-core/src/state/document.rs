//! The top-level persisted document shape: `{ meta, <gauge_id>: GaugeState,
//! forecast?, nwrfc? }` (spec §3/§6).

use crate::model::{CommunityPrior, GaugeState, Meta, OverlayState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The whole state document, as persisted to and loaded from disk.
///
/// `gauges` is flattened to top-level keys on the wire (each `gauge_id`
/// becomes its own object alongside `meta`), matching spec §6 exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    pub meta: Meta,
    #[serde(flatten)]
    pub gauges: BTreeMap<String, GaugeState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast: Option<BTreeMap<String, OverlayState>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nwrfc: Option<BTreeMap<String, CommunityPrior>>,
}

impl StateDocument {
    pub fn gauge(&self, gauge_id: &str) -> Option<&GaugeState> {
        self.gauges.get(gauge_id)
    }

    pub fn gauge_mut(&mut self, gauge_id: &str) -> &mut GaugeState {
        self.gauges.entry(gauge_id.to_string()).or_default()
    }

    pub fn overlay_mut(&mut self, gauge_id: &str) -> &mut OverlayState {
        self.forecast
            .get_or_insert_with(BTreeMap::new)
            .entry(gauge_id.to_string())
            .or_default()
    }

    /// Remove a dynamic gauge's state wholesale (spec §3 eviction rule).
    pub fn evict_gauge(&mut self, gauge_id: &str) {
        self.gauges.remove(gauge_id);
        if let Some(forecast) = self.forecast.as_mut() {
            forecast.remove(gauge_id);
        }
        if let Some(nwrfc) = self.nwrfc.as_mut() {
            nwrfc.remove(gauge_id);
        }
    }
}
