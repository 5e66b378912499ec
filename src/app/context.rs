use std::path::PathBuf;
use std::sync::Arc;

use crate::app::equipment::EquipmentRegistry;
use crate::app::locks::DeviceLocks;
use crate::app::metrics::{CampaignMetrics, CounterMetrics};

/// Shared bench state handed to every session built for a campaign.
#[derive(Clone)]
pub struct BenchContext {
    pub equipment: Arc<EquipmentRegistry>,
    pub locks: Arc<DeviceLocks>,
    pub metrics: Arc<dyn CampaignMetrics>,
}

impl BenchContext {
    pub fn new(report_root: impl Into<PathBuf>, trace_id: &str) -> Self {
        Self {
            equipment: Arc::new(EquipmentRegistry::new(report_root, trace_id)),
            locks: Arc::new(DeviceLocks::new()),
            metrics: Arc::new(CounterMetrics::new()),
        }
    }
}
