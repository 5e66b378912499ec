use std::collections::HashMap;
use std::sync::Mutex;

pub const UNEXPECTED_REBOOT_COUNT: &str = "unexpected_reboot_count";
pub const WATCHDOG_DISCONNECT_COUNT: &str = "watchdog_disconnect_count";
pub const BOOT_FAILURE_COUNT: &str = "boot_failures";

/// Campaign-wide counters. The watchdog only ever increments.
pub trait CampaignMetrics: Send + Sync {
    fn increment(&self, name: &str);
    fn get(&self, name: &str) -> u64;
}

#[derive(Debug, Default)]
pub struct CounterMetrics {
    counters: Mutex<HashMap<String, u64>>,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl CampaignMetrics for CounterMetrics {
    fn increment(&self, name: &str) {
        let mut guard = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard.entry(name.to_string()).or_insert(0) += 1;
    }

    fn get(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .ok()
            .and_then(|guard| guard.get(name).copied())
            .unwrap_or(0)
    }
}
