//! Bench equipment seen from the session: a power controller and a log sink,
//! located by bench name through [`EquipmentRegistry`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::app::error::AppError;

/// Power and USB-relay control for one device. Every call reports success as a bool.
pub trait PowerController: Send + Sync {
    fn connect_usb_host_to_dut(&self) -> bool;
    fn disconnect_usb_host_to_dut(&self) -> bool;
    fn plug_device_power(&self) -> bool;
    fn cut_device_power(&self) -> bool;
    fn poweron_device(&self) -> bool;
    fn poweroff_device(&self) -> bool;
    fn release(&self);
}

/// Bench without instruments: an operator handles power, requests are only logged.
#[derive(Debug, Clone)]
pub struct ManualPowerController {
    bench: String,
}

impl ManualPowerController {
    pub fn new(bench: impl Into<String>) -> Self {
        Self {
            bench: bench.into(),
        }
    }

    fn request(&self, action: &str) -> bool {
        info!(bench = %self.bench, action, "manual power request");
        true
    }
}

impl PowerController for ManualPowerController {
    fn connect_usb_host_to_dut(&self) -> bool {
        self.request("connect_usb_host_to_dut")
    }

    fn disconnect_usb_host_to_dut(&self) -> bool {
        self.request("disconnect_usb_host_to_dut")
    }

    fn plug_device_power(&self) -> bool {
        self.request("plug_device_power")
    }

    fn cut_device_power(&self) -> bool {
        self.request("cut_device_power")
    }

    fn poweron_device(&self) -> bool {
        self.request("poweron_device")
    }

    fn poweroff_device(&self) -> bool {
        self.request("poweroff_device")
    }

    fn release(&self) {
        info!(bench = %self.bench, "manual power controller released");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EquipmentKind {
    PowerController,
    LogSink,
}

#[derive(Clone)]
pub enum EquipmentHandle {
    Power(Arc<dyn PowerController>),
    /// Directory receiving captured device logs.
    LogSink(PathBuf),
}

impl EquipmentHandle {
    pub fn as_power(&self) -> Option<Arc<dyn PowerController>> {
        match self {
            EquipmentHandle::Power(power) => Some(Arc::clone(power)),
            EquipmentHandle::LogSink(_) => None,
        }
    }

    pub fn as_log_sink(&self) -> Option<PathBuf> {
        match self {
            EquipmentHandle::LogSink(path) => Some(path.clone()),
            EquipmentHandle::Power(_) => None,
        }
    }
}

pub type EquipmentFactory = Arc<dyn Fn(&str) -> Result<EquipmentHandle, AppError> + Send + Sync>;

struct RegistryState {
    factories: HashMap<(EquipmentKind, String), EquipmentFactory>,
    assignments: HashMap<(EquipmentKind, String), String>,
    cache: HashMap<(EquipmentKind, String), EquipmentHandle>,
}

/// Owns the equipment instances. Handles are cached per `(kind, bench)` so
/// identical lookups return the same instance until [`release_all`](Self::release_all).
pub struct EquipmentRegistry {
    state: Mutex<RegistryState>,
    trace_id: String,
}

pub const MANUAL_MODEL: &str = "manual";
pub const DIRECTORY_MODEL: &str = "directory";

impl EquipmentRegistry {
    pub fn new(report_root: impl Into<PathBuf>, trace_id: &str) -> Self {
        let registry = Self {
            state: Mutex::new(RegistryState {
                factories: HashMap::new(),
                assignments: HashMap::new(),
                cache: HashMap::new(),
            }),
            trace_id: trace_id.to_string(),
        };
        registry.register(
            EquipmentKind::PowerController,
            MANUAL_MODEL,
            Arc::new(|bench: &str| {
                Ok(EquipmentHandle::Power(Arc::new(ManualPowerController::new(bench))))
            }),
        );
        let report_root = report_root.into();
        registry.register(
            EquipmentKind::LogSink,
            DIRECTORY_MODEL,
            Arc::new(move |bench: &str| Ok(EquipmentHandle::LogSink(report_root.join(bench)))),
        );
        registry
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self, kind: EquipmentKind, model: &str, factory: EquipmentFactory) {
        self.lock().factories.insert((kind, model.to_string()), factory);
    }

    /// Chooses which registered model serves `kind` on `bench`.
    pub fn assign(&self, kind: EquipmentKind, bench: &str, model: &str) {
        let mut state = self.lock();
        state.cache.remove(&(kind, bench.to_string()));
        state
            .assignments
            .insert((kind, bench.to_string()), model.to_string());
    }

    pub fn get_equipment(&self, kind: EquipmentKind, bench: &str) -> Result<EquipmentHandle, AppError> {
        let key = (kind, bench.to_string());
        let mut state = self.lock();
        if let Some(handle) = state.cache.get(&key) {
            return Ok(handle.clone());
        }
        let model = state.assignments.get(&key).cloned().unwrap_or_else(|| match kind {
            EquipmentKind::PowerController => MANUAL_MODEL.to_string(),
            EquipmentKind::LogSink => DIRECTORY_MODEL.to_string(),
        });
        let factory = state
            .factories
            .get(&(kind, model.clone()))
            .cloned()
            .ok_or_else(|| {
                AppError::validation(
                    format!("No {kind:?} driver registered for model {model}"),
                    &self.trace_id,
                )
            })?;
        let handle = factory(bench)?;
        state.cache.insert(key, handle.clone());
        Ok(handle)
    }

    pub fn power_controller(&self, bench: &str) -> Result<Arc<dyn PowerController>, AppError> {
        self.get_equipment(EquipmentKind::PowerController, bench)?
            .as_power()
            .ok_or_else(|| AppError::system("Power controller lookup returned another kind", &self.trace_id))
    }

    pub fn log_sink(&self, bench: &str) -> Result<PathBuf, AppError> {
        self.get_equipment(EquipmentKind::LogSink, bench)?
            .as_log_sink()
            .ok_or_else(|| AppError::system("Log sink lookup returned another kind", &self.trace_id))
    }

    /// Releases every cached power controller and empties the cache.
    pub fn release_all(&self) {
        let handles: Vec<EquipmentHandle> = {
            let mut state = self.lock();
            state.cache.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            if let EquipmentHandle::Power(power) = handle {
                power.release();
            }
        }
        info!(trace_id = %self.trace_id, "equipment registry released");
    }
}
