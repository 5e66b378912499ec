//! Read-once device facts collected on connect.

use std::collections::HashMap;

use serde::Serialize;

use crate::app::adb::parse::parse_kernel_version;

pub const NOT_AVAILABLE: &str = "not available";

const IMEI_KEYS: [&str; 3] = ["ril.IMEI", "persist.radio.device.imei", "ril.barcode"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProperties {
    pub board_type: String,
    pub device_id: String,
    pub serial_number: String,
    pub image_variant: String,
    pub build_description: String,
    pub product_name: String,
    pub imei: String,
    pub baseband_version: String,
    pub kernel_version: String,
    pub firmware_version: String,
    pub agent_version: String,
    pub hardware: String,
}

impl DeviceProperties {
    /// Builds the snapshot from a `getprop` map and the `/proc/version` text.
    pub fn from_getprop(
        props: &HashMap<String, String>,
        proc_version: Option<&str>,
        serial_number: &str,
        agent_version_key: &str,
    ) -> Self {
        let get = |key: &str| lookup(props, key).unwrap_or_else(|| NOT_AVAILABLE.to_string());
        let imei = IMEI_KEYS
            .iter()
            .find_map(|key| lookup(props, key))
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());
        let kernel_version = proc_version
            .and_then(parse_kernel_version)
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());
        let serial_number = if serial_number.trim().is_empty() {
            get("ro.serialno")
        } else {
            serial_number.trim().to_string()
        };
        Self {
            board_type: get("ro.product.board"),
            device_id: get("ro.serialno"),
            serial_number,
            image_variant: get("ro.build.type"),
            build_description: get("ro.build.description"),
            product_name: get("ro.product.name"),
            imei,
            baseband_version: get("gsm.version.baseband"),
            kernel_version,
            firmware_version: get("ro.bootloader"),
            agent_version: get(agent_version_key),
            hardware: get("ro.boot.hardware"),
        }
    }

    pub fn unavailable(serial_number: &str) -> Self {
        Self::from_getprop(&HashMap::new(), None, serial_number, "")
    }
}

fn lookup(props: &HashMap<String, String>, key: &str) -> Option<String> {
    props
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Memoized property reads, dropped on every reboot.
#[derive(Debug, Default)]
pub struct PropertyCache {
    values: HashMap<String, String>,
    snapshot: Option<DeviceProperties>,
}

impl PropertyCache {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn fill(&mut self, props: HashMap<String, String>, snapshot: DeviceProperties) {
        self.values = props;
        self.snapshot = Some(snapshot);
    }

    pub fn snapshot(&self) -> Option<&DeviceProperties> {
        self.snapshot.as_ref()
    }

    pub fn invalidate(&mut self) {
        self.values.clear();
        self.snapshot = None;
    }
}
