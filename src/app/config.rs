use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::app::error::AppError;

pub const DEFAULT_SHELL_FAILURE_SENTINEL: &str = "exec '/system/bin/sh' failed";

/// Per-device options. Field names on the wire are the bench catalog keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    #[serde(rename = "deviceName")]
    pub device_name: String,
    #[serde(rename = "serialNumber")]
    pub serial_number: String,
    #[serde(rename = "benchName")]
    pub bench_name: String,

    #[serde(rename = "bootTimeout")]
    pub boot_timeout_s: u64,
    #[serde(rename = "settleDownDuration")]
    pub settle_down_duration_s: u64,
    #[serde(rename = "softShutdownDuration")]
    pub soft_shutdown_duration_s: u64,
    #[serde(rename = "hardShutdownDuration")]
    pub hard_shutdown_duration_s: u64,
    #[serde(rename = "softShutdownSettleDownDuration")]
    pub soft_shutdown_settle_down_duration_s: u64,

    #[serde(rename = "adbServerPort")]
    pub adb_server_port: u16,
    #[serde(rename = "adbConnectTimeout")]
    pub adb_connect_timeout_s: u64,
    #[serde(rename = "adbRootTimeout")]
    pub adb_root_timeout_s: u64,
    #[serde(rename = "adbOverEthernet")]
    pub adb_over_ethernet: bool,
    #[serde(rename = "ipAddress")]
    pub ip_address: String,
    #[serde(rename = "adbPort")]
    pub adb_port: u16,
    #[serde(rename = "ADBConnectRetriesNb")]
    pub adb_connect_retries: u32,
    #[serde(rename = "TCPConnectRetriesNb")]
    pub tcp_connect_retries: u32,
    #[serde(rename = "enableAdbRoot")]
    pub enable_adb_root: bool,
    #[serde(rename = "useAdbSocket")]
    pub use_adb_socket: bool,
    #[serde(rename = "handleAdbRestart")]
    pub handle_adb_restart: bool,

    #[serde(rename = "WatchDogMaxErrorNb")]
    pub watchdog_max_error_nb: u32,
    #[serde(rename = "WatchDogSleepTime")]
    pub watchdog_sleep_time_s: u64,
    #[serde(rename = "WatchDogLogCycle")]
    pub watchdog_log_cycle_s: u64,

    #[serde(rename = "waitSoftRebootCmdReturns")]
    pub wait_soft_reboot_cmd_returns: bool,
    #[serde(rename = "defaultTimeout")]
    pub default_timeout_s: u64,
    #[serde(rename = "writeLogcat")]
    pub write_logcat: bool,

    #[serde(rename = "adbPath")]
    pub adb_path: String,
    #[serde(rename = "fastbootPath")]
    pub fastboot_path: String,
    #[serde(rename = "minFileTransferTimeout")]
    pub min_file_transfer_timeout_s: u64,
    #[serde(rename = "fileTransferRateKbps")]
    pub file_transfer_rate_kbps: u64,

    #[serde(rename = "bootPollInterval")]
    pub boot_poll_interval_ms: u64,
    #[serde(rename = "powerSettleDuration")]
    pub power_settle_duration_ms: u64,
    #[serde(rename = "bootModeRetries")]
    pub boot_mode_retries: u32,
    #[serde(rename = "bootModeBackoff")]
    pub boot_mode_backoff_ms: u64,

    #[serde(rename = "shellFailureSentinels")]
    pub shell_failure_sentinels: Vec<String>,
    #[serde(rename = "strictBootTimeout")]
    pub strict_boot_timeout: bool,

    #[serde(rename = "atCommandRetries")]
    pub at_command_retries: u32,
    #[serde(rename = "atCommandPrimingDelay")]
    pub at_command_priming_delay_ms: u64,
    #[serde(rename = "modemTtyPath")]
    pub modem_tty_path: String,

    #[serde(rename = "logcatMaxFileSizeMb")]
    pub logcat_max_file_size_mb: u64,
    #[serde(rename = "logcatMaxFiles")]
    pub logcat_max_files: usize,
    #[serde(rename = "reportDir")]
    pub report_dir: String,

    #[serde(rename = "agentStartCommand")]
    pub agent_start_command: String,
    #[serde(rename = "agentVersionProperty")]
    pub agent_version_property: String,

    #[serde(rename = "logLevel")]
    pub log_level: String,
    #[serde(rename = "jsonLogs")]
    pub json_logs: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: "DUT".to_string(),
            serial_number: String::new(),
            bench_name: "default".to_string(),
            boot_timeout_s: 300,
            settle_down_duration_s: 0,
            soft_shutdown_duration_s: 30,
            hard_shutdown_duration_s: 20,
            soft_shutdown_settle_down_duration_s: 20,
            adb_server_port: 5037,
            adb_connect_timeout_s: 10,
            adb_root_timeout_s: 10,
            adb_over_ethernet: false,
            ip_address: String::new(),
            adb_port: 5555,
            adb_connect_retries: 3,
            tcp_connect_retries: 3,
            enable_adb_root: false,
            use_adb_socket: false,
            handle_adb_restart: false,
            watchdog_max_error_nb: 10,
            watchdog_sleep_time_s: 1,
            watchdog_log_cycle_s: 5,
            wait_soft_reboot_cmd_returns: true,
            default_timeout_s: 50,
            write_logcat: true,
            adb_path: "adb".to_string(),
            fastboot_path: "fastboot".to_string(),
            min_file_transfer_timeout_s: 20,
            file_transfer_rate_kbps: 1024,
            boot_poll_interval_ms: 1000,
            power_settle_duration_ms: 1000,
            boot_mode_retries: 3,
            boot_mode_backoff_ms: 1000,
            shell_failure_sentinels: vec![DEFAULT_SHELL_FAILURE_SENTINEL.to_string()],
            strict_boot_timeout: false,
            at_command_retries: 3,
            at_command_priming_delay_ms: 2000,
            modem_tty_path: "/dev/gsmtty1".to_string(),
            logcat_max_file_size_mb: 10,
            logcat_max_files: 5,
            report_dir: "reports".to_string(),
            agent_start_command: String::new(),
            agent_version_property: "ro.build.version.incremental".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl DeviceConfig {
    /// Builds a config from the flat string map produced by the bench catalog.
    /// Values are coerced to the type of the matching default; a value that does
    /// not parse keeps the default.
    pub fn from_flat_map(values: &HashMap<String, String>) -> Self {
        let defaults = match serde_json::to_value(DeviceConfig::default()) {
            Ok(Value::Object(map)) => map,
            _ => return DeviceConfig::default(),
        };
        let mut merged: Map<String, Value> = defaults.clone();
        for (key, raw) in values {
            let Some(template) = defaults.get(key) else {
                warn!(key = %key, "ignoring unknown device option");
                continue;
            };
            match coerce_flat_value(template, raw) {
                Some(value) => {
                    merged.insert(key.clone(), value);
                }
                None => warn!(key = %key, value = %raw, "invalid device option; keeping default"),
            }
        }
        let config: DeviceConfig = serde_json::from_value(Value::Object(merged)).unwrap_or_default();
        validate_config(config)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_s)
    }

    pub fn settle_down_duration(&self) -> Duration {
        Duration::from_secs(self.settle_down_duration_s)
    }

    pub fn soft_shutdown_duration(&self) -> Duration {
        Duration::from_secs(self.soft_shutdown_duration_s)
    }

    pub fn hard_shutdown_duration(&self) -> Duration {
        Duration::from_secs(self.hard_shutdown_duration_s)
    }

    pub fn soft_shutdown_settle_down_duration(&self) -> Duration {
        Duration::from_secs(self.soft_shutdown_settle_down_duration_s)
    }

    pub fn adb_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.adb_connect_timeout_s)
    }

    pub fn adb_root_timeout(&self) -> Duration {
        Duration::from_secs(self.adb_root_timeout_s)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_s)
    }

    pub fn boot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.boot_poll_interval_ms)
    }

    pub fn power_settle_duration(&self) -> Duration {
        Duration::from_millis(self.power_settle_duration_ms)
    }

    pub fn boot_mode_backoff(&self) -> Duration {
        Duration::from_millis(self.boot_mode_backoff_ms)
    }

    pub fn at_command_priming_delay(&self) -> Duration {
        Duration::from_millis(self.at_command_priming_delay_ms)
    }

    pub fn min_file_transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.min_file_transfer_timeout_s)
    }

    pub fn logcat_max_file_size_bytes(&self) -> u64 {
        self.logcat_max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DEVBENCH_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".devbench_config.json")
}

pub fn load_config() -> Result<DeviceConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<DeviceConfig, AppError> {
    if !path.exists() {
        return Ok(DeviceConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), ""))?;

    // Catalog exports store every value as a string; typed JSON is accepted as-is.
    if let Value::Object(map) = &value {
        if !map.is_empty() && map.values().all(|item| item.is_string()) {
            let flat = map
                .iter()
                .filter_map(|(key, item)| item.as_str().map(|s| (key.clone(), s.to_string())))
                .collect::<HashMap<_, _>>();
            return Ok(DeviceConfig::from_flat_map(&flat));
        }
    }
    let config: DeviceConfig = serde_json::from_value(value)
        .map_err(|err| AppError::validation(format!("Invalid config: {err}"), ""))?;
    Ok(validate_config(config))
}

fn coerce_flat_value(template: &Value, raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    match template {
        Value::Bool(_) => parse_flat_bool(trimmed).map(Value::Bool),
        Value::Number(_) => trimmed
            .parse::<u64>()
            .ok()
            .map(Value::from)
            .or_else(|| {
                // Catalogs sometimes write "20.0"; fractional values round down.
                trimmed
                    .parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite() && *value >= 0.0)
                    .map(|value| Value::from(value.floor() as u64))
            }),
        Value::Array(_) => Some(Value::Array(
            trimmed
                .split(';')
                .map(|item| item.trim())
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_string()))
                .collect(),
        )),
        _ => Some(Value::String(trimmed.to_string())),
    }
}

fn parse_flat_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn validate_config(mut config: DeviceConfig) -> DeviceConfig {
    let defaults = DeviceConfig::default();
    if config.adb_server_port == 0 {
        config.adb_server_port = defaults.adb_server_port;
    }
    if config.adb_port == 0 {
        config.adb_port = defaults.adb_port;
    }
    if config.adb_connect_retries == 0 {
        config.adb_connect_retries = 1;
    }
    if config.tcp_connect_retries == 0 {
        config.tcp_connect_retries = 1;
    }
    if config.watchdog_max_error_nb == 0 {
        config.watchdog_max_error_nb = defaults.watchdog_max_error_nb;
    }
    if config.watchdog_sleep_time_s == 0 {
        config.watchdog_sleep_time_s = defaults.watchdog_sleep_time_s;
    }
    if config.watchdog_log_cycle_s == 0 {
        config.watchdog_log_cycle_s = defaults.watchdog_log_cycle_s;
    }
    if config.default_timeout_s == 0 {
        config.default_timeout_s = defaults.default_timeout_s;
    }
    if config.boot_mode_retries == 0 {
        config.boot_mode_retries = 1;
    }
    if config.at_command_retries == 0 {
        config.at_command_retries = 1;
    }
    if config.file_transfer_rate_kbps == 0 {
        config.file_transfer_rate_kbps = defaults.file_transfer_rate_kbps;
    }
    if config.logcat_max_files == 0 {
        config.logcat_max_files = 1;
    }
    if config.logcat_max_file_size_mb == 0 {
        config.logcat_max_file_size_mb = defaults.logcat_max_file_size_mb;
    }
    if config.boot_poll_interval_ms == 0 {
        config.boot_poll_interval_ms = 10;
    }
    if config.bench_name.trim().is_empty() {
        config.bench_name = defaults.bench_name;
    }
    if config.report_dir.trim().is_empty() {
        config.report_dir = defaults.report_dir;
    }
    config
}
