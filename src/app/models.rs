use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::app::config::DeviceConfig;
use crate::app::error::AppError;

/// Operating state of the device as reported by the boot mode oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BootMode {
    /// Main OS: userspace booted, adb shell available.
    Mos,
    /// Bootloader: fastboot command set available.
    Pos,
    /// Recovery OS.
    Ros,
    /// Charge-only OS.
    Cos,
    Unknown,
}

impl BootMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootMode::Mos => "MOS",
            BootMode::Pos => "POS",
            BootMode::Ros => "ROS",
            BootMode::Cos => "COS",
            BootMode::Unknown => "UNKNOWN",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, BootMode::Unknown)
    }
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BootMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "MOS" | "MAIN" => Ok(BootMode::Mos),
            "POS" | "BOOTLOADER" | "FASTBOOT" => Ok(BootMode::Pos),
            "ROS" | "RECOVERY" => Ok(BootMode::Ros),
            "COS" | "CHARGER" => Ok(BootMode::Cos),
            "UNKNOWN" => Ok(BootMode::Unknown),
            other => Err(format!("unknown boot mode: {other}")),
        }
    }
}

/// Result of the shell liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    Alive,
    Offline,
    Unknown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Alive => "ALIVE",
            ConnectionState::Offline => "OFFLINE",
            ConnectionState::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Down,
    Booting,
    Alive,
    Connected,
    ShuttingDown,
    Unknown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Down => "DOWN",
            SessionState::Booting => "BOOTING",
            SessionState::Alive => "ALIVE",
            SessionState::Connected => "CONNECTED",
            SessionState::ShuttingDown => "SHUTTING_DOWN",
            SessionState::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "link", rename_all = "lowercase")]
pub enum DeviceIdentity {
    Usb { serial: String },
    Network { host: String, port: u16 },
}

impl DeviceIdentity {
    pub fn from_config(config: &DeviceConfig, trace_id: &str) -> Result<Self, AppError> {
        if config.adb_over_ethernet {
            let host = config.ip_address.trim();
            if host.is_empty() {
                return Err(AppError::validation(
                    "ipAddress is required when adbOverEthernet is set",
                    trace_id,
                ));
            }
            return Ok(DeviceIdentity::Network {
                host: host.to_string(),
                port: config.adb_port,
            });
        }
        let serial = config.serial_number.trim();
        if serial.is_empty() {
            return Err(AppError::validation("serialNumber is required", trace_id));
        }
        Ok(DeviceIdentity::Usb {
            serial: serial.to_string(),
        })
    }

    /// Value passed to `adb -s`.
    pub fn target(&self) -> String {
        match self {
            DeviceIdentity::Usb { serial } => serial.clone(),
            DeviceIdentity::Network { host, port } => format!("{host}:{port}"),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, DeviceIdentity::Network { .. })
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.target())
    }
}

/// `(ok, output)` pair returned by command execution. Transport failures are
/// folded into `ok == false` with the error text as output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdOutcome {
    pub ok: bool,
    pub output: String,
}

impl CmdOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: output.into(),
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogPriority {
    Verbose,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogPriority {
    /// Flag accepted by the device-side `log -p`.
    pub fn flag(&self) -> char {
        match self {
            LogPriority::Verbose => 'v',
            LogPriority::Debug => 'd',
            LogPriority::Info => 'i',
            LogPriority::Warn => 'w',
            LogPriority::Error => 'e',
            LogPriority::Fatal => 'f',
        }
    }
}
