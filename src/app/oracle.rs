//! Maps device responses to [`BootMode`] and [`ConnectionState`].

use tracing::debug;

use crate::app::adb::command::DeviceCommand;
use crate::app::adb::parse::{
    connection_state_from_get_state, parse_boot_completed, parse_fastboot_devices, parse_get_state,
};
use crate::app::config::DeviceConfig;
use crate::app::models::{BootMode, ConnectionState, DeviceIdentity};
use crate::app::retry::RetryPolicy;
use crate::app::transport::{CmdRequest, Transport};

const ALIVE_MARKER: &str = "alive";

/// Every probe runs with the retry policy's per-attempt timeout.
pub struct BootModeOracle {
    retry: RetryPolicy,
    trace_id: String,
}

impl BootModeOracle {
    pub fn new(retry: RetryPolicy, trace_id: &str) -> Self {
        Self {
            retry,
            trace_id: trace_id.to_string(),
        }
    }

    pub fn from_config(config: &DeviceConfig, trace_id: &str) -> Self {
        Self::new(
            RetryPolicy::new(config.boot_mode_retries, config.boot_mode_backoff())
                .with_attempt_timeout(config.adb_connect_timeout())
                .with_budget(config.boot_timeout()),
            trace_id,
        )
    }

    fn request(&self) -> CmdRequest<'static> {
        CmdRequest::new(self.retry.per_attempt_timeout).forced().silent()
    }

    /// ALIVE when a shell answers, OFFLINE when the daemon sees the device
    /// but the shell refused, UNKNOWN otherwise.
    pub fn probe_connection(&self, transport: &dyn Transport) -> ConnectionState {
        let echo = DeviceCommand::shell(&format!("echo {ALIVE_MARKER}"));
        if let Ok(output) = transport.run_cmd(&echo, &self.request()) {
            if output.lines().any(|line| line.trim() == ALIVE_MARKER) {
                return ConnectionState::Alive;
            }
        }
        let state = self.raw_state(transport);
        connection_state_from_get_state(state.as_deref())
    }

    /// Lowercased `get-state` answer, if the daemon gave one.
    pub fn raw_state(&self, transport: &dyn Transport) -> Option<String> {
        transport
            .run_cmd(&DeviceCommand::adb(&["get-state"]), &self.request())
            .ok()
            .and_then(|output| parse_get_state(&output))
    }

    /// Authoritative mode with internal retries while the answer stays UNKNOWN.
    pub fn boot_mode(&self, transport: &dyn Transport, last_state: ConnectionState) -> BootMode {
        self.retry
            .run(|attempt| match self.observe_once(transport) {
                BootMode::Unknown => {
                    debug!(trace_id = %self.trace_id, attempt, last_state = %last_state, "boot mode unknown");
                    Err(())
                }
                mode => Ok(mode),
            })
            .unwrap_or(BootMode::Unknown)
    }

    /// Single MOS/POS observation without retries.
    pub fn observe_once(&self, transport: &dyn Transport) -> BootMode {
        let completed = transport
            .run_cmd(&DeviceCommand::shell("getprop sys.boot_completed"), &self.request())
            .map(|output| parse_boot_completed(&output))
            .unwrap_or(false);
        if completed {
            return BootMode::Mos;
        }
        if self.in_bootloader(transport) {
            return BootMode::Pos;
        }
        BootMode::Unknown
    }

    pub fn in_bootloader(&self, transport: &dyn Transport) -> bool {
        let Ok(output) = transport.run_cmd(&DeviceCommand::bootloader(&["devices"]), &self.request())
        else {
            return false;
        };
        let identity = transport.identity();
        parse_fastboot_devices(&output)
            .iter()
            .any(|entry| listed_in_bootloader(identity, entry))
    }

    /// Checks whether the device currently sits in `target`. ROS and COS need
    /// their own probes since the default observation cannot tell them apart.
    pub fn confirm_mode(&self, transport: &dyn Transport, target: BootMode) -> bool {
        match target {
            BootMode::Mos => self.observe_once(transport) == BootMode::Mos,
            BootMode::Pos => self.in_bootloader(transport),
            BootMode::Ros => matches!(
                self.raw_state(transport).as_deref(),
                Some("recovery") | Some("sideload")
            ),
            BootMode::Cos => transport
                .run_cmd(&DeviceCommand::shell("getprop ro.bootmode"), &self.request())
                .map(|output| output.trim() == "charger")
                .unwrap_or(false),
            BootMode::Unknown => false,
        }
    }
}

fn listed_in_bootloader(identity: &DeviceIdentity, entry: &str) -> bool {
    match identity {
        DeviceIdentity::Usb { serial } => entry == serial,
        DeviceIdentity::Network { host, port } => {
            entry == format!("tcp:{host}")
                || entry == format!("tcp:{host}:{port}")
                || entry == host
                || entry == format!("{host}:{port}")
        }
    }
}
