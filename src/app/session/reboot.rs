use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::app::adb::command::DeviceCommand;
use crate::app::error::AppError;
use crate::app::models::{BootMode, LogPriority, SessionState};
use crate::app::retry::Deadline;

use super::{lock_or_recover, RunOptions, Session};

const REQUEST_SHUTDOWN_ACTION: &str = "com.android.internal.intent.action.REQUEST_SHUTDOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebootOptions {
    /// Block until the device is observed in the target mode.
    pub wait_for_transition: bool,
    /// Falls back to the configured boot timeout.
    pub transition_timeout: Option<Duration>,
    /// Keep going through the remaining modes after a failed transition.
    pub skip_failure: bool,
    /// Falls back to the configured settle duration.
    pub wait_settle: Option<Duration>,
}

impl Default for RebootOptions {
    fn default() -> Self {
        Self {
            wait_for_transition: true,
            transition_timeout: None,
            skip_failure: false,
            wait_settle: None,
        }
    }
}

/// Command that moves a device from `current` to `target`, if there is one.
pub fn select_reboot_command(current: BootMode, target: BootMode) -> Option<DeviceCommand> {
    match (current, target) {
        (BootMode::Mos, BootMode::Mos) => Some(DeviceCommand::adb(&["reboot"])),
        (BootMode::Mos, BootMode::Pos) => Some(DeviceCommand::adb(&["reboot", "bootloader"])),
        (BootMode::Mos, BootMode::Ros) => Some(DeviceCommand::adb(&["reboot", "recovery"])),
        (BootMode::Mos, BootMode::Cos) => Some(DeviceCommand::shell(&format!(
            "am start -a {REQUEST_SHUTDOWN_ACTION}"
        ))),
        (BootMode::Pos, BootMode::Mos) => Some(DeviceCommand::bootloader(&["reboot"])),
        (BootMode::Pos, BootMode::Pos) => Some(DeviceCommand::bootloader(&["reboot-bootloader"])),
        (BootMode::Pos, BootMode::Ros) => Some(DeviceCommand::bootloader(&["reboot", "recovery"])),
        _ => None,
    }
}

impl Session {
    /// Walks the device through `modes` in order. Returns `Ok(false)` when a
    /// transition failed and `skip_failure` let the walk continue.
    pub fn reboot(&self, modes: &[BootMode], options: RebootOptions) -> Result<bool, AppError> {
        let mut all_ok = true;
        for &mode in modes {
            if let Err(err) = self.reboot_once(mode, options) {
                if !options.skip_failure {
                    return Err(err);
                }
                warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, tag = err.tag(), to = %mode, error = %err.error, "reboot failed, continuing");
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    fn reboot_once(&self, target: BootMode, options: RebootOptions) -> Result<(), AppError> {
        let trace_id = &self.inner.trace_id;
        let config = &self.inner.config;
        if !target.is_known() {
            return Err(AppError::validation("reboot target must be a known mode", trace_id));
        }
        lock_or_recover(&self.inner.properties).invalidate();

        let current = self.get_boot_mode();
        if !current.is_known() {
            error!(trace_id = %trace_id, device = %self.inner.identity, tag = "REBOOT", to = %target, "current boot mode unknown");
            return Err(AppError::reboot(
                format!("cannot reboot to {target}: current mode is unknown"),
                trace_id,
            ));
        }
        let Some(command) = select_reboot_command(current, target) else {
            return Err(AppError::reboot(
                format!("no reboot path from {current} to {target}"),
                trace_id,
            ));
        };
        info!(trace_id = %trace_id, device = %self.inner.identity, from = %current, to = %target, "rebooting");

        if current == BootMode::Mos {
            self.stop_capture();
        }
        let run_options = if config.wait_soft_reboot_cmd_returns {
            RunOptions::forced()
        } else {
            RunOptions::forced().detached()
        };
        let outcome = self.run_command(&command, None, run_options);
        if !outcome.ok {
            return Err(AppError::reboot(
                format!("reboot command failed: {}", outcome.output),
                trace_id,
            ));
        }
        if !config.wait_soft_reboot_cmd_returns {
            thread::sleep(config.soft_shutdown_settle_down_duration());
        }
        if current == BootMode::Mos {
            self.disconnect();
        }
        self.inner.agent_started.store(false, Ordering::SeqCst);
        self.set_booted(false);
        self.set_state(SessionState::Booting);

        if !options.wait_for_transition {
            return Ok(());
        }
        let deadline = Deadline::after(options.transition_timeout.unwrap_or_else(|| config.boot_timeout()));
        if target == BootMode::Mos {
            let settle = options
                .wait_settle
                .unwrap_or_else(|| config.settle_down_duration());
            self.wait_until_ready(&deadline, settle).map_err(|failure| {
                self.set_state(SessionState::Unknown);
                AppError::reboot(
                    format!("{} (last mode {})", failure.reason, failure.mode),
                    trace_id,
                )
            })?;
            self.set_state(SessionState::Alive);
            self.connect()?;
        } else {
            self.wait_for_mode(target, &deadline)?;
            self.set_state(SessionState::Alive);
            if target == BootMode::Ros && config.enable_adb_root {
                if let Err(err) = self.enable_adb_root() {
                    warn!(trace_id = %trace_id, device = %self.inner.identity, tag = err.tag(), error = %err.error, "adb root in recovery failed");
                }
            }
        }
        self.inject_log(LogPriority::Info, "DEVBENCH", &format!("reboot to {target} done"));
        info!(trace_id = %trace_id, device = %self.inner.identity, mode = %target, "reboot complete");
        Ok(())
    }

    fn wait_for_mode(&self, target: BootMode, deadline: &Deadline) -> Result<(), AppError> {
        let transport = self.inner.transport.as_ref();
        loop {
            if self.inner.oracle.confirm_mode(transport, target) {
                return Ok(());
            }
            if deadline.expired() {
                self.set_state(SessionState::Unknown);
                return Err(AppError::reboot(
                    format!("device not seen in {target} within {}s", deadline.elapsed().as_secs()),
                    &self.inner.trace_id,
                ));
            }
            deadline.pause(self.inner.config.boot_poll_interval());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reboot_paths_cover_main_os_and_bootloader() {
        assert_eq!(
            select_reboot_command(BootMode::Mos, BootMode::Pos),
            Some(DeviceCommand::adb(&["reboot", "bootloader"]))
        );
        assert_eq!(
            select_reboot_command(BootMode::Pos, BootMode::Mos),
            Some(DeviceCommand::bootloader(&["reboot"]))
        );
        assert!(select_reboot_command(BootMode::Mos, BootMode::Cos)
            .map(|command| command.args().join(" ").contains("REQUEST_SHUTDOWN"))
            .unwrap_or(false));
    }

    #[test]
    fn no_path_out_of_recovery_or_charger() {
        for target in [BootMode::Mos, BootMode::Pos, BootMode::Ros, BootMode::Cos] {
            assert_eq!(select_reboot_command(BootMode::Ros, target), None);
            assert_eq!(select_reboot_command(BootMode::Cos, target), None);
            assert_eq!(select_reboot_command(BootMode::Unknown, target), None);
        }
        assert_eq!(select_reboot_command(BootMode::Pos, BootMode::Cos), None);
    }
}
