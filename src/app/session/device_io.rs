use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::thread;

use chrono::Local;
use tracing::{debug, info, warn};

use crate::app::adb::command::{shell_quote, DeviceCommand};
use crate::app::adb::parse::parse_getprop_map;
use crate::app::adb::paths::{sanitize_filename_component, validate_device_path, validate_property_key};
use crate::app::error::AppError;
use crate::app::models::{CmdOutcome, DeviceIdentity, LogPriority};
use crate::app::properties::DeviceProperties;
use crate::app::retry::RetryPolicy;

use super::{lock_or_recover, RunOptions, Session};

impl Session {
    fn require_connected(&self, action: &str) -> Result<(), AppError> {
        if self.is_connected() {
            return Ok(());
        }
        warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, tag = "NOT_CONNECTED", action, "device not connected");
        Err(AppError::transport(
            format!("cannot {action}: device not connected"),
            &self.inner.trace_id,
        ))
    }

    pub fn push(&self, local: &Path, remote: &str, timeout: Option<std::time::Duration>) -> Result<String, AppError> {
        self.require_connected("push")?;
        validate_device_path(remote).map_err(|err| AppError::validation(err, &self.inner.trace_id))?;
        let output = self.inner.transport.push(local, remote, timeout)?;
        info!(trace_id = %self.inner.trace_id, device = %self.inner.identity, local = %local.display(), remote, "file pushed");
        Ok(output)
    }

    pub fn pull(&self, remote: &str, local: &Path, timeout: Option<std::time::Duration>) -> Result<String, AppError> {
        self.require_connected("pull")?;
        validate_device_path(remote).map_err(|err| AppError::validation(err, &self.inner.trace_id))?;
        let output = self.inner.transport.pull(remote, local, timeout)?;
        info!(trace_id = %self.inner.trace_id, device = %self.inner.identity, local = %local.display(), remote, "file pulled");
        Ok(output)
    }

    /// Captures the screen into `<report dir>/screenshots`. Returns the local
    /// file, or `None` when any step failed.
    pub fn screenshot(&self, prefix: &str) -> Option<PathBuf> {
        if !self.is_connected() {
            warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, tag = "NOT_CONNECTED", "screenshot skipped");
            return None;
        }
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
        let name = format!(
            "{}_{}_{stamp}.png",
            sanitize_filename_component(prefix),
            sanitize_filename_component(&self.inner.identity.target()),
        );
        let remote = format!("/sdcard/{name}");
        let dir = self.inner.report_dir.join("screenshots");
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, error = %err, "cannot create screenshot directory");
            return None;
        }
        let local = dir.join(&name);

        let captured = self.run_command(
            &DeviceCommand::shell(&format!("screencap -p {remote}")),
            None,
            RunOptions::default(),
        );
        if !captured.ok {
            warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, output = %captured.output, "screencap failed");
            return None;
        }
        let pulled = self.inner.transport.pull(&remote, &local, None);
        let cleanup = self.run_command(
            &DeviceCommand::shell(&format!("rm -f {remote}")),
            None,
            RunOptions::default().silent(),
        );
        if !cleanup.ok {
            debug!(trace_id = %self.inner.trace_id, device = %self.inner.identity, remote = %remote, "remote screenshot not removed");
        }
        match pulled {
            Ok(_) => Some(local),
            Err(err) => {
                warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, tag = err.tag(), error = %err.error, "screenshot pull failed");
                None
            }
        }
    }

    /// Writes one line into the device log. Fire and forget; returns whether
    /// the command was issued.
    pub fn inject_log(&self, priority: LogPriority, tag: &str, message: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let line = format!(
            "log -p {} -t {} {}",
            priority.flag(),
            shell_quote(tag),
            shell_quote(message)
        );
        self.run_command(
            &DeviceCommand::shell(&line),
            None,
            RunOptions::default().silent().detached(),
        )
        .ok
    }

    /// Reads a property, memoized until the next reboot.
    pub fn get_property(&self, key: &str) -> Result<String, AppError> {
        validate_property_key(key).map_err(|err| AppError::validation(err, &self.inner.trace_id))?;
        let key = key.trim();
        if let Some(value) = lock_or_recover(&self.inner.properties).get(key) {
            return Ok(value.to_string());
        }
        let value = self.read_property(key)?;
        if !value.is_empty() {
            lock_or_recover(&self.inner.properties).insert(key, &value);
        }
        Ok(value)
    }

    fn read_property(&self, key: &str) -> Result<String, AppError> {
        let outcome = self.run_command(
            &DeviceCommand::shell(&format!("getprop {key}")),
            None,
            RunOptions::default(),
        );
        if !outcome.ok {
            return Err(AppError::transport(
                format!("getprop {key} failed: {}", outcome.output),
                &self.inner.trace_id,
            ));
        }
        Ok(outcome.output.trim().to_string())
    }

    /// Sets a property and reads it back; the device must report the new value.
    pub fn set_property(&self, key: &str, value: &str) -> Result<(), AppError> {
        validate_property_key(key).map_err(|err| AppError::validation(err, &self.inner.trace_id))?;
        let key = key.trim();
        let outcome = self.run_command(
            &DeviceCommand::shell(&format!("setprop {key} {}", shell_quote(value))),
            None,
            RunOptions::default(),
        );
        if !outcome.ok {
            return Err(AppError::transport(
                format!("setprop {key} failed: {}", outcome.output),
                &self.inner.trace_id,
            ));
        }
        let readback = self.read_property(key)?;
        if readback != value {
            warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, tag = "PROPERTY_MISMATCH", key, expected = value, actual = %readback, "property readback differs");
            return Err(AppError::property_mismatch(
                format!("{key} reads back '{readback}' instead of '{value}'"),
                &self.inner.trace_id,
            ));
        }
        lock_or_recover(&self.inner.properties).insert(key, value);
        Ok(())
    }

    /// Writes an AT command to the modem tty, retrying on failure.
    pub fn send_at_command(&self, command: &str) -> CmdOutcome {
        let config = &self.inner.config;
        let line = format!(
            "echo -e {} > {}",
            shell_quote(&format!("{command}\\r")),
            config.modem_tty_path
        );
        let policy = RetryPolicy::new(config.at_command_retries, std::time::Duration::ZERO);
        let result = policy.run(|attempt| {
            thread::sleep(config.at_command_priming_delay());
            let outcome = self.run_command(&DeviceCommand::shell(&line), None, RunOptions::default());
            if outcome.ok {
                Ok(outcome)
            } else {
                debug!(trace_id = %self.inner.trace_id, device = %self.inner.identity, attempt, output = %outcome.output, "AT command attempt failed");
                Err(outcome)
            }
        });
        match result {
            Ok(outcome) | Err(outcome) => outcome,
        }
    }

    /// Collects the property snapshot. Failures leave "not available" fields.
    pub(super) fn load_properties(&self) {
        let getprop = self.probe(&DeviceCommand::shell("getprop"));
        let props = if getprop.ok {
            parse_getprop_map(&getprop.output)
        } else {
            warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, "getprop failed, properties unavailable");
            Default::default()
        };
        let version = self.probe(&DeviceCommand::shell("cat /proc/version"));
        let serial = match &self.inner.identity {
            DeviceIdentity::Usb { serial } => serial.as_str(),
            DeviceIdentity::Network { .. } => "",
        };
        let snapshot = DeviceProperties::from_getprop(
            &props,
            version.ok.then_some(version.output.as_str()),
            serial,
            &self.inner.config.agent_version_property,
        );
        debug!(trace_id = %self.inner.trace_id, device = %self.inner.identity, board = %snapshot.board_type, build = %snapshot.build_description, "device properties loaded");
        lock_or_recover(&self.inner.properties).fill(props, snapshot);
    }

    /// Launches the on-device agent when one is configured.
    pub(super) fn start_agent(&self) {
        let command = self.inner.config.agent_start_command.trim();
        if command.is_empty() || self.agent_started() {
            return;
        }
        let outcome = self.run_command(
            &DeviceCommand::shell(command),
            None,
            RunOptions::forced().silent().detached(),
        );
        if outcome.ok {
            self.inner.agent_started.store(true, Ordering::SeqCst);
            info!(trace_id = %self.inner.trace_id, device = %self.inner.identity, "device agent started");
        } else {
            warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, output = %outcome.output, "device agent did not start");
        }
    }
}
