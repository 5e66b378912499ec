use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::app::adb::command::DeviceCommand;
use crate::app::adb::paths::sanitize_filename_component;
use crate::app::equipment::PowerController;
use crate::app::error::AppError;
use crate::app::metrics::BOOT_FAILURE_COUNT;
use crate::app::models::{BootMode, ConnectionState, DeviceIdentity, SessionState};
use crate::app::retry::Deadline;
use crate::app::transport::is_tcp_alive;

use super::{lock_or_recover, select_reboot_command, BootWaitFailure, RunOptions, Session};

const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

impl Session {
    /// Shell liveness of the device, remembered for the next boot-mode query.
    pub fn get_state(&self) -> ConnectionState {
        let state = self.inner.oracle.probe_connection(self.inner.transport.as_ref());
        self.set_last_connection(state);
        state
    }

    /// Authoritative boot mode. Only a known answer updates the booted flag.
    pub fn get_boot_mode(&self) -> BootMode {
        let mode = self
            .inner
            .oracle
            .boot_mode(self.inner.transport.as_ref(), self.last_connection_state());
        if mode.is_known() {
            self.set_booted(mode == BootMode::Mos);
        }
        mode
    }

    pub fn is_available(&self) -> bool {
        self.is_connected() && self.get_state() == ConnectionState::Alive
    }

    pub fn connect(&self) -> Result<bool, AppError> {
        let _guard = lock_or_recover(&self.inner.connection_lock);
        if self.is_connected() && self.watchdog_running() {
            return Ok(true);
        }
        let trace_id = &self.inner.trace_id;

        self.inner
            .transport
            .start(self.inner.config.adb_connect_timeout())
            .map_err(|err| {
                error!(trace_id = %trace_id, device = %self.inner.identity, tag = "CONNECT", error = %err.error, "transport start failed");
                AppError::connect(format!("transport start failed: {}", err.error), trace_id)
            })?;

        let state = self.get_state();
        if state != ConnectionState::Alive {
            error!(trace_id = %trace_id, device = %self.inner.identity, tag = "CONNECT", state = %state, "device did not answer the shell probe");
            return Err(AppError::connect(
                format!("device did not answer the shell probe ({state})"),
                trace_id,
            ));
        }

        if self.inner.config.enable_adb_root {
            if let Err(err) = self.root_device() {
                warn!(trace_id = %trace_id, device = %self.inner.identity, tag = err.tag(), error = %err.error, "adb root failed");
            }
        }
        if !self.sync_time() {
            warn!(trace_id = %trace_id, device = %self.inner.identity, "device clock sync failed");
        }
        self.load_properties();
        self.start_agent();

        if self.inner.config.write_logcat {
            if let Err(err) = self.start_logger() {
                error!(trace_id = %trace_id, device = %self.inner.identity, tag = err.tag(), error = %err.error, "logger start failed");
                return Err(AppError::connect(err.error, trace_id));
            }
        }
        self.set_state(SessionState::Connected);
        if let Err(err) = self.start_watchdog() {
            self.inner.logger.stop();
            self.set_state(SessionState::Alive);
            return Err(AppError::connect(err.error, trace_id));
        }
        info!(trace_id = %trace_id, device = %self.inner.identity, "device connected");
        Ok(true)
    }

    pub fn disconnect(&self) {
        let _guard = lock_or_recover(&self.inner.connection_lock);
        self.disconnect_locked();
    }

    /// Caller holds the connection lock.
    pub(super) fn disconnect_locked(&self) {
        self.stop_capture();
        if let Err(err) = self.inner.transport.stop() {
            warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, tag = err.tag(), error = %err.error, "transport stop failed");
        }
        let next = if self.is_booted() {
            SessionState::Alive
        } else {
            SessionState::Down
        };
        self.set_state(next);
        info!(trace_id = %self.inner.trace_id, device = %self.inner.identity, "device disconnected");
    }

    fn start_logger(&self) -> Result<(), AppError> {
        if self.inner.logger.output_file().is_none() {
            let stamp = Local::now().format("%Y%m%d_%H%M%S");
            let name = format!(
                "{}_{}_{stamp}.log",
                sanitize_filename_component(&self.inner.config.device_name),
                sanitize_filename_component(&self.inner.identity.target()),
            );
            let path = self.inner.report_dir.join("logcat").join(name);
            self.inner.logger.set_output_file(&path)?;
        }
        self.inner.logger.start()
    }

    /// `adb root`, then waits for adbd to come back within the root timeout.
    pub fn enable_adb_root(&self) -> Result<bool, AppError> {
        self.root_device().map(|_| true)
    }

    fn root_device(&self) -> Result<(), AppError> {
        let timeout = self.inner.config.adb_root_timeout();
        let outcome = self.run_command(
            &DeviceCommand::adb(&["root"]),
            Some(timeout),
            RunOptions::forced().silent(),
        );
        if !outcome.ok {
            return Err(AppError::transport(
                format!("adb root failed: {}", outcome.output),
                &self.inner.trace_id,
            ));
        }
        let deadline = Deadline::after(timeout);
        loop {
            if self.get_state() == ConnectionState::Alive {
                return Ok(());
            }
            if deadline.expired() {
                return Err(AppError::transport(
                    "device did not come back after adb root",
                    &self.inner.trace_id,
                ));
            }
            deadline.pause(self.inner.config.boot_poll_interval());
        }
    }

    /// Sets the device clock to host UTC.
    pub fn sync_time(&self) -> bool {
        let stamp = chrono::Utc::now().format("%m%d%H%M%Y.%S");
        self.probe(&DeviceCommand::shell(&format!("date -u {stamp}"))).ok
    }

    fn resolve_boot_timeout(&self, boot_timeout: Option<i64>) -> Result<Duration, AppError> {
        match boot_timeout {
            None => Ok(self.inner.config.boot_timeout()),
            Some(value) if value < 0 => {
                if self.inner.config.strict_boot_timeout {
                    return Err(AppError::validation(
                        format!("boot_timeout must not be negative (got {value})"),
                        &self.inner.trace_id,
                    ));
                }
                warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, value, "negative boot timeout replaced by default");
                Ok(self.inner.config.boot_timeout())
            }
            Some(value) => Ok(Duration::from_secs(value as u64)),
        }
    }

    fn resolve_settle(&self, settle: Option<i64>) -> Duration {
        match settle {
            Some(value) if value >= 0 => Duration::from_secs(value as u64),
            _ => self.inner.config.settle_down_duration(),
        }
    }

    /// Polls until a shell answers, then requires MOS within what is left of
    /// `boot_timeout`.
    pub fn wait_for_ready(&self, boot_timeout: Option<i64>, settle: Option<i64>) -> Result<(), AppError> {
        let boot_timeout = self.resolve_boot_timeout(boot_timeout)?;
        let settle = self.resolve_settle(settle);
        let deadline = Deadline::after(boot_timeout);
        self.wait_until_ready(&deadline, settle).map_err(|failure| {
            AppError::boot_timeout(
                format!("{} (last mode {})", failure.reason, failure.mode),
                &self.inner.trace_id,
            )
        })
    }

    pub(super) fn wait_until_ready(&self, deadline: &Deadline, settle: Duration) -> Result<(), BootWaitFailure> {
        let poll = self.inner.config.boot_poll_interval();
        let oracle = &self.inner.oracle;
        let transport = self.inner.transport.as_ref();
        let mut bootloader_hits = 0;

        loop {
            self.reopen_network_link();
            if self.get_state() == ConnectionState::Alive {
                break;
            }
            if oracle.in_bootloader(transport) {
                bootloader_hits += 1;
                if bootloader_hits >= 2 {
                    self.set_booted(false);
                    return Err(BootWaitFailure {
                        mode: BootMode::Pos,
                        reason: "device is sitting in the bootloader".to_string(),
                    });
                }
            }
            if deadline.expired() {
                let mode = if bootloader_hits > 0 {
                    BootMode::Pos
                } else {
                    BootMode::Unknown
                };
                return Err(BootWaitFailure {
                    mode,
                    reason: format!("no shell answer within {}s", deadline.elapsed().as_secs()),
                });
            }
            deadline.pause(poll);
        }

        loop {
            let mode = oracle.observe_once(transport);
            if mode == BootMode::Mos {
                self.set_booted(true);
                break;
            }
            if deadline.expired() {
                return Err(BootWaitFailure {
                    mode,
                    reason: "boot did not complete".to_string(),
                });
            }
            deadline.pause(poll);
        }

        if !settle.is_zero() {
            thread::sleep(settle);
        }
        Ok(())
    }

    /// A network link is dropped by `adb disconnect` and by the reboot itself.
    /// Once the port answers again the remote session is reopened.
    fn reopen_network_link(&self) {
        let DeviceIdentity::Network { host, port } = &self.inner.identity else {
            return;
        };
        if self.inner.transport.is_running() || !is_tcp_alive(host, *port, TCP_PROBE_TIMEOUT, 1) {
            return;
        }
        let _guard = lock_or_recover(&self.inner.connection_lock);
        match self
            .inner
            .transport
            .start(self.inner.config.adb_connect_timeout())
        {
            Ok(()) => info!(trace_id = %self.inner.trace_id, device = %self.inner.identity, "network link reopened"),
            Err(err) => {
                debug!(trace_id = %self.inner.trace_id, device = %self.inner.identity, tag = err.tag(), error = %err.error, "network link not reopened yet")
            }
        }
    }

    fn power_step(&self, ok: bool, action: &str) -> Result<(), AppError> {
        if ok {
            return Ok(());
        }
        error!(trace_id = %self.inner.trace_id, device = %self.inner.identity, tag = "POWER", action, "power controller request failed");
        Err(AppError::power(
            format!("power controller failed to {action}"),
            &self.inner.trace_id,
        ))
    }

    /// Powers the device on, waits for MOS and connects.
    pub fn switch_on(
        &self,
        boot_timeout: Option<i64>,
        settle: Option<i64>,
        simple: bool,
    ) -> Result<String, AppError> {
        let boot_timeout = self.resolve_boot_timeout(boot_timeout)?;
        let settle = self.resolve_settle(settle);
        let trace_id = &self.inner.trace_id;
        let started = Instant::now();

        if self.is_booted() {
            match self.connect() {
                Ok(_) => return Ok("device already booted".to_string()),
                Err(err) => {
                    warn!(trace_id = %trace_id, device = %self.inner.identity, tag = err.tag(), error = %err.error, "booted device did not reconnect, power cycling");
                    self.set_booted(false);
                }
            }
        }

        if self.inner.identity.is_network() && self.inner.transport.is_running() {
            self.disconnect();
        }
        self.inner.agent_started.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Booting);
        let Some(power) = self.power() else {
            self.set_state(SessionState::Unknown);
            return Err(AppError::power("no power controller attached", trace_id));
        };

        if let Err(err) = self.power_cycle(power.as_ref(), simple) {
            self.set_state(SessionState::Unknown);
            return Err(err);
        }

        let deadline = Deadline::after(boot_timeout);
        let mut outcome = self.wait_until_ready(&deadline, settle);
        let stopped_in = outcome.as_ref().err().map(|failure| failure.mode);
        if let Some(mode) = stopped_in.filter(|mode| mode.is_known() && *mode != BootMode::Mos) {
            warn!(trace_id = %trace_id, device = %self.inner.identity, mode = %mode, "boot stopped outside MOS, rebooting once");
            outcome = self.recover_to_mos(mode, &deadline, settle);
        }

        if let Err(failure) = outcome {
            self.set_booted(false);
            self.set_state(SessionState::Unknown);
            self.inner.metrics.increment(BOOT_FAILURE_COUNT);
            error!(trace_id = %trace_id, device = %self.inner.identity, tag = "BOOT_TIMEOUT", mode = %failure.mode, reason = %failure.reason, "switch on failed");
            return Err(AppError::boot_timeout(
                format!("{} (last mode {})", failure.reason, failure.mode),
                trace_id,
            ));
        }

        self.set_booted(true);
        self.set_state(SessionState::Alive);
        self.connect()?;
        let message = format!("device booted in {}s", started.elapsed().as_secs());
        info!(trace_id = %trace_id, device = %self.inner.identity, "{message}");
        Ok(message)
    }

    fn power_cycle(&self, power: &dyn PowerController, simple: bool) -> Result<(), AppError> {
        if !simple {
            self.power_step(power.disconnect_usb_host_to_dut(), "disconnect the USB relay")?;
            self.power_step(power.poweroff_device(), "power off")?;
        }
        if self.get_state() == ConnectionState::Offline {
            self.power_step(power.poweroff_device(), "power off")?;
        }
        self.power_step(power.plug_device_power(), "plug power")?;
        self.power_step(power.poweron_device(), "power on")?;
        thread::sleep(self.inner.config.power_settle_duration());
        if !self.inner.identity.is_network() {
            self.power_step(power.connect_usb_host_to_dut(), "connect the USB relay")?;
        }
        Ok(())
    }

    /// The one reboot allowed after a boot that stopped in a non-MOS mode.
    fn recover_to_mos(
        &self,
        mode: BootMode,
        deadline: &Deadline,
        settle: Duration,
    ) -> Result<(), BootWaitFailure> {
        let Some(command) = select_reboot_command(mode, BootMode::Mos) else {
            return Err(BootWaitFailure {
                mode,
                reason: format!("no reboot path from {mode}"),
            });
        };
        let outcome = self.run_command(&command, None, RunOptions::forced());
        if !outcome.ok {
            warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, output = %outcome.output, "recovery reboot command failed");
        }
        self.wait_until_ready(deadline, settle)
    }

    /// Soft shutdown first, hard shutdown when the device is still up.
    pub fn switch_off(&self) -> Result<String, AppError> {
        if !self.is_booted() {
            return Ok("device already off".to_string());
        }
        self.set_state(SessionState::ShuttingDown);

        let message = if self.soft_shutdown() {
            "soft shutdown"
        } else if self.hard_shutdown() {
            "hard shutdown"
        } else {
            self.set_state(SessionState::Unknown);
            error!(trace_id = %self.inner.trace_id, device = %self.inner.identity, tag = "SHUTDOWN", "device is still up after soft and hard shutdown");
            return Err(AppError::shutdown(
                "device is still up after soft and hard shutdown",
                &self.inner.trace_id,
            ));
        };

        self.set_booted(false);
        self.inner.agent_started.store(false, Ordering::SeqCst);
        lock_or_recover(&self.inner.properties).invalidate();
        self.set_state(SessionState::Down);
        info!(trace_id = %self.inner.trace_id, device = %self.inner.identity, method = message, "device switched off");
        Ok(message.to_string())
    }

    fn soft_shutdown(&self) -> bool {
        let config = &self.inner.config;
        self.stop_capture();
        let options = if config.wait_soft_reboot_cmd_returns {
            RunOptions::forced().silent()
        } else {
            RunOptions::forced().silent().detached()
        };
        let outcome = self.run_command(
            &DeviceCommand::shell("reboot -p"),
            Some(config.soft_shutdown_duration()),
            options,
        );
        if !outcome.ok {
            info!(trace_id = %self.inner.trace_id, device = %self.inner.identity, output = %outcome.output, "soft shutdown command returned an error");
        }
        self.disconnect();
        if let Some(power) = self.power() {
            if !power.disconnect_usb_host_to_dut() {
                warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, tag = "POWER", "USB relay did not disconnect");
            }
        }
        thread::sleep(config.soft_shutdown_settle_down_duration());
        self.is_shut_down()
    }

    fn hard_shutdown(&self) -> bool {
        self.disconnect();
        let Some(power) = self.power() else {
            warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, tag = "POWER", "no power controller for hard shutdown");
            return false;
        };
        let cycled = self
            .power_step(power.disconnect_usb_host_to_dut(), "disconnect the USB relay")
            .and_then(|_| self.power_step(power.poweroff_device(), "power off"))
            .and_then(|_| self.power_step(power.cut_device_power(), "cut power"));
        if cycled.is_err() {
            return false;
        }
        thread::sleep(self.inner.config.hard_shutdown_duration());
        self.is_shut_down()
    }

    fn is_shut_down(&self) -> bool {
        match &self.inner.identity {
            DeviceIdentity::Network { host, port } => {
                !is_tcp_alive(host, *port, TCP_PROBE_TIMEOUT, 1)
            }
            DeviceIdentity::Usb { .. } => self.get_state() != ConnectionState::Alive,
        }
    }
}
