//! Device session controller: owns one device for a campaign and drives its
//! lifecycle through the transport, the power controller and the oracle.

mod device_io;
mod lifecycle;
mod reboot;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::adb::command::DeviceCommand;
use crate::app::adb::parse::{parse_uptime, strip_line_endings};
use crate::app::adb::runner::CancelToken;
use crate::app::config::DeviceConfig;
use crate::app::context::BenchContext;
use crate::app::equipment::PowerController;
use crate::app::error::{AppError, ERR_CANCELLED};
use crate::app::logger::{command_spawner, DeviceLogger};
use crate::app::metrics::CampaignMetrics;
use crate::app::models::{
    BootMode, CmdOutcome, ConnectionState, DeviceIdentity, LogPriority, SessionState,
};
use crate::app::oracle::BootModeOracle;
use crate::app::properties::{DeviceProperties, PropertyCache};
use crate::app::transport::{AdbCli, CmdRequest, NetworkTransport, Transport, UsbTransport};
use crate::app::watchdog::{WatchdogHandle, WatchdogHost, WatchdogSettings, BREADCRUMB_TAG};

pub use reboot::{select_reboot_command, RebootOptions};

/// Per-call flags for [`Session::run_cmd`].
#[derive(Debug, Clone, Copy)]
pub struct RunOptions<'a> {
    pub force: bool,
    pub wait_for_response: bool,
    pub silent: bool,
    pub cancel: Option<&'a CancelToken>,
}

impl Default for RunOptions<'_> {
    fn default() -> Self {
        Self {
            force: false,
            wait_for_response: true,
            silent: false,
            cancel: None,
        }
    }
}

impl<'a> RunOptions<'a> {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn detached(mut self) -> Self {
        self.wait_for_response = false;
        self
    }

    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Everything a session is assembled from. [`Session::new`] derives these from
/// the configuration and the bench context; tests build them directly.
pub struct SessionParts {
    pub config: DeviceConfig,
    pub transport: Arc<dyn Transport>,
    pub power: Option<Arc<dyn PowerController>>,
    pub metrics: Arc<dyn CampaignMetrics>,
    pub connection_lock: Arc<Mutex<()>>,
    pub logger: DeviceLogger,
    pub watchdog: WatchdogSettings,
    pub report_dir: PathBuf,
    pub trace_id: String,
}

pub(crate) struct SessionInner {
    trace_id: String,
    identity: DeviceIdentity,
    config: DeviceConfig,
    transport: Arc<dyn Transport>,
    power: Mutex<Option<Arc<dyn PowerController>>>,
    metrics: Arc<dyn CampaignMetrics>,
    connection_lock: Arc<Mutex<()>>,
    oracle: BootModeOracle,
    watchdog_settings: WatchdogSettings,
    state: Mutex<SessionState>,
    booted: AtomicBool,
    agent_started: AtomicBool,
    last_connection: Mutex<ConnectionState>,
    properties: Mutex<PropertyCache>,
    logger: DeviceLogger,
    watchdog: Mutex<Option<WatchdogHandle>>,
    report_dir: PathBuf,
    released: AtomicBool,
}

/// Cheap to clone; clones share the same device state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Session {
    pub fn new(config: DeviceConfig, context: &BenchContext) -> Result<Self, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let identity = DeviceIdentity::from_config(&config, &trace_id)?;
        let cli = AdbCli::from_config(&config, &trace_id);
        let (program, args) = cli.logcat_command(&identity);
        let transport: Arc<dyn Transport> = match &identity {
            DeviceIdentity::Usb { serial } => Arc::new(UsbTransport::new(
                serial.clone(),
                cli,
                config.adb_connect_retries,
            )),
            DeviceIdentity::Network { host, port } => Arc::new(NetworkTransport::new(
                host.clone(),
                *port,
                cli,
                config.adb_connect_retries,
                config.tcp_connect_retries,
            )),
        };
        let logger = DeviceLogger::new(
            command_spawner(program, args, trace_id.clone()),
            config.logcat_max_file_size_bytes(),
            config.logcat_max_files,
            &trace_id,
        );
        let power = context.equipment.power_controller(&config.bench_name)?;
        let report_dir = context.equipment.log_sink(&config.bench_name)?;
        let watchdog = WatchdogSettings::from_config(&config);

        Ok(Self::with_parts(SessionParts {
            connection_lock: context.locks.connection_lock(&identity.target()),
            metrics: Arc::clone(&context.metrics),
            power: Some(power),
            config,
            transport,
            logger,
            watchdog,
            report_dir,
            trace_id,
        }))
    }

    pub fn with_parts(parts: SessionParts) -> Self {
        let identity = parts.transport.identity().clone();
        let oracle = BootModeOracle::from_config(&parts.config, &parts.trace_id);
        info!(trace_id = %parts.trace_id, device = %identity, "session created");
        Self {
            inner: Arc::new(SessionInner {
                trace_id: parts.trace_id,
                identity,
                oracle,
                transport: parts.transport,
                power: Mutex::new(parts.power),
                metrics: parts.metrics,
                connection_lock: parts.connection_lock,
                watchdog_settings: parts.watchdog,
                state: Mutex::new(SessionState::Down),
                booted: AtomicBool::new(false),
                agent_started: AtomicBool::new(false),
                last_connection: Mutex::new(ConnectionState::Unknown),
                properties: Mutex::new(PropertyCache::default()),
                logger: parts.logger,
                watchdog: Mutex::new(None),
                report_dir: parts.report_dir,
                released: AtomicBool::new(false),
                config: parts.config,
            }),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.inner.trace_id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn session_state(&self) -> SessionState {
        *lock_or_recover(&self.inner.state)
    }

    pub fn is_booted(&self) -> bool {
        self.inner.booted.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.session_state() == SessionState::Connected
    }

    pub fn agent_started(&self) -> bool {
        self.inner.agent_started.load(Ordering::SeqCst)
    }

    pub fn last_connection_state(&self) -> ConnectionState {
        *lock_or_recover(&self.inner.last_connection)
    }

    pub fn device_properties(&self) -> Option<DeviceProperties> {
        lock_or_recover(&self.inner.properties).snapshot().cloned()
    }

    pub fn logger_running(&self) -> bool {
        self.inner.logger.is_running()
    }

    pub fn watchdog_running(&self) -> bool {
        lock_or_recover(&self.inner.watchdog)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn logcat_file(&self) -> Option<PathBuf> {
        self.inner.logger.output_file()
    }

    fn set_state(&self, state: SessionState) {
        let mut guard = lock_or_recover(&self.inner.state);
        if *guard != state {
            debug!(trace_id = %self.inner.trace_id, device = %self.inner.identity, from = %*guard, to = %state, "session state");
            *guard = state;
        }
    }

    fn set_booted(&self, booted: bool) {
        self.inner.booted.store(booted, Ordering::SeqCst);
    }

    fn set_last_connection(&self, state: ConnectionState) {
        *lock_or_recover(&self.inner.last_connection) = state;
    }

    fn power(&self) -> Option<Arc<dyn PowerController>> {
        lock_or_recover(&self.inner.power).clone()
    }

    fn default_timeout(&self) -> Duration {
        self.inner.config.default_timeout()
    }

    /// Runs `cmd` on the device. Failures never unwind: they come back as
    /// `ok == false` with the error text.
    pub fn run_cmd(&self, cmd: &str, timeout: Option<Duration>, options: RunOptions<'_>) -> CmdOutcome {
        if !options.force && !self.is_connected() {
            if !options.silent {
                warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, tag = "NOT_CONNECTED", command = %cmd, "command refused");
            }
            return CmdOutcome::failure("device not connected");
        }
        let command = match DeviceCommand::parse(cmd) {
            Ok(command) => command,
            Err(err) => return CmdOutcome::failure(format!("invalid command: {err}")),
        };
        self.run_command(&command, timeout, options)
    }

    /// Same contract as [`run_cmd`](Self::run_cmd) for an already parsed command.
    pub fn run_command(
        &self,
        command: &DeviceCommand,
        timeout: Option<Duration>,
        options: RunOptions<'_>,
    ) -> CmdOutcome {
        if !options.force && !self.is_connected() {
            return CmdOutcome::failure("device not connected");
        }
        let request = CmdRequest {
            timeout: timeout.unwrap_or_else(|| self.default_timeout()),
            wait_for_response: options.wait_for_response,
            silent: options.silent,
            force: options.force,
            cancel: options.cancel,
        };
        match self.inner.transport.run_cmd(command, &request) {
            Ok(output) => {
                let output = strip_line_endings(&output).to_string();
                let sentinel = self
                    .inner
                    .config
                    .shell_failure_sentinels
                    .iter()
                    .find(|sentinel| !sentinel.is_empty() && output.contains(sentinel.as_str()));
                if let Some(sentinel) = sentinel {
                    if !options.silent {
                        warn!(trace_id = %self.inner.trace_id, device = %self.inner.identity, tag = "SHELL_FAILED", sentinel = %sentinel, "command output reports a shell failure");
                    }
                    return CmdOutcome::failure(output);
                }
                CmdOutcome::success(output)
            }
            Err(err) if err.is(ERR_CANCELLED) => CmdOutcome::failure(""),
            Err(err) => {
                if !options.silent {
                    warn!(
                        trace_id = %self.inner.trace_id,
                        device = %self.inner.identity,
                        tag = err.tag(),
                        command = ?command.args(),
                        error = %err.error,
                        "device command failed"
                    );
                }
                CmdOutcome::failure(err.error)
            }
        }
    }

    /// Runs a forced, silent command with the default timeout.
    fn probe(&self, command: &DeviceCommand) -> CmdOutcome {
        self.run_command(command, None, RunOptions::forced().silent())
    }

    pub fn get_uptime(&self) -> Option<f64> {
        let outcome = self.run_command(
            &DeviceCommand::shell("cat /proc/uptime"),
            None,
            RunOptions::default().silent(),
        );
        outcome.ok.then(|| parse_uptime(&outcome.output)).flatten()
    }

    fn start_watchdog(&self) -> Result<(), AppError> {
        let mut slot = lock_or_recover(&self.inner.watchdog);
        if slot.as_ref().map(|handle| !handle.is_finished()).unwrap_or(false) {
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            stale.stop();
        }
        let host: Arc<dyn WatchdogHost> = Arc::new(SessionWatchdog {
            inner: Arc::downgrade(&self.inner),
        });
        let handle = crate::app::watchdog::spawn_watchdog(
            host,
            Arc::clone(&self.inner.metrics),
            self.inner.watchdog_settings,
            &self.inner.trace_id,
        )?;
        *slot = Some(handle);
        Ok(())
    }

    fn stop_watchdog(&self) {
        let handle = lock_or_recover(&self.inner.watchdog).take();
        if let Some(handle) = handle {
            handle.stop();
            debug!(trace_id = %self.inner.trace_id, device = %self.inner.identity, "watchdog stopped");
        }
    }

    /// Logger then watchdog, in that order.
    fn stop_capture(&self) {
        self.inner.logger.stop();
        self.stop_watchdog();
    }

    /// Tears the session down. Later calls are no-ops.
    pub fn release(&self) {
        self.inner.teardown();
    }
}

impl SessionInner {
    fn teardown(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.logger.stop();
        let handle = lock_or_recover(&self.watchdog).take();
        if let Some(handle) = handle {
            handle.stop();
        }
        if self.config.handle_adb_restart {
            if let Err(err) = self.transport.stop() {
                warn!(trace_id = %self.trace_id, device = %self.identity, tag = err.tag(), error = %err.error, "transport stop failed during release");
            }
        }
        lock_or_recover(&self.power).take();
        *lock_or_recover(&self.state) = SessionState::Down;
        info!(trace_id = %self.trace_id, device = %self.identity, "session released");
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct SessionWatchdog {
    inner: Weak<SessionInner>,
}

impl SessionWatchdog {
    fn session(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl WatchdogHost for SessionWatchdog {
    fn probe_uptime(&self, timeout: Duration, cancel: &CancelToken) -> Option<f64> {
        let session = self.session()?;
        let outcome = session.run_command(
            &DeviceCommand::shell("cat /proc/uptime"),
            Some(timeout),
            RunOptions::default().silent().with_cancel(cancel),
        );
        outcome.ok.then(|| parse_uptime(&outcome.output)).flatten()
    }

    fn device_rebooted(&self) {
        let Some(session) = self.session() else {
            return;
        };
        lock_or_recover(&session.inner.properties).invalidate();
        session.inner.agent_started.store(false, Ordering::SeqCst);
        info!(trace_id = %session.inner.trace_id, device = %session.inner.identity, "property cache dropped after reboot");
    }

    fn restart_transport_server(&self) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        let Ok(_guard) = session.inner.connection_lock.try_lock() else {
            return false;
        };
        match session
            .inner
            .transport
            .start(session.inner.config.adb_connect_timeout())
        {
            Ok(()) => true,
            Err(err) => {
                warn!(trace_id = %session.inner.trace_id, device = %session.inner.identity, tag = err.tag(), error = %err.error, "watchdog transport start failed");
                false
            }
        }
    }

    fn declare_disconnected(&self) {
        let Some(session) = self.session() else {
            return;
        };
        let Ok(_guard) = session.inner.connection_lock.try_lock() else {
            return;
        };
        session.disconnect_locked();
        session.set_state(SessionState::Unknown);
    }

    fn owns_transport_lifecycle(&self) -> bool {
        self.session()
            .map(|session| session.inner.config.handle_adb_restart)
            .unwrap_or(false)
    }

    fn restart_transport(&self) {
        let Some(session) = self.session() else {
            return;
        };
        let Ok(_guard) = session.inner.connection_lock.try_lock() else {
            return;
        };
        if let Err(err) = session
            .inner
            .transport
            .restart(session.inner.config.adb_connect_timeout())
        {
            warn!(trace_id = %session.inner.trace_id, device = %session.inner.identity, tag = err.tag(), error = %err.error, "transport restart failed");
        }
    }

    fn breadcrumb(&self, message: &str) {
        if let Some(session) = self.session() {
            session.inject_log(LogPriority::Info, BREADCRUMB_TAG, message);
        }
    }
}

/// Boot wait that ran out, with the last mode the oracle reported.
#[derive(Debug, Clone)]
struct BootWaitFailure {
    mode: BootMode,
    reason: String,
}
