//! Background liveness loop: probes uptime, spots unexpected reboots, retries
//! the transport and finally declares the device disconnected.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::app::adb::runner::CancelToken;
use crate::app::config::DeviceConfig;
use crate::app::error::AppError;
use crate::app::metrics::{CampaignMetrics, UNEXPECTED_REBOOT_COUNT, WATCHDOG_DISCONNECT_COUNT};

pub const BREADCRUMB_TAG: &str = "ACS_WD";
pub const BREADCRUMB_MESSAGE: &str = "Alive";

/// Settable flag the loop waits on between ticks. Setting it also cancels the
/// probe in flight.
#[derive(Debug, Default)]
pub struct StopEvent {
    flag: Mutex<bool>,
    signal: Condvar,
    cancel: CancelToken,
}

impl StopEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.cancel.cancel();
        let mut guard = match self.flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = true;
        self.signal.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.flag.lock().map(|guard| *guard).unwrap_or(true)
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Waits up to `timeout`; returns true as soon as the event is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = match self.flag.lock() {
            Ok(guard) => guard,
            Err(_) => return true,
        };
        match self
            .signal
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
        {
            Ok((guard, _)) => *guard,
            Err(_) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogSettings {
    pub tick_interval: Duration,
    pub disconnect_threshold: u32,
    pub adb_retry_threshold: u32,
    pub log_cycle: Duration,
    pub probe_timeout: Duration,
}

impl WatchdogSettings {
    pub fn new(tick_interval: Duration, disconnect_threshold: u32, log_cycle: Duration) -> Self {
        let disconnect_threshold = disconnect_threshold.max(1);
        Self {
            tick_interval,
            disconnect_threshold,
            adb_retry_threshold: (disconnect_threshold / 2).max(1),
            log_cycle,
            probe_timeout: Duration::from_secs(5),
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        let mut settings = Self::new(
            Duration::from_secs(config.watchdog_sleep_time_s),
            config.watchdog_max_error_nb,
            Duration::from_secs(config.watchdog_log_cycle_s),
        );
        settings.probe_timeout = settings.probe_timeout.min(config.default_timeout());
        settings
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    Continue,
    RetryTransport,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub rebooted: bool,
    pub action: WatchdogAction,
}

/// Tick bookkeeping, kept apart from the thread so it can be driven directly.
#[derive(Debug, Clone)]
pub struct WatchdogState {
    previous_uptime: f64,
    consecutive_errors: u32,
    retried_this_streak: bool,
    last_probe_ok: bool,
    disconnect_threshold: u32,
    adb_retry_threshold: u32,
}

impl WatchdogState {
    pub fn new(settings: &WatchdogSettings) -> Self {
        Self {
            previous_uptime: 0.0,
            consecutive_errors: 0,
            retried_this_streak: false,
            last_probe_ok: false,
            disconnect_threshold: settings.disconnect_threshold,
            adb_retry_threshold: settings.adb_retry_threshold,
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn last_probe_ok(&self) -> bool {
        self.last_probe_ok
    }

    /// `reading` is the uptime when the probe produced a valid value.
    pub fn observe(&mut self, reading: Option<f64>) -> Observation {
        match reading {
            Some(uptime) => {
                let rebooted = uptime < self.previous_uptime;
                self.previous_uptime = uptime;
                self.consecutive_errors = 0;
                self.retried_this_streak = false;
                self.last_probe_ok = true;
                Observation {
                    rebooted,
                    action: WatchdogAction::Continue,
                }
            }
            None => {
                self.consecutive_errors += 1;
                self.last_probe_ok = false;
                // The transport retry does not clear the streak, the disconnect
                // threshold still counts every failed probe.
                let action = if self.consecutive_errors >= self.disconnect_threshold {
                    WatchdogAction::Disconnect
                } else if self.consecutive_errors >= self.adb_retry_threshold
                    && !self.retried_this_streak
                {
                    self.retried_this_streak = true;
                    WatchdogAction::RetryTransport
                } else {
                    WatchdogAction::Continue
                };
                Observation {
                    rebooted: false,
                    action,
                }
            }
        }
    }
}

/// What the loop needs from its session.
pub trait WatchdogHost: Send + Sync {
    fn probe_uptime(&self, timeout: Duration, cancel: &CancelToken) -> Option<f64>;
    /// Called once per detected reboot, before the reboot is counted.
    fn device_rebooted(&self);
    /// One `Transport.start`; true on success.
    fn restart_transport_server(&self) -> bool;
    fn declare_disconnected(&self);
    fn owns_transport_lifecycle(&self) -> bool;
    fn restart_transport(&self);
    fn breadcrumb(&self, message: &str);
}

pub struct WatchdogHandle {
    stop: Arc<StopEvent>,
    join: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl WatchdogHandle {
    /// Sets the stop event and joins, unless called from the loop itself.
    pub fn stop(mut self) {
        self.stop.set();
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.stop.set();
    }
}

pub fn spawn_watchdog(
    host: Arc<dyn WatchdogHost>,
    metrics: Arc<dyn CampaignMetrics>,
    settings: WatchdogSettings,
    trace_id: &str,
) -> Result<WatchdogHandle, AppError> {
    let stop = Arc::new(StopEvent::new());
    let loop_stop = Arc::clone(&stop);
    let loop_trace = trace_id.to_string();
    let join = thread::Builder::new()
        .name("device-watchdog".to_string())
        .spawn(move || run_loop(host, metrics, settings, loop_stop, loop_trace))
        .map_err(|err| AppError::system(format!("Failed to spawn watchdog: {err}"), trace_id))?;
    let thread_id = join.thread().id();
    info!(trace_id = %trace_id, tick_ms = settings.tick_interval.as_millis() as u64, "watchdog started");
    Ok(WatchdogHandle {
        stop,
        join: Some(join),
        thread_id,
    })
}

fn run_loop(
    host: Arc<dyn WatchdogHost>,
    metrics: Arc<dyn CampaignMetrics>,
    settings: WatchdogSettings,
    stop: Arc<StopEvent>,
    trace_id: String,
) {
    let mut state = WatchdogState::new(&settings);
    let mut last_breadcrumb: Option<Instant> = None;

    while !stop.is_set() {
        let reading = host.probe_uptime(settings.probe_timeout, stop.cancel_token());
        if stop.is_set() {
            break;
        }
        let observation = state.observe(reading);

        if observation.rebooted {
            warn!(trace_id = %trace_id, tag = "UNEXPECTED_REBOOT", "device uptime went backwards");
            host.device_rebooted();
            metrics.increment(UNEXPECTED_REBOOT_COUNT);
        }

        match observation.action {
            WatchdogAction::Continue => {}
            WatchdogAction::RetryTransport => {
                warn!(
                    trace_id = %trace_id,
                    errors = state.consecutive_errors(),
                    "watchdog retrying transport"
                );
                if host.restart_transport_server() {
                    info!(trace_id = %trace_id, "watchdog restarted transport");
                }
            }
            WatchdogAction::Disconnect => {
                error!(
                    trace_id = %trace_id,
                    tag = "DISCONNECTED",
                    errors = state.consecutive_errors(),
                    "watchdog declaring device disconnected"
                );
                metrics.increment(WATCHDOG_DISCONNECT_COUNT);
                host.declare_disconnected();
                if host.owns_transport_lifecycle() {
                    host.restart_transport();
                }
                break;
            }
        }

        if state.last_probe_ok()
            && last_breadcrumb
                .map(|at| at.elapsed() >= settings.log_cycle)
                .unwrap_or(true)
        {
            host.breadcrumb(BREADCRUMB_MESSAGE);
            last_breadcrumb = Some(Instant::now());
        }

        if stop.wait_timeout(settings.tick_interval) {
            break;
        }
    }
    debug!(trace_id = %trace_id, "watchdog loop exited");
}
