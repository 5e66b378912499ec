use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::command::DeviceCommand;
use crate::app::error::AppError;
use crate::app::models::DeviceIdentity;
use crate::app::retry::RetryPolicy;

use super::{AdbCli, CmdRequest, Transport};

pub struct UsbTransport {
    identity: DeviceIdentity,
    cli: AdbCli,
    start_retries: u32,
}

impl UsbTransport {
    pub fn new(serial: impl Into<String>, cli: AdbCli, start_retries: u32) -> Self {
        Self {
            identity: DeviceIdentity::Usb {
                serial: serial.into(),
            },
            cli,
            start_retries,
        }
    }

    pub fn cli(&self) -> &AdbCli {
        &self.cli
    }
}

impl Transport for UsbTransport {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn start(&self, timeout: Duration) -> Result<(), AppError> {
        let policy = RetryPolicy::new(self.start_retries, Duration::from_millis(500))
            .with_attempt_timeout(timeout);
        policy.run(|attempt| {
            self.cli.start_server(policy.per_attempt_timeout).map_err(|err| {
                warn!(trace_id = %self.cli.trace_id(), attempt, error = %err, "adb server start failed");
                err
            })
        })?;
        self.cli.mark_running(true);
        Ok(())
    }

    fn stop(&self) -> Result<(), AppError> {
        let was_running = self.cli.is_running();
        self.cli.mark_running(false);
        if was_running && self.cli.owns_server() {
            info!(trace_id = %self.cli.trace_id(), "stopping owned adb server");
            self.cli.kill_server()?;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.cli.is_running()
    }

    fn run_cmd(&self, command: &DeviceCommand, request: &CmdRequest<'_>) -> Result<String, AppError> {
        self.cli.execute(&self.identity, command, request)
    }

    fn push(&self, local: &Path, remote: &str, timeout: Option<Duration>) -> Result<String, AppError> {
        self.cli.push(&self.identity, local, remote, timeout)
    }

    fn pull(&self, remote: &str, local: &Path, timeout: Option<Duration>) -> Result<String, AppError> {
        self.cli.pull(&self.identity, remote, local, timeout)
    }
}
