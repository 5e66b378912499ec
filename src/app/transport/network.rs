use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::command::DeviceCommand;
use crate::app::adb::parse::parse_connect_output;
use crate::app::error::AppError;
use crate::app::models::DeviceIdentity;
use crate::app::retry::RetryPolicy;

use super::{is_tcp_alive, AdbCli, CmdRequest, Transport};

const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// adb over TCP/IP: the local daemon plus an `adb connect` session to `host:port`.
pub struct NetworkTransport {
    identity: DeviceIdentity,
    host: String,
    port: u16,
    cli: AdbCli,
    connect_retries: u32,
    tcp_retries: u32,
}

impl NetworkTransport {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        cli: AdbCli,
        connect_retries: u32,
        tcp_retries: u32,
    ) -> Self {
        let host = host.into();
        Self {
            identity: DeviceIdentity::Network {
                host: host.clone(),
                port,
            },
            host,
            port,
            cli,
            connect_retries,
            tcp_retries,
        }
    }

    pub fn cli(&self) -> &AdbCli {
        &self.cli
    }

    fn open_session(&self, timeout: Duration) -> Result<(), AppError> {
        let target = self.identity.target();
        let policy = RetryPolicy::new(self.connect_retries, CONNECT_BACKOFF)
            .with_attempt_timeout(timeout);
        policy.run(|attempt| {
            let output = self
                .cli
                .run_adb(&["connect".to_string(), target.clone()], policy.per_attempt_timeout)
                .map_err(|err| AppError::transport_startup(err.error, self.cli.trace_id()))?;
            let text = output.combined();
            if output.success() && parse_connect_output(&text) {
                return Ok(());
            }
            warn!(
                trace_id = %self.cli.trace_id(),
                attempt,
                device = %target,
                output = %text.trim(),
                "adb connect was not confirmed"
            );
            Err(AppError::transport_startup(
                format!("adb connect {target} failed: {}", text.trim()),
                self.cli.trace_id(),
            ))
        })
    }
}

impl Transport for NetworkTransport {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn start(&self, timeout: Duration) -> Result<(), AppError> {
        self.cli.start_server(timeout)?;
        if !is_tcp_alive(&self.host, self.port, timeout, self.tcp_retries) {
            return Err(AppError::transport_startup(
                format!("{}:{} is not reachable", self.host, self.port),
                self.cli.trace_id(),
            ));
        }
        self.open_session(timeout)?;
        self.cli.mark_running(true);
        info!(trace_id = %self.cli.trace_id(), device = %self.identity, "network session opened");
        Ok(())
    }

    fn stop(&self) -> Result<(), AppError> {
        let was_running = self.cli.is_running();
        self.cli.mark_running(false);
        if !was_running {
            return Ok(());
        }
        let target = self.identity.target();
        match self
            .cli
            .run_adb(&["disconnect".to_string(), target.clone()], Duration::from_secs(10))
        {
            Ok(output) if output.success() => {}
            Ok(output) => {
                warn!(trace_id = %self.cli.trace_id(), device = %target, output = %output.combined().trim(), "adb disconnect failed");
            }
            Err(err) => {
                warn!(trace_id = %self.cli.trace_id(), device = %target, error = %err, "adb disconnect failed");
            }
        }
        if self.cli.owns_server() {
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
