use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::app::adb::command::DeviceCommand;
use crate::app::adb::locator::{resolve_adb_program, resolve_fastboot_program};
use crate::app::adb::runner::{
    run_command_cancellable, run_command_with_timeout, spawn_detached, CommandOutput,
};
use crate::app::adb::server::query_server_version;
use crate::app::adb::transfer::{parse_remote_size, transfer_timeout};
use crate::app::config::DeviceConfig;
use crate::app::error::AppError;
use crate::app::models::DeviceIdentity;

use super::CmdRequest;

const DEFAULT_SERVER_PORT: u16 = 5037;
const SOCKET_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// The adb/fastboot command-line tools plus the local daemon they talk to.
/// Shared by both transport flavors.
pub struct AdbCli {
    adb_program: String,
    fastboot_program: String,
    server_port: u16,
    use_socket: bool,
    owns_server: bool,
    min_transfer_timeout: Duration,
    transfer_rate_kbps: u64,
    running: AtomicBool,
    trace_id: String,
}

impl AdbCli {
    pub fn from_config(config: &DeviceConfig, trace_id: &str) -> Self {
        Self {
            adb_program: resolve_adb_program(&config.adb_path),
            fastboot_program: resolve_fastboot_program(&config.fastboot_path),
            server_port: config.adb_server_port,
            use_socket: config.use_adb_socket,
            owns_server: config.handle_adb_restart,
            min_transfer_timeout: config.min_file_transfer_timeout(),
            transfer_rate_kbps: config.file_transfer_rate_kbps,
            running: AtomicBool::new(false),
            trace_id: trace_id.to_string(),
        }
    }

    pub fn adb_program(&self) -> &str {
        &self.adb_program
    }

    pub fn owns_server(&self) -> bool {
        self.owns_server
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn is_running(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        !self.use_socket || query_server_version(self.server_port, SOCKET_PROBE_TIMEOUT).is_ok()
    }

    pub fn mark_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Global adb options followed by `args`.
    pub fn adb_args(&self, args: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 2);
        if self.server_port != DEFAULT_SERVER_PORT {
            argv.push("-P".to_string());
            argv.push(self.server_port.to_string());
        }
        argv.extend(args.iter().cloned());
        argv
    }

    /// Program and arguments that stream the device log.
    pub fn logcat_command(&self, identity: &DeviceIdentity) -> (String, Vec<String>) {
        let args = [
            "-s".to_string(),
            identity.target(),
            "logcat".to_string(),
            "-v".to_string(),
            "threadtime".to_string(),
        ];
        (self.adb_program.clone(), self.adb_args(&args))
    }

    pub fn run_adb(&self, args: &[String], timeout: Duration) -> Result<CommandOutput, AppError> {
        run_command_with_timeout(&self.adb_program, &self.adb_args(args), timeout, &self.trace_id)
    }

    pub fn start_server(&self, timeout: Duration) -> Result<(), AppError> {
        if self.use_socket && query_server_version(self.server_port, SOCKET_PROBE_TIMEOUT).is_ok() {
            return Ok(());
        }
        let output = self
            .run_adb(&["start-server".to_string()], timeout)
            .map_err(|err| AppError::transport_startup(err.error, &self.trace_id))?;
        if !output.success() {
            return Err(AppError::transport_startup(
                format!("adb start-server failed: {}", failure_text(&output)),
                &self.trace_id,
            ));
        }
        Ok(())
    }

    pub fn kill_server(&self) -> Result<(), AppError> {
        let output = self.run_adb(&["kill-server".to_string()], Duration::from_secs(10))?;
        if !output.success() {
            return Err(AppError::transport(
                format!("adb kill-server failed: {}", failure_text(&output)),
                &self.trace_id,
            ));
        }
        Ok(())
    }

    pub fn execute(
        &self,
        identity: &DeviceIdentity,
        command: &DeviceCommand,
        request: &CmdRequest<'_>,
    ) -> Result<String, AppError> {
        if !request.force && !self.is_running() {
            return Err(AppError::transport(
                "transport daemon is not running",
                &self.trace_id,
            ));
        }

        let (program, argv) = if command.is_bootloader() {
            (self.fastboot_program.as_str(), command.render(identity))
        } else {
            (self.adb_program.as_str(), self.adb_args(&command.render(identity)))
        };
        if !request.silent {
            debug!(trace_id = %self.trace_id, program = %program, args = ?argv, "running device command");
        }

        if !request.wait_for_response {
            spawn_detached(program, &argv, &self.trace_id)?;
            return Ok(String::new());
        }

        let output =
            run_command_cancellable(program, &argv, request.timeout, request.cancel, &self.trace_id)?;
        if output.success() {
            Ok(output.combined())
        } else {
            Err(AppError::transport(failure_text(&output), &self.trace_id))
        }
    }

    pub fn push(
        &self,
        identity: &DeviceIdentity,
        local: &Path,
        remote: &str,
        timeout: Option<Duration>,
    ) -> Result<String, AppError> {
        let metadata = fs::metadata(local).map_err(|err| {
            AppError::transport(
                format!("local file {} unavailable: {err}", local.display()),
                &self.trace_id,
            )
        })?;
        let timeout = timeout.unwrap_or_else(|| {
            transfer_timeout(metadata.len(), self.transfer_rate_kbps, self.min_transfer_timeout)
        });
        let args = [
            "-s".to_string(),
            identity.target(),
            "push".to_string(),
            local.to_string_lossy().to_string(),
            remote.to_string(),
        ];
        let output = self.run_adb(&args, timeout)?;
        if !output.success() {
            return Err(AppError::transport(failure_text(&output), &self.trace_id));
        }
        Ok(output.combined().trim().to_string())
    }

    pub fn pull(
        &self,
        identity: &DeviceIdentity,
        remote: &str,
        local: &Path,
        timeout: Option<Duration>,
    ) -> Result<String, AppError> {
        let timeout = match timeout {
            Some(timeout) => timeout,
            None => {
                let size = self.remote_size(identity, remote).unwrap_or(0);
                transfer_timeout(size, self.transfer_rate_kbps, self.min_transfer_timeout)
            }
        };
        if let Some(parent) = local.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::system(format!("Failed to create {}: {err}", parent.display()), &self.trace_id)
            })?;
        }
        let args = [
            "-s".to_string(),
            identity.target(),
            "pull".to_string(),
            remote.to_string(),
            local.to_string_lossy().to_string(),
        ];
        let output = self.run_adb(&args, timeout)?;
        if !output.success() {
            return Err(AppError::transport(failure_text(&output), &self.trace_id));
        }
        Ok(output.combined().trim().to_string())
    }

    fn remote_size(&self, identity: &DeviceIdentity, remote: &str) -> Option<u64> {
        let args = [
            "-s".to_string(),
            identity.target(),
            "shell".to_string(),
            format!("stat -c %s {}", crate::app::adb::command::shell_quote(remote)),
        ];
        match self.run_adb(&args, Duration::from_secs(10)) {
            Ok(output) if output.success() => parse_remote_size(&output.stdout),
            Ok(_) => None,
            Err(err) => {
                warn!(trace_id = %self.trace_id, error = %err, "failed to stat remote file");
                None
            }
        }
    }
}

fn failure_text(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = output.stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    match output.exit_code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}
