//! Channel to a single device. Two implementations share one contract:
//! [`UsbTransport`] (identified by serial) and [`NetworkTransport`]
//! (identified by `host:port`).

mod cli;
mod network;
mod usb;

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::app::adb::command::DeviceCommand;
use crate::app::adb::runner::CancelToken;
use crate::app::error::AppError;
use crate::app::models::DeviceIdentity;

pub use cli::AdbCli;
pub use network::NetworkTransport;
pub use usb::UsbTransport;

/// Execution options for one command.
#[derive(Debug, Clone, Copy)]
pub struct CmdRequest<'a> {
    pub timeout: Duration,
    /// When false the child is left running and an empty output is returned at once.
    pub wait_for_response: bool,
    pub silent: bool,
    /// Run even if the transport considers its daemon stopped.
    pub force: bool,
    pub cancel: Option<&'a CancelToken>,
}

impl<'a> CmdRequest<'a> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            wait_for_response: true,
            silent: false,
            force: false,
            cancel: None,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// Each command runs as its own child process, so implementations must allow
/// concurrent `run_cmd` calls from the session and its watchdog.
pub trait Transport: Send + Sync {
    fn identity(&self) -> &DeviceIdentity;

    /// Ensures the local daemon runs; the network flavor also opens the remote session.
    fn start(&self, timeout: Duration) -> Result<(), AppError>;

    /// Releases the remote session and stops the daemon if this transport owns it.
    /// Calling it twice is a no-op.
    fn stop(&self) -> Result<(), AppError>;

    fn restart(&self, timeout: Duration) -> Result<(), AppError> {
        self.stop()?;
        self.start(timeout)
    }

    fn is_running(&self) -> bool;

    /// Returns the raw output; a non-zero exit becomes `ERR_TRANSPORT`.
    fn run_cmd(&self, command: &DeviceCommand, request: &CmdRequest<'_>) -> Result<String, AppError>;

    fn push(&self, local: &Path, remote: &str, timeout: Option<Duration>) -> Result<String, AppError>;

    fn pull(&self, remote: &str, local: &Path, timeout: Option<Duration>) -> Result<String, AppError>;
}

/// Lightweight TCP reachability probe used by the network flavor.
pub fn is_tcp_alive(host: &str, port: u16, timeout: Duration, retries: u32) -> bool {
    let addresses: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
        Ok(addresses) => addresses.collect(),
        Err(_) => return false,
    };
    for attempt in 0..retries.max(1) {
        if addresses
            .iter()
            .any(|address| TcpStream::connect_timeout(address, timeout).is_ok())
        {
            return true;
        }
        if attempt + 1 < retries.max(1) {
            thread::sleep(Duration::from_millis(200));
        }
    }
    false
}
