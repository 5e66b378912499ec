use serde::Serialize;
use std::fmt;

pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";
pub const ERR_TRANSPORT_STARTUP: &str = "ERR_TRANSPORT_STARTUP";
pub const ERR_TRANSPORT: &str = "ERR_TRANSPORT";
pub const ERR_BOOT_TIMEOUT: &str = "ERR_BOOT_TIMEOUT";
pub const ERR_SHUTDOWN: &str = "ERR_SHUTDOWN";
pub const ERR_REBOOT: &str = "ERR_REBOOT";
pub const ERR_PROPERTY_MISMATCH: &str = "ERR_PROPERTY_MISMATCH";
pub const ERR_POWER: &str = "ERR_POWER";
pub const ERR_CONNECT: &str = "ERR_CONNECT";
pub const ERR_CANCELLED: &str = "ERR_CANCELLED";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    /// The local daemon or the remote socket refused to come up.
    pub fn transport_startup(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TRANSPORT_STARTUP, message, trace_id)
    }

    pub fn transport(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TRANSPORT, message, trace_id)
    }

    pub fn boot_timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_BOOT_TIMEOUT, message, trace_id)
    }

    pub fn shutdown(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SHUTDOWN, message, trace_id)
    }

    pub fn reboot(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_REBOOT, message, trace_id)
    }

    pub fn property_mismatch(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_PROPERTY_MISMATCH, message, trace_id)
    }

    pub fn power(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_POWER, message, trace_id)
    }

    pub fn connect(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_CONNECT, message, trace_id)
    }

    /// Cancellation is reported through this code but is never logged as a failure.
    pub fn cancelled(trace_id: impl Into<String>) -> Self {
        Self::new(ERR_CANCELLED, "", trace_id)
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }

    /// Short tag used in log lines, e.g. `BOOT_TIMEOUT` for `ERR_BOOT_TIMEOUT`.
    pub fn tag(&self) -> &str {
        self.code.strip_prefix("ERR_").unwrap_or(&self.code)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
