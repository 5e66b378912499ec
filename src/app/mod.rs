pub mod adb;
pub mod config;
pub mod context;
pub mod equipment;
pub mod error;
pub mod locks;
pub mod logger;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod oracle;
pub mod properties;
pub mod retry;
pub mod session;
pub mod transport;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testing;
