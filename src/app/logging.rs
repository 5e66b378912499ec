use tracing_subscriber::EnvFilter;

use crate::app::config::DeviceConfig;

pub fn init_logging_for(config: &DeviceConfig) {
    init_logging_with(&config.log_level, config.json_logs);
}

/// `RUST_LOG` wins over `default_level`. Release builds always log JSON so bench
/// logs can be collected by the campaign tooling.
pub fn init_logging_with(default_level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_lowercase()));

    if cfg!(debug_assertions) && !json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_names(true)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_target(false)
            .try_init();
    }
}
