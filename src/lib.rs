pub mod app;

pub use app::config::{load_config, DeviceConfig};
pub use app::context::BenchContext;
pub use app::error::AppError;
pub use app::logging::init_logging_for;
pub use app::models::{BootMode, CmdOutcome, ConnectionState, DeviceIdentity, SessionState};
pub use app::session::{RebootOptions, RunOptions, Session, SessionParts};
