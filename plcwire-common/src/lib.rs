//! Process-level plumbing shared by plcwire binaries: structured logging
//! setup and layered configuration loading.
pub mod error;
mod logger;
pub mod settings;

pub use error::{CommonError, CommonResult};
pub use logger::Logger;
pub use settings::{load_settings, LoggingSettings, ENV_PREFIX};
