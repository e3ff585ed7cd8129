pub mod config;
pub mod logging;

pub use config::{Config, LogFormat};
pub use logging::init_logging;
