/// Console and file logging on top of `tracing`.
pub mod logger;

pub use logger::setup_logging;
