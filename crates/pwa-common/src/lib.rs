//! # PWA Common
//!
//! Logging configuration shared by the offline cache agent crates.
//!
//! Every crate in the workspace emits events through `tracing`; hosts call
//! [`init_logging`] once at startup to decide where those events go.

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LoggingError};
