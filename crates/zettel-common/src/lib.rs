//! zettel-common: shared client plumbing for the zettel editor.
//!
//! - `config`: client configuration with file and environment sources
//! - `telemetry`: tracing subscriber setup
//! - `transport`: wire protocol, presence and the collaboration session

pub mod config;
pub mod error;
pub mod telemetry;
pub mod transport;

pub use crate::config::{ClientConfig, ConfigError, FileStore, Loader, Saver};
pub use crate::error::SerDeError;
pub use smol_str::SmolStr;
