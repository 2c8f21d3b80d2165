//! Command-line host for the upstream-guard pipeline.
//!
//! - [`config`]: layered application configuration
//! - [`logging`]: tracing subscriber setup
//! - [`simulate`]: synthetic flaky upstream and load driver

pub mod config;
pub mod logging;
pub mod simulate;

pub use self::config::{AppConfig, LogSettings};
pub use logging::LogFormat;
pub use simulate::{SimulationOptions, SimulationReport, SyntheticUpstream};
