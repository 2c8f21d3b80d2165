//! Core types shared by the upstream-guard pipeline crates.
//!
//! - [`config`]: validated pipeline configuration
//! - [`domain`]: requests, response metadata, quality reports
//! - [`error`]: typed pipeline and upstream errors
//! - [`clock`]: injectable time source
//! - [`stats`]: observability snapshots
//! - [`traits`]: capabilities consumed by the pipeline

pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod stats;
pub mod traits;

pub use clock::*;
pub use config::*;
pub use domain::*;
pub use error::*;
pub use stats::*;
pub use traits::*;
