//! Payload completeness and integrity scoring.

pub mod reporter;

pub use reporter::DataQualityReporter;
