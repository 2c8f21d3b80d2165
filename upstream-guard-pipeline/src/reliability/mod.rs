//! Admission control: bounded concurrency with a priority wait queue.

pub mod admission;

pub use admission::{AdmissionPermit, AdmissionQueue};
