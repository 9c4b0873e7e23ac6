//! Meridian common types, errors, and utilities.
//!
//! This crate provides shared definitions used across the Meridian
//! geo-index and journal-recovery components.

pub mod config;
pub mod document;
pub mod error;

pub use config::{GeoIndexOptions, RecoveryOptions};
pub use error::{MeridianError, Result};
