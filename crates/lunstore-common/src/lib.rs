//! lunstore Common - Shared types and configuration
//!
//! This crate provides the identifiers, policy enums, configuration records
//! and option parsing shared by the block backend and the CLI.

pub mod config;
pub mod error;
pub mod types;

pub use config::{LunConfig, LunOptions, PoolConfig, SegmentPoolConfig, TargetConfig, VolumeConfig};
pub use error::{Error, Result};
pub use types::*;
