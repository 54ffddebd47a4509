//! Core types shared across lunstore crates

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical unit number assigned by the manager
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LunId(pub u64);

impl fmt::Display for LunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provisioning state of a run of blocks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockState {
    /// Backed by allocated storage
    Mapped,
    /// Deallocated; reads return zeros
    Unmapped,
    /// The store cannot tell
    Unknown,
}

/// When a read may release the front end's ordering hold
///
/// `Off` releases at admission, `Soft` just before the last read is
/// issued, `Read` and `On` once the last read has completed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationPolicy {
    #[default]
    Off,
    Read,
    Soft,
    On,
}

impl SerializationPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Read => "read",
            Self::Soft => "soft",
            Self::On => "on",
        }
    }
}

impl fmt::Display for SerializationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SerializationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "read" => Ok(Self::Read),
            "soft" => Ok(Self::Soft),
            "on" => Ok(Self::On),
            _ => Err(Error::UnknownPolicy(s.to_string())),
        }
    }
}

/// HA role of a logical unit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Backing store is open and serves I/O
    #[default]
    Primary,
    /// Backing store is closed; commands fail not-ready
    Secondary,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Secondary => f.write_str("secondary"),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            _ => Err(Error::UnknownRole(s.to_string())),
        }
    }
}

/// Kind of backing store behind a logical unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    File,
    Device,
    Volume,
}

impl BackendKind {
    /// Worker threads started when `num_threads` is not given
    pub const fn default_workers(self) -> usize {
        match self {
            Self::File | Self::Volume => 14,
            Self::Device => 1,
        }
    }

    /// Read ordering used when `serseq` is not given
    pub const fn default_serialization(self) -> SerializationPolicy {
        match self {
            Self::File | Self::Volume => SerializationPolicy::Soft,
            Self::Device => SerializationPolicy::Read,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Device => f.write_str("device"),
            Self::Volume => f.write_str("volume"),
        }
    }
}
