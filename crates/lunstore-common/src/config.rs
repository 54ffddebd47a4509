//! Configuration types for lunstore
//!
//! The target configuration is loaded by the CLI (file plus environment
//! overrides); per-LUN tunables arrive as a flat map of named options and
//! are parsed into [`LunOptions`].

use crate::error::{Error, Result};
use crate::types::{Role, SerializationPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Prefix of environment overrides, e.g. `LUNSTORE__SEGMENTS__LARGE_BUFFERS`
pub const ENV_PREFIX: &str = "LUNSTORE";

/// Root configuration for a target
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// I/O buffer pool sizing
    pub segments: SegmentPoolConfig,
    /// Storage pools providing pooled volumes
    pub pools: Vec<PoolConfig>,
    /// Logical units created at startup
    pub luns: Vec<LunConfig>,
}

impl TargetConfig {
    /// Load from an optional TOML file, then apply `LUNSTORE__*` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(::config::Config::try_deserialize::<Self>)
            .map_err(|e| Error::Configuration(e.to_string()))
    }
}

/// Bounds of the two buffer size classes
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentPoolConfig {
    /// Outstanding small (8 KiB) buffers
    pub small_buffers: usize,
    /// Outstanding large (128 KiB) buffers
    pub large_buffers: usize,
}

impl Default for SegmentPoolConfig {
    fn default() -> Self {
        Self {
            small_buffers: 1024,
            large_buffers: 256,
        }
    }
}

/// An in-memory storage pool and the volumes carved from it
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// Bytes of backing space the pool may allocate
    pub capacity_bytes: u64,
    /// Allocation unit
    #[serde(default = "default_extent_size")]
    pub extent_size: u64,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
}

const fn default_extent_size() -> u64 {
    64 * 1024
}

/// A volume inside a pool
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub name: String,
    /// Advertised (thin) size
    pub size_bytes: u64,
    #[serde(default = "default_volume_block_size")]
    pub block_size: u32,
}

const fn default_volume_block_size() -> u32 {
    512
}

/// One logical unit
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LunConfig {
    pub name: String,
    /// Backing store: regular file, block device node or `/dev/zvol/<pool>/<volume>`
    pub path: PathBuf,
    /// Logical block size; defaults to the store's sector size or 512
    #[serde(default)]
    pub block_size: Option<u32>,
    /// Exposed size; defaults to the store's size
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub role: Role,
    /// Named options, see [`LunOptions`]
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Per-LUN tunables parsed from named options
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunOptions {
    /// `num_threads`: worker count
    pub num_threads: Option<usize>,
    /// `unmap`: allow deallocation when the store supports it
    pub unmap: Option<bool>,
    /// `serseq`: read ordering policy
    pub serialization: Option<SerializationPolicy>,
    /// `readonly`
    pub read_only: bool,
    /// `pblocksize` / `pblockoffset`, bytes
    pub physical_block_size: Option<u64>,
    pub physical_block_offset: Option<u64>,
    /// `ublocksize` / `ublockoffset`, bytes
    pub unmap_block_size: Option<u64>,
    pub unmap_block_offset: Option<u64>,
    /// `serial`
    pub serial: Option<String>,
    /// `device_id`
    pub device_id: Option<String>,
}

impl LunOptions {
    /// Parse the recognised options out of `map`.
    ///
    /// Unrecognised names are left for the front end and ignored here.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let mut opts = Self::default();
        for (name, value) in map {
            match name.as_str() {
                "num_threads" => {
                    let n = value
                        .trim()
                        .parse::<usize>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| Error::invalid_option(name, value))?;
                    opts.num_threads = Some(n);
                }
                "unmap" => opts.unmap = Some(parse_bool(name, value)?),
                "serseq" => opts.serialization = Some(value.parse()?),
                "readonly" => opts.read_only = parse_bool(name, value)?,
                "pblocksize" => opts.physical_block_size = Some(parse_size(name, value)?),
                "pblockoffset" => opts.physical_block_offset = Some(parse_size(name, value)?),
                "ublocksize" => opts.unmap_block_size = Some(parse_size(name, value)?),
                "ublockoffset" => opts.unmap_block_offset = Some(parse_size(name, value)?),
                "serial" => opts.serial = Some(value.clone()),
                "device_id" => opts.device_id = Some(value.clone()),
                _ => {}
            }
        }
        Ok(opts)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(Error::invalid_option(name, value)),
    }
}

/// Parse a byte count with an optional `k`/`m`/`g`/`t` suffix (powers of 1024).
pub fn parse_size(name: &str, value: &str) -> Result<u64> {
    let trimmed = value.trim();
    let lower = trimmed.to_ascii_lowercase();
    let digits = lower.trim_end_matches(['b', 'B']);
    let (number, shift) = match digits.chars().last() {
        Some('k') => (&digits[..digits.len() - 1], 10),
        Some('m') => (&digits[..digits.len() - 1], 20),
        Some('g') => (&digits[..digits.len() - 1], 30),
        Some('t') => (&digits[..digits.len() - 1], 40),
        _ => (digits, 0),
    };
    number
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(1u64 << shift))
        .ok_or_else(|| Error::invalid_option(name, value))
}
