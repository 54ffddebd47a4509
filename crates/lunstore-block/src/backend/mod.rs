//! Backing-store adapters
//!
//! Three storage kinds with two I/O models sit behind one [`Backend`] enum:
//!
//! - [`FileBackend`] and [`VolumeBackend`] implement the synchronous
//!   [`BackingStore`] contract and are called directly on a worker thread.
//! - [`DeviceBackend`] wraps an asynchronous [`BlockDevice`]: the dispatcher
//!   submits one [`Bio`] per segment and the device completes each bio from
//!   whatever thread it likes.

pub mod device;
pub mod file;
pub mod volume;

pub use device::{Bio, BioOp, BlockDevice, DeviceBackend, DeviceGeometry, RawDevice};
pub use file::FileBackend;
pub use volume::{PoolVolume, PooledVolume, StoragePool, VolumeBackend};

use lunstore_common::{BackendKind, BlockState};
use std::io;
use std::path::Path;
use std::str::FromStr;

/// A run of bytes sharing one provisioning state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub state: BlockState,
    /// Bytes from the probed offset
    pub length: u64,
}

impl Extent {
    pub const fn mapped(length: u64) -> Self {
        Self {
            state: BlockState::Mapped,
            length,
        }
    }

    pub const fn unmapped(length: u64) -> Self {
        Self {
            state: BlockState::Unmapped,
            length,
        }
    }

    /// Nothing known from here to the end of the store
    pub const fn unknown(remaining: u64) -> Self {
        Self {
            state: BlockState::Unknown,
            length: remaining,
        }
    }
}

/// Attribute a store may answer point queries for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    BlocksUsed,
    BlocksAvailable,
}

impl FromStr for Capability {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocksused" => Ok(Self::BlocksUsed),
            "blocksavail" => Ok(Self::BlocksAvailable),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown capability {s}"),
            )),
        }
    }
}

/// Geometry reported by a backing store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreGeometry {
    /// Usable bytes
    pub size: u64,
    /// Native sector size; 0 when the store has no preference
    pub block_size: u32,
    /// Physical block size and the byte offset of the first aligned block
    pub physical_block_size: u64,
    pub physical_offset: u64,
    /// Deallocation granularity and alignment
    pub unmap_granularity: u64,
    pub unmap_offset: u64,
    pub deallocate: bool,
    pub read_only: bool,
}

/// Synchronous store contract
///
/// Transfers are expressed as lists of buffers laid out back to back from
/// `offset`.
pub trait BackingStore: Send + Sync {
    /// Fill `bufs` from `offset`. Bytes past the end of the store read as zero.
    fn read(&self, offset: u64, bufs: &mut [&mut [u8]]) -> io::Result<()>;

    /// Write `bufs` at `offset`; with `fua` the data is durable on return.
    fn write(&self, offset: u64, bufs: &[&[u8]], fua: bool) -> io::Result<()>;

    /// Flush data, plus metadata when `whole_device` is set.
    fn flush(&self, whole_device: bool) -> io::Result<()>;

    /// Release `length` bytes at `offset`; they read back as zeros.
    fn deallocate(&self, offset: u64, length: u64) -> io::Result<()>;

    /// Provisioning state of the run starting at `offset`
    fn status(&self, offset: u64) -> Extent;

    /// Capability answer in bytes
    fn capability(&self, capability: Capability) -> Option<u64>;

    fn geometry(&self) -> StoreGeometry;
}

/// The store a logical unit is attached to
pub enum Backend {
    File(FileBackend),
    Device(DeviceBackend),
    Volume(VolumeBackend),
}

impl Backend {
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::File(_) => BackendKind::File,
            Self::Device(_) => BackendKind::Device,
            Self::Volume(_) => BackendKind::Volume,
        }
    }

    pub fn geometry(&self) -> StoreGeometry {
        match self {
            Self::File(store) => store.geometry(),
            Self::Device(device) => device.geometry(),
            Self::Volume(store) => store.geometry(),
        }
    }

    /// Capability answer in bytes; raw devices have none.
    pub fn capability(&self, capability: Capability) -> Option<u64> {
        match self {
            Self::File(store) => store.capability(capability),
            Self::Device(_) => None,
            Self::Volume(store) => store.capability(capability),
        }
    }

    /// Provisioning state at `offset`; raw devices report unknown to the end.
    pub fn status(&self, offset: u64) -> Extent {
        match self {
            Self::File(store) => store.status(offset),
            Self::Device(device) => {
                Extent::unknown(device.geometry().size.saturating_sub(offset))
            }
            Self::Volume(store) => store.status(offset),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind())
            .field("geometry", &self.geometry())
            .finish()
    }
}

/// Split `/dev/zvol/<pool>/<volume>` into pool and volume names.
pub fn parse_volume_path(path: &Path) -> Option<(&str, &str)> {
    let rest = path.to_str()?.strip_prefix("/dev/zvol/")?;
    let (pool, volume) = rest.split_once('/')?;
    if pool.is_empty() || volume.is_empty() {
        return None;
    }
    Some((pool, volume))
}

/// Zero `bufs` from byte `from` (counted across the list) to the end.
pub(crate) fn zero_tail(bufs: &mut [&mut [u8]], from: usize) {
    let mut pos = 0;
    for buf in bufs.iter_mut() {
        let end = pos + buf.len();
        if end > from {
            let start = from.saturating_sub(pos);
            buf[start..].fill(0);
        }
        pos = end;
    }
}
