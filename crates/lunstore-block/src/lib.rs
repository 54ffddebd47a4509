#![allow(clippy::result_large_err)]
//! lunstore Block Target Backend
//!
//! This crate turns block-level commands (read, write, flush, unmap,
//! write-same, write-zeroes, compare, get-block-status and dataset
//! management) into operations against a backing store, and reports
//! completion and data back to a front-end protocol layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Front end    │  (FrontEnd trait: data movement, completion)
//! └────────┬────────┘
//!          │ submit(Command)
//! ┌────────▼────────┐
//! │  Logical unit   │  4 queues: data-ready > config-write >
//! │  - WorkQueues   │            config-read > new I/O
//! │  - worker pool  │
//! └────────┬────────┘
//!          │ rounds of <= 1 MiB
//! ┌────────▼────────┐
//! │   Dispatcher    │  IoContext per round, SegmentPool buffers
//! └────────┬────────┘
//!          │
//! ┌────────▼────────────────────────────┐
//! │ Backend::{File, Device, Volume}     │
//! │ sync BackingStore | async bio queue │
//! └─────────────────────────────────────┘
//! ```

pub mod backend;
pub mod command;
pub mod context;
mod dispatch;
pub mod error;
pub mod frontend;
pub mod initiator;
pub mod lun;
pub mod manager;
mod queue;
pub mod segment;
pub mod stats;

#[cfg(test)]
mod testing;

pub use backend::{
    Backend, BackingStore, Bio, BioOp, BlockDevice, Capability, DeviceBackend, Extent,
    FileBackend, PoolVolume, PooledVolume, RawDevice, StoragePool, StoreGeometry, VolumeBackend,
};
pub use command::{BlockRange, Command, CommandFlags, IoClass, Opcode, Payload};
pub use context::{ContextRef, IoContext};
pub use error::{BlockError, BlockResult, CommandError, Completion};
pub use frontend::{DataTransfer, Direction, FrontEnd};
pub use initiator::{LocalInitiator, Response};
pub use lun::{LogicalUnit, LunGeometry, LunInfo};
pub use manager::{LunManager, LunModify, LunParams};
pub use segment::{Segment, SegmentPool, SizeClass};
pub use stats::{LunStats, StatsSnapshot};

/// Largest transfer serviced by one round
pub const MAX_IO_SIZE: usize = 1024 * 1024;

/// Round size for compare, which allocates two buffer lists
pub const HALF_IO_SIZE: usize = MAX_IO_SIZE / 2;

/// Largest single segment (large size class)
pub const MAX_SEGMENT_SIZE: usize = 128 * 1024;

/// Segments up to this size come from the small class
pub const SMALL_SEGMENT_SIZE: usize = 8 * 1024;

/// Logical block size used when neither the caller nor the store has one
pub const DEFAULT_BLOCK_SIZE: u32 = 512;
