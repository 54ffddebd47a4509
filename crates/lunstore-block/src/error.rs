//! Block backend error types
//!
//! [`BlockError`] covers management operations (create, modify, remove).
//! [`CommandError`] is the status a single command completes with and is
//! what the front end translates into its protocol's sense data.

use lunstore_common::BlockState;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Management error
#[derive(Error, Debug)]
pub enum BlockError {
    /// LUN not found
    #[error("LUN not found: {0}")]
    LunNotFound(String),

    /// A LUN with this name already exists
    #[error("LUN already exists: {0}")]
    LunExists(String),

    /// Rejected parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backing store could not be opened
    #[error("Failed to open {}: {source}", .path.display())]
    BackendOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Path is neither a regular file, a block device nor a pooled volume
    #[error("Unsupported backing store: {}", .0.display())]
    UnsupportedBackend(PathBuf),

    /// Storage pool not registered
    #[error("Storage pool not found: {0}")]
    PoolNotFound(String),

    /// Volume not present in its pool
    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    /// Option parsing
    #[error(transparent)]
    Options(#[from] lunstore_common::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for block management operations
pub type BlockResult<T> = Result<T, BlockError>;

/// Why a command failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Malformed or unsupported request
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The backing store failed the transfer
    #[error("medium error at byte {offset} (read: {read})")]
    MediumError { offset: u64, read: bool },

    /// Out of space on the backing store
    #[error("space exhausted")]
    SpaceExhausted,

    /// Write to a read-only unit or store
    #[error("write protected")]
    WriteProtected,

    /// No usable backing store
    #[error("logical unit not ready")]
    NotReady,

    /// Aborted by the front end
    #[error("command aborted")]
    Aborted,
}

impl CommandError {
    /// Map an I/O error from an operation at byte `offset`.
    pub fn from_io(err: &io::Error, offset: u64, read: bool) -> Self {
        if let Some(code) = err.raw_os_error() {
            match code {
                libc::ENOSPC | libc::EDQUOT => return Self::SpaceExhausted,
                libc::EROFS | libc::EACCES | libc::EPERM if !read => return Self::WriteProtected,
                _ => {}
            }
        }
        match err.kind() {
            io::ErrorKind::StorageFull => Self::SpaceExhausted,
            io::ErrorKind::ReadOnlyFilesystem | io::ErrorKind::PermissionDenied if !read => {
                Self::WriteProtected
            }
            _ => Self::MediumError { offset, read },
        }
    }
}

/// Final status of a command, delivered exactly once to the front end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Ok,
    /// Answer to get-block-status: the run starting at the requested LBA
    BlockStatus { state: BlockState, blocks: u64 },
    /// Compare found differing data at `offset` bytes into the command
    Miscompare { offset: u64 },
    Failed(CommandError),
    Aborted,
}

impl Completion {
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok | Self::BlockStatus { .. })
    }
}

impl From<CommandError> for Completion {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Aborted => Self::Aborted,
            other => Self::Failed(other),
        }
    }
}
