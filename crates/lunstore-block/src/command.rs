//! Command descriptors
//!
//! A [`Command`] is built by the front end, submitted to a logical unit and
//! shared (as `Arc<Command>`) between the dispatcher and the front end until
//! it completes. Besides the request itself it carries the abort flag, the
//! at-most-once completion latch and the continuation cursor of chunked
//! execution.

use crate::queue::QueueKind;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Operation requested by the front end
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Read,
    Write,
    /// Write that must be durable before completion
    WriteVerify,
    Compare,
    SynchronizeCache,
    Unmap,
    WriteSame,
    WriteZeroes,
    GetLbaStatus,
    DatasetManagement,
    /// Anything this backend does not implement
    Other(u16),
}

/// Dispatcher class of an opcode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IoClass {
    Read,
    Write,
    Flush,
    Unmap,
    WriteSame,
    WriteZeroes,
    Compare,
    GetBlockStatus,
    DatasetManagement,
    Other,
}

impl IoClass {
    pub const fn classify(opcode: Opcode) -> Self {
        match opcode {
            Opcode::Read => Self::Read,
            Opcode::Write | Opcode::WriteVerify => Self::Write,
            Opcode::Compare => Self::Compare,
            Opcode::SynchronizeCache => Self::Flush,
            Opcode::Unmap => Self::Unmap,
            Opcode::WriteSame => Self::WriteSame,
            Opcode::WriteZeroes => Self::WriteZeroes,
            Opcode::GetLbaStatus => Self::GetBlockStatus,
            Opcode::DatasetManagement => Self::DatasetManagement,
            Opcode::Other(_) => Self::Other,
        }
    }

    /// Whether the class modifies the medium
    pub const fn is_write(self) -> bool {
        matches!(
            self,
            Self::Write | Self::Unmap | Self::WriteSame | Self::WriteZeroes | Self::DatasetManagement
        )
    }

    /// Queue new and continuing commands of this class wait on
    pub(crate) const fn queue(self) -> QueueKind {
        match self {
            Self::Read | Self::Write | Self::Compare | Self::Other => QueueKind::Input,
            Self::Flush
            | Self::Unmap
            | Self::WriteSame
            | Self::WriteZeroes
            | Self::DatasetManagement => QueueKind::ConfigWrite,
            Self::GetBlockStatus => QueueKind::ConfigRead,
        }
    }
}

/// Modifier bits of a command
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandFlags {
    /// Force unit access: data durable before completion
    pub fua: bool,
    /// Deallocate (write-zeroes, dataset management) or unmap (write-same)
    pub deallocate: bool,
    /// Anchor the range; treated as deallocate
    pub anchor: bool,
    /// Write-same without a data-out buffer: the pattern is zeros
    pub no_data: bool,
    /// Flush: complete before the flush runs
    pub immediate: bool,
    /// Write-same: stamp each block with its LBA
    pub lba_data: bool,
}

/// One entry of an unmap or dataset-management range list
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockRange {
    pub lba: u64,
    pub blocks: u64,
    /// Context attributes, passed through untouched
    pub attributes: u32,
}

impl BlockRange {
    pub const fn new(lba: u64, blocks: u64) -> Self {
        Self {
            lba,
            blocks,
            attributes: 0,
        }
    }
}

/// Caller-owned parameter data that is not streamed through data movement
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Payload {
    #[default]
    None,
    /// One logical block, repeated by write-same
    Pattern(Bytes),
    /// Range list of unmap and dataset management
    Ranges(Vec<BlockRange>),
}

/// Where the next round of a chunked command starts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Cursor {
    /// Transfer (or pattern write) of `remaining` blocks from `lba`
    Blocks { lba: u64, remaining: u64 },
    /// Next entry of the range list
    Range { index: usize },
    /// One deallocation of the whole run
    Deallocate { lba: u64, blocks: u64 },
}

/// Execution progress recorded between rounds
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Progress {
    pub cursor: Option<Cursor>,
    /// Bytes moved by completed rounds
    pub bytes: u64,
    pub rounds: u32,
}

/// A block command
#[derive(Debug)]
pub struct Command {
    tag: u64,
    opcode: Opcode,
    lba: u64,
    blocks: u64,
    flags: CommandFlags,
    payload: Payload,
    admitted: Instant,
    aborted: AtomicBool,
    completed: AtomicBool,
    progress: Mutex<Progress>,
}

impl Command {
    pub fn new(tag: u64, opcode: Opcode, lba: u64, blocks: u64) -> Self {
        Self {
            tag,
            opcode,
            lba,
            blocks,
            flags: CommandFlags::default(),
            payload: Payload::None,
            admitted: Instant::now(),
            aborted: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            progress: Mutex::new(Progress::default()),
        }
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub const fn tag(&self) -> u64 {
        self.tag
    }

    pub const fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub const fn class(&self) -> IoClass {
        IoClass::classify(self.opcode)
    }

    pub const fn lba(&self) -> u64 {
        self.lba
    }

    pub const fn blocks(&self) -> u64 {
        self.blocks
    }

    pub const fn flags(&self) -> &CommandFlags {
        &self.flags
    }

    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// FUA was requested explicitly or implied by the opcode
    pub const fn fua(&self) -> bool {
        self.flags.fua || matches!(self.opcode, Opcode::WriteVerify)
    }

    /// Request an abort; honoured at the next round boundary.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Time since the command was built
    pub fn elapsed(&self) -> Duration {
        self.admitted.elapsed()
    }

    /// Bytes moved by the rounds completed so far
    pub fn bytes_done(&self) -> u64 {
        self.progress.lock().bytes
    }

    /// Latch the completion; false if the command already completed.
    pub(crate) fn mark_completed(&self) -> bool {
        !self.completed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn progress(&self) -> Progress {
        *self.progress.lock()
    }

    pub(crate) fn start(&self, cursor: Option<Cursor>) {
        let mut progress = self.progress.lock();
        progress.cursor = cursor;
    }

    /// Record a finished round and install the cursor of the next one.
    pub(crate) fn advance(&self, bytes: u64, next: Option<Cursor>) {
        let mut progress = self.progress.lock();
        progress.bytes += bytes;
        progress.rounds += 1;
        progress.cursor = next;
    }
}
