//! Front-end hooks
//!
//! The protocol layer that owns the session implements [`FrontEnd`]. The
//! backend calls it to move data between the caller and a round's buffers,
//! to release read ordering, and to deliver the single completion of each
//! command.

use crate::command::Command;
use crate::context::ContextRef;
use crate::dispatch;
use crate::error::{CommandError, Completion};
use std::sync::Arc;

/// Data movement direction, as seen from the initiator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Caller's data into the round's buffers (write, compare)
    DataIn,
    /// Round's buffers out to the caller (read)
    DataOut,
}

/// Callbacks into the protocol layer
pub trait FrontEnd: Send + Sync {
    /// Move one round's data. The transfer may be finished inline or later
    /// from any thread.
    fn move_data(&self, transfer: DataTransfer);

    /// Deliver the command's final status. Called once per command.
    fn complete(&self, command: &Arc<Command>, completion: Completion);

    /// The read may stop blocking commands ordered behind it.
    fn serialization_done(&self, _command: &Arc<Command>) {}
}

/// One round's data handed to the front end
///
/// Dropping a transfer without calling [`DataTransfer::finish`] fails the
/// command as aborted.
pub struct DataTransfer {
    ctx: ContextRef,
    direction: Direction,
    finished: bool,
}

impl DataTransfer {
    pub(crate) const fn new(ctx: ContextRef, direction: Direction) -> Self {
        Self {
            ctx,
            direction,
            finished: false,
        }
    }

    pub fn command(&self) -> &Arc<Command> {
        self.ctx.command()
    }

    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Offset of this round within the command's data
    pub fn relative_offset(&self) -> u64 {
        self.ctx.relative_offset()
    }

    pub fn len(&self) -> u64 {
        self.ctx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ctx.is_empty()
    }

    /// Copy caller data into the round (data-in).
    pub fn fill_from(&self, src: &[u8]) -> usize {
        self.ctx.fill_from(src)
    }

    /// Copy the round's data out (data-out).
    pub fn copy_into(&self, dst: &mut [u8]) -> usize {
        self.ctx.copy_into(dst)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.ctx.to_vec()
    }

    /// Keep the round's buffers alive past `finish`, e.g. for zero-copy
    /// transmission.
    pub fn hold(&self) -> ContextRef {
        Arc::clone(&self.ctx)
    }

    /// Report the outcome of the transfer and let the command move on.
    pub fn finish(mut self, result: Result<(), CommandError>) {
        self.finished = true;
        dispatch::transfer_done(Arc::clone(&self.ctx), self.direction, result);
    }
}

impl Drop for DataTransfer {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            dispatch::transfer_done(
                Arc::clone(&self.ctx),
                self.direction,
                Err(CommandError::Aborted),
            );
        }
    }
}

impl std::fmt::Debug for DataTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTransfer")
            .field("tag", &self.command().tag())
            .field("direction", &self.direction)
            .field("relative_offset", &self.relative_offset())
            .field("len", &self.len())
            .finish()
    }
}
