//! In-process front end
//!
//! [`LocalInitiator`] drives logical units without a wire protocol. Write
//! data is taken from a caller-owned [`Bytes`], read data is gathered into a
//! buffer, and the completion is returned through a oneshot channel so the
//! caller can await it or block on it.

use crate::command::{Command, CommandFlags, Opcode, Payload};
use crate::error::{CommandError, Completion};
use crate::frontend::{DataTransfer, Direction, FrontEnd};
use crate::lun::LogicalUnit;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{trace, warn};

/// Completion plus any data the unit returned
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub completion: Completion,
    pub data: Bytes,
}

impl Response {
    pub const fn is_ok(&self) -> bool {
        self.completion.is_ok()
    }
}

struct Pending {
    data_in: Bytes,
    data_out: Vec<u8>,
    done: Option<oneshot::Sender<Completion>>,
}

/// Front end backed by an in-memory table of outstanding commands
#[derive(Default)]
pub struct LocalInitiator {
    pending: DashMap<u64, Pending>,
    next_tag: AtomicU64,
}

impl LocalInitiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A command with a fresh tag
    pub fn command(&self, opcode: Opcode, lba: u64, blocks: u64) -> Command {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        Command::new(tag, opcode, lba, blocks)
    }

    /// Number of commands submitted and not yet collected
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    fn register(&self, cmd: &Command, data_in: Bytes) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            cmd.tag(),
            Pending {
                data_in,
                data_out: Vec::new(),
                done: Some(tx),
            },
        );
        rx
    }

    fn collect(&self, tag: u64, completion: Completion) -> Response {
        let data = self
            .pending
            .remove(&tag)
            .map(|(_, p)| Bytes::from(p.data_out))
            .unwrap_or_default();
        Response { completion, data }
    }

    /// Submit `cmd` to `lun` and wait for its completion. `data_in` is the
    /// data-in stream for writes and compares.
    pub async fn execute(&self, lun: &LogicalUnit, cmd: Command, data_in: Bytes) -> Response {
        let tag = cmd.tag();
        let rx = self.register(&cmd, data_in);
        lun.submit(Arc::new(cmd));
        let completion = rx.await.unwrap_or(Completion::Aborted);
        self.collect(tag, completion)
    }

    /// Blocking form of [`execute`](Self::execute), for callers outside a
    /// runtime.
    pub fn execute_blocking(&self, lun: &LogicalUnit, cmd: Command, data_in: Bytes) -> Response {
        let tag = cmd.tag();
        let rx = self.register(&cmd, data_in);
        lun.submit(Arc::new(cmd));
        let completion = rx.blocking_recv().unwrap_or(Completion::Aborted);
        self.collect(tag, completion)
    }

    pub async fn read(&self, lun: &LogicalUnit, lba: u64, blocks: u64) -> Response {
        let cmd = self.command(Opcode::Read, lba, blocks);
        self.execute(lun, cmd, Bytes::new()).await
    }

    /// Write `data`, which must be a whole number of blocks.
    pub async fn write(&self, lun: &LogicalUnit, lba: u64, data: Bytes, fua: bool) -> Response {
        let blocks = blocks_of(lun, &data);
        let cmd = self.command(Opcode::Write, lba, blocks).with_flags(CommandFlags {
            fua,
            ..CommandFlags::default()
        });
        self.execute(lun, cmd, data).await
    }

    pub async fn compare(&self, lun: &LogicalUnit, lba: u64, data: Bytes) -> Response {
        let blocks = blocks_of(lun, &data);
        let cmd = self.command(Opcode::Compare, lba, blocks);
        self.execute(lun, cmd, data).await
    }

    /// Flush the whole unit.
    pub async fn flush(&self, lun: &LogicalUnit) -> Response {
        let cmd = self.command(Opcode::SynchronizeCache, 0, 0);
        self.execute(lun, cmd, Bytes::new()).await
    }

    /// Fill `blocks` blocks from `lba` with one block of `pattern`.
    pub async fn write_same(
        &self,
        lun: &LogicalUnit,
        lba: u64,
        blocks: u64,
        pattern: Bytes,
    ) -> Response {
        let cmd = self
            .command(Opcode::WriteSame, lba, blocks)
            .with_payload(Payload::Pattern(pattern));
        self.execute(lun, cmd, Bytes::new()).await
    }
}

fn blocks_of(lun: &LogicalUnit, data: &Bytes) -> u64 {
    let bs = u64::from(lun.geometry().block_size.max(1));
    data.len() as u64 / bs
}

impl FrontEnd for LocalInitiator {
    fn move_data(&self, transfer: DataTransfer) {
        let tag = transfer.command().tag();
        let Some(mut pending) = self.pending.get_mut(&tag) else {
            warn!("tag {tag}: data movement for an unknown command");
            transfer.finish(Err(CommandError::Aborted));
            return;
        };

        let start = transfer.relative_offset() as usize;
        let len = transfer.len() as usize;
        match transfer.direction() {
            Direction::DataIn => {
                let from = start.min(pending.data_in.len());
                let to = (start + len).min(pending.data_in.len());
                let chunk = pending.data_in.slice(from..to);
                drop(pending);
                if chunk.len() < len {
                    trace!("tag {tag}: short data-in ({} of {len} bytes)", chunk.len());
                }
                transfer.fill_from(&chunk);
            }
            Direction::DataOut => {
                let out = &mut pending.data_out;
                if out.len() < start + len {
                    out.resize(start + len, 0);
                }
                transfer.copy_into(&mut out[start..start + len]);
                drop(pending);
            }
        }
        transfer.finish(Ok(()));
    }

    fn complete(&self, command: &Arc<Command>, completion: Completion) {
        let tag = command.tag();
        let sender = self.pending.get_mut(&tag).and_then(|mut p| p.done.take());
        match sender {
            Some(tx) => {
                if tx.send(completion).is_err() {
                    // Caller went away
                    self.pending.remove(&tag);
                }
            }
            None => warn!("tag {tag}: completion for an unknown command"),
        }
    }
}

impl std::fmt::Debug for LocalInitiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalInitiator")
            .field("outstanding", &self.pending.len())
            .finish()
    }
}
