//! Command dispatch
//!
//! Every command runs the same state machine:
//!
//! ```text
//! Classify ─► Allocate ─► (Issue ─► AwaitCompletion)* ─► Finalize
//!                ▲                                          │
//!                └──────── Continue (cursor on command) ◄───┘
//! ```
//!
//! Admission checks run once, on the first round. Each round gets a fresh
//! [`IoContext`]; the cursor for the next round lives on the command, so a
//! front-end hold on an earlier round never aliases the buffers of a later
//! one.

use crate::backend::{Backend, BackingStore, Bio, BioOp, DeviceBackend, Extent};
use crate::command::{Command, Cursor, IoClass, Payload};
use crate::context::{ContextRef, IoContext, Round, RoundOp};
use crate::error::{CommandError, Completion};
use crate::frontend::{DataTransfer, Direction};
use crate::lun::LunShared;
use crate::queue::Work;
use crate::segment::Segment;
use crate::{HALF_IO_SIZE, MAX_IO_SIZE};
use lunstore_common::{BlockState, SerializationPolicy};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// How long a worker waits on the segment pool before checking its queues
const POOL_WAIT: Duration = Duration::from_millis(10);

/// Run one work item on a worker thread.
pub(crate) fn run(lun: &Arc<LunShared>, work: Work) {
    match work {
        Work::Start(cmd) => start(lun, cmd),
        Work::Continue(cmd) => match lun.backend() {
            Some(backend) => next_round(lun, cmd, backend),
            None => lun.complete(&cmd, Completion::Failed(CommandError::NotReady)),
        },
        Work::DataReady(ctx) => issue(ctx),
        Work::RoundDone(ctx) => finish_round(ctx),
    }
}

// ── Classify ────────────────────────────────────────────────────────────

enum Admission {
    /// Proceed with this initial cursor
    Run(Option<Cursor>),
    /// Complete without touching the store
    Done(Completion),
}

fn start(lun: &Arc<LunShared>, cmd: Arc<Command>) {
    let Some(backend) = lun.backend() else {
        lun.complete(&cmd, Completion::Failed(CommandError::NotReady));
        return;
    };

    match admit(lun, &cmd) {
        Admission::Done(completion) => lun.complete(&cmd, completion),
        Admission::Run(cursor) => {
            cmd.start(cursor);
            if cmd.class() == IoClass::Read && lun.serialization() == SerializationPolicy::Off {
                lun.front_end().serialization_done(&cmd);
            }
            next_round(lun, cmd, backend);
        }
    }
}

fn invalid(why: &'static str) -> Admission {
    Admission::Done(Completion::Failed(CommandError::InvalidParameter(why)))
}

fn write_protected() -> Admission {
    Admission::Done(Completion::Failed(CommandError::WriteProtected))
}

fn admit(lun: &LunShared, cmd: &Command) -> Admission {
    let geometry = lun.geometry();
    let class = cmd.class();
    let (lba, blocks) = (cmd.lba(), cmd.blocks());
    let flags = cmd.flags();

    match class {
        IoClass::Other => invalid("unsupported opcode"),

        IoClass::Read | IoClass::Write | IoClass::Compare => {
            if !geometry.contains(lba, blocks) {
                return invalid("LBA out of range");
            }
            if class == IoClass::Write && lun.is_read_only() {
                return write_protected();
            }
            if blocks == 0 {
                return Admission::Done(Completion::Ok);
            }
            Admission::Run(Some(Cursor::Blocks {
                lba,
                remaining: blocks,
            }))
        }

        IoClass::WriteSame => {
            if lun.is_read_only() {
                return write_protected();
            }
            let blocks = if blocks == 0 {
                if lba >= geometry.capacity {
                    return invalid("LBA out of range");
                }
                geometry.capacity - lba
            } else if geometry.contains(lba, blocks) {
                blocks
            } else {
                return invalid("LBA out of range");
            };

            if flags.deallocate || flags.anchor {
                if !lun.can_deallocate() {
                    return invalid("unmap not supported");
                }
                return Admission::Run(Some(Cursor::Deallocate { lba, blocks }));
            }
            if !flags.no_data {
                match cmd.payload() {
                    Payload::Pattern(p) if p.len() == geometry.block_size as usize => {}
                    _ => return invalid("write same needs one block of data"),
                }
            }
            Admission::Run(Some(Cursor::Blocks {
                lba,
                remaining: blocks,
            }))
        }

        IoClass::WriteZeroes => {
            if lun.is_read_only() {
                return write_protected();
            }
            if !geometry.contains(lba, blocks) {
                return invalid("LBA out of range");
            }
            if blocks == 0 {
                return Admission::Done(Completion::Ok);
            }
            if flags.deallocate && lun.can_deallocate() {
                Admission::Run(Some(Cursor::Deallocate { lba, blocks }))
            } else {
                Admission::Run(Some(Cursor::Blocks {
                    lba,
                    remaining: blocks,
                }))
            }
        }

        IoClass::Unmap | IoClass::DatasetManagement => {
            if class == IoClass::DatasetManagement && (!flags.deallocate || !lun.can_deallocate()) {
                // Advisory only
                return Admission::Done(Completion::Ok);
            }
            if lun.is_read_only() {
                return write_protected();
            }
            if !lun.can_deallocate() {
                return invalid("unmap not supported");
            }
            let Payload::Ranges(ranges) = cmd.payload() else {
                return invalid("missing range list");
            };
            if ranges.iter().any(|r| !geometry.contains(r.lba, r.blocks)) {
                return invalid("range out of bounds");
            }
            Admission::Run(Some(Cursor::Range { index: 0 }))
        }

        IoClass::Flush => {
            if (lba, blocks) != (0, 0) && !geometry.contains(lba, blocks) {
                return invalid("LBA out of range");
            }
            Admission::Run(None)
        }

        IoClass::GetBlockStatus => {
            if lba >= geometry.capacity {
                return invalid("LBA out of range");
            }
            Admission::Run(None)
        }
    }
}

// ── Allocate ────────────────────────────────────────────────────────────

fn next_round(lun: &Arc<LunShared>, cmd: Arc<Command>, backend: Arc<Backend>) {
    if cmd.is_aborted() {
        lun.complete(&cmd, Completion::Aborted);
        return;
    }

    let progress = cmd.progress();
    let geometry = lun.geometry();
    let bs = u64::from(geometry.block_size);
    let class = cmd.class();

    let round = match (class, progress.cursor) {
        (IoClass::Flush, _) => Round {
            op: RoundOp::Flush {
                whole: cmd.lba() == 0 && cmd.blocks() == 0,
            },
            offset: cmd.lba() * bs,
            length: cmd.blocks() * bs,
            rel_offset: 0,
            next: None,
        },
        (IoClass::GetBlockStatus, _) => Round {
            op: RoundOp::Status,
            offset: cmd.lba() * bs,
            length: 0,
            rel_offset: 0,
            next: None,
        },
        (_, Some(Cursor::Deallocate { lba, blocks })) => Round {
            op: RoundOp::Deallocate,
            offset: lba * bs,
            length: blocks * bs,
            rel_offset: 0,
            next: None,
        },
        (_, Some(Cursor::Range { index })) => {
            let ranges = match cmd.payload() {
                Payload::Ranges(ranges) => ranges.as_slice(),
                _ => &[],
            };
            let Some((at, range)) = ranges
                .iter()
                .enumerate()
                .skip(index)
                .find(|(_, r)| r.blocks > 0)
            else {
                lun.complete(&cmd, Completion::Ok);
                return;
            };
            Round {
                op: RoundOp::Deallocate,
                offset: range.lba * bs,
                length: range.blocks * bs,
                rel_offset: progress.bytes,
                next: (at + 1 < ranges.len()).then_some(Cursor::Range { index: at + 1 }),
            }
        }
        (_, Some(Cursor::Blocks { lba, remaining })) => {
            let max = if class == IoClass::Compare {
                HALF_IO_SIZE
            } else {
                MAX_IO_SIZE
            } as u64;
            let mut blocks = remaining.min((max / bs).max(1));
            if blocks < remaining {
                blocks = geometry.align_round_end(lba, blocks);
            }
            let op = match class {
                IoClass::Read => RoundOp::Read,
                IoClass::Compare => RoundOp::Compare,
                _ => RoundOp::Write,
            };
            Round {
                op,
                offset: lba * bs,
                length: blocks * bs,
                rel_offset: progress.bytes,
                next: (blocks < remaining).then_some(Cursor::Blocks {
                    lba: lba + blocks,
                    remaining: remaining - blocks,
                }),
            }
        }
        (_, None) => {
            lun.complete(&cmd, Completion::Ok);
            return;
        }
    };

    trace!(
        "lun{} tag {} round {}: {:?} {}+{}",
        lun.id(),
        cmd.tag(),
        progress.rounds,
        round.op,
        round.offset,
        round.length
    );

    let len = round.length as usize;
    let both = [len, len];
    let lengths = match round.op {
        RoundOp::Compare => &both[..],
        RoundOp::Read | RoundOp::Write => &both[..1],
        _ => &both[..0],
    };
    let Some(mut lists) = reserve(lun, &cmd, lengths) else {
        return;
    };
    let compare = if round.op == RoundOp::Compare {
        lists.pop().unwrap_or_default()
    } else {
        Vec::new()
    };
    let segments = lists.pop().unwrap_or_default();

    let first_lba = round.offset / bs;
    let ctx = IoContext::new(lun, Arc::clone(&cmd), backend, round, segments, compare);

    match class {
        IoClass::Write | IoClass::Compare => {
            lun.front_end()
                .move_data(DataTransfer::new(ctx, Direction::DataIn));
        }
        IoClass::WriteSame if round.op == RoundOp::Write => {
            match cmd.payload() {
                Payload::Pattern(pattern) if !cmd.flags().no_data => {
                    ctx.fill_pattern(pattern, first_lba, cmd.flags().lba_data);
                }
                _ => ctx.fill_pattern(&vec![0u8; bs as usize], first_lba, cmd.flags().lba_data),
            }
            issue(ctx);
        }
        IoClass::WriteZeroes if round.op == RoundOp::Write => {
            ctx.fill_pattern(&vec![0u8; bs as usize], first_lba, false);
            issue(ctx);
        }
        IoClass::Flush if cmd.flags().immediate => {
            lun.complete(&cmd, Completion::Ok);
            issue(ctx);
        }
        _ => issue(ctx),
    }
}

/// Reserve a round's buffers. While the pool is exhausted, rounds of this
/// unit that already hold buffers go first: if any are queued the command is
/// requeued and `None` returned, so a worker can finish them.
fn reserve(
    lun: &Arc<LunShared>,
    cmd: &Arc<Command>,
    lengths: &[usize],
) -> Option<Vec<Vec<Segment>>> {
    if lengths.is_empty() {
        return Some(Vec::new());
    }
    loop {
        if let Some(lists) = lun.pool().try_acquire_lists(lengths, POOL_WAIT) {
            return Some(lists);
        }
        if lun.queues().has_data_ready() {
            trace!("lun{} tag {}: segment pool exhausted, requeued", lun.id(), cmd.tag());
            lun.queues().push(Work::Continue(Arc::clone(cmd)));
            return None;
        }
    }
}

// ── Issue ───────────────────────────────────────────────────────────────

/// Submit the round to its store.
pub(crate) fn issue(ctx: ContextRef) {
    let round = *ctx.round();
    if round.op == RoundOp::Read
        && round.is_last()
        && ctx.lun().serialization() == SerializationPolicy::Soft
    {
        ctx.lun().front_end().serialization_done(ctx.command());
    }

    let backend = Arc::clone(ctx.backend());
    let done = match backend.as_ref() {
        Backend::File(store) => {
            issue_sync(store, &ctx);
            true
        }
        Backend::Volume(store) => {
            issue_sync(store, &ctx);
            true
        }
        Backend::Device(device) => issue_device(device, &ctx),
    };
    if done {
        finish_round(ctx);
    }
}

fn issue_sync(store: &dyn BackingStore, ctx: &IoContext) {
    let round = ctx.round();
    let result = match round.op {
        RoundOp::Read | RoundOp::Compare => ctx.with_buffers_mut(|bufs| {
            store
                .read(round.offset, bufs)
                .or_else(|_| locate_read(store, round.offset, bufs))
        }),
        RoundOp::Write => {
            let fua = ctx.command().fua();
            ctx.with_buffers(|bufs| {
                store
                    .write(round.offset, bufs, fua)
                    .or_else(|_| locate_write(store, round.offset, bufs, fua))
            })
        }
        RoundOp::Deallocate => store
            .deallocate(round.offset, round.length)
            .map_err(|e| (e, round.offset)),
        RoundOp::Flush { whole } => store.flush(whole).map_err(|e| (e, round.offset)),
        RoundOp::Status => {
            ctx.set_status(store.status(round.offset));
            Ok(())
        }
    };

    if let Err((e, at)) = result {
        warn!("lun{}: {:?} at byte {at} failed: {e}", ctx.lun().id(), round.op);
        ctx.record_error(CommandError::from_io(&e, at, round.op.is_read()));
    }
}

/// Replay a failed vectored read one segment at a time, reporting the
/// offset of the segment that fails.
fn locate_read(
    store: &dyn BackingStore,
    offset: u64,
    bufs: &mut [&mut [u8]],
) -> Result<(), (io::Error, u64)> {
    let mut pos = offset;
    for buf in bufs.iter_mut() {
        let len = buf.len() as u64;
        store
            .read(pos, std::slice::from_mut(buf))
            .map_err(|e| (e, pos))?;
        pos += len;
    }
    Ok(())
}

fn locate_write(
    store: &dyn BackingStore,
    offset: u64,
    bufs: &[&[u8]],
    fua: bool,
) -> Result<(), (io::Error, u64)> {
    let mut pos = offset;
    for buf in bufs {
        store
            .write(pos, std::slice::from_ref(buf), fua)
            .map_err(|e| (e, pos))?;
        pos += buf.len() as u64;
    }
    Ok(())
}

/// Submit one bio per segment or discard chunk. True when every bio has
/// already completed and the caller finishes the round.
fn issue_device(device: &DeviceBackend, ctx: &ContextRef) -> bool {
    let round = *ctx.round();
    ctx.begin_issue();

    match round.op {
        RoundOp::Read | RoundOp::Compare | RoundOp::Write => {
            let op = if round.op == RoundOp::Write {
                BioOp::Write {
                    fua: ctx.command().fua(),
                }
            } else {
                BioOp::Read
            };
            let mut offset = round.offset;
            for (index, len) in ctx.segment_lengths().into_iter().enumerate() {
                ctx.issued();
                device.submit(Bio::new(op, offset, len as u64, Some(index), Arc::clone(ctx)));
                offset += len as u64;
            }
        }
        RoundOp::Deallocate => {
            for (offset, len) in device.discard_chunks(round.offset, round.length) {
                ctx.issued();
                device.submit(Bio::new(BioOp::Discard, offset, len, None, Arc::clone(ctx)));
            }
        }
        RoundOp::Flush { .. } => {
            ctx.issued();
            device.submit(Bio::new(
                BioOp::Flush,
                round.offset,
                round.length,
                None,
                Arc::clone(ctx),
            ));
        }
        RoundOp::Status => {
            let size = device.geometry().size;
            ctx.set_status(Extent::unknown(size.saturating_sub(round.offset)));
        }
    }

    ctx.finish_issue()
}

// ── AwaitCompletion ─────────────────────────────────────────────────────

/// The last sub-operation of a round completed. Continue inline on the
/// issuing thread, otherwise hand the round back to a worker.
pub(crate) fn round_ready(ctx: ContextRef) {
    if ctx.on_issuing_thread() {
        finish_round(ctx);
    } else {
        let lun = Arc::clone(ctx.lun());
        lun.queues().push(Work::RoundDone(ctx));
    }
}

/// The front end finished moving a round's data.
pub(crate) fn transfer_done(ctx: ContextRef, direction: Direction, result: Result<(), CommandError>) {
    let lun = Arc::clone(ctx.lun());
    match (direction, result) {
        (_, Err(err)) => {
            let cmd = Arc::clone(ctx.command());
            drop(ctx);
            debug!("lun{} tag {}: data movement failed: {err}", lun.id(), cmd.tag());
            lun.complete(&cmd, err.into());
        }
        (Direction::DataIn, Ok(())) => lun.queues().push(Work::DataReady(ctx)),
        (Direction::DataOut, Ok(())) => advance(&lun, ctx),
    }
}

// ── Finalize ────────────────────────────────────────────────────────────

pub(crate) fn finish_round(ctx: ContextRef) {
    let lun = Arc::clone(ctx.lun());
    let cmd = Arc::clone(ctx.command());
    let round = *ctx.round();

    if let Some(err) = ctx.first_error() {
        let suppressed = ctx.error_count().saturating_sub(1);
        if suppressed > 0 {
            debug!("lun{} tag {}: {suppressed} further errors", lun.id(), cmd.tag());
        }
        drop(ctx);
        if matches!(round.op, RoundOp::Flush { .. }) && cmd.flags().immediate {
            error!("lun{}: immediate flush failed after completion: {err}", lun.id());
            return;
        }
        lun.complete(&cmd, err.into());
        return;
    }

    match round.op {
        RoundOp::Read => {
            if round.is_last()
                && matches!(
                    lun.serialization(),
                    SerializationPolicy::Read | SerializationPolicy::On
                )
            {
                lun.front_end().serialization_done(&cmd);
            }
            lun.front_end()
                .move_data(DataTransfer::new(ctx, Direction::DataOut));
        }
        RoundOp::Compare => match ctx.mismatch() {
            Some(at) => {
                let offset = round.rel_offset + at;
                drop(ctx);
                lun.complete(&cmd, Completion::Miscompare { offset });
            }
            None => advance(&lun, ctx),
        },
        RoundOp::Status => {
            let extent = ctx.status().unwrap_or(Extent::unknown(0));
            drop(ctx);
            let completion = block_status(&lun, &cmd, extent);
            lun.complete(&cmd, completion);
        }
        RoundOp::Flush { .. } if cmd.flags().immediate => {}
        _ => advance(&lun, ctx),
    }
}

/// Record the finished round and either complete or requeue the command.
fn advance(lun: &Arc<LunShared>, ctx: ContextRef) {
    let cmd = Arc::clone(ctx.command());
    let round = *ctx.round();
    cmd.advance(round.length, round.next);
    drop(ctx);

    match round.next {
        None => lun.complete(&cmd, Completion::Ok),
        Some(_) if cmd.is_aborted() => lun.complete(&cmd, Completion::Aborted),
        Some(_) => lun.queues().push(Work::Continue(cmd)),
    }
}

/// Convert a byte extent into the block-status answer.
///
/// Mapped runs round up to whole blocks, unmapped runs round down; an
/// unmapped run shorter than a block is reported as one mapped block.
fn block_status(lun: &LunShared, cmd: &Command, extent: Extent) -> Completion {
    let geometry = lun.geometry();
    let bs = u64::from(geometry.block_size);
    let left = geometry.capacity.saturating_sub(cmd.lba());

    let (state, blocks) = match extent.state {
        BlockState::Mapped => (BlockState::Mapped, extent.length.div_ceil(bs)),
        BlockState::Unmapped => match extent.length / bs {
            0 => (BlockState::Mapped, 1),
            n => (BlockState::Unmapped, n),
        },
        BlockState::Unknown => (BlockState::Unknown, left),
    };
    Completion::BlockStatus {
        state,
        blocks: blocks.clamp(1, left.max(1)),
    }
}
