//! Per-round command context
//!
//! An [`IoContext`] is one round of one in-flight command: its buffers, the
//! bookkeeping for the sub-operations issued against a device, and the first
//! error they reported. Contexts are shared as [`ContextRef`]; the dispatcher,
//! every in-flight bio and every front-end hold own one reference each, and
//! the buffers go back to the segment pool when the last reference drops.
//!
//! ```text
//!   round N:  Allocate ──► [DataIn] ──► Issue ──► bios ... ──► Finalize
//!                                                                 │
//!   cursor ◄──────────────────────────────────────────────────────┘
//!   round N+1 gets a fresh context
//! ```

use crate::backend::{Backend, Extent};
use crate::command::{Command, Cursor};
use crate::error::CommandError;
use crate::lun::LunShared;
use crate::segment::Segment;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Shared handle on a round
pub type ContextRef = Arc<IoContext>;

/// What a round does against the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RoundOp {
    Read,
    Write,
    /// Read into the first list to compare against the second
    Compare,
    Deallocate,
    Flush { whole: bool },
    Status,
}

impl RoundOp {
    pub const fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::Compare | Self::Status)
    }
}

/// Extent of one round
#[derive(Clone, Copy, Debug)]
pub(crate) struct Round {
    pub op: RoundOp,
    /// Device byte range
    pub offset: u64,
    pub length: u64,
    /// Byte offset of this round within the command's data
    pub rel_offset: u64,
    /// Cursor to install once this round finishes
    pub next: Option<Cursor>,
}

impl Round {
    pub const fn is_last(&self) -> bool {
        self.next.is_none()
    }
}

#[derive(Default)]
struct IssueState {
    sent: usize,
    completed: usize,
    send_complete: bool,
    first_error: Option<CommandError>,
    errors: u32,
    issuer: Option<ThreadId>,
    status: Option<Extent>,
}

/// One round of one command
pub struct IoContext {
    command: Arc<Command>,
    lun: Arc<LunShared>,
    backend: Arc<Backend>,
    round: Round,
    segments: Vec<Mutex<Segment>>,
    compare: Vec<Mutex<Segment>>,
    state: Mutex<IssueState>,
}

impl IoContext {
    pub(crate) fn new(
        lun: &Arc<LunShared>,
        command: Arc<Command>,
        backend: Arc<Backend>,
        round: Round,
        segments: Vec<Segment>,
        compare: Vec<Segment>,
    ) -> ContextRef {
        lun.context_created();
        Arc::new(Self {
            command,
            lun: Arc::clone(lun),
            backend,
            round,
            segments: segments.into_iter().map(Mutex::new).collect(),
            compare: compare.into_iter().map(Mutex::new).collect(),
            state: Mutex::new(IssueState::default()),
        })
    }

    pub const fn command(&self) -> &Arc<Command> {
        &self.command
    }

    /// Byte offset of this round within the command's data
    pub const fn relative_offset(&self) -> u64 {
        self.round.rel_offset
    }

    /// Bytes carried by this round
    pub const fn len(&self) -> u64 {
        self.round.length
    }

    pub const fn is_empty(&self) -> bool {
        self.round.length == 0
    }

    pub(crate) const fn lun(&self) -> &Arc<LunShared> {
        &self.lun
    }

    pub(crate) const fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub(crate) const fn round(&self) -> &Round {
        &self.round
    }

    /// List the front end fills on data-in: the compare list if present.
    fn data_in_list(&self) -> &[Mutex<Segment>] {
        if self.compare.is_empty() {
            &self.segments
        } else {
            &self.compare
        }
    }

    /// Copy data-out bytes into the round's buffers; returns bytes copied.
    pub fn fill_from(&self, src: &[u8]) -> usize {
        let mut done = 0;
        for seg in self.data_in_list() {
            if done == src.len() {
                break;
            }
            let mut seg = seg.lock();
            let dst = seg.as_mut_slice();
            let n = dst.len().min(src.len() - done);
            dst[..n].copy_from_slice(&src[done..done + n]);
            done += n;
        }
        done
    }

    /// Copy the round's data into `dst`; returns bytes copied.
    pub fn copy_into(&self, dst: &mut [u8]) -> usize {
        let mut done = 0;
        for seg in &self.segments {
            if done == dst.len() {
                break;
            }
            let seg = seg.lock();
            let src = seg.as_slice();
            let n = src.len().min(dst.len() - done);
            dst[done..done + n].copy_from_slice(&src[..n]);
            done += n;
        }
        done
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.round.length as usize];
        self.copy_into(&mut out);
        out
    }

    /// Fill every block of the round from `pattern` (one logical block).
    ///
    /// With `lba_data` the first four bytes of each block carry the low 32
    /// bits of its LBA, big-endian.
    pub(crate) fn fill_pattern(&self, pattern: &[u8], first_lba: u64, lba_data: bool) {
        let bs = pattern.len();
        let mut pos = 0usize;
        for seg in &self.segments {
            let mut seg = seg.lock();
            let buf = seg.as_mut_slice();
            let mut off = 0;
            while off < buf.len() {
                let in_block = pos % bs;
                let n = (bs - in_block).min(buf.len() - off);
                buf[off..off + n].copy_from_slice(&pattern[in_block..in_block + n]);
                if lba_data && in_block < 4 {
                    let stamp = ((first_lba + (pos / bs) as u64) as u32).to_be_bytes();
                    for k in in_block..4.min(in_block + n) {
                        buf[off + k - in_block] = stamp[k];
                    }
                }
                off += n;
                pos += n;
            }
        }
    }

    /// Byte offset within the round of the first difference between the
    /// data read and the data supplied.
    pub(crate) fn mismatch(&self) -> Option<u64> {
        let mut base = 0u64;
        for (read, want) in self.segments.iter().zip(&self.compare) {
            let read = read.lock();
            let want = want.lock();
            if let Some(at) = read
                .as_slice()
                .iter()
                .zip(want.as_slice())
                .position(|(a, b)| a != b)
            {
                return Some(base + at as u64);
            }
            base += read.len() as u64;
        }
        None
    }

    pub(crate) fn segment_lengths(&self) -> Vec<usize> {
        self.segments.iter().map(|s| s.lock().len()).collect()
    }

    pub(crate) fn with_segment<R>(&self, index: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        match self.segments.get(index) {
            Some(seg) => f(seg.lock().as_slice()),
            None => f(&[]),
        }
    }

    pub(crate) fn with_segment_mut<R>(&self, index: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match self.segments.get(index) {
            Some(seg) => f(seg.lock().as_mut_slice()),
            None => f(&mut []),
        }
    }

    /// Run `f` over the whole buffer list for a synchronous read.
    pub(crate) fn with_buffers_mut<R>(&self, f: impl FnOnce(&mut [&mut [u8]]) -> R) -> R {
        let mut guards: Vec<_> = self.segments.iter().map(|s| s.lock()).collect();
        let mut bufs: Vec<&mut [u8]> = guards.iter_mut().map(|g| g.as_mut_slice()).collect();
        f(&mut bufs)
    }

    /// Run `f` over the whole buffer list for a synchronous write.
    pub(crate) fn with_buffers<R>(&self, f: impl FnOnce(&[&[u8]]) -> R) -> R {
        let guards: Vec<_> = self.segments.iter().map(|s| s.lock()).collect();
        let bufs: Vec<&[u8]> = guards.iter().map(|g| g.as_slice()).collect();
        f(&bufs)
    }

    // ── Sub-operation accounting ────────────────────────────────────────

    /// Start issuing from the current thread.
    pub(crate) fn begin_issue(&self) {
        let mut state = self.state.lock();
        state.sent = 0;
        state.completed = 0;
        state.send_complete = false;
        state.issuer = Some(thread::current().id());
    }

    /// Count a sub-operation about to be submitted.
    pub(crate) fn issued(&self) {
        self.state.lock().sent += 1;
    }

    /// Everything is submitted. True when all of it already completed and
    /// the caller must finish the round.
    pub(crate) fn finish_issue(&self) -> bool {
        let mut state = self.state.lock();
        state.send_complete = true;
        state.completed == state.sent
    }

    /// One sub-operation completed. True for the completion that finishes
    /// the round.
    pub(crate) fn sub_done(&self, error: Option<CommandError>) -> bool {
        let mut state = self.state.lock();
        state.completed += 1;
        if let Some(error) = error {
            state.errors += 1;
            if state.first_error.is_none() {
                state.first_error = Some(error);
            }
        }
        state.send_complete && state.completed == state.sent
    }

    /// Record an error; the first one wins.
    pub(crate) fn record_error(&self, error: CommandError) {
        let mut state = self.state.lock();
        state.errors += 1;
        if state.first_error.is_none() {
            state.first_error = Some(error);
        }
    }

    pub(crate) fn first_error(&self) -> Option<CommandError> {
        self.state.lock().first_error.clone()
    }

    pub(crate) fn error_count(&self) -> u32 {
        self.state.lock().errors
    }

    pub(crate) fn on_issuing_thread(&self) -> bool {
        self.state.lock().issuer == Some(thread::current().id())
    }

    pub(crate) fn set_status(&self, extent: Extent) {
        self.state.lock().status = Some(extent);
    }

    pub(crate) fn status(&self) -> Option<Extent> {
        self.state.lock().status
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        let pool = self.lun.pool();
        for seg in self.segments.drain(..).chain(self.compare.drain(..)) {
            pool.release(seg.into_inner());
        }
        self.lun.context_released();
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("tag", &self.command.tag())
            .field("round", &self.round)
            .field("segments", &self.segments.len())
            .finish_non_exhaustive()
    }
}
