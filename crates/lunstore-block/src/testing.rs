//! Test doubles: a recording front end, an in-memory block device and a
//! bare runtime LUN without workers.

use crate::backend::device::DEFAULT_MAX_DISCARD;
use crate::backend::{Backend, Bio, BioOp, BlockDevice, DeviceGeometry, StoragePool, VolumeBackend};
use crate::command::Command;
use crate::context::ContextRef;
use crate::error::{CommandError, Completion};
use crate::frontend::{DataTransfer, Direction, FrontEnd};
use crate::lun::{LunGeometry, LunShared};
use crate::segment::SegmentPool;
use crossbeam_channel::Sender;
use lunstore_common::{LunId, SerializationPolicy};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// A runtime LUN over a 16 MiB pooled volume, with no workers.
pub(crate) fn bare_lun(front_end: Arc<dyn FrontEnd>) -> (Arc<LunShared>, Arc<Backend>) {
    let pool = StoragePool::new("bare", 64 << 20, 64 << 10);
    let volume = pool.create_volume("vol", 16 << 20, 512).unwrap();
    let backend = Arc::new(Backend::Volume(VolumeBackend::new(volume, false)));
    let lun = Arc::new(LunShared::new(
        LunId(0),
        "bare".to_string(),
        front_end,
        Arc::new(SegmentPool::default()),
        SerializationPolicy::Off,
        false,
        true,
    ));
    let geometry = LunGeometry {
        block_size: 512,
        capacity: (16 << 20) / 512,
        ..LunGeometry::default()
    };
    lun.attach(Arc::clone(&backend), geometry, false);
    (lun, backend)
}

// ── Recording front end ─────────────────────────────────────────────────

#[derive(Default)]
struct Recorded {
    data_in: HashMap<u64, Vec<u8>>,
    data_out: HashMap<u64, Vec<u8>>,
    completions: Vec<(u64, Completion)>,
    serialized: Vec<u64>,
    transfers: Vec<(u64, Direction, u64, u64)>,
    holds: Vec<ContextRef>,
    fail: HashSet<u64>,
    abort: HashSet<u64>,
}

/// Front end that supplies write data from a table, collects read data
/// and records every callback.
#[derive(Default)]
pub(crate) struct RecordingFrontEnd {
    inner: Mutex<Recorded>,
    done: Condvar,
    hold_data_out: AtomicBool,
}

impl RecordingFrontEnd {
    /// Data the front end hands over on data-in for `tag`.
    pub fn supply(&self, tag: u64, data: Vec<u8>) {
        self.inner.lock().data_in.insert(tag, data);
    }

    /// Keep a hold on every read round's buffers until `release_holds`.
    pub fn hold_reads(&self, on: bool) {
        self.hold_data_out.store(on, Ordering::SeqCst);
    }

    pub fn release_holds(&self) {
        let holds = std::mem::take(&mut self.inner.lock().holds);
        drop(holds);
    }

    /// Fail every transfer of `tag`.
    pub fn fail_transfers(&self, tag: u64) {
        self.inner.lock().fail.insert(tag);
    }

    /// Abort `tag` from inside its first transfer, then let the transfer
    /// succeed.
    pub fn abort_on_transfer(&self, tag: u64) {
        self.inner.lock().abort.insert(tag);
    }

    /// Wait for the completion of `tag`.
    pub fn wait(&self, tag: u64) -> Completion {
        let deadline = Instant::now() + WAIT_LIMIT;
        let mut inner = self.inner.lock();
        loop {
            if let Some((_, c)) = inner.completions.iter().find(|(t, _)| *t == tag) {
                return c.clone();
            }
            assert!(
                !self.done.wait_until(&mut inner, deadline).timed_out(),
                "tag {tag} never completed"
            );
        }
    }

    pub fn completion_count(&self, tag: u64) -> usize {
        self.inner
            .lock()
            .completions
            .iter()
            .filter(|(t, _)| *t == tag)
            .count()
    }

    pub fn completed(&self) -> usize {
        self.inner.lock().completions.len()
    }

    pub fn data_out(&self, tag: u64) -> Vec<u8> {
        self.inner.lock().data_out.get(&tag).cloned().unwrap_or_default()
    }

    pub fn serialized(&self) -> Vec<u64> {
        self.inner.lock().serialized.clone()
    }

    /// `(direction, relative offset, length)` of every transfer of `tag`
    pub fn transfers(&self, tag: u64) -> Vec<(Direction, u64, u64)> {
        self.inner
            .lock()
            .transfers
            .iter()
            .filter(|(t, ..)| *t == tag)
            .map(|&(_, d, off, len)| (d, off, len))
            .collect()
    }
}

impl FrontEnd for RecordingFrontEnd {
    fn move_data(&self, transfer: DataTransfer) {
        let tag = transfer.command().tag();
        let rel = transfer.relative_offset();
        let len = transfer.len();
        let mut inner = self.inner.lock();
        inner.transfers.push((tag, transfer.direction(), rel, len));

        if inner.fail.contains(&tag) {
            drop(inner);
            transfer.finish(Err(CommandError::Aborted));
            return;
        }

        if inner.abort.remove(&tag) {
            transfer.command().abort();
        }

        let (start, end) = (rel as usize, (rel + len) as usize);
        match transfer.direction() {
            Direction::DataIn => {
                let data = inner.data_in.get(&tag).map(Vec::as_slice).unwrap_or_default();
                let end = end.min(data.len());
                if start < end {
                    transfer.fill_from(&data[start..end]);
                }
            }
            Direction::DataOut => {
                let out = inner.data_out.entry(tag).or_default();
                if out.len() < end {
                    out.resize(end, 0);
                }
                transfer.copy_into(&mut out[start..end]);
                if self.hold_data_out.load(Ordering::SeqCst) {
                    inner.holds.push(transfer.hold());
                }
            }
        }
        drop(inner);
        transfer.finish(Ok(()));
    }

    fn complete(&self, command: &Arc<Command>, completion: Completion) {
        let mut inner = self.inner.lock();
        inner.completions.push((command.tag(), completion));
        drop(inner);
        self.done.notify_all();
    }

    fn serialization_done(&self, command: &Arc<Command>) {
        self.inner.lock().serialized.push(command.tag());
    }
}

// ── In-memory device ────────────────────────────────────────────────────

struct DeviceState {
    data: Mutex<Vec<u8>>,
    fail_at: Option<u64>,
    discards: AtomicUsize,
    bios: AtomicUsize,
}

impl DeviceState {
    fn execute(&self, bio: Bio) {
        self.bios.fetch_add(1, Ordering::SeqCst);
        let (offset, len) = (bio.offset(), bio.len());
        if self
            .fail_at
            .is_some_and(|at| at >= offset && at < offset + len.max(1))
        {
            bio.complete(Err(io::Error::from_raw_os_error(libc::EIO)));
            return;
        }

        let start = offset as usize;
        let result = match bio.op() {
            BioOp::Read => {
                let data = self.data.lock();
                bio.with_buffer_mut(|buf| {
                    let from = start.min(data.len());
                    let end = (start + buf.len()).min(data.len());
                    let n = end - from;
                    buf[..n].copy_from_slice(&data[from..end]);
                    buf[n..].fill(0);
                });
                Ok(())
            }
            BioOp::Write { .. } => {
                let mut data = self.data.lock();
                bio.with_buffer(|buf| {
                    let end = start + buf.len();
                    if end > data.len() {
                        Err(io::Error::from_raw_os_error(libc::ENOSPC))
                    } else {
                        data[start..end].copy_from_slice(buf);
                        Ok(())
                    }
                })
            }
            BioOp::Discard => {
                self.discards.fetch_add(1, Ordering::SeqCst);
                let mut data = self.data.lock();
                let end = (start + len as usize).min(data.len());
                if start < end {
                    data[start..end].fill(0);
                }
                Ok(())
            }
            BioOp::Flush => Ok(()),
        };
        bio.complete(result);
    }
}

/// In-memory [`BlockDevice`] completing bios inline, or on a helper thread
/// after [`InlineDevice::threaded`].
pub(crate) struct InlineDevice {
    state: Arc<DeviceState>,
    geometry: DeviceGeometry,
    helper: Option<Sender<Bio>>,
}

impl InlineDevice {
    pub fn new(size: u64) -> Self {
        Self {
            state: Arc::new(DeviceState {
                data: Mutex::new(vec![0; size as usize]),
                fail_at: None,
                discards: AtomicUsize::new(0),
                bios: AtomicUsize::new(0),
            }),
            geometry: DeviceGeometry {
                size,
                sector_size: 512,
                physical_block_size: 4096,
                max_discard_bytes: DEFAULT_MAX_DISCARD,
                read_only: false,
            },
            helper: None,
        }
    }

    #[must_use]
    pub fn with_max_discard(mut self, bytes: u64) -> Self {
        self.geometry.max_discard_bytes = bytes;
        self
    }

    /// Fail any bio covering byte `offset` with EIO.
    #[must_use]
    pub fn failing_at(self, offset: u64) -> Self {
        let data = std::mem::take(&mut *self.state.data.lock());
        Self {
            state: Arc::new(DeviceState {
                data: Mutex::new(data),
                fail_at: Some(offset),
                discards: AtomicUsize::new(0),
                bios: AtomicUsize::new(0),
            }),
            ..self
        }
    }

    /// Complete every bio on a separate thread.
    #[must_use]
    pub fn threaded(self) -> Self {
        self.with_helper(Duration::ZERO)
    }

    /// Complete every bio on a separate thread, `delay` after it arrives.
    #[must_use]
    pub fn delayed(self, delay: Duration) -> Self {
        self.with_helper(delay)
    }

    fn with_helper(mut self, delay: Duration) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Bio>();
        let state = Arc::clone(&self.state);
        thread::Builder::new()
            .name("inline-dev".to_string())
            .spawn(move || {
                for bio in rx {
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    state.execute(bio);
                }
            })
            .unwrap();
        self.helper = Some(tx);
        self
    }

    pub fn discards(&self) -> usize {
        self.state.discards.load(Ordering::SeqCst)
    }

    pub fn bios(&self) -> usize {
        self.state.bios.load(Ordering::SeqCst)
    }

    pub fn read_back(&self, offset: usize, len: usize) -> Vec<u8> {
        self.state.data.lock()[offset..offset + len].to_vec()
    }
}

impl BlockDevice for InlineDevice {
    fn submit(&self, bio: Bio) {
        match &self.helper {
            Some(tx) => {
                if let Err(err) = tx.send(bio) {
                    drop(err.into_inner());
                }
            }
            None => self.state.execute(bio),
        }
    }

    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }
}
