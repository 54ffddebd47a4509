//! Asynchronous block-device backing store
//!
//! The dispatcher turns a round into [`Bio`]s, one per segment or discard
//! chunk, and submits them to a [`BlockDevice`]. `submit` must not wait for
//! the I/O; the device later calls [`Bio::complete`] from any thread. The
//! round finishes when the last bio completes.
//!
//! [`RawDevice`] is the stock device: a crossbeam channel drained by a few
//! I/O threads doing positioned I/O against a device node (or a regular
//! file standing in for one).

use super::StoreGeometry;
use crate::context::ContextRef;
use crate::dispatch;
use crate::error::CommandError;
use crossbeam_channel::{Receiver, Sender};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, FileTypeExt, MetadataExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// Default cap on a single discard
pub const DEFAULT_MAX_DISCARD: u64 = 1 << 30;

/// Physical operation carried by a bio
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BioOp {
    Read,
    Write { fua: bool },
    Flush,
    Discard,
}

/// One physical operation of a round
///
/// Holds a reference on its round's context until completed. A bio dropped
/// without [`Bio::complete`] fails its round with a medium error.
pub struct Bio {
    op: BioOp,
    offset: u64,
    length: u64,
    segment: Option<usize>,
    ctx: Option<ContextRef>,
}

impl Bio {
    pub(crate) const fn new(
        op: BioOp,
        offset: u64,
        length: u64,
        segment: Option<usize>,
        ctx: ContextRef,
    ) -> Self {
        Self {
            op,
            offset,
            length,
            segment,
            ctx: Some(ctx),
        }
    }

    pub const fn op(&self) -> BioOp {
        self.op
    }

    /// Device byte offset
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    pub const fn len(&self) -> u64 {
        self.length
    }

    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Run `f` over the bio's data (empty for flush and discard).
    pub fn with_buffer<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match (&self.ctx, self.segment) {
            (Some(ctx), Some(index)) => ctx.with_segment(index, f),
            _ => f(&[]),
        }
    }

    /// Run `f` over the bio's buffer for filling by a read.
    pub fn with_buffer_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match (&self.ctx, self.segment) {
            (Some(ctx), Some(index)) => ctx.with_segment_mut(index, f),
            _ => f(&mut []),
        }
    }

    /// Report the outcome; callable from any thread.
    pub fn complete(mut self, result: io::Result<()>) {
        if let Some(ctx) = self.ctx.take() {
            finish(ctx, self.op, self.offset, result);
        }
    }
}

impl Drop for Bio {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            finish(
                ctx,
                self.op,
                self.offset,
                Err(io::Error::other("bio dropped before completion")),
            );
        }
    }
}

impl std::fmt::Debug for Bio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bio")
            .field("op", &self.op)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

fn finish(ctx: ContextRef, op: BioOp, offset: u64, result: io::Result<()>) {
    let error = result.err().map(|e| {
        warn!("{op:?} at byte {offset} failed: {e}");
        CommandError::from_io(&e, offset, op == BioOp::Read)
    });
    if ctx.sub_done(error) {
        dispatch::round_ready(ctx);
    }
}

/// Geometry of an asynchronous device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceGeometry {
    pub size: u64,
    pub sector_size: u32,
    pub physical_block_size: u32,
    /// Largest single discard; 0 when discard is unsupported
    pub max_discard_bytes: u64,
    pub read_only: bool,
}

/// Asynchronous device contract
pub trait BlockDevice: Send + Sync {
    /// Queue `bio` without waiting for the I/O.
    fn submit(&self, bio: Bio);

    fn geometry(&self) -> DeviceGeometry;
}

/// Adapter between the dispatcher and a [`BlockDevice`]
pub struct DeviceBackend {
    device: Arc<dyn BlockDevice>,
}

impl DeviceBackend {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn geometry(&self) -> StoreGeometry {
        let geo = self.device.geometry();
        StoreGeometry {
            size: geo.size,
            block_size: geo.sector_size,
            physical_block_size: u64::from(geo.physical_block_size),
            physical_offset: 0,
            unmap_granularity: u64::from(geo.physical_block_size),
            unmap_offset: 0,
            deallocate: geo.max_discard_bytes > 0,
            read_only: geo.read_only,
        }
    }

    pub(crate) fn submit(&self, bio: Bio) {
        self.device.submit(bio);
    }

    /// Split a deallocation into discards no larger than the device allows.
    pub(crate) fn discard_chunks(&self, offset: u64, length: u64) -> Vec<(u64, u64)> {
        let geo = self.device.geometry();
        let sector = u64::from(geo.sector_size.max(1));
        let max = (geo.max_discard_bytes / sector * sector).max(sector);

        let mut chunks = Vec::with_capacity(length.div_ceil(max) as usize);
        let mut pos = offset;
        let end = offset + length;
        while pos < end {
            let len = (end - pos).min(max);
            chunks.push((pos, len));
            pos += len;
        }
        chunks
    }
}

// ── Raw device ──────────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
mod ioctl {
    pub const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
    pub const BLKSSZGET: libc::c_ulong = 0x1268;
    pub const BLKPBSZGET: libc::c_ulong = 0x127B;
    pub const BLKDISCARD: libc::c_ulong = 0x1277;
}

/// Thread-backed device over a block device node or a regular file
pub struct RawDevice {
    path: PathBuf,
    geometry: DeviceGeometry,
    tx: Sender<Bio>,
}

impl RawDevice {
    /// Open `path` and start `threads` I/O threads.
    pub fn open(path: impl AsRef<Path>, read_only: bool, threads: usize) -> io::Result<Self> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
        }
        let file = options.open(path)?;
        let meta = file.metadata()?;
        let is_block = meta.file_type().is_block_device();

        let geometry = if is_block {
            Self::probe_block_device(&file, read_only)?
        } else {
            DeviceGeometry {
                size: meta.len(),
                sector_size: 512,
                physical_block_size: u32::try_from(meta.blksize()).unwrap_or(4096),
                max_discard_bytes: DEFAULT_MAX_DISCARD,
                read_only,
            }
        };

        debug!(
            "opened raw device {} ({} bytes, sector {}, physical {})",
            path.display(),
            geometry.size,
            geometry.sector_size,
            geometry.physical_block_size
        );

        let file = Arc::new(file);
        let (tx, rx) = crossbeam_channel::unbounded::<Bio>();
        for n in 0..threads.max(1) {
            let file = Arc::clone(&file);
            let rx: Receiver<Bio> = rx.clone();
            thread::Builder::new()
                .name(format!("rawdev-io{n}"))
                .spawn(move || io_thread(&file, &rx, is_block))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            geometry,
            tx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(target_os = "linux")]
    fn probe_block_device(file: &File, read_only: bool) -> io::Result<DeviceGeometry> {
        let fd = file.as_raw_fd();

        let mut size: u64 = 0;
        if unsafe { libc::ioctl(fd, ioctl::BLKGETSIZE64, &mut size) } == -1 {
            return Err(io::Error::last_os_error());
        }
        let mut sector: libc::c_int = 0;
        if unsafe { libc::ioctl(fd, ioctl::BLKSSZGET, &mut sector) } == -1 {
            return Err(io::Error::last_os_error());
        }
        let mut physical: libc::c_uint = 0;
        if unsafe { libc::ioctl(fd, ioctl::BLKPBSZGET, &mut physical) } == -1 {
            physical = 0;
        }

        let sector = u32::try_from(sector).unwrap_or(512).max(512);
        Ok(DeviceGeometry {
            size,
            sector_size: sector,
            physical_block_size: physical.max(sector),
            max_discard_bytes: DEFAULT_MAX_DISCARD,
            read_only,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn probe_block_device(file: &File, read_only: bool) -> io::Result<DeviceGeometry> {
        use std::io::{Seek, SeekFrom};
        let mut f = file;
        let size = f.seek(SeekFrom::End(0))?;
        Ok(DeviceGeometry {
            size,
            sector_size: 512,
            physical_block_size: 512,
            max_discard_bytes: 0,
            read_only,
        })
    }
}

impl BlockDevice for RawDevice {
    fn submit(&self, bio: Bio) {
        // The channel only disconnects once every I/O thread has exited;
        // the returned bio fails its round when dropped.
        if let Err(err) = self.tx.send(bio) {
            warn!("{}: I/O threads gone, failing bio", self.path.display());
            drop(err.into_inner());
        }
    }

    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }
}

fn io_thread(file: &File, rx: &Receiver<Bio>, is_block: bool) {
    while let Ok(bio) = rx.recv() {
        let result = execute(file, &bio, is_block);
        bio.complete(result);
    }
}

fn execute(file: &File, bio: &Bio, is_block: bool) -> io::Result<()> {
    match bio.op() {
        BioOp::Read => bio.with_buffer_mut(|buf| read_full(file, buf, bio.offset())),
        BioOp::Write { fua } => {
            bio.with_buffer(|buf| file.write_all_at(buf, bio.offset()))?;
            if fua {
                file.sync_data()?;
            }
            Ok(())
        }
        BioOp::Flush => file.sync_data(),
        BioOp::Discard => discard(file, bio.offset(), bio.len(), is_block),
    }
}

/// Positioned read; bytes past end of file read as zero.
fn read_full(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => {
                buf[done..].fill(0);
                break;
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn discard(file: &File, offset: u64, length: u64, is_block: bool) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let ret = if is_block {
        let range: [u64; 2] = [offset, length];
        unsafe { libc::ioctl(fd, ioctl::BLKDISCARD, &range) }
    } else {
        unsafe {
            libc::fallocate(
                fd,
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                length as libc::off_t,
            )
        }
    };
    if ret == -1 {
        let err = io::Error::last_os_error();
        if !is_block && matches!(err.raw_os_error(), Some(libc::EOPNOTSUPP | libc::ENOSYS)) {
            return zero_range(file, offset, length);
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn discard(file: &File, offset: u64, length: u64, _is_block: bool) -> io::Result<()> {
    zero_range(file, offset, length)
}

fn zero_range(file: &File, offset: u64, length: u64) -> io::Result<()> {
    let zeros = vec![0u8; length.min(1 << 20) as usize];
    let mut done = 0;
    while done < length {
        let n = (length - done).min(zeros.len() as u64);
        file.write_all_at(&zeros[..n as usize], offset + done)?;
        done += n;
    }
    Ok(())
}
