//! Regular-file backing store
//!
//! Vectored positioned I/O (`preadv`/`pwritev`) over the round's buffer
//! list, hole punching for deallocation and `SEEK_HOLE`/`SEEK_DATA` for
//! provisioning status.

use super::{zero_tail, BackingStore, Capability, Extent, StoreGeometry};
use crate::MAX_IO_SIZE;
use nix::sys::uio::{preadv, pwritev};
use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A LUN backed by a regular file
pub struct FileBackend {
    file: File,
    path: PathBuf,
    read_only: bool,
    /// Preferred I/O size of the filesystem
    io_block: u64,
}

impl FileBackend {
    /// Open `path`; a file that refuses write access is opened read-only.
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> io::Result<Self> {
        let path = path.as_ref();
        let mut read_only = read_only;

        let file = if read_only {
            OpenOptions::new().read(true).open(path)?
        } else {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => file,
                Err(e) if is_write_denied(&e) => {
                    warn!("{} not writable, opening read-only: {e}", path.display());
                    read_only = true;
                    OpenOptions::new().read(true).open(path)?
                }
                Err(e) => return Err(e),
            }
        };

        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        debug!(
            "opened file store {} ({} bytes, blksize {}, read_only={read_only})",
            path.display(),
            meta.len(),
            meta.blksize()
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            read_only,
            io_block: meta.blksize(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn write_zeroes(&self, offset: u64, length: u64) -> io::Result<()> {
        let chunk = length.min(MAX_IO_SIZE as u64) as usize;
        let zeros = vec![0u8; chunk];
        let mut done = 0u64;
        while done < length {
            let n = (length - done).min(chunk as u64) as usize;
            self.file.write_all_at(&zeros[..n], offset + done)?;
            done += n as u64;
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn punch_hole(&self, offset: u64, length: u64) -> io::Result<bool> {
        let ret = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                length as libc::off_t,
            )
        };
        if ret == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EOPNOTSUPP | libc::ENOSYS) => Ok(false),
            _ => Err(err),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn punch_hole(&self, _offset: u64, _length: u64) -> io::Result<bool> {
        Ok(false)
    }

    /// `lseek` with `SEEK_HOLE`/`SEEK_DATA`
    fn seek(&self, offset: u64, whence: libc::c_int) -> io::Result<u64> {
        let ret = unsafe { libc::lseek(self.file.as_raw_fd(), offset as libc::off_t, whence) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as u64)
    }
}

fn is_write_denied(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EROFS | libc::EACCES | libc::EPERM)
    )
}

impl BackingStore for FileBackend {
    fn read(&self, offset: u64, bufs: &mut [&mut [u8]]) -> io::Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let n = {
            let mut iov: Vec<IoSliceMut<'_>> =
                bufs.iter_mut().map(|b| IoSliceMut::new(b)).collect();
            preadv(&self.file, &mut iov, offset as libc::off_t)?
        };
        if n < total {
            zero_tail(bufs, n);
        }
        Ok(())
    }

    fn write(&self, offset: u64, bufs: &[&[u8]], fua: bool) -> io::Result<()> {
        if self.read_only {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }

        let iov: Vec<IoSlice<'_>> = bufs.iter().map(|b| IoSlice::new(b)).collect();
        let written = pwritev(&self.file, &iov, offset as libc::off_t)?;

        // Finish a short vectored write buffer by buffer.
        let mut pos = 0usize;
        for buf in bufs {
            let end = pos + buf.len();
            if end > written {
                let skip = written.saturating_sub(pos);
                self.file
                    .write_all_at(&buf[skip..], offset + (pos + skip) as u64)?;
            }
            pos = end;
        }

        if fua {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn flush(&self, whole_device: bool) -> io::Result<()> {
        if whole_device {
            self.file.sync_all()
        } else {
            self.file.sync_data()
        }
    }

    fn deallocate(&self, offset: u64, length: u64) -> io::Result<()> {
        if self.read_only {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        if length == 0 || self.punch_hole(offset, length)? {
            return Ok(());
        }
        // No hole punching on this filesystem: keep only the file's extent.
        let size = self.size()?;
        let end = (offset + length).min(size);
        if end > offset {
            self.write_zeroes(offset, end - offset)?;
        }
        Ok(())
    }

    fn status(&self, offset: u64) -> Extent {
        let Ok(size) = self.size() else {
            return Extent::unknown(0);
        };
        if offset >= size {
            return Extent::unknown(0);
        }

        match self.seek(offset, libc::SEEK_HOLE) {
            Ok(hole) if hole > offset => Extent::mapped(hole - offset),
            Ok(_) => match self.seek(offset, libc::SEEK_DATA) {
                Ok(data) if data > offset => Extent::unmapped(data - offset),
                // Hole runs to the end of the file
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => Extent::unmapped(size - offset),
                _ => Extent::unknown(size - offset),
            },
            Err(_) => Extent::unknown(size - offset),
        }
    }

    fn capability(&self, capability: Capability) -> Option<u64> {
        match capability {
            Capability::BlocksUsed => self.file.metadata().ok().map(|m| m.blocks() * 512),
            Capability::BlocksAvailable => {
                let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
                let ret = unsafe { libc::fstatvfs(self.file.as_raw_fd(), &mut stat) };
                if ret != 0 {
                    return None;
                }
                Some(u64::from(stat.f_bavail) * u64::from(stat.f_frsize))
            }
        }
    }

    fn geometry(&self) -> StoreGeometry {
        StoreGeometry {
            size: self.size().unwrap_or(0),
            block_size: 0,
            physical_block_size: self.io_block,
            physical_offset: 0,
            unmap_granularity: self.io_block,
            unmap_offset: 0,
            deallocate: true,
            read_only: self.read_only,
        }
    }
}
