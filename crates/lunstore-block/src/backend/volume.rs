//! Pooled-volume backing store
//!
//! A pooled volume is carved from a storage pool that allocates space in
//! fixed-size extents on first write. It supports deallocation and knows
//! exactly which extents are allocated, so block status is precise.
//!
//! [`StoragePool`] / [`PoolVolume`] is the in-memory thin-provisioned
//! implementation; anything else implementing [`PooledVolume`] can be
//! attached through [`VolumeBackend`].

use super::{BackingStore, Capability, Extent, StoreGeometry};
use lunstore_common::{PoolConfig, VolumeConfig};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use tracing::{debug, info};

/// Primitive operations of a pooled volume
pub trait PooledVolume: Send + Sync {
    fn name(&self) -> &str;

    /// Advertised size in bytes
    fn size(&self) -> u64;

    /// Native block size
    fn block_size(&self) -> u32;

    /// Allocation unit of the owning pool
    fn extent_size(&self) -> u64;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    fn sync(&self) -> io::Result<()>;

    /// Release the range; whole extents return to the pool.
    fn free_range(&self, offset: u64, length: u64) -> io::Result<()>;

    /// Allocation run starting at `offset`
    fn extent_at(&self, offset: u64) -> Extent;

    fn used_bytes(&self) -> u64;

    fn available_bytes(&self) -> u64;
}

/// Adapter between the dispatcher and a [`PooledVolume`]
pub struct VolumeBackend {
    volume: Arc<dyn PooledVolume>,
    read_only: bool,
}

impl VolumeBackend {
    pub fn new(volume: Arc<dyn PooledVolume>, read_only: bool) -> Self {
        Self { volume, read_only }
    }

    pub fn volume(&self) -> &Arc<dyn PooledVolume> {
        &self.volume
    }
}

impl BackingStore for VolumeBackend {
    fn read(&self, offset: u64, bufs: &mut [&mut [u8]]) -> io::Result<()> {
        let size = self.volume.size();
        let mut pos = offset;
        for buf in bufs.iter_mut() {
            let len = buf.len() as u64;
            let inside = size.saturating_sub(pos).min(len) as usize;
            if inside > 0 {
                self.volume.read_at(pos, &mut buf[..inside])?;
            }
            buf[inside..].fill(0);
            pos += len;
        }
        Ok(())
    }

    fn write(&self, offset: u64, bufs: &[&[u8]], fua: bool) -> io::Result<()> {
        if self.read_only {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        let mut pos = offset;
        for buf in bufs {
            self.volume.write_at(pos, buf)?;
            pos += buf.len() as u64;
        }
        if fua {
            self.volume.sync()?;
        }
        Ok(())
    }

    fn flush(&self, _whole_device: bool) -> io::Result<()> {
        self.volume.sync()
    }

    fn deallocate(&self, offset: u64, length: u64) -> io::Result<()> {
        if self.read_only {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        self.volume.free_range(offset, length)
    }

    fn status(&self, offset: u64) -> Extent {
        self.volume.extent_at(offset)
    }

    fn capability(&self, capability: Capability) -> Option<u64> {
        Some(match capability {
            Capability::BlocksUsed => self.volume.used_bytes(),
            Capability::BlocksAvailable => self.volume.available_bytes(),
        })
    }

    fn geometry(&self) -> StoreGeometry {
        let extent = self.volume.extent_size();
        StoreGeometry {
            size: self.volume.size(),
            block_size: self.volume.block_size(),
            physical_block_size: u64::from(self.volume.block_size()),
            physical_offset: 0,
            unmap_granularity: extent,
            unmap_offset: 0,
            deallocate: true,
            read_only: self.read_only,
        }
    }
}

// ── In-memory pool ──────────────────────────────────────────────────────

/// Space accounting shared by a pool and its volumes
struct PoolSpace {
    extent_size: u64,
    capacity_extents: u64,
    allocated: Mutex<u64>,
}

impl PoolSpace {
    fn allocate(&self) -> io::Result<()> {
        let mut allocated = self.allocated.lock();
        if *allocated >= self.capacity_extents {
            return Err(io::Error::from_raw_os_error(libc::ENOSPC));
        }
        *allocated += 1;
        Ok(())
    }

    fn free(&self, extents: u64) {
        let mut allocated = self.allocated.lock();
        *allocated = allocated.saturating_sub(extents);
    }

    fn available_bytes(&self) -> u64 {
        (self.capacity_extents - *self.allocated.lock()) * self.extent_size
    }
}

/// Thin-provisioned in-memory storage pool
pub struct StoragePool {
    name: String,
    space: Arc<PoolSpace>,
    volumes: RwLock<HashMap<String, Arc<PoolVolume>>>,
}

impl StoragePool {
    pub fn new(name: impl Into<String>, capacity_bytes: u64, extent_size: u64) -> Arc<Self> {
        let extent_size = extent_size.max(512);
        Arc::new(Self {
            name: name.into(),
            space: Arc::new(PoolSpace {
                extent_size,
                capacity_extents: capacity_bytes / extent_size,
                allocated: Mutex::new(0),
            }),
            volumes: RwLock::new(HashMap::new()),
        })
    }

    /// Build a pool and its volumes from configuration.
    pub fn from_config(config: &PoolConfig) -> io::Result<Arc<Self>> {
        let pool = Self::new(&config.name, config.capacity_bytes, config.extent_size);
        for VolumeConfig {
            name,
            size_bytes,
            block_size,
        } in &config.volumes
        {
            pool.create_volume(name, *size_bytes, *block_size)?;
        }
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extent_size(&self) -> u64 {
        self.space.extent_size
    }

    pub fn capacity(&self) -> u64 {
        self.space.capacity_extents * self.space.extent_size
    }

    pub fn allocated_bytes(&self) -> u64 {
        *self.space.allocated.lock() * self.space.extent_size
    }

    pub fn available_bytes(&self) -> u64 {
        self.space.available_bytes()
    }

    /// Create a volume of `size` bytes; no space is allocated until written.
    pub fn create_volume(
        &self,
        name: &str,
        size: u64,
        block_size: u32,
    ) -> io::Result<Arc<PoolVolume>> {
        if !block_size.is_power_of_two() || block_size < 512 || size % u64::from(block_size) != 0
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("volume {name}: size {size} / block size {block_size} rejected"),
            ));
        }
        let mut volumes = self.volumes.write();
        if volumes.contains_key(name) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("volume {}/{name} exists", self.name),
            ));
        }
        let volume = Arc::new(PoolVolume {
            name: format!("{}/{name}", self.name),
            size,
            block_size,
            space: Arc::clone(&self.space),
            extents: RwLock::new(BTreeMap::new()),
        });
        volumes.insert(name.to_string(), Arc::clone(&volume));
        info!("created volume {} ({size} bytes)", volume.name);
        Ok(volume)
    }

    pub fn volume(&self, name: &str) -> Option<Arc<PoolVolume>> {
        self.volumes.read().get(name).cloned()
    }

    /// Drop a volume and return its space.
    pub fn destroy_volume(&self, name: &str) -> io::Result<()> {
        let volume = self
            .volumes
            .write()
            .remove(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))?;
        let extents = volume.extents.read().len() as u64;
        volume.extents.write().clear();
        self.space.free(extents);
        Ok(())
    }

    pub fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.volumes.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// A volume of a [`StoragePool`]
pub struct PoolVolume {
    name: String,
    size: u64,
    block_size: u32,
    space: Arc<PoolSpace>,
    extents: RwLock<BTreeMap<u64, Box<[u8]>>>,
}

impl PoolVolume {
    fn check_range(&self, offset: u64, len: u64) -> io::Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: range {offset}+{len} beyond {}", self.name, self.size),
            ));
        }
        Ok(())
    }

    /// Visit each extent-local piece of `[offset, offset + len)`.
    fn pieces(&self, offset: u64, len: u64) -> impl Iterator<Item = (u64, usize, usize)> {
        let extent = self.space.extent_size;
        let end = offset + len;
        let mut pos = offset;
        std::iter::from_fn(move || {
            if pos >= end {
                return None;
            }
            let index = pos / extent;
            let within = pos % extent;
            let n = (extent - within).min(end - pos);
            let item = (index, within as usize, n as usize);
            pos += n;
            Some(item)
        })
    }
}

impl PooledVolume for PoolVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn extent_size(&self) -> u64 {
        self.space.extent_size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check_range(offset, buf.len() as u64)?;
        let extents = self.extents.read();
        let mut done = 0;
        for (index, within, n) in self.pieces(offset, buf.len() as u64) {
            let dst = &mut buf[done..done + n];
            match extents.get(&index) {
                Some(data) => dst.copy_from_slice(&data[within..within + n]),
                None => dst.fill(0),
            }
            done += n;
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.check_range(offset, buf.len() as u64)?;
        let extent = self.space.extent_size as usize;
        let mut extents = self.extents.write();
        let mut done = 0;
        for (index, within, n) in self.pieces(offset, buf.len() as u64) {
            let src = &buf[done..done + n];
            if !extents.contains_key(&index) {
                self.space.allocate()?;
                extents.insert(index, vec![0u8; extent].into_boxed_slice());
            }
            if let Some(data) = extents.get_mut(&index) {
                data[within..within + n].copy_from_slice(src);
            }
            done += n;
        }
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn free_range(&self, offset: u64, length: u64) -> io::Result<()> {
        self.check_range(offset, length)?;
        let extent = self.space.extent_size as usize;
        let mut extents = self.extents.write();
        let mut freed = 0u64;
        for (index, within, n) in self.pieces(offset, length) {
            if n == extent {
                if extents.remove(&index).is_some() {
                    freed += 1;
                }
            } else if let Some(data) = extents.get_mut(&index) {
                data[within..within + n].fill(0);
            }
        }
        drop(extents);
        self.space.free(freed);
        debug!("{}: freed {freed} extents in {offset}+{length}", self.name);
        Ok(())
    }

    fn extent_at(&self, offset: u64) -> Extent {
        if offset >= self.size {
            return Extent::unknown(0);
        }
        let extent = self.space.extent_size;
        let last = (self.size - 1) / extent;
        let extents = self.extents.read();
        let index = offset / extent;

        let run_end = if extents.contains_key(&index) {
            let mut next = index + 1;
            while next <= last && extents.contains_key(&next) {
                next += 1;
            }
            next * extent
        } else {
            extents
                .range(index + 1..)
                .next()
                .map_or(self.size, |(next, _)| next * extent)
        };
        let length = run_end.min(self.size) - offset;

        if extents.contains_key(&index) {
            Extent::mapped(length)
        } else {
            Extent::unmapped(length)
        }
    }

    fn used_bytes(&self) -> u64 {
        self.extents.read().len() as u64 * self.space.extent_size
    }

    fn available_bytes(&self) -> u64 {
        self.space.available_bytes()
    }
}
