//! Logical unit management
//!
//! The manager owns every [`LogicalUnit`]: it classifies the backing path,
//! opens the store, derives the unit's geometry and starts its workers. It
//! also resizes, reopens and changes the role of live units, and removes
//! them once their in-flight work has drained.

use crate::backend::{
    Backend, DeviceBackend, FileBackend, RawDevice, StoragePool, StoreGeometry, VolumeBackend,
    parse_volume_path,
};
use crate::error::{BlockError, BlockResult};
use crate::frontend::FrontEnd;
use crate::lun::{LogicalUnit, LunGeometry, LunInfo, LunSettings, LunShared};
use crate::segment::SegmentPool;
use crate::{DEFAULT_BLOCK_SIZE, HALF_IO_SIZE};
use lunstore_common::{
    BackendKind, LunConfig, LunId, LunOptions, Role, SerializationPolicy, TargetConfig,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Parameters of a new logical unit
#[derive(Clone, Debug, Default)]
pub struct LunParams {
    pub name: String,
    /// Backing file, device node or `/dev/zvol/<pool>/<volume>`
    pub path: PathBuf,
    /// Logical block size; defaults to the store's sector size, else 512
    pub block_size: Option<u32>,
    /// Size in bytes; defaults to the store's size
    pub size: Option<u64>,
    pub role: Role,
    /// Named options (`num_threads`, `unmap`, `serseq`, ...)
    pub options: BTreeMap<String, String>,
}

impl LunParams {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_option(mut self, name: &str, value: &str) -> Self {
        self.options.insert(name.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub const fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = Some(block_size);
        self
    }

    #[must_use]
    pub const fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub const fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }
}

impl From<&LunConfig> for LunParams {
    fn from(config: &LunConfig) -> Self {
        Self {
            name: config.name.clone(),
            path: config.path.clone(),
            block_size: config.block_size,
            size: config.size_bytes,
            role: config.role,
            options: config.options.clone(),
        }
    }
}

/// Changes to a live logical unit; `None` leaves a field alone.
#[derive(Clone, Debug, Default)]
pub struct LunModify {
    /// New size in bytes
    pub size: Option<u64>,
    /// Re-read the store size when no explicit size is given
    pub rescan: bool,
    /// Reopen on a different backing path
    pub path: Option<PathBuf>,
    pub role: Option<Role>,
    pub serialization: Option<SerializationPolicy>,
}

/// Owner of all logical units
pub struct LunManager {
    front_end: Arc<dyn FrontEnd>,
    segments: Arc<SegmentPool>,
    pools: RwLock<HashMap<String, Arc<StoragePool>>>,
    luns: RwLock<BTreeMap<LunId, Arc<LogicalUnit>>>,
    next_id: AtomicU64,
}

impl LunManager {
    /// Create a manager with the default segment pool.
    pub fn new(front_end: Arc<dyn FrontEnd>) -> Self {
        Self::with_segment_pool(front_end, Arc::new(SegmentPool::default()))
    }

    pub fn with_segment_pool(front_end: Arc<dyn FrontEnd>, segments: Arc<SegmentPool>) -> Self {
        Self {
            front_end,
            segments,
            pools: RwLock::new(HashMap::new()),
            luns: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Build pools and units from a target configuration.
    pub fn from_config(front_end: Arc<dyn FrontEnd>, config: &TargetConfig) -> BlockResult<Self> {
        let manager = Self::with_segment_pool(
            front_end,
            Arc::new(SegmentPool::from_config(&config.segments)),
        );
        for pool in &config.pools {
            manager.register_pool(StoragePool::from_config(pool)?);
        }
        for lun in &config.luns {
            manager.create(LunParams::from(lun))?;
        }
        Ok(manager)
    }

    /// Segment pool shared by every unit of this manager
    pub const fn segment_pool(&self) -> &Arc<SegmentPool> {
        &self.segments
    }

    /// Make a storage pool's volumes reachable as `/dev/zvol/<pool>/<volume>`.
    pub fn register_pool(&self, pool: Arc<StoragePool>) {
        info!("registered storage pool {}", pool.name());
        self.pools.write().insert(pool.name().to_string(), pool);
    }

    pub fn pool(&self, name: &str) -> Option<Arc<StoragePool>> {
        self.pools.read().get(name).cloned()
    }

    /// Create a unit over the store at `params.path`.
    pub fn create(&self, params: LunParams) -> BlockResult<Arc<LogicalUnit>> {
        self.create_unit(params, None)
    }

    /// Create a unit over a store the caller already built, such as a
    /// custom [`BlockDevice`](crate::BlockDevice). `params.path` is kept for
    /// display only.
    pub fn create_with_backend(
        &self,
        params: LunParams,
        backend: Backend,
    ) -> BlockResult<Arc<LogicalUnit>> {
        self.create_unit(params, Some(Arc::new(backend)))
    }

    fn create_unit(
        &self,
        params: LunParams,
        supplied: Option<Arc<Backend>>,
    ) -> BlockResult<Arc<LogicalUnit>> {
        if params.name.is_empty() {
            return Err(BlockError::InvalidConfig("LUN name is empty".to_string()));
        }
        if self.find(&params.name).is_some() {
            return Err(BlockError::LunExists(params.name));
        }

        let options = LunOptions::from_map(&params.options)?;
        let kind = match &supplied {
            Some(backend) => backend.kind(),
            None => self.classify(&params.path)?,
        };
        let workers = options.num_threads.unwrap_or(kind.default_workers());
        let policy = options
            .serialization
            .unwrap_or(kind.default_serialization());

        let settings = LunSettings {
            path: params.path,
            block_size: params.block_size,
            size: params.size,
            role: params.role,
            options,
        };

        // Open before anything starts so a bad store fails creation cleanly.
        let attached = match settings.role {
            Role::Primary => Some(self.open_unit(&settings, supplied.clone(), workers)?),
            Role::Secondary => None,
        };

        let id = LunId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let shared = LunShared::new(
            id,
            params.name.clone(),
            Arc::clone(&self.front_end),
            Arc::clone(&self.segments),
            policy,
            settings.options.read_only,
            settings.options.unmap.unwrap_or(true),
        );
        let serial = settings.options.serial.clone().unwrap_or_else(|| {
            let mut serial = Uuid::new_v4().simple().to_string();
            serial.truncate(16);
            serial
        });
        let device_id = settings
            .options
            .device_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let lun = Arc::new(LogicalUnit::start(
            shared, settings, serial, device_id, supplied, workers,
        )?);
        if let Some((backend, geometry, read_only)) = attached {
            lun.shared().attach(backend, geometry, read_only);
        }

        let mut luns = self.luns.write();
        if luns.values().any(|l| l.name() == params.name) {
            drop(luns);
            lun.shutdown();
            return Err(BlockError::LunExists(params.name));
        }
        luns.insert(id, Arc::clone(&lun));
        drop(luns);

        let geometry = lun.geometry();
        info!(
            "created lun{id} {} ({kind}, {} x {} bytes, {workers} workers, serseq={policy}, {})",
            params.name,
            geometry.capacity,
            geometry.block_size,
            lun.role()
        );
        Ok(lun)
    }

    /// Apply `changes` to a live unit.
    pub fn modify(&self, id: LunId, changes: LunModify) -> BlockResult<LunInfo> {
        let lun = self.get(id)?;

        if let Some(policy) = changes.serialization {
            debug!("lun{id}: serseq {} -> {policy}", lun.serialization());
            lun.set_serialization(policy);
        }

        let mut settings = lun.settings().clone();
        let path_changed = changes.path.as_ref().is_some_and(|p| *p != settings.path);
        let promote = changes.role == Some(Role::Primary) && settings.role == Role::Secondary;
        if let Some(path) = changes.path {
            settings.path = path;
        }
        if let Some(size) = changes.size {
            settings.size = Some(size);
        }
        if let Some(role) = changes.role {
            settings.role = role;
        }

        let shared = lun.shared();
        match settings.role {
            Role::Secondary => {
                if shared.detach().is_some() {
                    info!("lun{id}: secondary, backing store closed");
                }
            }
            Role::Primary if promote || path_changed || !lun.is_attached() => {
                let (backend, geometry, read_only) =
                    self.open_unit(&settings, lun.supplied(), lun.worker_count())?;
                shared.attach(backend, geometry, read_only);
                info!("lun{id}: attached {}", settings.path.display());
            }
            Role::Primary if changes.size.is_some() || changes.rescan => {
                if let Some(backend) = shared.backend() {
                    let geometry = derive_geometry(
                        &backend.geometry(),
                        backend.kind(),
                        settings.block_size,
                        settings.size,
                        &settings.options,
                    )?;
                    let before = shared.geometry().capacity;
                    shared.set_geometry(geometry);
                    info!("lun{id}: resized {before} -> {} blocks", geometry.capacity);
                }
            }
            Role::Primary => {}
        }

        *lun.settings() = settings;
        Ok(lun.info())
    }

    /// Stop admission, wait for in-flight work and front-end holds, stop the
    /// workers and close the store.
    pub fn remove(&self, id: LunId) -> BlockResult<()> {
        let lun = self
            .luns
            .write()
            .remove(&id)
            .ok_or_else(|| BlockError::LunNotFound(id.to_string()))?;
        lun.shutdown();
        info!("removed lun{id} {}", lun.name());
        Ok(())
    }

    pub fn list(&self) -> Vec<LunInfo> {
        self.luns.read().values().map(|lun| lun.info()).collect()
    }

    pub fn get(&self, id: LunId) -> BlockResult<Arc<LogicalUnit>> {
        self.luns
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| BlockError::LunNotFound(id.to_string()))
    }

    pub fn find(&self, name: &str) -> Option<Arc<LogicalUnit>> {
        self.luns.read().values().find(|l| l.name() == name).cloned()
    }

    /// Remove every unit.
    pub fn shutdown(&self) {
        let ids: Vec<LunId> = self.luns.read().keys().copied().collect();
        for id in ids {
            if let Err(e) = self.remove(id) {
                warn!("lun{id}: {e}");
            }
        }
    }

    /// Kind of store behind `path`, without opening it
    fn classify(&self, path: &Path) -> BlockResult<BackendKind> {
        if parse_volume_path(path).is_some() {
            return Ok(BackendKind::Volume);
        }
        let meta = std::fs::metadata(path).map_err(|source| BlockError::BackendOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let file_type = meta.file_type();
        if file_type.is_block_device() || file_type.is_char_device() {
            Ok(BackendKind::Device)
        } else if file_type.is_file() {
            Ok(BackendKind::File)
        } else {
            Err(BlockError::UnsupportedBackend(path.to_path_buf()))
        }
    }

    fn open_backend(&self, path: &Path, read_only: bool, threads: usize) -> BlockResult<Backend> {
        let open_err = |source| BlockError::BackendOpen {
            path: path.to_path_buf(),
            source,
        };

        if let Some((pool_name, volume_name)) = parse_volume_path(path) {
            let pool = self
                .pool(pool_name)
                .ok_or_else(|| BlockError::PoolNotFound(pool_name.to_string()))?;
            let volume = pool
                .volume(volume_name)
                .ok_or_else(|| BlockError::VolumeNotFound(format!("{pool_name}/{volume_name}")))?;
            return Ok(Backend::Volume(VolumeBackend::new(volume, read_only)));
        }

        match self.classify(path)? {
            BackendKind::File => Ok(Backend::File(
                FileBackend::open(path, read_only).map_err(open_err)?,
            )),
            BackendKind::Device => {
                let device = RawDevice::open(path, read_only, threads).map_err(open_err)?;
                Ok(Backend::Device(DeviceBackend::new(Arc::new(device))))
            }
            BackendKind::Volume => Err(BlockError::UnsupportedBackend(path.to_path_buf())),
        }
    }

    /// Open (or take the supplied) store and derive the unit's geometry.
    fn open_unit(
        &self,
        settings: &LunSettings,
        supplied: Option<Arc<Backend>>,
        threads: usize,
    ) -> BlockResult<(Arc<Backend>, LunGeometry, bool)> {
        let backend = match supplied {
            Some(backend) => backend,
            None => Arc::new(self.open_backend(
                &settings.path,
                settings.options.read_only,
                threads,
            )?),
        };
        let store = backend.geometry();
        let geometry = derive_geometry(
            &store,
            backend.kind(),
            settings.block_size,
            settings.size,
            &settings.options,
        )?;
        let read_only = settings.options.read_only || store.read_only;
        debug!(
            "{}: {:?} read_only={read_only} deallocate={}",
            settings.path.display(),
            geometry,
            store.deallocate
        );
        Ok((backend, geometry, read_only))
    }
}

impl std::fmt::Debug for LunManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LunManager")
            .field("luns", &self.luns.read().len())
            .field("pools", &self.pools.read().len())
            .finish_non_exhaustive()
    }
}

/// Work out a unit's geometry from its store and the requested overrides.
pub(crate) fn derive_geometry(
    store: &StoreGeometry,
    kind: BackendKind,
    block_size: Option<u32>,
    size: Option<u64>,
    options: &LunOptions,
) -> BlockResult<LunGeometry> {
    let sector = store.block_size;
    let block_size = block_size
        .or((sector > 0).then_some(sector))
        .unwrap_or(DEFAULT_BLOCK_SIZE);

    if !block_size.is_power_of_two()
        || block_size < DEFAULT_BLOCK_SIZE
        || block_size as usize > HALF_IO_SIZE
    {
        return Err(BlockError::InvalidConfig(format!(
            "block size {block_size} must be a power of two between 512 and {HALF_IO_SIZE}"
        )));
    }
    if sector > 0 && block_size % sector != 0 {
        return Err(BlockError::InvalidConfig(format!(
            "block size {block_size} is not a multiple of the sector size {sector}"
        )));
    }

    let size = match size {
        Some(size) if kind != BackendKind::File && size > store.size => {
            return Err(BlockError::InvalidConfig(format!(
                "size {size} exceeds the backing store ({} bytes)",
                store.size
            )));
        }
        Some(size) => size,
        None => store.size,
    };
    let bs = u64::from(block_size);
    let capacity = size / bs;
    if capacity == 0 {
        return Err(BlockError::InvalidConfig(format!(
            "size {size} holds no {block_size}-byte block"
        )));
    }

    let (physical_exp, physical_offset) = alignment(
        bs,
        options
            .physical_block_size
            .unwrap_or(store.physical_block_size),
        options
            .physical_block_offset
            .unwrap_or(store.physical_offset),
    );
    let (unmap_exp, unmap_offset) = alignment(
        bs,
        options.unmap_block_size.unwrap_or(store.unmap_granularity),
        options.unmap_block_offset.unwrap_or(store.unmap_offset),
    );

    Ok(LunGeometry {
        block_size,
        capacity,
        physical_exp,
        physical_offset,
        unmap_exp,
        unmap_offset,
    })
}

/// Exponent and lowest aligned LBA of a `size`-byte unit starting `offset`
/// bytes in; zero unless `size` is a power-of-two multiple of `bs` and the
/// offset is block aligned.
fn alignment(bs: u64, size: u64, offset: u64) -> (u8, u64) {
    if size <= bs || size % bs != 0 || offset % bs != 0 {
        return (0, 0);
    }
    let per = size / bs;
    if !per.is_power_of_two() {
        return (0, 0);
    }
    let pos = (offset / bs) % per;
    (per.trailing_zeros() as u8, (per - pos) % per)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Capability;
    use crate::command::{BlockRange, Command, CommandFlags, Opcode, Payload};
    use crate::error::{CommandError, Completion};
    use crate::frontend::Direction;
    use crate::testing::{InlineDevice, RecordingFrontEnd};
    use bytes::Bytes;
    use lunstore_common::BlockState;
    use rand::Rng;
    use std::os::unix::fs::FileExt;
    use std::thread;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const MIB: usize = 1 << 20;

    struct Harness {
        fe: Arc<RecordingFrontEnd>,
        manager: LunManager,
        next_tag: AtomicU64,
    }

    impl Harness {
        fn new() -> Self {
            let fe = Arc::new(RecordingFrontEnd::default());
            let manager = LunManager::new(fe.clone());
            Self {
                fe,
                manager,
                next_tag: AtomicU64::new(1),
            }
        }

        fn tag(&self) -> u64 {
            self.next_tag.fetch_add(1, Ordering::Relaxed)
        }

        fn run(&self, lun: &LogicalUnit, cmd: Command) -> Completion {
            let tag = cmd.tag();
            lun.submit(Arc::new(cmd));
            self.fe.wait(tag)
        }

        fn write(&self, lun: &LogicalUnit, lba: u64, data: &[u8]) -> Completion {
            let tag = self.tag();
            let blocks = data.len() as u64 / u64::from(lun.geometry().block_size);
            self.fe.supply(tag, data.to_vec());
            self.run(lun, Command::new(tag, Opcode::Write, lba, blocks))
        }

        fn read(&self, lun: &LogicalUnit, lba: u64, blocks: u64) -> (Completion, Vec<u8>) {
            let tag = self.tag();
            let completion = self.run(lun, Command::new(tag, Opcode::Read, lba, blocks));
            (completion, self.fe.data_out(tag))
        }

        fn file_lun(&self, name: &str, size: u64) -> (NamedTempFile, Arc<LogicalUnit>) {
            let tmp = NamedTempFile::new().unwrap();
            tmp.as_file().set_len(size).unwrap();
            let lun = self
                .manager
                .create(LunParams::new(name, tmp.path()).with_option("num_threads", "4"))
                .unwrap();
            (tmp, lun)
        }

        fn volume_lun(&self, pool_bytes: u64, volume_bytes: u64) -> (Arc<StoragePool>, Arc<LogicalUnit>) {
            let pool = StoragePool::new("tank", pool_bytes, 64 << 10);
            pool.create_volume("vol0", volume_bytes, 512).unwrap();
            self.manager.register_pool(Arc::clone(&pool));
            let lun = self
                .manager
                .create(LunParams::new("vol", "/dev/zvol/tank/vol0").with_option("num_threads", "4"))
                .unwrap();
            (pool, lun)
        }

        fn device_lun(&self, device: Arc<InlineDevice>) -> Arc<LogicalUnit> {
            self.manager
                .create_with_backend(
                    LunParams::new("dev", "/dev/inline"),
                    Backend::Device(DeviceBackend::new(device)),
                )
                .unwrap()
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn failed(err: CommandError) -> Completion {
        Completion::Failed(err)
    }

    fn default_store() -> StoreGeometry {
        StoreGeometry {
            size: 1 << 30,
            block_size: 512,
            physical_block_size: 4096,
            physical_offset: 0,
            unmap_granularity: 64 << 10,
            unmap_offset: 0,
            deallocate: true,
            read_only: false,
        }
    }

    #[test]
    fn test_derive_geometry_defaults() {
        let geo = derive_geometry(
            &default_store(),
            BackendKind::Device,
            None,
            None,
            &LunOptions::default(),
        )
        .unwrap();
        assert_eq!(geo.block_size, 512);
        assert_eq!(geo.capacity, (1 << 30) / 512);
        assert_eq!(geo.physical_exp, 3);
        assert_eq!(geo.physical_offset, 0);
        assert_eq!(geo.unmap_exp, 7);
    }

    #[test]
    fn test_derive_geometry_overrides() {
        let options = LunOptions {
            physical_block_size: Some(8192),
            physical_block_offset: Some(1024),
            unmap_block_size: Some(3 * 4096),
            ..LunOptions::default()
        };
        let geo = derive_geometry(
            &default_store(),
            BackendKind::Volume,
            Some(1024),
            Some(1 << 20),
            &options,
        )
        .unwrap();
        assert_eq!(geo.block_size, 1024);
        assert_eq!(geo.capacity, 1024);
        assert_eq!(geo.physical_exp, 3);
        // One block in, the first aligned LBA is 7
        assert_eq!(geo.physical_offset, 7);
        // 12 KiB is not a power-of-two multiple
        assert_eq!((geo.unmap_exp, geo.unmap_offset), (0, 0));
    }

    #[test]
    fn test_derive_geometry_rejects() {
        let store = default_store();
        let opts = LunOptions::default();
        for block_size in [100, 256, 3000, 1 << 20] {
            assert!(
                derive_geometry(&store, BackendKind::File, Some(block_size), None, &opts).is_err(),
                "{block_size}"
            );
        }
        let store_4k = StoreGeometry {
            block_size: 4096,
            ..store
        };
        assert!(derive_geometry(&store_4k, BackendKind::Device, Some(512), None, &opts).is_err());
        assert!(
            derive_geometry(&store, BackendKind::Device, None, Some(2 << 30), &opts).is_err()
        );
        // Files may be larger than their current length
        assert!(derive_geometry(&store, BackendKind::File, None, Some(2 << 30), &opts).is_ok());
        assert!(derive_geometry(&store, BackendKind::File, None, Some(100), &opts).is_err());
    }

    #[test]
    fn test_file_roundtrip_chunked() {
        let h = Harness::new();
        let (_tmp, lun) = h.file_lun("file", 8 << 20);
        assert_eq!(lun.backend_kind(), Some(BackendKind::File));
        assert_eq!(lun.worker_count(), 4);

        let data = pattern(3 * MIB + 4096, 7);
        let tag = h.next_tag.load(Ordering::Relaxed);
        assert_eq!(h.write(&lun, 100, &data), Completion::Ok);

        let rounds = h.fe.transfers(tag);
        assert_eq!(rounds.len(), 4);
        let mut expect = 0;
        for (direction, rel, len) in &rounds {
            assert_eq!(*direction, Direction::DataIn);
            assert_eq!(*rel, expect);
            expect += len;
        }
        assert_eq!(expect, data.len() as u64);

        let (completion, back) = h.read(&lun, 100, data.len() as u64 / 512);
        assert_eq!(completion, Completion::Ok);
        assert_eq!(back, data);

        let stats = lun.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.bytes_read, data.len() as u64);
    }

    #[test]
    fn test_small_command_single_round() {
        let h = Harness::new();
        let (_tmp, lun) = h.file_lun("small", 1 << 20);
        let tag = h.next_tag.load(Ordering::Relaxed);
        let (completion, data) = h.read(&lun, 0, 128);
        assert_eq!(completion, Completion::Ok);
        assert_eq!(data, vec![0u8; 64 << 10]);
        assert_eq!(h.fe.transfers(tag), vec![(Direction::DataOut, 0, 64 << 10)]);
        assert_eq!(h.fe.completion_count(tag), 1);
    }

    #[test]
    fn test_compare() {
        let h = Harness::new();
        let (_tmp, lun) = h.file_lun("cmp", 4 << 20);
        let data = pattern(MIB + 512, 3);
        assert_eq!(h.write(&lun, 0, &data), Completion::Ok);
        let blocks = data.len() as u64 / 512;

        let tag = h.tag();
        h.fe.supply(tag, data.clone());
        assert_eq!(
            h.run(&lun, Command::new(tag, Opcode::Compare, 0, blocks)),
            Completion::Ok
        );

        // Past the first half-size round
        let k = 700_001;
        let mut other = data.clone();
        other[k] ^= 0xFF;
        let tag = h.tag();
        h.fe.supply(tag, other);
        assert_eq!(
            h.run(&lun, Command::new(tag, Opcode::Compare, 0, blocks)),
            Completion::Miscompare { offset: k as u64 }
        );
        let stats = lun.stats();
        assert_eq!(stats.miscompares, 1);
    }

    #[test]
    fn test_volume_block_status_and_unmap() {
        let h = Harness::new();
        let (pool, lun) = h.volume_lun(16 << 20, 4 << 20);
        assert_eq!(lun.backend_kind(), Some(BackendKind::Volume));

        // Extents 0 and 3 allocated
        assert_eq!(h.write(&lun, 0, &pattern(64 << 10, 1)), Completion::Ok);
        assert_eq!(h.write(&lun, 384, &pattern(512, 2)), Completion::Ok);
        assert_eq!(pool.allocated_bytes(), 128 << 10);

        let status = |lba| h.run(&lun, Command::new(h.tag(), Opcode::GetLbaStatus, lba, 0));
        assert_eq!(
            status(0),
            Completion::BlockStatus {
                state: BlockState::Mapped,
                blocks: 128
            }
        );
        assert_eq!(
            status(130),
            Completion::BlockStatus {
                state: BlockState::Unmapped,
                blocks: 254
            }
        );

        let tag = h.tag();
        let unmap = Command::new(tag, Opcode::Unmap, 0, 0).with_payload(Payload::Ranges(vec![
            BlockRange::new(0, 128),
            BlockRange::new(10, 0),
            BlockRange::new(384, 128),
        ]));
        assert_eq!(h.run(&lun, unmap), Completion::Ok);
        assert_eq!(pool.allocated_bytes(), 0);
        assert_eq!(
            status(0),
            Completion::BlockStatus {
                state: BlockState::Unmapped,
                blocks: (4 << 20) / 512
            }
        );
        assert_eq!(lun.capability(Capability::BlocksUsed), Some(0));
        assert_eq!(
            lun.capability(Capability::BlocksAvailable),
            Some((16 << 20) / 512)
        );

        let (_, zeros) = h.read(&lun, 0, 128);
        assert!(zeros.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_file_block_status() {
        let h = Harness::new();
        let (tmp, lun) = h.file_lun("holes", 4 << 20);
        tmp.as_file().write_all_at(&[0xAB; 4096], 0).unwrap();

        let at = (2 << 20) / 512;
        match h.run(&lun, Command::new(h.tag(), Opcode::GetLbaStatus, at, 0)) {
            Completion::BlockStatus { state, blocks } => {
                // Filesystems without hole support report the tail as data
                assert!(matches!(state, BlockState::Unmapped | BlockState::Mapped));
                assert_eq!(blocks, (2 << 20) / 512);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_space_exhausted() {
        let h = Harness::new();
        let (_pool, lun) = h.volume_lun(128 << 10, 1 << 20);
        assert_eq!(
            h.write(&lun, 0, &pattern(256 << 10, 9)),
            failed(CommandError::SpaceExhausted)
        );
        assert_eq!(lun.stats().errors, 1);
    }

    #[test]
    fn test_admission_errors() {
        let h = Harness::new();
        let (_tmp, lun) = h.file_lun("adm", 1 << 20);
        let capacity = lun.geometry().capacity;

        assert!(matches!(
            h.run(&lun, Command::new(h.tag(), Opcode::Other(0x99), 0, 1)),
            Completion::Failed(CommandError::InvalidParameter(_))
        ));
        assert!(matches!(
            h.run(&lun, Command::new(h.tag(), Opcode::Read, capacity - 1, 2)),
            Completion::Failed(CommandError::InvalidParameter(_))
        ));
        assert!(matches!(
            h.run(&lun, Command::new(h.tag(), Opcode::WriteSame, 0, 4)),
            Completion::Failed(CommandError::InvalidParameter(_))
        ));
        assert_eq!(
            h.run(&lun, Command::new(h.tag(), Opcode::Read, 0, 0)),
            Completion::Ok
        );
        // Advisory without the deallocate attribute
        let dsm = Command::new(h.tag(), Opcode::DatasetManagement, 0, 0)
            .with_payload(Payload::Ranges(vec![BlockRange::new(0, 8)]));
        assert_eq!(h.run(&lun, dsm), Completion::Ok);
    }

    #[test]
    fn test_read_only() {
        let h = Harness::new();
        let tmp = NamedTempFile::new().unwrap();
        tmp.as_file().set_len(1 << 20).unwrap();
        let lun = h
            .manager
            .create(LunParams::new("ro", tmp.path()).with_option("readonly", "on"))
            .unwrap();
        assert!(lun.is_read_only());
        assert_eq!(
            h.write(&lun, 0, &pattern(512, 0)),
            failed(CommandError::WriteProtected)
        );
        let unmap = Command::new(h.tag(), Opcode::Unmap, 0, 0)
            .with_payload(Payload::Ranges(vec![BlockRange::new(0, 8)]));
        assert_eq!(h.run(&lun, unmap), failed(CommandError::WriteProtected));
        assert_eq!(h.read(&lun, 0, 1).0, Completion::Ok);
    }

    #[test]
    fn test_write_same_and_zeroes() {
        let h = Harness::new();
        let (_pool, lun) = h.volume_lun(16 << 20, 4 << 20);

        let mut block = vec![0x5Au8; 512];
        block[..4].copy_from_slice(&[9, 9, 9, 9]);
        let flags = CommandFlags {
            lba_data: true,
            ..CommandFlags::default()
        };
        let ws = Command::new(h.tag(), Opcode::WriteSame, 16, 3000)
            .with_flags(flags)
            .with_payload(Payload::Pattern(Bytes::from(block)));
        assert_eq!(h.run(&lun, ws), Completion::Ok);

        let (_, data) = h.read(&lun, 16, 3000);
        for (i, chunk) in data.chunks(512).enumerate() {
            assert_eq!(&chunk[..4], &(16 + i as u32).to_be_bytes());
            assert!(chunk[4..].iter().all(|&b| b == 0x5A));
        }

        let wz = Command::new(h.tag(), Opcode::WriteZeroes, 20, 8);
        assert_eq!(h.run(&lun, wz), Completion::Ok);
        let (_, data) = h.read(&lun, 20, 8);
        assert!(data.iter().all(|&b| b == 0));

        // Zero block count runs to the end of the unit
        let capacity = lun.geometry().capacity;
        let no_data = CommandFlags {
            no_data: true,
            ..CommandFlags::default()
        };
        let ws = Command::new(h.tag(), Opcode::WriteSame, capacity - 4, 0).with_flags(no_data);
        assert_eq!(h.run(&lun, ws), Completion::Ok);

        let unmap = CommandFlags {
            deallocate: true,
            ..CommandFlags::default()
        };
        let ws = Command::new(h.tag(), Opcode::WriteSame, 0, 4096).with_flags(unmap);
        assert_eq!(h.run(&lun, ws), Completion::Ok);
        let (_, data) = h.read(&lun, 16, 8);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_flush() {
        let h = Harness::new();
        let (_tmp, lun) = h.file_lun("flush", 1 << 20);
        assert_eq!(
            h.run(&lun, Command::new(h.tag(), Opcode::SynchronizeCache, 0, 0)),
            Completion::Ok
        );
        let immediate = CommandFlags {
            immediate: true,
            ..CommandFlags::default()
        };
        let tag = h.tag();
        let cmd = Command::new(tag, Opcode::SynchronizeCache, 0, 8).with_flags(immediate);
        assert_eq!(h.run(&lun, cmd), Completion::Ok);
        lun.wait_idle();
        assert_eq!(h.fe.completion_count(tag), 1);
        assert_eq!(lun.stats().flushes, 2);
    }

    #[test]
    fn test_abort_between_rounds() {
        let h = Harness::new();
        let (_tmp, lun) = h.file_lun("abort", 4 << 20);

        let tag = h.tag();
        h.fe.abort_on_transfer(tag);
        let completion = h.run(&lun, Command::new(tag, Opcode::Read, 0, (3 * MIB / 512) as u64));
        assert_eq!(completion, Completion::Aborted);
        assert_eq!(h.fe.transfers(tag).len(), 1);

        let cmd = Command::new(h.tag(), Opcode::Read, 0, 8);
        cmd.abort();
        assert_eq!(h.run(&lun, cmd), Completion::Aborted);
        assert_eq!(lun.stats().aborts, 2);
    }

    #[test]
    fn test_failed_transfer() {
        let h = Harness::new();
        let (_tmp, lun) = h.file_lun("xfer", 1 << 20);
        let tag = h.tag();
        h.fe.fail_transfers(tag);
        h.fe.supply(tag, pattern(4096, 1));
        assert_eq!(
            h.run(&lun, Command::new(tag, Opcode::Write, 0, 8)),
            Completion::Aborted
        );
    }

    #[test]
    fn test_hold_keeps_segments() {
        let h = Harness::new();
        let (_tmp, lun) = h.file_lun("hold", 2 << 20);
        h.fe.hold_reads(true);
        assert_eq!(h.read(&lun, 0, 512).0, Completion::Ok);

        let segments = h.manager.segment_pool();
        assert!(segments.outstanding() > 0);
        assert_eq!(lun.live_contexts(), 1);

        h.fe.release_holds();
        lun.wait_idle();
        assert_eq!(segments.outstanding(), 0);
    }

    #[test]
    fn test_remove_waits_for_holds() {
        let h = Arc::new(Harness::new());
        let (_tmp, lun) = h.file_lun("rm", 1 << 20);
        let id = lun.id();
        h.fe.hold_reads(true);
        assert_eq!(h.read(&lun, 0, 8).0, Completion::Ok);

        let remover = {
            let h = Arc::clone(&h);
            thread::spawn(move || h.manager.remove(id))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!remover.is_finished());

        h.fe.release_holds();
        remover.join().unwrap().unwrap();
        assert!(matches!(h.manager.get(id), Err(BlockError::LunNotFound(_))));
        assert!(!lun.is_attached());

        // Commands after removal fail without reaching a worker
        let (completion, _) = h.read(&lun, 0, 1);
        assert_eq!(completion, failed(CommandError::NotReady));
    }

    #[test]
    fn test_secondary_role() {
        let h = Harness::new();
        let tmp = NamedTempFile::new().unwrap();
        tmp.as_file().set_len(1 << 20).unwrap();
        let lun = h
            .manager
            .create(LunParams::new("ha", tmp.path()).with_role(Role::Secondary))
            .unwrap();
        assert!(!lun.is_attached());
        assert_eq!(h.read(&lun, 0, 1).0, failed(CommandError::NotReady));

        let info = h
            .manager
            .modify(
                lun.id(),
                LunModify {
                    role: Some(Role::Primary),
                    ..LunModify::default()
                },
            )
            .unwrap();
        assert_eq!(info.role, Role::Primary);
        assert_eq!(info.backend, Some(BackendKind::File));
        assert_eq!(h.read(&lun, 0, 1).0, Completion::Ok);

        h.manager
            .modify(
                lun.id(),
                LunModify {
                    role: Some(Role::Secondary),
                    ..LunModify::default()
                },
            )
            .unwrap();
        assert_eq!(h.read(&lun, 0, 1).0, failed(CommandError::NotReady));
    }

    #[test]
    fn test_modify_resize_and_policy() {
        let h = Harness::new();
        let (tmp, lun) = h.file_lun("grow", 1 << 20);
        assert_eq!(lun.geometry().capacity, 2048);
        assert_eq!(lun.serialization(), SerializationPolicy::Soft);

        tmp.as_file().set_len(2 << 20).unwrap();
        let info = h
            .manager
            .modify(
                lun.id(),
                LunModify {
                    rescan: true,
                    serialization: Some(SerializationPolicy::On),
                    ..LunModify::default()
                },
            )
            .unwrap();
        assert_eq!(info.geometry.capacity, 4096);
        assert_eq!(info.serialization, SerializationPolicy::On);

        let info = h
            .manager
            .modify(
                lun.id(),
                LunModify {
                    size: Some(3 << 20),
                    ..LunModify::default()
                },
            )
            .unwrap();
        assert_eq!(info.geometry.capacity, 6144);
        assert_eq!(h.read(&lun, 6000, 100).0, Completion::Ok);
    }

    #[test]
    fn test_modify_path_reopens() {
        let h = Harness::new();
        let (_first, lun) = h.file_lun("move", 1 << 20);
        let second = NamedTempFile::new().unwrap();
        second.as_file().set_len(2 << 20).unwrap();
        second.as_file().write_all_at(&[0x77; 512], 0).unwrap();

        let info = h
            .manager
            .modify(
                lun.id(),
                LunModify {
                    path: Some(second.path().to_path_buf()),
                    ..LunModify::default()
                },
            )
            .unwrap();
        assert_eq!(info.path, second.path());
        assert_eq!(info.geometry.capacity, 4096);
        assert_eq!(h.read(&lun, 0, 1).1, vec![0x77; 512]);
    }

    #[test]
    fn test_create_errors() {
        let h = Harness::new();
        let (tmp, _lun) = h.file_lun("dup", 1 << 20);
        assert!(matches!(
            h.manager.create(LunParams::new("dup", tmp.path())),
            Err(BlockError::LunExists(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            h.manager.create(LunParams::new("dir", dir.path())),
            Err(BlockError::UnsupportedBackend(_))
        ));
        assert!(matches!(
            h.manager.create(LunParams::new("nopool", "/dev/zvol/none/vol")),
            Err(BlockError::PoolNotFound(_))
        ));
        assert!(matches!(
            h.manager.create(LunParams::new("missing", dir.path().join("nope"))),
            Err(BlockError::BackendOpen { .. })
        ));
        assert!(matches!(
            h.manager
                .create(LunParams::new("opt", tmp.path()).with_option("serseq", "sometimes")),
            Err(BlockError::Options(_))
        ));
        assert_eq!(h.manager.list().len(), 1);
    }

    #[test]
    fn test_info_and_options() {
        let h = Harness::new();
        let tmp = NamedTempFile::new().unwrap();
        tmp.as_file().set_len(1 << 20).unwrap();
        let lun = h
            .manager
            .create(
                LunParams::new("info", tmp.path())
                    .with_block_size(4096)
                    .with_option("serial", "SER0001")
                    .with_option("serseq", "off")
                    .with_option("unmap", "off"),
            )
            .unwrap();
        let info = lun.info();
        assert_eq!(info.serial, "SER0001");
        assert_eq!(info.device_id.len(), 36);
        assert_eq!(info.geometry.block_size, 4096);
        assert_eq!(info.geometry.capacity, 256);
        assert_eq!(info.serialization, SerializationPolicy::Off);
        assert!(!info.unmap);
        assert_eq!(info.workers, BackendKind::File.default_workers());
        assert_eq!(h.manager.find("info").map(|l| l.id()), Some(lun.id()));

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["name"], "info");
        assert_eq!(json["id"], lun.id().0);
        assert_eq!(json["backend"], "file");
        assert_eq!(json["serialization"], "off");
        assert_eq!(json["geometry"]["capacity"], 256);
        assert_eq!(json["stats"]["reads"], 0);
        assert!(json["stats"]["read_latency"]["p99_us"].is_u64());

        let unmap = Command::new(h.tag(), Opcode::Unmap, 0, 0)
            .with_payload(Payload::Ranges(vec![BlockRange::new(0, 1)]));
        assert!(matches!(
            h.run(&lun, unmap),
            Completion::Failed(CommandError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_serialization_signals() {
        let h = Harness::new();
        let (_tmp, lun) = h.file_lun("order", 4 << 20);
        for policy in [
            SerializationPolicy::Off,
            SerializationPolicy::Soft,
            SerializationPolicy::Read,
            SerializationPolicy::On,
        ] {
            lun.set_serialization(policy);
            let tag = h.next_tag.load(Ordering::Relaxed);
            assert_eq!(h.read(&lun, 0, 4096).0, Completion::Ok);
            let signals = h.fe.serialized().iter().filter(|t| **t == tag).count();
            assert_eq!(signals, 1, "{policy}");
        }
        let tag = h.next_tag.load(Ordering::Relaxed);
        assert_eq!(h.write(&lun, 0, &pattern(512, 0)), Completion::Ok);
        assert!(h.fe.serialized().contains(&tag));
    }

    #[test]
    fn test_device_inline_and_threaded() {
        for device in [InlineDevice::new(8 << 20), InlineDevice::new(8 << 20).threaded()] {
            let h = Harness::new();
            let device = Arc::new(device);
            let lun = h.device_lun(Arc::clone(&device));
            assert_eq!(lun.backend_kind(), Some(BackendKind::Device));
            assert_eq!(lun.worker_count(), 1);
            assert_eq!(lun.geometry().physical_exp, 3);

            let data = pattern(MIB + (64 << 10), 5);
            assert_eq!(h.write(&lun, 8, &data), Completion::Ok);
            assert_eq!(device.read_back(8 * 512, data.len()), data);
            let (completion, back) = h.read(&lun, 8, data.len() as u64 / 512);
            assert_eq!(completion, Completion::Ok);
            assert_eq!(back, data);

            assert!(matches!(
                h.run(&lun, Command::new(h.tag(), Opcode::GetLbaStatus, 0, 0)),
                Completion::BlockStatus {
                    state: BlockState::Unknown,
                    ..
                }
            ));
            assert_eq!(lun.capability(Capability::BlocksUsed), None);
            lun.wait_idle();
            assert_eq!(h.manager.segment_pool().outstanding(), 0);
        }
    }

    #[test]
    fn test_device_discard_chunks() {
        let h = Harness::new();
        let device = Arc::new(InlineDevice::new(8 << 20).with_max_discard(64 << 10));
        let lun = h.device_lun(Arc::clone(&device));
        assert_eq!(h.write(&lun, 0, &pattern(256 << 10, 1)), Completion::Ok);

        let unmap = Command::new(h.tag(), Opcode::Unmap, 0, 0)
            .with_payload(Payload::Ranges(vec![BlockRange::new(0, 512)]));
        assert_eq!(h.run(&lun, unmap), Completion::Ok);
        assert_eq!(device.discards(), 4);
        assert!(device.read_back(0, 256 << 10).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_device_medium_error() {
        for device in [
            InlineDevice::new(4 << 20).failing_at(200 << 10),
            InlineDevice::new(4 << 20).failing_at(200 << 10).threaded(),
        ] {
            let h = Harness::new();
            let device = Arc::new(device);
            let lun = h.device_lun(Arc::clone(&device));
            let (completion, _) = h.read(&lun, 0, 1024);
            assert_eq!(
                completion,
                failed(CommandError::MediumError {
                    offset: 128 << 10,
                    read: true
                })
            );
            // Every segment of the round was still issued
            assert_eq!(device.bios(), 4);
            lun.wait_idle();
            assert_eq!(h.manager.segment_pool().outstanding(), 0);
        }
    }

    #[test]
    fn test_concurrent_callers() {
        let h = Arc::new(Harness::new());
        let (_tmp, lun) = h.file_lun("many", 16 << 20);
        let callers: Vec<_> = (0..16u64)
            .map(|n| {
                let h = Arc::clone(&h);
                let lun = Arc::clone(&lun);
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    let blocks = rng.gen_range(1..=2048u64);
                    let lba = n * 2048;
                    let data = pattern(blocks as usize * 512, n as u8);
                    assert_eq!(h.write(&lun, lba, &data), Completion::Ok);
                    let (completion, back) = h.read(&lun, lba, blocks);
                    assert_eq!(completion, Completion::Ok);
                    assert_eq!(back, data);
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }
        lun.wait_idle();
        assert_eq!(h.fe.completed(), 32);
        assert_eq!(h.manager.segment_pool().outstanding(), 0);
    }

    #[test]
    fn test_from_config() {
        let fe = Arc::new(RecordingFrontEnd::default());
        let tmp = NamedTempFile::new().unwrap();
        tmp.as_file().set_len(1 << 20).unwrap();
        let config = TargetConfig {
            pools: vec![lunstore_common::PoolConfig {
                name: "p0".to_string(),
                capacity_bytes: 8 << 20,
                extent_size: 64 << 10,
                volumes: vec![lunstore_common::VolumeConfig {
                    name: "v0".to_string(),
                    size_bytes: 2 << 20,
                    block_size: 4096,
                }],
            }],
            luns: vec![
                LunConfig {
                    name: "f".to_string(),
                    path: tmp.path().to_path_buf(),
                    block_size: None,
                    size_bytes: None,
                    role: Role::Primary,
                    options: BTreeMap::new(),
                },
                LunConfig {
                    name: "v".to_string(),
                    path: PathBuf::from("/dev/zvol/p0/v0"),
                    block_size: None,
                    size_bytes: None,
                    role: Role::Primary,
                    options: BTreeMap::new(),
                },
            ],
            ..TargetConfig::default()
        };
        let manager = LunManager::from_config(fe, &config).unwrap();
        let luns = manager.list();
        assert_eq!(luns.len(), 2);
        assert_eq!(luns[1].geometry.block_size, 4096);
        assert_eq!(luns[1].geometry.capacity, 512);
        manager.shutdown();
        assert!(manager.list().is_empty());
    }

    #[test]
    fn test_file_hole_between_data() {
        let h = Harness::new();
        let (_tmp, lun) = h.file_lun("punched", 4 << 20);
        assert_eq!(h.write(&lun, 0, &pattern(3 * MIB, 4)), Completion::Ok);

        let unmap = Command::new(h.tag(), Opcode::Unmap, 0, 0)
            .with_payload(Payload::Ranges(vec![BlockRange::new(2048, 2048)]));
        assert_eq!(h.run(&lun, unmap), Completion::Ok);
        let (_, hole) = h.read(&lun, 2048, 2048);
        assert!(hole.iter().all(|&b| b == 0));

        let status = |lba| h.run(&lun, Command::new(h.tag(), Opcode::GetLbaStatus, lba, 0));
        match status(2048) {
            Completion::BlockStatus {
                state: BlockState::Unmapped,
                blocks,
            } => assert_eq!(blocks, 2048),
            // No hole punching or SEEK_HOLE on this filesystem
            Completion::BlockStatus {
                state: BlockState::Mapped | BlockState::Unknown,
                ..
            } => return,
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            status(4096),
            Completion::BlockStatus {
                state: BlockState::Mapped,
                ..
            }
        ));
        assert!(matches!(
            status(1024),
            Completion::BlockStatus {
                state: BlockState::Mapped,
                blocks: 1024
            }
        ));
    }

    #[test]
    fn test_slow_device_with_exhausted_pool() {
        let fe = Arc::new(RecordingFrontEnd::default());
        let manager =
            LunManager::with_segment_pool(fe.clone(), Arc::new(SegmentPool::new(2, 8)));
        let device = Arc::new(InlineDevice::new(4 << 20).delayed(Duration::from_millis(5)));
        let lun = manager
            .create_with_backend(
                LunParams::new("slow", "/dev/slow"),
                Backend::Device(DeviceBackend::new(device)),
            )
            .unwrap();
        assert_eq!(lun.worker_count(), 1);

        // Each read needs the whole large class
        for tag in 1..=3 {
            lun.submit(Arc::new(Command::new(tag, Opcode::Read, 0, 2048)));
        }
        for tag in 1..=3 {
            assert_eq!(fe.wait(tag), Completion::Ok);
            assert_eq!(fe.data_out(tag).len(), MIB);
        }
        lun.wait_idle();
        assert_eq!(manager.segment_pool().outstanding(), 0);
    }

    #[test]
    fn test_flush_range_checked() {
        let h = Harness::new();
        let (_tmp, lun) = h.file_lun("flushrange", 1 << 20);
        let capacity = lun.geometry().capacity;
        for (lba, blocks) in [(u64::MAX / 2, 1), (capacity - 1, 2), (capacity, 1)] {
            assert!(matches!(
                h.run(&lun, Command::new(h.tag(), Opcode::SynchronizeCache, lba, blocks)),
                Completion::Failed(CommandError::InvalidParameter(_))
            ));
        }
        assert_eq!(
            h.run(&lun, Command::new(h.tag(), Opcode::SynchronizeCache, 8, 8)),
            Completion::Ok
        );
        lun.wait_idle();
        assert_eq!(lun.active_commands(), 0);
        h.manager.remove(lun.id()).unwrap();
    }
}
