//! Logical units
//!
//! A [`LogicalUnit`] is one backing store exposed as one block device. Its
//! runtime half, [`LunShared`], is what workers, contexts and bios point
//! at: the backend slot, geometry, ordering policy, queues, accounting and
//! the two in-flight gauges that removal waits on.

use crate::backend::{Backend, Capability};
use crate::command::{Command, IoClass};
use crate::error::{CommandError, Completion};
use crate::frontend::FrontEnd;
use crate::queue::{Work, WorkQueues, WorkerPool};
use crate::segment::SegmentPool;
use crate::stats::{LunStats, StatsSnapshot};
use chrono::{DateTime, Utc};
use lunstore_common::{BackendKind, LunId, LunOptions, Role, SerializationPolicy};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace, warn};

/// Addressing geometry of a logical unit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LunGeometry {
    /// Logical block size in bytes
    pub block_size: u32,
    /// Number of logical blocks
    pub capacity: u64,
    /// Logical blocks per physical block, as a power of two
    pub physical_exp: u8,
    /// Lowest LBA aligned to a physical block
    pub physical_offset: u64,
    /// Logical blocks per unmap granule, as a power of two
    pub unmap_exp: u8,
    /// Lowest LBA aligned to an unmap granule
    pub unmap_offset: u64,
}

impl LunGeometry {
    pub const fn size_bytes(&self) -> u64 {
        self.capacity * self.block_size as u64
    }

    /// Whether `[lba, lba + blocks)` lies within the unit
    pub fn contains(&self, lba: u64, blocks: u64) -> bool {
        lba.checked_add(blocks)
            .is_some_and(|end| end <= self.capacity)
    }

    /// Shorten a non-final round so it ends on a physical block boundary,
    /// unless that would leave it empty.
    pub fn align_round_end(&self, lba: u64, blocks: u64) -> u64 {
        if self.physical_exp == 0 {
            return blocks;
        }
        let per_physical = 1u64 << self.physical_exp;
        let skew = per_physical - self.physical_offset % per_physical;
        let over = (lba + blocks + skew) % per_physical;
        if blocks > over { blocks - over } else { blocks }
    }
}

// ── Gauges ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct GaugeState {
    count: usize,
    closed: bool,
}

/// Counter that can be waited down to zero
#[derive(Default)]
struct Gauge {
    state: Mutex<GaugeState>,
    idle: Condvar,
}

impl Gauge {
    /// Count one more; false once the gauge is closed.
    fn enter(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.count += 1;
        true
    }

    fn exit(&self) {
        let mut state = self.state.lock();
        state.count = state.count.saturating_sub(1);
        if state.count == 0 {
            self.idle.notify_all();
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }

    fn get(&self) -> usize {
        self.state.lock().count
    }

    fn wait_zero(&self) {
        let mut state = self.state.lock();
        while state.count > 0 {
            self.idle.wait(&mut state);
        }
    }
}

// ── Runtime state ───────────────────────────────────────────────────────

/// The part of a logical unit shared with workers and in-flight rounds
pub(crate) struct LunShared {
    id: LunId,
    name: String,
    backend: RwLock<Option<Arc<Backend>>>,
    geometry: RwLock<LunGeometry>,
    serialization: RwLock<SerializationPolicy>,
    read_only: AtomicBool,
    /// `unmap` option
    unmap: bool,
    /// The attached store can deallocate
    deallocate: AtomicBool,
    pool: Arc<SegmentPool>,
    front_end: Arc<dyn FrontEnd>,
    queues: WorkQueues,
    stats: LunStats,
    /// Admitted commands not yet completed
    active: Gauge,
    /// Live round contexts
    contexts: Gauge,
}

impl LunShared {
    pub fn new(
        id: LunId,
        name: String,
        front_end: Arc<dyn FrontEnd>,
        pool: Arc<SegmentPool>,
        serialization: SerializationPolicy,
        read_only: bool,
        unmap: bool,
    ) -> Self {
        Self {
            id,
            name,
            backend: RwLock::new(None),
            geometry: RwLock::new(LunGeometry::default()),
            serialization: RwLock::new(serialization),
            read_only: AtomicBool::new(read_only),
            unmap,
            deallocate: AtomicBool::new(false),
            pool,
            front_end,
            queues: WorkQueues::new(),
            stats: LunStats::new(),
            active: Gauge::default(),
            contexts: Gauge::default(),
        }
    }

    pub const fn id(&self) -> LunId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn pool(&self) -> &Arc<SegmentPool> {
        &self.pool
    }

    pub const fn queues(&self) -> &WorkQueues {
        &self.queues
    }

    pub const fn front_end(&self) -> &Arc<dyn FrontEnd> {
        &self.front_end
    }

    pub const fn stats(&self) -> &LunStats {
        &self.stats
    }

    /// Snapshot of the attached store, if any
    pub fn backend(&self) -> Option<Arc<Backend>> {
        self.backend.read().clone()
    }

    pub fn geometry(&self) -> LunGeometry {
        *self.geometry.read()
    }

    pub fn serialization(&self) -> SerializationPolicy {
        *self.serialization.read()
    }

    pub fn set_serialization(&self, policy: SerializationPolicy) {
        *self.serialization.write() = policy;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Unmap is enabled, the store supports it and the unit is writable.
    pub fn can_deallocate(&self) -> bool {
        self.unmap && self.deallocate.load(Ordering::Acquire) && !self.is_read_only()
    }

    /// Install a store and the geometry derived from it.
    pub fn attach(&self, backend: Arc<Backend>, geometry: LunGeometry, read_only: bool) {
        let store = backend.geometry();
        self.deallocate.store(store.deallocate, Ordering::Release);
        self.read_only.store(read_only, Ordering::Release);
        *self.geometry.write() = geometry;
        *self.backend.write() = Some(backend);
    }

    /// Remove the store; rounds already running keep their snapshot.
    pub fn detach(&self) -> Option<Arc<Backend>> {
        self.backend.write().take()
    }

    pub fn set_geometry(&self, geometry: LunGeometry) {
        *self.geometry.write() = geometry;
    }

    /// Queue a new command, or fail it when the unit no longer admits work.
    pub fn admit(&self, cmd: Arc<Command>) {
        if self.active.enter() {
            trace!("lun{} tag {}: admitted {:?}", self.id, cmd.tag(), cmd.opcode());
            self.queues.push(Work::Start(cmd));
        } else {
            debug!("lun{} tag {}: not admitting", self.id, cmd.tag());
            self.deliver(&cmd, Completion::Failed(CommandError::NotReady));
        }
    }

    /// Complete an admitted command. Later completions of the same command
    /// are dropped.
    pub fn complete(&self, cmd: &Arc<Command>, completion: Completion) {
        if self.deliver(cmd, completion) {
            self.active.exit();
        }
    }

    fn deliver(&self, cmd: &Arc<Command>, completion: Completion) -> bool {
        if !cmd.mark_completed() {
            warn!(
                "lun{} tag {}: dropping second completion {completion:?}",
                self.id,
                cmd.tag()
            );
            return false;
        }
        self.stats
            .record(cmd.class(), cmd.bytes_done(), cmd.elapsed(), &completion);
        if cmd.class() != IoClass::Read {
            self.front_end.serialization_done(cmd);
        }
        trace!("lun{} tag {}: {completion:?}", self.id, cmd.tag());
        self.front_end.complete(cmd, completion);
        true
    }

    pub fn context_created(&self) {
        // Contexts are never refused; the gauge is only waited on.
        let _ = self.contexts.enter();
    }

    pub fn context_released(&self) {
        self.contexts.exit();
    }

    pub fn live_contexts(&self) -> usize {
        self.contexts.get()
    }

    pub fn active_commands(&self) -> usize {
        self.active.get()
    }

    /// Refuse new commands from now on.
    pub fn close(&self) {
        self.active.close();
    }

    /// Wait for every admitted command and every round context.
    pub fn wait_idle(&self) {
        self.active.wait_zero();
        self.contexts.wait_zero();
    }
}

// ── Logical unit ────────────────────────────────────────────────────────

/// Parameters a unit was created with, kept for reopen and resize
#[derive(Clone, Debug)]
pub(crate) struct LunSettings {
    pub path: PathBuf,
    /// Explicit logical block size
    pub block_size: Option<u32>,
    /// Explicit size in bytes
    pub size: Option<u64>,
    pub role: Role,
    pub options: LunOptions,
}

/// Management view of a logical unit
#[derive(Clone, Debug, Serialize)]
pub struct LunInfo {
    pub id: LunId,
    pub name: String,
    pub path: PathBuf,
    pub backend: Option<BackendKind>,
    pub role: Role,
    pub serialization: SerializationPolicy,
    pub read_only: bool,
    pub unmap: bool,
    pub geometry: LunGeometry,
    pub serial: String,
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    pub workers: usize,
    pub active_commands: usize,
    pub stats: StatsSnapshot,
}

/// One backing store exposed as one block device
pub struct LogicalUnit {
    shared: Arc<LunShared>,
    settings: Mutex<LunSettings>,
    serial: String,
    device_id: String,
    created_at: DateTime<Utc>,
    /// Store handed in by the caller instead of opened from the path
    supplied: Option<Arc<Backend>>,
    workers: Mutex<Option<WorkerPool>>,
    worker_count: usize,
}

impl LogicalUnit {
    pub(crate) fn start(
        shared: LunShared,
        settings: LunSettings,
        serial: String,
        device_id: String,
        supplied: Option<Arc<Backend>>,
        workers: usize,
    ) -> io::Result<Self> {
        let shared = Arc::new(shared);
        let pool = WorkerPool::start(&shared, workers)?;
        let worker_count = pool.len();
        Ok(Self {
            shared,
            settings: Mutex::new(settings),
            serial,
            device_id,
            created_at: Utc::now(),
            supplied,
            workers: Mutex::new(Some(pool)),
            worker_count,
        })
    }

    pub(crate) const fn shared(&self) -> &Arc<LunShared> {
        &self.shared
    }

    pub(crate) fn settings(&self) -> MutexGuard<'_, LunSettings> {
        self.settings.lock()
    }

    pub(crate) fn supplied(&self) -> Option<Arc<Backend>> {
        self.supplied.clone()
    }

    pub fn id(&self) -> LunId {
        self.shared.id()
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn path(&self) -> PathBuf {
        self.settings.lock().path.clone()
    }

    pub fn role(&self) -> Role {
        self.settings.lock().role
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn geometry(&self) -> LunGeometry {
        self.shared.geometry()
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.shared.backend().map(|b| b.kind())
    }

    pub fn is_attached(&self) -> bool {
        self.shared.backend().is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.is_read_only()
    }

    pub fn serialization(&self) -> SerializationPolicy {
        self.shared.serialization()
    }

    pub fn set_serialization(&self, policy: SerializationPolicy) {
        self.shared.set_serialization(policy);
    }

    pub const fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Hand a command to the unit. Its completion arrives through
    /// [`FrontEnd::complete`], possibly before this returns.
    pub fn submit(&self, cmd: Arc<Command>) {
        self.shared.admit(cmd);
    }

    /// Capability answer in logical blocks
    pub fn capability(&self, capability: Capability) -> Option<u64> {
        let backend = self.shared.backend()?;
        let bytes = backend.capability(capability)?;
        let block_size = u64::from(self.geometry().block_size.max(1));
        Some(bytes / block_size)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats().snapshot()
    }

    pub fn active_commands(&self) -> usize {
        self.shared.active_commands()
    }

    pub fn live_contexts(&self) -> usize {
        self.shared.live_contexts()
    }

    /// Block until no command is active and every round context, front-end
    /// holds included, has been released.
    pub fn wait_idle(&self) {
        self.shared.wait_idle();
    }

    pub fn info(&self) -> LunInfo {
        let settings = self.settings.lock();
        LunInfo {
            id: self.id(),
            name: self.name().to_string(),
            path: settings.path.clone(),
            backend: self.backend_kind(),
            role: settings.role,
            serialization: self.serialization(),
            read_only: self.is_read_only(),
            unmap: self.shared.can_deallocate(),
            geometry: self.geometry(),
            serial: self.serial.clone(),
            device_id: self.device_id.clone(),
            created_at: self.created_at,
            workers: self.worker_count,
            active_commands: self.active_commands(),
            stats: self.stats(),
        }
    }

    /// Stop admission, drain, stop the workers and close the store.
    pub(crate) fn shutdown(&self) {
        let id = self.id();
        self.shared.close();
        debug!("lun{id}: draining {} active commands", self.active_commands());
        self.shared.wait_idle();
        self.shared.queues().shutdown();
        if let Some(pool) = self.workers.lock().take() {
            pool.join();
        }
        self.shared.detach();
        info!("lun{id} {} shut down", self.name());
    }
}

impl Drop for LogicalUnit {
    fn drop(&mut self) {
        // Workers exit once the queues drain; nobody waits for them here.
        self.shared.queues().shutdown();
    }
}

impl std::fmt::Debug for LogicalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalUnit")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("geometry", &self.geometry())
            .finish_non_exhaustive()
    }
}
