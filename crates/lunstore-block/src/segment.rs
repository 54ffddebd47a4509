//! Size-classed I/O buffer pool
//!
//! Buffers come in two classes: small (up to [`SMALL_SEGMENT_SIZE`]) and
//! large (up to [`MAX_SEGMENT_SIZE`]). Each class bounds the number of
//! buffers outstanding at once; callers block until one is returned.
//!
//! A round reserves all of its buffers in one step ([`SegmentPool::acquire_lists`]),
//! large class first, so no round ever sleeps on the pool while holding
//! part of its own reservation in the class it is waiting for.

use crate::{MAX_IO_SIZE, MAX_SEGMENT_SIZE, SMALL_SEGMENT_SIZE};
use lunstore_common::SegmentPoolConfig;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Buffer size class
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Large,
}

impl SizeClass {
    /// Class serving a request of `size` bytes
    pub const fn for_size(size: usize) -> Self {
        if size <= SMALL_SEGMENT_SIZE {
            Self::Small
        } else {
            Self::Large
        }
    }

    /// Capacity of every buffer in this class
    pub const fn buffer_size(self) -> usize {
        match self {
            Self::Small => SMALL_SEGMENT_SIZE,
            Self::Large => MAX_SEGMENT_SIZE,
        }
    }
}

/// One pooled buffer and the number of valid bytes in it
pub struct Segment {
    buf: Box<[u8]>,
    len: usize,
    class: SizeClass,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("len", &self.len)
            .field("class", &self.class)
            .finish()
    }
}

impl Segment {
    /// Valid length
    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn class(&self) -> SizeClass {
        self.class
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

struct ClassPool {
    class: SizeClass,
    limit: usize,
    state: Mutex<ClassState>,
    available: Condvar,
}

struct ClassState {
    cached: Vec<Box<[u8]>>,
    outstanding: usize,
}

impl ClassPool {
    fn new(class: SizeClass, limit: usize) -> Self {
        Self {
            class,
            limit,
            state: Mutex::new(ClassState {
                cached: Vec::new(),
                outstanding: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Reserve `count` buffers, sleeping until they are all available.
    fn reserve(&self, count: usize) -> Vec<Box<[u8]>> {
        self.reserve_until(count, None).unwrap_or_default()
    }

    /// Like [`reserve`](Self::reserve), giving up with `None` once
    /// `deadline` passes.
    fn reserve_until(&self, count: usize, deadline: Option<Instant>) -> Option<Vec<Box<[u8]>>> {
        if count == 0 {
            return Some(Vec::new());
        }
        assert!(
            count <= self.limit,
            "{count} {:?} buffers requested from a class of {}",
            self.class,
            self.limit
        );

        let mut state = self.state.lock();
        while self.limit - state.outstanding < count {
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out()
                        && self.limit - state.outstanding < count
                    {
                        return None;
                    }
                }
                None => self.available.wait(&mut state),
            }
        }
        state.outstanding += count;
        let keep = state.cached.len().saturating_sub(count);
        let mut bufs = state.cached.split_off(keep);
        drop(state);

        let size = self.class.buffer_size();
        bufs.resize_with(count, || vec![0u8; size].into_boxed_slice());
        Some(bufs)
    }

    fn give_back(&self, bufs: Vec<Box<[u8]>>) {
        if bufs.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.outstanding -= bufs.len();
        state.cached.extend(bufs);
        drop(state);
        self.available.notify_all();
    }

    fn release(&self, buf: Box<[u8]>) {
        let mut state = self.state.lock();
        state.outstanding -= 1;
        state.cached.push(buf);
        drop(state);
        // Waiters may need more than one buffer; let each re-check.
        self.available.notify_all();
    }

    fn free_bytes(&self) -> u64 {
        let state = self.state.lock();
        ((self.limit - state.outstanding) * self.class.buffer_size()) as u64
    }

    fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }
}

/// Pool of I/O buffers shared by every logical unit of a target
pub struct SegmentPool {
    small: ClassPool,
    large: ClassPool,
}

impl SegmentPool {
    /// Create a pool bounding each class.
    ///
    /// The large class must be able to back two full compare lists.
    pub fn new(small_buffers: usize, large_buffers: usize) -> Self {
        let round = MAX_IO_SIZE / MAX_SEGMENT_SIZE;
        assert!(small_buffers >= 2, "segment pool needs at least 2 small buffers");
        assert!(
            large_buffers >= round,
            "segment pool needs at least {round} large buffers"
        );
        Self {
            small: ClassPool::new(SizeClass::Small, small_buffers),
            large: ClassPool::new(SizeClass::Large, large_buffers),
        }
    }

    pub fn from_config(config: &SegmentPoolConfig) -> Self {
        Self::new(config.small_buffers, config.large_buffers)
    }

    const fn class(&self, class: SizeClass) -> &ClassPool {
        match class {
            SizeClass::Small => &self.small,
            SizeClass::Large => &self.large,
        }
    }

    /// Acquire one buffer holding `size` bytes, blocking while its class is exhausted.
    ///
    /// # Panics
    ///
    /// If `size` exceeds [`MAX_SEGMENT_SIZE`].
    pub fn acquire(&self, size: usize) -> Segment {
        assert!(
            size <= MAX_SEGMENT_SIZE,
            "segment of {size} bytes exceeds {MAX_SEGMENT_SIZE}"
        );
        let class = SizeClass::for_size(size);
        let buf = self.class(class).reserve(1).pop();
        // reserve(1) always yields exactly one buffer
        let buf = buf.unwrap_or_else(|| vec![0u8; class.buffer_size()].into_boxed_slice());
        Segment {
            buf,
            len: size,
            class,
        }
    }

    /// Acquire one segment list per entry of `lengths`, each list cut at
    /// [`MAX_SEGMENT_SIZE`], reserving every buffer at once.
    pub fn acquire_lists(&self, lengths: &[usize]) -> Vec<Vec<Segment>> {
        self.reserve_lists(lengths, None).unwrap_or_default()
    }

    /// Like [`acquire_lists`](Self::acquire_lists), waiting at most `wait`.
    /// Returns `None`, holding nothing, if the buffers did not free up in time.
    pub fn try_acquire_lists(
        &self,
        lengths: &[usize],
        wait: Duration,
    ) -> Option<Vec<Vec<Segment>>> {
        self.reserve_lists(lengths, Some(Instant::now() + wait))
    }

    fn reserve_lists(
        &self,
        lengths: &[usize],
        deadline: Option<Instant>,
    ) -> Option<Vec<Vec<Segment>>> {
        let sizes: Vec<Vec<usize>> = lengths.iter().map(|len| split_len(*len)).collect();
        let needed = |class: SizeClass| {
            sizes
                .iter()
                .flatten()
                .filter(|s| SizeClass::for_size(**s) == class)
                .count()
        };

        let mut large = self.large.reserve_until(needed(SizeClass::Large), deadline)?;
        let Some(mut small) = self.small.reserve_until(needed(SizeClass::Small), deadline) else {
            self.large.give_back(large);
            return None;
        };

        let lists = sizes
            .into_iter()
            .map(|list| {
                list.into_iter()
                    .map(|len| {
                        let class = SizeClass::for_size(len);
                        let source = match class {
                            SizeClass::Small => &mut small,
                            SizeClass::Large => &mut large,
                        };
                        let buf = source
                            .pop()
                            .unwrap_or_else(|| vec![0u8; class.buffer_size()].into_boxed_slice());
                        Segment { buf, len, class }
                    })
                    .collect()
            })
            .collect();
        Some(lists)
    }

    /// Acquire a single list covering `len` bytes.
    pub fn acquire_list(&self, len: usize) -> Vec<Segment> {
        self.acquire_lists(&[len]).pop().unwrap_or_default()
    }

    /// Return a segment to its class.
    pub fn release(&self, segment: Segment) {
        self.class(segment.class).release(segment.buf);
    }

    pub fn release_list(&self, segments: impl IntoIterator<Item = Segment>) {
        for segment in segments {
            self.release(segment);
        }
    }

    /// Bytes that can still be handed out without blocking
    pub fn free_bytes(&self) -> u64 {
        self.small.free_bytes() + self.large.free_bytes()
    }

    /// Buffers currently handed out
    pub fn outstanding(&self) -> usize {
        self.small.outstanding() + self.large.outstanding()
    }
}

impl Default for SegmentPool {
    fn default() -> Self {
        Self::from_config(&SegmentPoolConfig::default())
    }
}

/// Segment lengths covering `len` bytes
pub(crate) fn split_len(len: usize) -> Vec<usize> {
    let mut sizes = Vec::with_capacity(len.div_ceil(MAX_SEGMENT_SIZE));
    let mut left = len;
    while left > 0 {
        let size = left.min(MAX_SEGMENT_SIZE);
        sizes.push(size);
        left -= size;
    }
    sizes
}
