//! Per-LUN work queues and worker pool
//!
//! Four FIFO queues share one lock and are always drained in priority
//! order, so work already holding buffers (data-ready) gets ahead of
//! configuration commands, and those get ahead of new I/O.

use crate::command::Command;
use crate::context::ContextRef;
use crate::dispatch;
use crate::lun::LunShared;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Queue a work item waits on, highest priority first
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueueKind {
    DataReady = 0,
    ConfigWrite = 1,
    ConfigRead = 2,
    Input = 3,
}

const QUEUE_COUNT: usize = 4;

/// Unit of work for a LUN worker
pub(crate) enum Work {
    /// Newly admitted command
    Start(Arc<Command>),
    /// Next round of a chunked command
    Continue(Arc<Command>),
    /// Front end supplied the round's data; issue it
    DataReady(ContextRef),
    /// A device finished the round on a foreign thread
    RoundDone(ContextRef),
}

impl Work {
    pub fn queue(&self) -> QueueKind {
        match self {
            Self::Start(cmd) | Self::Continue(cmd) => cmd.class().queue(),
            Self::DataReady(_) | Self::RoundDone(_) => QueueKind::DataReady,
        }
    }
}

struct QueueState {
    queues: [VecDeque<Work>; QUEUE_COUNT],
    shutdown: bool,
}

/// The four queues of one LUN
pub(crate) struct WorkQueues {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl WorkQueues {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queues: Default::default(),
                shutdown: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn push(&self, work: Work) {
        let kind = work.queue();
        let mut state = self.state.lock();
        state.queues[kind as usize].push_back(work);
        drop(state);
        self.ready.notify_one();
    }

    /// Highest-priority item, without waiting
    pub fn try_pop(&self) -> Option<Work> {
        let mut state = self.state.lock();
        Self::pop_locked(&mut state)
    }

    /// Wait for the next item; `None` once shut down and drained.
    pub fn pop(&self) -> Option<Work> {
        let mut state = self.state.lock();
        loop {
            if let Some(work) = Self::pop_locked(&mut state) {
                return Some(work);
            }
            if state.shutdown {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    fn pop_locked(state: &mut QueueState) -> Option<Work> {
        state.queues.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn len(&self) -> usize {
        self.state.lock().queues.iter().map(VecDeque::len).sum()
    }

    /// Whether rounds holding buffers are waiting for a worker
    pub fn has_data_ready(&self) -> bool {
        !self.state.lock().queues[QueueKind::DataReady as usize].is_empty()
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.ready.notify_all();
    }
}

/// Worker threads of one LUN
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(lun: &Arc<LunShared>, count: usize) -> io::Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for n in 0..count.max(1) {
            let worker = Arc::clone(lun);
            let handle = thread::Builder::new()
                .name(format!("lun{}-worker{n}", lun.id()))
                .spawn(move || worker_loop(&worker));
            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    lun.queues().shutdown();
                    Self { handles }.join();
                    return Err(e);
                }
            }
        }
        debug!("started {} workers", handles.len());
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

fn worker_loop(lun: &Arc<LunShared>) {
    while let Some(work) = lun.queues().pop() {
        dispatch::run(lun, work);
    }
}
