use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::block::request::Request;
use crate::block::tag::{TagAllocator, TagSharer};
use crate::container::sbitmap::SBitmap;

const RUN_IDLE: u8 = 0;
const RUN_RUNNING: u8 = 1;
const RUN_RERUN: u8 = 2;

/// Snapshot of a hardware queue's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HctxStats {
    pub runs: u64,
    pub queued: u64,
    pub merged: u64,
    pub dispatched: u64,
    pub rejected: u64,
    pub requeued: u64,
    pub completed: u64,
    pub restarts: u64,
}

#[derive(Debug, Default)]
pub(crate) struct HctxCounters {
    pub(crate) runs: AtomicU64,
    pub(crate) queued: AtomicU64,
    pub(crate) merged: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) requeued: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) restarts: AtomicU64,
}

impl HctxCounters {
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// One hardware submission channel.
pub struct HardwareQueue {
    index: usize,
    pub(crate) tags: Arc<TagAllocator>,
    pub(crate) sharer: TagSharer,
    /// Requests taken out of the policy or software queues that the driver
    /// has not accepted yet.
    pub(crate) dispatch: Mutex<VecDeque<Request>>,
    cpus: Vec<usize>,
    pub(crate) pending: SBitmap,
    pub(crate) dispatch_from: AtomicUsize,
    stopped: AtomicBool,
    pub(crate) restart: AtomicBool,
    pub(crate) dispatch_busy: AtomicBool,
    run_state: AtomicU8,
    pub(crate) counters: HctxCounters,
}

impl HardwareQueue {
    pub(crate) fn new(index: usize, tags: Arc<TagAllocator>, cpus: Vec<usize>) -> Self {
        let pending = SBitmap::new(cpus.len());
        Self {
            index,
            tags,
            sharer: TagSharer::new(index),
            dispatch: Mutex::new(VecDeque::new()),
            cpus,
            pending,
            dispatch_from: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            restart: AtomicBool::new(false),
            dispatch_busy: AtomicBool::new(false),
            run_state: AtomicU8::new(RUN_IDLE),
            counters: HctxCounters::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn tags(&self) -> &Arc<TagAllocator> {
        &self.tags
    }

    pub fn sharer(&self) -> &TagSharer {
        &self.sharer
    }

    /// CPUs whose software queues feed this hardware queue.
    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::Release);
    }

    pub fn needs_restart(&self) -> bool {
        self.restart.load(Ordering::Acquire)
    }

    pub fn is_dispatch_busy(&self) -> bool {
        self.dispatch_busy.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.run_state.load(Ordering::SeqCst) != RUN_IDLE
    }

    pub fn residual_len(&self) -> usize {
        self.dispatch.lock().len()
    }

    pub(crate) fn has_pending_ctx(&self) -> bool {
        self.pending.weight() > 0
    }

    /// Claims the right to run a dispatch pass. A caller that loses the race
    /// leaves a rerun request for the current runner instead.
    pub(crate) fn try_begin_run(&self) -> bool {
        let mut state = self.run_state.load(Ordering::SeqCst);
        loop {
            let next = match state {
                RUN_IDLE => RUN_RUNNING,
                RUN_RUNNING => RUN_RERUN,
                _ => return false,
            };
            match self
                .run_state
                .compare_exchange(state, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return state == RUN_IDLE,
                Err(actual) => state = actual,
            }
        }
    }

    /// Ends a pass. Returns true when another pass was requested meanwhile;
    /// the caller then keeps ownership and runs again.
    pub(crate) fn finish_run(&self) -> bool {
        match self.run_state.compare_exchange(
            RUN_RUNNING,
            RUN_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => false,
            Err(_) => {
                self.run_state.store(RUN_RUNNING, Ordering::Release);
                true
            }
        }
    }

    /// Asks the current runner for one more pass.
    pub(crate) fn request_rerun(&self) {
        let _ = self.run_state.compare_exchange(
            RUN_RUNNING,
            RUN_RERUN,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> HctxStats {
        let c = &self.counters;
        HctxStats {
            runs: c.runs.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            merged: c.merged.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            restarts: c.restarts.load(Ordering::Relaxed),
        }
    }
}
