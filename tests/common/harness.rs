use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use iosched::block::bio::Direction;
use iosched::block::request::{Request, RequestId};
use iosched::common::config::Sector;
use iosched::common::exception::BlkResult;
use iosched::common::time::ManualClock;
use iosched::mq::config::QueueConfig;
use iosched::mq::cpu::PinnedCpuLocator;
use iosched::mq::queue::RequestQueue;
use iosched::mq::submit::{SubmitOutcome, Submitter};
use parking_lot::Mutex;

/// What the driver saw for one accepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    pub hw: usize,
    pub id: RequestId,
    pub dir: Direction,
    pub sector: Sector,
    pub nr_sectors: u32,
}

/// A fake device: accepts requests up to `capacity` in flight and rejects
/// the rest, recording everything it accepted.
pub struct RecordingDriver {
    capacity: AtomicUsize,
    in_flight: Mutex<VecDeque<Request>>,
    log: Mutex<Vec<Dispatched>>,
    calls: AtomicUsize,
}

impl RecordingDriver {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(usize::MAX)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: AtomicUsize::new(capacity),
            in_flight: Mutex::new(VecDeque::new()),
            log: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn submit_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn dispatched(&self) -> Vec<Dispatched> {
        self.log.lock().clone()
    }

    pub fn dispatched_sectors(&self) -> Vec<Sector> {
        self.log.lock().iter().map(|d| d.sector).collect()
    }

    pub fn take_in_flight(&self) -> Vec<Request> {
        self.in_flight.lock().drain(..).collect()
    }

    /// Completes the oldest in-flight request. The driver lock is not held
    /// while the queue reacts.
    pub fn complete_one(&self, queue: &RequestQueue, result: BlkResult) -> bool {
        let next = self.in_flight.lock().pop_front();
        match next {
            Some(rq) => {
                queue.end_request(rq, result);
                true
            }
            None => false,
        }
    }

    /// Completes until nothing is in flight, including requests dispatched
    /// as a consequence of earlier completions.
    pub fn complete_all(&self, queue: &RequestQueue, result: BlkResult) -> usize {
        let mut completed = 0;
        while self.complete_one(queue, result) {
            completed += 1;
        }
        completed
    }
}

impl Submitter for RecordingDriver {
    fn submit(&self, hw_queue: usize, batch: Vec<Request>) -> SubmitOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let capacity = self.capacity.load(Ordering::SeqCst);
        let mut in_flight = self.in_flight.lock();
        let mut rejected = Vec::new();
        for rq in batch {
            if in_flight.len() >= capacity || !rejected.is_empty() {
                rejected.push(rq);
                continue;
            }
            self.log.lock().push(Dispatched {
                hw: hw_queue,
                id: rq.id(),
                dir: rq.dir(),
                sector: rq.sector(),
                nr_sectors: rq.nr_sectors(),
            });
            in_flight.push_back(rq);
        }
        SubmitOutcome::rejecting(rejected)
    }
}

/// A queue pinned to CPU 0 and driven by a manual clock.
pub fn build_queue(
    config: QueueConfig,
    driver: &Arc<RecordingDriver>,
) -> (RequestQueue, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let queue = RequestQueue::builder(config)
        .shared_submitter(driver.clone())
        .clock(clock.clone())
        .cpu_locator(Arc::new(PinnedCpuLocator::new(0)))
        .build()
        .expect("queue construction");
    (queue, clock)
}
