use std::sync::atomic::{AtomicUsize, Ordering};

/// Driver-side limit on requests in flight per hardware queue.
///
/// Every `get` that returns true is paired with exactly one `put`, either
/// when the driver rejects or requeues the request or when it completes.
pub trait DispatchBudget: Send + Sync {
    fn get(&self, hw_queue: usize) -> bool;
    fn put(&self, hw_queue: usize);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedBudget;

impl DispatchBudget for UnlimitedBudget {
    fn get(&self, _hw_queue: usize) -> bool {
        true
    }

    fn put(&self, _hw_queue: usize) {}
}

#[derive(Debug)]
pub struct QueueDepthBudget {
    depth: usize,
    in_flight: Vec<AtomicUsize>,
}

impl QueueDepthBudget {
    pub fn new(nr_hw_queues: usize, depth: usize) -> Self {
        Self {
            depth,
            in_flight: (0..nr_hw_queues).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn in_flight(&self, hw_queue: usize) -> usize {
        self.in_flight[hw_queue].load(Ordering::Acquire)
    }
}

impl DispatchBudget for QueueDepthBudget {
    fn get(&self, hw_queue: usize) -> bool {
        self.in_flight[hw_queue]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.depth).then_some(n + 1)
            })
            .is_ok()
    }

    fn put(&self, hw_queue: usize) {
        let prev = self.in_flight[hw_queue].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "budget released twice on hw queue {}", hw_queue);
    }
}
