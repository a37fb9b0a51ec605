use crate::block::tag_set::TagSetConfig;
use crate::common::config::{
    BLKDEV_MAX_RQ, DEFAULT_DISPATCH_BATCH, DEFAULT_MAX_SECTORS, DEFAULT_QUEUE_DEPTH,
};
use crate::common::exception::QueueError;
use crate::elevator::ElevatorKind;
use crate::elevator::merge::MergeLevel;

/// Shape and limits of a device queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub nr_hw_queues: usize,
    /// Number of per-CPU software queues.
    pub nr_cpus: usize,
    /// Hardware queue depth reported by the device.
    pub queue_depth: usize,
    pub reserved_tags: usize,
    /// Overrides the tag depth derived from `queue_depth`.
    pub nr_requests: Option<usize>,
    pub shared_tags_across_hw_queues: bool,
    /// Most requests pulled from the policy per submit call.
    pub dispatch_batch: usize,
    /// Per hardware queue limit on requests handed to the driver.
    pub budget_depth: Option<usize>,
    pub max_sectors: u32,
    pub merge_level: MergeLevel,
    pub elevator: ElevatorKind,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            nr_hw_queues: 1,
            nr_cpus: num_cpus::get(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            reserved_tags: 0,
            nr_requests: None,
            shared_tags_across_hw_queues: false,
            dispatch_batch: DEFAULT_DISPATCH_BATCH,
            budget_depth: None,
            max_sectors: DEFAULT_MAX_SECTORS,
            merge_level: MergeLevel::All,
            elevator: ElevatorKind::None,
        }
    }
}

impl QueueConfig {
    pub fn new(nr_hw_queues: usize, queue_depth: usize) -> Self {
        Self {
            nr_hw_queues,
            queue_depth,
            ..Self::default()
        }
    }

    pub fn with_nr_cpus(mut self, nr_cpus: usize) -> Self {
        self.nr_cpus = nr_cpus;
        self
    }

    pub fn with_reserved_tags(mut self, reserved: usize) -> Self {
        self.reserved_tags = reserved;
        self
    }

    pub fn with_nr_requests(mut self, nr_requests: usize) -> Self {
        self.nr_requests = Some(nr_requests);
        self
    }

    pub fn with_shared_tags_across_hw_queues(mut self, shared: bool) -> Self {
        self.shared_tags_across_hw_queues = shared;
        self
    }

    pub fn with_dispatch_batch(mut self, batch: usize) -> Self {
        self.dispatch_batch = batch;
        self
    }

    pub fn with_budget_depth(mut self, depth: usize) -> Self {
        self.budget_depth = Some(depth);
        self
    }

    pub fn with_max_sectors(mut self, max_sectors: u32) -> Self {
        self.max_sectors = max_sectors;
        self
    }

    pub fn with_merge_level(mut self, level: MergeLevel) -> Self {
        self.merge_level = level;
        self
    }

    pub fn with_elevator(mut self, elevator: ElevatorKind) -> Self {
        self.elevator = elevator;
        self
    }

    /// Tags per hardware queue. A scheduler gets twice the device depth,
    /// capped, so it has requests to sort beyond what the device holds.
    pub fn tag_depth(&self) -> usize {
        match (self.nr_requests, &self.elevator) {
            (Some(nr), _) => nr,
            (None, ElevatorKind::None) => self.queue_depth,
            (None, _) => 2 * self.queue_depth.min(BLKDEV_MAX_RQ),
        }
    }

    pub fn tag_set_config(&self) -> TagSetConfig {
        TagSetConfig::new(self.nr_hw_queues, self.tag_depth())
            .with_reserved_tags(self.reserved_tags)
            .with_shared_across_hw_queues(self.shared_tags_across_hw_queues)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        let invalid = |msg: &str| Err(QueueError::InvalidConfig(msg.to_string()));
        if self.nr_hw_queues == 0 {
            return invalid("at least one hardware queue is required");
        }
        if self.nr_cpus == 0 {
            return invalid("at least one software queue is required");
        }
        if self.queue_depth == 0 {
            return invalid("queue depth must be positive");
        }
        if self.reserved_tags >= self.tag_depth() {
            return invalid("reserved tags must leave room for general tags");
        }
        if self.dispatch_batch == 0 {
            return invalid("dispatch batch must be positive");
        }
        if self.budget_depth == Some(0) {
            return invalid("budget depth must be positive");
        }
        if self.max_sectors == 0 {
            return invalid("max sectors must be positive");
        }
        Ok(())
    }
}
