use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::info;
use parking_lot::RwLock;

use crate::block::tag::TagAllocator;
use crate::common::config::DEFAULT_QUEUE_DEPTH;
use crate::common::exception::TagError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSetConfig {
    pub nr_hw_queues: usize,
    pub queue_depth: usize,
    pub reserved_tags: usize,
    /// One allocator serves every hardware queue instead of one each.
    pub shared_across_hw_queues: bool,
}

impl Default for TagSetConfig {
    fn default() -> Self {
        Self {
            nr_hw_queues: 1,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            reserved_tags: 0,
            shared_across_hw_queues: false,
        }
    }
}

impl TagSetConfig {
    pub fn new(nr_hw_queues: usize, queue_depth: usize) -> Self {
        Self {
            nr_hw_queues,
            queue_depth,
            ..Self::default()
        }
    }

    pub fn with_reserved_tags(mut self, reserved: usize) -> Self {
        self.reserved_tags = reserved;
        self
    }

    pub fn with_shared_across_hw_queues(mut self, shared: bool) -> Self {
        self.shared_across_hw_queues = shared;
        self
    }
}

/// A device queue attached to a [`TagSet`].
pub trait TagSetMember: Send + Sync {
    /// Runs the first hardware queue drawing from `tags` that is marked for
    /// restart. Returns whether a run was issued.
    fn restart_shared(&self, tags: &Arc<TagAllocator>) -> bool;
}

/// Tag allocators shared by every device queue attached to the set.
pub struct TagSet {
    config: TagSetConfig,
    tags: Vec<Arc<TagAllocator>>,
    members: RwLock<Vec<(usize, Weak<dyn TagSetMember>)>>,
    next_member_id: AtomicUsize,
    restart_pending: AtomicUsize,
}

impl TagSet {
    pub fn new(config: TagSetConfig) -> Result<Arc<Self>, TagError> {
        if config.nr_hw_queues == 0 {
            return Err(TagError::InvalidConfig(
                "a tag set needs at least one hardware queue".to_string(),
            ));
        }
        let tags = if config.shared_across_hw_queues {
            let shared = Arc::new(TagAllocator::new(config.queue_depth, config.reserved_tags)?);
            vec![shared; config.nr_hw_queues]
        } else {
            (0..config.nr_hw_queues)
                .map(|_| TagAllocator::new(config.queue_depth, config.reserved_tags).map(Arc::new))
                .collect::<Result<Vec<_>, _>>()?
        };
        let set = Arc::new(Self {
            config,
            tags,
            members: RwLock::new(Vec::new()),
            next_member_id: AtomicUsize::new(0),
            restart_pending: AtomicUsize::new(0),
        });
        set.update_shared();
        Ok(set)
    }

    pub fn config(&self) -> &TagSetConfig {
        &self.config
    }

    pub fn nr_hw_queues(&self) -> usize {
        self.config.nr_hw_queues
    }

    pub fn tags(&self, hw_index: usize) -> &Arc<TagAllocator> {
        &self.tags[hw_index]
    }

    /// Every distinct allocator in the set.
    pub fn allocators(&self) -> Vec<Arc<TagAllocator>> {
        let mut distinct: Vec<Arc<TagAllocator>> = Vec::new();
        for tags in &self.tags {
            if !distinct.iter().any(|t| Arc::ptr_eq(t, tags)) {
                distinct.push(Arc::clone(tags));
            }
        }
        distinct
    }

    /// Shared mode turns on fair-share limits and the shared restart counter.
    pub fn is_shared(&self) -> bool {
        let spans_hw_queues = self.config.shared_across_hw_queues && self.config.nr_hw_queues > 1;
        spans_hw_queues || self.members.read().len() > 1
    }

    pub fn nr_members(&self) -> usize {
        self.members.read().len()
    }

    pub(crate) fn register(&self) -> usize {
        self.next_member_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn attach(&self, id: usize, member: Weak<dyn TagSetMember>) {
        self.members.write().push((id, member));
        self.update_shared();
    }

    pub(crate) fn detach(&self, id: usize) {
        self.members.write().retain(|(member, _)| *member != id);
        self.update_shared();
    }

    fn update_shared(&self) {
        let shared = self.is_shared();
        let mut changed = false;
        for tags in self.allocators() {
            changed |= tags.is_shared() != shared;
            tags.set_shared(shared);
        }
        if changed {
            info!(
                "tag set now {} ({} attached queues)",
                if shared { "shared" } else { "exclusive" },
                self.nr_members()
            );
        }
    }

    /// Attached members other than `id`, in round-robin order starting after it.
    pub(crate) fn peers_after(&self, id: usize) -> Vec<Arc<dyn TagSetMember>> {
        let members = self.members.read();
        let start = members
            .iter()
            .position(|(member, _)| *member == id)
            .map_or(0, |pos| pos + 1);
        (0..members.len())
            .map(|i| &members[(start + i) % members.len()])
            .filter(|(member, _)| *member != id)
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    pub(crate) fn restart_pending(&self) -> usize {
        self.restart_pending.load(Ordering::Acquire)
    }

    pub(crate) fn inc_restart(&self) {
        self.restart_pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_restart(&self) {
        self.restart_pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Resizes every allocator in the set.
    pub fn resize(&self, depth: usize) -> Result<(), TagError> {
        for tags in self.allocators() {
            tags.resize(depth)?;
        }
        Ok(())
    }
}
