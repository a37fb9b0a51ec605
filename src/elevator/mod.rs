//! Scheduling policies and the state they share with the merge index.
//!
//! An [`ElevatorQueue`] owns the request arena, the [`MergeIndex`] and one
//! boxed [`SchedulerPolicy`]. The device queue keeps it behind a single lock;
//! nothing in here synchronizes on its own.

pub mod deadline;
pub mod merge;

use std::time::Instant;

use crate::block::bio::Bio;
use crate::block::request::{Request, RequestId};
use crate::common::exception::QueueError;
use crate::container::arena::{Arena, Handle};
use crate::elevator::deadline::{DEADLINE_NAME, DeadlinePolicy, DeadlineTunables};
use crate::elevator::merge::{BioMerge, MergeHooks, MergeIndex, MergeLevel};

/// Requests queued in a policy and the indices over them.
pub struct ElvCore {
    pub arena: Arena<Request>,
    pub index: MergeIndex,
}

impl ElvCore {
    pub fn new(max_sectors: u32) -> Self {
        Self {
            arena: Arena::new(),
            index: MergeIndex::new(max_sectors),
        }
    }
}

/// A pluggable request ordering policy.
///
/// Implementations decide where an inserted request goes and which one leaves
/// next. A dispatched handle must already be detached from the merge index
/// and from every policy structure; the caller removes it from the arena.
pub trait SchedulerPolicy: MergeHooks + Send {
    fn name(&self) -> &'static str;

    /// Queues `handle`. Returns the requests absorbed by insert merging,
    /// which may include `handle` itself.
    fn insert_request(
        &mut self,
        core: &mut ElvCore,
        handle: Handle,
        at_head: bool,
        now: Instant,
    ) -> Vec<Request>;

    fn dispatch_request(&mut self, core: &mut ElvCore, now: Instant) -> Option<Handle>;

    fn has_work(&self) -> bool;

    fn attributes(&self) -> Vec<(&'static str, String)>;

    fn show_attribute(&self, name: &str) -> Option<String> {
        self.attributes()
            .into_iter()
            .find(|(attr, _)| *attr == name)
            .map(|(_, value)| value)
    }

    fn store_attribute(&mut self, name: &str, value: &str) -> Result<(), QueueError>;
}

/// Scheduler selection supplied at queue construction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ElevatorKind {
    #[default]
    None,
    Deadline(DeadlineTunables),
}

impl ElevatorKind {
    pub fn deadline() -> Self {
        ElevatorKind::Deadline(DeadlineTunables::default())
    }

    pub fn name(&self) -> &'static str {
        match self {
            ElevatorKind::None => "none",
            ElevatorKind::Deadline(_) => DEADLINE_NAME,
        }
    }

    pub fn build(&self) -> Option<Box<dyn SchedulerPolicy>> {
        match self {
            ElevatorKind::None => None,
            ElevatorKind::Deadline(tunables) => Some(Box::new(DeadlinePolicy::new(*tunables))),
        }
    }
}

#[derive(Debug)]
pub enum ElvInsert {
    Queued(RequestId),
    /// The new request was folded into `into`. Every absorbed request is
    /// returned so its tag can be released.
    Merged {
        into: RequestId,
        absorbed: Vec<Request>,
    },
}

pub struct ElevatorQueue {
    core: ElvCore,
    policy: Box<dyn SchedulerPolicy>,
}

impl ElevatorQueue {
    pub fn new(policy: Box<dyn SchedulerPolicy>, max_sectors: u32, level: MergeLevel) -> Self {
        let mut core = ElvCore::new(max_sectors);
        core.index.set_level(level);
        Self { core, policy }
    }

    pub fn name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn len(&self) -> usize {
        self.core.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.arena.is_empty()
    }

    pub fn has_work(&self) -> bool {
        self.policy.has_work()
    }

    pub fn merge_level(&self) -> MergeLevel {
        self.core.index.level()
    }

    pub fn set_merge_level(&mut self, level: MergeLevel) {
        self.core.index.set_level(level);
    }

    /// Admission-time fast path: fold `bio` into a queued request.
    pub fn bio_merge(&mut self, bio: Bio) -> Result<(RequestId, Option<Request>), Bio> {
        let ElvCore { arena, index } = &mut self.core;
        match index.merge_bio(arena, bio, self.policy.as_mut()) {
            BioMerge::Merged { into, absorbed } => Ok((arena[into].id(), absorbed)),
            BioMerge::NotMerged(bio) => Err(bio),
        }
    }

    pub fn insert(&mut self, rq: Request, at_head: bool, now: Instant) -> ElvInsert {
        let id = rq.id();
        let handle = self.core.arena.insert(rq);
        let absorbed = self
            .policy
            .insert_request(&mut self.core, handle, at_head, now);
        if absorbed.iter().any(|rq| rq.id() == id) {
            let into = self
                .core
                .index
                .last_merge()
                .and_then(|h| self.core.arena.get(h))
                .map_or(id, Request::id);
            ElvInsert::Merged { into, absorbed }
        } else {
            debug_assert!(absorbed.is_empty() || self.core.arena.contains(handle));
            ElvInsert::Queued(id)
        }
    }

    pub fn dispatch(&mut self, now: Instant) -> Option<Request> {
        let handle = self.policy.dispatch_request(&mut self.core, now)?;
        match self.core.arena.remove(handle) {
            Some(rq) => {
                debug_assert!(rq.links.hash_key.is_none() && rq.links.sorted_key.is_none());
                Some(rq)
            }
            None => panic!("{} dispatched stale {:?}", self.policy.name(), handle),
        }
    }

    /// Empties the policy and every index. Used at teardown.
    pub fn drain(&mut self, now: Instant) -> Vec<Request> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(rq) = self.dispatch(now) {
            drained.push(rq);
        }
        self.core.index.clear();
        drained.extend(self.core.arena.drain());
        drained
    }

    pub fn attributes(&self) -> Vec<(&'static str, String)> {
        self.policy.attributes()
    }

    pub fn show_attribute(&self, name: &str) -> Option<String> {
        self.policy.show_attribute(name)
    }

    pub fn store_attribute(&mut self, name: &str, value: &str) -> Result<(), QueueError> {
        self.policy.store_attribute(name, value)
    }
}
