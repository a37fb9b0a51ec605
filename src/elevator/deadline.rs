//! Deadline scheduling policy.
//!
//! Requests are kept twice per direction: in insertion order with an expiry
//! stamp (the FIFO) and in sector order (the merge index tree). Dispatch
//! normally walks the sorted order in batches; a FIFO head that has expired
//! interrupts the walk, and reads are preferred over writes only until
//! `writes_starved` read batches have gone out while writes waited.
//!
//! ```text
//!            ┌── bypass list (flush / FUA / at-head) ──────────────┐
//!  insert ───┤                                                     ├──► dispatch
//!            └── fifo[dir] + sorted[dir] ── batch cursor / expiry ─┘
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use log::warn;

use crate::block::bio::Direction;
use crate::block::request::{Request, RqFlags};
use crate::common::config::{
    DEFAULT_FIFO_BATCH, DEFAULT_READ_EXPIRE, DEFAULT_WRITE_EXPIRE, DEFAULT_WRITES_STARVED,
};
use crate::common::exception::QueueError;
use crate::container::arena::{Arena, Handle};
use crate::elevator::merge::{MergeHooks, MergeIndex};
use crate::elevator::{ElvCore, SchedulerPolicy};

pub const DEADLINE_NAME: &str = "mq-deadline";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineTunables {
    pub read_expire: Duration,
    pub write_expire: Duration,
    /// Read batches allowed while writes wait before a write batch is forced.
    pub writes_starved: u32,
    pub front_merges: bool,
    /// Maximum number of sequential requests dispatched as one batch.
    pub fifo_batch: u32,
}

impl Default for DeadlineTunables {
    fn default() -> Self {
        Self {
            read_expire: DEFAULT_READ_EXPIRE,
            write_expire: DEFAULT_WRITE_EXPIRE,
            writes_starved: DEFAULT_WRITES_STARVED,
            front_merges: true,
            fifo_batch: DEFAULT_FIFO_BATCH,
        }
    }
}

impl DeadlineTunables {
    pub fn expire(&self, dir: Direction) -> Duration {
        match dir {
            Direction::Read => self.read_expire,
            Direction::Write => self.write_expire,
        }
    }

    pub fn with_read_expire(mut self, expire: Duration) -> Self {
        self.read_expire = expire;
        self
    }

    pub fn with_write_expire(mut self, expire: Duration) -> Self {
        self.write_expire = expire;
        self
    }

    pub fn with_writes_starved(mut self, writes_starved: u32) -> Self {
        self.writes_starved = writes_starved;
        self
    }

    pub fn with_front_merges(mut self, front_merges: bool) -> Self {
        self.front_merges = front_merges;
        self
    }

    pub fn with_fifo_batch(mut self, fifo_batch: u32) -> Self {
        self.fifo_batch = fifo_batch;
        self
    }
}

pub struct DeadlinePolicy {
    tunables: DeadlineTunables,
    fifo: [BTreeMap<u64, Handle>; 2],
    next_seq: u64,
    next_rq: [Option<Handle>; 2],
    batching: u32,
    starved: u32,
    dispatch: VecDeque<Handle>,
}

impl DeadlinePolicy {
    pub fn new(tunables: DeadlineTunables) -> Self {
        Self {
            tunables,
            fifo: [BTreeMap::new(), BTreeMap::new()],
            next_seq: 0,
            next_rq: [None, None],
            batching: 0,
            starved: 0,
            dispatch: VecDeque::new(),
        }
    }

    pub fn tunables(&self) -> &DeadlineTunables {
        &self.tunables
    }

    pub fn fifo_len(&self, dir: Direction) -> usize {
        self.fifo[dir.index()].len()
    }

    pub fn bypass_len(&self) -> usize {
        self.dispatch.len()
    }

    pub fn starved(&self) -> u32 {
        self.starved
    }

    pub fn batching(&self) -> u32 {
        self.batching
    }

    fn fifo_head(&self, dir: Direction) -> Option<Handle> {
        self.fifo[dir.index()].values().next().copied()
    }

    /// Whether the oldest request of `dir` has passed its expiry.
    fn check_fifo(&self, arena: &Arena<Request>, dir: Direction, now: Instant) -> bool {
        self.fifo_head(dir)
            .and_then(|h| arena[h].fifo_time())
            .is_some_and(|expiry| now >= expiry)
    }

    fn remove_request(&mut self, core: &mut ElvCore, handle: Handle) {
        let dir = core.arena[handle].dir();
        if let Some(seq) = core.arena[handle].links.fifo_seq.take() {
            self.fifo[dir.index()].remove(&seq);
        }
        if self.next_rq[dir.index()] == Some(handle) {
            self.next_rq[dir.index()] = core.index.latter(&core.arena, handle);
        }
        core.index.remove(&mut core.arena, handle);
    }

    /// Detaches `handle` for dispatch and caches its sector successor.
    fn move_request(&mut self, core: &mut ElvCore, handle: Handle) {
        let dir = core.arena[handle].dir();
        self.next_rq = [None, None];
        self.next_rq[dir.index()] = core.index.latter(&core.arena, handle);
        self.remove_request(core, handle);
    }

    fn choose_direction(&mut self) -> Option<Direction> {
        let reads = !self.fifo[Direction::Read.index()].is_empty();
        let writes = !self.fifo[Direction::Write.index()].is_empty();

        if reads {
            if writes && self.starved >= self.tunables.writes_starved {
                self.starved = 0;
                return Some(Direction::Write);
            }
            if writes {
                self.starved += 1;
            }
            return Some(Direction::Read);
        }
        if writes {
            self.starved = 0;
            return Some(Direction::Write);
        }
        None
    }

    fn parse_attr(name: &str, value: &str) -> Result<i64, QueueError> {
        value
            .trim()
            .parse::<i64>()
            .map_err(|_| QueueError::InvalidAttribute {
                name: name.to_string(),
                value: value.to_string(),
            })
    }
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        Self::new(DeadlineTunables::default())
    }
}

impl MergeHooks for DeadlinePolicy {
    fn front_merges(&self) -> bool {
        self.tunables.front_merges
    }

    fn requests_merged(
        &mut self,
        arena: &mut Arena<Request>,
        index: &MergeIndex,
        primary: Handle,
        absorbed: Handle,
    ) {
        let dir = arena[absorbed].dir();
        let primary_seq = arena[primary].links.fifo_seq;
        let absorbed_seq = arena[absorbed].links.fifo_seq.take();

        if let (Some(p_seq), Some(a_seq)) = (primary_seq, absorbed_seq) {
            let earlier = match (arena[absorbed].fifo_time(), arena[primary].fifo_time()) {
                (Some(a), Some(p)) => a < p,
                _ => false,
            };
            let fifo = &mut self.fifo[dir.index()];
            if earlier {
                // The survivor inherits the absorbed request's place and expiry.
                fifo.remove(&p_seq);
                fifo.insert(a_seq, primary);
                let expiry = arena[absorbed].fifo_time();
                let rq = &mut arena[primary];
                rq.links.fifo_seq = Some(a_seq);
                rq.set_fifo_time(expiry);
            } else {
                fifo.remove(&a_seq);
            }
        } else if let Some(a_seq) = absorbed_seq {
            self.fifo[dir.index()].remove(&a_seq);
        }

        if self.next_rq[dir.index()] == Some(absorbed) {
            self.next_rq[dir.index()] = index.latter(arena, absorbed);
        }
    }
}

impl SchedulerPolicy for DeadlinePolicy {
    fn name(&self) -> &'static str {
        DEADLINE_NAME
    }

    fn insert_request(
        &mut self,
        core: &mut ElvCore,
        handle: Handle,
        at_head: bool,
        now: Instant,
    ) -> Vec<Request> {
        let rq = &core.arena[handle];
        if at_head || rq.bypasses_sorting() {
            if at_head {
                self.dispatch.push_front(handle);
            } else {
                self.dispatch.push_back(handle);
            }
            return Vec::new();
        }

        let absorbed = core.index.try_insert_merge(&mut core.arena, handle, self);
        if !absorbed.is_empty() {
            return absorbed;
        }

        core.index.add(&mut core.arena, handle);
        let rq = &mut core.arena[handle];
        let dir = rq.dir();
        let seq = self.next_seq;
        self.next_seq += 1;
        rq.set_flags(RqFlags::SORTED);
        rq.set_fifo_time(Some(now + self.tunables.expire(dir)));
        rq.links.fifo_seq = Some(seq);
        self.fifo[dir.index()].insert(seq, handle);
        Vec::new()
    }

    fn dispatch_request(&mut self, core: &mut ElvCore, now: Instant) -> Option<Handle> {
        if let Some(handle) = self.dispatch.pop_front() {
            return Some(handle);
        }

        let cursor = self.next_rq[Direction::Write.index()]
            .or(self.next_rq[Direction::Read.index()]);
        let handle = match cursor {
            Some(handle) if self.batching < self.tunables.fifo_batch => handle,
            _ => {
                let dir = self.choose_direction()?;
                let handle = match self.next_rq[dir.index()] {
                    Some(next) if !self.check_fifo(&core.arena, dir, now) => next,
                    _ => self.fifo_head(dir)?,
                };
                self.batching = 0;
                handle
            }
        };

        self.batching += 1;
        self.move_request(core, handle);
        Some(handle)
    }

    fn has_work(&self) -> bool {
        !self.dispatch.is_empty() || self.fifo.iter().any(|fifo| !fifo.is_empty())
    }

    fn attributes(&self) -> Vec<(&'static str, String)> {
        vec![
            ("read_expire", self.tunables.read_expire.as_millis().to_string()),
            ("write_expire", self.tunables.write_expire.as_millis().to_string()),
            ("writes_starved", self.tunables.writes_starved.to_string()),
            ("front_merges", u8::from(self.tunables.front_merges).to_string()),
            ("fifo_batch", self.tunables.fifo_batch.to_string()),
        ]
    }

    fn store_attribute(&mut self, name: &str, value: &str) -> Result<(), QueueError> {
        let max = i32::MAX as i64;
        match name {
            "read_expire" => {
                let ms = Self::parse_attr(name, value)?.clamp(0, max);
                self.tunables.read_expire = Duration::from_millis(ms as u64);
            }
            "write_expire" => {
                let ms = Self::parse_attr(name, value)?.clamp(0, max);
                self.tunables.write_expire = Duration::from_millis(ms as u64);
            }
            "writes_starved" => {
                self.tunables.writes_starved = Self::parse_attr(name, value)?.clamp(0, max) as u32;
            }
            "front_merges" => {
                self.tunables.front_merges = Self::parse_attr(name, value)?.clamp(0, 1) == 1;
            }
            "fifo_batch" => {
                self.tunables.fifo_batch = Self::parse_attr(name, value)?.clamp(0, max) as u32;
            }
            _ => {
                warn!("{}: unknown attribute {}", DEADLINE_NAME, name);
                return Err(QueueError::UnknownAttribute(name.to_string()));
            }
        }
        Ok(())
    }
}
