//! Request merge index.
//!
//! Every request queued in a scheduling policy is reachable three ways:
//!
//! | structure              | key                | used for                      |
//! |------------------------|--------------------|-------------------------------|
//! | end-sector hash        | `sector + len`     | back merges of new intents    |
//! | sorted tree (per dir)  | `sector`           | front merges, sector order    |
//! | last-merge cache       | -                  | one-hit shortcut              |
//!
//! A merge that grows a request repositions it in whichever structure is keyed
//! on the edge that moved. A merge that makes two queued requests adjacent
//! coalesces them: the later one is detached everywhere and its intents move
//! to the earlier one.
//!
//! The keys a request was filed under are remembered in the request itself so
//! removal never depends on the request's current range.

use std::collections::BTreeSet;
use std::ops::Bound;

use crate::block::bio::{Bio, Direction};
use crate::block::request::{MergeKind, Request};
use crate::common::config::{ELV_HASH_BITS, Sector};
use crate::container::arena::{Arena, Handle};
use crate::container::hash_table::{ChainedHashTable, HashTable};

/// How aggressively intents are folded into queued requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeLevel {
    #[default]
    All,
    /// Only the last-merge cache is consulted.
    OneHitOnly,
    Disabled,
}

impl MergeLevel {
    pub fn from_attr(value: u64) -> Option<MergeLevel> {
        match value {
            0 => Some(MergeLevel::All),
            1 => Some(MergeLevel::OneHitOnly),
            2 => Some(MergeLevel::Disabled),
            _ => None,
        }
    }

    pub fn as_attr(&self) -> u8 {
        match self {
            MergeLevel::All => 0,
            MergeLevel::OneHitOnly => 1,
            MergeLevel::Disabled => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    NoMerge,
    BackMerge(Handle),
    FrontMerge(Handle),
}

/// Outcome of folding an intent into the queued requests.
#[derive(Debug)]
pub enum BioMerge {
    Merged {
        into: Handle,
        /// A queued request coalesced away by the merge; its tag is still held.
        absorbed: Option<Request>,
    },
    NotMerged(Bio),
}

/// Policy hooks consulted while merging.
pub trait MergeHooks {
    fn allow_merge(&self, _rq: &Request, _bio: &Bio) -> bool {
        true
    }

    fn front_merges(&self) -> bool {
        true
    }

    /// Front merge candidate: a queued request starting where `bio` ends.
    fn request_merge(&self, index: &MergeIndex, bio: &Bio) -> Option<Handle> {
        if !self.front_merges() {
            return None;
        }
        index.find_sorted(bio.dir(), bio.end_sector())
    }

    /// `handle` grew by a bio merge without coalescing.
    fn request_merged(&mut self, _arena: &mut Arena<Request>, _handle: Handle, _kind: MergeKind) {}

    /// `absorbed` is about to be folded into `primary`. Both are still in the
    /// arena and the index.
    fn requests_merged(
        &mut self,
        arena: &mut Arena<Request>,
        index: &MergeIndex,
        primary: Handle,
        absorbed: Handle,
    );
}

pub struct MergeIndex {
    hash: ChainedHashTable<Sector, Handle>,
    sorted: [BTreeSet<(Sector, Handle)>; 2],
    last_merge: Option<Handle>,
    level: MergeLevel,
    max_sectors: u32,
}

impl MergeIndex {
    pub fn new(max_sectors: u32) -> Self {
        Self {
            hash: ChainedHashTable::new(ELV_HASH_BITS),
            sorted: [BTreeSet::new(), BTreeSet::new()],
            last_merge: None,
            level: MergeLevel::All,
            max_sectors,
        }
    }

    pub fn level(&self) -> MergeLevel {
        self.level
    }

    pub fn set_level(&mut self, level: MergeLevel) {
        self.level = level;
        if level == MergeLevel::Disabled {
            self.last_merge = None;
        }
    }

    pub fn max_sectors(&self) -> u32 {
        self.max_sectors
    }

    pub fn last_merge(&self) -> Option<Handle> {
        self.last_merge
    }

    pub fn hash_len(&self) -> usize {
        self.hash.len()
    }

    pub fn sorted_len(&self, dir: Direction) -> usize {
        self.sorted[dir.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.hash.is_empty() && self.sorted.iter().all(BTreeSet::is_empty)
    }

    fn bio_merge_ok<H: MergeHooks + ?Sized>(&self, rq: &Request, bio: &Bio, hooks: &H) -> bool {
        rq.can_merge_bio(bio, self.max_sectors) && hooks.allow_merge(rq, bio)
    }

    /// Finds a queued request `bio` can be folded into.
    ///
    /// Candidates are tried in order: the last-merge cache, a back merge
    /// through the end-sector hash, then the policy's front merge lookup.
    pub fn try_merge<H>(&self, arena: &Arena<Request>, bio: &Bio, hooks: &H) -> MergeDecision
    where
        H: MergeHooks + ?Sized,
    {
        if self.level == MergeLevel::Disabled || !bio.is_mergeable() {
            return MergeDecision::NoMerge;
        }

        if let Some(handle) = self.last_merge
            && let Some(rq) = arena.get(handle)
            && self.bio_merge_ok(rq, bio, hooks)
        {
            match rq.classify_merge(bio) {
                Some(MergeKind::Back) => return MergeDecision::BackMerge(handle),
                Some(MergeKind::Front) => return MergeDecision::FrontMerge(handle),
                None => {}
            }
        }

        if self.level == MergeLevel::OneHitOnly {
            return MergeDecision::NoMerge;
        }

        let back = self
            .hash
            .find(&bio.sector(), |h| self.bio_merge_ok(&arena[*h], bio, hooks));
        if let Some(handle) = back {
            return MergeDecision::BackMerge(*handle);
        }

        if let Some(handle) = hooks.request_merge(self, bio) {
            let rq = &arena[handle];
            if self.bio_merge_ok(rq, bio, hooks) && rq.classify_merge(bio) == Some(MergeKind::Front)
            {
                return MergeDecision::FrontMerge(handle);
            }
        }
        MergeDecision::NoMerge
    }

    /// Folds `bio` into a queued request if one accepts it.
    pub fn merge_bio<H>(&mut self, arena: &mut Arena<Request>, bio: Bio, hooks: &mut H) -> BioMerge
    where
        H: MergeHooks + ?Sized,
    {
        match self.try_merge(arena, &bio, hooks) {
            MergeDecision::NoMerge => BioMerge::NotMerged(bio),
            MergeDecision::BackMerge(handle) => {
                arena[handle].merge_bio(bio, MergeKind::Back);
                let absorbed = self
                    .latter(arena, handle)
                    .and_then(|next| self.attempt_merge(arena, handle, next, hooks));
                if absorbed.is_none() {
                    hooks.request_merged(arena, handle, MergeKind::Back);
                    self.merged(arena, handle, MergeKind::Back);
                }
                BioMerge::Merged {
                    into: handle,
                    absorbed,
                }
            }
            MergeDecision::FrontMerge(handle) => {
                arena[handle].merge_bio(bio, MergeKind::Front);
                match self.former(arena, handle) {
                    Some(prev) => match self.attempt_merge(arena, prev, handle, hooks) {
                        Some(absorbed) => BioMerge::Merged {
                            into: prev,
                            absorbed: Some(absorbed),
                        },
                        None => {
                            hooks.request_merged(arena, handle, MergeKind::Front);
                            self.merged(arena, handle, MergeKind::Front);
                            BioMerge::Merged {
                                into: handle,
                                absorbed: None,
                            }
                        }
                    },
                    None => {
                        hooks.request_merged(arena, handle, MergeKind::Front);
                        self.merged(arena, handle, MergeKind::Front);
                        BioMerge::Merged {
                            into: handle,
                            absorbed: None,
                        }
                    }
                }
            }
        }
    }

    /// Re-keys `handle` after a bio merge moved one of its edges.
    fn merged(&mut self, arena: &mut Arena<Request>, handle: Handle, kind: MergeKind) {
        match kind {
            MergeKind::Back => self.hash_reposition(arena, handle),
            MergeKind::Front => self.sorted_reposition(arena, handle),
        }
        self.last_merge = Some(handle);
    }

    /// Coalesces `next` into `primary` when they are adjacent and compatible.
    /// Returns the emptied `next`.
    pub fn attempt_merge<H>(
        &mut self,
        arena: &mut Arena<Request>,
        primary: Handle,
        next: Handle,
        hooks: &mut H,
    ) -> Option<Request>
    where
        H: MergeHooks + ?Sized,
    {
        if !arena[primary].can_absorb(&arena[next], self.max_sectors) {
            return None;
        }
        hooks.requests_merged(arena, self, primary, next);
        self.remove(arena, next);
        let next_rq = arena.remove(next)?;
        let shell = arena[primary].absorb(next_rq);
        self.hash_reposition(arena, primary);
        self.last_merge = Some(primary);
        Some(shell)
    }

    /// Tries to fold a not yet indexed request into a queued one, chaining
    /// further merges while the result keeps meeting a queued neighbour.
    ///
    /// Returns every request that was absorbed; empty when nothing merged and
    /// `handle` still needs inserting.
    pub fn try_insert_merge<H>(
        &mut self,
        arena: &mut Arena<Request>,
        handle: Handle,
        hooks: &mut H,
    ) -> Vec<Request>
    where
        H: MergeHooks + ?Sized,
    {
        let mut absorbed = Vec::new();
        if self.level == MergeLevel::Disabled {
            return absorbed;
        }

        if let Some(last) = self.last_merge
            && last != handle
            && arena.contains(last)
            && let Some(shell) = self.attempt_merge(arena, last, handle, hooks)
        {
            absorbed.push(shell);
            return absorbed;
        }

        if self.level == MergeLevel::OneHitOnly {
            return absorbed;
        }

        let mut current = handle;
        loop {
            let sector = arena[current].sector();
            let candidate = self
                .hash
                .find(&sector, |h| {
                    *h != current && arena[*h].can_absorb(&arena[current], self.max_sectors)
                })
                .copied();
            let Some(candidate) = candidate else {
                break;
            };
            match self.attempt_merge(arena, candidate, current, hooks) {
                Some(shell) => {
                    absorbed.push(shell);
                    current = candidate;
                }
                None => break,
            }
        }
        absorbed
    }

    /// Files `handle` in its direction's tree and, if mergeable, the hash.
    ///
    /// # Panics
    /// If the request is already in a tree.
    pub fn add(&mut self, arena: &mut Arena<Request>, handle: Handle) {
        let rq = &mut arena[handle];
        assert!(
            rq.links.sorted_key.is_none(),
            "{} is already in a sorted tree",
            rq.id()
        );
        let key = rq.sector();
        rq.links.sorted_key = Some(key);
        let inserted = self.sorted[rq.dir().index()].insert((key, handle));
        assert!(inserted, "{} filed twice in a sorted tree", rq.id());

        if rq.is_mergeable() {
            self.hash_add(rq, handle);
            if self.last_merge.is_none() && self.level != MergeLevel::Disabled {
                self.last_merge = Some(handle);
            }
        }
    }

    /// Detaches `handle` from every structure. Safe on requests that were
    /// never filed.
    pub fn remove(&mut self, arena: &mut Arena<Request>, handle: Handle) {
        let rq = &mut arena[handle];
        if let Some(key) = rq.links.hash_key.take() {
            self.hash.remove(&key, &handle);
        }
        if let Some(key) = rq.links.sorted_key.take() {
            self.sorted[rq.dir().index()].remove(&(key, handle));
        }
        if self.last_merge == Some(handle) {
            self.last_merge = None;
        }
    }

    fn hash_add(&mut self, rq: &mut Request, handle: Handle) {
        let key = rq.end_sector();
        rq.links.hash_key = Some(key);
        self.hash.insert(key, handle);
    }

    fn hash_reposition(&mut self, arena: &mut Arena<Request>, handle: Handle) {
        let rq = &mut arena[handle];
        if let Some(key) = rq.links.hash_key.take() {
            self.hash.remove(&key, &handle);
            self.hash_add(rq, handle);
        }
    }

    fn sorted_reposition(&mut self, arena: &mut Arena<Request>, handle: Handle) {
        let rq = &mut arena[handle];
        if let Some(key) = rq.links.sorted_key {
            let tree = &mut self.sorted[rq.dir().index()];
            tree.remove(&(key, handle));
            let key = rq.sector();
            tree.insert((key, handle));
            rq.links.sorted_key = Some(key);
        }
    }

    /// Queued request of `dir` starting exactly at `sector`.
    pub fn find_sorted(&self, dir: Direction, sector: Sector) -> Option<Handle> {
        self.sorted[dir.index()]
            .range((sector, Handle::MIN)..)
            .next()
            .filter(|(key, _)| *key == sector)
            .map(|(_, handle)| *handle)
    }

    /// Sector-order predecessor of a filed request.
    pub fn former(&self, arena: &Arena<Request>, handle: Handle) -> Option<Handle> {
        let rq = &arena[handle];
        let key = rq.links.sorted_key?;
        self.sorted[rq.dir().index()]
            .range(..(key, handle))
            .next_back()
            .map(|(_, h)| *h)
    }

    /// Sector-order successor of a filed request.
    pub fn latter(&self, arena: &Arena<Request>, handle: Handle) -> Option<Handle> {
        let rq = &arena[handle];
        let key = rq.links.sorted_key?;
        self.sorted[rq.dir().index()]
            .range((Bound::Excluded((key, handle)), Bound::Unbounded))
            .next()
            .map(|(_, h)| *h)
    }

    pub fn clear(&mut self) {
        self.hash.clear();
        self.sorted.iter_mut().for_each(BTreeSet::clear);
        self.last_merge = None;
    }
}
