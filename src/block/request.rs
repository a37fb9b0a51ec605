use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use bitflags::bitflags;
use tokio::sync::oneshot;

use crate::block::bio::{Bio, BioFlags, Direction, Payload};
use crate::block::tag::Tag;
use crate::common::config::Sector;
use crate::common::exception::BlkResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rq#{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RqFlags: u32 {
        /// Handed to the driver and holding a dispatch budget slot.
        const STARTED = 1 << 0;
        /// Must not be reordered against other requests.
        const SOFTBARRIER = 1 << 1;
        /// Inserted into the scheduling policy's sorted structures.
        const SORTED = 1 << 2;
        const FLUSH = 1 << 3;
        const FUA = 1 << 4;
        const NOMERGE = 1 << 5;
        /// Returned by the driver at least once.
        const REQUEUED = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    Back,
    Front,
}

/// Where a queued request currently sits in the elevator's indices.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexLinks {
    pub(crate) hash_key: Option<Sector>,
    pub(crate) sorted_key: Option<Sector>,
    pub(crate) fifo_seq: Option<u64>,
}

/// One producer intent folded into a request.
pub struct Segment {
    sector: Sector,
    nr_sectors: u32,
    payload: Option<Payload>,
    done: Option<oneshot::Sender<BlkResult>>,
}

impl Segment {
    pub fn sector(&self) -> Sector {
        self.sector
    }

    pub fn nr_sectors(&self) -> u32 {
        self.nr_sectors
    }

    pub fn payload(&self) -> Option<Payload> {
        self.payload
    }
}

impl From<Bio> for Segment {
    fn from(bio: Bio) -> Self {
        Segment {
            sector: bio.sector,
            nr_sectors: bio.nr_sectors,
            payload: bio.payload,
            done: bio.done,
        }
    }
}

/// An I/O operation awaiting submission.
pub struct Request {
    id: RequestId,
    dir: Direction,
    sector: Sector,
    nr_sectors: u32,
    flags: RqFlags,
    tag: Option<Tag>,
    hw_queue: usize,
    sw_queue: usize,
    start_time: Instant,
    fifo_time: Option<Instant>,
    segments: VecDeque<Segment>,
    /// Hardware queue whose dispatch budget this request holds.
    budget_hw: Option<usize>,
    pub(crate) links: IndexLinks,
}

impl Request {
    pub(crate) fn from_bio(
        id: RequestId,
        bio: Bio,
        tag: Option<Tag>,
        hw_queue: usize,
        sw_queue: usize,
        now: Instant,
    ) -> Self {
        let mut flags = RqFlags::empty();
        if bio.flags.contains(BioFlags::FLUSH) {
            flags |= RqFlags::FLUSH;
        }
        if bio.flags.contains(BioFlags::FUA) {
            flags |= RqFlags::FUA;
        }
        if bio.flags.contains(BioFlags::NOMERGE) {
            flags |= RqFlags::NOMERGE;
        }
        if bio.flags.contains(BioFlags::SOFTBARRIER) {
            flags |= RqFlags::SOFTBARRIER;
        }
        let mut segments = VecDeque::with_capacity(1);
        let (dir, sector, nr_sectors) = (bio.dir, bio.sector, bio.nr_sectors);
        segments.push_back(Segment::from(bio));
        Self {
            id,
            dir,
            sector,
            nr_sectors,
            flags,
            tag,
            hw_queue,
            sw_queue,
            start_time: now,
            fifo_time: None,
            segments,
            budget_hw: None,
            links: IndexLinks::default(),
        }
    }

    /// A request that holds no tag and belongs to no queue, for driving a
    /// [`crate::elevator::ElevatorQueue`] on its own.
    pub fn untagged(id: RequestId, bio: Bio, now: Instant) -> Self {
        Self::from_bio(id, bio, None, 0, 0, now)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn dir(&self) -> Direction {
        self.dir
    }

    pub fn sector(&self) -> Sector {
        self.sector
    }

    pub fn nr_sectors(&self) -> u32 {
        self.nr_sectors
    }

    pub fn end_sector(&self) -> Sector {
        self.sector.saturating_add(self.nr_sectors as Sector)
    }

    pub fn flags(&self) -> RqFlags {
        self.flags
    }

    pub fn tag(&self) -> Option<Tag> {
        self.tag
    }

    pub fn hw_queue(&self) -> usize {
        self.hw_queue
    }

    pub fn sw_queue(&self) -> usize {
        self.sw_queue
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Expiry stamp assigned on insertion into a FIFO.
    pub fn fifo_time(&self) -> Option<Instant> {
        self.fifo_time
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    pub fn nr_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn payloads(&self) -> Vec<Payload> {
        self.segments.iter().filter_map(|s| s.payload).collect()
    }

    pub fn is_started(&self) -> bool {
        self.flags.contains(RqFlags::STARTED)
    }

    pub fn is_flush_or_fua(&self) -> bool {
        self.flags.intersects(RqFlags::FLUSH | RqFlags::FUA)
    }

    /// Requests that bypass sorting and go straight to a dispatch list.
    pub fn bypasses_sorting(&self) -> bool {
        self.flags
            .intersects(RqFlags::FLUSH | RqFlags::FUA | RqFlags::SOFTBARRIER)
    }

    pub fn is_mergeable(&self) -> bool {
        !self.flags.intersects(
            RqFlags::FLUSH | RqFlags::FUA | RqFlags::NOMERGE | RqFlags::SOFTBARRIER,
        )
    }

    /// Direction, flag and size compatibility of `bio` with this request.
    pub fn can_merge_bio(&self, bio: &Bio, max_sectors: u32) -> bool {
        self.is_mergeable()
            && bio.is_mergeable()
            && self.dir == bio.dir
            && self.nr_sectors.saturating_add(bio.nr_sectors) <= max_sectors
    }

    /// Position of `bio` relative to this request, if adjacent.
    pub fn classify_merge(&self, bio: &Bio) -> Option<MergeKind> {
        if self.end_sector() == bio.sector {
            Some(MergeKind::Back)
        } else if self.sector.checked_sub(bio.nr_sectors as Sector) == Some(bio.sector) {
            Some(MergeKind::Front)
        } else {
            None
        }
    }

    pub(crate) fn merge_bio(&mut self, bio: Bio, kind: MergeKind) {
        debug_assert_eq!(self.classify_merge(&bio), Some(kind));
        self.nr_sectors += bio.nr_sectors;
        match kind {
            MergeKind::Back => self.segments.push_back(Segment::from(bio)),
            MergeKind::Front => {
                self.sector = bio.sector;
                self.segments.push_front(Segment::from(bio));
            }
        }
    }

    /// Whether `next` directly follows this request and may be absorbed.
    pub fn can_absorb(&self, next: &Request, max_sectors: u32) -> bool {
        self.id != next.id
            && self.is_mergeable()
            && next.is_mergeable()
            && self.dir == next.dir
            && self.end_sector() == next.sector
            && self.nr_sectors.saturating_add(next.nr_sectors) <= max_sectors
    }

    /// Appends `next`'s range and intents; returns the emptied shell, which
    /// still owns its tag.
    pub(crate) fn absorb(&mut self, mut next: Request) -> Request {
        debug_assert_eq!(self.end_sector(), next.sector);
        self.nr_sectors += next.nr_sectors;
        self.segments.append(&mut next.segments);
        if next.start_time < self.start_time {
            self.start_time = next.start_time;
        }
        next.nr_sectors = 0;
        next
    }

    pub(crate) fn set_flags(&mut self, flags: RqFlags) {
        self.flags |= flags;
    }

    pub(crate) fn set_fifo_time(&mut self, at: Option<Instant>) {
        self.fifo_time = at;
    }

    /// Marks the request handed to the driver under `hw`'s budget.
    pub(crate) fn start(&mut self, hw: usize) {
        self.flags |= RqFlags::STARTED;
        self.budget_hw = Some(hw);
    }

    /// Undoes [`Request::start`], returning the queue owed a budget unit.
    pub(crate) fn unstart(&mut self) -> Option<usize> {
        self.flags &= !RqFlags::STARTED;
        self.budget_hw.take()
    }

    pub(crate) fn take_tag(&mut self) -> Option<Tag> {
        self.tag.take()
    }

    /// Delivers `result` to every intent carried by this request.
    pub(crate) fn complete(&mut self, result: BlkResult) -> usize {
        let mut delivered = 0;
        for segment in self.segments.drain(..) {
            if let Some(done) = segment.done {
                // The producer may have dropped its receiver.
                let _ = done.send(result);
                delivered += 1;
            }
        }
        delivered
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .field("sector", &self.sector)
            .field("nr_sectors", &self.nr_sectors)
            .field("flags", &self.flags)
            .field("tag", &self.tag)
            .field("hw_queue", &self.hw_queue)
            .finish()
    }
}
