use std::fmt;

use bitflags::bitflags;
use tokio::sync::oneshot;

use crate::block::tag::AcquireFlags;
use crate::common::config::Sector;
use crate::common::exception::{BlkResult, QueueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Read = 0,
    Write = 1,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Read, Direction::Write];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BioFlags: u32 {
        /// Flush the device write cache before this I/O.
        const FLUSH = 1 << 0;
        /// Force unit access: complete only once on stable media.
        const FUA = 1 << 1;
        const NOMERGE = 1 << 2;
        /// Keep ordering against queued requests: no sorting, no merging.
        const SOFTBARRIER = 1 << 3;
    }
}

/// Opaque producer payload carried through to the driver untouched.
pub type Payload = u64;

/// A producer's I/O intent.
pub struct Bio {
    pub(crate) dir: Direction,
    pub(crate) sector: Sector,
    pub(crate) nr_sectors: u32,
    pub(crate) flags: BioFlags,
    pub(crate) acquire: AcquireFlags,
    pub(crate) payload: Option<Payload>,
    pub(crate) done: Option<oneshot::Sender<BlkResult>>,
}

impl Bio {
    /// Builds an intent. Ranges are checked at admission, so an empty flush
    /// is representable.
    pub fn new(dir: Direction, sector: Sector, nr_sectors: u32) -> Self {
        Self {
            dir,
            sector,
            nr_sectors,
            flags: BioFlags::empty(),
            acquire: AcquireFlags::empty(),
            payload: None,
            done: None,
        }
    }

    pub fn read(sector: Sector, nr_sectors: u32) -> Self {
        Self::new(Direction::Read, sector, nr_sectors)
    }

    pub fn write(sector: Sector, nr_sectors: u32) -> Self {
        Self::new(Direction::Write, sector, nr_sectors)
    }

    pub fn with_flags(mut self, flags: BioFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Fail admission with `Exhausted` instead of waiting for a tag.
    pub fn nowait(mut self) -> Self {
        self.acquire |= AcquireFlags::NOWAIT;
        self
    }

    /// Draw the tag from the reserved pool.
    pub fn reserved(mut self) -> Self {
        self.acquire |= AcquireFlags::RESERVED;
        self
    }

    /// Internal admissions bypass the fair-share limit.
    pub fn internal(mut self) -> Self {
        self.acquire |= AcquireFlags::INTERNAL;
        self
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

    pub fn flags(&self) -> BioFlags {
        self.flags
    }

    pub fn acquire_flags(&self) -> AcquireFlags {
        self.acquire
    }

    pub fn payload(&self) -> Option<Payload> {
        self.payload
    }

    pub fn is_flush_or_fua(&self) -> bool {
        self.flags.intersects(BioFlags::FLUSH | BioFlags::FUA)
    }

    pub fn is_mergeable(&self) -> bool {
        !self.flags.intersects(
            BioFlags::FLUSH | BioFlags::FUA | BioFlags::NOMERGE | BioFlags::SOFTBARRIER,
        )
    }

    /// Rejects ranges the queue cannot index: empty intents other than a
    /// flush, and ranges running past the last sector.
    pub fn validate(&self) -> Result<(), QueueError> {
        let reason = if self.nr_sectors == 0 && !self.flags.contains(BioFlags::FLUSH) {
            "empty range"
        } else if self.sector.checked_add(self.nr_sectors as Sector).is_none() {
            "range overflows the sector space"
        } else {
            return Ok(());
        };
        Err(QueueError::InvalidBio {
            sector: self.sector,
            nr_sectors: self.nr_sectors,
            reason,
        })
    }

    pub(crate) fn attach_completion(&mut self) -> oneshot::Receiver<BlkResult> {
        let (tx, rx) = oneshot::channel();
        self.done = Some(tx);
        rx
    }
}

impl fmt::Debug for Bio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bio")
            .field("dir", &self.dir)
            .field("sector", &self.sector)
            .field("nr_sectors", &self.nr_sectors)
            .field("flags", &self.flags)
            .field("acquire", &self.acquire)
            .finish()
    }
}
