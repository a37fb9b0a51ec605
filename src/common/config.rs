use std::time::Duration;

/// A 512-byte unit of device addressing.
pub type Sector = u64;
pub type TagId = u32;

pub const SECTOR_SHIFT: u32 = 9;

// Deadline policy defaults
pub const DEFAULT_READ_EXPIRE: Duration = Duration::from_millis(500);
pub const DEFAULT_WRITE_EXPIRE: Duration = Duration::from_millis(5000);
pub const DEFAULT_WRITES_STARVED: u32 = 2;
pub const DEFAULT_FIFO_BATCH: u32 = 16;

// Tag allocation
pub const MIN_FAIR_SHARE_TAGS: usize = 4;
pub const WAIT_QUEUE_COUNT: usize = 8;
pub const BLKDEV_MAX_RQ: usize = 128;
pub const BLKDEV_MIN_RQ: usize = 4;

// Request queue defaults
pub const DEFAULT_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_DISPATCH_BATCH: usize = 16;
pub const DEFAULT_MAX_SECTORS: u32 = 2560;
pub const SW_QUEUE_MERGE_DEPTH: usize = 8;

/// log2 of the bucket count of the end-sector merge hash.
pub const ELV_HASH_BITS: u32 = 6;
