use thiserror::Error;

use crate::common::config::Sector;

/// Failures of the tag allocator.
///
/// `Exhausted` is a deferral signal rather than a fault: callers that may
/// block never see it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TagError {
    #[error("no free tag available in the requested pool")]
    Exhausted,
    #[error("tag allocator is shutting down")]
    Shutdown,
    #[error("tag depth {requested} must exceed the {reserved} reserved tags")]
    InvalidDepth { requested: usize, reserved: usize },
    #[error("invalid tag configuration: {0}")]
    InvalidConfig(String),
    #[error("reserved tag requested but the reserved pool is empty")]
    NoReservedPool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("request queue is dying")]
    Dead,
    #[error(transparent)]
    Tag(#[from] TagError),
    #[error("unknown attribute `{0}`")]
    UnknownAttribute(String),
    #[error("invalid value `{value}` for attribute `{name}`")]
    InvalidAttribute { name: String, value: String },
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),
    #[error("hardware queue {0} out of range")]
    HardwareQueueOutOfRange(usize),
    #[error("invalid bio at sector {sector} ({nr_sectors} sectors): {reason}")]
    InvalidBio {
        sector: Sector,
        nr_sectors: u32,
        reason: &'static str,
    },
}

/// Completion status delivered to the producer of an intent.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkError {
    #[error("I/O error")]
    Io,
    #[error("device resources exhausted")]
    Resource,
}

pub type BlkResult = Result<(), BlkError>;
