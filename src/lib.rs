//! Multi-queue block I/O scheduling.
//!
//! The crate sits between I/O producers and a device's hardware submission
//! channels. Producers hand in [`block::bio::Bio`] intents through a
//! [`mq::queue::RequestQueue`]; intents are folded into existing requests where
//! possible, sorted by an optional [`elevator::SchedulerPolicy`] and finally
//! handed to a driver-supplied [`mq::submit::Submitter`] in batches.
//!
//! ```text
//!  producer ─► merge index ─► tag allocator ─► policy / sw queue
//!                                                     │
//!                         completion ◄── submitter ◄──┘ (per hw queue dispatch)
//! ```

pub mod block;
pub mod common;
pub mod container;
pub mod elevator;
pub mod mq;
