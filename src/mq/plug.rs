//! Per-producer batching of admissions.
//!
//! Requests built under a plug are held back and inserted together when the
//! plug is flushed, finished or dropped; each touched hardware queue is then
//! run once. Intents adjacent to a plugged request are merged into it
//! without touching the queue.

use std::collections::BTreeSet;

use log::trace;

use crate::block::bio::Bio;
use crate::block::request::{Request, RequestId};
use crate::block::tag::AcquireFlags;
use crate::common::exception::{QueueError, TagError};
use crate::elevator::merge::MergeLevel;
use crate::mq::hctx::HctxCounters;
use crate::mq::queue::{Admission, QueueInner, RequestQueue, Submission};

pub struct Plug<'q> {
    queue: &'q QueueInner,
    list: Vec<Request>,
}

impl<'q> Plug<'q> {
    pub(crate) fn new(queue: &'q RequestQueue) -> Self {
        Self {
            queue: queue.inner(),
            list: Vec::new(),
        }
    }

    /// Requests currently held back.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Admits an intent into the plug.
    ///
    /// Tags are taken without waiting first; when the pool is dry the plug is
    /// flushed so its own requests can make progress, then the acquisition
    /// blocks as usual.
    pub fn submit_bio(&mut self, mut bio: Bio) -> Result<Submission, QueueError> {
        bio.validate()?;
        let queue = self.queue;
        let _usage = queue.enter()?;
        let completion = bio.attach_completion();

        let bio = match self.plug_merge(bio) {
            Ok(into) => {
                return Ok(Submission {
                    admission: Admission::Merged(into),
                    completion,
                });
            }
            Err(bio) => bio,
        };
        let cpu = queue.current_cpu();
        let bio = match queue.bio_merge(bio, cpu) {
            Ok(into) => {
                return Ok(Submission {
                    admission: Admission::Merged(into),
                    completion,
                });
            }
            Err(bio) => bio,
        };

        let flags = bio.acquire_flags();
        let (tag, cpu, hw) = match queue.alloc_tag(cpu, flags | AcquireFlags::NOWAIT) {
            Ok(bound) => bound,
            Err(QueueError::Tag(TagError::Exhausted))
                if !flags.contains(AcquireFlags::NOWAIT) =>
            {
                self.flush();
                queue.alloc_tag(queue.current_cpu(), flags)?
            }
            Err(err) => return Err(err),
        };
        let rq = queue.build_request(bio, tag, cpu, hw);
        let id = rq.id();
        self.list.push(rq);
        Ok(Submission {
            admission: Admission::Queued(id),
            completion,
        })
    }

    fn plug_merge(&mut self, bio: Bio) -> Result<RequestId, Bio> {
        if !bio.is_mergeable() || self.queue.merge_level() == MergeLevel::Disabled {
            return Err(bio);
        }
        let max_sectors = self.queue.config.max_sectors;
        let found = self.list.iter().rposition(|rq| {
            rq.can_merge_bio(&bio, max_sectors) && rq.classify_merge(&bio).is_some()
        });
        let Some(pos) = found else {
            return Err(bio);
        };
        let rq = &mut self.list[pos];
        let Some(kind) = rq.classify_merge(&bio) else {
            return Err(bio);
        };
        rq.merge_bio(bio, kind);
        HctxCounters::bump(&self.queue.hw_queues[rq.hw_queue()].counters.merged, 1);
        Ok(rq.id())
    }

    /// Inserts every held request and runs each touched hardware queue once.
    /// On a dying queue the held requests are failed instead.
    pub fn flush(&mut self) {
        if self.list.is_empty() {
            return;
        }
        let queue = self.queue;
        let batch = std::mem::take(&mut self.list);
        let _usage = match queue.enter() {
            Ok(usage) => usage,
            Err(_) => {
                for rq in batch {
                    queue.abort_request(rq);
                }
                return;
            }
        };

        trace!("flushing plug of {} requests", batch.len());
        let mut touched = BTreeSet::new();
        for rq in batch {
            touched.insert(rq.hw_queue());
            queue.insert_request(rq, false, false);
        }
        for hw in touched {
            queue.run_hw_queue(hw);
        }
    }

    /// Flushes and releases the plug.
    pub fn finish(mut self) {
        self.flush();
    }
}

impl Drop for Plug<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}
