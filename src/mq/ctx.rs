use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::block::bio::Bio;
use crate::block::request::{Request, RequestId};
use crate::common::config::SW_QUEUE_MERGE_DEPTH;
use crate::container::sbitmap::SBitmap;
use crate::elevator::merge::MergeLevel;

/// Per-CPU staging list used when no scheduling policy is installed.
///
/// The owning hardware queue keeps one pending bit per software queue; the
/// bit is updated under this queue's lock so it never disagrees with the
/// list for long.
pub struct SoftwareQueue {
    cpu: usize,
    hw_queue: usize,
    rq_list: Mutex<VecDeque<Request>>,
}

impl SoftwareQueue {
    pub fn new(cpu: usize, hw_queue: usize) -> Self {
        Self {
            cpu,
            hw_queue,
            rq_list: Mutex::new(VecDeque::new()),
        }
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn hw_queue(&self) -> usize {
        self.hw_queue
    }

    pub fn len(&self) -> usize {
        self.rq_list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rq_list.lock().is_empty()
    }

    /// Tries to fold `bio` into one of the most recently queued requests.
    pub fn attempt_merge(&self, bio: Bio, max_sectors: u32, level: MergeLevel) -> Result<RequestId, Bio> {
        let depth = match level {
            MergeLevel::All => SW_QUEUE_MERGE_DEPTH,
            MergeLevel::OneHitOnly => 1,
            MergeLevel::Disabled => return Err(bio),
        };
        if !bio.is_mergeable() {
            return Err(bio);
        }

        let mut list = self.rq_list.lock();
        let target = list.iter().rev().take(depth).position(|rq| {
            rq.can_merge_bio(&bio, max_sectors) && rq.classify_merge(&bio).is_some()
        });
        let Some(from_back) = target else {
            return Err(bio);
        };
        let index = list.len() - 1 - from_back;
        let rq = &mut list[index];
        match rq.classify_merge(&bio) {
            Some(kind) => {
                rq.merge_bio(bio, kind);
                Ok(rq.id())
            }
            None => Err(bio),
        }
    }

    pub(crate) fn insert(&self, rq: Request, at_head: bool, pending: &SBitmap, position: usize) {
        let mut list = self.rq_list.lock();
        if at_head {
            list.push_front(rq);
        } else {
            list.push_back(rq);
        }
        pending.set(position);
    }

    pub(crate) fn dequeue(&self, pending: &SBitmap, position: usize) -> Option<Request> {
        let mut list = self.rq_list.lock();
        let rq = list.pop_front();
        if list.is_empty() {
            pending.clear(position);
        }
        rq
    }

    pub(crate) fn take_all(&self, pending: &SBitmap, position: usize) -> Vec<Request> {
        let mut list = self.rq_list.lock();
        pending.clear(position);
        list.drain(..).collect()
    }
}
