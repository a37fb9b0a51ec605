//! Hardware queue dispatch and restart.
//!
//! A pass moves requests from the residual list, the scheduling policy or the
//! software queues to the driver. Budget denial and driver rejection defer
//! work: the hardware queue is marked for restart and the next completion
//! runs it again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::block::request::{Request, RqFlags};
use crate::block::tag::TagAllocator;
use crate::common::exception::BlkResult;
use crate::elevator::ElevatorQueue;
use crate::mq::hctx::{HardwareQueue, HctxCounters};
use crate::mq::queue::QueueInner;

impl QueueInner {
    pub(crate) fn is_quiesced(&self) -> bool {
        self.quiesced.load(Ordering::SeqCst)
    }

    fn has_work(&self, hctx: &HardwareQueue) -> bool {
        hctx.residual_len() > 0
            || hctx.has_pending_ctx()
            || self.elevator.as_ref().is_some_and(|e| e.lock().has_work())
    }

    /// Runs a dispatch pass on `hw` in the calling thread, or leaves a rerun
    /// request for the thread already running one. Returns false when the
    /// queue is stopped, quiesced or has nothing to do.
    pub(crate) fn run_hw_queue(&self, hw: usize) -> bool {
        let hctx = &self.hw_queues[hw];
        if self.is_quiesced() || hctx.is_stopped() || !self.has_work(hctx) {
            return false;
        }
        if !hctx.try_begin_run() {
            trace!("hw queue {} busy, rerun requested", hw);
            return true;
        }
        loop {
            self.dispatch_requests(hctx);
            if !hctx.finish_run() {
                break;
            }
        }
        true
    }

    fn dispatch_requests(&self, hctx: &HardwareQueue) {
        if hctx.is_stopped() || self.is_quiesced() {
            return;
        }
        HctxCounters::bump(&hctx.counters.runs, 1);

        let residual: VecDeque<Request> = hctx.dispatch.lock().drain(..).collect();
        if !residual.is_empty() {
            // Leftovers from an earlier pass: retry them first and make sure
            // a completion comes back for whatever still does not fit.
            self.mark_restart(hctx);
            if self.dispatch_rq_list(hctx, residual, false) {
                match &self.elevator {
                    Some(elevator) => self.do_dispatch_sched(hctx, elevator),
                    None => self.do_dispatch_ctx(hctx),
                }
            }
        } else if let Some(elevator) = &self.elevator {
            self.do_dispatch_sched(hctx, elevator);
        } else if hctx.is_dispatch_busy() {
            self.do_dispatch_ctx(hctx);
        } else {
            let mut list = VecDeque::new();
            hctx.pending.for_each_set(|pos| {
                let cpu = hctx.cpus()[pos];
                list.extend(self.sw_queues[cpu].take_all(&hctx.pending, pos));
            });
            if !list.is_empty() {
                self.dispatch_rq_list(hctx, list, false);
            }
        }
    }

    /// Pulls batches from the policy while budget lasts and the driver keeps
    /// accepting.
    fn do_dispatch_sched(&self, hctx: &HardwareQueue, elevator: &Mutex<ElevatorQueue>) {
        let hw = hctx.index();
        let limit = self.config.dispatch_batch.max(1);
        loop {
            let mut batch = VecDeque::with_capacity(limit);
            {
                let now = self.clock.now();
                let mut elevator = elevator.lock();
                while batch.len() < limit && elevator.has_work() {
                    let seen = hctx.completed();
                    if !self.budget.get(hw) {
                        self.defer_for_restart(hctx, seen);
                        break;
                    }
                    match elevator.dispatch(now) {
                        Some(mut rq) => {
                            rq.start(hw);
                            batch.push_back(rq);
                        }
                        None => {
                            self.budget.put(hw);
                            break;
                        }
                    }
                }
            }
            if batch.is_empty() || !self.dispatch_rq_list(hctx, batch, true) {
                break;
            }
        }
    }

    /// Takes one request at a time from the mapped software queues in
    /// round-robin order, remembering where to resume.
    fn do_dispatch_ctx(&self, hctx: &HardwareQueue) {
        let hw = hctx.index();
        let nr_ctx = hctx.cpus().len();
        if nr_ctx == 0 {
            return;
        }
        let mut next = hctx.dispatch_from.load(Ordering::Relaxed) % nr_ctx;
        while hctx.has_pending_ctx() {
            let seen = hctx.completed();
            if !self.budget.get(hw) {
                self.defer_for_restart(hctx, seen);
                break;
            }
            let Some((pos, mut rq)) = self.dequeue_ctx_from(hctx, next) else {
                self.budget.put(hw);
                break;
            };
            next = (pos + 1) % nr_ctx;
            rq.start(hw);
            if !self.dispatch_rq_list(hctx, VecDeque::from([rq]), true) {
                break;
            }
        }
        hctx.dispatch_from.store(next, Ordering::Relaxed);
    }

    fn dequeue_ctx_from(&self, hctx: &HardwareQueue, start: usize) -> Option<(usize, Request)> {
        let cpus = hctx.cpus();
        (0..cpus.len())
            .map(|i| (start + i) % cpus.len())
            .find_map(|pos| {
                self.sw_queues[cpus[pos]]
                    .dequeue(&hctx.pending, pos)
                    .map(|rq| (pos, rq))
            })
    }

    /// Hands `list` to the driver. Returns true when something was accepted
    /// and nothing is left over; leftovers go back to the head of the
    /// residual list.
    fn dispatch_rq_list(
        &self,
        hctx: &HardwareQueue,
        mut list: VecDeque<Request>,
        got_budget: bool,
    ) -> bool {
        let hw = hctx.index();
        let seen = hctx.completed();

        let mut ready = Vec::with_capacity(list.len());
        if got_budget {
            ready.extend(list.drain(..));
        } else {
            while let Some(mut rq) = list.pop_front() {
                if !self.budget.get(hw) {
                    list.push_front(rq);
                    break;
                }
                rq.start(hw);
                ready.push(rq);
            }
        }

        let mut accepted = 0;
        if !ready.is_empty() {
            let submitted = ready.len();
            let outcome = self.submitter.submit(hw, ready);
            let rejected = outcome.rejected.len();
            accepted = submitted.saturating_sub(rejected);
            for mut rq in outcome.rejected.into_iter().rev() {
                if let Some(budget_hw) = rq.unstart() {
                    self.budget.put(budget_hw);
                }
                list.push_front(rq);
            }
            HctxCounters::bump(&hctx.counters.dispatched, accepted as u64);
            HctxCounters::bump(&hctx.counters.rejected, rejected as u64);
        }

        if list.is_empty() {
            hctx.dispatch_busy.store(false, Ordering::Release);
            return accepted > 0;
        }

        debug!(
            "hw queue {}: {} requests deferred after {} accepted",
            hw,
            list.len(),
            accepted
        );
        {
            let mut residual = hctx.dispatch.lock();
            for rq in list.into_iter().rev() {
                residual.push_front(rq);
            }
        }
        self.defer_for_restart(hctx, seen);
        hctx.dispatch_busy.store(true, Ordering::Release);
        false
    }

    /// Marks `hctx` for restart. A completion that slipped in since `seen`
    /// may have missed the mark, so the current pass reruns instead.
    fn defer_for_restart(&self, hctx: &HardwareQueue, seen: u64) {
        self.mark_restart(hctx);
        if hctx.completed() != seen {
            hctx.request_rerun();
        }
    }

    fn mark_restart(&self, hctx: &HardwareQueue) {
        if !hctx.restart.swap(true, Ordering::SeqCst) {
            self.tag_set.inc_restart();
            trace!("hw queue {} marked for restart", hctx.index());
        }
    }

    fn restart_hctx(&self, hctx: &HardwareQueue) -> bool {
        if !hctx.restart.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.tag_set.dec_restart();
        HctxCounters::bump(&hctx.counters.restarts, 1);
        self.run_hw_queue(hctx.index());
        true
    }

    /// Restarts the first marked hardware queue drawing from `tags`.
    pub(crate) fn restart_first_marked(&self, tags: &Arc<TagAllocator>) -> bool {
        self.hw_queues
            .iter()
            .filter(|hctx| Arc::ptr_eq(&hctx.tags, tags))
            .any(|hctx| self.restart_hctx(hctx))
    }

    /// Called after resources of hardware queue `hw` were freed.
    ///
    /// With a shared tag set one marked queue is restarted: peers attached to
    /// the set first, then this queue's own hardware queues starting after
    /// `hw`. The set-wide counter lets the scan be skipped when nothing is
    /// marked.
    pub(crate) fn sched_restart(&self, hw: usize) {
        let hctx = &self.hw_queues[hw];
        if !self.tag_set.is_shared() {
            self.restart_hctx(hctx);
            return;
        }
        if self.tag_set.restart_pending() == 0 {
            return;
        }

        let tags = &hctx.tags;
        for peer in self.tag_set.peers_after(self.member_id) {
            if peer.restart_shared(tags) {
                return;
            }
        }
        let nr_hw = self.hw_queues.len();
        for i in 1..=nr_hw {
            let other = &self.hw_queues[(hw + i) % nr_hw];
            if Arc::ptr_eq(&other.tags, tags) && self.restart_hctx(other) {
                return;
            }
        }
    }

    pub(crate) fn end_request(&self, mut rq: Request, result: BlkResult) {
        let budget_hw = rq.unstart();
        if let Some(budget_hw) = budget_hw {
            self.budget.put(budget_hw);
        }
        rq.complete(result);

        let hw = rq.hw_queue();
        if let Some(tag) = rq.take_tag() {
            let owner = &self.hw_queues[hw];
            owner.tags.release(&owner.sharer, tag);
        }

        let done_hw = budget_hw.unwrap_or(hw);
        self.hw_queues[done_hw]
            .counters
            .completed
            .fetch_add(1, Ordering::SeqCst);
        self.sched_restart(done_hw);
    }

    pub(crate) fn requeue_request(&self, mut rq: Request) {
        if let Some(budget_hw) = rq.unstart() {
            self.budget.put(budget_hw);
        }
        rq.set_flags(RqFlags::REQUEUED);

        let hw = rq.hw_queue();
        let hctx = &self.hw_queues[hw];
        {
            let mut residual = hctx.dispatch.lock();
            if !self.is_dying() {
                residual.push_back(rq);
                drop(residual);
                HctxCounters::bump(&hctx.counters.requeued, 1);
                debug!("request requeued on hw queue {}", hw);
                self.run_hw_queue(hw);
                return;
            }
        }
        self.abort_request(rq);
    }
}
