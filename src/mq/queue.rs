//! Device request queue: admission, administration and teardown.
//!
//! ```text
//!  submit_bio ──► merge (policy index | cpu software queue)
//!       │                      │ merged: done
//!       ▼
//!  tag acquire (may block, runs the hw queue first, rebinds after waking)
//!       │
//!       ▼
//!  insert (policy | software queue | bypass) ──► run hw queue
//! ```
//!
//! The dispatch side lives in the private `sched` module.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::block::bio::Bio;
use crate::block::request::{Request, RequestId};
use crate::block::tag::{AcquireFlags, Tag, TagAllocator, TagSharer, TagWaitContext};
use crate::block::tag_set::{TagSet, TagSetMember};
use crate::common::config::BLKDEV_MIN_RQ;
use crate::common::exception::{BlkError, BlkResult, QueueError, TagError};
use crate::common::time::{MonotonicClock, TimeSource};
use crate::elevator::merge::MergeLevel;
use crate::elevator::{ElevatorQueue, ElvInsert, SchedulerPolicy};
use crate::mq::budget::{DispatchBudget, QueueDepthBudget, UnlimitedBudget};
use crate::mq::config::QueueConfig;
use crate::mq::cpu::{CpuLocator, CpuMap, ThreadCpuLocator};
use crate::mq::ctx::SoftwareQueue;
use crate::mq::hctx::{HardwareQueue, HctxCounters, HctxStats};
use crate::mq::plug::Plug;
use crate::mq::submit::Submitter;

/// Result of admitting an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Folded into an already queued request.
    Merged(RequestId),
    Queued(RequestId),
}

impl Admission {
    pub fn request_id(&self) -> RequestId {
        match self {
            Admission::Merged(id) | Admission::Queued(id) => *id,
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, Admission::Merged(_))
    }
}

#[derive(Debug)]
pub struct Submission {
    pub admission: Admission,
    /// Resolves when the request carrying this intent completes.
    pub completion: oneshot::Receiver<BlkResult>,
}

pub(crate) struct QueueInner {
    pub(crate) member_id: usize,
    pub(crate) config: QueueConfig,
    pub(crate) tag_set: Arc<TagSet>,
    pub(crate) hw_queues: Vec<HardwareQueue>,
    pub(crate) sw_queues: Vec<SoftwareQueue>,
    pub(crate) cpu_map: CpuMap,
    pub(crate) elevator: Option<Mutex<ElevatorQueue>>,
    merge_level: AtomicU8,
    pub(crate) submitter: Arc<dyn Submitter>,
    pub(crate) budget: Arc<dyn DispatchBudget>,
    locator: Arc<dyn CpuLocator>,
    pub(crate) clock: Arc<dyn TimeSource>,
    dying: AtomicBool,
    pub(crate) quiesced: AtomicBool,
    usage: AtomicUsize,
    next_rq_id: AtomicU64,
    nr_requests: AtomicUsize,
}

/// Holds off teardown while an admission is in progress.
pub(crate) struct QueueUsage<'a> {
    queue: &'a QueueInner,
}

impl Drop for QueueUsage<'_> {
    fn drop(&mut self) {
        self.queue.usage.fetch_sub(1, Ordering::SeqCst);
    }
}

struct QueueTagWait<'a> {
    queue: &'a QueueInner,
    cpu: usize,
    hw: usize,
}

impl TagWaitContext for QueueTagWait<'_> {
    fn allocator(&self) -> &TagAllocator {
        &self.queue.hw_queues[self.hw].tags
    }

    fn sharer(&self) -> &TagSharer {
        &self.queue.hw_queues[self.hw].sharer
    }

    fn run_queue(&mut self) {
        self.queue.run_hw_queue(self.hw);
    }

    fn rebind(&mut self) {
        self.cpu = self.queue.current_cpu();
        self.hw = self.queue.cpu_map.hw_queue(self.cpu);
    }

    fn is_dying(&self) -> bool {
        self.queue.is_dying()
    }
}

impl QueueInner {
    pub(crate) fn is_dying(&self) -> bool {
        self.dying.load(Ordering::SeqCst)
    }

    pub(crate) fn enter(&self) -> Result<QueueUsage<'_>, QueueError> {
        self.usage.fetch_add(1, Ordering::SeqCst);
        let usage = QueueUsage { queue: self };
        if self.is_dying() {
            return Err(QueueError::Dead);
        }
        Ok(usage)
    }

    pub(crate) fn current_cpu(&self) -> usize {
        self.locator.current_cpu() % self.cpu_map.nr_cpus()
    }

    pub(crate) fn merge_level(&self) -> MergeLevel {
        match self.merge_level.load(Ordering::Acquire) {
            0 => MergeLevel::All,
            1 => MergeLevel::OneHitOnly,
            _ => MergeLevel::Disabled,
        }
    }

    /// Admission fast path. Returns the bio untouched when nothing took it.
    pub(crate) fn bio_merge(&self, bio: Bio, cpu: usize) -> Result<RequestId, Bio> {
        if !bio.is_mergeable() {
            return Err(bio);
        }
        let hctx = &self.hw_queues[self.cpu_map.hw_queue(cpu)];
        let into = match &self.elevator {
            Some(elevator) => {
                let (into, absorbed) = elevator.lock().bio_merge(bio)?;
                if let Some(shell) = absorbed {
                    self.free_request(shell);
                }
                into
            }
            None => self.sw_queues[cpu].attempt_merge(
                bio,
                self.config.max_sectors,
                self.merge_level(),
            )?,
        };
        HctxCounters::bump(&hctx.counters.merged, 1);
        Ok(into)
    }

    /// Acquires a tag for an admission from `cpu`. Returns the tag with the
    /// CPU and hardware queue the caller ended up bound to.
    pub(crate) fn alloc_tag(
        &self,
        cpu: usize,
        flags: AcquireFlags,
    ) -> Result<(Tag, usize, usize), QueueError> {
        let mut ctx = QueueTagWait {
            queue: self,
            cpu,
            hw: self.cpu_map.hw_queue(cpu),
        };
        match TagAllocator::acquire_with(&mut ctx, flags) {
            Ok(tag) => Ok((tag, ctx.cpu, ctx.hw)),
            Err(TagError::Shutdown) if self.is_dying() => Err(QueueError::Dead),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn build_request(&self, bio: Bio, tag: Tag, cpu: usize, hw: usize) -> Request {
        let id = RequestId::new(self.next_rq_id.fetch_add(1, Ordering::Relaxed));
        self.hw_queues[hw].tags.set_owner(tag, id);
        Request::from_bio(id, bio, Some(tag), hw, cpu, self.clock.now())
    }

    /// Queues a freshly built request and optionally kicks its hw queue.
    pub(crate) fn insert_request(&self, rq: Request, at_head: bool, run: bool) -> Admission {
        let hw = rq.hw_queue();
        let id = rq.id();
        let hctx = &self.hw_queues[hw];
        HctxCounters::bump(&hctx.counters.queued, 1);

        let admission = match &self.elevator {
            Some(elevator) => {
                let outcome = elevator.lock().insert(rq, at_head, self.clock.now());
                match outcome {
                    ElvInsert::Queued(id) => Admission::Queued(id),
                    ElvInsert::Merged { into, absorbed } => {
                        for shell in absorbed {
                            self.free_request(shell);
                        }
                        HctxCounters::bump(&hctx.counters.merged, 1);
                        Admission::Merged(into)
                    }
                }
            }
            None if rq.is_flush_or_fua() => {
                hctx.dispatch.lock().push_back(rq);
                Admission::Queued(id)
            }
            None => {
                let cpu = rq.sw_queue();
                self.sw_queues[cpu].insert(rq, at_head, &hctx.pending, self.cpu_map.position(cpu));
                Admission::Queued(id)
            }
        };

        if run {
            self.run_hw_queue(hw);
        }
        admission
    }

    /// Releases an absorbed request's tag. It carries no intents any more.
    pub(crate) fn free_request(&self, mut shell: Request) {
        debug_assert_eq!(shell.nr_segments(), 0);
        let hw = shell.hw_queue();
        if let Some(tag) = shell.take_tag() {
            let hctx = &self.hw_queues[hw];
            hctx.tags.release(&hctx.sharer, tag);
            self.sched_restart(hw);
        }
    }

    /// Completes a request nobody will dispatch any more.
    pub(crate) fn abort_request(&self, mut rq: Request) {
        rq.complete(Err(BlkError::Io));
        if let Some(budget_hw) = rq.unstart() {
            self.budget.put(budget_hw);
        }
        let hw = rq.hw_queue();
        if let Some(tag) = rq.take_tag() {
            let hctx = &self.hw_queues[hw];
            hctx.tags.release(&hctx.sharer, tag);
        }
    }

    fn wait_for_admissions(&self) {
        while self.usage.load(Ordering::SeqCst) > 0 {
            thread::yield_now();
        }
    }

    fn wait_for_dispatch(&self) {
        for hctx in &self.hw_queues {
            while hctx.is_running() {
                thread::yield_now();
            }
        }
    }

    fn drain_all(&self) -> Vec<Request> {
        let mut drained = Vec::new();
        for hctx in &self.hw_queues {
            drained.extend(hctx.dispatch.lock().drain(..));
        }
        if let Some(elevator) = &self.elevator {
            drained.extend(elevator.lock().drain(self.clock.now()));
        }
        for (cpu, ctx) in self.sw_queues.iter().enumerate() {
            let hctx = &self.hw_queues[ctx.hw_queue()];
            drained.extend(ctx.take_all(&hctx.pending, self.cpu_map.position(cpu)));
        }
        drained
    }

    fn cleanup(&self) -> usize {
        if self.dying.swap(true, Ordering::SeqCst) {
            return 0;
        }
        self.quiesced.store(true, Ordering::SeqCst);
        for tags in self.tag_set.allocators() {
            tags.wake_all();
        }
        self.wait_for_admissions();
        self.wait_for_dispatch();

        let drained = self.drain_all();
        let aborted = drained.len();
        for rq in drained {
            self.abort_request(rq);
        }
        self.tag_set.detach(self.member_id);
        warn!(
            "request queue {} torn down, {} pending requests aborted",
            self.member_id, aborted
        );
        aborted
    }
}

impl TagSetMember for QueueInner {
    fn restart_shared(&self, tags: &Arc<TagAllocator>) -> bool {
        self.restart_first_marked(tags)
    }
}

/// Builds a [`RequestQueue`].
pub struct QueueBuilder {
    config: QueueConfig,
    submitter: Option<Arc<dyn Submitter>>,
    budget: Option<Arc<dyn DispatchBudget>>,
    clock: Option<Arc<dyn TimeSource>>,
    locator: Option<Arc<dyn CpuLocator>>,
    tag_set: Option<Arc<TagSet>>,
    policy: Option<Box<dyn SchedulerPolicy>>,
}

impl QueueBuilder {
    pub fn submitter(mut self, submitter: impl Submitter + 'static) -> Self {
        self.submitter = Some(Arc::new(submitter));
        self
    }

    pub fn shared_submitter(mut self, submitter: Arc<dyn Submitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn budget(mut self, budget: Arc<dyn DispatchBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn cpu_locator(mut self, locator: Arc<dyn CpuLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Attaches the queue to an existing, possibly shared, tag set.
    pub fn tag_set(mut self, tag_set: Arc<TagSet>) -> Self {
        self.tag_set = Some(tag_set);
        self
    }

    /// Installs a custom policy instead of the configured elevator.
    pub fn policy(mut self, policy: Box<dyn SchedulerPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<RequestQueue, QueueError> {
        let config = self.config;
        config.validate()?;
        let submitter = self
            .submitter
            .ok_or_else(|| QueueError::InvalidConfig("a submitter is required".to_string()))?;

        let tag_set = match self.tag_set {
            Some(set) if set.nr_hw_queues() != config.nr_hw_queues => {
                return Err(QueueError::InvalidConfig(format!(
                    "tag set serves {} hw queues, queue has {}",
                    set.nr_hw_queues(),
                    config.nr_hw_queues
                )));
            }
            Some(set) => set,
            None => TagSet::new(config.tag_set_config())?,
        };

        let budget: Arc<dyn DispatchBudget> = match (self.budget, config.budget_depth) {
            (Some(budget), _) => budget,
            (None, Some(depth)) => Arc::new(QueueDepthBudget::new(config.nr_hw_queues, depth)),
            (None, None) => Arc::new(UnlimitedBudget),
        };
        let locator: Arc<dyn CpuLocator> = match self.locator {
            Some(locator) => locator,
            None => Arc::new(ThreadCpuLocator),
        };
        let clock: Arc<dyn TimeSource> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(MonotonicClock),
        };

        let cpu_map = CpuMap::new(config.nr_cpus, config.nr_hw_queues);
        let hw_queues = (0..config.nr_hw_queues)
            .map(|hw| {
                HardwareQueue::new(hw, Arc::clone(tag_set.tags(hw)), cpu_map.cpus_of(hw).to_vec())
            })
            .collect();
        let sw_queues = (0..config.nr_cpus)
            .map(|cpu| SoftwareQueue::new(cpu, cpu_map.hw_queue(cpu)))
            .collect();

        let policy = self.policy.or_else(|| config.elevator.build());
        let elevator = policy.map(|policy| {
            Mutex::new(ElevatorQueue::new(policy, config.max_sectors, config.merge_level))
        });
        let scheduler = elevator.as_ref().map_or("none", |e| e.lock().name());

        let member_id = tag_set.register();
        let nr_requests = tag_set.tags(0).capacity();
        let inner = Arc::new(QueueInner {
            member_id,
            merge_level: AtomicU8::new(config.merge_level.as_attr()),
            tag_set: Arc::clone(&tag_set),
            hw_queues,
            sw_queues,
            cpu_map,
            elevator,
            submitter,
            budget,
            locator,
            clock,
            dying: AtomicBool::new(false),
            quiesced: AtomicBool::new(false),
            usage: AtomicUsize::new(0),
            next_rq_id: AtomicU64::new(1),
            nr_requests: AtomicUsize::new(nr_requests),
            config,
        });
        let member: Weak<dyn TagSetMember> = Arc::downgrade(&inner) as Weak<dyn TagSetMember>;
        tag_set.attach(member_id, member);

        info!(
            "request queue {}: {} hw queues, {} cpus, scheduler {}, {} tags per hw queue",
            member_id,
            inner.config.nr_hw_queues,
            inner.config.nr_cpus,
            scheduler,
            nr_requests
        );
        Ok(RequestQueue { inner })
    }
}

/// A block device's request queue.
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    pub fn builder(config: QueueConfig) -> QueueBuilder {
        QueueBuilder {
            config,
            submitter: None,
            budget: None,
            clock: None,
            locator: None,
            tag_set: None,
            policy: None,
        }
    }

    pub(crate) fn inner(&self) -> &QueueInner {
        &self.inner
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn tag_set(&self) -> &Arc<TagSet> {
        &self.inner.tag_set
    }

    pub fn nr_hw_queues(&self) -> usize {
        self.inner.hw_queues.len()
    }

    pub fn hw_queue(&self, hw: usize) -> Result<&HardwareQueue, QueueError> {
        self.inner
            .hw_queues
            .get(hw)
            .ok_or(QueueError::HardwareQueueOutOfRange(hw))
    }

    pub fn map_cpu(&self, cpu: usize) -> usize {
        self.inner.cpu_map.hw_queue(cpu % self.inner.cpu_map.nr_cpus())
    }

    pub fn scheduler(&self) -> &'static str {
        self.inner
            .elevator
            .as_ref()
            .map_or("none", |e| e.lock().name())
    }

    pub fn is_dying(&self) -> bool {
        self.inner.is_dying()
    }

    /// Admits one intent.
    ///
    /// The intent is folded into a queued request when possible. Otherwise a
    /// tag is acquired, blocking unless the bio asks for `nowait`, and the
    /// new request is queued and its hardware queue run. Ranges that cannot
    /// be indexed are rejected with `InvalidBio`; a reserved admission on a
    /// queue without reserved tags fails with `NoReservedPool`.
    pub fn submit_bio(&self, mut bio: Bio) -> Result<Submission, QueueError> {
        bio.validate()?;
        let inner = &self.inner;
        let _usage = inner.enter()?;
        let completion = bio.attach_completion();
        let cpu = inner.current_cpu();

        let bio = match inner.bio_merge(bio, cpu) {
            Ok(into) => {
                return Ok(Submission {
                    admission: Admission::Merged(into),
                    completion,
                });
            }
            Err(bio) => bio,
        };

        let flags = bio.acquire_flags();
        let (tag, cpu, hw) = inner.alloc_tag(cpu, flags)?;
        let rq = inner.build_request(bio, tag, cpu, hw);
        let admission = inner.insert_request(rq, false, true);
        Ok(Submission {
            admission,
            completion,
        })
    }

    /// Starts batching admissions; see [`Plug`].
    pub fn plug(&self) -> Plug<'_> {
        Plug::new(self)
    }

    /// Reports a request handed to the driver as finished.
    pub fn end_request(&self, rq: Request, result: BlkResult) {
        self.inner.end_request(rq, result);
    }

    /// Hands an accepted request back for a later retry.
    pub fn requeue_request(&self, rq: Request) {
        self.inner.requeue_request(rq);
    }

    pub fn run_hw_queue(&self, hw: usize) -> Result<bool, QueueError> {
        self.hw_queue(hw)?;
        Ok(self.inner.run_hw_queue(hw))
    }

    pub fn run_hw_queues(&self) {
        for hw in 0..self.nr_hw_queues() {
            self.inner.run_hw_queue(hw);
        }
    }

    pub fn stop_hw_queue(&self, hw: usize) -> Result<(), QueueError> {
        self.hw_queue(hw)?.set_stopped(true);
        debug!("hw queue {} stopped", hw);
        Ok(())
    }

    pub fn start_hw_queue(&self, hw: usize) -> Result<(), QueueError> {
        self.hw_queue(hw)?.set_stopped(false);
        debug!("hw queue {} started", hw);
        self.inner.run_hw_queue(hw);
        Ok(())
    }

    pub fn stop_hw_queues(&self) {
        for hctx in &self.inner.hw_queues {
            hctx.set_stopped(true);
        }
    }

    pub fn start_hw_queues(&self) {
        for hctx in &self.inner.hw_queues {
            hctx.set_stopped(false);
        }
        self.run_hw_queues();
    }

    /// Stops dispatch on every hardware queue and waits for running passes.
    pub fn quiesce(&self) {
        self.inner.quiesced.store(true, Ordering::SeqCst);
        self.inner.wait_for_dispatch();
    }

    pub fn unquiesce(&self) {
        self.inner.quiesced.store(false, Ordering::SeqCst);
        self.run_hw_queues();
    }

    pub fn is_quiesced(&self) -> bool {
        self.inner.quiesced.load(Ordering::SeqCst)
    }

    pub fn hw_queue_stats(&self, hw: usize) -> Result<HctxStats, QueueError> {
        Ok(self.hw_queue(hw)?.stats())
    }

    pub fn merge_level(&self) -> MergeLevel {
        self.inner.merge_level()
    }

    pub fn set_merge_level(&self, level: MergeLevel) {
        self.inner
            .merge_level
            .store(level.as_attr(), Ordering::Release);
        if let Some(elevator) = &self.inner.elevator {
            elevator.lock().set_merge_level(level);
        }
    }

    pub fn nr_requests(&self) -> usize {
        self.inner.nr_requests.load(Ordering::Acquire)
    }

    /// Resizes the tag pools of every hardware queue.
    pub fn update_nr_requests(&self, nr: usize) -> Result<(), QueueError> {
        let nr = nr.max(BLKDEV_MIN_RQ);
        self.inner.tag_set.resize(nr)?;
        self.inner.nr_requests.store(nr, Ordering::Release);
        info!("request queue {}: nr_requests set to {}", self.inner.member_id, nr);
        Ok(())
    }

    /// Every readable attribute with its current value.
    pub fn attributes(&self) -> Vec<(String, String)> {
        let mut attrs = vec![
            ("scheduler".to_string(), self.scheduler().to_string()),
            ("nomerges".to_string(), self.merge_level().as_attr().to_string()),
            ("nr_requests".to_string(), self.nr_requests().to_string()),
            ("nr_hw_queues".to_string(), self.nr_hw_queues().to_string()),
        ];
        if let Some(elevator) = &self.inner.elevator {
            attrs.extend(
                elevator
                    .lock()
                    .attributes()
                    .into_iter()
                    .map(|(name, value)| (name.to_string(), value)),
            );
        }
        attrs
    }

    pub fn attribute(&self, name: &str) -> Result<String, QueueError> {
        self.attributes()
            .into_iter()
            .find(|(attr, _)| attr == name)
            .map(|(_, value)| value)
            .ok_or_else(|| QueueError::UnknownAttribute(name.to_string()))
    }

    pub fn set_attribute(&self, name: &str, value: &str) -> Result<(), QueueError> {
        let result = self.store_attribute(name, value);
        if let Err(err) = &result {
            warn!("rejected write of `{}` to {}: {}", value, name, err);
        }
        result
    }

    fn store_attribute(&self, name: &str, value: &str) -> Result<(), QueueError> {
        let invalid = || QueueError::InvalidAttribute {
            name: name.to_string(),
            value: value.to_string(),
        };
        match name {
            "nomerges" => {
                let level = value
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .and_then(MergeLevel::from_attr)
                    .ok_or_else(invalid)?;
                self.set_merge_level(level);
                Ok(())
            }
            "nr_requests" => {
                let nr = value.trim().parse::<usize>().map_err(|_| invalid())?;
                self.update_nr_requests(nr)
            }
            "scheduler" | "nr_hw_queues" => Err(invalid()),
            _ => match &self.inner.elevator {
                Some(elevator) => elevator.lock().store_attribute(name, value),
                None => Err(QueueError::UnknownAttribute(name.to_string())),
            },
        }
    }

    /// Tears the queue down.
    ///
    /// New admissions fail with `Dead`, parked tag waiters are woken, and
    /// every request not yet accepted by the driver is completed with
    /// [`BlkError::Io`]. Returns the number of aborted requests. Must not be
    /// called from inside a submit callback.
    pub fn cleanup(&self) -> usize {
        self.inner.cleanup()
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.inner.cleanup();
    }
}
