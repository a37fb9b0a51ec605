//! Tag allocation.
//!
//! A [`TagAllocator`] hands out integer tags that stand for hardware
//! submission slots. The tag space is split in two pools:
//!
//! ```text
//!   0            nr_reserved                                   capacity
//!   ├── reserved ──┼──────────────────── general ────────────────┤
//!     privileged        fair-shared between active sharers when
//!     admissions only   the allocator is shared
//! ```
//!
//! Allocation never takes a lock on the fast path: both pools are
//! [`SBitmap`]s. When a pool is exhausted a blocking caller parks on one of
//! [`WAIT_QUEUE_COUNT`] wait queues; releases wake one waiter in round-robin
//! order and shutdown wakes them all.
//!
//! The blocking loop is driven through [`TagWaitContext`], which lets the
//! caller kick its hardware queue before parking and move to a different
//! allocator after waking up.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering, fence};

use bitflags::bitflags;
use log::{debug, info, trace};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::block::request::RequestId;
use crate::common::config::{MIN_FAIR_SHARE_TAGS, TagId, WAIT_QUEUE_COUNT};
use crate::common::exception::TagError;
use crate::container::sbitmap::SBitmap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(TagId);

impl Tag {
    pub fn id(&self) -> TagId {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag {}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AcquireFlags: u32 {
        /// Return `Exhausted` instead of waiting.
        const NOWAIT = 1 << 0;
        /// Allocate from the reserved pool.
        const RESERVED = 1 << 1;
        /// Administrative allocation that ignores the fair-share limit.
        const INTERNAL = 1 << 2;
    }
}

/// One hardware queue's view of an allocator.
///
/// Tracks how many general tags the queue holds and whether it counts as an
/// active sharer. A queue with parked allocations stays active while it holds
/// nothing, so the share of the queues starving it keeps shrinking.
#[derive(Debug)]
pub struct TagSharer {
    index: usize,
    active: AtomicBool,
    nr_active: AtomicUsize,
    parked: AtomicUsize,
    wait_index: AtomicUsize,
    hint: AtomicUsize,
}

impl TagSharer {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            active: AtomicBool::new(false),
            nr_active: AtomicUsize::new(0),
            parked: AtomicUsize::new(0),
            wait_index: AtomicUsize::new(index % WAIT_QUEUE_COUNT),
            hint: AtomicUsize::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn nr_active(&self) -> usize {
        self.nr_active.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Allocations of this queue currently parked on a wait list.
    pub fn parked(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }
}

struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
    waiters: AtomicUsize,
}

struct WaitQueues {
    queues: Vec<WaitQueue>,
    wake_index: AtomicUsize,
}

impl WaitQueues {
    fn new() -> Self {
        let queues = (0..WAIT_QUEUE_COUNT)
            .map(|_| WaitQueue {
                lock: Mutex::new(()),
                cond: Condvar::new(),
                waiters: AtomicUsize::new(0),
            })
            .collect();
        Self {
            queues,
            wake_index: AtomicUsize::new(0),
        }
    }

    fn pick(&self, sharer: &TagSharer) -> &WaitQueue {
        let index = sharer.wait_index.fetch_add(1, Ordering::Relaxed);
        &self.queues[index % WAIT_QUEUE_COUNT]
    }

    fn wake_one(&self) -> bool {
        fence(Ordering::SeqCst);
        let start = self.wake_index.load(Ordering::Relaxed);
        for i in 0..WAIT_QUEUE_COUNT {
            let index = (start + i) % WAIT_QUEUE_COUNT;
            let ws = &self.queues[index];
            if ws.waiters.load(Ordering::SeqCst) > 0 {
                self.wake_index
                    .store((index + 1) % WAIT_QUEUE_COUNT, Ordering::Relaxed);
                let _guard = ws.lock.lock();
                ws.cond.notify_one();
                return true;
            }
        }
        false
    }

    fn wake_all(&self) {
        for ws in &self.queues {
            let _guard = ws.lock.lock();
            ws.cond.notify_all();
        }
    }

    fn waiters(&self) -> usize {
        self.queues
            .iter()
            .map(|ws| ws.waiters.load(Ordering::SeqCst))
            .sum()
    }
}

/// Caller-side hooks for [`TagAllocator::acquire_with`].
pub trait TagWaitContext {
    /// The allocator the caller is currently bound to.
    fn allocator(&self) -> &TagAllocator;
    fn sharer(&self) -> &TagSharer;
    /// Runs a synchronous dispatch on the bound hardware queue so in-flight
    /// work can free tags before the caller parks.
    fn run_queue(&mut self);
    /// Re-resolves the CPU to hardware queue binding after a wakeup.
    fn rebind(&mut self);
    /// A dying owner turns the wait into a `Shutdown` failure.
    fn is_dying(&self) -> bool {
        false
    }
}

struct FixedBinding<'a> {
    allocator: &'a TagAllocator,
    sharer: &'a TagSharer,
}

impl TagWaitContext for FixedBinding<'_> {
    fn allocator(&self) -> &TagAllocator {
        self.allocator
    }

    fn sharer(&self) -> &TagSharer {
        self.sharer
    }

    fn run_queue(&mut self) {}

    fn rebind(&mut self) {}
}

pub struct TagAllocator {
    nr_reserved: usize,
    reserved: SBitmap,
    general: RwLock<SBitmap>,
    owners: RwLock<Vec<AtomicU64>>,
    active_queues: AtomicUsize,
    shared: AtomicBool,
    shutdown: AtomicBool,
    reserved_waits: WaitQueues,
    general_waits: WaitQueues,
}

impl TagAllocator {
    /// Creates an allocator with `depth` tags, the first `reserved` of which
    /// form the reserved pool.
    pub fn new(depth: usize, reserved: usize) -> Result<Self, TagError> {
        if depth == 0 || reserved >= depth {
            return Err(TagError::InvalidDepth {
                requested: depth,
                reserved,
            });
        }
        if depth > TagId::MAX as usize {
            return Err(TagError::InvalidConfig(format!(
                "depth {} exceeds the tag id space",
                depth
            )));
        }
        Ok(Self {
            nr_reserved: reserved,
            reserved: SBitmap::new(reserved),
            general: RwLock::new(SBitmap::new(depth - reserved)),
            owners: RwLock::new((0..depth).map(|_| AtomicU64::new(0)).collect()),
            active_queues: AtomicUsize::new(0),
            shared: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            reserved_waits: WaitQueues::new(),
            general_waits: WaitQueues::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.nr_reserved + self.general_depth()
    }

    pub fn nr_reserved(&self) -> usize {
        self.nr_reserved
    }

    pub fn general_depth(&self) -> usize {
        self.general.read().depth()
    }

    pub fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Acquire)
    }

    pub fn set_shared(&self, shared: bool) {
        if self.shared.swap(shared, Ordering::AcqRel) != shared {
            debug!("tag allocator shared mode set to {}", shared);
        }
    }

    pub fn active_queues(&self) -> usize {
        self.active_queues.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Fair share of the general pool for each active sharer.
    pub fn fair_share(&self) -> usize {
        let users = self.active_queues().max(1);
        self.general_depth()
            .div_ceil(users)
            .max(MIN_FAIR_SHARE_TAGS)
    }

    fn may_queue(&self, sharer: &TagSharer) -> bool {
        if !self.is_shared() || self.active_queues() == 0 {
            return true;
        }
        sharer.nr_active() < self.fair_share()
    }

    fn mark_busy(&self, sharer: &TagSharer) {
        if !sharer.active.swap(true, Ordering::AcqRel) {
            self.active_queues.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn mark_idle(&self, sharer: &TagSharer) {
        if sharer.active.swap(false, Ordering::AcqRel) {
            self.active_queues.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Drops `sharer` from the active count once it neither holds general
    /// tags nor waits for one.
    fn settle_idle(&self, sharer: &TagSharer) {
        if sharer.nr_active() == 0 && sharer.parked() == 0 {
            self.mark_idle(sharer);
        }
    }

    /// Single allocation attempt; never waits.
    pub fn try_acquire(&self, sharer: &TagSharer, flags: AcquireFlags) -> Result<Tag, TagError> {
        if self.is_shutdown() {
            return Err(TagError::Shutdown);
        }

        if flags.contains(AcquireFlags::RESERVED) {
            // Nothing could ever be released into an empty pool.
            if self.nr_reserved == 0 {
                return Err(TagError::NoReservedPool);
            }
            let hint = sharer.hint.load(Ordering::Relaxed) % self.nr_reserved;
            return match self.reserved.get(hint) {
                Some(bit) => Ok(Tag(bit as TagId)),
                None => Err(TagError::Exhausted),
            };
        }

        self.mark_busy(sharer);
        if !flags.contains(AcquireFlags::INTERNAL) && !self.may_queue(sharer) {
            trace!(
                "hw queue {} above fair share ({} held)",
                sharer.index,
                sharer.nr_active()
            );
            return Err(TagError::Exhausted);
        }

        let general = self.general.read();
        let hint = sharer.hint.load(Ordering::Relaxed);
        match general.get(hint) {
            Some(bit) => {
                sharer.hint.store(bit + 1, Ordering::Relaxed);
                sharer.nr_active.fetch_add(1, Ordering::AcqRel);
                Ok(Tag((self.nr_reserved + bit) as TagId))
            }
            None => {
                self.settle_idle(sharer);
                Err(TagError::Exhausted)
            }
        }
    }

    /// Acquires a tag, waiting unless `flags` carries `NOWAIT`.
    pub fn acquire(&self, sharer: &TagSharer, flags: AcquireFlags) -> Result<Tag, TagError> {
        let mut ctx = FixedBinding {
            allocator: self,
            sharer,
        };
        Self::acquire_with(&mut ctx, flags)
    }

    /// Blocking acquisition loop.
    ///
    /// Each round tries the allocator the context is bound to, runs the
    /// bound hardware queue, then parks until a release. After waking the
    /// context may rebind to another hardware queue before the next round.
    /// Only `Exhausted` is retried; every other failure returns at once.
    pub fn acquire_with<C>(ctx: &mut C, flags: AcquireFlags) -> Result<Tag, TagError>
    where
        C: TagWaitContext + ?Sized,
    {
        loop {
            match ctx.allocator().try_acquire(ctx.sharer(), flags) {
                Err(TagError::Exhausted) => {}
                other => return other,
            }
            if flags.contains(AcquireFlags::NOWAIT) {
                return Err(TagError::Exhausted);
            }

            ctx.run_queue();

            {
                let allocator = ctx.allocator();
                let sharer = ctx.sharer();
                let ws = allocator.waits(flags).pick(sharer);
                let mut guard = ws.lock.lock();
                ws.waiters.fetch_add(1, Ordering::SeqCst);
                sharer.parked.fetch_add(1, Ordering::SeqCst);
                fence(Ordering::SeqCst);

                let attempt = allocator.try_acquire(sharer, flags);
                let result = match attempt {
                    Err(TagError::Exhausted) if ctx.is_dying() => Some(Err(TagError::Shutdown)),
                    Err(TagError::Exhausted) => {
                        ws.cond.wait(&mut guard);
                        None
                    }
                    other => Some(other),
                };
                ws.waiters.fetch_sub(1, Ordering::SeqCst);
                sharer.parked.fetch_sub(1, Ordering::SeqCst);
                // A woken waiter stays active until its retry settles it.
                if let Some(result) = result {
                    if result.is_err() {
                        allocator.settle_idle(sharer);
                    }
                    return result;
                }
            }

            ctx.rebind();
        }
    }

    fn waits(&self, flags: AcquireFlags) -> &WaitQueues {
        if flags.contains(AcquireFlags::RESERVED) {
            &self.reserved_waits
        } else {
            &self.general_waits
        }
    }

    /// Returns `tag` to its pool and wakes one waiter.
    ///
    /// # Panics
    /// If `tag` was not held.
    pub fn release(&self, sharer: &TagSharer, tag: Tag) {
        let id = tag.0 as usize;
        if let Some(owner) = self.owners.read().get(id) {
            owner.store(0, Ordering::Release);
        }

        if id < self.nr_reserved {
            assert!(self.reserved.clear(id), "release of free reserved {}", tag);
            self.reserved_waits.wake_one();
            return;
        }

        {
            let general = self.general.read();
            assert!(general.clear(id - self.nr_reserved), "release of free {}", tag);
        }
        if sharer.nr_active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.settle_idle(sharer);
        }
        self.general_waits.wake_one();
    }

    pub fn set_owner(&self, tag: Tag, owner: RequestId) {
        if let Some(slot) = self.owners.read().get(tag.0 as usize) {
            slot.store(owner.get() + 1, Ordering::Release);
        }
    }

    /// The request currently holding `tag`, if any was recorded.
    pub fn owner(&self, tag: Tag) -> Option<RequestId> {
        let owners = self.owners.read();
        let raw = owners.get(tag.0 as usize)?.load(Ordering::Acquire);
        (raw != 0).then(|| RequestId::new(raw - 1))
    }

    pub fn is_held(&self, tag: Tag) -> bool {
        let id = tag.0 as usize;
        if id < self.nr_reserved {
            self.reserved.test(id)
        } else {
            self.general.read().test(id - self.nr_reserved)
        }
    }

    pub fn busy_count(&self) -> usize {
        self.reserved.weight() + self.general.read().weight()
    }

    pub fn for_each_busy(&self, mut f: impl FnMut(Tag, Option<RequestId>)) {
        let mut held = Vec::new();
        self.reserved.for_each_set(|bit| held.push(Tag(bit as TagId)));
        self.general
            .read()
            .for_each_set(|bit| held.push(Tag((self.nr_reserved + bit) as TagId)));
        for tag in held {
            f(tag, self.owner(tag));
        }
    }

    /// Number of callers currently parked on either pool.
    pub fn waiters(&self) -> usize {
        self.reserved_waits.waiters() + self.general_waits.waiters()
    }

    /// Changes the total depth. The reserved pool keeps its size.
    pub fn resize(&self, depth: usize) -> Result<(), TagError> {
        if depth <= self.nr_reserved {
            return Err(TagError::InvalidDepth {
                requested: depth,
                reserved: self.nr_reserved,
            });
        }
        if depth > TagId::MAX as usize {
            return Err(TagError::InvalidConfig(format!(
                "depth {} exceeds the tag id space",
                depth
            )));
        }
        {
            let mut owners = self.owners.write();
            if owners.len() < depth {
                owners.resize_with(depth, || AtomicU64::new(0));
            }
        }
        let old = {
            let mut general = self.general.write();
            let old = general.depth();
            general.resize(depth - self.nr_reserved);
            old
        };
        info!(
            "tag depth resized from {} to {} ({} reserved)",
            old + self.nr_reserved,
            depth,
            self.nr_reserved
        );
        self.general_waits.wake_all();
        Ok(())
    }

    /// Wakes every waiter so it can re-check its owner's state.
    pub fn wake_all(&self) {
        self.reserved_waits.wake_all();
        self.general_waits.wake_all();
    }

    /// Fails every current and future allocation with `Shutdown`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake_all();
    }
}

impl fmt::Debug for TagAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagAllocator")
            .field("capacity", &self.capacity())
            .field("nr_reserved", &self.nr_reserved)
            .field("busy", &self.busy_count())
            .field("shared", &self.is_shared())
            .field("active_queues", &self.active_queues())
            .finish()
    }
}
