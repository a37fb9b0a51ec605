use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use iosched::block::tag::{AcquireFlags, Tag, TagAllocator, TagSharer};
use iosched::common::exception::TagError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::logger::init_test_logger;

fn slots(n: usize) -> Arc<Vec<AtomicBool>> {
    Arc::new((0..n).map(|_| AtomicBool::new(false)).collect())
}

#[test]
fn blocking_acquire_keeps_tags_exclusive_under_contention() {
    init_test_logger();
    let tags = Arc::new(assert_ok!(TagAllocator::new(4, 0)));
    let sharer = Arc::new(TagSharer::new(0));
    let held = slots(4);

    let workers: Vec<_> = (0..8u64)
        .map(|seed| {
            let (tags, sharer, held) = (tags.clone(), sharer.clone(), held.clone());
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..500 {
                    let tag = assert_ok!(tags.acquire(&sharer, AcquireFlags::empty()));
                    let slot = tag.id() as usize;
                    assert!(
                        !held[slot].swap(true, Ordering::SeqCst),
                        "tag {} handed out twice",
                        slot
                    );
                    for _ in 0..rng.gen_range(0..4) {
                        thread::yield_now();
                    }
                    held[slot].store(false, Ordering::SeqCst);
                    tags.release(&sharer, tag);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(tags.busy_count(), 0);
    assert_eq!(tags.waiters(), 0);
    assert_eq!(sharer.nr_active(), 0);
}

#[test]
fn reserved_and_general_pools_never_cross() {
    init_test_logger();
    let tags = Arc::new(assert_ok!(TagAllocator::new(16, 4)));
    let held = slots(16);

    let workers: Vec<_> = (0..6usize)
        .map(|worker| {
            let (tags, held) = (tags.clone(), held.clone());
            thread::spawn(move || {
                let sharer = TagSharer::new(worker);
                let reserved = worker < 2;
                let flags = if reserved {
                    AcquireFlags::RESERVED
                } else {
                    AcquireFlags::empty()
                };
                let mut rng = StdRng::seed_from_u64(worker as u64 + 100);
                let mut mine: Vec<Tag> = Vec::new();
                for _ in 0..2_000 {
                    if !mine.is_empty() && rng.gen_bool(0.5) {
                        let tag = mine.swap_remove(rng.gen_range(0..mine.len()));
                        held[tag.id() as usize].store(false, Ordering::SeqCst);
                        tags.release(&sharer, tag);
                        continue;
                    }
                    match tags.try_acquire(&sharer, flags) {
                        Ok(tag) => {
                            let id = tag.id() as usize;
                            assert_eq!(id < 4, reserved, "tag {} from the wrong pool", id);
                            assert!(!held[id].swap(true, Ordering::SeqCst));
                            mine.push(tag);
                        }
                        Err(TagError::Exhausted) => {}
                        Err(other) => panic!("unexpected {:?}", other),
                    }
                }
                for tag in mine {
                    held[tag.id() as usize].store(false, Ordering::SeqCst);
                    tags.release(&sharer, tag);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(tags.busy_count(), 0);
}

#[test]
fn shared_allocator_never_exceeds_fair_share() {
    let tags = assert_ok!(TagAllocator::new(8, 0));
    tags.set_shared(true);
    let sharers: Vec<_> = (0..4).map(TagSharer::new).collect();
    let mut held: Vec<Vec<Tag>> = vec![Vec::new(); 4];
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..5_000 {
        let who = rng.gen_range(0..4);
        if !held[who].is_empty() && rng.gen_bool(0.4) {
            let tag = held[who].pop().unwrap();
            tags.release(&sharers[who], tag);
        } else if let Ok(tag) = tags.try_acquire(&sharers[who], AcquireFlags::empty()) {
            held[who].push(tag);
            // 8 tags over up to 4 sharers would be 2 each; the floor keeps 4.
            assert!(sharers[who].nr_active() <= tags.fair_share());
            assert!(tags.fair_share() >= 4);
        }

        let active = sharers.iter().filter(|s| s.nr_active() > 0).count();
        assert_eq!(tags.active_queues(), active);
        let total: usize = held.iter().map(Vec::len).sum();
        assert_eq!(tags.busy_count(), total);
    }
}

#[test]
fn internal_acquisitions_ignore_fairness() {
    let tags = assert_ok!(TagAllocator::new(8, 0));
    tags.set_shared(true);
    let (a, b) = (TagSharer::new(0), TagSharer::new(1));
    let _b_tag = assert_ok!(tags.try_acquire(&b, AcquireFlags::empty()));

    let mut a_tags = Vec::new();
    while let Ok(tag) = tags.try_acquire(&a, AcquireFlags::empty()) {
        a_tags.push(tag);
    }
    assert_eq!(a_tags.len(), tags.fair_share());

    let extra = assert_ok!(tags.try_acquire(&a, AcquireFlags::INTERNAL));
    assert!(tags.is_held(extra));
}

#[test]
fn resize_wakes_parked_waiters() {
    init_test_logger();
    let tags = Arc::new(assert_ok!(TagAllocator::new(2, 0)));
    let sharer = Arc::new(TagSharer::new(0));
    let first = assert_ok!(tags.try_acquire(&sharer, AcquireFlags::empty()));
    let second = assert_ok!(tags.try_acquire(&sharer, AcquireFlags::empty()));

    let waiter = {
        let (tags, sharer) = (tags.clone(), sharer.clone());
        thread::spawn(move || tags.acquire(&sharer, AcquireFlags::empty()))
    };
    while tags.waiters() == 0 {
        thread::yield_now();
    }
    assert_ok!(tags.resize(4));

    let tag = assert_ok!(waiter.join().unwrap());
    assert!(tag.id() >= 2);
    assert_ne!(tag, first);
    assert_ne!(tag, second);
    assert_eq!(tags.busy_count(), 3);
}

fn expected_share(depth: usize, active: usize) -> usize {
    depth.div_ceil(active).max(4)
}

#[test]
fn starved_sharer_gets_tags_once_the_hog_drops_to_its_share() {
    init_test_logger();
    let tags = Arc::new(assert_ok!(TagAllocator::new(16, 0)));
    tags.set_shared(true);
    let hog = TagSharer::new(0);
    let starved = Arc::new(TagSharer::new(1));

    // Alone, the hog's share is the whole pool.
    let mut hog_tags: Vec<Tag> = (0..16)
        .map(|_| assert_ok!(tags.try_acquire(&hog, AcquireFlags::empty())))
        .collect();
    assert_eq!(tags.fair_share(), 16);

    let waiter = {
        let (tags, starved) = (tags.clone(), starved.clone());
        thread::spawn(move || tags.acquire(&starved, AcquireFlags::empty()))
    };
    while !(tags.waiters() == 1 && starved.is_active()) {
        thread::yield_now();
    }
    // The parked sharer counts, halving the hog's share.
    assert_eq!(tags.active_queues(), 2);
    assert_eq!(tags.fair_share(), expected_share(16, 2));

    let freed = hog_tags.pop().unwrap();
    tags.release(&hog, freed);
    assert_eq!(
        tags.try_acquire(&hog, AcquireFlags::empty()),
        Err(TagError::Exhausted)
    );
    let first = assert_ok!(waiter.join().unwrap());
    assert_eq!(first, freed);

    // Hog backs off to its share; the starved sharer fills the rest.
    while hog_tags.len() > expected_share(16, 2) {
        let tag = hog_tags.pop().unwrap();
        tags.release(&hog, tag);
    }
    let mut starved_tags = vec![first];
    while let Ok(tag) = tags.try_acquire(&starved, AcquireFlags::empty()) {
        starved_tags.push(tag);
    }
    assert_eq!(hog.nr_active(), 8);
    assert_eq!(starved.nr_active(), 8);
    assert_eq!(starved_tags.len(), 8);
    assert_eq!(
        tags.try_acquire(&hog, AcquireFlags::empty()),
        Err(TagError::Exhausted)
    );
    assert_eq!(tags.busy_count(), 16);
}

#[test]
fn every_sharer_reaches_its_share_under_contention() {
    init_test_logger();
    const DEPTH: usize = 32;
    const SHARERS: usize = 4;
    let share = expected_share(DEPTH, SHARERS);
    let tags = Arc::new(assert_ok!(TagAllocator::new(DEPTH, 0)));
    tags.set_shared(true);
    let start = Arc::new(Barrier::new(SHARERS));
    let peak: Arc<Vec<AtomicUsize>> =
        Arc::new((0..SHARERS).map(|_| AtomicUsize::new(0)).collect());

    let workers: Vec<_> = (0..SHARERS)
        .map(|index| {
            let (tags, start, peak) = (tags.clone(), start.clone(), peak.clone());
            thread::spawn(move || {
                let sharer = TagSharer::new(index);
                let mut rng = StdRng::seed_from_u64(index as u64 + 31);
                let mut mine: Vec<Tag> = Vec::new();
                start.wait();
                for _ in 0..400 {
                    if mine.len() == share {
                        let tag = mine.remove(rng.gen_range(0..mine.len()));
                        tags.release(&sharer, tag);
                    }
                    mine.push(assert_ok!(tags.acquire(&sharer, AcquireFlags::empty())));
                    assert_eq!(sharer.nr_active(), mine.len());
                    peak[index].fetch_max(mine.len(), Ordering::SeqCst);
                    if rng.gen_bool(0.3) {
                        thread::yield_now();
                    }
                }
                for tag in mine {
                    tags.release(&sharer, tag);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    for (index, peak) in peak.iter().enumerate() {
        assert_eq!(
            peak.load(Ordering::SeqCst),
            share,
            "sharer {} never reached its share",
            index
        );
    }
    assert_eq!(tags.busy_count(), 0);
    assert_eq!(tags.active_queues(), 0);
}

#[test]
fn concurrent_nowait_acquires_split_a_small_pool() {
    init_test_logger();
    for _ in 0..50 {
        let tags = Arc::new(assert_ok!(TagAllocator::new(4, 1)));
        let start = Arc::new(Barrier::new(4));
        let workers: Vec<_> = (0..4usize)
            .map(|index| {
                let (tags, start) = (tags.clone(), start.clone());
                thread::spawn(move || {
                    let sharer = TagSharer::new(index);
                    start.wait();
                    tags.acquire(&sharer, AcquireFlags::NOWAIT)
                })
            })
            .collect();
        let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        let granted: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(granted.len(), 3);
        assert!(granted.iter().all(|tag| tag.id() >= 1));
        assert_eq!(
            results.iter().filter(|r| **r == Err(TagError::Exhausted)).count(),
            1
        );

        let reserved = assert_ok!(tags.try_acquire(&TagSharer::new(9), AcquireFlags::RESERVED));
        assert_eq!(reserved.id(), 0);
        assert_eq!(tags.busy_count(), 4);
    }
}
