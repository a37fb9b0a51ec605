use std::sync::Arc;
use std::thread;

use iosched::block::bio::Bio;
use iosched::block::request::RqFlags;
use iosched::block::tag_set::{TagSet, TagSetConfig};
use iosched::mq::config::QueueConfig;
use iosched::mq::cpu::PinnedCpuLocator;
use iosched::mq::queue::{Admission, RequestQueue};

use crate::common::harness::{RecordingDriver, build_queue};
use crate::common::logger::init_test_logger;

fn plain_config() -> QueueConfig {
    QueueConfig::new(1, 16).with_nr_cpus(1)
}

#[test]
fn rejected_requests_retry_after_completion() {
    init_test_logger();
    let driver = RecordingDriver::with_capacity(1);
    let (queue, _clock) = build_queue(plain_config(), &driver);

    let subs: Vec<_> = [0u64, 100, 200]
        .iter()
        .map(|&sector| assert_ok!(queue.submit_bio(Bio::read(sector, 8))))
        .collect();
    assert_eq!(driver.in_flight(), 1);
    let hctx = assert_ok!(queue.hw_queue(0));
    assert!(hctx.needs_restart());
    assert!(hctx.is_dispatch_busy());
    assert_eq!(hctx.residual_len(), 1);

    assert_eq!(driver.complete_all(&queue, Ok(())), 3);
    assert_eq!(driver.dispatched_sectors(), vec![0, 100, 200]);
    for sub in subs {
        assert_eq!(sub.completion.blocking_recv(), Ok(Ok(())));
    }

    let stats = assert_ok!(queue.hw_queue_stats(0));
    assert_eq!(stats.dispatched, 3);
    assert!(stats.rejected >= 2);
    assert!(stats.restarts >= 2);
    assert_eq!(stats.completed, 3);
    assert_eq!(hctx.tags().busy_count(), 0);
}

#[test]
fn budget_limits_requests_in_flight() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let (queue, _clock) = build_queue(plain_config().with_budget_depth(2), &driver);

    for i in 0..5u64 {
        assert_ok!(queue.submit_bio(Bio::write(i * 64, 8)));
    }
    assert_eq!(driver.in_flight(), 2);
    assert_eq!(driver.complete_all(&queue, Ok(())), 5);
    assert_eq!(driver.dispatched().len(), 5);
}

#[test]
fn requeued_request_is_dispatched_again() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let (queue, _clock) = build_queue(plain_config(), &driver);

    let sub = assert_ok!(queue.submit_bio(Bio::read(64, 8)));
    let mut in_flight = driver.take_in_flight();
    assert_eq!(in_flight.len(), 1);
    queue.requeue_request(in_flight.remove(0));

    let dispatched = driver.dispatched();
    assert_eq!(dispatched.len(), 2);
    assert_eq!(dispatched[0].id, dispatched[1].id);

    let again = driver.take_in_flight();
    assert!(again[0].flags().contains(RqFlags::REQUEUED));
    assert!(again[0].is_started());
    for rq in again {
        queue.end_request(rq, Ok(()));
    }
    assert_eq!(sub.completion.blocking_recv(), Ok(Ok(())));
    assert_eq!(assert_ok!(queue.hw_queue_stats(0)).requeued, 1);
}

#[test]
fn stopped_and_quiesced_queues_hold_requests() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let (queue, _clock) = build_queue(plain_config(), &driver);

    assert_ok!(queue.stop_hw_queue(0));
    assert_ok!(queue.submit_bio(Bio::read(0, 8)));
    assert!(assert_ok!(queue.hw_queue(0)).is_stopped());
    assert_eq!(driver.dispatched().len(), 0);
    assert_ok!(queue.start_hw_queue(0));
    assert_eq!(driver.dispatched().len(), 1);

    queue.quiesce();
    assert!(queue.is_quiesced());
    assert_ok!(queue.submit_bio(Bio::read(800, 8)));
    assert_eq!(driver.dispatched().len(), 1);
    queue.unquiesce();
    assert_eq!(driver.dispatched().len(), 2);
    assert_eq!(driver.complete_all(&queue, Ok(())), 2);
}

#[test]
fn plug_merges_and_submits_in_one_call() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let (queue, _clock) = build_queue(plain_config(), &driver);

    let mut plug = queue.plug();
    let first = assert_ok!(plug.submit_bio(Bio::write(0, 8)));
    let second = assert_ok!(plug.submit_bio(Bio::write(8, 8)));
    let third = assert_ok!(plug.submit_bio(Bio::write(100, 8)));
    assert_eq!(second.admission, Admission::Merged(first.admission.request_id()));
    assert!(!third.admission.is_merged());
    assert_eq!(plug.len(), 2);
    assert_eq!(driver.dispatched().len(), 0);

    plug.finish();
    assert_eq!(driver.submit_calls(), 1);
    let dispatched = driver.dispatched();
    assert_eq!(dispatched.len(), 2);
    assert_eq!((dispatched[0].sector, dispatched[0].nr_sectors), (0, 16));

    assert_eq!(driver.complete_all(&queue, Ok(())), 2);
    for sub in [first, second, third] {
        assert_eq!(sub.completion.blocking_recv(), Ok(Ok(())));
    }
}

#[test]
fn software_queue_merges_recent_requests() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let (queue, _clock) = build_queue(plain_config(), &driver);
    assert_ok!(queue.stop_hw_queue(0));

    let first = assert_ok!(queue.submit_bio(Bio::read(1000, 8)));
    let front = assert_ok!(queue.submit_bio(Bio::read(992, 8)));
    assert_eq!(front.admission, Admission::Merged(first.admission.request_id()));

    assert_ok!(queue.set_attribute("nomerges", "2"));
    let apart = assert_ok!(queue.submit_bio(Bio::read(1008, 8)));
    assert!(!apart.admission.is_merged());

    assert_ok!(queue.start_hw_queue(0));
    assert_eq!(driver.dispatched_sectors(), vec![992, 1008]);
    assert_eq!(driver.complete_all(&queue, Ok(())), 2);
}

#[test]
fn busy_queue_takes_one_request_per_software_queue() {
    init_test_logger();
    let driver = RecordingDriver::with_capacity(1);
    let locator = Arc::new(PinnedCpuLocator::new(0));
    let queue = assert_ok!(
        RequestQueue::builder(QueueConfig::new(1, 16).with_nr_cpus(2))
            .shared_submitter(driver.clone())
            .cpu_locator(locator.clone())
            .build()
    );

    assert_ok!(queue.submit_bio(Bio::read(0, 8)));
    assert_ok!(queue.submit_bio(Bio::read(100, 8)));
    assert_ok!(queue.submit_bio(Bio::read(200, 8)));
    assert_ok!(queue.submit_bio(Bio::read(250, 8)));
    locator.migrate(1);
    assert_ok!(queue.submit_bio(Bio::read(300, 8)));
    assert!(assert_ok!(queue.hw_queue(0)).is_dispatch_busy());

    assert_eq!(driver.complete_all(&queue, Ok(())), 5);
    assert_eq!(driver.dispatched_sectors(), vec![0, 100, 200, 300, 250]);
}

#[test]
fn flush_without_scheduler_goes_straight_to_dispatch() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let (queue, _clock) = build_queue(plain_config(), &driver);
    assert_ok!(queue.stop_hw_queue(0));

    assert_ok!(queue.submit_bio(Bio::write(0, 8)));
    assert_ok!(queue.submit_bio(
        Bio::write(64, 8).with_flags(iosched::block::bio::BioFlags::FUA)
    ));
    assert_eq!(assert_ok!(queue.hw_queue(0)).residual_len(), 1);

    assert_ok!(queue.start_hw_queue(0));
    assert_eq!(driver.dispatched_sectors(), vec![64, 0]);
    assert_eq!(driver.complete_all(&queue, Ok(())), 2);
}

#[test]
fn completion_on_one_queue_restarts_a_peer() {
    init_test_logger();
    let set = assert_ok!(TagSet::new(TagSetConfig::new(1, 8)));
    let driver_a = RecordingDriver::with_capacity(0);
    let driver_b = RecordingDriver::new();
    let build = |driver: &Arc<RecordingDriver>| {
        RequestQueue::builder(QueueConfig::new(1, 8).with_nr_cpus(1))
            .shared_submitter(driver.clone())
            .cpu_locator(Arc::new(PinnedCpuLocator::new(0)))
            .tag_set(set.clone())
            .build()
    };
    let queue_a = assert_ok!(build(&driver_a));
    let queue_b = assert_ok!(build(&driver_b));
    assert!(set.is_shared());
    assert!(set.tags(0).is_shared());

    let stuck = assert_ok!(queue_a.submit_bio(Bio::read(0, 8)));
    assert!(assert_ok!(queue_a.hw_queue(0)).needs_restart());
    driver_a.set_capacity(8);

    assert_ok!(queue_b.submit_bio(Bio::read(512, 8)));
    assert_eq!(driver_a.dispatched().len(), 0);
    assert_eq!(driver_b.complete_all(&queue_b, Ok(())), 1);

    assert_eq!(driver_a.dispatched_sectors(), vec![0]);
    assert!(assert_ok!(queue_a.hw_queue_stats(0)).restarts >= 1);
    assert_eq!(driver_a.complete_all(&queue_a, Ok(())), 1);
    assert_eq!(stuck.completion.blocking_recv(), Ok(Ok(())));

    drop(queue_b);
    assert!(!set.is_shared());
    assert_eq!(set.nr_members(), 1);
}

#[test]
fn blocked_admission_rebinds_after_migrating() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let locator = Arc::new(PinnedCpuLocator::new(0));
    let queue = assert_ok!(
        RequestQueue::builder(QueueConfig::new(2, 1).with_nr_cpus(2))
            .shared_submitter(driver.clone())
            .cpu_locator(locator.clone())
            .build()
    );

    assert_ok!(queue.submit_bio(Bio::read(0, 8)));
    assert_eq!(queue.map_cpu(0), 0);
    assert_eq!(queue.map_cpu(1), 1);

    thread::scope(|scope| {
        let waiter = scope.spawn(|| queue.submit_bio(Bio::read(4096, 8)));
        let hw0 = assert_ok!(queue.hw_queue(0));
        while hw0.tags().waiters() == 0 {
            thread::yield_now();
        }
        locator.migrate(1);
        assert!(driver.complete_one(&queue, Ok(())));

        let sub = assert_ok!(waiter.join().unwrap());
        assert!(!sub.admission.is_merged());
    });

    let dispatched = driver.dispatched();
    assert_eq!(dispatched.len(), 2);
    assert_eq!((dispatched[1].hw, dispatched[1].sector), (1, 4096));
    assert_eq!(driver.complete_all(&queue, Ok(())), 1);
}
