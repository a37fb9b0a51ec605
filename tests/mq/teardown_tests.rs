use std::thread;

use iosched::block::bio::Bio;
use iosched::common::exception::{BlkError, QueueError};
use iosched::elevator::ElevatorKind;
use iosched::mq::config::QueueConfig;

use crate::common::harness::{RecordingDriver, build_queue};
use crate::common::logger::init_test_logger;

#[test]
fn cleanup_fails_everything_the_driver_has_not_accepted() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let config = QueueConfig::new(1, 16)
        .with_nr_cpus(1)
        .with_elevator(ElevatorKind::deadline());
    let (queue, _clock) = build_queue(config, &driver);

    let accepted = assert_ok!(queue.submit_bio(Bio::read(0, 8)));
    assert_ok!(queue.stop_hw_queue(0));
    let sorted = assert_ok!(queue.submit_bio(Bio::read(512, 8)));
    let bypass = assert_ok!(queue.submit_bio(Bio::write(0, 1).with_flags(
        iosched::block::bio::BioFlags::FLUSH
    )));

    assert_eq!(queue.cleanup(), 2);
    assert!(queue.is_dying());
    assert_eq!(sorted.completion.blocking_recv(), Ok(Err(BlkError::Io)));
    assert_eq!(bypass.completion.blocking_recv(), Ok(Err(BlkError::Io)));

    // The driver still owns the first request and finishes it normally.
    assert_eq!(driver.complete_all(&queue, Ok(())), 1);
    assert_eq!(accepted.completion.blocking_recv(), Ok(Ok(())));
    assert_eq!(assert_ok!(queue.hw_queue(0)).tags().busy_count(), 0);

    assert!(matches!(queue.submit_bio(Bio::read(4096, 8)), Err(QueueError::Dead)));
}

#[test]
fn cleanup_wakes_blocked_submitters() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let (queue, _clock) = build_queue(QueueConfig::new(1, 1).with_nr_cpus(1), &driver);
    assert_ok!(queue.submit_bio(Bio::read(0, 8)));

    thread::scope(|scope| {
        let waiter = scope.spawn(|| queue.submit_bio(Bio::read(2048, 8)));
        let hctx = assert_ok!(queue.hw_queue(0));
        while hctx.tags().waiters() == 0 {
            thread::yield_now();
        }
        assert_eq!(queue.cleanup(), 0);
        assert!(matches!(waiter.join().unwrap(), Err(QueueError::Dead)));
    });
    assert_eq!(driver.complete_all(&queue, Ok(())), 1);
}

#[test]
fn plugged_requests_fail_when_queue_dies() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let (queue, _clock) = build_queue(QueueConfig::new(1, 8).with_nr_cpus(1), &driver);

    let mut plug = queue.plug();
    let held = assert_ok!(plug.submit_bio(Bio::write(0, 8)));
    assert_eq!(queue.cleanup(), 0);
    assert_err!(plug.submit_bio(Bio::write(64, 8)));
    plug.finish();

    assert_eq!(held.completion.blocking_recv(), Ok(Err(BlkError::Io)));
    assert_eq!(driver.dispatched().len(), 0);
    assert_eq!(assert_ok!(queue.hw_queue(0)).tags().busy_count(), 0);
}

#[test]
fn requeue_after_teardown_aborts() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let (queue, _clock) = build_queue(QueueConfig::new(1, 8).with_nr_cpus(1), &driver);

    let sub = assert_ok!(queue.submit_bio(Bio::read(0, 8)));
    let in_flight = driver.take_in_flight();
    queue.cleanup();
    for rq in in_flight {
        queue.requeue_request(rq);
    }
    assert_eq!(sub.completion.blocking_recv(), Ok(Err(BlkError::Io)));
    assert_eq!(assert_ok!(queue.hw_queue(0)).residual_len(), 0);
}

#[test]
fn dropping_the_queue_aborts_pending_requests() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let (queue, _clock) = build_queue(QueueConfig::new(2, 8).with_nr_cpus(2), &driver);
    queue.stop_hw_queues();

    let pending = assert_ok!(queue.submit_bio(Bio::read(0, 8)));
    drop(queue);
    assert_eq!(pending.completion.blocking_recv(), Ok(Err(BlkError::Io)));
}
