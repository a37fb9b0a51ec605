use iosched::block::bio::{Bio, BioFlags};
use iosched::common::exception::{QueueError, TagError};
use iosched::elevator::ElevatorKind;
use iosched::mq::config::QueueConfig;
use iosched::mq::queue::Admission;

use crate::common::harness::{RecordingDriver, build_queue};
use crate::common::logger::init_test_logger;

fn plain_config() -> QueueConfig {
    QueueConfig::new(1, 16).with_nr_cpus(1)
}

#[test]
fn reserved_admission_without_reserved_tags_fails() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let (queue, _clock) = build_queue(plain_config(), &driver);

    let err = assert_err!(queue.submit_bio(Bio::read(0, 8).reserved()));
    assert_eq!(err, QueueError::Tag(TagError::NoReservedPool));

    let mut plug = queue.plug();
    let err = assert_err!(plug.submit_bio(Bio::read(64, 8).reserved()));
    assert_eq!(err, QueueError::Tag(TagError::NoReservedPool));
    assert!(plug.is_empty());
    plug.finish();

    assert_eq!(assert_ok!(queue.hw_queue(0)).tags().waiters(), 0);
    assert_eq!(driver.submit_calls(), 0);

    // Ordinary admissions are unaffected.
    assert_ok!(queue.submit_bio(Bio::read(128, 8)));
    assert_eq!(driver.complete_all(&queue, Ok(())), 1);
}

#[test]
fn reserved_admission_uses_the_reserved_pool() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let (queue, _clock) = build_queue(plain_config().with_reserved_tags(1), &driver);

    let sub = assert_ok!(queue.submit_bio(Bio::write(0, 8).reserved()));
    assert!(matches!(sub.admission, Admission::Queued(_)));
    assert_eq!(driver.dispatched_sectors(), vec![0]);
    assert_eq!(driver.complete_all(&queue, Ok(())), 1);
    assert_eq!(sub.completion.blocking_recv(), Ok(Ok(())));
}

#[test]
fn empty_flush_is_dispatched() {
    init_test_logger();
    for elevator in [ElevatorKind::None, ElevatorKind::deadline()] {
        let driver = RecordingDriver::new();
        let (queue, _clock) = build_queue(plain_config().with_elevator(elevator), &driver);

        let sub = assert_ok!(queue.submit_bio(Bio::write(0, 0).with_flags(BioFlags::FLUSH)));
        assert!(matches!(sub.admission, Admission::Queued(_)));

        let dispatched = driver.dispatched();
        assert_eq!(dispatched.len(), 1);
        assert_eq!((dispatched[0].sector, dispatched[0].nr_sectors), (0, 0));
        assert_eq!(driver.complete_all(&queue, Ok(())), 1);
        assert_eq!(sub.completion.blocking_recv(), Ok(Ok(())));
    }
}

#[test]
fn unindexable_ranges_are_rejected_at_admission() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let (queue, _clock) = build_queue(plain_config(), &driver);

    let err = assert_err!(queue.submit_bio(Bio::write(8, 0)));
    assert!(matches!(err, QueueError::InvalidBio { sector: 8, nr_sectors: 0, .. }));

    let err = assert_err!(queue.submit_bio(Bio::read(u64::MAX - 4, 8)));
    assert!(matches!(err, QueueError::InvalidBio { nr_sectors: 8, .. }));

    let mut plug = queue.plug();
    assert_err!(plug.submit_bio(Bio::read(u64::MAX, 1)));
    plug.finish();

    assert_eq!(driver.submit_calls(), 0);
    assert_ok!(queue.submit_bio(Bio::read(u64::MAX - 8, 8)));
    assert_eq!(driver.dispatched_sectors(), vec![u64::MAX - 8]);
    assert_eq!(driver.complete_all(&queue, Ok(())), 1);
}

#[test]
fn soft_barrier_bypasses_sorting() {
    init_test_logger();
    let driver = RecordingDriver::new();
    let config = plain_config().with_elevator(ElevatorKind::deadline());
    let (queue, _clock) = build_queue(config, &driver);
    assert_ok!(queue.stop_hw_queue(0));

    assert_ok!(queue.submit_bio(Bio::read(100, 8)));
    assert_ok!(queue.submit_bio(Bio::read(200, 8)));
    let barrier_bio = Bio::read(108, 8).with_flags(BioFlags::SOFTBARRIER);
    let barrier = assert_ok!(queue.submit_bio(barrier_bio));
    assert!(matches!(barrier.admission, Admission::Queued(_)));

    assert_ok!(queue.start_hw_queue(0));
    assert_eq!(driver.dispatched_sectors(), vec![108, 100, 200]);
    assert_eq!(driver.complete_all(&queue, Ok(())), 3);
}
