use crate::block::request::Request;

/// What the driver did with a submitted batch.
#[derive(Debug, Default)]
pub struct SubmitOutcome {
    /// Requests the driver could not take, in submission order. They stay
    /// queued and are retried once the hardware queue restarts.
    pub rejected: Vec<Request>,
}

impl SubmitOutcome {
    pub fn accepted() -> Self {
        Self::default()
    }

    pub fn rejecting(rejected: Vec<Request>) -> Self {
        Self { rejected }
    }
}

/// The driver's submission primitive.
///
/// Called without any queue lock held. Accepted requests are owned by the
/// driver until it hands them back through `RequestQueue::end_request` or
/// `RequestQueue::requeue_request`, which may happen from inside this call.
pub trait Submitter: Send + Sync {
    fn submit(&self, hw_queue: usize, batch: Vec<Request>) -> SubmitOutcome;
}

impl<F> Submitter for F
where
    F: Fn(usize, Vec<Request>) -> SubmitOutcome + Send + Sync,
{
    fn submit(&self, hw_queue: usize, batch: Vec<Request>) -> SubmitOutcome {
        self(hw_queue, batch)
    }
}
