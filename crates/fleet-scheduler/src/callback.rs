//! Result delivery for scheduling requests.

use fleet_core::PlacementResult;
use tokio::sync::oneshot;

use crate::error::SchedulingError;

pub type SchedulingOutcome = Result<PlacementResult, SchedulingError>;

/// Receives the single outcome of a scheduling request.
///
/// Called on the scheduler worker; implementations must not block.
pub trait SchedulingCallback: Send + 'static {
    fn handle(self: Box<Self>, outcome: SchedulingOutcome);
}

impl SchedulingCallback for oneshot::Sender<SchedulingOutcome> {
    fn handle(self: Box<Self>, outcome: SchedulingOutcome) {
        // The requester may have stopped waiting.
        let _ = (*self).send(outcome);
    }
}

/// Adapts a closure into a [`SchedulingCallback`].
pub struct FnCallback<F>(pub F);

impl<F> SchedulingCallback for FnCallback<F>
where
    F: FnOnce(SchedulingOutcome) + Send + 'static,
{
    fn handle(self: Box<Self>, outcome: SchedulingOutcome) {
        (self.0)(outcome)
    }
}

pub fn callback_fn<F>(f: F) -> FnCallback<F>
where
    F: FnOnce(SchedulingOutcome) + Send + 'static,
{
    FnCallback(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn oneshot_sender_delivers() {
        let (tx, rx) = oneshot::channel();
        Box::new(tx).handle(Err(SchedulingError::CapacityExhausted));
        assert_eq!(rx.await.unwrap(), Err(SchedulingError::CapacityExhausted));
    }

    #[test]
    fn dropped_receiver_is_ignored() {
        let (tx, rx) = oneshot::channel::<SchedulingOutcome>();
        drop(rx);
        Box::new(tx).handle(Err(SchedulingError::ShuttingDown));
    }

    #[test]
    fn closure_callback_runs_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: Box<dyn SchedulingCallback> = Box::new(callback_fn(move |outcome| {
            sink.lock().unwrap().push(outcome);
        }));
        cb.handle(Err(SchedulingError::ShuttingDown));
        assert_eq!(*seen.lock().unwrap(), vec![Err(SchedulingError::ShuttingDown)]);
    }
}
