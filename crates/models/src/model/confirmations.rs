use std::time::Duration;

use models_sync_types::{
    ConfirmedEvent,
    Event,
    EventComparator,
};
use tokio::{
    sync::oneshot,
    time::Instant,
};

use crate::errors::ModelError;

/// Why a pending confirmation settled unsuccessfully.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RollbackReason {
    Timeout(Duration),
    Rejected,
    Cancelled,
    Disposed,
    SyncInterrupted,
}

impl RollbackReason {
    pub fn to_error(self) -> ModelError {
        match self {
            RollbackReason::Timeout(timeout) => ModelError::ConfirmationTimeout { timeout },
            RollbackReason::Rejected => ModelError::Rejected,
            RollbackReason::Cancelled => ModelError::Cancelled,
            RollbackReason::Disposed => ModelError::Disposed,
            RollbackReason::SyncInterrupted => ModelError::SyncInterrupted,
        }
    }
}

/// Bookkeeping for one in-flight optimistic batch.
///
/// - Starts with every event of the batch unconfirmed.
/// - Confirmed events drain it one match at a time; fully drained settles it.
/// - A rejection observed while draining marks the whole batch rejected.
/// - The deadline rolls back whatever is still unconfirmed.
struct PendingConfirmation {
    unconfirmed: Vec<Event>,
    deadline: Instant,
    timeout: Duration,
    rejected: bool,
    completion: Option<oneshot::Sender<Result<(), ModelError>>>,
}

impl PendingConfirmation {
    fn settle(&mut self, result: Result<(), ModelError>) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(result);
        }
    }

    fn is_done(&self) -> bool {
        self.completion.is_none()
    }
}

/// The ordered set of outstanding optimistic batches.
pub(crate) struct ConfirmationsRegistry {
    comparator: EventComparator,
    pending: Vec<PendingConfirmation>,
}

impl ConfirmationsRegistry {
    pub fn new(comparator: EventComparator) -> Self {
        Self {
            comparator,
            pending: Vec::new(),
        }
    }

    /// Registers a batch; the returned receiver settles per the batch
    /// lifecycle.
    pub fn add(
        &mut self,
        events: Vec<Event>,
        timeout: Duration,
        now: Instant,
    ) -> oneshot::Receiver<Result<(), ModelError>> {
        let (completion, receiver) = oneshot::channel();
        self.pending.push(PendingConfirmation {
            unconfirmed: events,
            deadline: now + timeout,
            timeout,
            rejected: false,
            completion: Some(completion),
        });
        receiver
    }

    /// Drains events matched by this confirmed event and settles batches
    /// that reach zero unconfirmed events.
    pub fn confirm(&mut self, confirmed: &ConfirmedEvent) {
        let comparator = self.comparator.clone();
        for pending in &mut self.pending {
            let before = pending.unconfirmed.len();
            pending
                .unconfirmed
                .retain(|event| !comparator(event, &confirmed.event));
            if pending.unconfirmed.len() < before && confirmed.rejected {
                pending.rejected = true;
            }
            if pending.unconfirmed.is_empty() {
                let result = if pending.rejected {
                    Err(RollbackReason::Rejected.to_error())
                } else {
                    Ok(())
                };
                pending.settle(result);
            }
        }
        self.prune();
    }

    /// Rejects every batch containing any of the given events.
    pub fn reject(&mut self, reason: RollbackReason, events: &[Event]) {
        let comparator = self.comparator.clone();
        for pending in &mut self.pending {
            let affected = pending
                .unconfirmed
                .iter()
                .any(|event| events.iter().any(|rolled| comparator(event, rolled)));
            if affected {
                pending.settle(Err(reason.to_error()));
            }
        }
        self.prune();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|pending| pending.deadline).min()
    }

    /// Settles every batch whose deadline has elapsed and returns their
    /// still-unconfirmed events for rollback.
    pub fn expire(&mut self, now: Instant) -> Vec<Event> {
        let mut expired = Vec::new();
        for pending in &mut self.pending {
            if pending.deadline <= now {
                pending.settle(Err(RollbackReason::Timeout(pending.timeout).to_error()));
                expired.append(&mut pending.unconfirmed);
            }
        }
        self.prune();
        expired
    }

    /// Settles everything outstanding with the given reason.
    pub fn finalize(&mut self, reason: RollbackReason) {
        for pending in &mut self.pending {
            pending.settle(Err(reason.to_error()));
        }
        self.pending.clear();
    }

    fn prune(&mut self) {
        self.pending.retain(|pending| !pending.is_done());
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use models_sync_types::{
        mutation_id_equality,
        SequenceId,
    };
    use pretty_assertions::assert_eq;

    use super::*;

    fn registry() -> ConfirmationsRegistry {
        ConfirmationsRegistry::new(Arc::new(mutation_id_equality))
    }

    fn optimistic(mutation_id: &str) -> Event {
        Event::new("update").with_mutation_id(mutation_id)
    }

    fn confirmed(mutation_id: &str, rejected: bool) -> ConfirmedEvent {
        ConfirmedEvent {
            event: optimistic(mutation_id),
            sequence_id: SequenceId::from("1"),
            rejected,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_confirmation_settles_drained_batch() {
        let mut registry = registry();
        let now = Instant::now();
        let mut receiver = registry.add(vec![optimistic("m1")], TIMEOUT, now);

        registry.confirm(&confirmed("m2", false));
        assert!(receiver.try_recv().is_err());
        assert_eq!(registry.len(), 1);

        registry.confirm(&confirmed("m1", false));
        assert!(receiver.await.unwrap().is_ok());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_partial_batch_waits_for_every_event() {
        let mut registry = registry();
        let now = Instant::now();
        let mut receiver =
            registry.add(vec![optimistic("m1"), optimistic("m2")], TIMEOUT, now);

        registry.confirm(&confirmed("m1", false));
        assert!(receiver.try_recv().is_err());

        registry.confirm(&confirmed("m2", false));
        assert!(receiver.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_rejection_marks_batch_until_drained() {
        let mut registry = registry();
        let now = Instant::now();
        let receiver =
            registry.add(vec![optimistic("m1"), optimistic("m2")], TIMEOUT, now);

        registry.confirm(&confirmed("m1", true));
        registry.confirm(&confirmed("m2", false));
        let err = receiver.await.unwrap().unwrap_err();
        assert!(matches!(err, ModelError::Rejected), "{err}");
    }

    #[tokio::test]
    async fn test_expire_returns_unconfirmed_events() {
        let mut registry = registry();
        let now = Instant::now();
        let receiver =
            registry.add(vec![optimistic("m1"), optimistic("m2")], TIMEOUT, now);
        registry.confirm(&confirmed("m1", false));

        assert_eq!(registry.expire(now), vec![]);
        let rolled_back = registry.expire(now + TIMEOUT);
        assert_eq!(rolled_back, vec![optimistic("m2")]);

        let err = receiver.await.unwrap().unwrap_err();
        assert!(matches!(err, ModelError::ConfirmationTimeout { .. }), "{err}");
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_reject_settles_containing_batch() {
        let mut registry = registry();
        let now = Instant::now();
        let receiver = registry.add(vec![optimistic("m1")], TIMEOUT, now);

        registry.reject(RollbackReason::Cancelled, &[optimistic("m1")]);
        let err = receiver.await.unwrap().unwrap_err();
        assert!(matches!(err, ModelError::Cancelled), "{err}");
    }

    #[tokio::test]
    async fn test_finalize_rejects_everything() {
        let mut registry = registry();
        let now = Instant::now();
        let first = registry.add(vec![optimistic("m1")], TIMEOUT, now);
        let second = registry.add(vec![optimistic("m2")], TIMEOUT, now);

        registry.finalize(RollbackReason::Disposed);
        assert!(matches!(
            first.await.unwrap().unwrap_err(),
            ModelError::Disposed
        ));
        assert!(matches!(
            second.await.unwrap().unwrap_err(),
            ModelError::Disposed
        ));
    }
}
