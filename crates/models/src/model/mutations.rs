use std::{
    future::Future,
    pin::Pin,
    sync::atomic::{
        AtomicBool,
        Ordering,
    },
    task::{
        Context,
        Poll,
    },
    time::Duration,
};

use models_sync_types::Event;
use tokio::sync::{
    mpsc,
    oneshot,
};
use uuid::Uuid;

use crate::{
    errors::ModelError,
    model::{
        confirmations::RollbackReason,
        worker::ModelRequest,
    },
    options::{
        OptimisticEventOptions,
        OptimisticOverrides,
    },
};

/// Settles when the server confirms (or rejects, times out, cancels) the
/// optimistic batch.
#[derive(Debug)]
pub struct Confirmation {
    pub(crate) receiver: oneshot::Receiver<Result<(), ModelError>>,
}

impl Future for Confirmation {
    type Output = Result<(), ModelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ModelError::Disposed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RollbackRequest {
    pub events: Vec<Event>,
    pub reason: RollbackReason,
}

/// Cancels an in-flight optimistic batch, rolling back its events.
///
/// `cancel` enqueues the rollback synchronously and is idempotent; the
/// confirmation future settles with [`ModelError::Cancelled`].
#[derive(Debug)]
pub struct CancelHandle {
    events: Vec<Event>,
    rollbacks: mpsc::UnboundedSender<RollbackRequest>,
    fired: AtomicBool,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.rollbacks.send(RollbackRequest {
            events: self.events.clone(),
            reason: RollbackReason::Cancelled,
        });
    }
}

/// The optimistic submission surface: layers options, hands the event to the
/// model worker, and wires up cancellation.
#[derive(Debug)]
pub(crate) struct MutationsRegistry<T> {
    defaults: OptimisticEventOptions,
    requests: mpsc::UnboundedSender<ModelRequest<T>>,
    rollbacks: mpsc::UnboundedSender<RollbackRequest>,
}

impl<T> Clone for MutationsRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            defaults: self.defaults.clone(),
            requests: self.requests.clone(),
            rollbacks: self.rollbacks.clone(),
        }
    }
}

impl<T> MutationsRegistry<T> {
    pub fn new(
        defaults: OptimisticEventOptions,
        requests: mpsc::UnboundedSender<ModelRequest<T>>,
        rollbacks: mpsc::UnboundedSender<RollbackRequest>,
    ) -> Self {
        Self {
            defaults,
            requests,
            rollbacks,
        }
    }

    pub async fn handle_optimistic(
        &self,
        mut event: Event,
        overrides: OptimisticOverrides,
    ) -> Result<(Confirmation, CancelHandle), ModelError> {
        if event.name.is_empty() {
            return Err(ModelError::InvalidArgument(
                "event name must not be empty".to_string(),
            ));
        }
        if event.mutation_id.is_none() {
            event.mutation_id = Some(Uuid::new_v4().to_string());
        }
        let timeout = self.effective_timeout(&overrides);

        let (ack, ack_receiver) = oneshot::channel();
        self.requests
            .send(ModelRequest::Optimistic {
                event: event.clone(),
                timeout,
                ack,
            })
            .map_err(|_| ModelError::Disposed)?;

        // If the optimistic application itself failed, there is nothing to
        // confirm and nothing to roll back.
        let receiver = ack_receiver.await.map_err(|_| ModelError::Disposed)??;

        Ok((
            Confirmation { receiver },
            CancelHandle {
                events: vec![event],
                rollbacks: self.rollbacks.clone(),
                fired: AtomicBool::new(false),
            },
        ))
    }

    fn effective_timeout(&self, overrides: &OptimisticOverrides) -> Duration {
        overrides.timeout.unwrap_or(self.defaults.timeout)
    }
}
