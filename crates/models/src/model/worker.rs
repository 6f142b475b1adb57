use std::{
    sync::Arc,
    time::Duration,
};

use models_sync_types::{
    ConfirmedEvent,
    Event,
    EventComparator,
    MergeEvent,
};
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use tokio::{
    sync::{
        broadcast,
        mpsc,
        oneshot,
        watch,
    },
    time::Instant,
};

use crate::{
    errors::ModelError,
    model::{
        confirmations::{
            ConfirmationsRegistry,
            RollbackReason,
        },
        mutations::RollbackRequest,
        Merge,
        ModelData,
        ModelState,
        SubscriptionKind,
        SyncFunction,
    },
    options::SyncOptions,
    stream::{
        Stream,
        StreamEvent,
        StreamState,
        StreamSubscription,
    },
    transport::Transport,
};

pub(crate) enum ModelRequest<T> {
    Sync {
        args: JsonValue,
        ack: oneshot::Sender<Result<(), ModelError>>,
    },
    Optimistic {
        event: Event,
        timeout: Duration,
        ack: oneshot::Sender<Result<oneshot::Receiver<Result<(), ModelError>>, ModelError>>,
    },
    Subscribe {
        kind: SubscriptionKind,
        ack: oneshot::Sender<SubscriptionSeed<T>>,
    },
    Pause {
        ack: oneshot::Sender<Result<(), ModelError>>,
    },
    Resume {
        ack: oneshot::Sender<Result<(), ModelError>>,
    },
    Dispose {
        ack: oneshot::Sender<()>,
    },
}

/// Handed back on subscribe: the broadcast receiver plus the current value so
/// new subscribers start from the present state.
pub(crate) struct SubscriptionSeed<T> {
    pub receiver: broadcast::Receiver<Result<T, Arc<ModelError>>>,
    pub initial: Option<Result<T, Arc<ModelError>>>,
}

/// How one sync attempt failed.
enum SyncAttempt {
    /// Not worth retrying; surfaces as-is.
    Fatal(ModelError),
    /// Transient; the retry strategy decides.
    Retry(anyhow::Error),
}

/// The single writer for one model. Every state transition happens on this
/// task; a new event is never processed while a previous merge is
/// outstanding.
pub(crate) struct ModelWorker<T> {
    pub name: String,
    pub transport: Arc<dyn Transport>,
    pub sync_fn: Arc<dyn SyncFunction<T>>,
    pub merge_fn: Arc<dyn Merge<T>>,
    pub sync_options: SyncOptions,
    pub comparator: EventComparator,
    pub stream: Stream,
    pub stream_events: Option<StreamSubscription>,
    pub requests: mpsc::UnboundedReceiver<ModelRequest<T>>,
    pub rollbacks: mpsc::UnboundedReceiver<RollbackRequest>,
    pub confirmations: ConfirmationsRegistry,
    pub pending_events: Vec<Event>,
    pub confirmed: Option<T>,
    pub optimistic: Option<T>,
    pub data: Arc<RwLock<Option<ModelData<T>>>>,
    pub state: watch::Sender<ModelState>,
    pub optimistic_tx: broadcast::Sender<Result<T, Arc<ModelError>>>,
    pub confirmed_tx: broadcast::Sender<Result<T, Arc<ModelError>>>,
    pub last_sync_args: JsonValue,
}

impl<T: Clone + Send + Sync + 'static> ModelWorker<T> {
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if !self.handle_request(request).await {
                            break;
                        }
                    },
                    None => break,
                },
                Some(rollback) = self.rollbacks.recv() => {
                    self.handle_rollback(rollback).await;
                },
                event = Self::next_stream_event(&mut self.stream_events) => match event {
                    Some(event) => {
                        if !self.handle_stream_event(event).await {
                            break;
                        }
                    },
                    None => self.stream_events = None,
                },
                _ = Self::sleep_until_opt(self.confirmations.next_deadline()) => {
                    self.expire_confirmations().await;
                },
            }
        }
    }

    async fn next_stream_event(
        subscription: &mut Option<StreamSubscription>,
    ) -> Option<StreamEvent> {
        match subscription {
            Some(subscription) => subscription.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn sleep_until_opt(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Returns false when the worker should exit.
    async fn handle_request(&mut self, request: ModelRequest<T>) -> bool {
        match request {
            ModelRequest::Sync { args, ack } => {
                let result = self.run_sync(args).await;
                let disposed = matches!(result, Err(ModelError::Disposed));
                let _ = ack.send(result);
                !disposed
            },
            ModelRequest::Optimistic {
                event,
                timeout,
                ack,
            } => {
                let _ = ack.send(self.apply_optimistic(event, timeout).await);
                true
            },
            ModelRequest::Subscribe { kind, ack } => {
                let _ = ack.send(self.subscription_seed(kind));
                true
            },
            ModelRequest::Pause { ack } => {
                let _ = ack.send(self.handle_pause().await);
                true
            },
            ModelRequest::Resume { ack } => {
                let _ = ack.send(self.handle_resume().await);
                true
            },
            ModelRequest::Dispose { ack } => {
                self.dispose().await;
                let _ = ack.send(());
                false
            },
        }
    }

    /// Returns false when the worker should exit.
    async fn handle_stream_event(&mut self, event: StreamEvent) -> bool {
        match event {
            StreamEvent::Message(message) => {
                let confirmed = ConfirmedEvent::from_message(&message);
                self.apply_confirmed(confirmed).await;
                true
            },
            StreamEvent::Discontinuity { reason } => {
                tracing::warn!(model = %self.name, %reason, "channel discontinuity; re-syncing");
                let args = self.last_sync_args.clone();
                match self.run_sync(args).await {
                    Ok(()) => true,
                    Err(ModelError::Disposed) => false,
                    Err(err) => {
                        // No originating caller here, so subscribers get it.
                        self.notify_error(Arc::new(ModelError::Discontinuity {
                            reason: format!("{reason}; re-sync failed: {err}"),
                        }));
                        true
                    },
                }
            },
            StreamEvent::Failed { reason } => {
                tracing::error!(model = %self.name, %reason, "channel failed; disposing model");
                self.dispose().await;
                false
            },
        }
    }

    async fn run_sync(&mut self, args: JsonValue) -> Result<(), ModelError> {
        let state = *self.state.borrow();
        if state == ModelState::Disposed {
            return Err(ModelError::Disposed);
        }
        self.set_state(ModelState::Syncing);
        self.last_sync_args = args.clone();
        // Outstanding optimistic work is superseded by the fresh snapshot.
        self.confirmations.finalize(RollbackReason::SyncInterrupted);
        self.pending_events.clear();

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.sync_once(&args).await {
                Ok(()) => {
                    self.set_state(ModelState::Ready);
                    return Ok(());
                },
                Err(SyncAttempt::Fatal(err)) => {
                    if matches!(err, ModelError::Disposed) {
                        return Err(err);
                    }
                    if let ModelError::InsufficientHistory(boundary) = &err {
                        tracing::error!(
                            model = %self.name,
                            %boundary,
                            retention = ?self.sync_options.message_retention_period,
                            "snapshot predates retained channel history"
                        );
                    }
                    self.set_state(ModelState::Errored);
                    return Err(err);
                },
                Err(SyncAttempt::Retry(err)) => match (self.sync_options.retry_strategy)(attempts) {
                    Some(delay) => {
                        tracing::error!(
                            model = %self.name,
                            error = %err,
                            ?delay,
                            "sync attempt failed; backing off and retrying"
                        );
                        if let Some(ack) = self.sleep_interruptible(delay).await {
                            self.dispose().await;
                            let _ = ack.send(());
                            return Err(ModelError::Disposed);
                        }
                    },
                    None => {
                        self.set_state(ModelState::Errored);
                        return Err(ModelError::SyncFailed {
                            attempts,
                            source: err,
                        });
                    },
                },
            }
        }
    }

    async fn sync_once(&mut self, args: &JsonValue) -> Result<(), SyncAttempt> {
        self.stream.reset().await.map_err(SyncAttempt::Fatal)?;
        match &mut self.stream_events {
            // Events queued from the previous replay generation are stale.
            Some(subscription) => subscription.drain(),
            None => {
                self.stream_events =
                    Some(self.stream.subscribe().await.map_err(SyncAttempt::Fatal)?)
            },
        }
        self.transport.connected().await.map_err(SyncAttempt::Retry)?;

        let snapshot = self
            .sync_fn
            .sync(args.clone())
            .await
            .map_err(SyncAttempt::Retry)?;

        match self.stream.replay(snapshot.sequence_id.clone()).await {
            Ok(()) => {},
            Err(err @ ModelError::InsufficientHistory(_)) => {
                return Err(SyncAttempt::Fatal(err));
            },
            Err(ModelError::Transport { source }) => return Err(SyncAttempt::Retry(source)),
            Err(err) => return Err(SyncAttempt::Fatal(err)),
        }

        self.confirmed = Some(snapshot.data.clone());
        self.optimistic = Some(snapshot.data);
        self.publish_data();
        self.notify(SubscriptionKind::Optimistic);
        self.notify(SubscriptionKind::Confirmed);
        Ok(())
    }

    /// Sleeps out a backoff delay while still answering requests. Returns the
    /// dispose ack when a dispose interrupted the wait.
    async fn sleep_interruptible(&mut self, delay: Duration) -> Option<oneshot::Sender<()>> {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return None,
                request = self.requests.recv() => match request {
                    Some(ModelRequest::Dispose { ack }) => return Some(ack),
                    Some(ModelRequest::Subscribe { kind, ack }) => {
                        let _ = ack.send(self.subscription_seed(kind));
                    },
                    Some(ModelRequest::Sync { ack, .. }) => {
                        let _ = ack.send(Err(ModelError::invalid_state(
                            ModelState::Syncing,
                            "sync while a sync is in progress",
                        )));
                    },
                    Some(ModelRequest::Optimistic { ack, .. }) => {
                        let _ = ack.send(Err(ModelError::invalid_state(
                            ModelState::Syncing,
                            "submit an optimistic event",
                        )));
                    },
                    Some(ModelRequest::Pause { ack }) => {
                        let _ = ack.send(Err(ModelError::invalid_state(
                            ModelState::Syncing,
                            "pause",
                        )));
                    },
                    Some(ModelRequest::Resume { ack }) => {
                        let _ = ack.send(Err(ModelError::invalid_state(
                            ModelState::Syncing,
                            "resume",
                        )));
                    },
                    None => return None,
                },
            }
        }
    }

    async fn apply_confirmed(&mut self, confirmed_event: ConfirmedEvent) {
        // Messages queued across an errored merge or a dispose must not keep
        // advancing the projection.
        if *self.state.borrow() != ModelState::Ready {
            return;
        }
        let Some(confirmed_state) = self.confirmed.clone() else {
            return;
        };

        if confirmed_event.rejected {
            // A rejection annuls the matching optimistic events; nothing is
            // merged into confirmed state.
            let removed = self.remove_pending(&confirmed_event.event);
            self.confirmations.confirm(&confirmed_event);
            if removed {
                self.refold_optimistic().await;
            }
            return;
        }

        let new_confirmed = match self
            .merge_fn
            .merge(confirmed_state, MergeEvent::Confirmed(confirmed_event.clone()))
            .await
        {
            Ok(state) => state,
            Err(source) => {
                self.escalate_merge_failure(source);
                return;
            },
        };

        // The event now lives in confirmed state; dropping the matching
        // pending event is what rebases the remainder on top.
        self.remove_pending(&confirmed_event.event);
        let new_optimistic = if self.pending_events.is_empty() {
            new_confirmed.clone()
        } else {
            let pending = self.pending_events.clone();
            match self.fold(new_confirmed.clone(), &pending).await {
                Ok(state) => state,
                Err(source) => {
                    self.escalate_merge_failure(source);
                    return;
                },
            }
        };

        self.confirmed = Some(new_confirmed);
        self.optimistic = Some(new_optimistic);
        self.publish_data();
        self.notify(SubscriptionKind::Optimistic);
        self.notify(SubscriptionKind::Confirmed);
        self.confirmations.confirm(&confirmed_event);
    }

    async fn apply_optimistic(
        &mut self,
        event: Event,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<(), ModelError>>, ModelError> {
        let state = *self.state.borrow();
        if state != ModelState::Ready {
            return Err(ModelError::invalid_state(state, "submit an optimistic event"));
        }
        let Some(optimistic_state) = self.optimistic.clone() else {
            return Err(ModelError::invalid_state(state, "submit an optimistic event"));
        };

        let applied = self
            .merge_fn
            .merge(optimistic_state, MergeEvent::Optimistic(event.clone()))
            .await
            .map_err(|source| ModelError::MergeFailed { source })?;

        self.pending_events.push(event.clone());
        self.optimistic = Some(applied);
        self.publish_data();
        self.notify(SubscriptionKind::Optimistic);
        Ok(self
            .confirmations
            .add(vec![event], timeout, Instant::now()))
    }

    async fn handle_rollback(&mut self, rollback: RollbackRequest) {
        self.confirmations.reject(rollback.reason, &rollback.events);
        let mut removed = false;
        for event in &rollback.events {
            removed |= self.remove_pending(event);
        }
        if removed {
            tracing::warn!(
                model = %self.name,
                count = rollback.events.len(),
                reason = ?rollback.reason,
                "rolling back optimistic events"
            );
            self.refold_optimistic().await;
        }
    }

    async fn expire_confirmations(&mut self) {
        let expired = self.confirmations.expire(Instant::now());
        if expired.is_empty() {
            return;
        }
        tracing::warn!(
            model = %self.name,
            count = expired.len(),
            "optimistic events timed out; rolling back"
        );
        let mut removed = false;
        for event in &expired {
            removed |= self.remove_pending(event);
        }
        if removed {
            self.refold_optimistic().await;
        }
    }

    /// Recomputes `optimistic` from `confirmed` plus the still-pending
    /// optimistic events, notifying optimistic subscribers once.
    async fn refold_optimistic(&mut self) {
        let Some(confirmed) = self.confirmed.clone() else {
            return;
        };
        let refolded = if self.pending_events.is_empty() {
            Ok(confirmed)
        } else {
            let pending = self.pending_events.clone();
            self.fold(confirmed, &pending).await
        };
        match refolded {
            Ok(state) => {
                self.optimistic = Some(state);
                self.publish_data();
                self.notify(SubscriptionKind::Optimistic);
            },
            Err(source) => self.escalate_merge_failure(source),
        }
    }

    /// Applies `merge` left to right in insertion order.
    async fn fold(&self, base: T, events: &[Event]) -> anyhow::Result<T> {
        let mut state = base;
        for event in events {
            state = self
                .merge_fn
                .merge(state, MergeEvent::Optimistic(event.clone()))
                .await?;
        }
        Ok(state)
    }

    fn remove_pending(&mut self, event: &Event) -> bool {
        let comparator = self.comparator.clone();
        let before = self.pending_events.len();
        self.pending_events
            .retain(|pending| !comparator(pending, event));
        self.pending_events.len() < before
    }

    async fn handle_pause(&mut self) -> Result<(), ModelError> {
        let state = *self.state.borrow();
        if state != ModelState::Ready {
            return Err(ModelError::invalid_state(state, "pause"));
        }
        self.stream.pause().await?;
        self.set_state(ModelState::Paused);
        Ok(())
    }

    async fn handle_resume(&mut self) -> Result<(), ModelError> {
        let state = *self.state.borrow();
        if state != ModelState::Paused {
            return Err(ModelError::invalid_state(state, "resume"));
        }
        self.stream.resume().await?;
        self.set_state(ModelState::Ready);
        Ok(())
    }

    async fn dispose(&mut self) {
        if *self.state.borrow() == ModelState::Disposed {
            return;
        }
        self.confirmations.finalize(RollbackReason::Disposed);
        self.pending_events.clear();
        // The stream disposes itself on a fatal channel failure.
        if self.stream.state() != StreamState::Disposed {
            self.stream.dispose().await;
        }
        self.set_state(ModelState::Disposed);
    }

    fn escalate_merge_failure(&mut self, source: anyhow::Error) {
        tracing::error!(model = %self.name, error = %source, "merge failed; model errored");
        self.set_state(ModelState::Errored);
        self.notify_error(Arc::new(ModelError::MergeFailed { source }));
    }

    fn subscription_seed(&self, kind: SubscriptionKind) -> SubscriptionSeed<T> {
        match kind {
            SubscriptionKind::Optimistic => SubscriptionSeed {
                receiver: self.optimistic_tx.subscribe(),
                initial: self.optimistic.clone().map(Ok),
            },
            SubscriptionKind::Confirmed => SubscriptionSeed {
                receiver: self.confirmed_tx.subscribe(),
                initial: self.confirmed.clone().map(Ok),
            },
        }
    }

    fn publish_data(&self) {
        if let (Some(confirmed), Some(optimistic)) = (&self.confirmed, &self.optimistic) {
            *self.data.write() = Some(ModelData {
                confirmed: confirmed.clone(),
                optimistic: optimistic.clone(),
            });
        }
    }

    fn notify(&self, kind: SubscriptionKind) {
        let (sender, value) = match kind {
            SubscriptionKind::Optimistic => (&self.optimistic_tx, &self.optimistic),
            SubscriptionKind::Confirmed => (&self.confirmed_tx, &self.confirmed),
        };
        if let Some(value) = value {
            let _ = sender.send(Ok(value.clone()));
        }
    }

    fn notify_error(&self, err: Arc<ModelError>) {
        let _ = self.optimistic_tx.send(Err(err.clone()));
        let _ = self.confirmed_tx.send(Err(err));
    }

    fn set_state(&mut self, state: ModelState) {
        let previous = *self.state.borrow();
        if previous != state {
            tracing::debug!(model = %self.name, from = %previous, to = %state, "model state change");
            self.state.send_replace(state);
        }
    }
}
