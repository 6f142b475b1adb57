//! The Model: confirmed + optimistic state, lifecycle, and subscriptions.

use std::{
    fmt,
    future::Future,
    sync::Arc,
};

use async_trait::async_trait;
use futures::{
    future::BoxFuture,
    FutureExt,
};
use models_sync_types::{
    Event,
    MergeEvent,
    SequenceId,
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
    task::JoinHandle,
};

use crate::{
    errors::ModelError,
    model::{
        confirmations::ConfirmationsRegistry,
        mutations::MutationsRegistry,
        worker::{
            ModelRequest,
            ModelWorker,
        },
    },
    options::{
        ClientOptions,
        OptimisticOverrides,
    },
    stream::{
        Stream,
        StreamOptions,
    },
    transport::{
        Channel,
        Transport,
    },
};

mod confirmations;
mod mutations;
mod subscription;
mod worker;

pub use mutations::{
    CancelHandle,
    Confirmation,
};
pub use subscription::ModelSubscription;

/// Broadcast depth per subscription channel; a subscriber that falls further
/// behind skips to the latest state.
const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelState {
    Initialized,
    Syncing,
    Ready,
    Paused,
    Errored,
    Disposed,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelState::Initialized => "initialized",
            ModelState::Syncing => "syncing",
            ModelState::Ready => "ready",
            ModelState::Paused => "paused",
            ModelState::Errored => "errored",
            ModelState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Which of the model's two logical streams a subscription observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Snapshot + confirmed events only.
    Confirmed,
    /// Confirmed state with all pending optimistic events applied.
    Optimistic,
}

/// The two state slots of a model.
///
/// `confirmed` is derived purely from the snapshot and confirmed events in
/// sequence order; `optimistic` is `confirmed` with every pending optimistic
/// event applied in insertion order. With nothing pending the two are equal.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelData<T> {
    pub confirmed: T,
    pub optimistic: T,
}

/// What the user sync function returns: the snapshot and the sequence
/// boundary it was taken at.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot<T> {
    pub data: T,
    pub sequence_id: SequenceId,
}

/// Fetches an authoritative snapshot from the backend. Failures are retried
/// per the configured retry strategy.
#[async_trait]
pub trait SyncFunction<T>: Send + Sync {
    async fn sync(&self, args: JsonValue) -> anyhow::Result<Snapshot<T>>;
}

/// Derives a new state from a prior state and one event.
///
/// Must be pure with respect to its arguments and must not mutate them;
/// a failure on the confirmed path escalates the model to `errored`.
#[async_trait]
pub trait Merge<T>: Send + Sync {
    async fn merge(&self, state: T, event: MergeEvent) -> anyhow::Result<T>;
}

struct FnSync<T>(Box<dyn Fn(JsonValue) -> BoxFuture<'static, anyhow::Result<Snapshot<T>>> + Send + Sync>);

#[async_trait]
impl<T: Send + Sync + 'static> SyncFunction<T> for FnSync<T> {
    async fn sync(&self, args: JsonValue) -> anyhow::Result<Snapshot<T>> {
        (self.0)(args).await
    }
}

/// Adapts an async closure into a [`SyncFunction`].
pub fn sync_fn<T, F, Fut>(f: F) -> Arc<dyn SyncFunction<T>>
where
    T: Send + Sync + 'static,
    F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Snapshot<T>>> + Send + 'static,
{
    Arc::new(FnSync(Box::new(move |args| f(args).boxed())))
}

struct FnMerge<T>(Box<dyn Fn(T, MergeEvent) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>);

#[async_trait]
impl<T: Send + Sync + 'static> Merge<T> for FnMerge<T> {
    async fn merge(&self, state: T, event: MergeEvent) -> anyhow::Result<T> {
        (self.0)(state, event).await
    }
}

/// Adapts an async closure into a [`Merge`] function.
pub fn merge_fn<T, F, Fut>(f: F) -> Arc<dyn Merge<T>>
where
    T: Send + Sync + 'static,
    F: Fn(T, MergeEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Arc::new(FnMerge(Box::new(move |state, event| f(state, event).boxed())))
}

/// Everything needed to register a model.
pub struct ModelSpec<T> {
    /// Unique model name; the client registry de-duplicates on it.
    pub name: String,
    /// The channel carrying this model's change feed.
    pub channel_name: String,
    pub sync: Arc<dyn SyncFunction<T>>,
    pub merge: Arc<dyn Merge<T>>,
}

impl<T> Clone for ModelSpec<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            channel_name: self.channel_name.clone(),
            sync: self.sync.clone(),
            merge: self.merge.clone(),
        }
    }
}

/// A live, locally-materialised projection of a server-owned entity.
///
/// The handle is cheap to clone; all state lives with a background worker
/// task that serialises every transition. When the final handle is dropped
/// the worker is cleaned up.
#[derive(Debug)]
pub struct Model<T> {
    name: String,
    requests: mpsc::UnboundedSender<ModelRequest<T>>,
    mutations: MutationsRegistry<T>,
    state: watch::Receiver<ModelState>,
    data: Arc<RwLock<Option<ModelData<T>>>>,
    task: Option<Arc<JoinHandle<()>>>,
}

impl<T> Clone for Model<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            requests: self.requests.clone(),
            mutations: self.mutations.clone(),
            state: self.state.clone(),
            data: self.data.clone(),
            task: self.task.clone(),
        }
    }
}

impl<T> Drop for Model<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if let Ok(task) = Arc::try_unwrap(task) {
                task.abort();
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Model<T> {
    pub(crate) fn spawn(
        spec: ModelSpec<T>,
        transport: Arc<dyn Transport>,
        channel: Arc<dyn Channel>,
        options: ClientOptions,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (rollbacks_tx, rollbacks_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ModelState::Initialized);
        let (optimistic_tx, _) = broadcast::channel(SUBSCRIPTION_BUFFER);
        let (confirmed_tx, _) = broadcast::channel(SUBSCRIPTION_BUFFER);
        let data = Arc::new(RwLock::new(None));

        let stream = Stream::spawn(
            channel,
            StreamOptions {
                history_page_size: options.sync.history_page_size,
                buffer: options.event_buffer.buffer,
                event_orderer: options.event_buffer.event_orderer.clone(),
            },
        );

        let worker = ModelWorker {
            name: spec.name.clone(),
            transport,
            sync_fn: spec.sync,
            merge_fn: spec.merge,
            sync_options: options.sync.clone(),
            comparator: options.optimistic.event_comparator.clone(),
            stream,
            stream_events: None,
            requests: requests_rx,
            rollbacks: rollbacks_rx,
            confirmations: ConfirmationsRegistry::new(
                options.optimistic.event_comparator.clone(),
            ),
            pending_events: Vec::new(),
            confirmed: None,
            optimistic: None,
            data: data.clone(),
            state: state_tx,
            optimistic_tx,
            confirmed_tx,
            last_sync_args: JsonValue::Null,
        };
        let task = tokio::spawn(worker.run());

        Self {
            name: spec.name,
            requests: requests_tx.clone(),
            mutations: MutationsRegistry::new(options.optimistic, requests_tx, rollbacks_tx),
            state: state_rx,
            data,
            task: Some(Arc::new(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ModelState {
        *self.state.borrow()
    }

    /// A watch over the lifecycle state, for callers that want to await
    /// transitions.
    pub fn state_changed(&self) -> watch::Receiver<ModelState> {
        self.state.clone()
    }

    /// The current confirmed/optimistic pair, once the first sync completed.
    pub fn data(&self) -> Option<ModelData<T>> {
        self.data.read().clone()
    }

    /// Bootstraps (or re-bootstraps) the model from a fresh snapshot and
    /// starts replaying the change feed from its sequence boundary.
    pub async fn sync(&self) -> Result<(), ModelError> {
        self.sync_with(JsonValue::Null).await
    }

    /// Like [`Model::sync`], passing arguments through to the sync function.
    pub async fn sync_with(&self, args: JsonValue) -> Result<(), ModelError> {
        let (ack, receiver) = oneshot::channel();
        self.requests
            .send(ModelRequest::Sync { args, ack })
            .map_err(|_| ModelError::Disposed)?;
        receiver.await.map_err(|_| ModelError::Disposed)?
    }

    /// Applies an optimistic event locally and registers it for confirmation.
    ///
    /// Returns the confirmation future and a cancel handle that rolls the
    /// event back.
    pub async fn optimistic(
        &self,
        event: Event,
    ) -> Result<(Confirmation, CancelHandle), ModelError> {
        self.mutations
            .handle_optimistic(event, OptimisticOverrides::default())
            .await
    }

    /// Like [`Model::optimistic`] with call-site option overrides.
    pub async fn optimistic_with(
        &self,
        event: Event,
        overrides: OptimisticOverrides,
    ) -> Result<(Confirmation, CancelHandle), ModelError> {
        self.mutations.handle_optimistic(event, overrides).await
    }

    /// Subscribes to one of the model's logical streams. The subscription is
    /// seeded with the current state and delivers asynchronously; dropping it
    /// unsubscribes.
    pub async fn subscribe(
        &self,
        kind: SubscriptionKind,
    ) -> Result<ModelSubscription<T>, ModelError> {
        let (ack, receiver) = oneshot::channel();
        self.requests
            .send(ModelRequest::Subscribe { kind, ack })
            .map_err(|_| ModelError::Disposed)?;
        let seed = receiver.await.map_err(|_| ModelError::Disposed)?;
        Ok(ModelSubscription::new(seed))
    }

    pub async fn pause(&self) -> Result<(), ModelError> {
        let (ack, receiver) = oneshot::channel();
        self.requests
            .send(ModelRequest::Pause { ack })
            .map_err(|_| ModelError::Disposed)?;
        receiver.await.map_err(|_| ModelError::Disposed)?
    }

    pub async fn resume(&self) -> Result<(), ModelError> {
        let (ack, receiver) = oneshot::channel();
        self.requests
            .send(ModelRequest::Resume { ack })
            .map_err(|_| ModelError::Disposed)?;
        receiver.await.map_err(|_| ModelError::Disposed)?
    }

    /// Rejects all pending confirmations, releases the channel, and
    /// terminates the model. Idempotent.
    pub async fn dispose(&self) {
        let (ack, receiver) = oneshot::channel();
        if self.requests.send(ModelRequest::Dispose { ack }).is_ok() {
            let _ = receiver.await;
        }
    }
}
