//! Client library for live, optimistically-updated data models.
//!
//! A [`Model`] is a locally-materialised projection of a server-owned entity.
//! It bootstraps from an authoritative snapshot fetched by a user-supplied
//! sync function, replays the channel's change feed from the snapshot's
//! sequence boundary, and then keeps two state slots live: `confirmed`
//! (snapshot plus confirmed events, in order) and `optimistic` (`confirmed`
//! with all in-flight optimistic events applied). Optimistic events are
//! reconciled against confirmed messages by mutation id and rolled back on
//! rejection, timeout or cancellation.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use models::{
//!     merge_fn,
//!     sync_fn,
//!     Event,
//!     ModelSpec,
//!     ModelsClient,
//!     Snapshot,
//!     SubscriptionKind,
//! };
//! use serde_json::{
//!     json,
//!     Value,
//! };
//!
//! async fn run(transport: Arc<dyn models::transport::Transport>) -> anyhow::Result<()> {
//!     let client = ModelsClient::new(transport);
//!     let model = client.models().get(ModelSpec {
//!         name: "post:123".to_string(),
//!         channel_name: "posts:123".to_string(),
//!         sync: sync_fn(|_args| async move {
//!             // Fetch a snapshot from your backend.
//!             Ok(Snapshot {
//!                 data: json!({ "likes": 0 }),
//!                 sequence_id: "0".into(),
//!             })
//!         }),
//!         merge: merge_fn(|mut state: Value, event| async move {
//!             if let (Some(object), Some(patch)) =
//!                 (state.as_object_mut(), event.event().data.as_object())
//!             {
//!                 for (key, value) in patch {
//!                     object.insert(key.clone(), value.clone());
//!                 }
//!             }
//!             Ok(state)
//!         }),
//!     })?;
//!
//!     model.sync().await?;
//!
//!     let mut subscription = model.subscribe(SubscriptionKind::Optimistic).await?;
//!     let (confirmation, _cancel) = model
//!         .optimistic(Event::new("like").with_data(json!({ "likes": 1 })))
//!         .await?;
//!     println!("optimistic state: {:?}", subscription.next().await);
//!     confirmation.await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod errors;
pub mod model;
pub mod options;
mod stream;
pub mod transport;

pub use client::{
    ModelsClient,
    ModelsRegistry,
};
pub use errors::ModelError;
pub use model::{
    merge_fn,
    sync_fn,
    CancelHandle,
    Confirmation,
    Merge,
    Model,
    ModelData,
    ModelSpec,
    ModelState,
    ModelSubscription,
    Snapshot,
    SubscriptionKind,
    SyncFunction,
};
pub use models_sync_types::{
    headers,
    ConfirmedEvent,
    Event,
    EventComparator,
    MergeEvent,
    Message,
    SequenceId,
};
pub use options::{
    ClientOptions,
    EventBufferOptions,
    OptimisticEventOptions,
    OptimisticOverrides,
    SyncOptions,
};
