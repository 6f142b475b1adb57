//! The pub/sub transport adapter consumed by the library.
//!
//! The library never opens connections itself; it drives a [`Transport`]
//! supplied by the caller. Inbound channel traffic is pushed into an
//! [`mpsc`] sender handed over on subscribe, mirroring how the worker tasks
//! consume it.

use std::sync::Arc;

use async_trait::async_trait;
use models_sync_types::Message;
use tokio::sync::mpsc;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Anything delivered by a channel subscription: a retained/live message or a
/// channel lifecycle transition.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    Message(Message),
    StateChange(ChannelStateChange),
}

/// Channel lifecycle transitions the library reacts to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelStateChange {
    /// Non-recoverable channel failure.
    Failed { reason: String },
    /// The channel was suspended; continuity is lost.
    Suspended,
    /// The channel re-attached without resuming; continuity is lost.
    Update,
}

/// Result of attaching a channel. `resumed` indicates whether message
/// continuity was preserved across the attach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachResult {
    pub resumed: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct HistoryParams {
    /// Restrict history to messages retained before the current attachment.
    pub until_attach: bool,
    /// Page size.
    pub limit: u32,
}

/// Paginated channel history, newest first within and across pages.
#[async_trait]
pub trait HistoryCursor: Send {
    /// The next page, or `None` once pagination is exhausted.
    async fn next_page(&mut self) -> anyhow::Result<Option<Vec<Message>>>;
}

/// A realtime connection shared by every model of a client.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Resolves once the underlying connection is established.
    async fn connected(&self) -> anyhow::Result<()>;

    fn channel(&self, name: &str) -> Arc<dyn Channel>;

    /// Stamps an agent identifier on the connection so the server can
    /// attribute traffic.
    fn set_agent(&self, agent: &str);
}

/// A single pub/sub channel. Owned by at most one stream at a time.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    async fn attach(&self) -> anyhow::Result<AttachResult>;

    async fn detach(&self) -> anyhow::Result<()>;

    /// Routes every subsequent [`ChannelEvent`] into `events`. A later call
    /// replaces the previous subscriber.
    async fn subscribe(&self, events: mpsc::UnboundedSender<ChannelEvent>) -> anyhow::Result<()>;

    async fn unsubscribe(&self);

    async fn history(&self, params: HistoryParams) -> anyhow::Result<Box<dyn HistoryCursor>>;

    /// Releases the channel handle; the channel must not be used afterwards.
    async fn release(&self);
}
