/// Testing fakes for the transport adapter.
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use models_sync_types::Message;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    AttachResult,
    Channel,
    ChannelEvent,
    ChannelStateChange,
    HistoryCursor,
    HistoryParams,
    Transport,
};

#[derive(Default)]
struct TransportInner {
    channels: HashMap<String, TestChannel>,
    agent: Option<String>,
}

/// An in-memory [`Transport`] whose channels are scripted by the test.
#[derive(Clone, Default)]
pub struct TestTransport {
    inner: Arc<Mutex<TransportInner>>,
}

impl TestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The test-side handle for a channel; creates the channel on first use,
    /// so tests can script it before the library attaches.
    pub fn channel_handle(&self, name: &str) -> TestChannel {
        self.inner
            .lock()
            .channels
            .entry(name.to_string())
            .or_insert_with(|| TestChannel::new(name))
            .clone()
    }

    pub fn agent(&self) -> Option<String> {
        self.inner.lock().agent.clone()
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn connected(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn channel(&self, name: &str) -> Arc<dyn Channel> {
        Arc::new(self.channel_handle(name))
    }

    fn set_agent(&self, agent: &str) {
        self.inner.lock().agent = Some(agent.to_string());
    }
}

struct ChannelInner {
    name: String,
    attached: bool,
    released: bool,
    attach_count: u32,
    discontinuity_on_next_attach: bool,
    fail_next_attach: Option<String>,
    subscriber: Option<mpsc::UnboundedSender<ChannelEvent>>,
    /// Retained history, newest first.
    history: Vec<Message>,
}

/// A scripted channel: tests control history, publish live messages, and
/// emit lifecycle transitions.
#[derive(Clone)]
pub struct TestChannel {
    inner: Arc<Mutex<ChannelInner>>,
}

impl TestChannel {
    fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChannelInner {
                name: name.to_string(),
                attached: false,
                released: false,
                attach_count: 0,
                discontinuity_on_next_attach: false,
                fail_next_attach: None,
                subscriber: None,
                history: Vec::new(),
            })),
        }
    }

    /// Replaces the retained history. Messages must be newest first.
    pub fn set_history(&self, messages: Vec<Message>) {
        self.inner.lock().history = messages;
    }

    /// Delivers a live message to the subscriber (when attached) and retains
    /// it in history.
    pub fn publish(&self, message: Message) -> bool {
        let mut inner = self.inner.lock();
        inner.history.insert(0, message.clone());
        if !inner.attached {
            return false;
        }
        match &inner.subscriber {
            Some(subscriber) => subscriber.send(ChannelEvent::Message(message)).is_ok(),
            None => false,
        }
    }

    pub fn emit_suspended(&self) {
        self.emit(ChannelEvent::StateChange(ChannelStateChange::Suspended));
    }

    pub fn emit_update(&self) {
        self.emit(ChannelEvent::StateChange(ChannelStateChange::Update));
    }

    pub fn emit_failed(&self, reason: &str) {
        self.emit(ChannelEvent::StateChange(ChannelStateChange::Failed {
            reason: reason.to_string(),
        }));
    }

    fn emit(&self, event: ChannelEvent) {
        if let Some(subscriber) = &self.inner.lock().subscriber {
            let _ = subscriber.send(event);
        }
    }

    pub fn set_discontinuity_on_next_attach(&self) {
        self.inner.lock().discontinuity_on_next_attach = true;
    }

    pub fn set_fail_next_attach(&self, reason: &str) {
        self.inner.lock().fail_next_attach = Some(reason.to_string());
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().attached
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }

    pub fn attach_count(&self) -> u32 {
        self.inner.lock().attach_count
    }

    pub async fn wait_until_attached(&self) {
        let channel = self.clone();
        tokio::time::timeout(Duration::from_secs(2), async move {
            while !channel.is_attached() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("Test timed out waiting for channel attach");
    }
}

#[async_trait]
impl Channel for TestChannel {
    async fn attach(&self) -> anyhow::Result<AttachResult> {
        let mut inner = self.inner.lock();
        anyhow::ensure!(!inner.released, "channel `{}` is released", inner.name);
        if let Some(reason) = inner.fail_next_attach.take() {
            anyhow::bail!("attach failed: {reason}");
        }
        let resumed = inner.attach_count > 0 && !inner.discontinuity_on_next_attach;
        inner.discontinuity_on_next_attach = false;
        inner.attached = true;
        inner.attach_count += 1;
        Ok(AttachResult { resumed })
    }

    async fn detach(&self) -> anyhow::Result<()> {
        self.inner.lock().attached = false;
        Ok(())
    }

    async fn subscribe(&self, events: mpsc::UnboundedSender<ChannelEvent>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        anyhow::ensure!(!inner.released, "channel `{}` is released", inner.name);
        inner.subscriber = Some(events);
        Ok(())
    }

    async fn unsubscribe(&self) {
        self.inner.lock().subscriber = None;
    }

    async fn history(&self, params: HistoryParams) -> anyhow::Result<Box<dyn HistoryCursor>> {
        let inner = self.inner.lock();
        anyhow::ensure!(!inner.released, "channel `{}` is released", inner.name);
        let pages = inner
            .history
            .chunks(params.limit.max(1) as usize)
            .map(<[Message]>::to_vec)
            .collect();
        Ok(Box::new(TestHistoryCursor { pages }))
    }

    async fn release(&self) {
        let mut inner = self.inner.lock();
        inner.released = true;
        inner.attached = false;
        inner.subscriber = None;
    }
}

struct TestHistoryCursor {
    pages: VecDeque<Vec<Message>>,
}

#[async_trait]
impl HistoryCursor for TestHistoryCursor {
    async fn next_page(&mut self) -> anyhow::Result<Option<Vec<Message>>> {
        Ok(self.pages.pop_front())
    }
}
