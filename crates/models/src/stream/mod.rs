//! Ownership of one channel: replay from a sequence boundary, then ordered
//! live delivery.

use std::{
    cmp::Ordering,
    fmt,
    sync::Arc,
    time::Duration,
};

use models_sync_types::{
    Message,
    SequenceId,
};
use tokio::{
    sync::{
        mpsc,
        oneshot,
        watch,
    },
    task::JoinHandle,
    time::Instant,
};

use crate::{
    errors::ModelError,
    options::EventOrderer,
    stream::{
        buffer::SlidingWindow,
        resumer::HistoryResumer,
    },
    transport::{
        Channel,
        ChannelEvent,
        ChannelStateChange,
        HistoryParams,
    },
};

mod buffer;
mod resumer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamState {
    Initialized,
    Seeking,
    Ready,
    Reset,
    Errored,
    Disposed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Initialized => "initialized",
            StreamState::Seeking => "seeking",
            StreamState::Ready => "ready",
            StreamState::Reset => "reset",
            StreamState::Errored => "errored",
            StreamState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// What a stream subscriber observes: ordered messages, continuity gaps, and
/// fatal channel failures.
#[derive(Clone, Debug)]
pub(crate) enum StreamEvent {
    Message(Message),
    Discontinuity { reason: String },
    Failed { reason: String },
}

pub(crate) struct StreamOptions {
    pub history_page_size: u32,
    pub buffer: Duration,
    pub event_orderer: EventOrderer,
}

enum StreamCommand {
    Replay {
        sequence_id: SequenceId,
        ack: oneshot::Sender<Result<(), ModelError>>,
    },
    Pause {
        ack: oneshot::Sender<Result<(), ModelError>>,
    },
    Resume {
        ack: oneshot::Sender<Result<(), ModelError>>,
    },
    Reset {
        ack: oneshot::Sender<Result<(), ModelError>>,
    },
    Dispose {
        ack: oneshot::Sender<()>,
    },
    Subscribe {
        ack: oneshot::Sender<(u64, mpsc::UnboundedReceiver<StreamEvent>)>,
    },
    Unsubscribe {
        id: u64,
    },
}

/// Handle to a stream worker task. Dropping the handle aborts the worker.
pub(crate) struct Stream {
    commands: mpsc::UnboundedSender<StreamCommand>,
    state: watch::Receiver<StreamState>,
    task: JoinHandle<()>,
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Stream {
    pub fn spawn(channel: Arc<dyn Channel>, options: StreamOptions) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(StreamState::Initialized);
        let worker = StreamWorker {
            window: SlidingWindow::new(options.buffer, options.event_orderer.clone()),
            channel,
            options,
            commands: commands_rx,
            state: state_tx,
            subscribers: Vec::new(),
            next_subscriber_id: 0,
            events: None,
            last_delivered: None,
            paused: false,
        };
        Self {
            commands: commands_tx,
            state: state_rx,
            task: tokio::spawn(worker.run()),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub async fn replay(&self, sequence_id: SequenceId) -> Result<(), ModelError> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(StreamCommand::Replay { sequence_id, ack })
            .map_err(|_| ModelError::Disposed)?;
        rx.await.map_err(|_| ModelError::Disposed)?
    }

    pub async fn pause(&self) -> Result<(), ModelError> {
        self.command(|ack| StreamCommand::Pause { ack }).await
    }

    pub async fn resume(&self) -> Result<(), ModelError> {
        self.command(|ack| StreamCommand::Resume { ack }).await
    }

    pub async fn reset(&self) -> Result<(), ModelError> {
        self.command(|ack| StreamCommand::Reset { ack }).await
    }

    pub async fn dispose(&self) {
        let (ack, rx) = oneshot::channel();
        if self.commands.send(StreamCommand::Dispose { ack }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn subscribe(&self) -> Result<StreamSubscription, ModelError> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(StreamCommand::Subscribe { ack })
            .map_err(|_| ModelError::Disposed)?;
        let (id, events) = rx.await.map_err(|_| ModelError::Disposed)?;
        Ok(StreamSubscription {
            id,
            events,
            commands: self.commands.clone(),
        })
    }

    async fn command(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), ModelError>>) -> StreamCommand,
    ) -> Result<(), ModelError> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(make(ack))
            .map_err(|_| ModelError::Disposed)?;
        rx.await.map_err(|_| ModelError::Disposed)?
    }
}

/// One consumer's ordered view of the stream. Dropping it unsubscribes.
pub(crate) struct StreamSubscription {
    id: u64,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    commands: mpsc::UnboundedSender<StreamCommand>,
}

impl StreamSubscription {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Discards everything currently queued.
    pub fn drain(&mut self) {
        while self.events.try_recv().is_ok() {}
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        let _ = self.commands.send(StreamCommand::Unsubscribe { id: self.id });
    }
}

struct StreamWorker {
    channel: Arc<dyn Channel>,
    options: StreamOptions,
    commands: mpsc::UnboundedReceiver<StreamCommand>,
    state: watch::Sender<StreamState>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<StreamEvent>)>,
    next_subscriber_id: u64,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    window: SlidingWindow,
    last_delivered: Option<String>,
    paused: bool,
}

impl StreamWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    },
                    None => break,
                },
                event = Self::next_channel_event(&mut self.events) => match event {
                    Some(event) => {
                        if !self.handle_channel_event(event).await {
                            break;
                        }
                    },
                    None => self.events = None,
                },
                _ = Self::sleep_until_opt(self.window.next_deadline()) => {
                    for message in self.window.expire(Instant::now()) {
                        self.deliver(message);
                    }
                },
            }
        }
        // Release the channel on the way out unless dispose already did.
        if *self.state.borrow() != StreamState::Disposed {
            self.channel.unsubscribe().await;
            self.channel.release().await;
        }
    }

    async fn next_channel_event(
        events: &mut Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    ) -> Option<ChannelEvent> {
        match events {
            Some(events) => events.recv().await,
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
    async fn handle_command(&mut self, command: StreamCommand) -> bool {
        match command {
            StreamCommand::Replay { sequence_id, ack } => {
                let result = self.handle_replay(sequence_id).await;
                let _ = ack.send(result);
                true
            },
            StreamCommand::Pause { ack } => {
                let _ = ack.send(self.handle_pause().await);
                true
            },
            StreamCommand::Resume { ack } => {
                let _ = ack.send(self.handle_resume().await);
                true
            },
            StreamCommand::Reset { ack } => {
                let _ = ack.send(self.handle_reset().await);
                true
            },
            StreamCommand::Dispose { ack } => {
                self.dispose().await;
                let _ = ack.send(());
                false
            },
            StreamCommand::Subscribe { ack } => {
                self.next_subscriber_id += 1;
                let (tx, rx) = mpsc::unbounded_channel();
                self.subscribers.push((self.next_subscriber_id, tx));
                let _ = ack.send((self.next_subscriber_id, rx));
                true
            },
            StreamCommand::Unsubscribe { id } => {
                self.subscribers.retain(|(subscriber, _)| *subscriber != id);
                true
            },
        }
    }

    /// Returns false when the worker should exit.
    async fn handle_channel_event(&mut self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Message(message) => {
                if *self.state.borrow() == StreamState::Ready {
                    let now = Instant::now();
                    for out in self.window.add(message, now) {
                        self.deliver(out);
                    }
                }
                true
            },
            ChannelEvent::StateChange(ChannelStateChange::Suspended) => {
                tracing::warn!("channel suspended; continuity lost");
                self.fan(StreamEvent::Discontinuity {
                    reason: "channel suspended".to_string(),
                });
                true
            },
            ChannelEvent::StateChange(ChannelStateChange::Update) => {
                tracing::warn!("channel re-attached without resume");
                self.fan(StreamEvent::Discontinuity {
                    reason: "channel re-attached without resume".to_string(),
                });
                true
            },
            ChannelEvent::StateChange(ChannelStateChange::Failed { reason }) => {
                tracing::error!(%reason, "channel failed; disposing stream");
                self.fan(StreamEvent::Failed {
                    reason: reason.clone(),
                });
                self.dispose().await;
                false
            },
        }
    }

    async fn handle_replay(&mut self, sequence_id: SequenceId) -> Result<(), ModelError> {
        let state = *self.state.borrow();
        match state {
            StreamState::Initialized | StreamState::Reset => {},
            // Surfacing the misuse beats risking missed messages on an
            // already-attached channel.
            _ => return Err(ModelError::invalid_state(state, "replay")),
        }
        self.set_state(StreamState::Seeking);
        match self.seek(sequence_id).await {
            Ok(()) => {
                self.set_state(StreamState::Ready);
                Ok(())
            },
            Err(err) => {
                self.teardown_channel().await;
                self.set_state(StreamState::Errored);
                Err(err)
            },
        }
    }

    async fn seek(&mut self, boundary: SequenceId) -> Result<(), ModelError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.channel
            .subscribe(events_tx)
            .await
            .map_err(ModelError::transport)?;
        self.channel.attach().await.map_err(ModelError::transport)?;
        self.events = Some(events_rx);
        self.window.clear();
        self.last_delivered = None;

        let mut resumer = HistoryResumer::new(boundary, self.options.event_orderer.clone());
        let mut cursor = self
            .channel
            .history(HistoryParams {
                until_attach: true,
                limit: self.options.history_page_size,
            })
            .await
            .map_err(ModelError::transport)?;

        let flush = loop {
            let page = cursor.next_page().await.map_err(ModelError::transport)?;
            self.drain_seek_events(&mut resumer)?;
            match page {
                Some(messages) => {
                    if let Some(flush) = resumer.add_historical_messages(messages)? {
                        break flush;
                    }
                },
                None => break resumer.finish()?,
            }
        };

        for message in flush.historical {
            self.deliver(message);
        }
        let now = Instant::now();
        for message in flush.live {
            for out in self.window.add(message, now) {
                self.deliver(out);
            }
        }
        Ok(())
    }

    /// Buffers live traffic that raced the history pagination.
    fn drain_seek_events(&mut self, resumer: &mut HistoryResumer) -> Result<(), ModelError> {
        loop {
            let received = match &mut self.events {
                Some(events) => events.try_recv(),
                None => return Ok(()),
            };
            match received {
                Ok(ChannelEvent::Message(message)) => resumer.add_live(message),
                Ok(ChannelEvent::StateChange(ChannelStateChange::Failed { reason })) => {
                    return Err(ModelError::transport(anyhow::anyhow!(
                        "channel failed while seeking: {reason}"
                    )));
                },
                Ok(ChannelEvent::StateChange(change)) => {
                    tracing::debug!(?change, "channel state change while seeking");
                },
                Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.events = None;
                    return Ok(());
                },
            }
        }
    }

    async fn handle_pause(&mut self) -> Result<(), ModelError> {
        let state = *self.state.borrow();
        if state != StreamState::Ready || self.paused {
            return Err(ModelError::invalid_state(state, "pause"));
        }
        self.channel.detach().await.map_err(ModelError::transport)?;
        self.paused = true;
        Ok(())
    }

    async fn handle_resume(&mut self) -> Result<(), ModelError> {
        if !self.paused {
            return Err(ModelError::invalid_state(*self.state.borrow(), "resume"));
        }
        let attach = self.channel.attach().await.map_err(ModelError::transport)?;
        self.paused = false;
        if !attach.resumed {
            self.fan(StreamEvent::Discontinuity {
                reason: "channel did not resume across pause".to_string(),
            });
        }
        Ok(())
    }

    async fn handle_reset(&mut self) -> Result<(), ModelError> {
        let state = *self.state.borrow();
        if state == StreamState::Disposed {
            return Err(ModelError::invalid_state(state, "reset"));
        }
        self.teardown_channel().await;
        self.set_state(StreamState::Reset);
        Ok(())
    }

    async fn dispose(&mut self) {
        self.teardown_channel().await;
        self.channel.release().await;
        self.subscribers.clear();
        self.set_state(StreamState::Disposed);
    }

    async fn teardown_channel(&mut self) {
        self.events = None;
        self.window.clear();
        self.last_delivered = None;
        self.paused = false;
        self.channel.unsubscribe().await;
        if let Err(err) = self.channel.detach().await {
            tracing::debug!(error = %err, "detach failed during teardown");
        }
    }

    fn deliver(&mut self, message: Message) {
        if let Some(last) = &self.last_delivered {
            if (self.options.event_orderer)(&message.id, last) != Ordering::Greater {
                tracing::debug!(id = %message.id, "dropping duplicate or stale message");
                return;
            }
        }
        self.last_delivered = Some(message.id.clone());
        self.fan(StreamEvent::Message(message));
    }

    fn fan(&mut self, event: StreamEvent) {
        self.subscribers
            .retain(|(_, subscriber)| subscriber.send(event.clone()).is_ok());
    }

    fn set_state(&mut self, state: StreamState) {
        let previous = *self.state.borrow();
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "stream state change");
            self.state.send_replace(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::Value as JsonValue;

    use super::*;
    use crate::{
        options::default_event_orderer,
        transport::testing::{
            TestChannel,
            TestTransport,
        },
    };

    fn message(id: &str) -> Message {
        Message::new(id, "update", JsonValue::Null)
    }

    fn fixture(buffer_ms: u64) -> (Stream, TestChannel) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let transport = TestTransport::new();
        let channel = transport.channel_handle("test:stream");
        let stream = Stream::spawn(
            Arc::new(channel.clone()),
            StreamOptions {
                history_page_size: 2,
                buffer: Duration::from_millis(buffer_ms),
                event_orderer: default_event_orderer(),
            },
        );
        (stream, channel)
    }

    async fn recv(subscription: &mut StreamSubscription) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(2), subscription.recv())
            .await
            .expect("Test timed out waiting for a stream event")
            .expect("Stream subscription ended unexpectedly")
    }

    async fn recv_message_id(subscription: &mut StreamSubscription) -> String {
        match recv(subscription).await {
            StreamEvent::Message(message) => message.id,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replay_delivers_strictly_newer_history_then_live() -> anyhow::Result<()> {
        let (stream, channel) = fixture(0);
        channel.set_history(vec![message("3"), message("2"), message("1")]);
        let mut subscription = stream.subscribe().await?;

        stream.replay(SequenceId::from("1")).await?;
        assert_eq!(stream.state(), StreamState::Ready);

        assert_eq!(recv_message_id(&mut subscription).await, "2");
        assert_eq!(recv_message_id(&mut subscription).await, "3");

        channel.publish(message("4"));
        assert_eq!(recv_message_id(&mut subscription).await, "4");
        Ok(())
    }

    #[tokio::test]
    async fn test_replay_from_epoch_delivers_whole_window() -> anyhow::Result<()> {
        let (stream, channel) = fixture(0);
        channel.set_history(vec![message("3"), message("2"), message("1")]);
        let mut subscription = stream.subscribe().await?;

        stream.replay(SequenceId::zero()).await?;
        for expected in ["1", "2", "3"] {
            assert_eq!(recv_message_id(&mut subscription).await, expected);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_insufficient_history_errors_the_stream() -> anyhow::Result<()> {
        let (stream, channel) = fixture(0);
        channel.set_history(vec![
            message("7"),
            message("6"),
            message("5"),
            message("4"),
            message("3"),
            message("2"),
        ]);

        let err = stream.replay(SequenceId::from("1")).await.unwrap_err();
        assert!(matches!(err, ModelError::InsufficientHistory(_)), "{err}");
        assert_eq!(stream.state(), StreamState::Errored);
        Ok(())
    }

    #[tokio::test]
    async fn test_replay_while_ready_is_invalid_state() -> anyhow::Result<()> {
        let (stream, channel) = fixture(0);
        channel.set_history(vec![]);
        stream.replay(SequenceId::from("1")).await?;

        let err = stream.replay(SequenceId::from("1")).await.unwrap_err();
        assert!(matches!(err, ModelError::InvalidState { .. }), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_permits_a_fresh_replay() -> anyhow::Result<()> {
        let (stream, channel) = fixture(0);
        channel.set_history(vec![]);
        stream.replay(SequenceId::from("1")).await?;

        stream.reset().await?;
        assert_eq!(stream.state(), StreamState::Reset);
        assert!(!channel.is_attached());

        stream.replay(SequenceId::from("1")).await?;
        assert_eq!(stream.state(), StreamState::Ready);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_and_stale_messages_are_suppressed() -> anyhow::Result<()> {
        let (stream, channel) = fixture(0);
        channel.set_history(vec![message("2"), message("1")]);
        let mut subscription = stream.subscribe().await?;

        stream.replay(SequenceId::zero()).await?;
        assert_eq!(recv_message_id(&mut subscription).await, "1");
        assert_eq!(recv_message_id(&mut subscription).await, "2");

        // A retained copy of "2" shows up again, then genuinely new traffic.
        channel.publish(message("2"));
        channel.publish(message("3"));
        assert_eq!(recv_message_id(&mut subscription).await, "3");
        Ok(())
    }

    #[tokio::test]
    async fn test_window_reorders_live_messages() -> anyhow::Result<()> {
        let (stream, channel) = fixture(50);
        channel.set_history(vec![]);
        let mut subscription = stream.subscribe().await?;

        stream.replay(SequenceId::from("9")).await?;
        channel.publish(message("12"));
        channel.publish(message("10"));
        channel.publish(message("11"));

        for expected in ["10", "11", "12"] {
            assert_eq!(recv_message_id(&mut subscription).await, expected);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_suspension_surfaces_a_discontinuity() -> anyhow::Result<()> {
        let (stream, channel) = fixture(0);
        channel.set_history(vec![]);
        let mut subscription = stream.subscribe().await?;
        stream.replay(SequenceId::from("1")).await?;

        channel.emit_suspended();
        assert!(matches!(
            recv(&mut subscription).await,
            StreamEvent::Discontinuity { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_channel_failure_disposes_the_stream() -> anyhow::Result<()> {
        let (stream, channel) = fixture(0);
        channel.set_history(vec![]);
        let mut subscription = stream.subscribe().await?;
        stream.replay(SequenceId::from("1")).await?;

        channel.emit_failed("boom");
        assert!(matches!(
            recv(&mut subscription).await,
            StreamEvent::Failed { .. }
        ));
        // The subscriber set is cleared on dispose.
        assert!(subscription.recv().await.is_none());
        assert_eq!(stream.state(), StreamState::Disposed);
        assert!(channel.is_released());
        Ok(())
    }

    #[tokio::test]
    async fn test_pause_and_resume_preserve_subscribers() -> anyhow::Result<()> {
        let (stream, channel) = fixture(0);
        channel.set_history(vec![]);
        let mut subscription = stream.subscribe().await?;
        stream.replay(SequenceId::from("1")).await?;

        stream.pause().await?;
        assert!(!channel.is_attached());
        // Published while paused: not delivered live, and dropped once
        // resumed because delivery is subscription-scoped.
        channel.publish(message("5"));

        stream.resume().await?;
        assert!(channel.is_attached());
        assert_eq!(channel.attach_count(), 2);

        channel.publish(message("6"));
        assert_eq!(recv_message_id(&mut subscription).await, "6");
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_without_continuity_emits_discontinuity() -> anyhow::Result<()> {
        let (stream, channel) = fixture(0);
        channel.set_history(vec![]);
        let mut subscription = stream.subscribe().await?;
        stream.replay(SequenceId::from("1")).await?;

        stream.pause().await?;
        channel.set_discontinuity_on_next_attach();
        stream.resume().await?;

        assert!(matches!(
            recv(&mut subscription).await,
            StreamEvent::Discontinuity { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_dispose_is_terminal() -> anyhow::Result<()> {
        let (stream, channel) = fixture(0);
        channel.set_history(vec![]);
        stream.replay(SequenceId::from("1")).await?;

        stream.dispose().await;
        assert_eq!(stream.state(), StreamState::Disposed);
        assert!(channel.is_released());

        let err = stream.replay(SequenceId::from("1")).await.unwrap_err();
        assert!(matches!(err, ModelError::Disposed), "{err}");
        Ok(())
    }
}
