use std::{
    cmp::Ordering,
    fmt,
    mem,
};

use models_sync_types::{
    Message,
    SequenceId,
};

use crate::{
    errors::ModelError,
    options::EventOrderer,
};

/// Everything released when the resume boundary is located: the historical
/// tail (ascending order), then the live messages queued while seeking.
#[derive(Debug)]
pub(crate) struct Flush {
    pub historical: Vec<Message>,
    pub live: Vec<Message>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResumerState {
    Seeking,
    Ready,
}

impl fmt::Display for ResumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumerState::Seeking => f.write_str("seeking"),
            ResumerState::Ready => f.write_str("ready"),
        }
    }
}

/// Merges paginated history with live messages buffered during the seek.
///
/// Pages arrive newest to oldest. The boundary is the first accumulated
/// message whose id is not greater than the target sequence id; the boundary
/// message itself may also be observed live, so it and everything older are
/// discarded and only strictly-newer messages reach the consumer.
pub(crate) struct HistoryResumer {
    boundary: SequenceId,
    orderer: EventOrderer,
    /// Accumulated history, newest first.
    accumulated: Vec<Message>,
    /// Live messages queued while seeking.
    live: Vec<Message>,
    state: ResumerState,
}

impl HistoryResumer {
    pub fn new(boundary: SequenceId, orderer: EventOrderer) -> Self {
        Self {
            boundary,
            orderer,
            accumulated: Vec::new(),
            live: Vec::new(),
            state: ResumerState::Seeking,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ResumerState {
        self.state
    }

    /// Queues a live message for release after the flush.
    pub fn add_live(&mut self, message: Message) {
        self.live.push(message);
    }

    /// Accumulates one page of history. Returns the flush once the boundary
    /// is located, `None` while more pages are needed.
    ///
    /// An empty page with nothing accumulated means the channel retained no
    /// history in the window; the snapshot is assumed current and the flush
    /// is empty.
    pub fn add_historical_messages(
        &mut self,
        page: Vec<Message>,
    ) -> Result<Option<Flush>, ModelError> {
        if self.state == ResumerState::Ready {
            return Err(ModelError::invalid_state(self.state, "add historical messages"));
        }
        if page.is_empty() {
            if self.accumulated.is_empty() {
                return Ok(Some(self.flush()));
            }
            return Ok(None);
        }
        self.accumulated.extend(page);
        let orderer = self.orderer.clone();
        // Tolerate per-page disorder within the retention window.
        self.accumulated.sort_by(|a, b| orderer(&b.id, &a.id));
        let boundary = self.boundary.as_str();
        if let Some(index) = self
            .accumulated
            .iter()
            .position(|m| orderer(&m.id, boundary) != Ordering::Greater)
        {
            self.accumulated.truncate(index);
            return Ok(Some(self.flush()));
        }
        Ok(None)
    }

    /// Called when pagination is exhausted without locating the boundary.
    ///
    /// The epoch boundary replays the entire retained window; any other
    /// boundary that cannot be located means the snapshot predates retained
    /// history.
    pub fn finish(&mut self) -> Result<Flush, ModelError> {
        if self.state == ResumerState::Ready {
            return Err(ModelError::invalid_state(self.state, "finish seek"));
        }
        if self.accumulated.is_empty() || self.boundary.is_zero() {
            return Ok(self.flush());
        }
        Err(ModelError::InsufficientHistory(self.boundary.clone()))
    }

    fn flush(&mut self) -> Flush {
        self.state = ResumerState::Ready;
        let mut historical = mem::take(&mut self.accumulated);
        historical.reverse();
        Flush {
            historical,
            live: mem::take(&mut self.live),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::Value as JsonValue;

    use super::*;
    use crate::options::default_event_orderer;

    fn message(id: &str) -> Message {
        Message::new(id, "update", JsonValue::Null)
    }

    fn resumer(boundary: &str) -> HistoryResumer {
        HistoryResumer::new(SequenceId::from(boundary), default_event_orderer())
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_boundary_and_older_are_excluded() {
        let mut resumer = resumer("3");
        let flush = resumer
            .add_historical_messages(vec![
                message("5"),
                message("4"),
                message("3"),
                message("2"),
                message("1"),
            ])
            .unwrap()
            .expect("boundary should be located");
        assert_eq!(ids(&flush.historical), vec!["4", "5"]);
        assert!(flush.live.is_empty());
        assert_eq!(resumer.state(), ResumerState::Ready);
    }

    #[test]
    fn test_epoch_boundary_replays_whole_window() {
        let mut resumer = resumer("0");
        let done = resumer
            .add_historical_messages(vec![
                message("5"),
                message("4"),
                message("3"),
                message("2"),
                message("1"),
            ])
            .unwrap();
        assert!(done.is_none());
        let flush = resumer.finish().unwrap();
        assert_eq!(ids(&flush.historical), vec!["1", "2", "3", "4", "5"]);
    }

    #[test]
    fn test_exhausted_without_boundary_is_insufficient_history() {
        let mut resumer = resumer("1");
        let done = resumer
            .add_historical_messages(vec![
                message("7"),
                message("6"),
                message("5"),
                message("4"),
                message("3"),
                message("2"),
            ])
            .unwrap();
        assert!(done.is_none());
        let err = resumer.finish().unwrap_err();
        assert!(matches!(err, ModelError::InsufficientHistory(_)), "{err}");
    }

    #[test]
    fn test_empty_channel_flushes_immediately() {
        let mut resumer = resumer("10");
        let flush = resumer
            .add_historical_messages(vec![])
            .unwrap()
            .expect("empty window should flush");
        assert!(flush.historical.is_empty());
        assert_eq!(resumer.state(), ResumerState::Ready);
    }

    #[test]
    fn test_multi_page_accumulation_with_disorder() {
        let mut resumer = resumer("2");
        assert!(resumer
            .add_historical_messages(vec![message("5"), message("6")])
            .unwrap()
            .is_none());
        let flush = resumer
            .add_historical_messages(vec![message("4"), message("3"), message("2")])
            .unwrap()
            .expect("boundary in second page");
        assert_eq!(ids(&flush.historical), vec!["3", "4", "5", "6"]);
    }

    #[test]
    fn test_live_messages_queue_behind_history() {
        let mut resumer = resumer("1");
        resumer.add_live(message("4"));
        resumer.add_live(message("5"));
        let flush = resumer
            .add_historical_messages(vec![message("3"), message("2"), message("1")])
            .unwrap()
            .expect("boundary located");
        assert_eq!(ids(&flush.historical), vec!["2", "3"]);
        assert_eq!(ids(&flush.live), vec!["4", "5"]);
    }

    #[test]
    fn test_add_after_ready_is_invalid_state() {
        let mut resumer = resumer("10");
        resumer.add_historical_messages(vec![]).unwrap();
        let err = resumer.add_historical_messages(vec![message("11")]).unwrap_err();
        assert!(matches!(err, ModelError::InvalidState { .. }), "{err}");
    }

    #[test]
    fn test_newest_message_at_or_below_boundary_flushes_empty() {
        let mut resumer = resumer("9");
        let flush = resumer
            .add_historical_messages(vec![message("9"), message("8")])
            .unwrap()
            .expect("boundary is the newest retained message");
        assert!(flush.historical.is_empty());
    }
}
