use std::{
    cmp::Ordering,
    collections::VecDeque,
    time::Duration,
};

use models_sync_types::Message;
use tokio::time::Instant;

use crate::options::EventOrderer;

/// Reorders and de-duplicates live messages within a fixed time window.
///
/// The window is a passive data structure: the owning worker calls
/// [`SlidingWindow::add`] on arrival, sleeps until [`SlidingWindow::next_deadline`],
/// and drains due batches with [`SlidingWindow::expire`]. Each message's expiry
/// releases that message together with everything currently ordered before it,
/// so two messages both buffered before either expires always emerge in sorted
/// order, even when the timer fires late.
pub(crate) struct SlidingWindow {
    window: Duration,
    orderer: EventOrderer,
    /// Buffered messages, sorted ascending by the orderer.
    entries: Vec<Message>,
    /// Expiry deadlines in arrival order.
    expiries: VecDeque<(Instant, String)>,
}

impl SlidingWindow {
    pub fn new(window: Duration, orderer: EventOrderer) -> Self {
        Self {
            window,
            orderer,
            entries: Vec::new(),
            expiries: VecDeque::new(),
        }
    }

    /// Accepts a live message. Returns messages to emit immediately (only
    /// when buffering is disabled); otherwise the message waits for its
    /// expiry. Exact id duplicates of a buffered message are dropped.
    pub fn add(&mut self, message: Message, now: Instant) -> Vec<Message> {
        if self.window.is_zero() {
            return vec![message];
        }
        if self.entries.iter().any(|m| m.id == message.id) {
            return Vec::new();
        }
        self.expiries.push_back((now + self.window, message.id.clone()));
        let orderer = self.orderer.clone();
        let position = self
            .entries
            .partition_point(|m| orderer(&m.id, &message.id) == Ordering::Less);
        self.entries.insert(position, message);
        Vec::new()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.expiries.front().map(|(deadline, _)| *deadline)
    }

    /// Emits every batch whose deadline has passed, in deadline order; each
    /// batch is the expiring message plus everything ordered before it.
    pub fn expire(&mut self, now: Instant) -> Vec<Message> {
        let mut emitted = Vec::new();
        while let Some((deadline, _)) = self.expiries.front() {
            if *deadline > now {
                break;
            }
            let Some((_, id)) = self.expiries.pop_front() else {
                break;
            };
            // The message may already have been released as part of an
            // earlier batch.
            if let Some(position) = self.entries.iter().position(|m| m.id == id) {
                emitted.extend(self.entries.drain(..=position));
            }
        }
        emitted
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.expiries.clear();
    }
}

#[cfg(test)]
mod tests {
    use models_sync_types::testing::arb_numeric_messages;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::Value as JsonValue;

    use super::*;
    use crate::options::default_event_orderer;

    fn message(id: &str) -> Message {
        Message::new(id, "update", JsonValue::Null)
    }

    fn window(ms: u64) -> SlidingWindow {
        SlidingWindow::new(Duration::from_millis(ms), default_event_orderer())
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_zero_window_emits_immediately() {
        let mut window = window(0);
        let now = Instant::now();
        assert_eq!(ids(&window.add(message("3"), now)), vec!["3"]);
        assert_eq!(ids(&window.add(message("1"), now)), vec!["1"]);
        assert_eq!(window.next_deadline(), None);
    }

    #[test]
    fn test_duplicates_by_id_are_dropped() {
        let mut window = window(100);
        let now = Instant::now();
        window.add(message("1"), now);
        window.add(message("1"), now);
        let emitted = window.expire(now + Duration::from_millis(100));
        assert_eq!(ids(&emitted), vec!["1"]);
        assert_eq!(window.expire(now + Duration::from_secs(1)), vec![]);
    }

    #[test]
    fn test_expiry_emits_sorted_prefix() {
        let mut window = window(100);
        let start = Instant::now();
        // "3" arrives first; "1" and "2" slip in before it expires.
        window.add(message("3"), start);
        window.add(message("1"), start + Duration::from_millis(10));
        window.add(message("2"), start + Duration::from_millis(20));
        let emitted = window.expire(start + Duration::from_millis(100));
        assert_eq!(ids(&emitted), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_later_message_stays_buffered() {
        let mut window = window(100);
        let start = Instant::now();
        window.add(message("2"), start);
        window.add(message("5"), start + Duration::from_millis(50));
        let emitted = window.expire(start + Duration::from_millis(100));
        assert_eq!(ids(&emitted), vec!["2"]);
        assert_eq!(
            window.next_deadline(),
            Some(start + Duration::from_millis(150))
        );
        let emitted = window.expire(start + Duration::from_millis(150));
        assert_eq!(ids(&emitted), vec!["5"]);
    }

    #[test]
    fn test_late_timer_preserves_order() {
        let mut window = window(100);
        let start = Instant::now();
        window.add(message("4"), start);
        window.add(message("2"), start + Duration::from_millis(10));
        // The scheduler fires long after both deadlines; one call drains
        // both batches in order.
        let emitted = window.expire(start + Duration::from_secs(5));
        assert_eq!(ids(&emitted), vec!["2", "4"]);
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut window = window(100);
        let now = Instant::now();
        window.add(message("1"), now);
        window.clear();
        assert_eq!(window.next_deadline(), None);
        assert_eq!(window.expire(now + Duration::from_secs(1)), vec![]);
    }

    proptest! {
        // Any set of messages buffered together emerges sorted and without
        // id duplicates.
        #[test]
        fn test_batch_emission_is_sorted_and_unique(messages in arb_numeric_messages(0..50, 24)) {
            let mut window = window(100);
            let start = Instant::now();
            for (i, message) in messages.into_iter().enumerate() {
                window.add(message, start + Duration::from_millis(i as u64));
            }
            let emitted = window.expire(start + Duration::from_secs(60));
            let ids: Vec<u64> = emitted.iter().map(|m| m.id.parse().unwrap()).collect();
            let mut expected = ids.clone();
            expected.sort_unstable();
            expected.dedup();
            prop_assert_eq!(&ids, &expected);
        }
    }
}
