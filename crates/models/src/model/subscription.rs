use std::{
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Poll,
    },
};

use futures::Stream;
use tokio_stream::wrappers::{
    errors::BroadcastStreamRecvError,
    BroadcastStream,
};

use crate::{
    errors::ModelError,
    model::worker::SubscriptionSeed,
};

/// One subscriber's asynchronous view of a model's confirmed or optimistic
/// stream.
///
/// Yields `Ok(state)` on every notification and `Err(..)` for errors routed
/// to subscribers. The first item is the state at subscribe time. Dropping
/// the subscription unsubscribes; a dropped model ends the stream.
pub struct ModelSubscription<T> {
    initial: Option<Result<T, Arc<ModelError>>>,
    events: BroadcastStream<Result<T, Arc<ModelError>>>,
}

impl<T: Clone + Send + 'static> ModelSubscription<T> {
    pub(crate) fn new(seed: SubscriptionSeed<T>) -> Self {
        Self {
            initial: seed.initial,
            events: BroadcastStream::new(seed.receiver),
        }
    }
}

impl<T: Clone + Send + Unpin + 'static> Stream for ModelSubscription<T> {
    type Item = Result<T, Arc<ModelError>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(initial) = this.initial.take() {
            return Poll::Ready(Some(initial));
        }
        loop {
            match Pin::new(&mut this.events).poll_next(cx) {
                Poll::Ready(Some(Ok(item))) => return Poll::Ready(Some(item)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    // Skip to the newest state rather than erroring out.
                    tracing::debug!(skipped, "model subscriber lagged");
                },
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
