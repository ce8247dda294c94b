//! Broadcast subjects and the per-hub subject registry.
//!
//! A [`Subject`] fans every pushed value out to all observers that exist at
//! the time of the push. Late observers never see earlier values.

use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

/// Default number of values an observer may fall behind before it skips.
pub const DEFAULT_CAPACITY: usize = 64;

/// Multiplexing channel: one producer side, any number of live observers.
#[derive(Debug, Clone)]
pub struct Subject<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Subject<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Pushes a value to every current observer.
    ///
    /// A value pushed while nobody observes is dropped.
    pub fn next(&self, value: T) {
        let _ = self.tx.send(value);
    }

    /// Returns a stream of every value pushed after this call.
    ///
    /// The stream ends once the subject and all its clones are dropped.
    pub fn observe(&self) -> BoxStream<'static, T> {
        observe_receiver(self.tx.subscribe())
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub(crate) fn observe_receiver<T: Clone + Send + 'static>(
    rx: broadcast::Receiver<T>,
) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(value) => return Some((value, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Observer fell behind, skipping values");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// Returns the subject stored under `name`, creating it first if needed.
pub fn get_or_create<'a, T: Clone + Send + 'static>(
    registry: &'a mut HashMap<String, Subject<T>>,
    name: &str,
    capacity: usize,
) -> &'a Subject<T> {
    registry
        .entry(name.to_string())
        .or_insert_with(|| Subject::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let mut registry: HashMap<String, Subject<u32>> = HashMap::new();

        let first = get_or_create(&mut registry, "ReceiveMessage", 8).clone();
        let mut observer = first.observe();
        let second = get_or_create(&mut registry, "ReceiveMessage", 8).clone();
        assert_eq!(registry.len(), 1);

        // Both handles feed the same observer group
        second.next(7);
        assert_eq!(observer.next().now_or_never(), Some(Some(7)));
        assert_eq!(first.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_no_replay_for_late_observers() {
        let subject = Subject::new(8);
        let mut early = subject.observe();
        subject.next("first");

        let mut late = subject.observe();
        subject.next("second");

        assert_eq!(early.next().await, Some("first"));
        assert_eq!(early.next().await, Some("second"));
        assert_eq!(late.next().await, Some("second"));
    }

    #[tokio::test]
    async fn test_observer_ends_when_subject_dropped() {
        let subject = Subject::<u8>::new(4);
        let mut observer = subject.observe();
        drop(subject);
        assert_eq!(observer.next().await, None);
    }

    #[tokio::test]
    async fn test_lagging_observer_skips_oldest() {
        let subject = Subject::new(2);
        let mut observer = subject.observe();
        for i in 0..5 {
            subject.next(i);
        }
        assert_eq!(observer.next().await, Some(3));
        assert_eq!(observer.next().await, Some(4));
    }
}
