//! Single-outcome handles returned by hub operations.

use futures_channel::oneshot;
use futures_util::future::BoxFuture;
use futures_util::stream::{FusedStream, Stream, StreamExt};
use futures_util::FutureExt;
use std::future::IntoFuture;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::HubError;

/// The outcome of one asynchronous hub operation.
///
/// A `Completion` is a stream that yields exactly one item, `Ok(value)` or
/// the terminal `Err(error)`, and then ends. It can also be awaited
/// directly. Dropping it only discards the outcome: the operation itself
/// keeps running.
#[must_use = "a completion reports the outcome of its operation only when observed"]
pub struct Completion<T> {
    rx: Option<oneshot::Receiver<Result<T, HubError>>>,
}

/// Producer half of a [`Completion`].
pub(crate) struct Resolver<T> {
    tx: oneshot::Sender<Result<T, HubError>>,
}

impl<T> Resolver<T> {
    pub(crate) fn resolve(self, outcome: Result<T, HubError>) {
        let _ = self.tx.send(outcome);
    }
}

impl<T> Completion<T> {
    pub(crate) fn channel() -> (Resolver<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (Resolver { tx }, Self { rx: Some(rx) })
    }

    /// A completion that already carries its outcome.
    pub fn ready(outcome: Result<T, HubError>) -> Self {
        let (resolver, completion) = Self::channel();
        resolver.resolve(outcome);
        completion
    }

    /// A completion that fails with `error` without emitting a value.
    pub fn failed(error: HubError) -> Self {
        Self::ready(Err(error))
    }
}

impl<T> Stream for Completion<T> {
    type Item = Result<T, HubError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(None);
        };
        let outcome = match rx.poll_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(outcome)) => outcome,
            Poll::Ready(Err(oneshot::Canceled)) => Err(HubError::Canceled),
        };
        self.rx = None;
        Poll::Ready(Some(outcome))
    }
}

impl<T> FusedStream for Completion<T> {
    fn is_terminated(&self) -> bool {
        self.rx.is_none()
    }
}

impl<T: Send + 'static> IntoFuture for Completion<T> {
    type Output = Result<T, HubError>;
    type IntoFuture = BoxFuture<'static, Result<T, HubError>>;

    fn into_future(mut self) -> Self::IntoFuture {
        async move { self.next().await.unwrap_or(Err(HubError::Canceled)) }.boxed()
    }
}
