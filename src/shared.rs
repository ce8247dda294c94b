//! Ref-counted sharing of one server stream between many subscribers.
//!
//! The first subscriber opens the upstream. Subscribers receive the items
//! pushed after they joined, never earlier ones. When the last subscriber
//! goes away the upstream is dropped, which cancels it on the server. A
//! subscriber arriving after the upstream finished opens a new one.

use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::ItemStream;
use crate::error::HubError;
use crate::subject::observe_receiver;

/// Opens a fresh upstream each time a new session starts.
pub(crate) type Opener = Box<dyn Fn() -> BoxFuture<'static, Result<ItemStream, HubError>> + Send + Sync>;

#[derive(Debug, Clone)]
enum Signal {
    Item(Value),
    Failed(HubError),
    Completed,
}

struct Session {
    id: u64,
    tx: broadcast::Sender<Signal>,
    subscribers: usize,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct ShareState {
    session: Option<Session>,
    next_session: u64,
}

struct Shared {
    method: String,
    state: Mutex<ShareState>,
    open: Opener,
    capacity: usize,
}

/// A server-to-client stream shared by every subscriber.
///
/// Returned by [`Hub::stream`](crate::Hub::stream). Cloning the handle is
/// cheap and clones observe the same upstream.
pub struct SharedStream<T> {
    shared: Arc<Shared>,
    marker: PhantomData<fn() -> T>,
}

impl<T> Clone for SharedStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned + Send + 'static> SharedStream<T> {
    pub(crate) fn new(method: &str, capacity: usize, open: Opener) -> Self {
        Self {
            shared: Arc::new(Shared {
                method: method.to_string(),
                state: Mutex::new(ShareState::default()),
                open,
                capacity: capacity.max(1),
            }),
            marker: PhantomData,
        }
    }

    /// Joins the shared upstream, opening it if nobody is subscribed.
    ///
    /// The returned stream yields decoded items, ends when the server
    /// completes the stream and ends with `Err` when it fails.
    pub fn subscribe(&self) -> BoxStream<'static, Result<T, HubError>> {
        let (rx, session_id) = self.join();
        let guard = Subscriber {
            shared: self.shared.clone(),
            session_id,
        };

        let signals = observe_receiver(rx);
        stream::unfold(
            (signals, guard, false),
            |(mut signals, guard, failed)| async move {
                // Nothing follows a terminal error
                if failed {
                    return None;
                }
                match signals.next().await? {
                    Signal::Item(value) => {
                        let item = serde_json::from_value(value).map_err(HubError::from);
                        Some((item, (signals, guard, false)))
                    }
                    Signal::Failed(error) => Some((Err(error), (signals, guard, true))),
                    Signal::Completed => None,
                }
            },
        )
        .boxed()
    }

    /// Number of subscribers attached to the running upstream.
    pub fn subscriber_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .session
            .as_ref()
            .map_or(0, |session| session.subscribers)
    }

    fn join(&self) -> (broadcast::Receiver<Signal>, u64) {
        let mut state = self.shared.state.lock();
        if let Some(session) = state.session.as_mut() {
            session.subscribers += 1;
            return (session.tx.subscribe(), session.id);
        }

        let id = state.next_session;
        state.next_session += 1;
        let (tx, rx) = broadcast::channel(self.shared.capacity);
        debug!(method = %self.shared.method, session = id, "Opening shared server stream");
        let pump = tokio::spawn(pump(
            Arc::downgrade(&self.shared),
            id,
            (self.shared.open)(),
            tx.clone(),
        ));
        state.session = Some(Session {
            id,
            tx,
            subscribers: 1,
            pump,
        });
        (rx, id)
    }
}

impl Shared {
    /// Ends the session and delivers its terminal signal to every subscriber.
    fn finish(&self, session_id: u64, terminal: Signal) {
        let mut state = self.state.lock();
        if state.session.as_ref().map(|s| s.id) != Some(session_id) {
            return;
        }
        if let Some(session) = state.session.take() {
            let _ = session.tx.send(terminal);
        }
    }

    fn leave(&self, session_id: u64) {
        let mut state = self.state.lock();
        let Some(session) = state.session.as_mut() else {
            return;
        };
        if session.id != session_id {
            return;
        }
        session.subscribers -= 1;
        if session.subscribers == 0 {
            debug!(method = %self.method, session = session_id, "Last subscriber left, disposing server stream");
            state.session = None;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump(
    shared: Weak<Shared>,
    session_id: u64,
    open: BoxFuture<'static, Result<ItemStream, HubError>>,
    tx: broadcast::Sender<Signal>,
) {
    let terminal = match open.await {
        Ok(mut upstream) => loop {
            match upstream.next().await {
                Some(Ok(value)) => {
                    let _ = tx.send(Signal::Item(value));
                }
                Some(Err(error)) => break Signal::Failed(error),
                None => break Signal::Completed,
            }
        },
        Err(error) => Signal::Failed(error),
    };

    if let Some(shared) = shared.upgrade() {
        shared.finish(session_id, terminal);
    }
}

/// Detaches one subscriber when its stream is dropped.
struct Subscriber {
    shared: Arc<Shared>,
    session_id: u64,
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.shared.leave(self.session_id);
    }
}
