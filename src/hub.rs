//! Stream-based facade over one hub connection.
//!
//! [`Hub`] turns the callback-driven [`HubConnection`] into streams:
//! lifecycle operations and invocations return a [`Completion`], server
//! events are multiplexed by name into broadcast subjects, and server
//! streams are shared between subscribers.

use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::completion::Completion;
use crate::connection::{self, HubConnection, ItemStream};
use crate::error::HubError;
use crate::options::HubOptions;
use crate::shared::SharedStream;
use crate::status::ConnectionStatus;
use crate::subject::{get_or_create, Subject};

/// Builds the connection a hub wraps.
pub type ConnectionFactory = Arc<dyn Fn(&str, &HubOptions) -> Arc<dyn HubConnection> + Send + Sync>;

/// Decoded payloads of one server event. Items that fail to decode arrive
/// as `Err` without ending the stream.
pub type EventStream<T> = BoxStream<'static, Result<T, HubError>>;

/// Argument list of one server-to-client invocation.
type EventPayload = Arc<Vec<Value>>;

struct Channels {
    started: Subject<()>,
    stopped: Subject<()>,
    status: Subject<ConnectionStatus>,
    errors: Subject<Option<HubError>>,
}

#[derive(Default)]
struct HubState {
    connection: Option<Arc<dyn HubConnection>>,
    subjects: HashMap<String, Subject<EventPayload>>,
    /// Events whose forwarder is registered with the connection.
    attached: HashSet<String>,
}

/// A named hub exposed as streams.
///
/// The underlying connection is created lazily by the first `start`, `on`,
/// `stream` or `send_stream` call and reused afterwards. Operations spawn
/// their work on the tokio runtime and must be called from within it.
///
/// # Example
///
/// ```no_run
/// use futures_util::StreamExt;
/// use signalrr_rx::{Hub, HubOptions};
///
/// # async fn example() -> Result<(), signalrr_rx::HubError> {
/// let hub = Hub::new("chat", "http://localhost:5000/chathub", HubOptions::default());
/// let mut messages = hub.on::<(String, String)>("ReceiveMessage");
///
/// hub.start().await?;
/// hub.send("SendMessage", ("alice", "hello")).await?;
///
/// while let Some(Ok((user, text))) = messages.next().await {
///     println!("{user}: {text}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct Hub {
    name: String,
    url: String,
    options: HubOptions,
    factory: ConnectionFactory,
    state: Mutex<HubState>,
    channels: Arc<Channels>,
}

impl Hub {
    /// Creates a hub backed by [`WebSocketConnection`](crate::connection::WebSocketConnection).
    pub fn new(name: impl Into<String>, url: impl Into<String>, options: HubOptions) -> Self {
        Self::with_factory(name, url, options, connection::create_connection)
    }

    /// Creates a hub whose connection is built by `factory`.
    pub fn with_factory<F>(
        name: impl Into<String>,
        url: impl Into<String>,
        options: HubOptions,
        factory: F,
    ) -> Self
    where
        F: Fn(&str, &HubOptions) -> Arc<dyn HubConnection> + Send + Sync + 'static,
    {
        let capacity = options.event_capacity;
        Self {
            name: name.into(),
            url: url.into(),
            options,
            factory: Arc::new(factory),
            state: Mutex::new(HubState::default()),
            channels: Arc::new(Channels {
                started: Subject::new(capacity),
                stopped: Subject::new(capacity),
                status: Subject::new(capacity),
                errors: Subject::new(capacity),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn options(&self) -> &HubOptions {
        &self.options
    }

    /// Starts the connection.
    ///
    /// Each call gets its own completion. On success the start and
    /// `connected` notifications are broadcast before the completion
    /// resolves; on failure only the completion reports the error.
    pub fn start(&self) -> Completion<()> {
        let connection = self.ensure_connection();
        let channels = self.channels.clone();
        let hub = self.name.clone();
        let (resolver, completion) = Completion::channel();

        tokio::spawn(async move {
            let outcome = connection.start().await;
            match &outcome {
                Ok(()) => {
                    info!(%hub, "Hub connected");
                    channels.started.next(());
                    channels.status.next(ConnectionStatus::Connected);
                }
                Err(e) => warn!(%hub, error = %e, "Hub failed to start"),
            }
            resolver.resolve(outcome);
        });

        completion
    }

    /// Stops the connection. Fails with [`HubError::NotStarted`] when no
    /// connection exists yet.
    pub fn stop(&self) -> Completion<()> {
        let Some(connection) = self.connection() else {
            return Completion::failed(HubError::NotStarted);
        };
        let channels = self.channels.clone();
        let hub = self.name.clone();
        let (resolver, completion) = Completion::channel();

        tokio::spawn(async move {
            let outcome = connection.stop().await;
            match &outcome {
                Ok(()) => {
                    info!(%hub, "Hub stopped");
                    channels.stopped.next(());
                    channels.status.next(ConnectionStatus::Disconnected);
                }
                Err(e) => warn!(%hub, error = %e, "Hub failed to stop"),
            }
            resolver.resolve(outcome);
        });

        completion
    }

    /// Returns a live stream of the server event `event`, decoded as `T`.
    ///
    /// Event names match case-insensitively. All streams for the same event
    /// share one subject, and the connection forwards into it through a
    /// single registered handler. A payload with
    /// one argument decodes from that argument, one with several arguments
    /// decodes from their array (a tuple type fits), an empty one from `null`.
    pub fn on<T>(&self, event: &str) -> EventStream<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut state = self.state.lock();
        let connection = self.connection_in(&mut state);
        let key = event_key(event);
        let subject = get_or_create(&mut state.subjects, &key, self.options.event_capacity).clone();
        let observer = subject.observe();

        if state.attached.insert(key) {
            debug!(hub = %self.name, event, "Attaching event forwarder");
            connection.on(
                event,
                Arc::new(move |args: Vec<Value>| subject.next(Arc::new(args))),
            );
        }
        drop(state);

        observer.map(|args| decode_payload(&args)).boxed()
    }

    /// Detaches the connection handler for `event`.
    ///
    /// The subject stays registered: existing streams stay open and receive
    /// again after the next [`on`](Self::on) for the same event.
    pub fn off(&self, event: &str) -> Completion<()> {
        let mut state = self.state.lock();
        let Some(connection) = state.connection.clone() else {
            return Completion::failed(HubError::NotStarted);
        };
        connection.off(event);
        state.attached.remove(&event_key(event));
        debug!(hub = %self.name, event, "Detached event forwarder");
        Completion::ready(Ok(()))
    }

    /// Like [`off`](Self::off), and also drops the event's subject so that
    /// its streams end.
    pub fn release(&self, event: &str) -> Completion<()> {
        let mut state = self.state.lock();
        let Some(connection) = state.connection.clone() else {
            return Completion::failed(HubError::NotStarted);
        };
        let key = event_key(event);
        connection.off(event);
        state.attached.remove(&key);
        state.subjects.remove(&key);
        debug!(hub = %self.name, event, "Released event subject");
        Completion::ready(Ok(()))
    }

    /// Whether a subject exists for at least one event name.
    pub fn has_subscriptions(&self) -> bool {
        !self.state.lock().subjects.is_empty()
    }

    /// Invokes `method` without waiting for a result.
    ///
    /// `args` is the argument list: a tuple for several arguments, `()` for
    /// none, any other serializable value for a single one.
    pub fn send<A: Serialize>(&self, method: &str, args: A) -> Completion<()> {
        let Some(connection) = self.connection() else {
            return Completion::failed(HubError::NotStarted);
        };
        let args = match to_arguments(args) {
            Ok(args) => args,
            Err(e) => return Completion::failed(e),
        };
        let method = method.to_string();
        let (resolver, completion) = Completion::channel();

        tokio::spawn(async move {
            resolver.resolve(connection.send(&method, args).await);
        });

        completion
    }

    /// Invokes `method` and decodes its result as `R`.
    pub fn invoke<R, A>(&self, method: &str, args: A) -> Completion<R>
    where
        R: DeserializeOwned + Send + 'static,
        A: Serialize,
    {
        let Some(connection) = self.connection() else {
            return Completion::failed(HubError::NotStarted);
        };
        let args = match to_arguments(args) {
            Ok(args) => args,
            Err(e) => return Completion::failed(e),
        };
        let method = method.to_string();
        let (resolver, completion) = Completion::channel();

        tokio::spawn(async move {
            let outcome = connection
                .invoke(&method, args)
                .await
                .and_then(|value| serde_json::from_value(value).map_err(HubError::from));
            resolver.resolve(outcome);
        });

        completion
    }

    /// Prepares a server-to-client stream of `method`.
    ///
    /// The server stream opens on the first [`SharedStream::subscribe`] and
    /// is shared by every subscriber until it ends or the last one leaves.
    pub fn stream<T, A>(&self, method: &str, args: A) -> SharedStream<T>
    where
        T: DeserializeOwned + Send + 'static,
        A: Serialize,
    {
        let connection = self.ensure_connection();
        let args = to_arguments(args);
        let target = method.to_string();

        let open = move || -> BoxFuture<'static, Result<ItemStream, HubError>> {
            let connection = connection.clone();
            let target = target.clone();
            let args = args.clone();
            async move { connection.stream(&target, args?).await }.boxed()
        };

        SharedStream::new(method, self.options.event_capacity, Box::new(open))
    }

    /// Uploads `source` to `method` as a client-to-server stream.
    ///
    /// The completion resolves once the upload finished; it fails when an
    /// item does not serialize, when `source` yields an error (reported to
    /// the server as well) or when the transport fails.
    pub fn send_stream<T, E, S>(&self, method: &str, source: S) -> Completion<()>
    where
        T: Serialize + 'static,
        E: fmt::Display + 'static,
        S: Stream<Item = Result<T, E>> + Send + 'static,
    {
        let connection = self.ensure_connection();
        let method = method.to_string();
        let serialization_error = Arc::new(Mutex::new(None));
        let failed_item = serialization_error.clone();

        let items = source
            .map(move |item| match item {
                Ok(item) => serde_json::to_value(item).map_err(|e| {
                    let message = e.to_string();
                    *failed_item.lock() = Some(HubError::from(e));
                    message
                }),
                Err(e) => Err(e.to_string()),
            })
            .boxed();
        let (resolver, completion) = Completion::channel();

        tokio::spawn(async move {
            let outcome = connection.send_stream(&method, Vec::new(), items).await;
            let outcome = match (outcome, serialization_error.lock().take()) {
                (Err(HubError::Source(_)), Some(e)) => Err(e),
                (outcome, _) => outcome,
            };
            if let Err(e) = &outcome {
                warn!(%method, error = %e, "Client stream failed");
            }
            resolver.resolve(outcome);
        });

        completion
    }

    /// Successful starts.
    pub fn started(&self) -> BoxStream<'static, ()> {
        self.channels.started.observe()
    }

    /// Successful stops.
    pub fn stopped(&self) -> BoxStream<'static, ()> {
        self.channels.stopped.observe()
    }

    /// `connected` / `disconnected` transitions.
    pub fn status_changes(&self) -> BoxStream<'static, ConnectionStatus> {
        self.channels.status.observe()
    }

    /// Connection closures: the closing error, or `None` for a clean close.
    pub fn errors(&self) -> BoxStream<'static, Option<HubError>> {
        self.channels.errors.observe()
    }

    fn connection(&self) -> Option<Arc<dyn HubConnection>> {
        self.state.lock().connection.clone()
    }

    fn ensure_connection(&self) -> Arc<dyn HubConnection> {
        let mut state = self.state.lock();
        self.connection_in(&mut state)
    }

    fn connection_in(&self, state: &mut HubState) -> Arc<dyn HubConnection> {
        if let Some(connection) = &state.connection {
            return connection.clone();
        }

        debug!(hub = %self.name, url = %self.url, "Creating hub connection");
        let connection = (self.factory)(&self.url, &self.options);
        let channels = self.channels.clone();
        let hub = self.name.clone();
        connection.on_close(Arc::new(move |error: Option<HubError>| {
            match &error {
                Some(e) => warn!(%hub, error = %e, "Hub connection closed"),
                None => info!(%hub, "Hub connection closed"),
            }
            channels.errors.next(error);
            channels.status.next(ConnectionStatus::Disconnected);
        }));
        state.connection = Some(connection.clone());
        connection
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Hub")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("connected", &state.connection.is_some())
            .field("events", &state.subjects.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Registry key of an event. Hub method names are case-insensitive.
fn event_key(event: &str) -> String {
    event.to_lowercase()
}

/// Serializes `args` into a positional argument list.
fn to_arguments<A: Serialize>(args: A) -> Result<Vec<Value>, HubError> {
    Ok(match serde_json::to_value(args)? {
        Value::Array(args) => args,
        Value::Null => Vec::new(),
        arg => vec![arg],
    })
}

fn decode_payload<T: DeserializeOwned>(args: &[Value]) -> Result<T, HubError> {
    let value = match args {
        [] => Value::Null,
        [single] => single.clone(),
        many => Value::Array(many.to_vec()),
    };
    serde_json::from_value(value).map_err(HubError::from)
}
