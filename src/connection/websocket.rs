//! SignalR client connection over WebSocket.
//!
//! This module handles the connection lifecycle:
//! - negotiation and the WebSocket upgrade,
//! - the protocol handshake,
//! - a reader task routing hub messages through the [`MessageBus`],
//! - a writer task sending frames and keep-alive pings,
//! - graceful shutdown and close notification.

use async_trait::async_trait;
use futures_channel::mpsc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::bus::MessageBus;
use super::{
    CloseHandler, ConnectionState, EventHandler, HubConnection, ItemStream, UploadStream,
};
use crate::error::HubError;
use crate::negotiate::{negotiate, Negotiated};
use crate::options::HubOptions;
use crate::protocol::{Frame, HandshakeRequest, HandshakeResponse, MessagePackCodec, ProtocolError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Sent to the server when it expects a result we cannot produce.
const NO_CLIENT_RESULT: &str = "Client didn't provide a result.";

enum Outbound {
    Frame(Frame),
    Shutdown,
}

/// Handles of a live session.
struct Link {
    outgoing: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
}

struct Inner {
    hub_url: String,
    options: HubOptions,
    state: Mutex<ConnectionState>,
    bus: MessageBus,
    close_handlers: Mutex<Vec<CloseHandler>>,
    link: Mutex<Option<Link>>,
    next_id: AtomicU64,
}

/// A SignalR hub connection using the MessagePack protocol over WebSocket.
///
/// # Example
///
/// ```no_run
/// use signalrr_rx::connection::{HubConnection, WebSocketConnection};
/// use signalrr_rx::HubOptions;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let conn = WebSocketConnection::new("http://localhost:5000/chathub", HubOptions::default());
/// conn.start().await?;
/// conn.send("SendMessage", vec!["user".into(), "hello".into()]).await?;
/// conn.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WebSocketConnection {
    inner: Arc<Inner>,
}

impl WebSocketConnection {
    /// Creates a connection. Nothing is sent until [`HubConnection::start`].
    pub fn new(hub_url: &str, options: HubOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                hub_url: hub_url.to_string(),
                options,
                state: Mutex::new(ConnectionState::Disconnected),
                bus: MessageBus::new(),
                close_handlers: Mutex::new(Vec::new()),
                link: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn hub_url(&self) -> &str {
        &self.inner.hub_url
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    async fn connect(&self) -> Result<(), HubError> {
        let options = &self.inner.options;
        let hub_url = Url::parse(&self.inner.hub_url)?;

        let negotiated = if options.skip_negotiation {
            Negotiated {
                url: hub_url,
                connection_token: None,
                access_token: options.access_token.clone(),
            }
        } else {
            negotiate(&hub_url, options).await?
        };

        let ws_url = websocket_url(&negotiated)?;
        debug!(%ws_url, "Opening WebSocket");

        let mut request = ws_url.as_str().into_client_request()?;
        for (name, value) in &options.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| HubError::InvalidHeader(name.clone()))?;
            let header_value =
                HeaderValue::from_str(value).map_err(|_| HubError::InvalidHeader(name.clone()))?;
            request.headers_mut().insert(header_name, header_value);
        }
        if let Some(token) = &negotiated.access_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| HubError::InvalidHeader(header::AUTHORIZATION.to_string()))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let (ws_stream, _) = connect_async(request).await?;
        let (mut sink, mut stream) = ws_stream.split();

        let leftover = perform_handshake(&mut sink, &mut stream, options).await?;

        let (outgoing, outgoing_rx) = mpsc::unbounded();
        *self.inner.state.lock() = ConnectionState::Connected;

        tokio::spawn(write_loop(sink, outgoing_rx, options.keep_alive_interval));
        let reader = tokio::spawn(read_loop(
            self.inner.clone(),
            stream,
            leftover,
            outgoing.clone(),
        ));
        *self.inner.link.lock() = Some(Link { outgoing, reader });

        Ok(())
    }

    fn next_id(&self) -> String {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

#[async_trait]
impl HubConnection for WebSocketConnection {
    async fn start(&self) -> Result<(), HubError> {
        {
            let mut state = self.inner.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(HubError::InvalidState(format!(
                    "cannot start a connection that is {:?}",
                    *state
                )));
            }
            *state = ConnectionState::Connecting;
        }

        match self.connect().await {
            Ok(()) => {
                info!(hub_url = %self.inner.hub_url, "Connection started");
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock() = ConnectionState::Disconnected;
                warn!(hub_url = %self.inner.hub_url, error = %e, "Failed to start connection");
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<(), HubError> {
        let link = {
            let mut state = self.inner.state.lock();
            match *state {
                ConnectionState::Disconnected | ConnectionState::Disconnecting => return Ok(()),
                ConnectionState::Connecting => {
                    return Err(HubError::InvalidState(
                        "cannot stop a connection while it is starting".to_string(),
                    ))
                }
                ConnectionState::Connected => *state = ConnectionState::Disconnecting,
            }
            self.inner.link.lock().take()
        };

        let Some(Link {
            outgoing,
            mut reader,
        }) = link
        else {
            return Ok(());
        };

        let _ = outgoing.unbounded_send(Outbound::Shutdown);
        let timeout = self.inner.options.handshake_timeout;
        if tokio::time::timeout(timeout, &mut reader).await.is_err() {
            warn!("Server did not acknowledge the close, dropping the connection");
            reader.abort();
            self.inner.finish(None);
        }
        Ok(())
    }

    fn on(&self, event: &str, handler: EventHandler) {
        self.inner.bus.register_handler(event, handler);
    }

    fn off(&self, event: &str) {
        self.inner.bus.remove_handlers(event);
    }

    fn on_close(&self, handler: CloseHandler) {
        self.inner.close_handlers.lock().push(handler);
    }

    async fn send(&self, method: &str, args: Vec<Value>) -> Result<(), HubError> {
        self.inner.post(Frame::Invocation {
            invocation_id: None,
            target: method.to_string(),
            arguments: args,
            stream_ids: Vec::new(),
        })
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError> {
        let id = self.next_id();
        let rx = self.inner.bus.register_pending(&id);
        let posted = self.inner.post(Frame::Invocation {
            invocation_id: Some(id.clone()),
            target: method.to_string(),
            arguments: args,
            stream_ids: Vec::new(),
        });
        if let Err(e) = posted {
            self.inner.bus.remove_pending(&id);
            return Err(e);
        }

        rx.await.unwrap_or_else(|_| {
            Err(HubError::ConnectionClosed(
                "invocation dropped before completion".to_string(),
            ))
        })
    }

    async fn stream(&self, method: &str, args: Vec<Value>) -> Result<ItemStream, HubError> {
        let id = self.next_id();
        let rx = self.inner.bus.register_stream(&id);
        let posted = self.inner.post(Frame::StreamInvocation {
            invocation_id: id.clone(),
            target: method.to_string(),
            arguments: args,
            stream_ids: Vec::new(),
        });
        if let Err(e) = posted {
            self.inner.bus.remove_pending(&id);
            return Err(e);
        }

        Ok(ServerStream {
            inner: self.inner.clone(),
            id,
            rx,
            done: false,
        }
        .boxed())
    }

    async fn send_stream(
        &self,
        method: &str,
        args: Vec<Value>,
        mut items: UploadStream,
    ) -> Result<(), HubError> {
        let stream_id = self.next_id();
        self.inner.post(Frame::Invocation {
            invocation_id: None,
            target: method.to_string(),
            arguments: args,
            stream_ids: vec![stream_id.clone()],
        })?;

        while let Some(item) = items.next().await {
            match item {
                Ok(value) => self.inner.post(Frame::StreamItem {
                    invocation_id: stream_id.clone(),
                    item: value,
                })?,
                Err(message) => {
                    self.inner.post(Frame::Completion {
                        invocation_id: stream_id,
                        result: None,
                        error: Some(message.clone()),
                    })?;
                    return Err(HubError::Source(message));
                }
            }
        }

        self.inner.post(Frame::Completion {
            invocation_id: stream_id,
            result: None,
            error: None,
        })
    }
}

impl Inner {
    /// Queues a frame for the writer task.
    fn post(&self, frame: Frame) -> Result<(), HubError> {
        if *self.state.lock() != ConnectionState::Connected {
            return Err(HubError::NotConnected);
        }
        let link = self.link.lock();
        let link = link.as_ref().ok_or(HubError::NotConnected)?;
        link.outgoing
            .unbounded_send(Outbound::Frame(frame))
            .map_err(|_| HubError::NotConnected)
    }

    /// Routes every message of one WebSocket frame.
    ///
    /// Returns `Some` when the server asked to close the connection.
    fn handle_data(
        &self,
        data: &[u8],
        outgoing: &mpsc::UnboundedSender<Outbound>,
    ) -> Result<Option<Option<HubError>>, ProtocolError> {
        for frame in MessagePackCodec::decode(data)? {
            match frame {
                Frame::Invocation {
                    invocation_id,
                    target,
                    arguments,
                    ..
                } => {
                    self.bus.dispatch_invocation(&target, arguments);
                    if let Some(id) = invocation_id {
                        warn!(method = %target, "Server expected a client result, which is not supported");
                        let _ = outgoing.unbounded_send(Outbound::Frame(Frame::Completion {
                            invocation_id: id,
                            result: None,
                            error: Some(NO_CLIENT_RESULT.to_string()),
                        }));
                    }
                }
                Frame::StreamItem {
                    invocation_id,
                    item,
                } => self.bus.send_stream_item(&invocation_id, item),
                Frame::Completion {
                    invocation_id,
                    result,
                    error,
                } => {
                    let outcome = match error {
                        Some(message) => Err(HubError::Server(message)),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    self.bus.complete_invocation(&invocation_id, outcome);
                }
                Frame::Ping => {}
                Frame::Close { error, .. } => {
                    debug!(?error, "Server sent Close");
                    return Ok(Some(error.map(|e| {
                        HubError::ConnectionClosed(format!("Server returned an error on close: {e}"))
                    })));
                }
                Frame::StreamInvocation { .. } | Frame::CancelInvocation { .. } => {
                    debug!("Ignoring client-to-server message received from server");
                }
            }
        }
        Ok(None)
    }

    /// Tears the session down once the reader has stopped.
    fn finish(&self, error: Option<HubError>) {
        let requested = {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                return;
            }
            let requested = *state == ConnectionState::Disconnecting;
            *state = ConnectionState::Disconnected;
            requested
        };
        if let Some(link) = self.link.lock().take() {
            let _ = link.outgoing.unbounded_send(Outbound::Shutdown);
        }

        let error = if requested { None } else { error };
        match &error {
            Some(e) => warn!(hub_url = %self.hub_url, error = %e, "Connection closed with an error"),
            None => info!(hub_url = %self.hub_url, "Connection closed"),
        }

        let pending_error = error.clone().unwrap_or_else(|| {
            HubError::ConnectionClosed(
                "invocation canceled because the connection was closed".to_string(),
            )
        });
        self.bus.fail_all(&pending_error);

        let handlers = self.close_handlers.lock().clone();
        for handler in handlers {
            handler(error.clone());
        }
    }
}

/// Derives the WebSocket endpoint from the negotiated hub URL.
pub(crate) fn websocket_url(negotiated: &Negotiated) -> Result<Url, HubError> {
    let mut url = negotiated.url.clone();
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(HubError::InvalidState(format!(
                "unsupported URL scheme `{other}`"
            )))
        }
    };
    if url.set_scheme(scheme).is_err() {
        return Err(HubError::InvalidState(format!(
            "cannot use scheme `{scheme}` for {url}"
        )));
    }
    url.set_fragment(None);

    if let Some(token) = &negotiated.connection_token {
        url.query_pairs_mut().append_pair("id", token);
    }
    if let Some(token) = &negotiated.access_token {
        url.query_pairs_mut().append_pair("access_token", token);
    }
    Ok(url)
}

/// Performs the SignalR handshake.
///
/// Sends a `HandshakeRequest` and waits for the `HandshakeResponse`. Returns
/// any bytes the server sent after the response.
async fn perform_handshake(
    sink: &mut SplitSink<WsStream, Message>,
    stream: &mut SplitStream<WsStream>,
    options: &HubOptions,
) -> Result<Vec<u8>, HubError> {
    let request = HandshakeRequest::messagepack().to_text()?;
    sink.send(Message::Text(request)).await?;
    debug!("Handshake sent");

    let timeout = tokio::time::sleep(options.handshake_timeout);
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            msg = stream.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(close_frame))) => {
                        let reason = close_frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        return Err(HubError::HandshakeFailed(format!("Connection closed: {reason}")));
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(HubError::HandshakeFailed("Connection closed".to_string())),
                };
                let (response, rest) = HandshakeResponse::parse(&data)?;
                if let Some(error) = response.error {
                    return Err(HubError::HandshakeFailed(error));
                }
                debug!("Handshake response received");
                return Ok(rest.to_vec());
            }
            _ = &mut timeout => {
                return Err(HubError::HandshakeFailed("Handshake timeout".to_string()));
            }
        }
    }
}

/// Ping ticker firing one `interval` from now, or `None` when pings are off.
fn keep_alive_ticker(interval: Duration) -> Option<Interval> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::time::interval_at(Instant::now() + interval, interval))
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Awaits `future` for at most `limit`. A zero limit waits indefinitely.
async fn within<F: Future>(limit: Duration, future: F) -> Result<F::Output, Elapsed> {
    if limit.is_zero() {
        Ok(future.await)
    } else {
        tokio::time::timeout(limit, future).await
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outgoing: mpsc::UnboundedReceiver<Outbound>,
    keep_alive: Duration,
) {
    let mut ticker = keep_alive_ticker(keep_alive);

    loop {
        let frame = tokio::select! {
            outbound = outgoing.next() => match outbound {
                Some(Outbound::Frame(frame)) => frame,
                Some(Outbound::Shutdown) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = next_tick(&mut ticker) => Frame::Ping,
        };

        let payload = match MessagePackCodec::encode(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Dropping frame that failed to encode");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Binary(payload)).await {
            debug!(error = %e, "WebSocket write failed");
            break;
        }
        if let Some(ticker) = ticker.as_mut() {
            ticker.reset();
        }
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    mut stream: SplitStream<WsStream>,
    leftover: Vec<u8>,
    outgoing: mpsc::UnboundedSender<Outbound>,
) {
    let server_timeout = inner.options.server_timeout;

    if !leftover.is_empty() {
        match inner.handle_data(&leftover, &outgoing) {
            Ok(None) => {}
            Ok(Some(error)) => return inner.finish(error),
            Err(e) => warn!(error = %e, "Failed to decode message"),
        }
    }

    let error = loop {
        let msg = match within(server_timeout, stream.next()).await {
            Ok(msg) => msg,
            Err(_) => break Some(HubError::ServerTimeout),
        };
        match msg {
            Some(Ok(Message::Binary(data))) => match inner.handle_data(&data, &outgoing) {
                Ok(None) => {}
                Ok(Some(error)) => break error,
                Err(e) => warn!(error = %e, "Failed to decode message"),
            },
            Some(Ok(Message::Close(close_frame))) => {
                break match close_frame {
                    Some(frame) if frame.code != CloseCode::Normal => Some(HubError::ConnectionClosed(
                        format!("WebSocket closed with status code {}: {}", frame.code, frame.reason),
                    )),
                    _ => None,
                };
            }
            // Text frames carry nothing for the MessagePack protocol
            Some(Ok(_)) => {}
            Some(Err(e)) => break Some(e.into()),
            None => {
                break Some(HubError::ConnectionClosed(
                    "WebSocket stream ended".to_string(),
                ))
            }
        }
    };

    inner.finish(error);
}

/// Server-to-client stream; dropping it early cancels the invocation.
struct ServerStream {
    inner: Arc<Inner>,
    id: String,
    rx: mpsc::UnboundedReceiver<Result<Value, HubError>>,
    done: bool,
}

impl Stream for ServerStream {
    type Item = Result<Value, HubError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        let polled = self.rx.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(None) | Poll::Ready(Some(Err(_))) => self.done = true,
            _ => {}
        }
        polled
    }
}

impl Drop for ServerStream {
    fn drop(&mut self) {
        if self.done || !self.inner.bus.remove_pending(&self.id) {
            return;
        }
        debug!(invocation_id = %self.id, "Canceling server stream");
        let _ = self.inner.post(Frame::CancelInvocation {
            invocation_id: self.id.clone(),
        });
    }
}
