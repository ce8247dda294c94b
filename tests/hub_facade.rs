use async_trait::async_trait;
use futures_channel::mpsc;
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signalrr_rx::connection::{CloseHandler, EventHandler, ItemStream, UploadStream};
use signalrr_rx::{create_connection, ConnectionStatus, Hub, HubConnection, HubError, HubOptions};

type Hook = Box<dyn FnOnce() + Send>;

/// In-memory connection recording everything the hub asks of it. Event
/// names match case-insensitively, like the WebSocket connection.
#[derive(Default)]
struct FakeConnection {
    handlers: Mutex<HashMap<String, Vec<EventHandler>>>,
    close_handlers: Mutex<Vec<CloseHandler>>,
    start_error: Mutex<Option<HubError>>,
    registrations: AtomicUsize,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    results: Mutex<HashMap<String, Value>>,
    upstreams: Mutex<Vec<mpsc::UnboundedSender<Result<Value, HubError>>>>,
    uploads: Mutex<Vec<Value>>,
    /// Runs inside `stop`, right after the close handlers.
    after_close: Mutex<Option<Hook>>,
}

impl FakeConnection {
    fn emit(&self, event: &str, args: Vec<Value>) {
        let handlers = self
            .handlers
            .lock()
            .get(&event.to_lowercase())
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(args.clone());
        }
    }

    fn close(&self, error: Option<HubError>) {
        let handlers = self.close_handlers.lock().clone();
        for handler in handlers {
            handler(error.clone());
        }
    }

    fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    fn upstream(&self, index: usize) -> mpsc::UnboundedSender<Result<Value, HubError>> {
        self.upstreams.lock()[index].clone()
    }
}

#[async_trait]
impl HubConnection for FakeConnection {
    async fn start(&self) -> Result<(), HubError> {
        match self.start_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn stop(&self) -> Result<(), HubError> {
        self.close(None);
        if let Some(hook) = self.after_close.lock().take() {
            hook();
        }
        Ok(())
    }

    fn on(&self, event: &str, handler: EventHandler) {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .lock()
            .entry(event.to_lowercase())
            .or_default()
            .push(handler);
    }

    fn off(&self, event: &str) {
        self.handlers.lock().remove(&event.to_lowercase());
    }

    fn on_close(&self, handler: CloseHandler) {
        self.close_handlers.lock().push(handler);
    }

    async fn send(&self, method: &str, args: Vec<Value>) -> Result<(), HubError> {
        self.calls.lock().push((method.to_string(), args));
        Ok(())
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError> {
        self.calls.lock().push((method.to_string(), args));
        Ok(self.results.lock().get(method).cloned().unwrap_or(Value::Null))
    }

    async fn stream(&self, method: &str, args: Vec<Value>) -> Result<ItemStream, HubError> {
        self.calls.lock().push((method.to_string(), args));
        let (tx, rx) = mpsc::unbounded();
        self.upstreams.lock().push(tx);
        Ok(rx.boxed())
    }

    async fn send_stream(
        &self,
        method: &str,
        args: Vec<Value>,
        mut items: UploadStream,
    ) -> Result<(), HubError> {
        self.calls.lock().push((method.to_string(), args));
        while let Some(item) = items.next().await {
            match item {
                Ok(value) => self.uploads.lock().push(value),
                Err(message) => return Err(HubError::Source(message)),
            }
        }
        Ok(())
    }
}

fn hub_with_fake() -> (Hub, Arc<FakeConnection>) {
    let fake = Arc::new(FakeConnection::default());
    let connection = fake.clone();
    let hub = Hub::with_factory(
        "chat",
        "http://localhost:5000/chathub",
        HubOptions::default(),
        move |_, _| connection.clone() as Arc<dyn HubConnection>,
    );
    (hub, fake)
}

async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_on_twice_shares_one_forwarder() {
    let (hub, fake) = hub_with_fake();

    let mut first = hub.on::<String>("News");
    let mut second = hub.on::<String>("News");
    assert_eq!(fake.registrations(), 1);

    fake.emit("News", vec![json!("hello")]);
    assert_eq!(first.next().await.unwrap().unwrap(), "hello");
    assert_eq!(second.next().await.unwrap().unwrap(), "hello");
}

#[tokio::test]
async fn test_has_subscriptions() {
    let (hub, _fake) = hub_with_fake();
    assert!(!hub.has_subscriptions());

    let _news = hub.on::<String>("News");
    assert!(hub.has_subscriptions());
}

#[tokio::test]
async fn test_operations_before_start_fail_with_not_started() {
    let (hub, fake) = hub_with_fake();

    let stopped: Vec<_> = hub.stop().collect().await;
    assert_eq!(stopped.len(), 1);
    assert!(matches!(stopped[0], Err(HubError::NotStarted)));

    assert!(matches!(hub.off("News").await, Err(HubError::NotStarted)));
    assert!(matches!(hub.send("Ping", ()).await, Err(HubError::NotStarted)));
    assert!(matches!(
        hub.invoke::<Value, _>("Add", (1, 2)).await,
        Err(HubError::NotStarted)
    ));
    assert!(fake.calls.lock().is_empty());
}

#[tokio::test]
async fn test_start_broadcasts_started_and_connected() {
    let (hub, _fake) = hub_with_fake();
    let mut started = hub.started();
    let mut status = hub.status_changes();

    hub.start().await.unwrap();

    assert_eq!(started.next().now_or_never(), Some(Some(())));
    assert_eq!(
        status.next().now_or_never(),
        Some(Some(ConnectionStatus::Connected))
    );
}

#[tokio::test]
async fn test_start_failure_reaches_only_the_caller() {
    let (hub, fake) = hub_with_fake();
    *fake.start_error.lock() = Some(HubError::HandshakeFailed("nope".to_string()));
    let mut started = hub.started();
    let mut status = hub.status_changes();

    let outcome = hub.start().await;
    assert!(matches!(outcome, Err(HubError::HandshakeFailed(message)) if message == "nope"));

    assert!(started.next().now_or_never().is_none());
    assert!(status.next().now_or_never().is_none());
}

#[tokio::test]
async fn test_each_start_gets_its_own_completion() {
    let (hub, _fake) = hub_with_fake();

    let first = hub.start();
    let second = hub.start();
    assert!(first.await.is_ok());
    assert!(second.await.is_ok());
}

#[tokio::test]
async fn test_connection_close_reports_error_then_disconnected() {
    let (hub, fake) = hub_with_fake();
    hub.start().await.unwrap();

    let mut errors = hub.errors();
    let mut status = hub.status_changes();
    fake.close(Some(HubError::ConnectionClosed("reset".to_string())));

    assert!(matches!(
        errors.next().await,
        Some(Some(HubError::ConnectionClosed(message))) if message == "reset"
    ));
    assert_eq!(status.next().await, Some(ConnectionStatus::Disconnected));
}

#[tokio::test]
async fn test_stop_reports_clean_close_before_stopped() {
    let (hub, fake) = hub_with_fake();
    hub.start().await.unwrap();

    let observers = Arc::new(Mutex::new((hub.errors(), hub.status_changes(), hub.stopped())));
    let at_close = Arc::new(Mutex::new(None));
    {
        let observers = observers.clone();
        let at_close = at_close.clone();
        *fake.after_close.lock() = Some(Box::new(move || {
            let (errors, status, stopped) = &mut *observers.lock();
            *at_close.lock() = Some((
                errors.next().now_or_never(),
                status.next().now_or_never(),
                stopped.next().now_or_never(),
            ));
        }));
    }

    hub.stop().await.unwrap();

    // The close handler reports first: a clean close, then disconnected
    let (error, status, stopped) = at_close.lock().take().unwrap();
    assert!(matches!(error, Some(Some(None))));
    assert_eq!(status, Some(Some(ConnectionStatus::Disconnected)));
    assert!(stopped.is_none());

    // Then the stop itself: stopped, and disconnected once more
    let (errors, status, stopped) = &mut *observers.lock();
    assert_eq!(stopped.next().now_or_never(), Some(Some(())));
    assert_eq!(
        status.next().now_or_never(),
        Some(Some(ConnectionStatus::Disconnected))
    );
    assert!(status.next().now_or_never().is_none());
    assert!(errors.next().now_or_never().is_none());
}

#[tokio::test]
async fn test_stream_is_shared_and_disposed_with_last_subscriber() {
    let (hub, fake) = hub_with_fake();
    hub.start().await.unwrap();

    let counter = hub.stream::<u32, _>("Counter", (10, 500));
    let mut first = counter.subscribe();
    wait_for(|| fake.upstreams.lock().len() == 1).await;
    let upstream = fake.upstream(0);

    upstream.unbounded_send(Ok(json!(1))).unwrap();
    assert_eq!(first.next().await.unwrap().unwrap(), 1);

    let mut second = counter.subscribe();
    upstream.unbounded_send(Ok(json!(2))).unwrap();
    assert_eq!(first.next().await.unwrap().unwrap(), 2);
    assert_eq!(second.next().await.unwrap().unwrap(), 2);

    assert_eq!(fake.upstreams.lock().len(), 1);
    assert_eq!(
        fake.calls.lock()[0],
        ("Counter".to_string(), vec![json!(10), json!(500)])
    );

    drop(first);
    drop(second);
    wait_for(|| upstream.is_closed()).await;
}

#[tokio::test]
async fn test_invoke_decodes_result() {
    let (hub, fake) = hub_with_fake();
    fake.results.lock().insert("Add".to_string(), json!(3));
    hub.start().await.unwrap();

    let sum: i64 = hub.invoke("Add", (1, 2)).await.unwrap();
    assert_eq!(sum, 3);
    assert_eq!(
        fake.calls.lock()[0],
        ("Add".to_string(), vec![json!(1), json!(2)])
    );
}

#[tokio::test]
async fn test_send_records_arguments() {
    let (hub, fake) = hub_with_fake();
    hub.start().await.unwrap();

    hub.send("SendMessage", ("alice", "hi")).await.unwrap();
    assert_eq!(
        fake.calls.lock().as_slice(),
        &[(
            "SendMessage".to_string(),
            vec![json!("alice"), json!("hi")]
        )]
    );
}

#[tokio::test]
async fn test_send_stream_uploads_every_item() {
    let (hub, fake) = hub_with_fake();

    let source = stream::iter(vec![Ok::<_, String>(1), Ok(2), Ok(3)]);
    hub.send_stream("Upload", source).await.unwrap();

    assert_eq!(
        fake.uploads.lock().as_slice(),
        &[json!(1), json!(2), json!(3)]
    );
}

#[tokio::test]
async fn test_send_stream_surfaces_source_error() {
    let (hub, fake) = hub_with_fake();

    let source = stream::iter(vec![Ok(1), Err("broken".to_string())]);
    let outcome = hub.send_stream("Upload", source).await;

    assert!(matches!(outcome, Err(HubError::Source(message)) if message == "broken"));
    assert_eq!(fake.uploads.lock().as_slice(), &[json!(1)]);
}

#[tokio::test]
async fn test_off_then_on_reattaches_existing_streams() {
    let (hub, fake) = hub_with_fake();
    hub.start().await.unwrap();

    let mut news = hub.on::<String>("News");
    hub.off("News").await.unwrap();

    fake.emit("News", vec![json!("missed")]);
    assert!(news.next().now_or_never().is_none());

    let _again = hub.on::<String>("News");
    assert_eq!(fake.registrations(), 2);

    fake.emit("News", vec![json!("back")]);
    assert_eq!(news.next().await.unwrap().unwrap(), "back");
}

#[tokio::test]
async fn test_release_ends_event_streams() {
    let (hub, _fake) = hub_with_fake();
    hub.start().await.unwrap();

    let mut news = hub.on::<String>("News");
    hub.release("News").await.unwrap();

    assert!(news.next().await.is_none());
    assert!(!hub.has_subscriptions());
}

#[tokio::test]
async fn test_undecodable_payload_does_not_end_stream() {
    let (hub, fake) = hub_with_fake();
    let mut ticks = hub.on::<u32>("Tick");

    fake.emit("Tick", vec![json!("oops")]);
    fake.emit("Tick", vec![json!(5)]);

    assert!(matches!(ticks.next().await, Some(Err(HubError::Serialization(_)))));
    assert_eq!(ticks.next().await.unwrap().unwrap(), 5);
}

#[tokio::test]
async fn test_multi_argument_event_decodes_as_tuple() {
    let (hub, fake) = hub_with_fake();
    let mut messages = hub.on::<(String, String)>("ReceiveMessage");

    fake.emit("ReceiveMessage", vec![json!("alice"), json!("hello")]);
    assert_eq!(
        messages.next().await.unwrap().unwrap(),
        ("alice".to_string(), "hello".to_string())
    );
}

#[tokio::test]
async fn test_off_matches_event_names_case_insensitively() {
    let (hub, fake) = hub_with_fake();
    hub.start().await.unwrap();

    let mut upper = hub.on::<String>("News");
    let mut lower = hub.on::<String>("news");
    assert_eq!(fake.registrations(), 1);

    hub.off("news").await.unwrap();
    let _again = hub.on::<String>("News");
    assert_eq!(fake.registrations(), 2);

    fake.emit("News", vec![json!("back")]);
    assert_eq!(upper.next().await.unwrap().unwrap(), "back");
    assert_eq!(lower.next().await.unwrap().unwrap(), "back");

    hub.release("NEWS").await.unwrap();
    assert!(!hub.has_subscriptions());
    assert!(upper.next().await.is_none());
}

#[tokio::test]
async fn test_default_connection_is_built_without_network_activity() {
    // Nothing listens on this address; construction and subscription must not touch it
    let hub = Hub::new("chat", "http://127.0.0.1:9/chathub", HubOptions::default());
    assert!(!hub.has_subscriptions());

    let _news = hub.on::<String>("News");
    assert!(hub.has_subscriptions());

    // A connection that never started stops cleanly
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_default_connection_rejects_malformed_url_on_start() {
    let hub = Hub::new("chat", "not a url", HubOptions::default());
    let mut status = hub.status_changes();

    assert!(matches!(hub.start().await, Err(HubError::UrlParse(_))));
    assert!(status.next().now_or_never().is_none());
}

#[tokio::test]
async fn test_create_connection_defers_url_validation() {
    let connection = create_connection("not a url", &HubOptions::default());
    assert!(matches!(connection.start().await, Err(HubError::UrlParse(_))));
    assert!(matches!(
        connection.send("Ping", vec![]).await,
        Err(HubError::NotConnected)
    ));
}
