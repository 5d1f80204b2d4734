//! Persistent WebSocket connection to ComfyUI's `/ws` endpoint.
//!
//! A connected [`StreamClient`] owns exactly one background task that is the
//! sole reader of the socket. That task decodes frames, invokes the handler
//! slots, publishes every decoded event on a broadcast channel, and resolves
//! any waits registered for the prompt a terminal frame refers to.

use base64::Engine;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::api::{normalize, BasicAuth};
use crate::error::{ComfyError, Result};
use crate::events::{decode_frame, Handlers, NotificationError, NotificationEvent, TerminalSignal};

const TRACING_TARGET: &str = "comfyui_client::stream";

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Derive the WebSocket address from the HTTP base address.
pub(crate) fn stream_url(endpoint: &str, client_id: &str) -> Result<String> {
    let base = endpoint.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{}", base)
    };

    let mut url = reqwest::Url::parse(&format!("{}/ws", base))
        .map_err(|e| ComfyError::InvalidConfig(format!("Bad WebSocket URL {}/ws: {}", base, e)))?;
    if !client_id.is_empty() {
        url.query_pairs_mut().append_pair("clientId", client_id);
    }
    Ok(url.to_string())
}

fn basic_auth_header(auth: &BasicAuth) -> Result<Option<HeaderValue>> {
    if auth.username.is_empty() || auth.password.is_empty() {
        return Ok(None);
    }
    let token = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", auth.username, auth.password));
    HeaderValue::from_str(&format!("Basic {}", token))
        .map(Some)
        .map_err(|e| ComfyError::InvalidConfig(format!("Credentials are not a valid header: {}", e)))
}

// ── Waiter registry ─────────────────────────────────────────────────

/// How a registered wait was resolved by the receive loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WaitSignal {
    Finished,
    Failed(NotificationError),
    Closed,
}

type Pending = HashMap<String, Vec<(u64, oneshot::Sender<WaitSignal>)>>;

/// Prompt id to one-shot senders, resolved by the receive loop.
#[derive(Default)]
pub(crate) struct WaiterRegistry {
    pending: Mutex<Pending>,
    next_token: AtomicU64,
}

impl WaiterRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(self: &Arc<Self>, prompt_id: &str) -> Registration {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock()
            .entry(prompt_id.to_string())
            .or_default()
            .push((token, tx));
        Registration {
            registry: Arc::clone(self),
            prompt_id: prompt_id.to_string(),
            token,
            rx,
        }
    }

    fn resolve(&self, event: &NotificationEvent) {
        let Some((prompt_id, signal)) = event.terminal_signal() else {
            return;
        };
        let waiters = self.lock().remove(prompt_id);
        let Some(waiters) = waiters else {
            return;
        };
        let signal = match signal {
            TerminalSignal::Finished => WaitSignal::Finished,
            TerminalSignal::Failed(err) => WaitSignal::Failed(err),
        };
        for (_, tx) in waiters {
            if tx.send(signal.clone()).is_err() {
                tracing::debug!(target: TRACING_TARGET, %prompt_id, "Waiter went away before its signal");
            }
        }
    }

    fn close_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, waiters) in drained {
            for (_, tx) in waiters {
                let _ = tx.send(WaitSignal::Closed);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    fn unregister(&self, prompt_id: &str, token: u64) {
        let mut pending = self.lock();
        if let Some(waiters) = pending.get_mut(prompt_id) {
            waiters.retain(|(t, _)| *t != token);
            if waiters.is_empty() {
                pending.remove(prompt_id);
            }
        }
    }
}

/// A registered wait. Dropping it removes the registration.
pub(crate) struct Registration {
    registry: Arc<WaiterRegistry>,
    prompt_id: String,
    token: u64,
    rx: oneshot::Receiver<WaitSignal>,
}

impl Registration {
    pub(crate) async fn signal(&mut self) -> WaitSignal {
        (&mut self.rx).await.unwrap_or(WaitSignal::Closed)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.prompt_id, self.token);
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// Everything the receive loop owns besides the socket.
struct LoopContext {
    handlers: Handlers,
    waiters: Arc<WaiterRegistry>,
    events: broadcast::Sender<NotificationEvent>,
    running: Arc<AtomicBool>,
    debug: bool,
}

impl LoopContext {
    fn handle_text(&self, text: &str) {
        if self.debug {
            tracing::debug!(target: TRACING_TARGET, frame = %text, "Received frame");
        }
        match decode_frame(text) {
            Ok(NotificationEvent::Unknown { frame_type }) => {
                tracing::trace!(target: TRACING_TARGET, %frame_type, "Ignoring unknown frame");
            }
            Ok(event) => {
                if let NotificationEvent::ExecutionInterrupted { prompt_id: None } = &event {
                    tracing::debug!(target: TRACING_TARGET, "Dropping interrupt without prompt id");
                }
                self.handlers.dispatch(&event);
                self.waiters.resolve(&event);
                let _ = self.events.send(event);
            }
            Err(err) => {
                tracing::warn!(target: TRACING_TARGET, error = %err, "Undecodable frame");
                self.handlers.report_error("", &err);
            }
        }
    }

    fn fail(&self, reason: String) {
        self.running.store(false, Ordering::SeqCst);
        tracing::warn!(target: TRACING_TARGET, %reason, "WebSocket receive loop stopped");
        self.handlers
            .report_error("", &NotificationError::Read(reason));
        self.waiters.close_all();
    }
}

// Owned by the receive loop, so it also runs when a handler panics and the
// task unwinds.
impl Drop for LoopContext {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!(
                target: TRACING_TARGET,
                panicked = std::thread::panicking(),
                "WebSocket receive loop ended unexpectedly"
            );
        }
        self.waiters.close_all();
    }
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<std::result::Result<(), tungstenite::Error>>,
}

/// One persistent WebSocket connection for a client id.
///
/// # Example
/// ```no_run
/// use comfyui_client::{Handlers, StreamClient};
///
/// # async fn example() -> comfyui_client::Result<()> {
/// let handlers = Handlers::new().on_progress(|_, p| println!("{}/{}", p.current_step, p.total_steps));
/// let stream = StreamClient::new("http://127.0.0.1:8188", "my-app").with_handlers(handlers);
/// stream.connect().await?;
/// // ...
/// stream.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct StreamClient {
    endpoint: String,
    client_id: String,
    auth: Option<BasicAuth>,
    handlers: Handlers,
    debug: bool,
    waiters: Arc<WaiterRegistry>,
    events: broadcast::Sender<NotificationEvent>,
    running: Arc<AtomicBool>,
    session: tokio::sync::Mutex<Option<Session>>,
    root: CancellationToken,
}

impl StreamClient {
    pub fn new(endpoint: impl Into<String>, client_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            endpoint: normalize(endpoint.into()),
            client_id: client_id.into(),
            auth: None,
            handlers: Handlers::default(),
            debug: false,
            waiters: Arc::new(WaiterRegistry::default()),
            events,
            running: Arc::new(AtomicBool::new(false)),
            session: tokio::sync::Mutex::new(None),
            root: CancellationToken::new(),
        }
    }

    /// Attach basic-auth credentials to the upgrade request.
    pub fn with_auth(mut self, auth: Option<BasicAuth>) -> Self {
        self.auth = auth;
        self
    }

    /// Handlers used by the next receive loop started by `connect`.
    pub fn with_handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Log every raw inbound frame at `debug` level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    /// WebSocket address this client dials.
    pub fn url(&self) -> Result<String> {
        stream_url(&self.endpoint, &self.client_id)
    }

    /// Dial the WebSocket and start the receive loop. Returns once connected.
    pub async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() && self.is_connected() {
            return Err(ComfyError::AlreadyRunning);
        }

        let url = self.url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ComfyError::Connection {
                url: url.clone(),
                source: e,
            })?;
        if let Some(value) = self.auth.as_ref().map(basic_auth_header).transpose()?.flatten() {
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        tracing::debug!(target: TRACING_TARGET, %url, "Connecting WebSocket");
        let dial = tokio::time::timeout(DIAL_TIMEOUT, tokio_tungstenite::connect_async(request)).await;
        let (ws, _) = match dial {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(ComfyError::Connection { url, source: e }),
            Err(_) => {
                let e = tungstenite::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no handshake within {:?}", DIAL_TIMEOUT),
                ));
                return Err(ComfyError::Connection { url, source: e });
            }
        };

        let ctx = LoopContext {
            handlers: self.handlers.clone(),
            waiters: Arc::clone(&self.waiters),
            events: self.events.clone(),
            running: Arc::clone(&self.running),
            debug: self.debug,
        };
        let cancel = self.root.child_token();
        self.running.store(true, Ordering::SeqCst);
        let task = tokio::spawn(receive_loop(ws, ctx, cancel.clone()));
        *session = Some(Session { cancel, task });

        tracing::info!(target: TRACING_TARGET, %url, "WebSocket connected");
        Ok(())
    }

    /// True while the receive loop is alive.
    pub fn is_connected(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the receive loop and close with a normal-closure code. No-op when not connected.
    pub async fn close(&self) -> Result<()> {
        let Some(Session { cancel, task }) = self.session.lock().await.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::SeqCst);
        cancel.cancel();

        match task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => Ok(()),
            Ok(Err(e)) => Err(ComfyError::Connection {
                url: self.url().unwrap_or_default(),
                source: e,
            }),
            Err(e) => {
                tracing::warn!(target: TRACING_TARGET, error = %e, "Receive loop did not shut down cleanly");
                Ok(())
            }
        }
    }

    /// Every decoded notification, in wire order.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.events.subscribe()
    }

    pub(crate) fn register(&self, prompt_id: &str) -> Registration {
        self.waiters.register(prompt_id)
    }

    #[cfg(test)]
    pub(crate) fn pending_waits(&self) -> usize {
        self.waiters.len()
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

async fn receive_loop(
    mut ws: WsStream,
    ctx: LoopContext,
    cancel: CancellationToken,
) -> std::result::Result<(), tungstenite::Error> {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                ctx.running.store(false, Ordering::SeqCst);
                ctx.waiters.close_all();
                tracing::debug!(target: TRACING_TARGET, "Closing WebSocket");
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client closing".into(),
                };
                return ws.close(Some(frame)).await;
            }

            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => ctx.handle_text(&text),
                Some(Ok(Message::Close(frame))) => {
                    let reason = match frame {
                        Some(f) => format!("connection closed by server ({}: {})", f.code, f.reason),
                        None => "connection closed by server".to_string(),
                    };
                    ctx.fail(reason);
                    return Ok(());
                }
                // Binary previews and control frames.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    ctx.fail(e.to_string());
                    return Ok(());
                }
                None => {
                    ctx.fail("connection ended".to_string());
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url_scheme_swap() {
        assert_eq!(
            stream_url("http://localhost:8188", "app").unwrap(),
            "ws://localhost:8188/ws?clientId=app"
        );
        assert_eq!(
            stream_url("https://comfy.example.com/", "app").unwrap(),
            "wss://comfy.example.com/ws?clientId=app"
        );
        assert_eq!(
            stream_url("wss://comfy.example.com", "app").unwrap(),
            "wss://comfy.example.com/ws?clientId=app"
        );
        assert_eq!(
            stream_url("127.0.0.1:8188", "app").unwrap(),
            "ws://127.0.0.1:8188/ws?clientId=app"
        );
    }

    #[test]
    fn test_stream_url_encodes_client_id() {
        assert_eq!(
            stream_url("http://h:1", "my app&x").unwrap(),
            "ws://h:1/ws?clientId=my+app%26x"
        );
        assert_eq!(stream_url("http://h:1", "").unwrap(), "ws://h:1/ws");
    }

    #[test]
    fn test_basic_auth_header() {
        let auth = BasicAuth {
            username: "admin".into(),
            password: "admin123456".into(),
        };
        let header = basic_auth_header(&auth).unwrap().unwrap();
        assert_eq!(header.to_str().unwrap(), "Basic YWRtaW46YWRtaW4xMjM0NTY=");

        let partial = BasicAuth {
            username: "admin".into(),
            password: String::new(),
        };
        assert!(basic_auth_header(&partial).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registry_resolves_matching_prompt_only() {
        let registry = Arc::new(WaiterRegistry::default());
        let mut ours = registry.register("abc123");
        let mut theirs = registry.register("other");

        registry.resolve(&NotificationEvent::Executing {
            prompt_id: "abc123".into(),
            node: Some("3".into()),
        });
        assert_eq!(registry.len(), 2);

        registry.resolve(&NotificationEvent::Executing {
            prompt_id: "abc123".into(),
            node: None,
        });
        assert_eq!(ours.signal().await, WaitSignal::Finished);
        assert_eq!(registry.len(), 1);

        registry.resolve(&NotificationEvent::ExecutionInterrupted {
            prompt_id: Some("other".into()),
        });
        assert_eq!(
            theirs.signal().await,
            WaitSignal::Failed(NotificationError::Interrupted)
        );
    }

    #[tokio::test]
    async fn test_registry_close_all_and_drop() {
        let registry = Arc::new(WaiterRegistry::default());
        let dropped = registry.register("a");
        let mut kept = registry.register("a");
        assert_eq!(registry.len(), 2);

        drop(dropped);
        assert_eq!(registry.len(), 1);

        registry.close_all();
        assert_eq!(kept.signal().await, WaitSignal::Closed);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_close_when_never_connected_is_noop() {
        let stream = StreamClient::new("http://127.0.0.1:1", "idle");
        assert!(!stream.is_connected());
        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert_eq!(stream.pending_waits(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        // Port 1 is never listening in the test environment.
        let stream = StreamClient::new("http://127.0.0.1:1", "nobody");
        let err = stream.connect().await.unwrap_err();
        assert!(matches!(err, ComfyError::Connection { .. }));
        assert!(!stream.is_connected());
    }
}
