use reqwest::Client;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::{ApiClient, BasicAuth};
use crate::error::{ComfyError, Result};
use crate::events::{Handlers, NotificationError, NotificationEvent};
use crate::stream::{StreamClient, WaitSignal};
use crate::types::*;

const TRACING_TARGET: &str = "comfyui_client::client";

/// Polling interval used when a non-positive one is given.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Stream wait deadline used when a non-positive one is given.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Pause between an "execution ended" frame and the history lookup.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

fn random_client_id() -> String {
    format!("comfyui-client-{:016x}", rand::random::<u64>())
}

/// Async client for a ComfyUI server instance.
///
/// Wraps the REST API and, unless streaming is disabled, one WebSocket
/// connection that is opened lazily and shared by every clone of the client.
/// Completion can be awaited by polling history ([`wait_poll`](Self::wait_poll))
/// or by listening on the shared WebSocket ([`wait_stream`](Self::wait_stream)).
///
/// # Example
/// ```no_run
/// use comfyui_client::{CancellationToken, ComfyClient};
/// use std::time::Duration;
///
/// # async fn example(workflow: serde_json::Value) -> comfyui_client::Result<()> {
/// let client = ComfyClient::new("http://127.0.0.1:8188").with_client_id("my-app");
/// let prompt_id = client.queue_prompt(&workflow).await?;
/// let done = client
///     .wait_stream(&prompt_id, Duration::from_secs(120), &CancellationToken::new())
///     .await?;
/// for img in done.record.images() {
///     let bytes = client.image(&img).await?;
///     println!("{}: {} bytes", img.filename, bytes.len());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ComfyClient {
    api: ApiClient,
    handlers: Handlers,
    streaming: bool,
    settle_delay: Duration,
    debug: bool,
    stream: Arc<RwLock<Option<Arc<StreamClient>>>>,
}

impl fmt::Debug for ComfyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComfyClient")
            .field("api", &self.api)
            .field("handlers", &self.handlers)
            .field("streaming", &self.streaming)
            .field("settle_delay", &self.settle_delay)
            .finish_non_exhaustive()
    }
}

impl ComfyClient {
    /// Create a new client pointing at the given ComfyUI endpoint, with a
    /// randomly generated client id and streaming enabled.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            api: ApiClient::new(endpoint, random_client_id()),
            handlers: Handlers::default(),
            streaming: true,
            settle_delay: DEFAULT_SETTLE_DELAY,
            debug: false,
            stream: Arc::new(RwLock::new(None)),
        }
    }

    /// Use a custom `reqwest::Client` (for connection pooling, proxies, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.api.set_http_client(client);
        self
    }

    /// Set the stable client id sent with prompts and on the WebSocket.
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.api.set_client_id(id.into());
        self
    }

    /// Send HTTP basic auth on every request and on the WebSocket upgrade.
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.api.set_auth(Some(BasicAuth {
            username: username.into(),
            password: password.into(),
        }));
        self
    }

    /// Request timeout applied to every REST call, replacing per-call defaults.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.api.set_timeout(Some(timeout));
        self
    }

    /// Enable or disable the WebSocket. Streaming operations on a disabled
    /// client fail with [`ComfyError::StreamingDisabled`].
    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.streaming = enabled;
        self
    }

    /// Polling-only client, for gateways that do not proxy WebSockets.
    pub fn without_streaming(self) -> Self {
        self.with_streaming(false)
    }

    pub fn with_progress_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, ProgressUpdate) + Send + Sync + 'static,
    {
        self.handlers = self.handlers.on_progress(f);
        self
    }

    pub fn with_status_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.handlers = self.handlers.on_status(f);
        self
    }

    pub fn with_execution_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, Option<&str>) + Send + Sync + 'static,
    {
        self.handlers = self.handlers.on_execution(f);
        self
    }

    pub fn with_error_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &NotificationError) + Send + Sync + 'static,
    {
        self.handlers = self.handlers.on_error(f);
        self
    }

    /// Install several handlers at once. Slots left empty in `handlers` keep
    /// their current value.
    pub fn with_handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = self.handlers.merge(handlers);
        self
    }

    /// Override the pause between the "execution ended" frame and the history lookup.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Log request bodies and raw WebSocket frames at `debug` level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.api.set_debug(debug);
        self.debug = debug;
        self
    }

    /// Returns the configured endpoint URL.
    pub fn endpoint(&self) -> &str {
        self.api.endpoint()
    }

    /// Returns the configured client ID.
    pub fn client_id(&self) -> &str {
        self.api.client_id()
    }

    /// The REST layer on its own.
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Handlers the next WebSocket connection will be wired to.
    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    pub fn is_streaming_enabled(&self) -> bool {
        self.streaming
    }

    // ── REST ────────────────────────────────────────────────────────

    /// Check whether ComfyUI is reachable via `/system_stats`.
    pub async fn health(&self) -> Result<bool> {
        self.api.health().await
    }

    /// Queue a workflow for execution. Returns the `prompt_id`.
    pub async fn queue_prompt(&self, workflow: &Value) -> Result<String> {
        self.api.queue_prompt(workflow).await
    }

    pub async fn queue_status(&self) -> Result<QueueSnapshot> {
        self.api.queue_status().await
    }

    pub async fn history(&self, prompt_id: &str) -> Result<HistoryResponse> {
        self.api.history(prompt_id).await
    }

    /// Interrupt the currently running generation.
    pub async fn interrupt(&self) -> Result<()> {
        self.api.interrupt().await
    }

    pub async fn free_memory(&self, unload_models: bool) -> Result<()> {
        self.api.free_memory(unload_models).await
    }

    pub async fn upload_image(
        &self,
        filename: impl Into<String>,
        data: impl Into<reqwest::Body>,
    ) -> Result<UploadResponse> {
        self.api.upload_image(filename, data).await
    }

    pub async fn download(&self, filename: &str, subfolder: &str, kind: &str) -> Result<Vec<u8>> {
        self.api.download(filename, subfolder, kind).await
    }

    /// Download an output image by its reference.
    pub async fn image(&self, img: &ImageRef) -> Result<Vec<u8>> {
        self.api.image(img).await
    }

    // ── WebSocket lifecycle ─────────────────────────────────────────

    /// Open the shared WebSocket unless a live one exists. Concurrent callers
    /// are serialized, so at most one dial happens at a time.
    pub async fn ensure_connected(&self) -> Result<()> {
        if let Some(stream) = self.stream.read().await.as_ref() {
            if stream.is_connected() {
                return Ok(());
            }
        }

        let mut slot = self.stream.write().await;
        if !self.streaming {
            return Err(ComfyError::StreamingDisabled);
        }
        if let Some(stream) = slot.as_ref() {
            if stream.is_connected() {
                return Ok(());
            }
        }
        if let Some(stale) = slot.take() {
            tracing::debug!(target: TRACING_TARGET, "Replacing disconnected WebSocket client");
            if let Err(e) = stale.close().await {
                tracing::debug!(target: TRACING_TARGET, error = %e, "Closing stale WebSocket client failed");
            }
        }

        let stream = StreamClient::new(self.api.endpoint(), self.api.client_id())
            .with_auth(self.api.auth().cloned())
            .with_handlers(self.handlers.clone())
            .with_debug(self.debug);
        stream.connect().await?;
        *slot = Some(Arc::new(stream));
        Ok(())
    }

    /// The shared WebSocket client, connecting it first if needed.
    pub async fn shared_stream(&self) -> Result<Arc<StreamClient>> {
        self.ensure_connected().await?;
        self.stream
            .read()
            .await
            .clone()
            .ok_or(ComfyError::StreamClosed)
    }

    /// Whether the shared WebSocket is currently connected. Never dials.
    pub async fn is_stream_connected(&self) -> bool {
        self.stream
            .read()
            .await
            .as_ref()
            .is_some_and(|s| s.is_connected())
    }

    /// Connect if needed, then report whether the WebSocket is up.
    pub async fn stream_status(&self) -> Result<bool> {
        self.ensure_connected().await?;
        Ok(self.is_stream_connected().await)
    }

    /// Close the shared WebSocket. A later streaming call reconnects.
    pub async fn close_stream(&self) -> Result<()> {
        let stream = self.stream.write().await.take();
        match stream {
            Some(stream) => stream.close().await,
            None => Ok(()),
        }
    }

    /// Every decoded notification on the shared WebSocket, in wire order.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<NotificationEvent>> {
        Ok(self.shared_stream().await?.subscribe())
    }

    // ── Completion waiting ──────────────────────────────────────────

    /// Poll `/history` every `interval` until the prompt's entry is terminal.
    ///
    /// There is no attempt limit: only `cancel` ends a wait for a prompt that
    /// never finishes, so pass a token with a deadline if you need one.
    pub async fn wait_poll(
        &self,
        prompt_id: &str,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitResult> {
        let interval = if interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            interval
        };
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(target: TRACING_TARGET, %prompt_id, ?interval, "Polling for completion");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ComfyError::Cancelled),
                _ = ticker.tick() => {}
            }

            let history = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ComfyError::Cancelled),
                history = self.api.history(prompt_id) => history?,
            };

            if let Some(record) = history.get(prompt_id) {
                if record.is_terminal() {
                    tracing::debug!(target: TRACING_TARGET, %prompt_id, status = record.status_str(), "Prompt finished");
                    return Ok(WaitResult {
                        prompt_id: prompt_id.to_string(),
                        record: record.clone(),
                    });
                }
            }
        }
    }

    /// Wait on the shared WebSocket for the prompt to finish, then fetch its
    /// history entry.
    ///
    /// Any number of waits, for the same or different prompts, can run at
    /// once on the one connection. Installed handlers keep receiving every
    /// notification while a wait is in progress.
    pub async fn wait_stream(
        &self,
        prompt_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitResult> {
        let timeout = if timeout.is_zero() {
            DEFAULT_STREAM_TIMEOUT
        } else {
            timeout
        };

        let stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ComfyError::Cancelled),
            stream = self.shared_stream() => stream?,
        };
        let mut registration = stream.register(prompt_id);
        if !stream.is_connected() {
            return Err(ComfyError::StreamClosed);
        }
        tracing::debug!(target: TRACING_TARGET, %prompt_id, ?timeout, "Waiting for completion over WebSocket");

        let wait = async {
            match registration.signal().await {
                WaitSignal::Finished => self.settled_record(prompt_id).await,
                WaitSignal::Failed(source) => Err(ComfyError::Remote {
                    prompt_id: prompt_id.to_string(),
                    source,
                }),
                WaitSignal::Closed => Err(ComfyError::StreamClosed),
            }
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ComfyError::Cancelled),
            res = tokio::time::timeout(timeout, wait) => {
                res.unwrap_or_else(|_| Err(ComfyError::Timeout(timeout)))
            }
        };
        if let Err(e) = &outcome {
            tracing::debug!(target: TRACING_TARGET, %prompt_id, error = %e, "Stream wait ended without a result");
        }
        outcome
    }

    /// After the "execution ended" frame, re-read history every settle delay
    /// until the entry is terminal. Runs inside the caller's timeout.
    async fn settled_record(&self, prompt_id: &str) -> Result<WaitResult> {
        let pause = if self.settle_delay.is_zero() {
            DEFAULT_SETTLE_DELAY
        } else {
            self.settle_delay
        };
        tokio::time::sleep(self.settle_delay).await;
        loop {
            if let Some(done) = self.terminal_record(prompt_id).await? {
                return Ok(done);
            }
            tokio::time::sleep(pause).await;
        }
    }

    /// `Ok(None)` while the entry exists but is not terminal yet.
    async fn terminal_record(&self, prompt_id: &str) -> Result<Option<WaitResult>> {
        let history = self.api.history(prompt_id).await?;
        let record = history.get(prompt_id).ok_or_else(|| {
            ComfyError::Protocol(format!("History has no entry for prompt_id {}", prompt_id))
        })?;
        if !record.is_terminal() {
            tracing::debug!(
                target: TRACING_TARGET,
                %prompt_id,
                status = record.status_str(),
                "History entry not settled yet"
            );
            return Ok(None);
        }
        Ok(Some(WaitResult {
            prompt_id: prompt_id.to_string(),
            record: record.clone(),
        }))
    }
}
