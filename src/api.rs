//! Request/response operations against ComfyUI's HTTP API.
//!
//! Nothing here retries: every failure is returned to the caller as-is.

use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::error::{ComfyError, Result};
use crate::types::*;

const TRACING_TARGET: &str = "comfyui_client::api";

const SHORT_TIMEOUT: Duration = Duration::from_secs(5);
const HISTORY_TIMEOUT: Duration = Duration::from_secs(10);
const LONG_TIMEOUT: Duration = Duration::from_secs(30);

/// Trim trailing slashes and default to `http://` when no scheme is given.
pub(crate) fn normalize(endpoint: String) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// HTTP basic-auth credentials, sent on every request and on the WebSocket upgrade.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Stateless REST layer. Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    endpoint: String,
    client_id: String,
    auth: Option<BasicAuth>,
    timeout: Option<Duration>,
    debug: bool,
}

impl ApiClient {
    pub fn new(endpoint: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: normalize(endpoint.into()),
            client_id: client_id.into(),
            auth: None,
            timeout: None,
            debug: false,
        }
    }

    pub(crate) fn set_http_client(&mut self, client: Client) {
        self.http = client;
    }

    pub(crate) fn set_client_id(&mut self, id: String) {
        self.client_id = id;
    }

    pub(crate) fn set_auth(&mut self, auth: Option<BasicAuth>) {
        self.auth = auth;
    }

    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub(crate) fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn auth(&self) -> Option<&BasicAuth> {
        self.auth.as_ref()
    }

    fn request(&self, method: Method, path: &str, default_timeout: Duration) -> RequestBuilder {
        let url = format!("{}{}", self.endpoint, path);
        self.authorize(self.http.request(method, url), default_timeout)
    }

    fn authorize(&self, req: RequestBuilder, default_timeout: Duration) -> RequestBuilder {
        let mut req = req.timeout(self.timeout.unwrap_or(default_timeout));
        if let Some(auth) = &self.auth {
            req = req.basic_auth(&auth.username, Some(&auth.password));
        }
        req
    }

    /// Endpoint URL with `segments` appended, each percent-encoded as one
    /// path segment.
    pub(crate) fn segment_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| ComfyError::InvalidConfig(format!("Bad endpoint {}: {}", self.endpoint, e)))?;
        url.path_segments_mut()
            .map_err(|()| ComfyError::InvalidConfig(format!("Endpoint {} cannot take a path", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn decode<T: DeserializeOwned>(json: Value, context: &str) -> Result<T> {
        serde_json::from_value(json)
            .map_err(|e| ComfyError::Protocol(format!("Malformed {} response: {}", context, e)))
    }

    async fn send(&self, req: RequestBuilder, context: &str) -> Result<Response> {
        let resp = req.send().await.map_err(|e| ComfyError::Network {
            context: format!("{} ({})", context, self.endpoint),
            source: e,
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!(target: TRACING_TARGET, status, %body, "{} returned an error status", context);
            return Err(ComfyError::Http { status, body });
        }
        Ok(resp)
    }

    async fn json(resp: Response, context: &str) -> Result<Value> {
        resp.json().await.map_err(|e| ComfyError::Network {
            context: format!("Failed to parse {} response", context),
            source: e,
        })
    }

    // ── Health ──────────────────────────────────────────────────────

    /// Check whether ComfyUI is reachable via `/system_stats`.
    pub async fn health(&self) -> Result<bool> {
        let resp = self
            .request(Method::GET, "/system_stats", SHORT_TIMEOUT)
            .send()
            .await
            .map_err(|e| ComfyError::Network {
                context: format!(
                    "Cannot connect to ComfyUI at {}, is the service running?",
                    self.endpoint
                ),
                source: e,
            })?;
        Ok(resp.status().is_success())
    }

    // ── Prompt ──────────────────────────────────────────────────────

    /// Queue a workflow for execution under this client's id. Returns the `prompt_id`.
    pub async fn queue_prompt(&self, workflow: &Value) -> Result<String> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": self.client_id,
        });
        if self.debug {
            tracing::debug!(target: TRACING_TARGET, %body, "POST /prompt");
        }

        let resp = self
            .send(
                self.request(Method::POST, "/prompt", LONG_TIMEOUT).json(&body),
                "Failed to queue prompt",
            )
            .await?;
        let json = Self::json(resp, "/prompt").await?;

        let prompt_id = json
            .get("prompt_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .ok_or_else(|| ComfyError::Protocol("Response missing prompt_id".into()))?;

        tracing::debug!(target: TRACING_TARGET, %prompt_id, "Prompt queued");
        Ok(prompt_id)
    }

    // ── History ─────────────────────────────────────────────────────

    /// Fetch `/history/{prompt_id}`. Index the result by id: ComfyUI may
    /// return other entries too, and omits the id until it has finished.
    pub async fn history(&self, prompt_id: &str) -> Result<HistoryResponse> {
        let url = self.segment_url(&["history", prompt_id])?;
        let resp = self
            .send(
                self.authorize(self.http.get(url), HISTORY_TIMEOUT),
                "Failed to fetch ComfyUI history",
            )
            .await?;
        let json = Self::json(resp, "history").await?;
        if self.debug {
            tracing::debug!(target: TRACING_TARGET, %prompt_id, body = %json, "GET /history");
        }
        Self::decode(json, "history")
    }

    // ── Queue status ────────────────────────────────────────────────

    /// Get the current ComfyUI queue state.
    pub async fn queue_status(&self) -> Result<QueueSnapshot> {
        let resp = self
            .send(
                self.request(Method::GET, "/queue", SHORT_TIMEOUT),
                "Failed to fetch ComfyUI queue status",
            )
            .await?;
        let json = Self::json(resp, "queue").await?;
        Self::decode(json, "queue")
    }

    // ── Control ─────────────────────────────────────────────────────

    /// Interrupt the currently running generation.
    pub async fn interrupt(&self) -> Result<()> {
        self.send(
            self.request(Method::POST, "/interrupt", SHORT_TIMEOUT),
            "Failed to send interrupt",
        )
        .await?;
        tracing::debug!(target: TRACING_TARGET, "Interrupt sent");
        Ok(())
    }

    /// Free VRAM. If `unload_models` is true, all models are unloaded.
    pub async fn free_memory(&self, unload_models: bool) -> Result<()> {
        let body = if unload_models {
            serde_json::json!({"unload_models": true})
        } else {
            serde_json::json!({"free_memory": true})
        };
        self.send(
            self.request(Method::POST, "/free", LONG_TIMEOUT).json(&body),
            "Failed to send free memory request",
        )
        .await?;
        Ok(())
    }

    // ── Assets ──────────────────────────────────────────────────────

    /// Upload an input image. `data` may be bytes, a `String`, or a streamed body.
    pub async fn upload_image(
        &self,
        filename: impl Into<String>,
        data: impl Into<reqwest::Body>,
    ) -> Result<UploadResponse> {
        let filename = filename.into();
        let part = reqwest::multipart::Part::stream(data).file_name(filename.clone());
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("type", "input");

        let resp = self
            .send(
                self.request(Method::POST, "/upload/image", LONG_TIMEOUT)
                    .multipart(form),
                &format!("Failed to upload {}", filename),
            )
            .await?;
        let json = Self::json(resp, "/upload/image").await?;
        Self::decode(json, "upload")
    }

    /// Download a stored file. `kind` is `output`, `input` or `temp`.
    pub async fn download(&self, filename: &str, subfolder: &str, kind: &str) -> Result<Vec<u8>> {
        let req = self
            .request(Method::GET, "/view", LONG_TIMEOUT)
            .query(&[("filename", filename), ("subfolder", subfolder), ("type", kind)]);
        let resp = self
            .send(req, &format!("Failed to fetch {} from ComfyUI", filename))
            .await?;

        let bytes = resp.bytes().await.map_err(|e| ComfyError::Network {
            context: format!("Failed to read bytes of {}", filename),
            source: e,
        })?;
        Ok(bytes.to_vec())
    }

    /// Download an output image by its reference.
    pub async fn image(&self, img: &ImageRef) -> Result<Vec<u8>> {
        self.download(&img.filename, &img.subfolder, &img.img_type)
            .await
    }
}
