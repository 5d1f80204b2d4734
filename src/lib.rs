//! # comfyui-client
//!
//! Async Rust client for [ComfyUI](https://github.com/comfyanonymous/ComfyUI):
//! submit workflow graphs, follow execution over a shared WebSocket, and wait
//! for results either by polling history or by listening for completion.
//!
//! The REST side is stateless. The WebSocket side is one lazily opened
//! connection per [`ComfyClient`] (and its clones), read by a single
//! background task that dispatches typed notifications to the configured
//! [`Handlers`] and wakes any waits registered for the finishing prompt.
//!
//! ## Quick Start
//!
//! ```no_run
//! use comfyui_client::{CancellationToken, ComfyClient};
//! use std::time::Duration;
//!
//! # async fn example() -> comfyui_client::Result<()> {
//! let client = ComfyClient::new("http://127.0.0.1:8188")
//!     .with_client_id("my-app")
//!     .with_progress_handler(|_, p| println!("Step {}/{}", p.current_step, p.total_steps));
//!
//! let workflow: serde_json::Value = serde_json::from_str(&std::fs::read_to_string("workflow_api.json").unwrap())?;
//! let prompt_id = client.queue_prompt(&workflow).await?;
//!
//! let cancel = CancellationToken::new();
//! let done = client.wait_stream(&prompt_id, Duration::from_secs(300), &cancel).await?;
//! for img in done.record.images() {
//!     let bytes = client.image(&img).await?;
//!     std::fs::write(&img.filename, &bytes).unwrap();
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod client;
pub mod error;
pub mod events;
pub mod stream;
pub mod types;

pub use api::{ApiClient, BasicAuth};
pub use client::ComfyClient;
pub use error::{ComfyError, Result};
pub use events::{Handlers, NotificationError, NotificationEvent};
pub use stream::StreamClient;
pub use types::{
    HistoryRecord, HistoryResponse, HistoryStatus, ImageRef, ProgressUpdate, QueueSnapshot,
    UploadResponse, WaitResult,
};
pub use tokio_util::sync::CancellationToken;
