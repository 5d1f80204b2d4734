use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Real-time sampling progress reported over the WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(rename = "value")]
    pub current_step: u32,
    #[serde(rename = "max")]
    pub total_steps: u32,
}

impl ProgressUpdate {
    /// Completion fraction in `0.0..=1.0`. Zero when the total is unknown.
    pub fn fraction(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        (self.current_step as f64 / self.total_steps as f64).min(1.0)
    }
}

/// Reference to a file stored in one of ComfyUI's asset directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_output_kind")]
    pub img_type: String,
}

fn default_output_kind() -> String {
    "output".to_string()
}

/// Execution status block of a history entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
    /// Lifecycle messages in the order ComfyUI logged them.
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// One prompt's entry in `/history`.
///
/// ComfyUI exposes no single authoritative "done" field, so
/// [`is_terminal`](Self::is_terminal) accepts either a completed status or
/// any produced output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<HistoryStatus>,
    /// Node id to produced artifacts.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub outputs: Map<String, Value>,
    /// Remaining fields (`prompt`, `meta`, ...) kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl HistoryRecord {
    /// True once the status reports completion or outputs exist.
    pub fn is_terminal(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.completed) || !self.outputs.is_empty()
    }

    /// `status_str` of the entry, or `"unknown"` when absent.
    pub fn status_str(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.status_str.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown")
    }

    /// Every image reference across all node outputs, ordered by node id.
    pub fn images(&self) -> Vec<ImageRef> {
        let mut images = Vec::new();
        for node_output in self.outputs.values() {
            if let Some(imgs) = node_output.get("images").and_then(|i| i.as_array()) {
                for img in imgs {
                    if let Some(filename) = img.get("filename").and_then(|f| f.as_str()) {
                        let subfolder = img
                            .get("subfolder")
                            .and_then(|s| s.as_str())
                            .unwrap_or("");
                        let img_type = img.get("type").and_then(|t| t.as_str()).unwrap_or("output");
                        images.push(ImageRef {
                            filename: filename.to_string(),
                            subfolder: subfolder.to_string(),
                            img_type: img_type.to_string(),
                        });
                    }
                }
            }
        }
        images
    }
}

/// `/history/{id}` response. The server may include more ids than requested.
pub type HistoryResponse = HashMap<String, HistoryRecord>;

/// Snapshot of ComfyUI's queue state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    #[serde(rename = "queue_running", default)]
    pub running: Vec<Value>,
    #[serde(rename = "queue_pending", default)]
    pub pending: Vec<Value>,
}

impl QueueSnapshot {
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.pending.is_empty()
    }
}

/// Where ComfyUI stored an uploaded asset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// A finished prompt: its id and terminal history entry.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitResult {
    pub prompt_id: String,
    pub record: HistoryRecord,
}
