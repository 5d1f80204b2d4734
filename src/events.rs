//! Typed WebSocket notifications and the handler slots they are dispatched to.
//!
//! Every inbound text frame is an envelope `{"type": ..., "data": ...}`.
//! Recognized tags decode into [`NotificationEvent`]; anything else becomes
//! [`NotificationEvent::Unknown`] and is never dispatched. A recognized tag
//! whose payload fails to decode yields a [`NotificationError::Decode`] for
//! that one frame only.

use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::types::ProgressUpdate;

/// A failure reported through the error handler slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    /// Reading from the WebSocket failed; the receive loop has stopped.
    #[error("Failed to read WebSocket message: {0}")]
    Read(String),

    /// A frame could not be decoded. The receive loop keeps running.
    #[error("Failed to decode '{frame_type}' frame: {message}")]
    Decode { frame_type: String, message: String },

    /// A node raised an exception while executing.
    #[error("Node {node_id} ({node_type}) failed: {exception}")]
    Execution {
        node_id: String,
        node_type: String,
        exception: String,
    },

    /// Execution was interrupted server-side.
    #[error("Execution was interrupted")]
    Interrupted,
}

/// One decoded WebSocket frame.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    /// Queue status broadcast (`status`).
    Status { queue_remaining: u32 },
    /// A prompt started executing (`execution_start`).
    ExecutionStart { prompt_id: String },
    /// A node started executing; `node: None` means the prompt is done (`executing`).
    Executing {
        prompt_id: String,
        node: Option<String>,
    },
    /// Sampling progress (`progress`). Carries no prompt id.
    Progress(ProgressUpdate),
    /// A node failed (`execution_error`).
    ExecutionError {
        prompt_id: String,
        node_id: String,
        node_type: String,
        exception: String,
    },
    /// Execution was interrupted (`execution_interrupted`).
    ExecutionInterrupted { prompt_id: Option<String> },
    /// A tag this client does not understand.
    Unknown { frame_type: String },
}

/// What a frame means for a prompt someone may be waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TerminalSignal {
    Finished,
    Failed(NotificationError),
}

impl NotificationEvent {
    /// The wire tag this event was decoded from.
    pub fn frame_type(&self) -> &str {
        match self {
            NotificationEvent::Status { .. } => "status",
            NotificationEvent::ExecutionStart { .. } => "execution_start",
            NotificationEvent::Executing { .. } => "executing",
            NotificationEvent::Progress(_) => "progress",
            NotificationEvent::ExecutionError { .. } => "execution_error",
            NotificationEvent::ExecutionInterrupted { .. } => "execution_interrupted",
            NotificationEvent::Unknown { frame_type } => frame_type,
        }
    }

    /// Prompt id carried by the frame, if the tag has one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            NotificationEvent::ExecutionStart { prompt_id }
            | NotificationEvent::Executing { prompt_id, .. }
            | NotificationEvent::ExecutionError { prompt_id, .. } => Some(prompt_id),
            NotificationEvent::ExecutionInterrupted { prompt_id } => prompt_id.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn terminal_signal(&self) -> Option<(&str, TerminalSignal)> {
        match self {
            NotificationEvent::Executing {
                prompt_id,
                node: None,
            } => Some((prompt_id, TerminalSignal::Finished)),
            NotificationEvent::ExecutionError {
                prompt_id,
                node_id,
                node_type,
                exception,
            } => Some((
                prompt_id,
                TerminalSignal::Failed(NotificationError::Execution {
                    node_id: node_id.clone(),
                    node_type: node_type.clone(),
                    exception: exception.clone(),
                }),
            )),
            NotificationEvent::ExecutionInterrupted {
                prompt_id: Some(prompt_id),
            } => Some((prompt_id, TerminalSignal::Failed(NotificationError::Interrupted))),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct StatusData {
    status: StatusBlock,
}

#[derive(Deserialize)]
struct StatusBlock {
    exec_info: ExecInfo,
}

#[derive(Deserialize)]
struct ExecInfo {
    #[serde(default)]
    queue_remaining: u32,
}

#[derive(Deserialize)]
struct PromptData {
    #[serde(default)]
    prompt_id: Option<String>,
}

#[derive(Deserialize)]
struct ExecutingData {
    node: Option<String>,
    #[serde(default)]
    prompt_id: Option<String>,
}

#[derive(Deserialize)]
struct ExecutionErrorData {
    #[serde(default)]
    prompt_id: String,
    #[serde(default)]
    node_id: String,
    #[serde(default)]
    node_type: String,
    #[serde(default)]
    exception_message: String,
}

/// Decode one text frame.
pub fn decode_frame(text: &str) -> Result<NotificationEvent, NotificationError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|e| NotificationError::Decode {
        frame_type: String::new(),
        message: e.to_string(),
    })?;

    let Envelope { frame_type, data } = envelope;
    let decode_err = |e: serde_json::Error| NotificationError::Decode {
        frame_type: frame_type.clone(),
        message: e.to_string(),
    };

    let event = match frame_type.as_str() {
        "status" => {
            let d: StatusData = serde_json::from_value(data).map_err(decode_err)?;
            NotificationEvent::Status {
                queue_remaining: d.status.exec_info.queue_remaining,
            }
        }
        "execution_start" => {
            let d: PromptData = serde_json::from_value(data).map_err(decode_err)?;
            NotificationEvent::ExecutionStart {
                prompt_id: d.prompt_id.unwrap_or_default(),
            }
        }
        "executing" => {
            let d: ExecutingData = serde_json::from_value(data).map_err(decode_err)?;
            NotificationEvent::Executing {
                prompt_id: d.prompt_id.unwrap_or_default(),
                node: d.node,
            }
        }
        "progress" => {
            let p: ProgressUpdate = serde_json::from_value(data).map_err(decode_err)?;
            NotificationEvent::Progress(p)
        }
        "execution_error" => {
            let d: ExecutionErrorData = serde_json::from_value(data).map_err(decode_err)?;
            NotificationEvent::ExecutionError {
                prompt_id: d.prompt_id,
                node_id: d.node_id,
                node_type: d.node_type,
                exception: d.exception_message,
            }
        }
        "execution_interrupted" => {
            let d: PromptData = serde_json::from_value(data).map_err(decode_err)?;
            NotificationEvent::ExecutionInterrupted {
                prompt_id: d.prompt_id.filter(|id| !id.is_empty()),
            }
        }
        _ => NotificationEvent::Unknown {
            frame_type: frame_type.clone(),
        },
    };
    Ok(event)
}

/// Called with `("", progress)`; progress frames carry no prompt id.
pub type ProgressHandler = Arc<dyn Fn(&str, ProgressUpdate) + Send + Sync>;
/// Called with `("", summary)` for queue status broadcasts.
pub type StatusHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// Called with `(prompt_id, node)`; `None` marks start or end of a prompt.
pub type ExecutionHandler = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;
/// Called with `(prompt_id, error)`; the id is empty for connection-level errors.
pub type ErrorHandler = Arc<dyn Fn(&str, &NotificationError) + Send + Sync>;

/// The four handler slots notifications are dispatched to.
///
/// Handlers run on the receive loop's task. Keep them short, or hand the
/// work off to another task, or later frames will queue up behind them.
#[derive(Clone, Default)]
pub struct Handlers {
    pub progress: Option<ProgressHandler>,
    pub status: Option<StatusHandler>,
    pub execution: Option<ExecutionHandler>,
    pub error: Option<ErrorHandler>,
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("progress", &self.progress.is_some())
            .field("status", &self.status.is_some())
            .field("execution", &self.execution.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn on_status<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.status = Some(Arc::new(f));
        self
    }

    pub fn on_execution<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, Option<&str>) + Send + Sync + 'static,
    {
        self.execution = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &NotificationError) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(f));
        self
    }

    /// Overwrite the slots that `other` populates; leave the rest alone.
    pub fn merge(mut self, other: Handlers) -> Self {
        if other.progress.is_some() {
            self.progress = other.progress;
        }
        if other.status.is_some() {
            self.status = other.status;
        }
        if other.execution.is_some() {
            self.execution = other.execution;
        }
        if other.error.is_some() {
            self.error = other.error;
        }
        self
    }

    /// Invoke the slot matching `event`.
    pub fn dispatch(&self, event: &NotificationEvent) {
        match event {
            NotificationEvent::Status { queue_remaining } => {
                if let Some(h) = &self.status {
                    h("", &format!("Queue remaining: {}", queue_remaining));
                }
            }
            NotificationEvent::ExecutionStart { prompt_id } => {
                if let Some(h) = &self.execution {
                    h(prompt_id, None);
                }
            }
            NotificationEvent::Executing { prompt_id, node } => {
                if let Some(h) = &self.execution {
                    h(prompt_id, node.as_deref());
                }
            }
            NotificationEvent::Progress(p) => {
                if let Some(h) = &self.progress {
                    h("", *p);
                }
            }
            NotificationEvent::ExecutionError {
                prompt_id,
                node_id,
                node_type,
                exception,
            } => {
                if let Some(h) = &self.error {
                    let err = NotificationError::Execution {
                        node_id: node_id.clone(),
                        node_type: node_type.clone(),
                        exception: exception.clone(),
                    };
                    h(prompt_id, &err);
                }
            }
            NotificationEvent::ExecutionInterrupted { prompt_id } => {
                if let (Some(h), Some(id)) = (&self.error, prompt_id) {
                    h(id, &NotificationError::Interrupted);
                }
            }
            NotificationEvent::Unknown { .. } => {}
        }
    }

    pub(crate) fn report_error(&self, prompt_id: &str, err: &NotificationError) {
        if let Some(h) = &self.error {
            h(prompt_id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_decode_executing_done() {
        let event =
            decode_frame(r#"{"type":"executing","data":{"node":null,"prompt_id":"abc123"}}"#).unwrap();
        assert_eq!(
            event,
            NotificationEvent::Executing {
                prompt_id: "abc123".into(),
                node: None
            }
        );
        assert_eq!(event.terminal_signal(), Some(("abc123", TerminalSignal::Finished)));
    }

    #[test]
    fn test_decode_executing_node() {
        let event =
            decode_frame(r#"{"type":"executing","data":{"node":"3","prompt_id":"abc123"}}"#).unwrap();
        assert_eq!(event.prompt_id(), Some("abc123"));
        assert!(event.terminal_signal().is_none());
    }

    #[test]
    fn test_decode_status() {
        let event = decode_frame(
            r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":2}},"sid":"x"}}"#,
        )
        .unwrap();
        assert_eq!(event, NotificationEvent::Status { queue_remaining: 2 });
    }

    #[test]
    fn test_decode_progress() {
        let event = decode_frame(r#"{"type":"progress","data":{"value":4,"max":20}}"#).unwrap();
        assert_eq!(
            event,
            NotificationEvent::Progress(ProgressUpdate {
                current_step: 4,
                total_steps: 20
            })
        );
        assert_eq!(event.prompt_id(), None);
    }

    #[test]
    fn test_decode_execution_error() {
        let event = decode_frame(
            r#"{"type":"execution_error","data":{"prompt_id":"p1","node_id":"7","node_type":"KSampler","exception_message":"CUDA out of memory"}}"#,
        )
        .unwrap();
        let (id, signal) = event.terminal_signal().unwrap();
        assert_eq!(id, "p1");
        assert_eq!(
            signal,
            TerminalSignal::Failed(NotificationError::Execution {
                node_id: "7".into(),
                node_type: "KSampler".into(),
                exception: "CUDA out of memory".into(),
            })
        );
    }

    #[test]
    fn test_decode_interrupted_without_id() {
        let event = decode_frame(r#"{"type":"execution_interrupted","data":{}}"#).unwrap();
        assert_eq!(event, NotificationEvent::ExecutionInterrupted { prompt_id: None });
        assert!(event.terminal_signal().is_none());
    }

    #[test]
    fn test_unknown_tag_is_not_an_error() {
        let event = decode_frame(r#"{"type":"executed","data":{"node":"9"}}"#).unwrap();
        assert_eq!(
            event,
            NotificationEvent::Unknown {
                frame_type: "executed".into()
            }
        );
    }

    #[test]
    fn test_malformed_known_tag() {
        let err = decode_frame(r#"{"type":"progress","data":{"value":"four"}}"#).unwrap_err();
        match err {
            NotificationError::Decode { frame_type, .. } => assert_eq!(frame_type, "progress"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(decode_frame("not json").is_err());
    }

    #[test]
    fn test_dispatch_routes_to_slots() {
        let calls = Arc::new(Mutex::new(Vec::<String>::new()));
        let (c1, c2, c3, c4) = (calls.clone(), calls.clone(), calls.clone(), calls.clone());
        let handlers = Handlers::new()
            .on_progress(move |id, p| {
                c1.lock().unwrap().push(format!("progress[{id}] {}/{}", p.current_step, p.total_steps))
            })
            .on_status(move |id, s| c2.lock().unwrap().push(format!("status[{id}] {s}")))
            .on_execution(move |id, node| {
                c3.lock().unwrap().push(format!("exec[{id}] {}", node.unwrap_or("-")))
            })
            .on_error(move |id, e| c4.lock().unwrap().push(format!("error[{id}] {e}")));

        handlers.dispatch(&NotificationEvent::Status { queue_remaining: 1 });
        handlers.dispatch(&NotificationEvent::ExecutionStart {
            prompt_id: "p".into(),
        });
        handlers.dispatch(&NotificationEvent::Progress(ProgressUpdate {
            current_step: 1,
            total_steps: 2,
        }));
        handlers.dispatch(&NotificationEvent::ExecutionInterrupted { prompt_id: None });
        handlers.dispatch(&NotificationEvent::ExecutionInterrupted {
            prompt_id: Some("p".into()),
        });
        handlers.dispatch(&NotificationEvent::Unknown {
            frame_type: "crystools.monitor".into(),
        });

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                "status[] Queue remaining: 1".to_string(),
                "exec[p] -".to_string(),
                "progress[] 1/2".to_string(),
                "error[p] Execution was interrupted".to_string(),
            ]
        );
    }

    #[test]
    fn test_merge_keeps_unset_slots() {
        let base = Handlers::new().on_progress(|_, _| {}).on_error(|_, _| {});
        let original_progress = base.progress.clone().unwrap();
        let merged = base.merge(Handlers::new().on_error(|_, _| {}).on_status(|_, _| {}));
        assert!(Arc::ptr_eq(merged.progress.as_ref().unwrap(), &original_progress));
        assert!(merged.status.is_some());
        assert!(merged.execution.is_none());
    }
}
