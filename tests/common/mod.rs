#![allow(dead_code)]

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Sentinel frame that makes the server close every open socket.
const CLOSE_SENTINEL: &str = "__close__";

/// In-process stand-in for a ComfyUI server: HTTP routes and `/ws` on one port.
#[derive(Clone)]
pub struct MockComfy {
    inner: Arc<Inner>,
}

struct Inner {
    history: Mutex<HashMap<String, Value>>,
    submitted: Mutex<Vec<Value>>,
    next_prompt_id: Mutex<String>,
    history_hits: AtomicUsize,
    ws_upgrades: AtomicUsize,
    ws_queries: Mutex<Vec<HashMap<String, String>>>,
    ws_auth: Mutex<Vec<Option<String>>>,
    frames: broadcast::Sender<String>,
}

impl MockComfy {
    /// Start the server on an ephemeral port. Returns it with its base URL.
    pub async fn start() -> (MockComfy, String) {
        let (frames, _) = broadcast::channel(64);
        let mock = MockComfy {
            inner: Arc::new(Inner {
                history: Mutex::new(HashMap::new()),
                submitted: Mutex::new(Vec::new()),
                next_prompt_id: Mutex::new("abc123".to_string()),
                history_hits: AtomicUsize::new(0),
                ws_upgrades: AtomicUsize::new(0),
                ws_queries: Mutex::new(Vec::new()),
                ws_auth: Mutex::new(Vec::new()),
                frames,
            }),
        };

        let app = Router::new()
            .route("/prompt", post(submit))
            .route("/history/:id", get(history))
            .route("/queue", get(queue))
            .route("/ws", get(ws))
            .with_state(mock.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (mock, format!("http://{}", addr))
    }

    pub fn set_next_prompt_id(&self, id: &str) {
        *self.inner.next_prompt_id.lock().unwrap() = id.to_string();
    }

    pub fn set_history(&self, prompt_id: &str, record: Value) {
        self.inner
            .history
            .lock()
            .unwrap()
            .insert(prompt_id.to_string(), record);
    }

    /// Send a frame to every connected socket.
    pub fn push_frame(&self, frame: Value) {
        self.push_raw(&frame.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        // No receivers just means no socket is open yet.
        let _ = self.inner.frames.send(text.to_string());
    }

    /// Push `text` every 25ms until the returned task is aborted. Lets a test
    /// deliver a frame without knowing when the waiter registered.
    pub fn repeat_raw(&self, text: String) -> tokio::task::JoinHandle<()> {
        let mock = self.clone();
        tokio::spawn(async move {
            loop {
                mock.push_raw(&text);
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
    }

    pub fn repeat_frame(&self, frame: Value) -> tokio::task::JoinHandle<()> {
        self.repeat_raw(frame.to_string())
    }

    pub fn repeat_close(&self) -> tokio::task::JoinHandle<()> {
        self.repeat_raw(CLOSE_SENTINEL.to_string())
    }

    /// Close every connected socket from the server side.
    pub fn drop_sockets(&self) {
        self.push_raw(CLOSE_SENTINEL);
    }

    pub fn history_hits(&self) -> usize {
        self.inner.history_hits.load(Ordering::SeqCst)
    }

    pub fn ws_upgrades(&self) -> usize {
        self.inner.ws_upgrades.load(Ordering::SeqCst)
    }

    pub fn last_ws_query(&self) -> Option<HashMap<String, String>> {
        self.inner.ws_queries.lock().unwrap().last().cloned()
    }

    pub fn last_ws_auth(&self) -> Option<String> {
        self.inner.ws_auth.lock().unwrap().last().cloned().flatten()
    }

    pub fn submitted(&self) -> Vec<Value> {
        self.inner.submitted.lock().unwrap().clone()
    }

    /// Wait until at least `n` sockets have been upgraded.
    pub async fn wait_for_upgrades(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.ws_upgrades() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("socket never connected");
    }
}

async fn submit(State(mock): State<MockComfy>, Json(body): Json<Value>) -> Json<Value> {
    mock.inner.submitted.lock().unwrap().push(body);
    let prompt_id = mock.inner.next_prompt_id.lock().unwrap().clone();
    Json(json!({"prompt_id": prompt_id, "number": 1, "node_errors": {}}))
}

async fn history(State(mock): State<MockComfy>, Path(id): Path<String>) -> Json<Value> {
    mock.inner.history_hits.fetch_add(1, Ordering::SeqCst);
    let history = mock.inner.history.lock().unwrap();
    let mut body = serde_json::Map::new();
    if let Some(record) = history.get(&id) {
        body.insert(id, record.clone());
    }
    Json(Value::Object(body))
}

async fn queue() -> Json<Value> {
    Json(json!({"queue_running": [], "queue_pending": []}))
}

async fn ws(
    State(mock): State<MockComfy>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    // Subscribe before answering the upgrade so no pushed frame is missed.
    let rx = mock.inner.frames.subscribe();
    mock.inner.ws_upgrades.fetch_add(1, Ordering::SeqCst);
    mock.inner.ws_queries.lock().unwrap().push(query);
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    mock.inner.ws_auth.lock().unwrap().push(auth);
    upgrade.on_upgrade(move |socket| forward(socket, rx))
}

async fn forward(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(text) if text == CLOSE_SENTINEL => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Ok(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// A history entry ComfyUI would report for a finished prompt.
pub fn finished_record(prompt_id: &str) -> Value {
    json!({
        "prompt": [1, prompt_id, {}],
        "status": {"status_str": "success", "completed": true, "messages": []},
        "outputs": {
            "9": {"images": [{"filename": "ComfyUI_00001_.png", "subfolder": "", "type": "output"}]}
        }
    })
}

pub fn executing_done(prompt_id: &str) -> Value {
    json!({"type": "executing", "data": {"node": null, "prompt_id": prompt_id}})
}

pub fn executing_node(prompt_id: &str, node: &str) -> Value {
    json!({"type": "executing", "data": {"node": node, "prompt_id": prompt_id}})
}

pub fn progress(value: u32, max: u32) -> Value {
    json!({"type": "progress", "data": {"value": value, "max": max}})
}

pub fn status(queue_remaining: u32) -> Value {
    json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": queue_remaining}}}})
}

pub fn execution_error(prompt_id: &str, exception: &str) -> Value {
    json!({
        "type": "execution_error",
        "data": {
            "prompt_id": prompt_id,
            "node_id": "7",
            "node_type": "KSampler",
            "exception_message": exception
        }
    })
}

/// Poll `cond` until it holds, failing the test after 5 seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}
