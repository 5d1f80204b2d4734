//! Polling-only client, for gateways that do not proxy WebSockets.
//!
//! ```sh
//! cargo run --example streaming_disabled -- workflow_api.json
//! ```

use comfyui_client::{CancellationToken, ComfyClient, ComfyError};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "workflow_api.json".to_string());
    let workflow: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;

    let client = ComfyClient::new("http://127.0.0.1:8188")
        .with_client_id("polling-only")
        .without_streaming()
        .with_timeout(Duration::from_secs(15));

    let prompt_id = client.queue_prompt(&workflow).await?;
    println!("Queued: {}", prompt_id);

    let cancel = CancellationToken::new();
    match client.wait_stream(&prompt_id, Duration::ZERO, &cancel).await {
        Err(ComfyError::StreamingDisabled) => println!("Streaming is off, polling history instead"),
        other => println!("Unexpected: {:?}", other.map(|r| r.prompt_id)),
    }

    // Give up after ten minutes.
    let deadline = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(600)).await;
        deadline.cancel();
    });

    let done = client
        .wait_poll(&prompt_id, Duration::from_secs(2), &cancel)
        .await?;
    println!(
        "Finished with status {}, {} image(s)",
        done.record.status_str(),
        done.record.images().len()
    );

    let queue = client.queue_status().await?;
    println!("Queue: {} running, {} pending", queue.running_count(), queue.pending_count());
    Ok(())
}
