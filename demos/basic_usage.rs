//! Submit an API-format workflow, poll history until it finishes, and save
//! the output images.
//!
//! ```sh
//! cargo run --example basic_usage -- workflow_api.json
//! ```

use comfyui_client::{CancellationToken, ComfyClient};
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
        .with_client_id("basic-usage")
        .without_streaming();
    if !client.health().await? {
        eprintln!("ComfyUI is not responding at {}", client.endpoint());
        return Ok(());
    }

    let prompt_id = client.queue_prompt(&workflow).await?;
    println!("Queued: {}", prompt_id);

    // Polling has no attempt limit; bound it with a deadline.
    let cancel = CancellationToken::new();
    let deadline = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(300)).await;
        deadline.cancel();
    });

    let done = client
        .wait_poll(&prompt_id, Duration::from_secs(1), &cancel)
        .await?;
    println!("Finished with status {}", done.record.status_str());

    for img in done.record.images() {
        let bytes = client.image(&img).await?;
        std::fs::write(&img.filename, &bytes)?;
        println!("Saved {} ({} bytes)", img.filename, bytes.len());
    }
    Ok(())
}
