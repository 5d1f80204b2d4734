//! Print every notification while a workflow runs.
//!
//! Handlers see frames for every prompt on this client id; the subscriber
//! gets the same frames as typed events.
//!
//! ```sh
//! cargo run --example progress_tracking -- workflow_api.json
//! ```

use comfyui_client::{CancellationToken, ComfyClient, NotificationEvent};
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
        .with_client_id("progress-example")
        .with_progress_handler(|_, p| {
            println!("  Step {}/{} ({:.0}%)", p.current_step, p.total_steps, p.fraction() * 100.0);
        })
        .with_status_handler(|_, msg| println!("  {}", msg))
        .with_execution_handler(|id, node| match node {
            Some(node) => println!("  [{}] running node {}", id, node),
            None => println!("  [{}] done", id),
        })
        .with_error_handler(|id, err| eprintln!("  [{}] {}", id, err));

    let mut events = client.subscribe().await?;
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let NotificationEvent::ExecutionStart { prompt_id } = event {
                println!("Started {}", prompt_id);
            }
        }
    });

    let prompt_id = client.queue_prompt(&workflow).await?;
    println!("Queued: {}", prompt_id);

    let done = client
        .wait_stream(&prompt_id, Duration::from_secs(300), &CancellationToken::new())
        .await?;
    println!("Done! {} image(s)", done.record.images().len());

    client.close_stream().await?;
    Ok(())
}
