//! Queue one workflow several times and wait for all of them on the one
//! shared WebSocket.
//!
//! ```sh
//! cargo run --example concurrent_waits -- workflow_api.json 4
//! ```

use comfyui_client::{CancellationToken, ComfyClient};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let path = args.next().unwrap_or_else(|| "workflow_api.json".to_string());
    let count: usize = args.next().map(|n| n.parse()).transpose()?.unwrap_or(3);
    let workflow: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;

    let client = ComfyClient::new("http://127.0.0.1:8188").with_client_id("concurrent-waits");
    let cancel = CancellationToken::new();

    // Ctrl-C abandons every wait at once.
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    client.ensure_connected().await?;
    let mut tasks = Vec::with_capacity(count);
    for _ in 0..count {
        let prompt_id = client.queue_prompt(&workflow).await?;
        println!("Queued: {}", prompt_id);

        let client = client.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            client
                .wait_stream(&prompt_id, Duration::from_secs(600), &cancel)
                .await
        }));
    }

    for task in tasks {
        match task.await? {
            Ok(done) => println!("{}: {} image(s)", done.prompt_id, done.record.images().len()),
            Err(e) => eprintln!("wait failed: {}", e),
        }
    }

    client.close_stream().await?;
    Ok(())
}
