use serde::{Deserialize, Serialize};
use std::time::Duration;
use taskforge::prelude::*;

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    name: String,
    message: String,
}

#[tokio::main]
async fn main() -> ForgeResult<()> {
    let config = ForgeConfig::development();
    config.logging.init()?;

    let server = Server::new(config);
    server
        .register_handler("greet", |ctx: TaskContext, task: Task| async move {
            let greeting: Greeting = serde_json::from_slice(&task.payload)?;
            println!(
                "👋 Hello {}: {} (attempt {})",
                greeting.name,
                greeting.message,
                ctx.retry_count + 1
            );
            Ok::<(), BoxError>(())
        })
        .await?;

    server
        .register_handler("flaky", |ctx: TaskContext, _task: Task| async move {
            if ctx.retry_count < 2 {
                return Err(format!("attempt {} failed", ctx.retry_count + 1).into());
            }
            println!("✅ flaky task {} finally succeeded", ctx.task_id);
            Ok::<(), BoxError>(())
        })
        .await?;

    let client = server.client();
    client
        .enqueue_json(
            "greet",
            &Greeting {
                name: "Ada".to_string(),
                message: "right away".to_string(),
            },
            TaskOptions::new(),
        )
        .await?;
    client
        .enqueue_in(
            "greet",
            Duration::from_secs(3),
            serde_json::to_vec(&Greeting {
                name: "Grace".to_string(),
                message: "three seconds later".to_string(),
            })?,
            TaskOptions::new(),
        )
        .await?;
    client.enqueue("flaky", vec![], TaskOptions::new()).await?;

    println!("🔨 Server running! Press Ctrl+C to stop...");
    server.run_until_signal().await?;

    let stats = server.worker_stats().await;
    println!(
        "🔨 Server stopped: {} completed, {} retried, {} dead",
        stats.tasks_completed, stats.tasks_retried, stats.tasks_dead_lettered
    );
    Ok(())
}
