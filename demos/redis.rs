use std::sync::Arc;
use std::time::Duration;
use taskforge::prelude::*;
use taskforge::queue::{dead_key, pending_key, scheduled_key};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ForgeConfig::development();
    config.logging.init()?;

    println!("🚀 taskforge Redis example");

    let redis_config =
        RedisConfig::new("redis://localhost:6379").with_key_prefix("taskforge-demo");
    config.queue = QueueConfig {
        backend: QueueBackendConfig::Redis(redis_config.clone()),
        ..QueueConfig::default()
    };
    config.server = config
        .server
        .with_queue("critical", 6)
        .with_queue("default", 3)
        .with_queue("low", 1);

    println!("🔗 Connecting to Redis at {}", redis_config.connection_string);
    let queue = RedisQueue::new(redis_config, config.queue.clone()).await?;
    for name in ["critical", "default", "low"] {
        queue.clear(&pending_key(name)).await?;
        queue.clear(&scheduled_key(name)).await?;
        queue.clear(&dead_key(name)).await?;
    }
    let queue: TaskQueue = Arc::new(queue);

    let server = Server::with_adapter(config, Arc::clone(&queue));
    server
        .register_handler("hello", |ctx: TaskContext, task: Task| async move {
            println!(
                "👋 [{}] {}",
                ctx.queue,
                String::from_utf8_lossy(&task.payload)
            );
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<(), BoxError>(())
        })
        .await?;

    let client = Client::new(queue);
    for (queue, text) in [
        ("low", "whenever"),
        ("default", "soon"),
        ("critical", "now!"),
    ] {
        client
            .enqueue(
                "hello",
                text.as_bytes().to_vec(),
                TaskOptions::new().with_queue(queue),
            )
            .await?;
    }
    client
        .enqueue_at(
            "hello",
            chrono::Utc::now() + chrono::Duration::seconds(5),
            b"five seconds later".to_vec(),
            TaskOptions::new(),
        )
        .await?;

    server.run_until_signal().await?;

    for name in ["critical", "default", "low"] {
        let stats = client.queue_stats(name).await?;
        println!(
            "📊 {}: pending {} scheduled {} dead {}",
            name, stats.pending, stats.scheduled, stats.dead
        );
    }
    Ok(())
}
