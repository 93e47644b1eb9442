//! taskline-notifier: task notification consumer
//!
//! Connects to RabbitMQ, declares the task notification topology and logs
//! every CREATE/UPDATE/DELETE notification it receives.
//!
//! ## Architecture
//! ```text
//! [task service] --(task_notifications_exchange)--> task_{create,update,delete}_queue
//!                                                            |
//!                                                            v
//!                                                   [taskline-notifier] --> log
//! ```
//!
//! ## Configuration
//! - TASKLINE_CONFIG: YAML config file (optional)
//! - RABBITMQ_HOST / RABBITMQ_PORT / RABBITMQ_USER / RABBITMQ_PASSWORD / RABBITMQ_VHOST
//! - TASKLINE_LOG: tracing filter (default: info)
//!
//! Exits non-zero if any consumer stops, e.g. after the broker connection
//! drops.

use std::sync::Arc;

use tracing::{error, info};

use taskline::bus::{init_connection_manager, LoggingNotificationHandler, TaskConsumer};
use taskline::config::Config;
use taskline::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(None)?;
    init_tracing(config.logging.format);

    let manager = init_connection_manager(&config.broker);
    let consumer = TaskConsumer::new(
        Arc::clone(&manager),
        config.broker.consumer_tag_prefix.clone(),
    );
    let mut handle = consumer
        .consume(Arc::new(LoggingNotificationHandler))
        .await?;

    info!(
        consumers = handle.consumer_count(),
        "taskline-notifier started"
    );

    let stopped = tokio::select! {
        _ = shutdown_signal() => None,
        result = handle.wait() => Some(result),
    };

    handle.shutdown();
    manager.close().await;

    // No reconnect here: exit non-zero and leave restarts to the supervisor.
    if let Some(result) = stopped {
        match result {
            Ok(()) => error!("Consumer stopped unexpectedly"),
            Err(e) => error!(error = %e, "Consumer task failed"),
        }
        return Err("consumer stopped".into());
    }

    info!("taskline-notifier stopped");
    Ok(())
}
