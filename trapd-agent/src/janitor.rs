use std::time::Duration;

use async_trait::async_trait;
use event_queue::{DynEventQueue, EventQueue as _};

use crate::task::{ShutdownSignal, Task};

/// Hard cap on queue rows; beyond it the oldest rows are dropped
/// regardless of status. Sized for weeks of heartbeats during an outage.
pub const DEFAULT_MAX_QUEUE_ROWS: u64 = 100_000;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Periodic queue upkeep: purge terminal rows, then trim to the row cap.
///
/// Runs once at startup (a restart may follow a long outage) and hourly
/// thereafter. Maintenance failures are logged and retried next round.
pub struct QueueMaintenanceTask {
    queue: DynEventQueue,
    max_rows: u64,
}

impl QueueMaintenanceTask {
    pub fn new(queue: DynEventQueue, max_rows: u64) -> Self {
        Self { queue, max_rows }
    }

    async fn maintain(&self) -> anyhow::Result<()> {
        let sent = self.queue.delete_sent().await?;
        let dead = self.queue.delete_dead().await?;
        let trimmed = self.queue.trim_oldest_by_count(self.max_rows).await?;

        if sent + dead + trimmed > 0 {
            info!(sent, dead, trimmed, "Queue maintenance removed rows");
        }

        let stats = self.queue.stats().await?;
        debug!(
            pending = stats.pending,
            leased = stats.leased,
            total = stats.total,
            "Queue maintenance pass complete"
        );

        Ok(())
    }
}

#[async_trait]
impl Task for QueueMaintenanceTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "queue maintenance";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        loop {
            if let Err(error) = self.maintain().await {
                warn!(error = format!("{error:#}"), "Queue maintenance failed");
            }

            tokio::select! {
                () = tokio::time::sleep(MAINTENANCE_INTERVAL) => {}
                () = shutdown_signal.wait() => break,
            }
        }

        debug!("Task terminated");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use event_queue::{EventQueue, EventQueueExt as _};
    use event_queue_libsql::LibSqlEventQueue;

    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn maintenance_purges_terminals_and_trims() {
        let queue = LibSqlEventQueue::open(":memory:").await.expect("open");
        queue.setup().await.expect("setup");

        for i in 0..20 {
            queue
                .enqueue("heartbeat", &serde_json::json!({"seq": i}))
                .await
                .expect("enqueue");
        }

        queue.lease_batch(5, Duration::from_secs(300)).await.expect("lease");
        queue.mark_sent(&[1, 2, 3]).await.expect("mark sent");
        queue.mark_dead(&[4]).await.expect("mark dead");

        let queue: DynEventQueue = Arc::new(queue);
        let janitor = QueueMaintenanceTask::new(Arc::clone(&queue), 10);

        janitor.maintain().await.expect("maintain");

        let stats = queue.stats().await.expect("stats");
        assert_eq!(stats.sent, 0, "sent rows purged");
        assert_eq!(stats.dead, 0, "dead rows purged");
        assert_eq!(stats.total, 10, "trimmed to the row cap");
    }
}
