use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use async_trait::async_trait;
use event_queue::{DynEventQueue, EventQueueExt as _};
use rand::Rng as _;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::collector::{HardwareInfo, HostInfo, IdentityInfo, InventoryCollector};
use crate::config::Conf;
use crate::identity::SensorId;
use crate::sender::BatchSender;
use crate::task::{ShutdownSignal, Task};
use crate::version;

const HEARTBEAT_KIND: &str = "heartbeat";
const HEARTBEAT_MESSAGE: &str = "agent heartbeat";

/// Recovery pause after a failed tick.
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Ticks are spread by ±10% so a fleet sharing a start time doesn’t hit
/// the intake in lockstep.
const CADENCE_JITTER: f64 = 0.10;

#[derive(Serialize)]
struct HeartbeatEnvelope<'a> {
    sensor_id: &'a str,
    project_id: &'a str,
    ts: String,
    kind: &'static str,
    message: &'static str,
    host: &'a HostInfo,
    agent: AgentInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    hardware: Option<&'a HardwareInfo>,
    identity: &'a IdentityInfo,
}

#[derive(Serialize)]
struct AgentInfo {
    version: String,
    uptime_seconds: u64,
    last_restart: String,
}

/// The periodic collect → enqueue → drain loop.
pub struct HeartbeatTask {
    conf: Arc<Conf>,
    queue: DynEventQueue,
    sender: BatchSender,
    collector: InventoryCollector,
    sensor_id: SensorId,
    started_at: Instant,
    started_at_utc: OffsetDateTime,
}

impl HeartbeatTask {
    pub fn new(conf: Arc<Conf>, queue: DynEventQueue, sender: BatchSender, sensor_id: SensorId) -> Self {
        Self {
            conf,
            queue,
            sender,
            collector: InventoryCollector::new(),
            sensor_id,
            started_at: Instant::now(),
            started_at_utc: OffsetDateTime::now_utc(),
        }
    }

    /// One tick: collect inventory, persist the heartbeat, drain once.
    ///
    /// Also the whole of `--once` mode.
    pub async fn tick(&mut self, shutdown_signal: &mut ShutdownSignal) -> anyhow::Result<()> {
        let snapshot = self.collector.collect();

        let envelope = HeartbeatEnvelope {
            sensor_id: self.sensor_id.value(),
            project_id: &self.conf.project_id,
            ts: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .context("failed to format heartbeat timestamp")?,
            kind: HEARTBEAT_KIND,
            message: HEARTBEAT_MESSAGE,
            host: &snapshot.host,
            agent: AgentInfo {
                version: version::agent_version(),
                uptime_seconds: self.started_at.elapsed().as_secs(),
                last_restart: self
                    .started_at_utc
                    .format(&Rfc3339)
                    .context("failed to format agent start time")?,
            },
            hardware: snapshot.hardware.as_ref(),
            identity: &snapshot.identity,
        };

        let id = self
            .queue
            .enqueue(HEARTBEAT_KIND, &envelope)
            .await
            .context("failed to enqueue heartbeat")?;

        trace!(id, "Enqueued heartbeat");

        self.sender
            .run_once(shutdown_signal)
            .await
            .context("drain cycle failed")?;

        Ok(())
    }
}

#[async_trait]
impl Task for HeartbeatTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "heartbeat worker";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!(interval_s = self.conf.interval.as_secs(), "Task started");

        loop {
            if let Err(error) = self.tick(&mut shutdown_signal).await {
                // Steady-state errors are survived; the store and the
                // intake both get another chance next tick.
                warn!(error = format!("{error:#}"), "Heartbeat tick failed");

                tokio::select! {
                    () = tokio::time::sleep(ERROR_RETRY_DELAY) => {}
                    () = shutdown_signal.wait() => break,
                }
            }

            let delay = jittered_interval(self.conf.interval);

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown_signal.wait() => break,
            }
        }

        debug!("Task terminated");

        Ok(())
    }
}

/// `interval × (1 + u)` with `u` uniform in `[-0.10, +0.10]`.
fn jittered_interval(interval: Duration) -> Duration {
    let u = rand::thread_rng().gen_range(-CADENCE_JITTER..=CADENCE_JITTER);
    interval.mul_f64(1.0 + u)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::InventorySnapshot;

    #[test]
    fn jitter_stays_within_ten_percent() {
        let interval = Duration::from_secs(60);
        let lower = Duration::from_secs_f64(60.0 * 0.9);
        let upper = Duration::from_secs_f64(60.0 * 1.1);

        for _ in 0..1000 {
            let delay = jittered_interval(interval);
            assert!(delay >= lower, "delay {delay:?} under 0.9×interval");
            assert!(delay <= upper, "delay {delay:?} over 1.1×interval");
        }
    }

    #[test]
    fn jitter_actually_varies() {
        let interval = Duration::from_secs(3600);
        let samples: Vec<Duration> = (0..50).map(|_| jittered_interval(interval)).collect();
        assert!(samples.iter().any(|sample| sample != &samples[0]));
    }

    #[test]
    fn envelope_serializes_with_the_wire_shape() {
        let snapshot: InventorySnapshot = InventoryCollector::new().collect();

        let envelope = HeartbeatEnvelope {
            sensor_id: "0123456789abcdef0123456789abcdef",
            project_id: "proj-1",
            ts: "2026-08-01T12:00:00Z".to_owned(),
            kind: HEARTBEAT_KIND,
            message: HEARTBEAT_MESSAGE,
            host: &snapshot.host,
            agent: AgentInfo {
                version: "0.3.2".to_owned(),
                uptime_seconds: 17,
                last_restart: "2026-08-01T11:59:43Z".to_owned(),
            },
            hardware: snapshot.hardware.as_ref(),
            identity: &snapshot.identity,
        };

        let value = serde_json::to_value(&envelope).expect("envelope serializes");

        assert_eq!(value["kind"], "heartbeat");
        assert_eq!(value["sensor_id"], "0123456789abcdef0123456789abcdef");
        assert_eq!(value["project_id"], "proj-1");
        assert_eq!(value["agent"]["version"], "0.3.2");
        assert_eq!(value["agent"]["uptime_seconds"], 17);
        assert!(value["host"]["hostname"].is_string());
        assert!(value["host"]["ip_addrs"].is_array());
        assert!(value["identity"]["joined"].is_boolean());

        // The timestamp round-trips as RFC 3339.
        let ts = value["ts"].as_str().expect("ts is a string");
        assert!(OffsetDateTime::parse(ts, &Rfc3339).is_ok());
    }
}
