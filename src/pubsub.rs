//! Alert fan-out bus
//!
//! Ephemeral pub/sub for realtime alert delivery plus the global smoothed
//! threat-score key. `RedisBus` speaks to a broker; `MemoryBus` keeps the
//! same contract in-process for tests and broker-less deployments.
//! Publish failures never fail the pipeline; they are logged and counted
//! by the caller.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Channel carrying UTF-8 JSON alert records
pub const ALERT_CHANNEL: &str = "nds:alerts:realtime";
/// Key holding the smoothed global threat score as a string float
pub const THREAT_SCORE_KEY: &str = "nds:threat_score";

/// Exponential smoothing factor for the global threat score
pub const THREAT_SCORE_ALPHA: f64 = 0.3;

/// Buffered messages per subscriber before lagging
const SUBSCRIBER_DEPTH: usize = 256;

/// Publish/subscribe seam between the decision engine and the broadcaster
#[async_trait]
pub trait AlertBus: Send + Sync {
    /// Publish one alert JSON payload to the realtime channel
    async fn publish_alert(&self, payload: &str) -> Result<()>;

    /// Store the smoothed global threat score
    async fn set_threat_score(&self, score: f64) -> Result<()>;

    /// Subscribe to the realtime channel; only future alerts are delivered
    async fn subscribe(&self) -> Result<broadcast::Receiver<String>>;

    /// Liveness probe for the health endpoint
    async fn ping(&self) -> bool;
}

/// In-process bus backed by a broadcast channel
pub struct MemoryBus {
    tx: broadcast::Sender<String>,
    score: Mutex<f64>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_DEPTH);
        Self {
            tx,
            score: Mutex::new(0.0),
        }
    }

    pub fn threat_score(&self) -> f64 {
        *self.score.lock()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertBus for MemoryBus {
    async fn publish_alert(&self, payload: &str) -> Result<()> {
        // No receivers is fine; the channel is ephemeral by contract
        let _ = self.tx.send(payload.to_string());
        Ok(())
    }

    async fn set_threat_score(&self, score: f64) -> Result<()> {
        *self.score.lock() = score;
        Ok(())
    }

    async fn subscribe(&self) -> Result<broadcast::Receiver<String>> {
        Ok(self.tx.subscribe())
    }

    async fn ping(&self) -> bool {
        true
    }
}

/// Redis-backed bus
///
/// One multiplexed publisher handle is reused for every send; the channel
/// is subscribed exactly once and fanned out locally to however many
/// websocket clients attach.
pub struct RedisBus {
    manager: redis::aio::ConnectionManager,
    fanout: broadcast::Sender<String>,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("redis connection failed")?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .context("redis subscriber connection failed")?;
        pubsub
            .subscribe(ALERT_CHANNEL)
            .await
            .context("channel subscription failed")?;

        let (fanout, _) = broadcast::channel(SUBSCRIBER_DEPTH);
        let tx = fanout.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<String>() {
                    // No receivers just means no clients right now
                    Ok(payload) => {
                        let _ = tx.send(payload);
                    }
                    Err(e) => error!("malformed pub/sub payload: {}", e),
                }
            }
            error!("pub/sub subscription stream ended");
        });

        info!("connected to redis at {}", url);
        Ok(Self { manager, fanout })
    }
}

#[async_trait]
impl AlertBus for RedisBus {
    async fn publish_alert(&self, payload: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(ALERT_CHANNEL)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .context("alert publish failed")?;
        Ok(())
    }

    async fn set_threat_score(&self, score: f64) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(THREAT_SCORE_KEY)
            .arg(score.to_string())
            .query_async(&mut conn)
            .await
            .context("threat score update failed")?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<broadcast::Receiver<String>> {
        Ok(self.fanout.subscribe())
    }

    async fn ping(&self) -> bool {
        let mut conn = self.manager.clone();
        let pong: Result<String, redis::RedisError> =
            redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_bus_delivers_to_subscribers() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe().await.unwrap();

        bus.publish_alert("{\"severity\":\"high\"}").await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert!(msg.contains("high"));
    }

    #[tokio::test]
    async fn test_memory_bus_no_replay() {
        let bus = MemoryBus::new();
        bus.publish_alert("early").await.unwrap();

        // Subscribing after the fact sees only future messages
        let mut rx = bus.subscribe().await.unwrap();
        bus.publish_alert("late").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "late");
    }

    #[tokio::test]
    async fn test_memory_bus_threat_score() {
        let bus = MemoryBus::new();
        bus.set_threat_score(0.42).await.unwrap();
        assert!((bus.threat_score() - 0.42).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = MemoryBus::new();
        assert!(bus.publish_alert("nobody listening").await.is_ok());
        assert!(bus.ping().await);
    }
}
