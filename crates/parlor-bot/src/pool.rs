//! Worker pool: consumes queued commands, runs them, publishes the replies.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parlor_core::commands::{CommandInput, CommandOutput};
use parlor_core::Broker;
use parlor_telemetry::MetricsRecorder;

use crate::error::BotError;
use crate::quote::{DEFAULT_BASE_URL, DEFAULT_TIMEOUT};
use crate::registry::CommandRegistry;

#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    /// Requested worker count. Values below 1 run a single worker.
    pub workers: i32,
    pub quote_base_url: String,
    pub http_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            quote_base_url: DEFAULT_BASE_URL.to_string(),
            http_timeout: DEFAULT_TIMEOUT,
        }
    }
}

pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    registry: Arc<CommandRegistry>,
    workers: usize,
    metrics: Arc<MetricsRecorder>,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<CommandRegistry>,
        workers: i32,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let workers = usize::try_from(workers).unwrap_or(0).max(1);
        Self {
            broker,
            registry,
            workers,
            metrics,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Spawn every worker. Each runs until its delivery stream ends or
    /// `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(
            workers = self.workers,
            commands = ?self.registry.names(),
            "starting worker pool"
        );
        (0..self.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    broker: Arc::clone(&self.broker),
                    registry: Arc::clone(&self.registry),
                    metrics: Arc::clone(&self.metrics),
                };
                tokio::spawn(worker.run(cancel.clone()))
            })
            .collect()
    }
}

struct Worker {
    id: usize,
    broker: Arc<dyn Broker>,
    registry: Arc<CommandRegistry>,
    metrics: Arc<MetricsRecorder>,
}

impl Worker {
    async fn run(self, cancel: CancellationToken) {
        let mut deliveries = self.broker.consume(cancel.clone());
        self.metrics.gauge_inc("bot.workers_active", &[], 1);
        debug!(worker_id = self.id, "worker consuming");

        loop {
            let raw = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                msg = deliveries.next() => match msg {
                    Some(raw) => raw,
                    None => break,
                },
            };

            let Some(output) = self.process(&raw).await else {
                continue;
            };

            let payload = match serde_json::to_vec(&output) {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) => {
                    warn!(worker_id = self.id, error = %e, "failed to encode command output");
                    continue;
                }
            };
            if let Err(e) = self.broker.publish(payload).await {
                self.metrics.counter_inc("bot.publish_errors", &[], 1);
                warn!(
                    worker_id = self.id,
                    room_id = %output.room_id,
                    error = %e,
                    error_kind = e.error_kind(),
                    "failed to publish command output"
                );
            }
        }

        self.metrics.gauge_inc("bot.workers_active", &[], -1);
        info!(worker_id = self.id, "worker stopped");
    }

    /// Decode one delivery and run it. `None` means the delivery was skipped.
    async fn process(&self, raw: &[u8]) -> Option<CommandOutput> {
        let input: CommandInput = match serde_json::from_slice(raw) {
            Ok(input) => input,
            Err(e) => {
                self.metrics.counter_inc("bot.decode_errors", &[], 1);
                warn!(worker_id = self.id, error = %e, "skipping undecodable command");
                return None;
            }
        };

        let result = self
            .registry
            .execute(&input.command_name, &input.command)
            .await;
        let (outcome, message) = match result {
            Ok(message) => ("ok", message),
            Err(e) => {
                let outcome = if matches!(e, BotError::InvalidCommand(_)) {
                    "invalid"
                } else {
                    "failed"
                };
                warn!(
                    worker_id = self.id,
                    room_id = %input.room_id,
                    command = %input.command_name,
                    error = %e,
                    "command failed"
                );
                (
                    outcome,
                    format!(
                        "could not execute command: {} error: {:?}",
                        input.command_name,
                        e.to_string()
                    ),
                )
            }
        };
        self.metrics
            .counter_inc("bot.commands", &[("outcome", outcome)], 1);
        debug!(worker_id = self.id, room_id = %input.room_id, outcome, "command processed");

        Some(CommandOutput::from_assistant(input.room_id, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::MockQuoteApi;
    use parlor_core::commands::ASSISTANT_NAME;
    use parlor_core::ids::RoomId;
    use parlor_core::MemoryBroker;

    struct Fixture {
        hub_side: MemoryBroker,
        pool: WorkerPool,
        metrics: Arc<MetricsRecorder>,
    }

    fn fixture(workers: i32) -> Fixture {
        let (hub_side, worker_side) = MemoryBroker::pair(16);
        let metrics = Arc::new(MetricsRecorder::new());
        let registry = Arc::new(CommandRegistry::new(Arc::new(MockQuoteApi::with_price(
            "138.12",
        ))));
        let pool = WorkerPool::new(Arc::new(worker_side), registry, workers, metrics.clone());
        Fixture {
            hub_side,
            pool,
            metrics,
        }
    }

    async fn next_output(hub_side: &MemoryBroker, cancel: &CancellationToken) -> CommandOutput {
        let mut stream = hub_side.consume(cancel.clone());
        let raw = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for output")
            .expect("stream ended");
        serde_json::from_slice(&raw).unwrap()
    }

    fn input(room: i64, name: &str, command: &str) -> Bytes {
        let input = CommandInput {
            room_id: RoomId(room),
            from: "alice".into(),
            command_name: name.into(),
            command: command.into(),
        };
        Bytes::from(serde_json::to_vec(&input).unwrap())
    }

    #[test]
    fn worker_count_clamped_to_one() {
        assert_eq!(fixture(0).pool.worker_count(), 1);
        assert_eq!(fixture(-3).pool.worker_count(), 1);
        assert_eq!(fixture(4).pool.worker_count(), 4);
    }

    #[test]
    fn default_config() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.workers, 1);
        assert_eq!(config.http_timeout, Duration::from_secs(20));
    }

    #[tokio::test]
    async fn stock_command_round_trip() {
        let f = fixture(1);
        let cancel = CancellationToken::new();
        let handles = f.pool.start(cancel.clone());

        f.hub_side.publish(input(7, "stock", "amzn.us")).await.unwrap();
        let out = next_output(&f.hub_side, &cancel).await;

        assert_eq!(out.room_id, RoomId(7));
        assert_eq!(out.from, ASSISTANT_NAME);
        assert_eq!(out.message, "AMZN.US quote is $138.12 per share");
        assert_eq!(f.metrics.counter_get("bot.commands", &[("outcome", "ok")]), 1);

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn unknown_command_publishes_one_failure() {
        let f = fixture(2);
        let cancel = CancellationToken::new();
        let handles = f.pool.start(cancel.clone());

        f.hub_side.publish(input(3, "echo", "hi")).await.unwrap();
        let mut stream = f.hub_side.consume(cancel.clone());
        let raw = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        let out: CommandOutput = serde_json::from_slice(&raw).unwrap();

        assert_eq!(out.room_id, RoomId(3));
        assert_eq!(out.from, ASSISTANT_NAME);
        assert_eq!(
            out.message,
            r#"could not execute command: echo error: "invalid command""#
        );

        // Exactly one output for one input.
        let extra = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(extra.is_err());
        assert_eq!(
            f.metrics.counter_get("bot.commands", &[("outcome", "invalid")]),
            1
        );

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn undecodable_message_is_skipped() {
        let f = fixture(1);
        let cancel = CancellationToken::new();
        let handles = f.pool.start(cancel.clone());

        f.hub_side.publish(Bytes::from_static(b"not json")).await.unwrap();
        f.hub_side.publish(input(1, "stock", "aapl.us")).await.unwrap();

        let out = next_output(&f.hub_side, &cancel).await;
        assert_eq!(out.message, "AAPL.US quote is $138.12 per share");
        assert_eq!(f.metrics.counter_get("bot.decode_errors", &[]), 1);

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn quote_failure_becomes_assistant_text() {
        let (hub_side, worker_side) = MemoryBroker::pair(4);
        let registry = Arc::new(CommandRegistry::new(Arc::new(MockQuoteApi::not_found())));
        let pool = WorkerPool::new(
            Arc::new(worker_side),
            registry,
            1,
            Arc::new(MetricsRecorder::new()),
        );
        let cancel = CancellationToken::new();
        let handles = pool.start(cancel.clone());

        hub_side.publish(input(2, "stock", "nope.us")).await.unwrap();
        let out = next_output(&hub_side, &cancel).await;
        assert_eq!(
            out.message,
            r#"could not execute command: stock error: "quote error: no quote available for nope.us""#
        );

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn workers_stop_when_broker_closes() {
        let f = fixture(3);
        let handles = f.pool.start(CancellationToken::new());
        drop(f.hub_side);

        for h in handles {
            tokio::time::timeout(Duration::from_secs(2), h)
                .await
                .expect("worker did not stop")
                .unwrap();
        }
        assert_eq!(f.metrics.gauge_get("bot.workers_active", &[]), 0);
    }

    #[tokio::test]
    async fn active_workers_gauge_tracks_running_workers() {
        let f = fixture(2);
        let cancel = CancellationToken::new();
        let handles = f.pool.start(cancel.clone());

        for _ in 0..100 {
            if f.metrics.gauge_get("bot.workers_active", &[]) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.metrics.gauge_get("bot.workers_active", &[]), 2);

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(f.metrics.gauge_get("bot.workers_active", &[]), 0);
    }
}
