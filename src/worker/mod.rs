pub mod backpressure;
pub mod breaker;
pub mod rollup;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::{BusConsumer, BusRecord};
use crate::config::WorkerConfig;
use crate::error::StoreError;
use crate::metrics::AppMetrics;
use crate::model::{MetricRow, WireRecord};
use crate::storage::MetricStore;

use breaker::{BreakerState, CircuitBreaker};

/// Upper bound on how long one poll parks, so shutdown and breaker state
/// are observed promptly.
const POLL_SLICE: Duration = Duration::from_millis(200);

struct Pending {
    partition: u32,
    offset: u64,
    /// None when the payload failed to decode; the offset is still
    /// committed so a poison record cannot wedge the partition.
    row: Option<MetricRow>,
}

/// Consumes the bus, batches, and writes to the columnar store.
///
/// Offsets are committed only after the store acknowledges the covering
/// batch; at-least-once delivery is preserved across crashes, and row ids
/// derived from bus coordinates make redelivery idempotent downstream.
pub struct StreamWorker {
    config: WorkerConfig,
    consumer: Arc<dyn BusConsumer>,
    store: Arc<dyn MetricStore>,
    metrics: AppMetrics,
    breaker: CircuitBreaker,
    pending: VecDeque<Pending>,
    batch_opened_at: Option<Instant>,
}

impl StreamWorker {
    pub fn new(
        config: WorkerConfig,
        consumer: Arc<dyn BusConsumer>,
        store: Arc<dyn MetricStore>,
        metrics: AppMetrics,
    ) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_fail_threshold, config.breaker_cooldown);
        Self {
            config,
            consumer,
            store,
            metrics,
            breaker,
            pending: VecDeque::new(),
            batch_opened_at: None,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            target_batch_size = self.config.target_batch_size,
            max_flush_interval = ?self.config.max_flush_interval,
            "stream worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.breaker.poll(Instant::now()) {
                BreakerState::Open => {
                    self.metrics.set_breaker_state(self.breaker.state());
                    let wait = self
                        .breaker
                        .time_until_probe(Instant::now())
                        .unwrap_or(POLL_SLICE)
                        .min(POLL_SLICE)
                        .max(Duration::from_millis(10));
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
                BreakerState::HalfOpen => {
                    self.metrics.set_breaker_state(self.breaker.state());
                    self.probe().await;
                    continue;
                }
                BreakerState::Closed => {}
            }

            let lag = self.consumer.lag().await;
            let target = backpressure::target_batch_size(
                self.config.target_batch_size,
                lag,
                self.config.batch_min,
                self.config.batch_max,
            );
            self.metrics.set_consumer_lag(lag);
            self.metrics.set_target_batch_size(target);

            if self.pending.len() < target {
                let wait = self.config.max_flush_interval.min(POLL_SLICE);
                match self.consumer.poll(target - self.pending.len(), wait).await {
                    Ok(records) => self.enqueue(records),
                    Err(err) => {
                        warn!(error = %err, "bus poll failed");
                        tokio::time::sleep(POLL_SLICE).await;
                        continue;
                    }
                }
            }

            let batch_age = self
                .batch_opened_at
                .map(|at| at.elapsed())
                .unwrap_or_default();
            if !self.pending.is_empty()
                && (self.pending.len() >= target || batch_age >= self.config.max_flush_interval)
            {
                self.flush(self.pending.len(), self.config.insert_retry_attempts)
                    .await;
            }
        }

        self.drain_on_shutdown().await;
        info!("stream worker stopped");
    }

    fn enqueue(&mut self, records: Vec<BusRecord>) {
        if records.is_empty() {
            return;
        }
        self.metrics.add_consumed(records.len() as u64);
        if self.batch_opened_at.is_none() {
            self.batch_opened_at = Some(Instant::now());
        }
        for record in records {
            let row = match serde_json::from_slice::<WireRecord>(&record.payload) {
                Ok(wire) => Some(MetricRow::from_wire(record.partition, record.offset, wire)),
                Err(err) => {
                    warn!(
                        partition = record.partition,
                        offset = record.offset,
                        error = %err,
                        "undecodable bus payload; dead-lettering"
                    );
                    self.metrics.add_dead_letters(1);
                    None
                }
            };
            self.pending.push_back(Pending {
                partition: record.partition,
                offset: record.offset,
                row,
            });
        }
    }

    /// Flush the oldest `count` pending records. A contiguous prefix keeps
    /// per-partition offsets gap-free, so committing the prefix is safe.
    async fn flush(&mut self, count: usize, attempts: u32) {
        let count = count.min(self.pending.len());
        if count == 0 {
            return;
        }
        let rows: Vec<MetricRow> = self
            .pending
            .iter()
            .take(count)
            .filter_map(|pending| pending.row.clone())
            .collect();

        let started = Instant::now();
        let result = if rows.is_empty() {
            // Nothing decodable; just advance past the poison prefix.
            Ok(())
        } else {
            self.insert_with_retry(&rows, attempts).await
        };

        match result {
            Ok(()) => {
                self.metrics.observe_flush(started.elapsed());
                self.metrics.add_inserted(rows.len() as u64);
                self.breaker.on_success();
                self.commit_prefix(count).await;
                debug!(rows = rows.len(), "batch stored and committed");
            }
            Err(StoreError::Fatal(reason)) => {
                error!(reason, rows = rows.len(), "fatal storage error; dead-lettering batch");
                self.metrics.add_dead_letters(rows.len() as u64);
                self.commit_prefix(count).await;
            }
            Err(StoreError::Retryable(reason)) => {
                warn!(
                    reason,
                    rows = rows.len(),
                    "insert failed after in-place retries; batch retained"
                );
                self.metrics.inc_insert_failures();
                self.breaker.on_failure(Instant::now());
            }
        }
        self.metrics.set_breaker_state(self.breaker.state());
    }

    async fn insert_with_retry(
        &self,
        rows: &[MetricRow],
        attempts: u32,
    ) -> Result<(), StoreError> {
        let attempts = attempts.max(1);
        let mut backoff = self.config.insert_backoff;
        let mut last = None;
        for attempt in 1..=attempts {
            match self.store.insert_rows(rows).await {
                Ok(_) => return Ok(()),
                Err(err @ StoreError::Fatal(_)) => return Err(err),
                Err(err) => {
                    warn!(attempt, error = %err, "retryable insert failure");
                    last = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| StoreError::Retryable("insert failed".into())))
    }

    /// Drop the flushed prefix and commit the highest covered offset per
    /// partition. Never called before the storage ack.
    async fn commit_prefix(&mut self, count: usize) {
        let mut high_water: HashMap<u32, u64> = HashMap::new();
        for _ in 0..count {
            let Some(pending) = self.pending.pop_front() else {
                break;
            };
            let entry = high_water.entry(pending.partition).or_insert(pending.offset);
            *entry = (*entry).max(pending.offset);
        }
        for (partition, offset) in high_water {
            if let Err(err) = self.consumer.commit(partition, offset).await {
                warn!(partition, offset, error = %err, "offset commit failed");
            }
        }
        if self.pending.is_empty() {
            self.batch_opened_at = None;
        } else {
            self.batch_opened_at = Some(Instant::now());
        }
    }

    /// Half-open: admit one small probe insert from the oldest pending
    /// records, pulling a fresh handful if the buffer is empty.
    async fn probe(&mut self) {
        if self.pending.is_empty() {
            match self
                .consumer
                .poll(self.config.batch_min.max(1), POLL_SLICE)
                .await
            {
                Ok(records) => self.enqueue(records),
                Err(err) => {
                    warn!(error = %err, "bus poll failed during probe");
                    return;
                }
            }
        }
        if self.pending.is_empty() {
            return;
        }
        let count = self.pending.len().min(self.config.batch_min.max(1));
        self.flush(count, 1).await;
    }

    /// Stop polling, flush what is buffered, commit, exit. Anything that
    /// does not make it out stays uncommitted on the bus for redelivery.
    async fn drain_on_shutdown(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        info!(pending = self.pending.len(), "draining batch on shutdown");
        self.flush(self.pending.len(), 1).await;
        if !self.pending.is_empty() {
            warn!(
                remaining = self.pending.len(),
                "records left uncommitted for redelivery"
            );
        }
    }
}
