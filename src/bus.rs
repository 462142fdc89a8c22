use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::config::BusConfig;
use crate::error::BusError;

/// One consumed record: ordered within its partition, at-least-once.
#[derive(Debug, Clone)]
pub struct BusRecord {
    pub partition: u32,
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Publish side of the message bus contract.
///
/// Records are keyed; all records sharing a key land on the same partition,
/// preserving per-key FIFO ordering end to end.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), BusError>;
    /// Block until previously published records are accepted by the bus.
    async fn flush(&self) -> Result<(), BusError>;
    /// Readiness probe for the gateway's /readyz.
    fn is_reachable(&self) -> bool;
}

/// Consume side of the message bus contract.
///
/// Offsets are committed explicitly; nothing is considered delivered until
/// the consumer commits it, so uncommitted records are redelivered to the
/// next subscriber (at-least-once).
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Wait up to `timeout` for records. Returns an empty batch on timeout.
    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<Vec<BusRecord>, BusError>;
    /// Commit every offset up to and including `offset` on `partition`.
    async fn commit(&self, partition: u32, offset: u64) -> Result<(), BusError>;
    /// End offset minus committed offset, summed over partitions.
    async fn lag(&self) -> u64;
}

struct PartitionLog {
    /// (offset, payload); front is the oldest retained record.
    records: VecDeque<(u64, Vec<u8>)>,
    next_offset: u64,
    /// Next offset a fresh subscriber starts from.
    committed: u64,
}

impl PartitionLog {
    fn new() -> Self {
        Self {
            records: VecDeque::new(),
            next_offset: 0,
            committed: 0,
        }
    }
}

struct BusInner {
    partitions: Vec<Mutex<PartitionLog>>,
    capacity: usize,
    notify: Notify,
}

/// Embedded, process-local broker honoring the bus contract: partitioned
/// ordered logs, explicit commits, redelivery of uncommitted records, and
/// trim-on-commit retention. A Kafka-class bus substitutes behind the same
/// traits in multi-process deployments.
#[derive(Clone)]
pub struct InProcessBus {
    inner: Arc<BusInner>,
}

impl InProcessBus {
    pub fn new(config: &BusConfig) -> Self {
        let partitions = (0..config.partitions.max(1))
            .map(|_| Mutex::new(PartitionLog::new()))
            .collect();
        Self {
            inner: Arc::new(BusInner {
                partitions,
                capacity: config.partition_buffer,
                notify: Notify::new(),
            }),
        }
    }

    /// Create a consumer starting from the committed offsets.
    pub fn subscribe(&self) -> InProcessConsumer {
        InProcessConsumer {
            inner: Arc::clone(&self.inner),
            positions: Mutex::new(Vec::new()),
        }
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions.len() as u64) as usize
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let index = self.partition_for(key);
        let mut log = self.inner.partitions[index].lock().await;
        if log.records.len() >= self.inner.capacity {
            return Err(BusError::retryable(
                format!("partition {index} buffer full"),
                Duration::from_millis(100),
            ));
        }
        let offset = log.next_offset;
        log.records.push_back((offset, payload));
        log.next_offset += 1;
        drop(log);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn flush(&self) -> Result<(), BusError> {
        // Appends are synchronous; nothing is buffered on the publish side.
        Ok(())
    }

    fn is_reachable(&self) -> bool {
        true
    }
}

pub struct InProcessConsumer {
    inner: Arc<BusInner>,
    /// Next offset to read per partition. Lazily initialized from the
    /// committed offsets, so a fresh consumer redelivers uncommitted records.
    positions: Mutex<Vec<u64>>,
}

impl InProcessConsumer {
    async fn ensure_positions(&self) {
        let mut positions = self.positions.lock().await;
        if positions.is_empty() {
            for partition in &self.inner.partitions {
                positions.push(partition.lock().await.committed);
            }
        }
    }

    async fn collect(&self, max_records: usize) -> Vec<BusRecord> {
        let mut positions = self.positions.lock().await;
        let mut out = Vec::new();
        for (index, partition) in self.inner.partitions.iter().enumerate() {
            if out.len() >= max_records {
                break;
            }
            let log = partition.lock().await;
            let position = positions[index];
            for (offset, payload) in log.records.iter() {
                if *offset < position {
                    continue;
                }
                if out.len() >= max_records {
                    break;
                }
                out.push(BusRecord {
                    partition: index as u32,
                    offset: *offset,
                    payload: payload.clone(),
                });
            }
            if let Some(last) = out
                .iter()
                .rev()
                .find(|record| record.partition == index as u32)
            {
                positions[index] = last.offset + 1;
            }
        }
        out
    }
}

#[async_trait]
impl BusConsumer for InProcessConsumer {
    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<Vec<BusRecord>, BusError> {
        self.ensure_positions().await;

        let records = self.collect(max_records).await;
        if !records.is_empty() {
            return Ok(records);
        }

        // Park until a publish lands or the timeout elapses, then rescan.
        let notified = self.inner.notify.notified();
        let _ = tokio::time::timeout(timeout, notified).await;
        Ok(self.collect(max_records).await)
    }

    async fn commit(&self, partition: u32, offset: u64) -> Result<(), BusError> {
        let Some(log) = self.inner.partitions.get(partition as usize) else {
            return Err(BusError::Fatal(format!("unknown partition {partition}")));
        };
        let mut log = log.lock().await;
        let next = offset + 1;
        if next > log.committed {
            log.committed = next;
            // Committed records leave the retention buffer.
            while log
                .records
                .front()
                .is_some_and(|(front, _)| *front < next)
            {
                log.records.pop_front();
            }
            debug!(partition, committed = next, "offsets committed");
        }
        Ok(())
    }

    async fn lag(&self) -> u64 {
        let mut total = 0;
        for partition in &self.inner.partitions {
            let log = partition.lock().await;
            total += log.next_offset - log.committed;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus(partitions: u32) -> InProcessBus {
        InProcessBus::new(&BusConfig {
            partitions,
            partition_buffer: 16,
        })
    }

    #[tokio::test]
    async fn per_key_ordering_is_preserved() {
        let bus = bus(4);
        let consumer = bus.subscribe();
        for i in 0..5u8 {
            bus.publish("svc-a", vec![i]).await.expect("publish");
        }

        let records = consumer
            .poll(10, Duration::from_millis(10))
            .await
            .expect("poll");
        assert_eq!(records.len(), 5);
        let payloads: Vec<u8> = records.iter().map(|r| r.payload[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
        // One key maps to exactly one partition.
        assert!(records.iter().all(|r| r.partition == records[0].partition));
    }

    #[tokio::test]
    async fn uncommitted_records_are_redelivered_to_a_new_consumer() {
        let bus = bus(1);
        let first = bus.subscribe();
        bus.publish("svc", b"one".to_vec()).await.expect("publish");
        bus.publish("svc", b"two".to_vec()).await.expect("publish");

        let records = first.poll(10, Duration::from_millis(10)).await.expect("poll");
        assert_eq!(records.len(), 2);
        first.commit(0, records[0].offset).await.expect("commit");
        drop(first);

        // Only the committed prefix is skipped on resubscribe.
        let second = bus.subscribe();
        let replayed = second.poll(10, Duration::from_millis(10)).await.expect("poll");
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].payload, b"two");
        assert_eq!(replayed[0].offset, records[1].offset);
    }

    #[tokio::test]
    async fn lag_tracks_uncommitted_backlog() {
        let bus = bus(2);
        let consumer = bus.subscribe();
        assert_eq!(consumer.lag().await, 0);

        for i in 0..6u8 {
            bus.publish(&format!("svc-{i}"), vec![i]).await.expect("publish");
        }
        assert_eq!(consumer.lag().await, 6);

        let records = consumer
            .poll(10, Duration::from_millis(10))
            .await
            .expect("poll");
        for record in &records {
            consumer
                .commit(record.partition, record.offset)
                .await
                .expect("commit");
        }
        assert_eq!(consumer.lag().await, 0);
    }

    #[tokio::test]
    async fn full_partition_pushes_back_with_retryable() {
        let bus = bus(1);
        for i in 0..16u8 {
            bus.publish("svc", vec![i]).await.expect("publish");
        }
        let err = bus.publish("svc", vec![0xFF]).await.expect_err("overflow");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn poll_times_out_empty_without_traffic() {
        let bus = bus(1);
        let consumer = bus.subscribe();
        let records = consumer
            .poll(10, Duration::from_millis(20))
            .await
            .expect("poll");
        assert!(records.is_empty());
    }
}
