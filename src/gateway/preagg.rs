//! Pre-aggregation buffer.
//!
//! Samples sharing an aggregation key within the same minute collapse into
//! one aggregated record before publish. The buffer is sharded by key hash
//! so concurrent request handlers rarely touch the same lock. Quantiles
//! come from a bounded reservoir sample per key.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::config::PreaggConfig;
use crate::model::{
    AggregateSummary, AggregationKey, MetricSample, MetricType, WireRecord,
};

const SHARDS: usize = 16;
const RESERVOIR_CAPACITY: usize = 256;

/// Bounded uniform sample of the values seen under one key.
#[derive(Debug)]
pub struct Reservoir {
    samples: Vec<f64>,
    seen: u64,
}

impl Reservoir {
    fn new() -> Self {
        Self {
            samples: Vec::new(),
            seen: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        self.seen += 1;
        if self.samples.len() < RESERVOIR_CAPACITY {
            self.samples.push(value);
            return;
        }
        let slot = rand::thread_rng().gen_range(0..self.seen);
        if (slot as usize) < RESERVOIR_CAPACITY {
            self.samples[slot as usize] = value;
        }
    }

    fn quantile(&self, q: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let index = ((sorted.len() as f64) * q) as usize;
        sorted[index.min(sorted.len() - 1)]
    }
}

struct Accumulator {
    metric_type: MetricType,
    environment: Option<String>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    error_count: u64,
    reservoir: Reservoir,
}

impl Accumulator {
    fn new(sample: &MetricSample) -> Self {
        Self {
            metric_type: sample.metric_type,
            environment: sample.environment.clone(),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            error_count: 0,
            reservoir: Reservoir::new(),
        }
    }

    fn observe(&mut self, sample: &MetricSample) {
        self.count += 1;
        self.sum += sample.value;
        self.min = self.min.min(sample.value);
        self.max = self.max.max(sample.value);
        if sample.status_code.is_some_and(|code| code >= 500) {
            self.error_count += 1;
        }
        self.reservoir.observe(sample.value);
    }
}

pub struct PreAggregator {
    shards: Vec<Mutex<HashMap<AggregationKey, Accumulator>>>,
    max_keys: usize,
    total_keys: AtomicUsize,
}

impl PreAggregator {
    pub fn new(config: &PreaggConfig) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            max_keys: config.max_keys.max(1),
            total_keys: AtomicUsize::new(0),
        }
    }

    /// Buffer a sample under its aggregation key. Returns false when the
    /// sample has no key (no endpoint); the caller publishes it raw.
    pub fn record(&self, sample: &MetricSample) -> bool {
        let Some(key) = AggregationKey::from_sample(sample) else {
            return false;
        };
        let shard = &self.shards[self.shard_for(&key)];
        let mut entries = shard.lock().expect("preagg shard poisoned");
        let accumulator = entries.entry(key).or_insert_with(|| {
            self.total_keys.fetch_add(1, Ordering::Relaxed);
            Accumulator::new(sample)
        });
        accumulator.observe(sample);
        true
    }

    /// True once the distinct-key cap is reached; the caller should flush.
    pub fn over_capacity(&self) -> bool {
        self.total_keys.load(Ordering::Relaxed) >= self.max_keys
    }

    /// Drain every shard into one aggregated record per key.
    pub fn drain(&self, received_at: i64) -> Vec<WireRecord> {
        let mut records = Vec::new();
        for shard in &self.shards {
            let entries = {
                let mut guard = shard.lock().expect("preagg shard poisoned");
                std::mem::take(&mut *guard)
            };
            for (key, accumulator) in entries {
                self.total_keys.fetch_sub(1, Ordering::Relaxed);
                records.push(to_record(key, accumulator, received_at));
            }
        }
        records
    }

    fn shard_for(&self, key: &AggregationKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }
}

fn to_record(key: AggregationKey, accumulator: Accumulator, received_at: i64) -> WireRecord {
    let mean = if accumulator.count > 0 {
        accumulator.sum / accumulator.count as f64
    } else {
        0.0
    };
    let sample = MetricSample {
        timestamp: key.minute,
        service_name: key.service_name,
        metric_name: key.metric_name,
        metric_type: accumulator.metric_type,
        value: mean,
        endpoint: Some(key.endpoint),
        method: if key.method.is_empty() {
            None
        } else {
            Some(key.method)
        },
        status_code: if key.status_code == 0 {
            None
        } else {
            Some(key.status_code)
        },
        duration_ms: None,
        tags: Default::default(),
        trace_id: None,
        span_id: None,
        environment: accumulator.environment,
    };
    WireRecord {
        sample,
        received_at,
        aggregated: true,
        resolution_minutes: 1,
        summary: Some(AggregateSummary {
            min_value: accumulator.min,
            max_value: accumulator.max,
            p50: accumulator.reservoir.quantile(0.50),
            p95: accumulator.reservoir.quantile(0.95),
            p99: accumulator.reservoir.quantile(0.99),
            sample_count: accumulator.count,
            error_count: accumulator.error_count,
        }),
    }
}
