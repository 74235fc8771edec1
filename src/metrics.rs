use crate::cache::HitLevel;
use crate::clock::now_millis;
use crate::models::Tier;
use crate::tasks::{PeriodicTask, TaskGroup};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMetric {
    pub timestamp_ms: u64,
    pub request_id: String,
    pub method: String,
    pub endpoint: String,
    pub status_code: u16,
    pub duration_ms: f64,
    pub success: bool,
    pub user_id: Option<String>,
    pub user_tier: Option<Tier>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiMetric {
    pub timestamp_ms: u64,
    pub user_id: String,
    pub model: String,
    pub duration_ms: f64,
    pub success: bool,
    pub tokens_used: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheOperation {
    Get,
    Set,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetric {
    pub timestamp_ms: u64,
    pub operation: CacheOperation,
    pub level: Option<HitLevel>,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserActivityMetric {
    pub timestamp_ms: u64,
    pub user_id: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealthSample {
    pub timestamp_ms: u64,
    pub in_flight_requests: u64,
    pub buffered_samples: usize,
    pub uptime_secs: u64,
}

/// Bounded buffer; on overflow the oldest half is discarded.
#[derive(Debug)]
struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(2),
        }
    }

    fn push(&mut self, item: T) {
        if self.items.len() >= self.capacity {
            self.items.drain(..self.capacity / 2);
        }
        self.items.push_back(item);
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }
}

struct Buffers {
    api: RingBuffer<ApiMetric>,
    ai: RingBuffer<AiMetric>,
    cache: RingBuffer<CacheMetric>,
    activity: RingBuffer<UserActivityMetric>,
    health: RingBuffer<SystemHealthSample>,
}

impl Buffers {
    fn total(&self) -> usize {
        self.api.len() + self.ai.len() + self.cache.len() + self.activity.len() + self.health.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAggregate {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    /// Fraction of failed calls, 0.0..=1.0.
    pub error_rate: f64,
    /// Requests per second over the window.
    pub throughput: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiAggregate {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub success_rate: f64,
    pub avg_ms: f64,
    pub tokens_used: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheAggregate {
    pub lookups: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedMetrics {
    pub window_start_ms: u64,
    pub window_end_ms: u64,
    pub api: ApiAggregate,
    pub ai: AiAggregate,
    pub cache: CacheAggregate,
    pub active_users: usize,
}

/// Value at quantile `q` (0.0..=1.0) of an ascending slice, interpolating
/// linearly between the two nearest ranks.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// In-memory metrics with on-demand aggregation.
pub struct MetricsCollector {
    buffers: RwLock<Buffers>,
    in_flight: AtomicU64,
    started: Instant,
    tasks: TaskGroup,
}

impl MetricsCollector {
    pub fn new(max_samples: usize) -> Self {
        Self {
            buffers: RwLock::new(Buffers {
                api: RingBuffer::new(max_samples),
                ai: RingBuffer::new(max_samples),
                cache: RingBuffer::new(max_samples),
                activity: RingBuffer::new(max_samples),
                health: RingBuffer::new(max_samples),
            }),
            in_flight: AtomicU64::new(0),
            started: Instant::now(),
            tasks: TaskGroup::new(),
        }
    }

    pub async fn record_api(&self, metric: ApiMetric) {
        self.buffers.write().await.api.push(metric);
    }

    pub async fn record_ai(&self, metric: AiMetric) {
        self.buffers.write().await.ai.push(metric);
    }

    pub async fn record_cache(&self, operation: CacheOperation, level: Option<HitLevel>, duration: Duration) {
        self.buffers.write().await.cache.push(CacheMetric {
            timestamp_ms: now_millis(),
            operation,
            level,
            duration_ms: duration.as_secs_f64() * 1000.0,
        });
    }

    pub async fn record_user_activity(&self, user_id: &str, action: &str) {
        self.buffers.write().await.activity.push(UserActivityMetric {
            timestamp_ms: now_millis(),
            user_id: user_id.to_string(),
            action: action.to_string(),
        });
    }

    pub async fn sample_system_health(&self) -> SystemHealthSample {
        let mut buffers = self.buffers.write().await;
        let sample = SystemHealthSample {
            timestamp_ms: now_millis(),
            in_flight_requests: self.in_flight.load(Ordering::Relaxed),
            buffered_samples: buffers.total(),
            uptime_secs: self.started.elapsed().as_secs(),
        };
        buffers.health.push(sample.clone());
        sample
    }

    pub fn request_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(&self) {
        // Never wraps below zero even if calls are unbalanced.
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub async fn recent_api(&self, limit: usize) -> Vec<ApiMetric> {
        let buffers = self.buffers.read().await;
        buffers.api.iter().rev().take(limit).cloned().collect()
    }

    pub async fn latest_health(&self) -> Option<SystemHealthSample> {
        self.buffers.read().await.health.iter().last().cloned()
    }

    /// Aggregates every sample with `start_ms <= timestamp < end_ms`.
    pub async fn aggregate(&self, start_ms: u64, end_ms: u64) -> AggregatedMetrics {
        let buffers = self.buffers.read().await;
        let in_window = |ts: u64| ts >= start_ms && ts < end_ms;

        let api: Vec<&ApiMetric> = buffers.api.iter().filter(|m| in_window(m.timestamp_ms)).collect();
        let mut durations: Vec<f64> = api.iter().map(|m| m.duration_ms).collect();
        durations.sort_by(|a, b| a.total_cmp(b));
        let success = api.iter().filter(|m| m.success).count() as u64;
        let total = api.len() as u64;
        let elapsed_secs = end_ms.saturating_sub(start_ms) as f64 / 1000.0;

        let api_agg = ApiAggregate {
            total,
            success,
            failure: total - success,
            avg_ms: mean(&durations),
            p95_ms: percentile(&durations, 0.95),
            p99_ms: percentile(&durations, 0.99),
            error_rate: ratio(total - success, total),
            throughput: if elapsed_secs > 0.0 {
                total as f64 / elapsed_secs
            } else {
                0.0
            },
        };

        let ai: Vec<&AiMetric> = buffers.ai.iter().filter(|m| in_window(m.timestamp_ms)).collect();
        let ai_total = ai.len() as u64;
        let ai_success = ai.iter().filter(|m| m.success).count() as u64;
        let ai_durations: Vec<f64> = ai.iter().map(|m| m.duration_ms).collect();
        let ai_agg = AiAggregate {
            total: ai_total,
            success: ai_success,
            failure: ai_total - ai_success,
            success_rate: if ai_total == 0 { 1.0 } else { ratio(ai_success, ai_total) },
            avg_ms: mean(&ai_durations),
            tokens_used: ai.iter().map(|m| m.tokens_used).sum(),
        };

        let mut cache_agg = CacheAggregate::default();
        for metric in buffers
            .cache
            .iter()
            .filter(|m| m.operation == CacheOperation::Get && in_window(m.timestamp_ms))
        {
            cache_agg.lookups += 1;
            match metric.level {
                Some(HitLevel::L1) => cache_agg.l1_hits += 1,
                Some(HitLevel::L2) => cache_agg.l2_hits += 1,
                Some(HitLevel::Miss) | None => cache_agg.misses += 1,
            }
        }
        cache_agg.hit_rate = ratio(cache_agg.l1_hits + cache_agg.l2_hits, cache_agg.lookups);

        let active_users: HashSet<&str> = buffers
            .activity
            .iter()
            .filter(|m| in_window(m.timestamp_ms))
            .map(|m| m.user_id.as_str())
            .collect();

        AggregatedMetrics {
            window_start_ms: start_ms,
            window_end_ms: end_ms,
            api: api_agg,
            ai: ai_agg,
            cache: cache_agg,
            active_users: active_users.len(),
        }
    }

    /// Aggregate over the trailing `window`.
    pub async fn latest(&self, window: Duration) -> AggregatedMetrics {
        let end = now_millis() + 1;
        let start = end.saturating_sub(window.as_millis() as u64);
        self.aggregate(start, end).await
    }

    /// Starts the flush-summary and health-sampling timers.
    pub fn start(self: &Arc<Self>, flush_interval: Duration, health_interval: Duration) {
        let collector = self.clone();
        self.tasks.push(PeriodicTask::spawn("metrics-flush", flush_interval, move || {
            let collector = collector.clone();
            async move {
                let summary = collector.latest(flush_interval).await;
                info!(
                    target: "covergate::metrics",
                    requests = summary.api.total,
                    error_rate = summary.api.error_rate,
                    p95_ms = summary.api.p95_ms,
                    throughput = summary.api.throughput,
                    ai_generations = summary.ai.total,
                    cache_hit_rate = summary.cache.hit_rate,
                    active_users = summary.active_users,
                    "Metrics summary"
                );
            }
        }));

        let collector = self.clone();
        self.tasks.push(PeriodicTask::spawn("system-health", health_interval, move || {
            let collector = collector.clone();
            async move {
                collector.sample_system_health().await;
            }
        }));
    }

    pub fn stop(&self) {
        self.tasks.stop_all();
    }

    pub fn running_tasks(&self) -> usize {
        self.tasks.running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(ts: u64, duration_ms: f64, success: bool) -> ApiMetric {
        ApiMetric {
            timestamp_ms: ts,
            request_id: "r".into(),
            method: "GET".into(),
            endpoint: "/api/test".into(),
            status_code: if success { 200 } else { 500 },
            duration_ms,
            success,
            user_id: None,
            user_tier: None,
            error_code: None,
        }
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(percentile(&sorted, 0.5), 30.0);
        assert!((percentile(&sorted, 0.95) - 48.0).abs() < 1e-9);
        assert_eq!(percentile(&sorted, 1.0), 50.0);
        assert_eq!(percentile(&[], 0.95), 0.0);
        assert_eq!(percentile(&[7.0], 0.99), 7.0);
    }

    #[test]
    fn test_ring_buffer_drops_oldest_half() {
        let mut buffer = RingBuffer::new(4);
        for i in 0..5 {
            buffer.push(i);
        }
        let items: Vec<i32> = buffer.iter().copied().collect();
        assert_eq!(items, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_aggregate_window_bounds() {
        let collector = MetricsCollector::new(100);
        collector.record_api(api(1_000, 10.0, true)).await;
        collector.record_api(api(1_500, 30.0, false)).await;
        collector.record_api(api(2_000, 50.0, true)).await;

        let agg = collector.aggregate(1_000, 2_000).await;
        assert_eq!(agg.api.total, 2);
        assert_eq!(agg.api.failure, 1);
        assert_eq!(agg.api.error_rate, 0.5);
        assert_eq!(agg.api.avg_ms, 20.0);
        assert_eq!(agg.api.throughput, 2.0);
    }

    #[tokio::test]
    async fn test_recent_api_newest_first() {
        let collector = MetricsCollector::new(100);
        for ts in [1_000, 2_000, 3_000] {
            collector.record_api(api(ts, 10.0, true)).await;
        }
        let recent: Vec<u64> = collector
            .recent_api(2)
            .await
            .iter()
            .map(|m| m.timestamp_ms)
            .collect();
        assert_eq!(recent, vec![3_000, 2_000]);
    }

    #[tokio::test]
    async fn test_cache_and_ai_aggregates() {
        let collector = MetricsCollector::new(100);
        collector
            .record_cache(CacheOperation::Get, Some(HitLevel::L1), Duration::from_micros(5))
            .await;
        collector
            .record_cache(CacheOperation::Get, Some(HitLevel::Miss), Duration::from_micros(5))
            .await;
        collector
            .record_ai(AiMetric {
                timestamp_ms: now_millis(),
                user_id: "u1".into(),
                model: "m".into(),
                duration_ms: 900.0,
                success: true,
                tokens_used: 120,
                error: None,
            })
            .await;
        collector.record_user_activity("u1", "GET /api/me").await;
        collector.record_user_activity("u1", "GET /api/cover-letters").await;

        let agg = collector.latest(Duration::from_secs(60)).await;
        assert_eq!(agg.cache.lookups, 2);
        assert_eq!(agg.cache.hit_rate, 0.5);
        assert_eq!(agg.ai.tokens_used, 120);
        assert_eq!(agg.ai.success_rate, 1.0);
        assert_eq!(agg.active_users, 1);
    }

    #[tokio::test]
    async fn test_in_flight_tracking_and_health_sample() {
        let collector = MetricsCollector::new(10);
        collector.request_started();
        collector.request_started();
        collector.request_finished();
        let sample = collector.sample_system_health().await;
        assert_eq!(sample.in_flight_requests, 1);
        assert!(collector.latest_health().await.is_some());

        collector.request_finished();
        collector.request_finished();
        assert_eq!(collector.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop_background_tasks() {
        let collector = Arc::new(MetricsCollector::new(10));
        collector.start(Duration::from_secs(60), Duration::from_millis(10));
        assert_eq!(collector.running_tasks(), 2);
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(collector.latest_health().await.is_some());
        collector.stop();
        assert_eq!(collector.running_tasks(), 0);
    }
}
