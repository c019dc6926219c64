use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Counters for the streaming engine and its networking layer.
///
/// All counters use relaxed atomics; values are only read for reporting.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Media segments appended to the sink
    pub segments_appended: AtomicU64,
    /// Init segments appended to the sink
    pub init_segments_appended: AtomicU64,
    /// Bytes appended, media and init
    pub bytes_appended: AtomicU64,
    pub prefetch_initiated: AtomicU64,
    /// Segments served from a prefetch cache
    pub prefetch_hits: AtomicU64,
    /// Segments fetched directly because no prefetch was cached
    pub prefetch_misses: AtomicU64,
    pub network_retries: AtomicU64,
    pub quota_exceeded_events: AtomicU64,
    pub decryptions: AtomicU64,
    pub media_source_resets: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_segment_appended(&self, bytes: u64) {
        self.segments_appended.fetch_add(1, Ordering::Relaxed);
        self.bytes_appended.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_init_segment_appended(&self, bytes: u64) {
        self.init_segments_appended.fetch_add(1, Ordering::Relaxed);
        self.bytes_appended.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Media bytes handed to the sink. Segments are counted separately once
    /// they complete, however many appends they took.
    pub fn record_bytes_appended(&self, bytes: u64) {
        self.bytes_appended.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_prefetch_initiated(&self) {
        self.prefetch_initiated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch_hit(&self) {
        self.prefetch_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch_miss(&self) {
        self.prefetch_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_retry(&self) {
        self.network_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quota_exceeded(&self) {
        self.quota_exceeded_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decryption(&self) {
        self.decryptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_media_source_reset(&self) {
        self.media_source_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Share of segment fetches served from a prefetch cache, in `[0, 1]`.
    pub fn prefetch_hit_rate(&self) -> f64 {
        let hits = self.prefetch_hits.load(Ordering::Relaxed);
        let misses = self.prefetch_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            segments_appended: self.segments_appended.load(Ordering::Relaxed),
            init_segments_appended: self.init_segments_appended.load(Ordering::Relaxed),
            bytes_appended: self.bytes_appended.load(Ordering::Relaxed),
            prefetch_initiated: self.prefetch_initiated.load(Ordering::Relaxed),
            prefetch_hits: self.prefetch_hits.load(Ordering::Relaxed),
            prefetch_misses: self.prefetch_misses.load(Ordering::Relaxed),
            network_retries: self.network_retries.load(Ordering::Relaxed),
            quota_exceeded_events: self.quota_exceeded_events.load(Ordering::Relaxed),
            decryptions: self.decryptions.load(Ordering::Relaxed),
            media_source_resets: self.media_source_resets.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            segments_appended = snapshot.segments_appended,
            init_segments_appended = snapshot.init_segments_appended,
            bytes_appended = snapshot.bytes_appended,
            prefetch_initiated = snapshot.prefetch_initiated,
            prefetch_hits = snapshot.prefetch_hits,
            prefetch_misses = snapshot.prefetch_misses,
            prefetch_hit_rate = format!("{:.1}%", self.prefetch_hit_rate() * 100.0),
            network_retries = snapshot.network_retries,
            quota_exceeded_events = snapshot.quota_exceeded_events,
            decryptions = snapshot.decryptions,
            media_source_resets = snapshot.media_source_resets,
            "Streaming summary"
        );
    }
}

/// A point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub segments_appended: u64,
    pub init_segments_appended: u64,
    pub bytes_appended: u64,
    pub prefetch_initiated: u64,
    pub prefetch_hits: u64,
    pub prefetch_misses: u64,
    pub network_retries: u64,
    pub quota_exceeded_events: u64,
    pub decryptions: u64,
    pub media_source_resets: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_metrics() {
        let metrics = EngineMetrics::default();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
        assert_eq!(metrics.prefetch_hit_rate(), 0.0);
    }

    #[test]
    fn test_appends_accumulate_bytes() {
        let metrics = EngineMetrics::new();
        metrics.record_init_segment_appended(100);
        metrics.record_segment_appended(1000);
        metrics.record_segment_appended(500);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.segments_appended, 2);
        assert_eq!(snapshot.init_segments_appended, 1);
        assert_eq!(snapshot.bytes_appended, 1600);
    }

    #[test]
    fn test_prefetch_hit_rate() {
        let metrics = EngineMetrics::new();
        metrics.record_prefetch_hit();
        metrics.record_prefetch_hit();
        metrics.record_prefetch_hit();
        metrics.record_prefetch_miss();
        assert!((metrics.prefetch_hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
