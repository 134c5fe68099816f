use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters, shared by every event task.
#[derive(Debug, Default)]
pub struct Metrics {
    events_total: AtomicU64,
    events_failed: AtomicU64,
    sends_ok: AtomicU64,
    sends_denied: AtomicU64,
    sends_failed: AtomicU64,
    writes_ok: AtomicU64,
    writes_failed: AtomicU64,
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_total: u64,
    pub events_failed: u64,
    pub sends_ok: u64,
    pub sends_denied: u64,
    pub sends_failed: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
    pub memory_bytes: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_failure(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send(&self) {
        self.sends_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_denied(&self) {
        self.sends_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failed(&self) {
        self.sends_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, ok: bool) {
        let counter = if ok { &self.writes_ok } else { &self.writes_failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_total: self.events_total.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            sends_ok: self.sends_ok.load(Ordering::Relaxed),
            sends_denied: self.sends_denied.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
            writes_ok: self.writes_ok.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
            memory_bytes: resident_memory(),
        }
    }
}

impl MetricsSnapshot {
    /// Share of events handled without error, as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.events_total == 0 {
            return 100.0;
        }
        let ok = self.events_total.saturating_sub(self.events_failed);
        (ok as f64 / self.events_total as f64) * 100.0
    }
}

/// Resident set size from /proc, 0 elsewhere
fn resident_memory() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb) = line.split_whitespace().nth(1) {
                        if let Ok(kb) = kb.parse::<u64>() {
                            return kb * 1024;
                        }
                    }
                }
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let snap = Metrics::new().snapshot();
        assert_eq!(snap.events_total, 0);
        assert_eq!(snap.sends_ok, 0);
        assert_eq!(snap.writes_failed, 0);
    }

    #[test]
    fn test_record_events() {
        let metrics = Metrics::new();
        metrics.record_event();
        metrics.record_event();
        metrics.record_event();
        metrics.record_event();
        metrics.record_event_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.events_total, 4);
        assert_eq!(snap.events_failed, 1);
        assert_eq!(snap.success_rate(), 75.0);
    }

    #[test]
    fn test_success_rate_zero_events() {
        assert_eq!(MetricsSnapshot::default().success_rate(), 100.0);
    }

    #[test]
    fn test_record_sends_and_writes() {
        let metrics = Metrics::new();
        metrics.record_send();
        metrics.record_send_denied();
        metrics.record_send_denied();
        metrics.record_send_failed();
        metrics.record_write(true);
        metrics.record_write(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.sends_ok, 1);
        assert_eq!(snap.sends_denied, 2);
        assert_eq!(snap.sends_failed, 1);
        assert_eq!(snap.writes_ok, 1);
        assert_eq!(snap.writes_failed, 1);
    }

    #[test]
    fn test_snapshot_serialization() {
        let metrics = Metrics::new();
        metrics.record_event();
        let snap = metrics.snapshot();

        let json = serde_json::to_string(&snap).unwrap();
        let back: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}
