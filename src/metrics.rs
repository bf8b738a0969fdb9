//! Storage Metrics
//!
//! Monotonic counters and point-in-time gauges aggregated per namespace.
//! Counters use atomic increments and are read lock-free; `snapshot()` is a
//! hand-maintained copy whose exhaustiveness is enforced by destructuring.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Point-in-time gauge
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-namespace metrics collector
#[derive(Debug, Default)]
pub struct Metrics {
    // Counters
    pub inserts: Counter,
    pub insert_bytes: Counter,
    pub inserts_failed: Counter,
    pub reads: Counter,
    pub read_bytes: Counter,
    pub reads_forwarded: Counter,
    pub reads_object_store: Counter,
    pub replicate_calls: Counter,
    pub replicate_bytes: Counter,
    pub replicate_rejected: Counter,
    pub heartbeats_received: Counter,
    pub uploads: Counter,
    pub upload_bytes: Counter,
    pub upload_failures: Counter,
    pub primaries_opened: Counter,
    pub primaries_deleted: Counter,
    pub replicas_created: Counter,
    pub replicas_orphaned: Counter,
    pub replicas_deleted: Counter,

    // Gauges
    pub queued_inserts: Gauge,
    pub open_primaries: Gauge,
    pub replica_files: Gauge,
    pub orphaned_replicas: Gauge,
    pub uploads_inflight: Gauge,
}

/// Copyable view of the metrics at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub inserts: u64,
    pub insert_bytes: u64,
    pub inserts_failed: u64,
    pub reads: u64,
    pub read_bytes: u64,
    pub reads_forwarded: u64,
    pub reads_object_store: u64,
    pub replicate_calls: u64,
    pub replicate_bytes: u64,
    pub replicate_rejected: u64,
    pub heartbeats_received: u64,
    pub uploads: u64,
    pub upload_bytes: u64,
    pub upload_failures: u64,
    pub primaries_opened: u64,
    pub primaries_deleted: u64,
    pub replicas_created: u64,
    pub replicas_orphaned: u64,
    pub replicas_deleted: u64,

    pub queued_inserts: i64,
    pub open_primaries: i64,
    pub replica_files: i64,
    pub orphaned_replicas: i64,
    pub uploads_inflight: i64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every field. The destructuring pattern forces this function to
    /// be updated whenever a field is added or removed.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let Metrics {
            inserts,
            insert_bytes,
            inserts_failed,
            reads,
            read_bytes,
            reads_forwarded,
            reads_object_store,
            replicate_calls,
            replicate_bytes,
            replicate_rejected,
            heartbeats_received,
            uploads,
            upload_bytes,
            upload_failures,
            primaries_opened,
            primaries_deleted,
            replicas_created,
            replicas_orphaned,
            replicas_deleted,
            queued_inserts,
            open_primaries,
            replica_files,
            orphaned_replicas,
            uploads_inflight,
        } = self;

        MetricsSnapshot {
            inserts: inserts.get(),
            insert_bytes: insert_bytes.get(),
            inserts_failed: inserts_failed.get(),
            reads: reads.get(),
            read_bytes: read_bytes.get(),
            reads_forwarded: reads_forwarded.get(),
            reads_object_store: reads_object_store.get(),
            replicate_calls: replicate_calls.get(),
            replicate_bytes: replicate_bytes.get(),
            replicate_rejected: replicate_rejected.get(),
            heartbeats_received: heartbeats_received.get(),
            uploads: uploads.get(),
            upload_bytes: upload_bytes.get(),
            upload_failures: upload_failures.get(),
            primaries_opened: primaries_opened.get(),
            primaries_deleted: primaries_deleted.get(),
            replicas_created: replicas_created.get(),
            replicas_orphaned: replicas_orphaned.get(),
            replicas_deleted: replicas_deleted.get(),
            queued_inserts: queued_inserts.get(),
            open_primaries: open_primaries.get(),
            replica_files: replica_files.get(),
            orphaned_replicas: orphaned_replicas.get(),
            uploads_inflight: uploads_inflight.get(),
        }
    }
}

impl MetricsSnapshot {
    /// Counter series as `(name, value)` pairs
    fn counters(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("inserts_total", self.inserts),
            ("insert_bytes_total", self.insert_bytes),
            ("inserts_failed_total", self.inserts_failed),
            ("reads_total", self.reads),
            ("read_bytes_total", self.read_bytes),
            ("reads_forwarded_total", self.reads_forwarded),
            ("reads_object_store_total", self.reads_object_store),
            ("replicate_calls_total", self.replicate_calls),
            ("replicate_bytes_total", self.replicate_bytes),
            ("replicate_rejected_total", self.replicate_rejected),
            ("heartbeats_received_total", self.heartbeats_received),
            ("uploads_total", self.uploads),
            ("upload_bytes_total", self.upload_bytes),
            ("upload_failures_total", self.upload_failures),
            ("primaries_opened_total", self.primaries_opened),
            ("primaries_deleted_total", self.primaries_deleted),
            ("replicas_created_total", self.replicas_created),
            ("replicas_orphaned_total", self.replicas_orphaned),
            ("replicas_deleted_total", self.replicas_deleted),
        ]
    }

    /// Gauge series as `(name, value)` pairs
    fn gauges(&self) -> Vec<(&'static str, i64)> {
        vec![
            ("queued_inserts", self.queued_inserts),
            ("open_primaries", self.open_primaries),
            ("replica_files", self.replica_files),
            ("orphaned_replicas", self.orphaned_replicas),
            ("uploads_inflight", self.uploads_inflight),
        ]
    }

    /// Render in the Prometheus text exposition format
    pub fn render_prometheus(&self, prefix: &str, namespace: &str, out: &mut String) {
        for (name, value) in self.counters() {
            out.push_str(&format!("# TYPE {}_{} counter\n", prefix, name));
            out.push_str(&format!(
                "{}_{}{{namespace=\"{}\"}} {}\n",
                prefix, name, namespace, value
            ));
        }
        for (name, value) in self.gauges() {
            out.push_str(&format!("# TYPE {}_{} gauge\n", prefix, name));
            out.push_str(&format!(
                "{}_{}{{namespace=\"{}\"}} {}\n",
                prefix, name, namespace, value
            ));
        }
    }
}
