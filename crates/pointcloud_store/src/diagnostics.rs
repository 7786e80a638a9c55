//! Per-store instrumentation.
//!
//! Each `PointCloudStore` holds an `Arc<DiagnosticsContext>`. By default every store gets
//! its own, so two stores in the same process never share counters; callers that want one
//! view over several stores pass the same context to `PointCloudStore::with_diagnostics`.
//!
//! The counters are plain atomics and always tick. Statement timing keeps a map of SQL text
//! to call count and elapsed time and is only recorded when enabled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct DiagnosticsContext {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    tables_created: AtomicU64,
    tables_evicted: AtomicU64,
    indexes_created: AtomicU64,
    hash_computations: AtomicU64,
    record_statements: AtomicBool,
    statements: Mutex<HashMap<String, StatementRecord>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatementRecord {
    pub calls: u64,
    pub total_micros: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub tables_created: u64,
    pub tables_evicted: u64,
    pub indexes_created: u64,
    pub hash_computations: u64,
    pub statements: Vec<(String, StatementRecord)>,
}

impl DiagnosticsContext {
    pub fn new(record_statements: bool) -> Self {
        let context = Self::default();
        context
            .record_statements
            .store(record_statements, Ordering::Relaxed);
        context
    }

    pub fn set_record_statements(&self, enabled: bool) {
        self.record_statements.store(enabled, Ordering::Relaxed);
    }

    pub fn records_statements(&self) -> bool {
        self.record_statements.load(Ordering::Relaxed)
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn table_created(&self) -> u64 {
        self.tables_created.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn table_evicted(&self) {
        self.tables_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn index_created(&self) {
        self.indexes_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hash_computed(&self) {
        self.hash_computations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn tables_created(&self) -> u64 {
        self.tables_created.load(Ordering::Relaxed)
    }

    pub fn tables_evicted(&self) -> u64 {
        self.tables_evicted.load(Ordering::Relaxed)
    }

    pub fn indexes_created(&self) -> u64 {
        self.indexes_created.load(Ordering::Relaxed)
    }

    pub fn hash_computations(&self) -> u64 {
        self.hash_computations.load(Ordering::Relaxed)
    }

    /// Runs `func` and, when statement recording is on, charges its duration to `sql`.
    pub fn time_statement<T>(&self, sql: &str, func: impl FnOnce() -> T) -> T {
        if !self.records_statements() {
            return func();
        }
        let started = Instant::now();
        let result = func();
        self.record_statement(sql, started.elapsed());
        result
    }

    pub fn record_statement(&self, sql: &str, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let mut statements = self.statements.lock();
        let record = statements.entry(sql.to_string()).or_default();
        record.calls += 1;
        record.total_micros = record.total_micros.saturating_add(micros);
    }

    pub fn statement(&self, sql: &str) -> Option<StatementRecord> {
        self.statements.lock().get(sql).copied()
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut statements: Vec<_> = self
            .statements
            .lock()
            .iter()
            .map(|(sql, record)| (sql.clone(), *record))
            .collect();
        statements.sort_by(|a, b| b.1.total_micros.cmp(&a.1.total_micros).then(a.0.cmp(&b.0)));
        DiagnosticsSnapshot {
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            tables_created: self.tables_created(),
            tables_evicted: self.tables_evicted(),
            indexes_created: self.indexes_created(),
            hash_computations: self.hash_computations(),
            statements,
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.cache_hits,
            &self.cache_misses,
            &self.tables_created,
            &self.tables_evicted,
            &self.indexes_created,
            &self.hash_computations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.statements.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent_per_context() {
        let a = DiagnosticsContext::new(false);
        let b = DiagnosticsContext::new(false);
        a.cache_hit();
        a.cache_hit();
        b.cache_miss();
        assert_eq!(a.cache_hits(), 2);
        assert_eq!(b.cache_hits(), 0);
        assert_eq!(b.cache_misses(), 1);
        assert_eq!(a.table_created(), 1);
        assert_eq!(a.table_created(), 2);
    }

    #[test]
    fn statements_are_only_timed_when_enabled() {
        let diagnostics = DiagnosticsContext::new(false);
        let value = diagnostics.time_statement("SELECT 1", || 7);
        assert_eq!(value, 7);
        assert!(diagnostics.statement("SELECT 1").is_none());

        diagnostics.set_record_statements(true);
        diagnostics.time_statement("SELECT 1", || ());
        diagnostics.time_statement("SELECT 1", || ());
        let record = diagnostics.statement("SELECT 1").expect("record");
        assert_eq!(record.calls, 2);
        assert_eq!(diagnostics.snapshot().statements.len(), 1);

        diagnostics.reset();
        assert!(diagnostics.snapshot().statements.is_empty());
    }
}
