use serde::Serialize;
use std::{
    fmt::{Display, Formatter},
    sync::atomic::{AtomicU64, Ordering},
};

#[derive(Debug, Default)]
pub struct InterpreterMetrics {
    pub instructions: AtomicU64,
    pub invocations: AtomicU64,
    /// Calls that went to code installed by the tiering manager.
    pub compiled_calls: AtomicU64,
    pub native_calls: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    /// Resolutions discarded because another thread committed first.
    pub cache_races: AtomicU64,
    pub getter_fast_paths: AtomicU64,
    pub exceptions_thrown: AtomicU64,
    pub exceptions_caught: AtomicU64,
    pub promotions_requested: AtomicU64,
    pub gc_scans: AtomicU64,
}

/// Point-in-time copy of [`InterpreterMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub instructions: u64,
    pub invocations: u64,
    pub compiled_calls: u64,
    pub native_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_races: u64,
    pub getter_fast_paths: u64,
    pub exceptions_thrown: u64,
    pub exceptions_caught: u64,
    pub promotions_requested: u64,
    pub gc_scans: u64,
}

fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl InterpreterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_instruction(&self) {
        inc(&self.instructions);
    }

    pub fn record_invocation(&self) {
        inc(&self.invocations);
    }

    pub fn record_compiled_call(&self) {
        inc(&self.compiled_calls);
    }

    pub fn record_native_call(&self) {
        inc(&self.native_calls);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        inc(if hit { &self.cache_hits } else { &self.cache_misses });
    }

    pub fn record_cache_race(&self) {
        inc(&self.cache_races);
    }

    pub fn record_gc_scan(&self) {
        inc(&self.gc_scans);
    }

    pub fn record_getter_fast_path(&self) {
        inc(&self.getter_fast_paths);
    }

    pub fn record_exception_thrown(&self) {
        inc(&self.exceptions_thrown);
    }

    pub fn record_exception_caught(&self) {
        inc(&self.exceptions_caught);
    }

    pub fn record_promotion(&self) {
        inc(&self.promotions_requested);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            instructions: get(&self.instructions),
            invocations: get(&self.invocations),
            compiled_calls: get(&self.compiled_calls),
            native_calls: get(&self.native_calls),
            cache_hits: get(&self.cache_hits),
            cache_misses: get(&self.cache_misses),
            cache_races: get(&self.cache_races),
            getter_fast_paths: get(&self.getter_fast_paths),
            exceptions_thrown: get(&self.exceptions_thrown),
            exceptions_caught: get(&self.exceptions_caught),
            promotions_requested: get(&self.promotions_requested),
            gc_scans: get(&self.gc_scans),
        }
    }
}

impl Display for MetricsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "instructions executed: {:>10}", self.instructions)?;
        writeln!(f, "methods interpreted:   {:>10}", self.invocations)?;
        writeln!(f, "compiled calls:        {:>10}", self.compiled_calls)?;
        writeln!(f, "native calls:          {:>10}", self.native_calls)?;
        writeln!(f, "call-site cache hits:  {:>10}", self.cache_hits)?;
        writeln!(f, "call-site cache misses:{:>10}", self.cache_misses)?;
        writeln!(f, "call-site cache races:{:>10}", self.cache_races)?;
        writeln!(f, "getter fast paths:     {:>10}", self.getter_fast_paths)?;
        writeln!(f, "exceptions thrown:     {:>10}", self.exceptions_thrown)?;
        writeln!(f, "exceptions caught:     {:>10}", self.exceptions_caught)?;
        writeln!(f, "promotions requested:  {:>10}", self.promotions_requested)?;
        write!(f, "GC root scans:         {:>10}", self.gc_scans)
    }
}
