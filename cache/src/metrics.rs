//! Metrics for [crate::Cache].

use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Prefix for cache metrics.
const PREFIX: &str = "cache";

/// Metrics for [crate::Cache].
#[derive(Default)]
pub struct Metrics {
    /// Acquires served by a resident block.
    pub hits: Counter,
    /// Acquires that required a load.
    pub misses: Counter,
    /// Blocks created by `allocate`.
    pub allocations: Counter,
    /// Resident blocks evicted.
    pub evictions: Counter,
    /// Reads issued.
    pub reads: Counter,
    /// Dirty releases recorded for write-back.
    pub writes: Counter,
    /// Reads that completed with an error.
    pub read_failures: Counter,
    /// Writes that completed with an error.
    pub write_failures: Counter,
    /// Resident blocks.
    pub resident: Gauge,
    /// Blocks with at least one read in flight.
    pub loading: Gauge,
}

impl Metrics {
    /// Create and register metrics with the given registry.
    ///
    /// Metric names will be prefixed with `cache`.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        let registry = registry.sub_registry_with_prefix(PREFIX);
        registry.register("hits", "Acquires served by a resident block", metrics.hits.clone());
        registry.register("misses", "Acquires that required a load", metrics.misses.clone());
        registry.register(
            "allocations",
            "Blocks created by allocate",
            metrics.allocations.clone(),
        );
        registry.register(
            "evictions",
            "Resident blocks evicted",
            metrics.evictions.clone(),
        );
        registry.register("reads", "Reads issued", metrics.reads.clone());
        registry.register(
            "writes",
            "Dirty releases recorded for write-back",
            metrics.writes.clone(),
        );
        registry.register(
            "read_failures",
            "Reads that completed with an error",
            metrics.read_failures.clone(),
        );
        registry.register(
            "write_failures",
            "Writes that completed with an error",
            metrics.write_failures.clone(),
        );
        registry.register("resident", "Resident blocks", metrics.resident.clone());
        registry.register(
            "loading",
            "Blocks with at least one read in flight",
            metrics.loading.clone(),
        );
        metrics
    }
}
