//! Metrics collection and export module

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::time::Instant;

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Delegation cache
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub cache_updates_applied: IntCounter,
    pub cache_updates_stale: IntCounter,
    pub refresh_failures: IntCounter,
    pub refresh_coalesced: IntCounter,

    // Routing
    pub routes_base: IntCounter,
    pub routes_venue: IntCounter,
    pub route_conflicts: IntCounter,

    // Races
    pub races_started: IntCounter,
    pub races_settled: IntCounter,
    pub race_waiters_released: IntCounter,

    // Confirmation
    pub confirmations_confirmed: IntCounter,
    pub confirmations_timed_out: IntCounter,
    pub confirmations_cancelled: IntCounter,

    // Gauges
    pub active_subscriptions: IntGauge,

    // Histograms
    pub refresh_latency: Histogram,
    pub confirmation_latency: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let cache_hits = IntCounter::with_opts(Opts::new(
            "delegation_cache_hits_total",
            "Delegation lookups served from memory",
        ))?;
        let cache_misses = IntCounter::with_opts(Opts::new(
            "delegation_cache_misses_total",
            "Delegation lookups that triggered a refresh",
        ))?;
        let cache_updates_applied = IntCounter::with_opts(Opts::new(
            "delegation_cache_updates_applied_total",
            "Observations written into the delegation cache",
        ))?;
        let cache_updates_stale = IntCounter::with_opts(Opts::new(
            "delegation_cache_updates_stale_total",
            "Observations dropped because a newer slot was already cached",
        ))?;
        let refresh_failures = IntCounter::with_opts(Opts::new(
            "delegation_refresh_failures_total",
            "Refreshes where neither fetch nor subscription produced a snapshot",
        ))?;
        let refresh_coalesced = IntCounter::with_opts(Opts::new(
            "delegation_refresh_coalesced_total",
            "Refresh requests that joined one already in flight",
        ))?;

        let routes_base = IntCounter::with_opts(Opts::new(
            "routes_base_total",
            "Routing decisions that selected the base ledger",
        ))?;
        let routes_venue = IntCounter::with_opts(Opts::new(
            "routes_venue_total",
            "Routing decisions that selected a delegated venue",
        ))?;
        let route_conflicts = IntCounter::with_opts(Opts::new(
            "route_conflicts_total",
            "Transactions whose write-set spans several venues",
        ))?;

        let races_started =
            IntCounter::with_opts(Opts::new("races_started_total", "Races entered"))?;
        let races_settled =
            IntCounter::with_opts(Opts::new("races_settled_total", "Races that produced an outcome"))?;
        let race_waiters_released = IntCounter::with_opts(Opts::new(
            "race_waiters_released_total",
            "Losing waiters deregistered after a race settled",
        ))?;

        let confirmations_confirmed = IntCounter::with_opts(Opts::new(
            "confirmations_confirmed_total",
            "Transactions that reached the requested commitment",
        ))?;
        let confirmations_timed_out = IntCounter::with_opts(Opts::new(
            "confirmations_timed_out_total",
            "Confirmation waits that hit their deadline",
        ))?;
        let confirmations_cancelled = IntCounter::with_opts(Opts::new(
            "confirmations_cancelled_total",
            "Confirmation waits cancelled by the caller",
        ))?;

        let active_subscriptions = IntGauge::with_opts(Opts::new(
            "active_subscriptions",
            "Live account and signature subscriptions",
        ))?;

        let refresh_latency = Histogram::with_opts(
            HistogramOpts::new(
                "delegation_refresh_latency_seconds",
                "Time from cache miss to first observation",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0]),
        )?;
        let confirmation_latency = Histogram::with_opts(
            HistogramOpts::new(
                "confirmation_latency_seconds",
                "Time spent waiting for transaction settlement",
            )
            .buckets(vec![0.1, 0.4, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        )?;

        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_updates_applied.clone()))?;
        registry.register(Box::new(cache_updates_stale.clone()))?;
        registry.register(Box::new(refresh_failures.clone()))?;
        registry.register(Box::new(refresh_coalesced.clone()))?;
        registry.register(Box::new(routes_base.clone()))?;
        registry.register(Box::new(routes_venue.clone()))?;
        registry.register(Box::new(route_conflicts.clone()))?;
        registry.register(Box::new(races_started.clone()))?;
        registry.register(Box::new(races_settled.clone()))?;
        registry.register(Box::new(race_waiters_released.clone()))?;
        registry.register(Box::new(confirmations_confirmed.clone()))?;
        registry.register(Box::new(confirmations_timed_out.clone()))?;
        registry.register(Box::new(confirmations_cancelled.clone()))?;
        registry.register(Box::new(active_subscriptions.clone()))?;
        registry.register(Box::new(refresh_latency.clone()))?;
        registry.register(Box::new(confirmation_latency.clone()))?;

        Ok(Self {
            registry,
            cache_hits,
            cache_misses,
            cache_updates_applied,
            cache_updates_stale,
            refresh_failures,
            refresh_coalesced,
            routes_base,
            routes_venue,
            route_conflicts,
            races_started,
            races_settled,
            race_waiters_released,
            confirmations_confirmed,
            confirmations_timed_out,
            confirmations_cancelled,
            active_subscriptions,
            refresh_latency,
            confirmation_latency,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather_text(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.elapsed_secs());
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters_increment() {
        let m = metrics();
        let before = m.cache_hits.get();
        m.cache_hits.inc();
        assert!(m.cache_hits.get() >= before + 1);
    }

    #[test]
    fn test_gather_text_contains_names() {
        let m = metrics();
        m.route_conflicts.inc();
        let text = m.gather_text();
        assert!(text.contains("route_conflicts_total"));
    }
}
