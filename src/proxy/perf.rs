use dashmap::DashMap;
use hickory_resolver::TokioResolver;
use log::debug;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::models::flow::{ErrorInfo, PerformanceMetrics};
use crate::utils::error::{AppError, AppResult};

/// Deadline for the out-of-band DNS timing lookup
pub const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Collects per-flow timing slots, keyed by flow id.
///
/// Every slot starts at the -1 "not measured" sentinel and is written once
/// by the subsystem that owns the measurement.
pub struct PerformanceCollector {
    metrics: DashMap<String, PerformanceMetrics>,
}

impl PerformanceCollector {
    pub fn new() -> Self {
        Self {
            metrics: DashMap::new(),
        }
    }

    /// Allocate the timing slots for a new flow.
    pub fn start_collecting(&self, flow_id: &str) -> PerformanceMetrics {
        let metrics = PerformanceMetrics::default();
        self.metrics.insert(flow_id.to_string(), metrics);
        metrics
    }

    pub fn record_dns_lookup(&self, flow_id: &str, elapsed: Duration) {
        self.record(flow_id, |m| m.dns_lookup_time = elapsed.as_millis() as i64);
    }

    pub fn record_tcp_connect(&self, flow_id: &str, elapsed: Duration) {
        self.record(flow_id, |m| m.tcp_connect_time = elapsed.as_millis() as i64);
    }

    pub fn record_tls_handshake(&self, flow_id: &str, elapsed: Duration) {
        self.record(flow_id, |m| {
            m.tls_handshake_time = elapsed.as_millis() as i64
        });
    }

    pub fn record_ttfb(&self, flow_id: &str, elapsed: Duration) {
        self.record(flow_id, |m| m.ttfb = elapsed.as_millis() as i64);
    }

    pub fn record_content_transfer(&self, flow_id: &str, elapsed: Duration) {
        self.record(flow_id, |m| {
            m.content_transfer_time = elapsed.as_millis() as i64
        });
    }

    pub fn record_total_time(&self, flow_id: &str, total_ms: i64) {
        self.record(flow_id, |m| m.total_time = total_ms);
    }

    fn record(&self, flow_id: &str, set: impl FnOnce(&mut PerformanceMetrics)) {
        if let Some(mut entry) = self.metrics.get_mut(flow_id) {
            set(&mut entry);
        }
    }

    /// Snapshot of one flow's timings.
    pub fn get_metrics(&self, flow_id: &str) -> Option<PerformanceMetrics> {
        self.metrics.get(flow_id).map(|m| *m)
    }

    /// Snapshot of every in-flight flow's timings, cloned under the lock.
    pub fn get_all_metrics(&self) -> HashMap<String, PerformanceMetrics> {
        self.metrics
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Drop the slots for a finalized flow.
    pub fn cleanup(&self, flow_id: &str) {
        self.metrics.remove(flow_id);
    }
}

impl Default for PerformanceCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Slot store for per-flow abort reasons, consumed at finalization.
pub struct ErrorCollector {
    errors: DashMap<String, ErrorInfo>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self {
            errors: DashMap::new(),
        }
    }

    pub fn record_error(&self, flow_id: &str, kind: &str, message: String, is_timeout: bool) {
        self.errors
            .insert(flow_id.to_string(), ErrorInfo::new(kind, message, is_timeout));
    }

    pub fn get_error(&self, flow_id: &str) -> Option<ErrorInfo> {
        self.errors.get(flow_id).map(|e| e.clone())
    }

    pub fn cleanup(&self, flow_id: &str) {
        self.errors.remove(flow_id);
    }
}

impl Default for ErrorCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// DNS resolver wrapper that reports how long a lookup took.
pub struct TimedResolver {
    resolver: TokioResolver,
}

impl TimedResolver {
    /// Build from the system resolver configuration.
    pub fn system() -> AppResult<Self> {
        let resolver = TokioResolver::builder_tokio()
            .map_err(|e| AppError::Io(std::io::Error::other(e)))?
            .build();
        Ok(Self { resolver })
    }

    /// Resolve `host` (a name or an address literal, optionally `:port`
    /// suffixed) and measure the wall-clock cost.
    pub async fn resolve_with_timing(
        &self,
        host: &str,
    ) -> Result<(Vec<IpAddr>, Duration), AppError> {
        let name = host.split(':').next().unwrap_or(host);

        // Address literals resolve instantly and skip the resolver.
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok((vec![ip], Duration::ZERO));
        }

        let started = Instant::now();
        let lookup = tokio::time::timeout(DNS_TIMEOUT, self.resolver.lookup_ip(name))
            .await
            .map_err(|_| AppError::Timeout(format!("DNS lookup for {}", name)))?
            .map_err(|e| AppError::UpstreamDialFailed(format!("DNS lookup failed: {}", e)))?;
        let elapsed = started.elapsed();

        let ips: Vec<IpAddr> = lookup.iter().collect();
        debug!("resolved {} to {} addresses in {:?}", name, ips.len(), elapsed);
        Ok((ips, elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_start_at_sentinel() {
        let collector = PerformanceCollector::new();
        let metrics = collector.start_collecting("f1");
        assert_eq!(metrics.dns_lookup_time, -1);
        assert_eq!(metrics.tcp_connect_time, -1);
        assert_eq!(metrics.tls_handshake_time, -1);
        assert_eq!(metrics.ttfb, -1);
        assert_eq!(metrics.content_transfer_time, -1);
        assert_eq!(metrics.total_time, -1);
    }

    #[test]
    fn records_are_keyed_by_flow() {
        let collector = PerformanceCollector::new();
        collector.start_collecting("f1");
        collector.start_collecting("f2");

        collector.record_dns_lookup("f1", Duration::from_millis(42));
        collector.record_total_time("f2", 1000);

        assert_eq!(collector.get_metrics("f1").unwrap().dns_lookup_time, 42);
        assert_eq!(collector.get_metrics("f1").unwrap().total_time, -1);
        assert_eq!(collector.get_metrics("f2").unwrap().total_time, 1000);
    }

    #[test]
    fn recording_an_unknown_flow_is_a_noop() {
        let collector = PerformanceCollector::new();
        collector.record_ttfb("missing", Duration::from_millis(5));
        assert!(collector.get_metrics("missing").is_none());
    }

    #[test]
    fn cleanup_removes_the_slot() {
        let collector = PerformanceCollector::new();
        collector.start_collecting("f1");
        collector.cleanup("f1");
        assert!(collector.get_metrics("f1").is_none());
        assert!(collector.get_all_metrics().is_empty());
    }

    #[test]
    fn error_collector_flags_kinds() {
        let errors = ErrorCollector::new();
        errors.record_error("f1", "tls", "handshake refused".into(), false);
        let err = errors.get_error("f1").unwrap();
        assert!(err.is_tls);
        assert!(!err.is_dns && !err.is_network);

        errors.record_error("f2", "dns", "lookup timed out".into(), true);
        let err = errors.get_error("f2").unwrap();
        assert!(err.is_dns && err.is_timeout);
    }

    #[tokio::test]
    async fn ip_literal_resolves_without_network() {
        let resolver = TimedResolver::system().unwrap();
        let (ips, elapsed) = resolver.resolve_with_timing("127.0.0.1:8443").await.unwrap();
        assert_eq!(ips, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(elapsed, Duration::ZERO);
    }
}
