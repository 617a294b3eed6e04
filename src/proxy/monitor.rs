use dashmap::DashMap;
use std::collections::HashMap;
use std::net::IpAddr;

use crate::models::stats::NetworkStats;

/// Per-host rolling request counters, updated on every flow completion.
pub struct NetworkMonitor {
    stats: DashMap<String, NetworkStats>,
}

impl NetworkMonitor {
    pub fn new() -> Self {
        Self {
            stats: DashMap::new(),
        }
    }

    /// Record one request outcome for `host`. Success means the upstream
    /// answered with a status below 400; aborted flows count as failed.
    pub fn record_request(&self, host: &str, success: bool, latency_ms: i64, bytes: i64) {
        let mut entry = self.stats.entry(host.to_string()).or_default();

        entry.total_requests += 1;
        if success {
            entry.successful_requests += 1;
        } else {
            entry.failed_requests += 1;
        }

        if entry.min_latency == 0 || latency_ms < entry.min_latency {
            entry.min_latency = latency_ms;
        }
        if latency_ms > entry.max_latency {
            entry.max_latency = latency_ms;
        }
        entry.average_latency =
            (entry.average_latency * (entry.total_requests - 1) + latency_ms) / entry.total_requests;

        entry.total_bytes += bytes;
        entry.average_bytes = entry.total_bytes / entry.total_requests;
    }

    /// Snapshot of one host's counters.
    pub fn get_stats(&self, host: &str) -> Option<NetworkStats> {
        self.stats.get(host).map(|s| s.clone())
    }

    /// Snapshot of every host's counters.
    pub fn get_all_stats(&self) -> HashMap<String, NetworkStats> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Purely local peer classification. A real geo database is an extension
/// point; everything non-local resolves to "unknown" sentinels.
pub struct GeoLocationService {}

impl GeoLocationService {
    pub fn new() -> Self {
        Self {}
    }

    /// Returns (country, region, city, isp, asn) labels for an address.
    pub fn location_info(&self, ip: &str) -> (String, String, String, String, String) {
        let label = |s: &str| {
            (
                s.to_string(),
                s.to_string(),
                s.to_string(),
                format!("{} network", s),
                format!("{} ASN", s),
            )
        };

        match ip.parse::<IpAddr>() {
            Ok(addr) if addr.is_loopback() => label("local"),
            Ok(IpAddr::V4(v4)) if v4.is_private() => label("private"),
            _ => {
                let unknown = "unknown".to_string();
                (
                    unknown.clone(),
                    unknown.clone(),
                    unknown.clone(),
                    unknown.clone(),
                    unknown,
                )
            }
        }
    }

    pub fn is_private(&self, ip: &str) -> bool {
        match ip.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => v4.is_private(),
            Ok(IpAddr::V6(v6)) => (v6.segments()[0] & 0xFE00) == 0xFC00,
            Err(_) => false,
        }
    }
}

impl Default for GeoLocationService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_mean_matches_arithmetic() {
        let monitor = NetworkMonitor::new();
        monitor.record_request("h.example", true, 100, 10);
        monitor.record_request("h.example", true, 200, 30);
        monitor.record_request("h.example", false, 300, 20);

        let stats = monitor.get_stats("h.example").unwrap();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.successful_requests, 2);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.average_latency, 200);
        assert_eq!(stats.total_bytes, 60);
        assert_eq!(stats.average_bytes, 20);
    }

    #[test]
    fn min_latency_initialized_from_first_sample() {
        let monitor = NetworkMonitor::new();
        monitor.record_request("h.example", true, 150, 0);
        let stats = monitor.get_stats("h.example").unwrap();
        assert_eq!(stats.min_latency, 150);
        assert_eq!(stats.max_latency, 150);

        monitor.record_request("h.example", true, 50, 0);
        monitor.record_request("h.example", true, 400, 0);
        let stats = monitor.get_stats("h.example").unwrap();
        assert_eq!(stats.min_latency, 50);
        assert_eq!(stats.max_latency, 400);
    }

    #[test]
    fn hosts_are_tracked_independently() {
        let monitor = NetworkMonitor::new();
        monitor.record_request("a.example", true, 10, 1);
        monitor.record_request("b.example", false, 20, 2);

        let all = monitor.get_all_stats();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a.example"].successful_requests, 1);
        assert_eq!(all["b.example"].failed_requests, 1);
    }

    #[test]
    fn geo_sentinels() {
        let geo = GeoLocationService::new();
        assert_eq!(geo.location_info("127.0.0.1").0, "local");
        assert_eq!(geo.location_info("192.168.0.5").0, "private");
        assert_eq!(geo.location_info("93.184.216.34").0, "unknown");
        assert!(geo.is_private("10.1.2.3"));
        assert!(!geo.is_private("8.8.8.8"));
    }
}
