use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate statistics for the packet store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketStats {
    /// Total packets ever stored since the last clear
    pub total_packets: usize,

    /// TCP packets on port 80 (either side)
    pub http_packets: usize,

    /// TCP packets on port 443 (either side)
    pub https_packets: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_packet_time: Option<DateTime<Utc>>,

    /// Distinct source/destination IPs seen
    pub unique_ips: usize,

    /// Distinct source/destination ports seen
    pub unique_ports: usize,
}

/// Aggregate statistics for the flow store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowStats {
    pub total: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_time: Option<DateTime<Utc>>,
}

/// Per-host rolling counters maintained by the network monitor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkStats {
    pub total_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
    pub average_latency: i64,
    pub max_latency: i64,
    pub min_latency: i64,
    pub total_bytes: i64,
    pub average_bytes: i64,
}
