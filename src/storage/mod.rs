pub mod memory;
pub mod sqlite;

use crate::models::filter::PacketFilter;
use crate::models::flow::{Flow, FlowCompletion};
use crate::models::packet::PacketRecord;
use crate::models::stats::{FlowStats, PacketStats};

/// Storage contract for dissected packets.
///
/// Implementations are bounded: when full, the oldest record is evicted
/// before the new one is appended. All methods are safe to call from the
/// capture thread and API handlers concurrently.
pub trait PacketStorage: Send + Sync {
    /// Store a packet, evicting the oldest record at capacity.
    fn store_packet(&self, packet: PacketRecord);

    /// Most recent `limit` packets, oldest-first; `limit <= 0` means all.
    fn get_packets(&self, limit: i64) -> Vec<PacketRecord>;

    /// Look up a single packet by id.
    fn get_by_id(&self, id: u64) -> Option<PacketRecord>;

    /// All packets matching the filter, oldest-first.
    fn get_by_filter(&self, filter: &PacketFilter) -> Vec<PacketRecord>;

    /// Drop all packets and reset counters; the stats start time becomes now.
    fn clear(&self);

    /// Aggregate statistics.
    fn get_stats(&self) -> PacketStats;
}

/// Storage contract for proxy flows.
pub trait FlowStorage: Send + Sync {
    /// Store a new (pending) flow, evicting the oldest at capacity.
    fn add(&self, flow: Flow);

    /// Most recent `limit` flows, oldest-first; `limit <= 0` means all.
    fn get_all(&self, limit: i64) -> Vec<Flow>;

    /// Look up a flow by id.
    fn get_by_id(&self, id: &str) -> Option<Flow>;

    /// Finalize a pending flow in place. Returns false when the flow has
    /// already been evicted.
    fn complete(&self, id: &str, completion: FlowCompletion) -> bool;

    /// Drop all flows and reset counters; the stats start time becomes now.
    fn clear(&self);

    /// Aggregate statistics.
    fn get_stats(&self) -> FlowStats;
}
