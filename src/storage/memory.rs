use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::models::filter::PacketFilter;
use crate::models::flow::{Flow, FlowCompletion};
use crate::models::packet::PacketRecord;
use crate::models::stats::{FlowStats, PacketStats};
use crate::storage::{FlowStorage, PacketStorage};

/// Default packet store capacity
pub const DEFAULT_PACKET_CAPACITY: usize = 10_000;

/// Default flow store capacity
pub const DEFAULT_FLOW_CAPACITY: usize = 20_000;

struct PacketInner {
    packets: VecDeque<PacketRecord>,
    /// id -> insertion sequence; position = seq - head_seq
    index: HashMap<u64, u64>,
    head_seq: u64,
    next_seq: u64,
    stats: PacketStats,
    ip_set: HashSet<String>,
    port_set: HashSet<u16>,
}

/// Bounded in-memory FIFO packet store
pub struct MemoryPacketStore {
    capacity: usize,
    inner: RwLock<PacketInner>,
}

impl MemoryPacketStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PACKET_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(PacketInner {
                packets: VecDeque::new(),
                index: HashMap::new(),
                head_seq: 0,
                next_seq: 0,
                stats: PacketStats {
                    start_time: Some(Utc::now()),
                    ..Default::default()
                },
                ip_set: HashSet::new(),
                port_set: HashSet::new(),
            }),
        }
    }
}

impl Default for MemoryPacketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketStorage for MemoryPacketStore {
    fn store_packet(&self, packet: PacketRecord) {
        let mut inner = self.inner.write();

        if inner.packets.len() >= self.capacity {
            if let Some(old) = inner.packets.pop_front() {
                inner.index.remove(&old.id);
            }
            inner.head_seq += 1;
        }

        inner.stats.total_packets += 1;
        inner.stats.last_packet_time = Some(packet.metadata.capture_time);

        if packet.protocol() == "TCP" {
            let (sp, dp) = (packet.src_port(), packet.dst_port());
            if sp == 80 || dp == 80 {
                inner.stats.http_packets += 1;
            }
            if sp == 443 || dp == 443 {
                inner.stats.https_packets += 1;
            }
        }

        if !packet.src_ip().is_empty() {
            let ip = packet.src_ip().to_string();
            inner.ip_set.insert(ip);
        }
        if !packet.dst_ip().is_empty() {
            let ip = packet.dst_ip().to_string();
            inner.ip_set.insert(ip);
        }
        if let Some(t) = &packet.transport {
            let (sp, dp) = (t.src_port, t.dst_port);
            inner.port_set.insert(sp);
            inner.port_set.insert(dp);
        }
        inner.stats.unique_ips = inner.ip_set.len();
        inner.stats.unique_ports = inner.port_set.len();

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.index.insert(packet.id, seq);
        inner.packets.push_back(packet);
    }

    fn get_packets(&self, limit: i64) -> Vec<PacketRecord> {
        let inner = self.inner.read();
        let len = inner.packets.len();
        let take = if limit <= 0 || limit as usize > len {
            len
        } else {
            limit as usize
        };
        inner.packets.iter().skip(len - take).cloned().collect()
    }

    fn get_by_id(&self, id: u64) -> Option<PacketRecord> {
        let inner = self.inner.read();
        let seq = *inner.index.get(&id)?;
        let pos = (seq - inner.head_seq) as usize;
        inner.packets.get(pos).cloned()
    }

    fn get_by_filter(&self, filter: &PacketFilter) -> Vec<PacketRecord> {
        let inner = self.inner.read();
        inner
            .packets
            .iter()
            .filter(|p| matches_filter(p, filter))
            .cloned()
            .collect()
    }

    fn clear(&self) {
        let mut inner = self.inner.write();
        inner.packets.clear();
        inner.index.clear();
        inner.head_seq = 0;
        inner.next_seq = 0;
        inner.ip_set.clear();
        inner.port_set.clear();
        inner.stats = PacketStats {
            start_time: Some(Utc::now()),
            ..Default::default()
        };
    }

    fn get_stats(&self) -> PacketStats {
        self.inner.read().stats.clone()
    }
}

fn app_str<'a>(
    app: Option<&'a crate::models::packet::ApplicationLayerInfo>,
    field: fn(&crate::models::packet::ApplicationLayerInfo) -> &str,
) -> &'a str {
    app.map(field).unwrap_or("")
}

/// Evaluate a filter against a packet, implicit AND over the set fields.
pub fn matches_filter(packet: &PacketRecord, filter: &PacketFilter) -> bool {
    if !filter.protocol.is_empty() && packet.protocol() != filter.protocol {
        return false;
    }
    if !filter.src_ip.is_empty() && packet.src_ip() != filter.src_ip {
        return false;
    }
    if !filter.dst_ip.is_empty() && packet.dst_ip() != filter.dst_ip {
        return false;
    }
    if filter.port != 0 && packet.src_port() != filter.port && packet.dst_port() != filter.port {
        return false;
    }

    let app = packet.application.as_ref();

    if !filter.http_method.is_empty() && app_str(app, |a| &a.http_method) != filter.http_method {
        return false;
    }

    let ts = packet.metadata.capture_time;
    if let Some(start) = filter.start_time {
        if ts < start {
            return false;
        }
    }
    if let Some(end) = filter.end_time {
        if ts > end {
            return false;
        }
    }

    if !filter.host.is_empty() && app_str(app, |a| &a.host) != filter.host {
        return false;
    }
    if !filter.domain.is_empty() && packet.domain() != filter.domain {
        return false;
    }
    if !filter.path.is_empty() && app_str(app, |a| &a.path) != filter.path {
        return false;
    }
    if !filter.user_agent.is_empty() && app_str(app, |a| &a.user_agent) != filter.user_agent {
        return false;
    }
    if !filter.content_type.is_empty() && app_str(app, |a| &a.content_type) != filter.content_type {
        return false;
    }
    if !filter.referer.is_empty() && app_str(app, |a| &a.referer) != filter.referer {
        return false;
    }
    if !filter.server.is_empty() && app_str(app, |a| &a.server) != filter.server {
        return false;
    }

    if !filter.search_text.is_empty() {
        let needle = filter.search_text.to_lowercase();
        let haystacks: [&str; 10] = [
            packet.src_ip(),
            packet.dst_ip(),
            app_str(app, |a| &a.host),
            packet.domain(),
            app_str(app, |a| &a.path),
            app_str(app, |a| &a.user_agent),
            app_str(app, |a| &a.content_type),
            app_str(app, |a| &a.referer),
            app_str(app, |a| &a.server),
            app_str(app, |a| &a.http_method),
        ];
        let url = app_str(app, |a| &a.full_url);
        let hit = haystacks
            .iter()
            .chain(std::iter::once(&url))
            .any(|h| h.to_lowercase().contains(&needle));
        if !hit {
            return false;
        }
    }

    true
}

struct FlowInner {
    flows: VecDeque<Flow>,
    index: HashMap<String, u64>,
    head_seq: u64,
    next_seq: u64,
    stats: FlowStats,
}

/// Bounded in-memory FIFO flow store
pub struct MemoryFlowStore {
    capacity: usize,
    inner: RwLock<FlowInner>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FLOW_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(FlowInner {
                flows: VecDeque::new(),
                index: HashMap::new(),
                head_seq: 0,
                next_seq: 0,
                stats: FlowStats {
                    start_time: Some(Utc::now()),
                    ..Default::default()
                },
            }),
        }
    }
}

impl Default for MemoryFlowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowStorage for MemoryFlowStore {
    fn add(&self, flow: Flow) {
        let mut inner = self.inner.write();

        if inner.flows.len() >= self.capacity {
            if let Some(old) = inner.flows.pop_front() {
                inner.index.remove(&old.id);
            }
            inner.head_seq += 1;
        }

        inner.stats.total += 1;
        inner.stats.last_time = Some(Utc::now());

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.index.insert(flow.id.clone(), seq);
        inner.flows.push_back(flow);
    }

    fn get_all(&self, limit: i64) -> Vec<Flow> {
        let inner = self.inner.read();
        let len = inner.flows.len();
        let take = if limit <= 0 || limit as usize > len {
            len
        } else {
            limit as usize
        };
        inner.flows.iter().skip(len - take).cloned().collect()
    }

    fn get_by_id(&self, id: &str) -> Option<Flow> {
        let inner = self.inner.read();
        let seq = *inner.index.get(id)?;
        let pos = (seq - inner.head_seq) as usize;
        inner.flows.get(pos).cloned()
    }

    fn complete(&self, id: &str, completion: FlowCompletion) -> bool {
        let mut inner = self.inner.write();
        let Some(seq) = inner.index.get(id).copied() else {
            return false;
        };
        let pos = (seq - inner.head_seq) as usize;
        let Some(flow) = inner.flows.get_mut(pos) else {
            return false;
        };

        flow.end_at = completion.end_at;
        flow.latency_ms = completion.latency_ms;
        if completion.response.is_some() {
            flow.response = completion.response;
        }
        if completion.performance.is_some() {
            flow.performance = completion.performance;
        }
        if completion.tls.is_some() {
            flow.tls = completion.tls;
        }
        if completion.error.is_some() {
            flow.error = completion.error;
        }
        if completion.content.is_some() {
            flow.content = completion.content;
        }
        inner.stats.last_time = Some(Utc::now());
        true
    }

    fn clear(&self) {
        let mut inner = self.inner.write();
        inner.flows.clear();
        inner.index.clear();
        inner.head_seq = 0;
        inner.next_seq = 0;
        inner.stats = FlowStats {
            start_time: Some(Utc::now()),
            ..Default::default()
        };
    }

    fn get_stats(&self) -> FlowStats {
        self.inner.read().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::flow::{HttpRequestInfo, HttpResponseInfo};
    use crate::models::packet::{
        ApplicationLayerInfo, NetworkLayerInfo, PacketMetadata, TransportLayerInfo,
    };
    use chrono::Duration;

    fn packet(id: u64, protocol: &str, src_port: u16, dst_port: u16, host: &str) -> PacketRecord {
        PacketRecord {
            id,
            metadata: PacketMetadata {
                capture_time: Utc::now(),
                wire_length: 64,
                capture_length: 64,
                truncated: false,
                interface_index: 0,
            },
            link: None,
            network: Some(NetworkLayerInfo {
                ip_version: 4,
                src_ip: "10.0.0.1".into(),
                dst_ip: "10.0.0.2".into(),
                ..Default::default()
            }),
            transport: Some(TransportLayerInfo {
                protocol: protocol.into(),
                src_port,
                dst_port,
                ..Default::default()
            }),
            application: Some(ApplicationLayerInfo {
                host: host.into(),
                ..Default::default()
            }),
            error: None,
        }
    }

    fn flow(id: &str) -> Flow {
        Flow {
            id: id.to_string(),
            scheme: "http".into(),
            remote_addr: "127.0.0.1:55000".into(),
            start_at: Utc::now(),
            end_at: None,
            latency_ms: None,
            request: HttpRequestInfo::default(),
            response: None,
            performance: None,
            tls: None,
            error: None,
            content: None,
            network: None,
        }
    }

    #[test]
    fn packet_store_evicts_fifo_at_capacity() {
        let store = MemoryPacketStore::with_capacity(DEFAULT_PACKET_CAPACITY);
        for i in 0..(DEFAULT_PACKET_CAPACITY as u64 + 1) {
            store.store_packet(packet(i, "TCP", 12345, 80, ""));
        }

        let stats = store.get_stats();
        assert_eq!(stats.total_packets, DEFAULT_PACKET_CAPACITY + 1);
        assert_eq!(store.get_packets(0).len(), DEFAULT_PACKET_CAPACITY);
        assert!(store.get_by_id(0).is_none());
        assert!(store.get_by_id(1).is_some());
    }

    #[test]
    fn packet_store_returns_most_recent_oldest_first() {
        let store = MemoryPacketStore::with_capacity(10);
        for i in 0..5 {
            store.store_packet(packet(i, "TCP", 1, 2, ""));
        }
        let got = store.get_packets(3);
        assert_eq!(got.iter().map(|p| p.id).collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn packet_stats_count_http_https_and_uniques() {
        let store = MemoryPacketStore::with_capacity(10);
        store.store_packet(packet(1, "TCP", 55000, 80, ""));
        store.store_packet(packet(2, "TCP", 55001, 443, ""));
        store.store_packet(packet(3, "UDP", 55002, 53, ""));

        let stats = store.get_stats();
        assert_eq!(stats.http_packets, 1);
        assert_eq!(stats.https_packets, 1);
        assert_eq!(stats.unique_ips, 2);
        assert_eq!(stats.unique_ports, 6);
    }

    #[test]
    fn clear_resets_stats_with_fresh_start_time() {
        let store = MemoryPacketStore::with_capacity(10);
        store.store_packet(packet(1, "TCP", 1, 2, ""));
        let before = store.get_stats().start_time.unwrap();

        store.clear();
        let stats = store.get_stats();
        assert_eq!(stats.total_packets, 0);
        assert_eq!(stats.unique_ips, 0);
        assert_eq!(stats.unique_ports, 0);
        assert!(stats.last_packet_time.is_none());
        assert!(stats.start_time.unwrap() >= before);
        assert!(store.get_packets(0).is_empty());
    }

    #[test]
    fn filter_is_implicit_and() {
        let tcp_google = {
            let mut p = packet(1, "TCP", 55000, 443, "google.com");
            p.application.as_mut().unwrap().domain = "google.com".into();
            p
        };
        let udp_google = {
            let mut p = packet(2, "UDP", 55000, 53, "google.com");
            p.application.as_mut().unwrap().domain = "google.com".into();
            p
        };

        let store = MemoryPacketStore::with_capacity(10);
        store.store_packet(tcp_google);
        store.store_packet(udp_google);

        let filter = PacketFilter {
            protocol: "TCP".into(),
            port: 443,
            search_text: "goo".into(),
            ..Default::default()
        };
        let hits = store.get_by_filter(&filter);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);
    }

    #[test]
    fn filter_ignores_empty_and_zero_fields() {
        let store = MemoryPacketStore::with_capacity(10);
        store.store_packet(packet(1, "TCP", 1, 2, ""));
        assert_eq!(store.get_by_filter(&PacketFilter::default()).len(), 1);
    }

    #[test]
    fn filter_time_bounds_are_inclusive_and_optional() {
        let store = MemoryPacketStore::with_capacity(10);
        store.store_packet(packet(1, "TCP", 1, 2, ""));
        let now = Utc::now();

        let past_only = PacketFilter {
            end_time: Some(now - Duration::hours(1)),
            ..Default::default()
        };
        assert!(store.get_by_filter(&past_only).is_empty());

        let open_ended = PacketFilter {
            start_time: Some(now - Duration::hours(1)),
            ..Default::default()
        };
        assert_eq!(store.get_by_filter(&open_ended).len(), 1);
    }

    #[test]
    fn flow_store_eviction_drops_id_index() {
        let store = MemoryFlowStore::with_capacity(2);
        store.add(flow("a"));
        store.add(flow("b"));
        store.add(flow("c"));

        assert!(store.get_by_id("a").is_none());
        assert!(store.get_by_id("b").is_some());
        assert_eq!(store.get_stats().total, 3);
        assert_eq!(store.get_all(0).len(), 2);
    }

    #[test]
    fn flow_completion_freezes_latency() {
        let store = MemoryFlowStore::new();
        let mut f = flow("x");
        f.start_at = Utc::now() - Duration::milliseconds(250);
        let start = f.start_at;
        store.add(f);

        let end = Utc::now();
        let latency = (end - start).num_milliseconds();
        let done = store.complete(
            "x",
            FlowCompletion {
                end_at: Some(end),
                latency_ms: Some(latency),
                response: Some(HttpResponseInfo {
                    status: "200 OK".into(),
                    status_code: 200,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        assert!(done);

        let stored = store.get_by_id("x").unwrap();
        let got = stored.latency_ms.unwrap();
        assert!(got >= 0);
        assert_eq!(
            got,
            (stored.end_at.unwrap() - stored.start_at).num_milliseconds()
        );
        assert_eq!(stored.response.unwrap().status_code, 200);
    }

    #[test]
    fn completing_an_evicted_flow_is_a_noop() {
        let store = MemoryFlowStore::with_capacity(1);
        store.add(flow("a"));
        store.add(flow("b"));
        assert!(!store.complete("a", FlowCompletion::default()));
    }
}
