use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use pcap::{Active, Capture, Device};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::capture::dissector::{CaptureMeta, PacketDissector};
use crate::capture::dns::{parse_dns_message, DnsCorrelator};
use crate::models::interface::InterfaceInfo;
use crate::models::packet::{ApplicationLayerInfo, PacketRecord};
use crate::storage::PacketStorage;
use crate::utils::error::{AppError, AppResult};

/// The capture predicate: HTTP-ish TCP ports plus DNS.
pub const CAPTURE_BPF_FILTER: &str =
    "tcp port 80 or tcp port 443 or tcp port 8080 or tcp port 3000 or udp port 53";

/// Snap length for the capture handle
const SNAP_LEN: i32 = 1600;

/// Read timeout doubling as the stop-flag poll interval
const READ_TIMEOUT_MS: i32 = 1000;

/// Drives live capture on one interface.
///
/// Frames are dissected, DNS-correlated, and stored sequentially on a single
/// blocking thread; arrival order is what lets DNS answers annotate the
/// packets that follow them.
pub struct CaptureEngine {
    iface: String,
    store: Arc<dyn PacketStorage>,
    correlator: Arc<DnsCorrelator>,
    running: Arc<AtomicBool>,
    capture: Mutex<Option<Capture<Active>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    next_id: Arc<AtomicU64>,
}

impl CaptureEngine {
    /// Open the interface and install the capture filter. The engine is
    /// created per start request and discarded on stop.
    pub fn new(
        iface: &str,
        store: Arc<dyn PacketStorage>,
        correlator: Arc<DnsCorrelator>,
    ) -> AppResult<Self> {
        let inactive = Capture::from_device(iface).map_err(|e| AppError::InterfaceOpenFailed {
            iface: iface.to_string(),
            source: e,
        })?;

        let mut capture = inactive
            .promisc(true)
            .snaplen(SNAP_LEN)
            .timeout(READ_TIMEOUT_MS)
            .open()
            .map_err(|e| AppError::InterfaceOpenFailed {
                iface: iface.to_string(),
                source: e,
            })?;

        capture
            .filter(CAPTURE_BPF_FILTER, true)
            .map_err(AppError::BpfFilterFailed)?;

        Ok(Self {
            iface: iface.to_string(),
            store,
            correlator,
            running: Arc::new(AtomicBool::new(false)),
            capture: Mutex::new(Some(capture)),
            task: Mutex::new(None),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Start the capture loop. A second call fails with `AlreadyRunning`.
    pub fn start(&self) -> AppResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AppError::AlreadyRunning("capture"));
        }

        let Some(mut capture) = self.capture.lock().take() else {
            // pcap handle already consumed by a previous start
            self.running.store(false, Ordering::SeqCst);
            return Err(AppError::AlreadyRunning("capture"));
        };

        info!("starting capture on interface {}", self.iface);

        let running = self.running.clone();
        let store = self.store.clone();
        let correlator = self.correlator.clone();
        let next_id = self.next_id.clone();
        let iface = self.iface.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let dissector = PacketDissector::new();

            while running.load(Ordering::SeqCst) {
                match capture.next_packet() {
                    Ok(packet) => {
                        let meta = CaptureMeta {
                            timestamp: timeval_to_utc(
                                packet.header.ts.tv_sec as i64,
                                packet.header.ts.tv_usec as i64,
                            ),
                            wire_length: packet.header.len as usize,
                            capture_length: packet.header.caplen as usize,
                            interface_index: 0,
                        };
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        process_frame(&dissector, &correlator, store.as_ref(), id, packet.data, meta);
                    }
                    Err(pcap::Error::TimeoutExpired) => {
                        trace!("capture read timed out, polling stop flag");
                    }
                    Err(e) => {
                        error!("capture read failed on {}: {}", iface, e);
                        break;
                    }
                }
            }

            info!("capture loop stopped for interface {}", iface);
        });

        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Request the capture loop to stop. The blocking reader observes the
    /// flag on its next timeout tick and drops the pcap handle.
    pub fn stop(&self) -> AppResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(AppError::NotRunning("capture"));
        }
        info!("stopping capture on interface {}", self.iface);
        self.task.lock().take();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }
}

/// Dissect one frame, run DNS correlation, and store the result.
pub(crate) fn process_frame(
    dissector: &PacketDissector,
    correlator: &DnsCorrelator,
    store: &dyn PacketStorage,
    id: u64,
    data: &[u8],
    meta: CaptureMeta,
) {
    let mut record = dissector.dissect(id, data, meta);

    let (src_ip, dst_ip) = endpoint_ips(&record);

    if is_dns_packet(&record) {
        correlate_dns(correlator, &mut record, src_ip, dst_ip);
    } else if record.domain().is_empty() {
        if let Some(domain) = correlator.domain_for(src_ip, dst_ip) {
            debug!("back-filled domain {} for packet {}", domain, id);
            record
                .application
                .get_or_insert_with(ApplicationLayerInfo::default)
                .domain = domain;
        }
    }

    store.store_packet(record);
}

fn endpoint_ips(record: &PacketRecord) -> (Option<IpAddr>, Option<IpAddr>) {
    let parse = |s: &str| s.parse::<IpAddr>().ok();
    match &record.network {
        Some(net) => (parse(&net.src_ip), parse(&net.dst_ip)),
        None => (None, None),
    }
}

fn is_dns_packet(record: &PacketRecord) -> bool {
    record.src_port() == 53 || record.dst_port() == 53
}

/// Harvest question/answer records from a DNS payload and feed the
/// IP-to-domain table.
fn correlate_dns(
    correlator: &DnsCorrelator,
    record: &mut PacketRecord,
    src_ip: Option<IpAddr>,
    dst_ip: Option<IpAddr>,
) {
    let Some(app) = record.application.as_mut() else {
        return;
    };
    let Ok(payload) = BASE64.decode(app.payload.as_bytes()) else {
        return;
    };
    let Some(msg) = parse_dns_message(&payload) else {
        warn!("port-53 payload did not parse as DNS");
        return;
    };

    if let Some(question) = msg.questions.first() {
        app.domain = question.clone();
    }

    if msg.is_response {
        for answer in &msg.answers {
            correlator.record(answer.ip, &answer.name);
            if Some(answer.ip) == src_ip || Some(answer.ip) == dst_ip {
                app.domain = answer.name.clone();
            }
        }
    }
}

fn timeval_to_utc(sec: i64, usec: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(sec, (usec * 1000) as u32).unwrap_or_else(Utc::now)
}

/// Enumerate capturable interfaces: pcap's device list enriched with
/// datalink-level details where names match.
pub fn list_interfaces() -> AppResult<Vec<InterfaceInfo>> {
    let datalink_ifaces = pnet_datalink::interfaces();

    let devices = Device::list()?;
    let mut result = Vec::with_capacity(devices.len());
    for device in devices {
        let mut info = InterfaceInfo::new(device.name.clone())
            .with_description(device.desc)
            .with_addresses(
                device
                    .addresses
                    .iter()
                    .map(|a| a.addr.to_string())
                    .collect(),
            );

        if let Some(dl) = datalink_ifaces.iter().find(|i| i.name == device.name) {
            info.mac_address = dl.mac.map(|mac| mac.to_string());
            info.is_loopback = dl.is_loopback();
            info.is_up = dl.is_up();
        }
        result.push(info);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryPacketStore;
    use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
    use pnet::packet::ip::IpNextHeaderProtocols;
    use pnet::packet::ipv4::MutableIpv4Packet;
    use pnet::packet::tcp::MutableTcpPacket;
    use pnet::packet::udp::MutableUdpPacket;
    use pnet::packet::MutablePacket;
    use pnet::util::MacAddr;
    use std::net::Ipv4Addr;

    fn meta() -> CaptureMeta {
        CaptureMeta {
            timestamp: Utc::now(),
            wire_length: 0,
            capture_length: 0,
            interface_index: 0,
        }
    }

    fn ipv4_frame(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        proto: pnet::packet::ip::IpNextHeaderProtocol,
        l4: &[u8],
    ) -> Vec<u8> {
        let ip_len = 20 + l4.len();
        let mut buf = vec![0u8; 14 + ip_len];
        {
            let mut eth = MutableEthernetPacket::new(&mut buf).unwrap();
            eth.set_source(MacAddr::new(2, 0, 0, 0, 0, 1));
            eth.set_destination(MacAddr::new(2, 0, 0, 0, 0, 2));
            eth.set_ethertype(EtherTypes::Ipv4);
        }
        {
            let mut ip = MutableIpv4Packet::new(&mut buf[14..]).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length(ip_len as u16);
            ip.set_ttl(64);
            ip.set_next_level_protocol(proto);
            ip.set_source(src);
            ip.set_destination(dst);
            ip.set_payload(l4);
            let checksum = pnet::packet::ipv4::checksum(&ip.to_immutable());
            ip.set_checksum(checksum);
        }
        buf
    }

    fn udp_dns_response_frame(resolver: Ipv4Addr, client: Ipv4Addr, dns: &[u8]) -> Vec<u8> {
        let mut l4 = vec![0u8; 8 + dns.len()];
        {
            let mut udp = MutableUdpPacket::new(&mut l4).unwrap();
            udp.set_source(53);
            udp.set_destination(55353);
            udp.set_length((8 + dns.len()) as u16);
            udp.set_payload(dns);
        }
        ipv4_frame(resolver, client, IpNextHeaderProtocols::Udp, &l4)
    }

    fn tcp_frame_between(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        let mut l4 = vec![0u8; 20];
        {
            let mut tcp = MutableTcpPacket::new(&mut l4).unwrap();
            tcp.set_source(55000);
            tcp.set_destination(443);
            tcp.set_data_offset(5);
            tcp.set_flags(0x02);
        }
        ipv4_frame(src, dst, IpNextHeaderProtocols::Tcp, &l4)
    }

    fn dns_a_response(name: &str, ip: [u8; 4]) -> Vec<u8> {
        let mut out = vec![
            0xAB, 0xCD, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
        ];
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        out.extend_from_slice(&[0xC0, 0x0C]);
        out.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        out.extend_from_slice(&[0x00, 0x00, 0x00, 0x3C]);
        out.extend_from_slice(&[0x00, 0x04]);
        out.extend_from_slice(&ip);
        out
    }

    #[test]
    fn dns_answer_annotates_later_packets() {
        let dissector = PacketDissector::new();
        let correlator = DnsCorrelator::new();
        let store = MemoryPacketStore::with_capacity(10);

        let resolver = Ipv4Addr::new(9, 9, 9, 9);
        let client = Ipv4Addr::new(192, 168, 1, 10);
        let answered = Ipv4Addr::new(10, 0, 0, 1);

        let dns = dns_a_response("example.com", [10, 0, 0, 1]);
        let frame = udp_dns_response_frame(resolver, client, &dns);
        process_frame(&dissector, &correlator, &store, 1, &frame, meta());

        let tcp = tcp_frame_between(client, answered);
        process_frame(&dissector, &correlator, &store, 2, &tcp, meta());

        let packet = store.get_by_id(2).unwrap();
        assert_eq!(packet.domain(), "example.com");
    }

    #[test]
    fn dns_query_sets_own_domain_without_table_entry() {
        let dissector = PacketDissector::new();
        let correlator = DnsCorrelator::new();
        let store = MemoryPacketStore::with_capacity(10);

        // query: header + question only
        let mut dns = vec![
            0xAB, 0xCD, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        for label in "lookup.example".split('.') {
            dns.push(label.len() as u8);
            dns.extend_from_slice(label.as_bytes());
        }
        dns.push(0);
        dns.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

        let client = Ipv4Addr::new(192, 168, 1, 10);
        let resolver = Ipv4Addr::new(9, 9, 9, 9);
        let mut l4 = vec![0u8; 8 + dns.len()];
        {
            let mut udp = MutableUdpPacket::new(&mut l4).unwrap();
            udp.set_source(55353);
            udp.set_destination(53);
            udp.set_length((8 + dns.len()) as u16);
            udp.set_payload(&dns);
        }
        let frame = ipv4_frame(client, resolver, IpNextHeaderProtocols::Udp, &l4);
        process_frame(&dissector, &correlator, &store, 1, &frame, meta());

        let packet = store.get_by_id(1).unwrap();
        assert_eq!(packet.domain(), "lookup.example");
        assert!(correlator.is_empty());
    }

    #[test]
    fn unrelated_packet_keeps_empty_domain() {
        let dissector = PacketDissector::new();
        let correlator = DnsCorrelator::new();
        let store = MemoryPacketStore::with_capacity(10);

        let tcp = tcp_frame_between(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8));
        process_frame(&dissector, &correlator, &store, 1, &tcp, meta());
        assert_eq!(store.get_by_id(1).unwrap().domain(), "");
    }

    #[test]
    fn bpf_filter_literal_is_fixed() {
        assert_eq!(
            CAPTURE_BPF_FILTER,
            "tcp port 80 or tcp port 443 or tcp port 8080 or tcp port 3000 or udp port 53"
        );
    }
}
