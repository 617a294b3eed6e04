use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use log::{log_enabled, trace, Level};
use pnet::packet::{
    ethernet::{EtherTypes, EthernetPacket},
    ip::{IpNextHeaderProtocol, IpNextHeaderProtocols},
    ipv4::Ipv4Packet,
    ipv6::Ipv6Packet,
    tcp::TcpPacket,
    udp::UdpPacket,
    Packet as PnetPacket,
};
use std::net::IpAddr;

use crate::models::packet::{
    ApplicationLayerInfo, ErrorLayerInfo, LinkLayerInfo, NetworkLayerInfo, PacketMetadata,
    PacketRecord, TransportLayerInfo,
};

/// Capture-time context handed to the dissector alongside the frame bytes
#[derive(Debug, Clone, Copy)]
pub struct CaptureMeta {
    pub timestamp: DateTime<Utc>,
    pub wire_length: usize,
    pub capture_length: usize,
    pub interface_index: i32,
}

/// Transforms raw captured frames into layered packet records.
///
/// Dissection is best-effort throughout: a failure in one layer records an
/// error section and leaves the surrounding layers intact.
pub struct PacketDissector {}

impl PacketDissector {
    pub fn new() -> Self {
        Self {}
    }

    /// Dissect one frame into a packet record.
    pub fn dissect(&self, id: u64, data: &[u8], meta: CaptureMeta) -> PacketRecord {
        let mut record = PacketRecord {
            id,
            metadata: PacketMetadata {
                capture_time: meta.timestamp,
                wire_length: meta.wire_length,
                capture_length: meta.capture_length,
                truncated: meta.capture_length < meta.wire_length,
                interface_index: meta.interface_index,
            },
            link: None,
            network: None,
            transport: None,
            application: None,
            error: None,
        };

        let Some(eth) = EthernetPacket::new(data) else {
            record.error = Some(ErrorLayerInfo {
                error: "failed to decode Ethernet frame".to_string(),
                layer: "ethernet".to_string(),
                fatal: true,
                code: 2,
            });
            return record;
        };

        record.link = Some(LinkLayerInfo {
            src_mac: eth.get_source().to_string(),
            dst_mac: eth.get_destination().to_string(),
            eth_type: format!("{}", eth.get_ethertype()),
            length: data.len(),
        });

        match eth.get_ethertype() {
            EtherTypes::Ipv4 => self.dissect_ipv4(eth.payload(), &mut record),
            EtherTypes::Ipv6 => self.dissect_ipv6(eth.payload(), &mut record),
            other => {
                if log_enabled!(Level::Trace) {
                    trace!("skipping non-IP ethertype {}", other);
                }
            }
        }

        record
    }

    fn dissect_ipv4(&self, data: &[u8], record: &mut PacketRecord) {
        let Some(ipv4) = Ipv4Packet::new(data) else {
            record.error = Some(ErrorLayerInfo {
                error: "failed to decode IPv4 header".to_string(),
                layer: "ipv4".to_string(),
                fatal: true,
                code: 2,
            });
            return;
        };

        let src = IpAddr::V4(ipv4.get_source());
        let dst = IpAddr::V4(ipv4.get_destination());

        record.network = Some(NetworkLayerInfo {
            ip_version: 4,
            src_ip: src.to_string(),
            dst_ip: dst.to_string(),
            protocol: format!("{}", ipv4.get_next_level_protocol()),
            length: ipv4.get_total_length() as usize,
            ttl: ipv4.get_ttl(),
            ihl: ipv4.get_header_length(),
            tos: ipv4.get_dscp() << 2 | ipv4.get_ecn(),
            identifier: ipv4.get_identification(),
            flags: ipv4.get_flags(),
            frag_offset: ipv4.get_fragment_offset(),
            checksum: ipv4.get_checksum(),
            is_src_loopback: src.is_loopback(),
            is_dst_loopback: dst.is_loopback(),
            is_src_link_local: is_link_local(&src),
            is_dst_link_local: is_link_local(&dst),
            is_src_ip_valid: !ipv4.get_source().is_unspecified(),
            is_dst_ip_valid: !ipv4.get_destination().is_unspecified(),
            ..Default::default()
        });

        // Header checksum verification: a mismatch is worth flagging but
        // does not stop dissection.
        let computed = pnet::packet::ipv4::checksum(&ipv4);
        if computed != ipv4.get_checksum() {
            record.error = Some(ErrorLayerInfo {
                error: format!(
                    "IPv4 header checksum mismatch: got {:#06x}, want {:#06x}",
                    ipv4.get_checksum(),
                    computed
                ),
                layer: "ipv4".to_string(),
                fatal: false,
                code: 1,
            });
        }

        self.dissect_transport(ipv4.get_next_level_protocol(), ipv4.payload(), record);
    }

    fn dissect_ipv6(&self, data: &[u8], record: &mut PacketRecord) {
        let Some(ipv6) = Ipv6Packet::new(data) else {
            record.error = Some(ErrorLayerInfo {
                error: "failed to decode IPv6 header".to_string(),
                layer: "ipv6".to_string(),
                fatal: true,
                code: 2,
            });
            return;
        };

        let src = IpAddr::V6(ipv6.get_source());
        let dst = IpAddr::V6(ipv6.get_destination());

        record.network = Some(NetworkLayerInfo {
            ip_version: 6,
            src_ip: src.to_string(),
            dst_ip: dst.to_string(),
            protocol: format!("{}", ipv6.get_next_header()),
            length: ipv6.get_payload_length() as usize,
            ttl: ipv6.get_hop_limit(),
            traffic_class: ipv6.get_traffic_class(),
            flow_label: ipv6.get_flow_label(),
            next_header: format!("{}", ipv6.get_next_header()),
            hop_limit: ipv6.get_hop_limit(),
            is_src_loopback: src.is_loopback(),
            is_dst_loopback: dst.is_loopback(),
            is_src_link_local: is_link_local(&src),
            is_dst_link_local: is_link_local(&dst),
            is_src_ip_valid: !ipv6.get_source().is_unspecified(),
            is_dst_ip_valid: !ipv6.get_destination().is_unspecified(),
            ..Default::default()
        });

        self.dissect_transport(ipv6.get_next_header(), ipv6.payload(), record);
    }

    fn dissect_transport(
        &self,
        proto: IpNextHeaderProtocol,
        data: &[u8],
        record: &mut PacketRecord,
    ) {
        match proto {
            IpNextHeaderProtocols::Tcp => {
                let Some(tcp) = TcpPacket::new(data) else {
                    record.error = Some(ErrorLayerInfo {
                        error: "failed to decode TCP segment".to_string(),
                        layer: "tcp".to_string(),
                        fatal: true,
                        code: 2,
                    });
                    return;
                };
                let flags = tcp.get_flags();
                record.transport = Some(TransportLayerInfo {
                    protocol: "TCP".to_string(),
                    src_port: tcp.get_source(),
                    dst_port: tcp.get_destination(),
                    seq_number: tcp.get_sequence(),
                    ack_number: tcp.get_acknowledgement(),
                    window_size: tcp.get_window(),
                    checksum: tcp.get_checksum(),
                    urgent_ptr: tcp.get_urgent_ptr(),
                    is_fin: flags & 0x01 != 0,
                    is_syn: flags & 0x02 != 0,
                    is_rst: flags & 0x04 != 0,
                    is_psh: flags & 0x08 != 0,
                    is_ack: flags & 0x10 != 0,
                    is_urg: flags & 0x20 != 0,
                    is_ece: flags & 0x40 != 0,
                    is_cwr: flags & 0x80 != 0,
                    ..Default::default()
                });
                self.dissect_application(tcp.payload(), record);
            }
            IpNextHeaderProtocols::Udp => {
                let Some(udp) = UdpPacket::new(data) else {
                    record.error = Some(ErrorLayerInfo {
                        error: "failed to decode UDP datagram".to_string(),
                        layer: "udp".to_string(),
                        fatal: true,
                        code: 2,
                    });
                    return;
                };
                record.transport = Some(TransportLayerInfo {
                    protocol: "UDP".to_string(),
                    src_port: udp.get_source(),
                    dst_port: udp.get_destination(),
                    udp_length: udp.get_length(),
                    udp_checksum: udp.get_checksum(),
                    ..Default::default()
                });
                self.dissect_application(udp.payload(), record);
            }
            _ => {
                // Other L4 protocols are not decoded; application parsing is
                // skipped with them.
            }
        }
    }

    fn dissect_application(&self, payload: &[u8], record: &mut PacketRecord) {
        if payload.is_empty() {
            return;
        }

        let mut app = ApplicationLayerInfo {
            payload: BASE64.encode(payload),
            ..Default::default()
        };

        if !parse_http_request(payload, &mut app) {
            parse_http_response(payload, &mut app);
        }

        record.application = Some(app);
    }
}

impl Default for PacketDissector {
    fn default() -> Self {
        Self::new()
    }
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        // fe80::/10 unicast or ff02::/16 link-local multicast
        IpAddr::V6(v6) => {
            (v6.segments()[0] & 0xFFC0) == 0xFE80 || (v6.segments()[0] & 0xFF0F) == 0xFF02
        }
    }
}

const HTTP_METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE", "CONNECT",
];

/// Try to parse the payload as an HTTP request. Returns true on success.
fn parse_http_request(payload: &[u8], app: &mut ApplicationLayerInfo) -> bool {
    let Some((head, body)) = split_head_body(payload) else {
        return false;
    };
    let mut lines = head.lines();
    let Some(request_line) = lines.next() else {
        return false;
    };

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if !HTTP_METHODS.contains(&method) || !version.starts_with("HTTP/") {
        return false;
    }

    app.http_method = method.to_string();
    app.request_uri = uri.to_string();
    app.http_version = version.to_string();
    app.body = body;

    for line in lines {
        let Some((key, value)) = split_header(line) else {
            continue;
        };
        apply_header_shortcut(app, key, value);
        app.headers.insert(key.to_string(), value.to_string());
    }

    decompose_url(app);
    true
}

/// Try to parse the payload as an HTTP response. Returns true on success.
fn parse_http_response(payload: &[u8], app: &mut ApplicationLayerInfo) -> bool {
    let Some((head, body)) = split_head_body(payload) else {
        return false;
    };
    let mut lines = head.lines();
    let Some(status_line) = lines.next() else {
        return false;
    };
    if !status_line.starts_with("HTTP/") {
        return false;
    }

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let Some(code) = parts.next().and_then(|c| c.parse::<u16>().ok()) else {
        return false;
    };
    let reason = parts.next().unwrap_or_default();

    app.http_version = version.to_string();
    app.status_code = code;
    app.http_status = if reason.is_empty() {
        code.to_string()
    } else {
        format!("{} {}", code, reason)
    };
    app.body = body;

    for line in lines {
        let Some((key, value)) = split_header(line) else {
            continue;
        };
        apply_header_shortcut(app, key, value);
        app.headers.insert(key.to_string(), value.to_string());
    }

    true
}

/// Split the payload at the header/body boundary; the head must be valid
/// enough UTF-8 to line-scan.
fn split_head_body(payload: &[u8]) -> Option<(String, Vec<u8>)> {
    if payload.len() < 4 {
        return None;
    }
    match payload.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => {
            let head = String::from_utf8_lossy(&payload[..pos]).into_owned();
            let body = payload[pos + 4..].to_vec();
            Some((head, body))
        }
        None => Some((String::from_utf8_lossy(payload).into_owned(), Vec::new())),
    }
}

fn split_header(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(':')?;
    let (key, value) = line.split_at(idx);
    Some((key.trim(), value[1..].trim()))
}

fn apply_header_shortcut(app: &mut ApplicationLayerInfo, key: &str, value: &str) {
    match key.to_ascii_lowercase().as_str() {
        "host" => {
            app.host = value.to_string();
            app.domain = strip_port(value).to_string();
        }
        "user-agent" => app.user_agent = value.to_string(),
        "content-type" => app.content_type = value.to_string(),
        "content-length" => app.content_length = value.parse().unwrap_or(0),
        "authorization" => app.authorization = value.to_string(),
        "referer" => app.referer = value.to_string(),
        "server" => app.server = value.to_string(),
        "cookie" => app.cookie = value.to_string(),
        "set-cookie" => app.set_cookie = value.to_string(),
        "accept" => app.accept = value.to_string(),
        "accept-language" => app.accept_language = value.to_string(),
        "accept-encoding" => app.accept_encoding = value.to_string(),
        "connection" => app.connection = value.to_string(),
        _ => {}
    }
}

fn strip_port(host: &str) -> &str {
    match host.find(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

/// Break the request target into path and query, then synthesize a full URL
/// when enough information is present.
fn decompose_url(app: &mut ApplicationLayerInfo) {
    let uri = app.request_uri.clone();

    if uri.starts_with("http://") || uri.starts_with("https://") {
        let rest = uri
            .strip_prefix("http://")
            .or_else(|| uri.strip_prefix("https://"))
            .unwrap_or(&uri);
        match rest.find('/') {
            Some(slash) => {
                app.host = rest[..slash].to_string();
                split_path_query(&rest[slash..], app);
            }
            None => {
                app.host = rest.to_string();
                app.path = "/".to_string();
            }
        }
        app.domain = strip_port(&app.host).to_string();
    } else {
        split_path_query(&uri, app);
    }

    // Scheme heuristics: TLS payloads never reach this parser, so fall back
    // to the port in the host and an https Referer.
    let mut scheme = "http";
    if let Some(port) = app.host.rsplit(':').next() {
        if app.host.contains(':') && port == "443" {
            scheme = "https";
        }
    }
    if app.referer.starts_with("https://") {
        scheme = "https";
    }

    if !app.domain.is_empty() && (!app.path.is_empty() || !app.request_uri.is_empty()) {
        let domain = app.domain.trim_end_matches('.');
        let path = if app.path.is_empty() {
            "/"
        } else {
            app.path.as_str()
        };
        let mut url = format!("{}://{}{}", scheme, domain, path);
        if !app.query.is_empty() {
            url.push('?');
            url.push_str(&app.query);
        }
        app.full_url = url;
    }
}

fn split_path_query(target: &str, app: &mut ApplicationLayerInfo) {
    // Fragment first so the query does not swallow it
    let without_fragment = match target.find('#') {
        Some(idx) => &target[..idx],
        None => target,
    };
    match without_fragment.find('?') {
        Some(idx) => {
            app.path = without_fragment[..idx].to_string();
            app.query = without_fragment[idx + 1..].to_string();
        }
        None => {
            app.path = without_fragment.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::ethernet::MutableEthernetPacket;
    use pnet::packet::ipv4::MutableIpv4Packet;
    use pnet::packet::tcp::MutableTcpPacket;
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

    /// Build an Ethernet/IPv4/TCP frame carrying `payload`.
    fn tcp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let tcp_len = 20 + payload.len();
        let ip_len = 20 + tcp_len;
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
            ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
            ip.set_source(Ipv4Addr::new(192, 168, 1, 10));
            ip.set_destination(Ipv4Addr::new(93, 184, 216, 34));
            let checksum = pnet::packet::ipv4::checksum(&ip.to_immutable());
            ip.set_checksum(checksum);
        }
        {
            let mut tcp = MutableTcpPacket::new(&mut buf[34..]).unwrap();
            tcp.set_source(src_port);
            tcp.set_destination(dst_port);
            tcp.set_data_offset(5);
            tcp.set_flags(0x18); // PSH|ACK
            tcp.set_payload(payload);
        }
        buf
    }

    #[test]
    fn dissects_http_request_frame() {
        let payload = b"GET /a?b=c HTTP/1.1\r\nHost: x.io:8080\r\n\r\n";
        let frame = tcp_frame(55000, 8080, payload);
        let record = PacketDissector::new().dissect(1, &frame, meta());

        let link = record.link.as_ref().unwrap();
        assert_eq!(link.src_mac, "02:00:00:00:00:01");

        let net = record.network.as_ref().unwrap();
        assert_eq!(net.ip_version, 4);
        assert_eq!(net.src_ip, "192.168.1.10");
        assert_eq!(net.dst_ip, "93.184.216.34");

        let transport = record.transport.as_ref().unwrap();
        assert_eq!(transport.protocol, "TCP");
        assert_eq!(transport.dst_port, 8080);
        assert!(transport.is_psh && transport.is_ack);

        let app = record.application.as_ref().unwrap();
        assert_eq!(app.http_method, "GET");
        assert_eq!(app.path, "/a");
        assert_eq!(app.query, "b=c");
        assert_eq!(app.host, "x.io:8080");
        assert_eq!(app.domain, "x.io");
        assert_eq!(app.full_url, "http://x.io/a?b=c");
    }

    #[test]
    fn flags_checksum_mismatch_as_nonfatal() {
        let mut frame = tcp_frame(1, 2, b"");
        // corrupt the IPv4 header checksum
        frame[24] ^= 0xFF;
        let record = PacketDissector::new().dissect(1, &frame, meta());

        let err = record.error.as_ref().unwrap();
        assert_eq!(err.code, 1);
        assert!(!err.fatal);
        // surrounding layers still recorded
        assert!(record.network.is_some());
        assert!(record.transport.is_some());
    }

    #[test]
    fn garbage_frame_records_fatal_error() {
        let record = PacketDissector::new().dissect(1, &[0x01, 0x02], meta());
        let err = record.error.as_ref().unwrap();
        assert_eq!(err.code, 2);
        assert!(err.fatal);
        assert!(record.network.is_none());
    }

    #[test]
    fn parses_http_response_payload() {
        let payload = b"HTTP/1.1 404 Not Found\r\nServer: nginx\r\nContent-Type: text/html\r\n\r\n<html></html>";
        let mut app = ApplicationLayerInfo::default();
        assert!(parse_http_response(payload, &mut app));
        assert_eq!(app.status_code, 404);
        assert_eq!(app.http_status, "404 Not Found");
        assert_eq!(app.server, "nginx");
        assert_eq!(app.content_type, "text/html");
        assert_eq!(app.body, b"<html></html>");
    }

    #[test]
    fn request_with_absolute_uri_extracts_host() {
        let payload = b"GET http://proxy.example:3128/fetch HTTP/1.1\r\n\r\n";
        let mut app = ApplicationLayerInfo::default();
        assert!(parse_http_request(payload, &mut app));
        assert_eq!(app.host, "proxy.example:3128");
        assert_eq!(app.domain, "proxy.example");
        assert_eq!(app.path, "/fetch");
    }

    #[test]
    fn https_scheme_inferred_from_port_and_referer() {
        let payload = b"GET / HTTP/1.1\r\nHost: secure.example:443\r\n\r\n";
        let mut app = ApplicationLayerInfo::default();
        assert!(parse_http_request(payload, &mut app));
        assert_eq!(app.full_url, "https://secure.example/");

        let payload = b"GET /img HTTP/1.1\r\nHost: cdn.example\r\nReferer: https://site.example/\r\n\r\n";
        let mut app = ApplicationLayerInfo::default();
        assert!(parse_http_request(payload, &mut app));
        assert_eq!(app.full_url, "https://cdn.example/img");
    }

    #[test]
    fn fragment_is_stripped_from_path() {
        let payload = b"GET /page?q=1#section HTTP/1.1\r\nHost: a.example\r\n\r\n";
        let mut app = ApplicationLayerInfo::default();
        assert!(parse_http_request(payload, &mut app));
        assert_eq!(app.path, "/page");
        assert_eq!(app.query, "q=1");
    }

    #[test]
    fn non_http_payload_keeps_raw_only() {
        let frame = tcp_frame(5000, 5001, b"\x16\x03\x01\x02\x00binary");
        let record = PacketDissector::new().dissect(1, &frame, meta());
        let app = record.application.as_ref().unwrap();
        assert!(app.http_method.is_empty());
        assert_eq!(app.status_code, 0);
        assert!(!app.payload.is_empty());
    }
}
