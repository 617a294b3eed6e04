//! DNS wire format parsing (RFC 1035) and IP-to-domain correlation.
//!
//! The capture pipeline runs DNS answers through the correlator so that
//! later packets to the answered addresses can be annotated with the domain
//! they belong to. Correlation is best-effort enrichment, never
//! authoritative.

use log::{debug, trace};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Maximum number of pointer hops allowed during name decompression.
const MAX_COMPRESSION_HOPS: usize = 128;

/// DNS header size in bytes.
const HEADER_SIZE: usize = 12;

const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;

/// A single resolved answer record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,
    pub ip: IpAddr,
}

/// A parsed DNS message, reduced to what correlation needs
#[derive(Debug, Clone, Default)]
pub struct DnsMessage {
    pub is_response: bool,
    pub questions: Vec<String>,
    pub answers: Vec<DnsAnswer>,
}

/// Parse a DNS message payload. Returns `None` when the bytes do not look
/// like DNS at all; a truncated record list yields the records parsed so far.
pub fn parse_dns_message(data: &[u8]) -> Option<DnsMessage> {
    if data.len() < HEADER_SIZE {
        return None;
    }

    let flags = u16::from_be_bytes([data[2], data[3]]);
    let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
    let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;

    let mut msg = DnsMessage {
        is_response: flags & 0x8000 != 0,
        ..Default::default()
    };

    let mut offset = HEADER_SIZE;

    for _ in 0..qdcount {
        let (name, next) = parse_name(data, offset)?;
        // QTYPE + QCLASS
        if next + 4 > data.len() {
            return Some(msg);
        }
        msg.questions.push(name);
        offset = next + 4;
    }

    for _ in 0..ancount {
        let Some((name, next)) = parse_name(data, offset) else {
            return Some(msg);
        };
        // TYPE(2) CLASS(2) TTL(4) RDLENGTH(2)
        if next + 10 > data.len() {
            return Some(msg);
        }
        let rtype = u16::from_be_bytes([data[next], data[next + 1]]);
        let rdlen = u16::from_be_bytes([data[next + 8], data[next + 9]]) as usize;
        let rdata_start = next + 10;
        if rdata_start + rdlen > data.len() {
            return Some(msg);
        }
        let rdata = &data[rdata_start..rdata_start + rdlen];

        match (rtype, rdlen) {
            (TYPE_A, 4) => {
                let ip = IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]));
                msg.answers.push(DnsAnswer { name, ip });
            }
            (TYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                let ip = IpAddr::V6(Ipv6Addr::from(octets));
                msg.answers.push(DnsAnswer { name, ip });
            }
            _ => {
                trace!("skipping DNS answer type {} for {}", rtype, name);
            }
        }
        offset = rdata_start + rdlen;
    }

    Some(msg)
}

/// Decode a possibly-compressed domain name starting at `offset`.
/// Returns the dotted name and the offset just past it in the original
/// (non-pointer) byte stream.
fn parse_name(data: &[u8], offset: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = offset;
    let mut end_after_pointer: Option<usize> = None;
    let mut hops = 0;

    loop {
        let len = *data.get(pos)? as usize;

        if len == 0 {
            pos += 1;
            break;
        }

        // Compression pointer: top two bits set
        if len & 0xC0 == 0xC0 {
            hops += 1;
            if hops > MAX_COMPRESSION_HOPS {
                return None;
            }
            let second = *data.get(pos + 1)? as usize;
            if end_after_pointer.is_none() {
                end_after_pointer = Some(pos + 2);
            }
            pos = ((len & 0x3F) << 8) | second;
            continue;
        }

        if len > 63 || pos + 1 + len > data.len() {
            return None;
        }
        labels.push(String::from_utf8_lossy(&data[pos + 1..pos + 1 + len]).into_owned());
        pos += 1 + len;
    }

    Some((labels.join("."), end_after_pointer.unwrap_or(pos)))
}

/// Process-wide IP-to-domain table fed by observed DNS answers.
///
/// Capped to avoid unbounded growth: once full, the oldest inserted mapping
/// is dropped on the next new insertion. Re-announcing an IP overwrites the
/// mapping in place.
pub struct DnsCorrelator {
    capacity: usize,
    inner: RwLock<CorrelatorInner>,
}

struct CorrelatorInner {
    map: HashMap<IpAddr, String>,
    order: VecDeque<IpAddr>,
}

impl DnsCorrelator {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(CorrelatorInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Record an observed `answer IP -> name` mapping.
    pub fn record(&self, ip: IpAddr, name: &str) {
        let mut inner = self.inner.write();
        if inner.map.insert(ip, name.to_string()).is_none() {
            inner.order.push_back(ip);
            if inner.order.len() > self.capacity {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.map.remove(&evicted);
                    debug!("evicted DNS mapping for {}", evicted);
                }
            }
        }
    }

    /// Look up the domain most recently announced for `ip`.
    pub fn lookup(&self, ip: &IpAddr) -> Option<String> {
        self.inner.read().map.get(ip).cloned()
    }

    /// Resolve a domain for a packet given its endpoint addresses,
    /// preferring the destination side.
    pub fn domain_for(&self, src_ip: Option<IpAddr>, dst_ip: Option<IpAddr>) -> Option<String> {
        let inner = self.inner.read();
        if let Some(dst) = dst_ip {
            if let Some(name) = inner.map.get(&dst) {
                return Some(name.clone());
            }
        }
        if let Some(src) = src_ip {
            if let Some(name) = inner.map.get(&src) {
                return Some(name.clone());
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DnsCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_name(out: &mut Vec<u8>, name: &str) {
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
    }

    fn query(name: &str) -> Vec<u8> {
        let mut out = vec![
            0x12, 0x34, // id
            0x01, 0x00, // flags: standard query, RD
            0x00, 0x01, // qdcount
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        encode_name(&mut out, name);
        out.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A IN
        out
    }

    fn response_with_a(name: &str, ip: [u8; 4]) -> Vec<u8> {
        let mut out = vec![
            0x12, 0x34, // id
            0x81, 0x80, // flags: response, RA
            0x00, 0x01, // qdcount
            0x00, 0x01, // ancount
            0x00, 0x00, 0x00, 0x00,
        ];
        encode_name(&mut out, name);
        out.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        // answer: pointer to offset 12 (the question name)
        out.extend_from_slice(&[0xC0, 0x0C]);
        out.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A IN
        out.extend_from_slice(&[0x00, 0x00, 0x00, 0x3C]); // ttl 60
        out.extend_from_slice(&[0x00, 0x04]);
        out.extend_from_slice(&ip);
        out
    }

    #[test]
    fn parses_query_question() {
        let msg = parse_dns_message(&query("example.com")).unwrap();
        assert!(!msg.is_response);
        assert_eq!(msg.questions, vec!["example.com".to_string()]);
        assert!(msg.answers.is_empty());
    }

    #[test]
    fn parses_response_answer_with_compression() {
        let msg = parse_dns_message(&response_with_a("example.com", [10, 0, 0, 1])).unwrap();
        assert!(msg.is_response);
        assert_eq!(msg.answers.len(), 1);
        assert_eq!(msg.answers[0].name, "example.com");
        assert_eq!(msg.answers[0].ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn rejects_non_dns_bytes() {
        assert!(parse_dns_message(b"GET / HTTP").is_none());
    }

    #[test]
    fn pointer_loop_does_not_hang() {
        // name is a pointer to itself
        let mut data = vec![0u8; 12];
        data[5] = 1; // qdcount = 1
        data.extend_from_slice(&[0xC0, 0x0C]);
        data.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        assert!(parse_dns_message(&data).is_none());
    }

    #[test]
    fn correlator_backfills_domain_preferring_dst() {
        let correlator = DnsCorrelator::new();
        let ip1: IpAddr = "10.0.0.1".parse().unwrap();
        let ip2: IpAddr = "10.0.0.2".parse().unwrap();
        correlator.record(ip1, "example.com");
        correlator.record(ip2, "other.example");

        assert_eq!(
            correlator.domain_for(Some(ip2), Some(ip1)),
            Some("example.com".to_string())
        );
        assert_eq!(
            correlator.domain_for(Some(ip2), None),
            Some("other.example".to_string())
        );
        assert_eq!(correlator.domain_for(None, None), None);
    }

    #[test]
    fn correlator_overwrites_on_new_answer() {
        let correlator = DnsCorrelator::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        correlator.record(ip, "old.example");
        correlator.record(ip, "new.example");
        assert_eq!(correlator.lookup(&ip), Some("new.example".to_string()));
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn correlator_evicts_oldest_beyond_capacity() {
        let correlator = DnsCorrelator::with_capacity(2);
        let ips: Vec<IpAddr> = (1..=3)
            .map(|i| format!("10.0.0.{}", i).parse().unwrap())
            .collect();
        correlator.record(ips[0], "a.example");
        correlator.record(ips[1], "b.example");
        correlator.record(ips[2], "c.example");

        assert_eq!(correlator.len(), 2);
        assert!(correlator.lookup(&ips[0]).is_none());
        assert!(correlator.lookup(&ips[2]).is_some());
    }
}
