use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A captured packet, one section per decoded layer.
///
/// Sections are `None` when the frame does not carry the layer; a parse
/// failure in one layer never discards the layers around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketRecord {
    /// Unique identifier for this packet
    pub id: u64,

    pub metadata: PacketMetadata,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkLayerInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkLayerInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportLayerInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<ApplicationLayerInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorLayerInfo>,
}

/// Capture-time metadata for a frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketMetadata {
    /// Capture timestamp (nanosecond precision when the driver provides it)
    pub capture_time: DateTime<Utc>,

    /// Original length on the wire
    pub wire_length: usize,

    /// Bytes actually captured
    pub capture_length: usize,

    /// True when capture_length < wire_length
    pub truncated: bool,

    /// Interface index the frame arrived on
    pub interface_index: i32,
}

/// Link layer section; only Ethernet is modeled
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkLayerInfo {
    pub src_mac: String,
    pub dst_mac: String,
    pub eth_type: String,
    pub length: usize,
}

/// Network layer section for IPv4 or IPv6
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkLayerInfo {
    /// IP version (4 or 6)
    pub ip_version: u8,
    pub src_ip: String,
    pub dst_ip: String,
    pub protocol: String,
    pub length: usize,
    pub ttl: u8,

    // IPv4 specific fields
    #[serde(default, skip_serializing_if = "is_zero_u8")]
    pub ihl: u8,
    #[serde(default, skip_serializing_if = "is_zero_u8")]
    pub tos: u8,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub identifier: u16,
    #[serde(default, skip_serializing_if = "is_zero_u8")]
    pub flags: u8,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub frag_offset: u16,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub checksum: u16,

    // IPv6 specific fields
    #[serde(default, skip_serializing_if = "is_zero_u8")]
    pub traffic_class: u8,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub flow_label: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub next_header: String,
    #[serde(default, skip_serializing_if = "is_zero_u8")]
    pub hop_limit: u8,

    // Address classification
    pub is_src_loopback: bool,
    pub is_dst_loopback: bool,
    pub is_src_link_local: bool,
    pub is_dst_link_local: bool,
    pub is_src_ip_valid: bool,
    pub is_dst_ip_valid: bool,
}

/// Transport layer section for TCP or UDP
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportLayerInfo {
    /// "TCP" or "UDP"
    pub protocol: String,
    pub src_port: u16,
    pub dst_port: u16,

    // TCP fields
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub seq_number: u32,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub ack_number: u32,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub window_size: u16,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub checksum: u16,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub urgent_ptr: u16,

    #[serde(default, skip_serializing_if = "is_false")]
    pub is_fin: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_syn: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_rst: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_psh: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_ack: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_urg: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_ece: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_cwr: bool,

    // UDP fields
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub udp_length: u16,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub udp_checksum: u16,
}

/// Application layer section: raw payload plus a best-effort HTTP parse
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationLayerInfo {
    /// Raw payload, base64-encoded for transport-safe serialization
    pub payload: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_status: String,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_uri: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "super::base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,

    // Commonly referenced header shortcuts
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub content_length: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub authorization: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub referer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cookie: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub set_cookie: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub accept: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub accept_language: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub accept_encoding: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connection: String,

    // URL decomposition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub full_url: String,
}

/// Error section, present only when a decoder reported a problem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLayerInfo {
    pub error: String,
    /// Identifier of the layer that failed to decode
    pub layer: String,
    pub fatal: bool,
    /// 1 = checksum mismatch, 2 = other
    pub code: u8,
}

impl PacketRecord {
    /// Source IP, empty when no network layer decoded.
    pub fn src_ip(&self) -> &str {
        self.network.as_ref().map(|n| n.src_ip.as_str()).unwrap_or("")
    }

    /// Destination IP, empty when no network layer decoded.
    pub fn dst_ip(&self) -> &str {
        self.network.as_ref().map(|n| n.dst_ip.as_str()).unwrap_or("")
    }

    /// Transport protocol discriminant ("TCP"/"UDP"), empty otherwise.
    pub fn protocol(&self) -> &str {
        self.transport
            .as_ref()
            .map(|t| t.protocol.as_str())
            .unwrap_or("")
    }

    pub fn src_port(&self) -> u16 {
        self.transport.as_ref().map(|t| t.src_port).unwrap_or(0)
    }

    pub fn dst_port(&self) -> u16 {
        self.transport.as_ref().map(|t| t.dst_port).unwrap_or(0)
    }

    pub fn domain(&self) -> &str {
        self.application
            .as_ref()
            .map(|a| a.domain.as_str())
            .unwrap_or("")
    }
}

fn is_zero_u8(v: &u8) -> bool {
    *v == 0
}
fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}
fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}
fn is_false(v: &bool) -> bool {
    !*v
}
