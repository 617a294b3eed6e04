use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One request/response pair observed by the interception proxy.
///
/// Created when the request is read (state: pending, `end_at` unset) and
/// frozen once `end_at` is filled by the response path or an abort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// 128-bit unique identifier, string form
    pub id: String,

    /// "http" or "https"
    pub scheme: String,

    /// Client peer address as seen by the accept loop
    pub remote_addr: String,

    pub start_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,

    pub request: HttpRequestInfo,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<HttpResponseInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceMetrics>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkInfo>,
}

/// Request half of a flow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpRequestInfo {
    pub method: String,
    pub url: String,
    pub path: String,
    pub query: String,
    pub host: String,
    pub headers: HashMap<String, String>,
    #[serde(with = "super::base64_bytes")]
    pub body: Vec<u8>,
    pub proto: String,
    /// Declared content length, -1 when absent
    pub length: i64,
}

/// Response half of a flow; absent when the exchange aborted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpResponseInfo {
    /// Reason phrase, e.g. "200 OK"
    pub status: String,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    #[serde(with = "super::base64_bytes")]
    pub body: Vec<u8>,
    pub proto: String,
    pub length: i64,
}

/// Per-flow timing slots, milliseconds; -1 means not measured
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub dns_lookup_time: i64,
    pub tcp_connect_time: i64,
    pub tls_handshake_time: i64,
    pub ttfb: i64,
    pub content_transfer_time: i64,
    pub total_time: i64,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            dns_lookup_time: -1,
            tcp_connect_time: -1,
            tls_handshake_time: -1,
            ttfb: -1,
            content_transfer_time: -1,
            total_time: -1,
        }
    }
}

/// TLS session details for https flows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsInfo {
    pub version: String,
    pub cipher_suite: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateInfo>,
    pub is_secure: bool,
    pub protocol: String,
}

/// Summary of the first upstream peer certificate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    pub serial_number: String,
    /// Hex of the certificate signature bytes
    pub fingerprint: String,
    pub is_self_signed: bool,
    /// True when the current time falls inside the validity window
    pub is_valid: bool,
}

/// Why a flow aborted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// "network", "dns" or "tls"
    pub r#type: String,
    pub message: String,
    pub code: i32,
    pub is_timeout: bool,
    pub retry_count: u32,
    pub is_network: bool,
    pub is_dns: bool,
    pub is_tls: bool,
}

impl ErrorInfo {
    pub fn new(kind: &str, message: String, is_timeout: bool) -> Self {
        Self {
            r#type: kind.to_string(),
            message,
            code: 0,
            is_timeout,
            retry_count: 0,
            is_network: kind == "network",
            is_dns: kind == "dns",
            is_tls: kind == "tls",
        }
    }
}

/// Body classification by MIME, charset, compression and shape heuristics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentInfo {
    pub mime_type: String,
    pub encoding: String,
    pub compression: String,
    pub is_compressed: bool,
    pub original_size: i64,
    pub compressed_size: i64,
    pub compression_ratio: f64,
    pub is_text: bool,
    pub is_json: bool,
    pub is_xml: bool,
    pub is_image: bool,
    pub is_video: bool,
    pub is_audio: bool,
}

/// Client/server addressing plus local-only geo sentinels
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub client_ip: String,
    pub server_ip: String,
    pub client_port: u16,
    pub server_port: u16,
    pub is_ipv6: bool,
    pub is_localhost: bool,
    pub is_private: bool,
    pub country: String,
    pub region: String,
    pub city: String,
    pub isp: String,
    pub asn: String,
}

/// Everything the response path contributes when a flow is finalized.
///
/// Applied in one synchronous store call so readers only ever see a flow
/// before or after completion, never mid-update.
#[derive(Debug, Clone, Default)]
pub struct FlowCompletion {
    pub end_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<i64>,
    pub response: Option<HttpResponseInfo>,
    pub performance: Option<PerformanceMetrics>,
    pub tls: Option<TlsInfo>,
    pub error: Option<ErrorInfo>,
    pub content: Option<ContentInfo>,
}
