use chrono::SecondsFormat;

use crate::models::flow::Flow;
use crate::utils::error::AppResult;

/// Fixed CSV column order for flow export
pub const CSV_HEADER: [&str; 40] = [
    "ID",
    "Scheme",
    "RemoteAddr",
    "StartAt",
    "EndAt",
    "LatencyMs",
    "Method",
    "URL",
    "Host",
    "Path",
    "Query",
    "StatusCode",
    "Status",
    "ResponseLength",
    "DNSLookupTime",
    "TCPConnectTime",
    "TLSHandshakeTime",
    "TTFB",
    "ContentTransferTime",
    "TotalTime",
    "TLSVersion",
    "CipherSuite",
    "IsSecure",
    "ClientIP",
    "ServerIP",
    "Country",
    "Region",
    "City",
    "ISP",
    "MIMEType",
    "Encoding",
    "Compression",
    "IsCompressed",
    "IsText",
    "IsJSON",
    "IsImage",
    "ErrorType",
    "ErrorMessage",
    "IsTimeout",
    "RetryCount",
];

/// Serialize flows as pretty-printed JSON.
pub fn export_json(flows: &[Flow]) -> AppResult<String> {
    Ok(serde_json::to_string_pretty(flows)?)
}

/// Serialize flows as CSV in the fixed column order, one row per flow,
/// empty cells for absent sections.
pub fn export_csv(flows: &[Flow]) -> String {
    let mut out = String::new();
    out.push_str(&CSV_HEADER.join(","));
    out.push('\n');

    for flow in flows {
        let row = flow_to_record(flow);
        let escaped: Vec<String> = row.iter().map(|cell| escape_cell(cell)).collect();
        out.push_str(&escaped.join(","));
        out.push('\n');
    }
    out
}

fn flow_to_record(flow: &Flow) -> Vec<String> {
    let mut record: Vec<String> = Vec::with_capacity(CSV_HEADER.len());

    record.push(flow.id.clone());
    record.push(flow.scheme.clone());
    record.push(flow.remote_addr.clone());
    record.push(flow.start_at.to_rfc3339_opts(SecondsFormat::Secs, true));
    record.push(
        flow.end_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default(),
    );
    record.push(flow.latency_ms.map(|l| l.to_string()).unwrap_or_default());

    record.push(flow.request.method.clone());
    record.push(flow.request.url.clone());
    record.push(flow.request.host.clone());
    record.push(flow.request.path.clone());
    record.push(flow.request.query.clone());

    match &flow.response {
        Some(resp) => {
            record.push(resp.status_code.to_string());
            record.push(resp.status.clone());
            record.push(resp.length.to_string());
        }
        None => record.extend(empty(3)),
    }

    match &flow.performance {
        Some(perf) => {
            record.push(perf.dns_lookup_time.to_string());
            record.push(perf.tcp_connect_time.to_string());
            record.push(perf.tls_handshake_time.to_string());
            record.push(perf.ttfb.to_string());
            record.push(perf.content_transfer_time.to_string());
            record.push(perf.total_time.to_string());
        }
        None => record.extend(empty(6)),
    }

    match &flow.tls {
        Some(tls) => {
            record.push(tls.version.clone());
            record.push(tls.cipher_suite.clone());
            record.push(tls.is_secure.to_string());
        }
        None => record.extend(empty(3)),
    }

    match &flow.network {
        Some(net) => {
            record.push(net.client_ip.clone());
            record.push(net.server_ip.clone());
            record.push(net.country.clone());
            record.push(net.region.clone());
            record.push(net.city.clone());
            record.push(net.isp.clone());
        }
        None => record.extend(empty(6)),
    }

    match &flow.content {
        Some(content) => {
            record.push(content.mime_type.clone());
            record.push(content.encoding.clone());
            record.push(content.compression.clone());
            record.push(content.is_compressed.to_string());
            record.push(content.is_text.to_string());
            record.push(content.is_json.to_string());
            record.push(content.is_image.to_string());
        }
        None => record.extend(empty(7)),
    }

    match &flow.error {
        Some(err) => {
            record.push(err.r#type.clone());
            record.push(err.message.clone());
            record.push(err.is_timeout.to_string());
            record.push(err.retry_count.to_string());
        }
        None => record.extend(empty(4)),
    }

    record
}

fn empty(n: usize) -> Vec<String> {
    vec![String::new(); n]
}

fn escape_cell(cell: &str) -> String {
    if cell.contains(',') || cell.contains('"') || cell.contains('\n') {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::flow::{HttpRequestInfo, HttpResponseInfo};
    use chrono::Utc;

    fn flow() -> Flow {
        Flow {
            id: "f-1".into(),
            scheme: "https".into(),
            remote_addr: "127.0.0.1:50000".into(),
            start_at: Utc::now(),
            end_at: Some(Utc::now()),
            latency_ms: Some(12),
            request: HttpRequestInfo {
                method: "GET".into(),
                url: "https://example.com/a,b".into(),
                host: "example.com".into(),
                path: "/a,b".into(),
                ..Default::default()
            },
            response: Some(HttpResponseInfo {
                status: "200 OK".into(),
                status_code: 200,
                length: 5,
                ..Default::default()
            }),
            performance: None,
            tls: None,
            error: None,
            content: None,
            network: None,
        }
    }

    #[test]
    fn header_row_has_fixed_order() {
        let csv = export_csv(&[]);
        let header = csv.lines().next().unwrap();
        assert!(header.starts_with("ID,Scheme,RemoteAddr,StartAt,EndAt,LatencyMs,Method,URL"));
        assert!(header.ends_with("ErrorType,ErrorMessage,IsTimeout,RetryCount"));
        assert_eq!(header.split(',').count(), CSV_HEADER.len());
    }

    #[test]
    fn absent_sections_become_empty_cells() {
        let csv = export_csv(&[flow()]);
        let row = csv.lines().nth(1).unwrap();
        // commas inside the URL are quoted, so raw parsing needs the count
        // after collapsing quoted cells; check the quoting itself instead
        assert!(row.contains("\"https://example.com/a,b\""));
        assert!(row.contains("200 OK"));
        // performance through error sections are all empty
        assert!(row.ends_with(",,,"));
    }

    #[test]
    fn json_export_round_trips() {
        let json = export_json(&[flow()]).unwrap();
        let parsed: Vec<Flow> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, "f-1");
    }
}
