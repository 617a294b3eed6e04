use std::collections::HashMap;

use crate::models::flow::ContentInfo;
use crate::utils::httpdecode::header_value;

/// Classify a message body from its bytes and headers.
///
/// Runs on copies of the captured body; the wire bytes are never touched.
pub fn analyze_content(body: &[u8], headers: &HashMap<String, String>) -> ContentInfo {
    let mut info = ContentInfo {
        original_size: body.len() as i64,
        ..Default::default()
    };

    info.mime_type = match header_value(headers, "Content-Type") {
        Some(content_type) if !content_type.is_empty() => content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string(),
        _ => detect_mime_type(body).to_string(),
    };

    if let Some(encoding) = header_value(headers, "Content-Encoding") {
        if !encoding.is_empty() {
            info.compression = encoding.clone();
            info.is_compressed = true;
            info.compressed_size = body.len() as i64;
        }
    }

    if let Some(content_type) = header_value(headers, "Content-Type") {
        if let Some(idx) = content_type.find("charset=") {
            info.encoding = content_type[idx + "charset=".len()..]
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string();
        }
    }

    if info.is_compressed {
        if let Some(declared) = header_value(headers, "Content-Length")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
        {
            info.compressed_size = declared;
        }
        if info.original_size > 0 && info.compressed_size > 0 {
            info.compression_ratio = info.compressed_size as f64 / info.original_size as f64;
        }
    }

    info.is_text = is_text_mime(&info.mime_type);
    info.is_json = !body.is_empty() && serde_json::from_slice::<serde_json::Value>(body).is_ok();
    info.is_xml = is_xml_body(body);
    info.is_image = info.mime_type.starts_with("image/");
    info.is_video = info.mime_type.starts_with("video/");
    info.is_audio = info.mime_type.starts_with("audio/");

    info
}

/// Sniff a MIME type from leading magic bytes.
fn detect_mime_type(body: &[u8]) -> &'static str {
    if body.is_empty() {
        return "application/octet-stream";
    }
    if body.len() > 4 && body[0] == 0x89 && body[1] == 0x50 && body[2] == 0x4E && body[3] == 0x47 {
        return "image/png";
    }
    if body.len() > 2 && body[0] == 0xFF && body[1] == 0xD8 {
        return "image/jpeg";
    }
    if body.len() > 4 && body.starts_with(b"<!DOCTYPE") {
        return "text/html";
    }
    if body[0] == b'{' {
        return "application/json";
    }
    if body[0] == b'<' {
        return "text/xml";
    }
    "application/octet-stream"
}

fn is_text_mime(mime: &str) -> bool {
    mime.starts_with("text/") || mime.contains("json") || mime.contains("xml")
}

fn is_xml_body(body: &[u8]) -> bool {
    if body.is_empty() {
        return false;
    }
    let trimmed = String::from_utf8_lossy(body);
    let trimmed = trimmed.trim();
    trimmed.starts_with('<') && trimmed.ends_with('>')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn mime_from_content_type_strips_parameters() {
        let info = analyze_content(
            b"{}",
            &headers(&[("Content-Type", "application/json; charset=utf-8")]),
        );
        assert_eq!(info.mime_type, "application/json");
        assert_eq!(info.encoding, "utf-8");
        assert!(info.is_text);
        assert!(info.is_json);
    }

    #[test]
    fn sniffs_png_magic() {
        let info = analyze_content(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A], &headers(&[]));
        assert_eq!(info.mime_type, "image/png");
        assert!(info.is_image);
        assert!(!info.is_text);
    }

    #[test]
    fn sniffs_jpeg_html_json_xml() {
        assert_eq!(
            analyze_content(&[0xFF, 0xD8, 0xFF], &headers(&[])).mime_type,
            "image/jpeg"
        );
        assert_eq!(
            analyze_content(b"<!DOCTYPE html><html></html>", &headers(&[])).mime_type,
            "text/html"
        );
        assert_eq!(
            analyze_content(b"{\"a\":1}", &headers(&[])).mime_type,
            "application/json"
        );
        assert_eq!(
            analyze_content(b"<root/>", &headers(&[])).mime_type,
            "text/xml"
        );
    }

    #[test]
    fn xml_heuristic_requires_both_brackets() {
        assert!(analyze_content(b"  <a>ok</a>  ", &headers(&[])).is_xml);
        assert!(!analyze_content(b"<unterminated", &headers(&[])).is_xml);
    }

    #[test]
    fn compression_ratio_uses_declared_length() {
        let body = vec![0x1F, 0x8B, 0x08, 0x00];
        let info = analyze_content(
            &body,
            &headers(&[("Content-Encoding", "gzip"), ("Content-Length", "2")]),
        );
        assert!(info.is_compressed);
        assert_eq!(info.compression, "gzip");
        assert_eq!(info.compressed_size, 2);
        assert!((info.compression_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_body_is_octet_stream() {
        let info = analyze_content(b"", &headers(&[]));
        assert_eq!(info.mime_type, "application/octet-stream");
        assert!(!info.is_json);
        assert!(!info.is_xml);
    }
}
