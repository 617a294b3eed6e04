use flate2::read::{GzDecoder, ZlibDecoder};
use std::collections::HashMap;
use std::io::Read;

/// Decode HTTP body bytes into human-readable text, best effort.
///
/// Honors gzip and deflate `Content-Encoding`; anything else passes through
/// untouched. Returns the decoded text (empty when the body does not look
/// like text) and the raw `Content-Type` value.
pub fn decode_body_to_text(body: &[u8], headers: &HashMap<String, String>) -> (String, String) {
    if body.is_empty() {
        return (String::new(), String::new());
    }

    let encoding = header_value(headers, "Content-Encoding")
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();

    let mut raw: Vec<u8> = body.to_vec();
    match encoding.as_str() {
        "gzip" => {
            let mut out = Vec::new();
            if GzDecoder::new(body).read_to_end(&mut out).is_ok() && !out.is_empty() {
                raw = out;
            }
        }
        "deflate" => {
            let mut out = Vec::new();
            if ZlibDecoder::new(body).read_to_end(&mut out).is_ok() && !out.is_empty() {
                raw = out;
            }
        }
        _ => {}
    }

    let content_type = header_value(headers, "Content-Type")
        .cloned()
        .unwrap_or_default();

    if is_likely_text(&raw) {
        (String::from_utf8_lossy(&raw).into_owned(), content_type)
    } else {
        (String::new(), content_type)
    }
}

/// True when the printable-character ratio exceeds 60%.
pub fn is_likely_text(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    let printable = data
        .iter()
        .filter(|&&b| (32..=126).contains(&b) || b == 9 || b == 10 || b == 13)
        .count();
    printable as f64 / data.len() as f64 > 0.6
}

/// Case-insensitive header lookup over a first-value header map.
pub fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn decodes_gzip_body() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"hello compressed world").unwrap();
        let compressed = enc.finish().unwrap();

        let hdrs = headers(&[("Content-Encoding", "gzip"), ("Content-Type", "text/plain")]);
        let (text, ct) = decode_body_to_text(&compressed, &hdrs);
        assert_eq!(text, "hello compressed world");
        assert_eq!(ct, "text/plain");
    }

    #[test]
    fn passes_plain_text_through() {
        let hdrs = headers(&[("Content-Type", "text/html")]);
        let (text, _) = decode_body_to_text(b"<html>ok</html>", &hdrs);
        assert_eq!(text, "<html>ok</html>");
    }

    #[test]
    fn binary_body_yields_empty_text() {
        let hdrs = headers(&[]);
        let data: Vec<u8> = (0..=255u8).cycle().take(512).collect();
        let (text, _) = decode_body_to_text(&data, &hdrs);
        assert!(text.is_empty());
    }

    #[test]
    fn printable_ratio_heuristic() {
        assert!(is_likely_text(b"GET / HTTP/1.1\r\n"));
        assert!(!is_likely_text(&[0u8, 1, 2, 3, 4, 5, 6, 7, 8, 11, 12]));
        assert!(!is_likely_text(b""));
    }
}
