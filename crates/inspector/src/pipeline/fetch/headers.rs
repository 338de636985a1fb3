//! Response header parsing for probes

use reqwest::header::{self, HeaderMap};

/// Total resource size declared by the origin
///
/// `Content-Range` wins over `Content-Length` because a partial-content probe
/// reports the length of the slice, not the resource. Zero is treated as
/// unknown.
pub fn declared_size(headers: &HeaderMap) -> Option<u64> {
    let from_range = header_str(headers, header::CONTENT_RANGE).and_then(total_from_content_range);

    from_range
        .or_else(|| header_str(headers, header::CONTENT_LENGTH).and_then(|v| v.trim().parse::<u64>().ok()))
        .filter(|size| *size > 0)
}

/// Parse the complete-length part of `bytes 0-0/12345`
pub fn total_from_content_range(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}

pub fn content_type(headers: &HeaderMap) -> Option<String> {
    header_str(headers, header::CONTENT_TYPE).map(|v| v.trim().to_string())
}

/// True when the declared type is an HTML document
pub fn is_html(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
}

/// Filename from a `Content-Disposition` value
///
/// The RFC 5987 `filename*=` form is preferred over the plain `filename=`
/// form. An extended value that does not decode to UTF-8 is ignored.
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    let mut extended: Option<String> = None;
    let mut plain: Option<String> = None;

    for part in value.split(';') {
        let part = part.trim();
        let Some((key, raw)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let raw = raw.trim().trim_matches('"');

        if key == "filename*" {
            // charset'language'percent-encoded-value
            let encoded = raw.splitn(3, '\'').nth(2).unwrap_or(raw);
            if let Ok(decoded) = percent_encoding::percent_decode_str(encoded).decode_utf8() {
                if !decoded.is_empty() {
                    extended = Some(decoded.into_owned());
                }
            }
        } else if key == "filename" && !raw.is_empty() {
            plain = Some(raw.to_string());
        }
    }

    extended.or(plain)
}

pub fn content_disposition_filename(headers: &HeaderMap) -> Option<String> {
    header_str(headers, header::CONTENT_DISPOSITION).and_then(filename_from_content_disposition)
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
