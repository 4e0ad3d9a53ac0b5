//! Minimal HTTP/1.1 request framing and response building.

use crate::core::protocol::api::ErrorBody;
use serde::Serialize;

/// Offset just past the header block (`\r\n\r\n` or bare `\n\n`).
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(pos + 4);
    }
    data.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
}

/// `Content-Length` from a header block; 0 when absent or malformed.
pub fn parse_content_length(headers: &str) -> usize {
    headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// A fully read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    pub headers: String,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Split a buffered request into its parts. `None` if the request line
    /// is malformed.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let header_end = find_header_end(raw)?;
        let headers = String::from_utf8_lossy(&raw[..header_end]).into_owned();
        let request_line = headers.lines().next()?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next()?.to_ascii_uppercase();
        let target = parts.next()?;
        let path = target.split('?').next().unwrap_or(target).to_string();
        let content_length = parse_content_length(&headers);
        let body_end = (header_end + content_length).min(raw.len());
        Some(Self {
            method,
            path,
            body: raw[header_end..body_end].to_vec(),
            headers,
        })
    }

    /// Non-empty path segments.
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Head of a response with a known body length.
pub fn response_head(status: u16, content_type: &str, content_length: Option<u64>) -> String {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nConnection: close\r\n",
        status,
        status_text(status),
        content_type
    );
    if let Some(len) = content_length {
        head.push_str(&format!("Content-Length: {len}\r\n"));
    }
    head.push_str("\r\n");
    head
}

pub fn json_response<T: Serialize>(status: u16, body: &T) -> String {
    match serde_json::to_string(body) {
        Ok(json) => format!(
            "{}{}",
            response_head(status, "application/json", Some(json.len() as u64)),
            json
        ),
        Err(e) => error_response(500, &format!("serialization failed: {e}")),
    }
}

pub fn error_response(status: u16, message: &str) -> String {
    let body = ErrorBody {
        error: message.to_string(),
    };
    // ErrorBody always serializes.
    let json = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
    format!(
        "{}{}",
        response_head(status, "application/json", Some(json.len() as u64)),
        json
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_end_handles_both_line_endings() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\n\nbody"), Some(16));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\nHost: x"), None);
    }

    #[test]
    fn request_parses_path_and_body() {
        let raw = b"POST /requests?x=1 HTTP/1.1\r\nContent-Length: 4\r\n\r\n{}{}extra";
        let req = HttpRequest::parse(raw).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/requests");
        assert_eq!(req.body, b"{}{}");
        assert_eq!(req.segments(), vec!["requests"]);
    }

    #[test]
    fn content_length_is_case_insensitive() {
        assert_eq!(parse_content_length("X: y\r\ncontent-length: 12\r\n"), 12);
        assert_eq!(parse_content_length("X: y\r\n"), 0);
    }

    #[test]
    fn error_response_is_json() {
        let resp = error_response(503, "no collectors available");
        assert!(resp.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(resp.ends_with(r#"{"error":"no collectors available"}"#));
    }
}
