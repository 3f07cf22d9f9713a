//! Minimal request/response types
//!
//! This is intentionally not a general HTTP implementation: only enough
//! structure to route `/profile`, extract query parameters, and write a
//! status line, a few headers, and a body back over the connection.

use std::fmt::Write as _;

pub(crate) const DEFAULT_HTTP_VERSION: &str = "HTTP/1.0";

#[derive(Debug)]
pub(crate) struct Request {
    pub method: String,
    pub path: String,
    pub http_version: String,
    query: Vec<(String, String)>,
}

impl Request {
    /// Parse a request line of the shape `METHOD /path?query HTTP/1.x`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let method = parts.next()?;
        let target = parts.next()?;
        let http_version = parts.next().unwrap_or(DEFAULT_HTTP_VERSION);

        let (path, raw_query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };

        let query = raw_query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                (percent_decode(name), percent_decode(value))
            })
            .collect();

        Some(Self {
            method: method.to_string(),
            path: path.to_string(),
            http_version: http_version.to_string(),
            query,
        })
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Decode `%XX` escapes and `+` in a query component. Malformed escapes
/// pass through untouched.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                match bytes
                    .get(i + 1..i + 3)
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug)]
pub(crate) struct Response {
    pub status: u16,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl Response {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into().into_bytes(),
        }
    }

    pub fn json(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type", "application/json".to_string())],
            body,
        }
    }

    pub fn header(&mut self, name: &'static str, value: impl Into<String>) {
        self.headers.push((name, value.into()));
    }

    /// Serialize as a wire response, echoing the request's HTTP version in
    /// the status line.
    pub fn into_bytes(self, http_version: &str) -> Vec<u8> {
        let mut head = String::new();
        let _ = write!(head, "{} {}\r\n", http_version, self.status);
        for (name, value) in &self.headers {
            let _ = write!(head, "{}: {}\r\n", name, value);
        }
        let _ = write!(head, "Content-Length: {}\r\n\r\n", self.body.len());

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let request =
            Request::parse("GET /profile?duration=0.5&mode=cpu HTTP/1.1").unwrap();
        assert_eq!("GET", request.method);
        assert_eq!("/profile", request.path);
        assert_eq!("HTTP/1.1", request.http_version);
        assert_eq!(Some("0.5"), request.query_param("duration"));
        assert_eq!(Some("cpu"), request.query_param("mode"));
        assert_eq!(None, request.query_param("interval"));
    }

    #[test]
    fn test_parse_without_query_or_version() {
        let request = Request::parse("GET /profile").unwrap();
        assert_eq!("/profile", request.path);
        assert_eq!(DEFAULT_HTTP_VERSION, request.http_version);
        assert_eq!(None, request.query_param("duration"));
    }

    #[test]
    fn test_parse_empty_line_is_none() {
        assert!(Request::parse("").is_none());
        assert!(Request::parse("GET").is_none());
    }

    #[test]
    fn test_percent_decoding() {
        let request = Request::parse("GET /profile?context=a%20b+c HTTP/1.0").unwrap();
        assert_eq!(Some("a b c"), request.query_param("context"));
    }

    #[test]
    fn test_malformed_escape_passes_through() {
        let request = Request::parse("GET /profile?x=%zz HTTP/1.0").unwrap();
        assert_eq!(Some("%zz"), request.query_param("x"));
    }

    #[test]
    fn test_response_wire_format() {
        let response = Response::text(404, "Unsupported endpoint /");
        let bytes = response.into_bytes("HTTP/1.0");
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            "HTTP/1.0 404\r\nContent-Length: 22\r\n\r\nUnsupported endpoint /",
            text
        );
    }

    #[test]
    fn test_json_response_carries_content_type() {
        let mut response = Response::json(200, b"{}".to_vec());
        response.header("Access-Control-Allow-Origin", "*");
        let text = String::from_utf8(response.into_bytes("HTTP/1.1")).unwrap();
        assert!(text.starts_with("HTTP/1.1 200\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));
    }
}
