//! The HTTP/1.1 dialect spoken over HAP connections.
//!
//! Requests and responses are plain HTTP; notifications reuse the response
//! layout with an `EVENT/1.0` status line.

use hap_core::error::HttpError;
use hap_core::status::{HapStatus, HttpStatus};
use serde_json::{json, Value};

pub const CONTENT_TYPE_HAP_JSON: &str = "application/hap+json";
pub const CONTENT_TYPE_PAIRING_TLV8: &str = "application/pairing+tlv8";
pub const CONTENT_TYPE_JPEG: &str = "image/jpeg";

const MAX_HEADER_LEN: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
}

impl Method {
    fn parse(s: &str) -> Result<Self, HttpError> {
        match s {
            "GET" => Ok(Self::Get),
            "PUT" => Ok(Self::Put),
            "POST" => Ok(Self::Post),
            other => Err(HttpError::UnsupportedMethod(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
        }
    }
}

/// Start line, headers and body of one message.
struct RawMessage {
    start_line: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    consumed: usize,
}

/// Split the first complete message off `buf`.
///
/// `Ok(None)` means more bytes are needed.
fn split_message(buf: &[u8], max_body: usize) -> Result<Option<RawMessage>, HttpError> {
    let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        if buf.len() > MAX_HEADER_LEN {
            return Err(HttpError::Malformed("header section too long".to_string()));
        }
        return Ok(None);
    };

    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| HttpError::Malformed("invalid UTF-8 in headers".to_string()))?;
    let mut lines = head.split("\r\n");
    let start_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| HttpError::Malformed("missing start line".to_string()))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::Malformed(format!("bad header line: {}", line)))?;
        headers.push((key.trim().to_string(), value.trim().to_string()));
    }

    let content_length = match header_value(&headers, "Content-Length") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| HttpError::Malformed(format!("bad Content-Length: {}", v)))?,
        None => 0,
    };
    if content_length > max_body {
        return Err(HttpError::BodyTooLarge(content_length));
    }

    let body_start = header_end + 4;
    if buf.len() < body_start + content_length {
        return Ok(None);
    }

    Ok(Some(RawMessage {
        start_line,
        headers,
        body: buf[body_start..body_start + content_length].to_vec(),
        consumed: body_start + content_length,
    }))
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Parsed HAP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Parse the first request in `buf`.
    ///
    /// Returns the request and the number of bytes it occupied, or `None`
    /// while the request is incomplete.
    pub fn parse(buf: &[u8], max_body: usize) -> Result<Option<(Self, usize)>, HttpError> {
        let Some(raw) = split_message(buf, max_body)? else {
            return Ok(None);
        };

        let mut parts = raw.start_line.split(' ');
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(HttpError::Malformed(format!(
                "bad request line: {}",
                raw.start_line
            )));
        };
        if !version.starts_with("HTTP/") {
            return Err(HttpError::Malformed(format!("not HTTP: {}", version)));
        }
        let method = Method::parse(method)?;

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (target, Vec::new()),
        };

        Ok(Some((
            Self {
                method,
                path: path.to_string(),
                query,
                headers: raw.headers,
                body: raw.body,
            },
            raw.consumed,
        )))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Query flags such as `meta=1`.
    pub fn query_flag(&self, name: &str) -> bool {
        matches!(self.query_param(name), Some("1") | Some("true"))
    }

    /// Serialize, as a controller would send it.
    pub fn serialize(&self) -> Vec<u8> {
        let mut target = self.path.clone();
        if !self.query.is_empty() {
            let query: Vec<String> = self
                .query
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            target.push('?');
            target.push_str(&query.join("&"));
        }
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method.as_str(), target);
        for (key, value) in &self.headers {
            if !key.eq_ignore_ascii_case("Content-Length") {
                out.push_str(&format!("{}: {}\r\n", key, value));
            }
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// A response or, with `event` set, an `EVENT/1.0` notification.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: HttpStatus,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub event: bool,
}

impl HttpResponse {
    pub fn new(status: HttpStatus) -> Self {
        Self {
            status,
            content_type: None,
            body: Vec::new(),
            event: false,
        }
    }

    pub fn with_body(status: HttpStatus, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: Some(content_type.to_string()),
            body,
            event: false,
        }
    }

    pub fn json(status: HttpStatus, body: &Value) -> Self {
        Self::with_body(status, CONTENT_TYPE_HAP_JSON, body.to_string().into_bytes())
    }

    /// `{"status": <code>}` body used for whole-request failures.
    pub fn hap_status(status: HttpStatus, hap: HapStatus) -> Self {
        Self::json(status, &json!({ "status": hap.code() }))
    }

    pub fn tlv8(body: Vec<u8>) -> Self {
        Self::with_body(HttpStatus::Ok, CONTENT_TYPE_PAIRING_TLV8, body)
    }

    /// Notification carrying `{"characteristics": [...]}`.
    pub fn event(characteristics: Vec<Value>) -> Self {
        Self {
            event: true,
            ..Self::json(
                HttpStatus::Ok,
                &json!({ "characteristics": characteristics }),
            )
        }
    }

    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let protocol = if self.event { "EVENT/1.0" } else { "HTTP/1.1" };
        let mut out = format!("{} {}\r\n", protocol, self.status);
        if let Some(content_type) = &self.content_type {
            out.push_str(&format!("Content-Type: {}\r\n", content_type));
        }
        out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        if !self.event {
            out.push_str("Connection: keep-alive\r\n");
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Parse the first response or event in `buf`, as a controller would.
    pub fn parse(buf: &[u8], max_body: usize) -> Result<Option<(Self, usize)>, HttpError> {
        let Some(raw) = split_message(buf, max_body)? else {
            return Ok(None);
        };
        let mut parts = raw.start_line.splitn(3, ' ');
        let protocol = parts.next().unwrap_or_default();
        let event = match protocol {
            "EVENT/1.0" => true,
            p if p.starts_with("HTTP/") => false,
            other => return Err(HttpError::Malformed(format!("bad status line: {}", other))),
        };
        let status = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .and_then(HttpStatus::from_code)
            .ok_or_else(|| HttpError::Malformed(format!("bad status line: {}", raw.start_line)))?;
        Ok(Some((
            Self {
                status,
                content_type: header_value(&raw.headers, "Content-Type").map(str::to_string),
                body: raw.body,
                event,
            },
            raw.consumed,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod request {
        use super::*;

        #[test]
        fn parse_get_with_query() {
            let data = b"GET /characteristics?id=1.10,2.9&meta=1 HTTP/1.1\r\nHost: bridge\r\n\r\n";
            let (request, consumed) = HttpRequest::parse(data, 1024).unwrap().unwrap();
            assert_eq!(consumed, data.len());
            assert_eq!(request.method, Method::Get);
            assert_eq!(request.path, "/characteristics");
            assert_eq!(request.query_param("id"), Some("1.10,2.9"));
            assert!(request.query_flag("meta"));
            assert!(!request.query_flag("perms"));
            assert_eq!(request.header("host"), Some("bridge"));
        }

        #[test]
        fn parse_put_with_body() {
            let body = br#"{"characteristics":[]}"#;
            let mut data = format!(
                "PUT /characteristics HTTP/1.1\r\nContent-Type: application/hap+json\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .into_bytes();
            data.extend_from_slice(body);
            let (request, _) = HttpRequest::parse(&data, 1024).unwrap().unwrap();
            assert_eq!(request.method, Method::Put);
            assert_eq!(request.body, body);
        }

        #[test]
        fn incomplete_request_waits() {
            let data = b"POST /pair-setup HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
            assert!(HttpRequest::parse(data, 1024).unwrap().is_none());
            assert!(HttpRequest::parse(b"GET /accessories HTTP/1.1\r\n", 1024)
                .unwrap()
                .is_none());
        }

        #[test]
        fn pipelined_requests_are_split() {
            let data = b"GET /accessories HTTP/1.1\r\n\r\nGET /accessories HTTP/1.1\r\n\r\n";
            let (_, consumed) = HttpRequest::parse(data, 1024).unwrap().unwrap();
            assert_eq!(consumed, data.len() / 2);
        }

        #[test]
        fn rejects_unknown_method_and_large_body() {
            assert!(matches!(
                HttpRequest::parse(b"DELETE /pairings HTTP/1.1\r\n\r\n", 1024),
                Err(HttpError::UnsupportedMethod(_))
            ));
            assert!(matches!(
                HttpRequest::parse(b"PUT /x HTTP/1.1\r\nContent-Length: 4096\r\n\r\n", 1024),
                Err(HttpError::BodyTooLarge(4096))
            ));
        }

        #[test]
        fn serialize_then_parse() {
            let request = HttpRequest {
                method: Method::Get,
                path: "/characteristics".to_string(),
                query: vec![("id".to_string(), "1.2".to_string())],
                headers: vec![],
                body: vec![],
            };
            let (parsed, _) = HttpRequest::parse(&request.serialize(), 1024).unwrap().unwrap();
            assert_eq!(parsed.path, "/characteristics");
            assert_eq!(parsed.query_param("id"), Some("1.2"));
        }
    }

    mod response {
        use super::*;

        #[test]
        fn serialize_no_content() {
            let bytes = HttpResponse::new(HttpStatus::NoContent).serialize();
            let text = String::from_utf8(bytes).unwrap();
            assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
            assert!(text.contains("Content-Length: 0\r\n"));
            assert!(text.ends_with("\r\n\r\n"));
        }

        #[test]
        fn hap_status_body() {
            let response = HttpResponse::hap_status(
                HttpStatus::BadRequest,
                HapStatus::InvalidValueInRequest,
            );
            assert_eq!(response.content_type.as_deref(), Some(CONTENT_TYPE_HAP_JSON));
            assert_eq!(response.body_json(), Some(json!({ "status": -70410 })));
        }

        #[test]
        fn event_layout() {
            let event = HttpResponse::event(vec![json!({"aid": 2, "iid": 10, "value": true})]);
            let bytes = event.serialize();
            assert!(bytes.starts_with(b"EVENT/1.0 200 OK\r\n"));

            let (parsed, consumed) = HttpResponse::parse(&bytes, 1024).unwrap().unwrap();
            assert_eq!(consumed, bytes.len());
            assert!(parsed.event);
            assert_eq!(
                parsed.body_json().unwrap()["characteristics"][0]["iid"],
                json!(10)
            );
        }

        #[test]
        fn parse_multi_status() {
            let response = HttpResponse::json(HttpStatus::MultiStatus, &json!({"characteristics": []}));
            let (parsed, _) = HttpResponse::parse(&response.serialize(), 1024).unwrap().unwrap();
            assert_eq!(parsed.status, HttpStatus::MultiStatus);
            assert!(!parsed.event);
        }
    }
}
