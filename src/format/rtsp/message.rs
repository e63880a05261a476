//! RTSP/1.0 requests and responses.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Result, RtspError};

pub const RTSP_VERSION: &str = "RTSP/1.0";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Options,
    Describe,
    Announce,
    Setup,
    Play,
    Record,
    Pause,
    Teardown,
    GetParameter,
    SetParameter,
    /// Any other verb, kept as received.
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Announce => "ANNOUNCE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Record => "RECORD",
            Method::Pause => "PAUSE",
            Method::Teardown => "TEARDOWN",
            Method::GetParameter => "GET_PARAMETER",
            Method::SetParameter => "SET_PARAMETER",
            Method::Other(verb) => verb,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = RtspError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "OPTIONS" => Method::Options,
            "DESCRIBE" => Method::Describe,
            "ANNOUNCE" => Method::Announce,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "RECORD" => Method::Record,
            "PAUSE" => Method::Pause,
            "TEARDOWN" => Method::Teardown,
            "GET_PARAMETER" => Method::GetParameter,
            "SET_PARAMETER" => Method::SetParameter,
            "" => return Err(RtspError::Protocol("empty method".into())),
            other if other.bytes().all(|b| b.is_ascii_graphic()) => Method::Other(other.to_string()),
            other => return Err(RtspError::Protocol(format!("invalid method '{}'", other))),
        })
    }
}

/// Response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const SESSION_NOT_FOUND: StatusCode = StatusCode(454);
    pub const METHOD_NOT_VALID_IN_THIS_STATE: StatusCode = StatusCode(455);
    pub const UNSUPPORTED_TRANSPORT: StatusCode = StatusCode(461);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn reason(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            400 => "Bad Request",
            401 => "Unauthorized",
            404 => "Not Found",
            454 => "Session Not Found",
            455 => "Method Not Valid In This State",
            461 => "Unsupported Transport",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces any existing value of `name`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.0.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn cseq(&self) -> Option<u32> {
        self.get("CSeq").and_then(|v| v.trim().parse().ok())
    }

    /// Session identifier without the `;timeout=` suffix.
    pub fn session_id(&self) -> Option<&str> {
        self.get("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
            .filter(|s| !s.is_empty())
    }

    fn content_length(&self) -> Result<usize> {
        match self.get("Content-Length") {
            Some(v) => Ok(v.trim().parse()?),
            None => Ok(0),
        }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        for (name, value) in &self.0 {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Request-URI; usually an absolute RTSP URL, `*` for server-wide OPTIONS.
    pub uri: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.headers.set("Content-Type", content_type);
        self.body = body.into();
        self
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        buf.put_slice(format!("{} {} {}\r\n", self.method, self.uri, RTSP_VERSION).as_bytes());
        write_headers_and_body(&self.headers, &self.body, buf);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: status.reason().to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.headers.set("Content-Type", content_type);
        self.body = body.into();
        self
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        buf.put_slice(format!("{} {} {}\r\n", RTSP_VERSION, self.status, self.reason).as_bytes());
        write_headers_and_body(&self.headers, &self.body, buf);
    }
}

fn write_headers_and_body(headers: &Headers, body: &Bytes, buf: &mut BytesMut) {
    headers.write_to(buf);
    if !body.is_empty() && !headers.contains("Content-Length") {
        buf.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(body);
}

/// Either kind of textual message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtspMessage {
    Request(Request),
    Response(Response),
}

/// Parses the start line and headers of a message.
///
/// `head` is everything before the blank line. Returns the message without
/// body and the announced body length.
pub(crate) fn parse_head(head: &[u8]) -> Result<(RtspMessage, usize)> {
    let text = std::str::from_utf8(head)
        .map_err(|_| RtspError::Framing("message head is not valid UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let start = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| RtspError::Framing("empty start line".into()))?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RtspError::Framing(format!("invalid header line '{}'", line)))?;
        headers.0.push((name.trim().to_string(), value.trim().to_string()));
    }
    let content_length = headers
        .content_length()
        .map_err(|_| RtspError::Framing("invalid Content-Length".into()))?;

    if let Some(rest) = start.strip_prefix("RTSP/") {
        let mut parts = rest.splitn(3, ' ');
        let _version = parts.next();
        let code = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| RtspError::Framing(format!("invalid status line '{}'", start)))?;
        let reason = parts.next().unwrap_or_default().to_string();
        return Ok((
            RtspMessage::Response(Response {
                status: StatusCode(code),
                reason,
                headers,
                body: Bytes::new(),
            }),
            content_length,
        ));
    }

    let parts: Vec<&str> = start.split(' ').collect();
    if parts.len() != 3 || !parts[2].starts_with("RTSP/") {
        return Err(RtspError::Framing(format!("invalid request line '{}'", start)));
    }
    let method = parts[0]
        .parse::<Method>()
        .map_err(|_| RtspError::Framing(format!("invalid method '{}'", parts[0])))?;

    Ok((
        RtspMessage::Request(Request {
            method,
            uri: parts[1].to_string(),
            headers,
            body: Bytes::new(),
        }),
        content_length,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_marshal() {
        let req = Request::new(Method::Describe, "rtsp://example.com/stream")
            .with_header("CSeq", "1")
            .with_header("Accept", "application/sdp");
        let mut buf = BytesMut::new();
        req.marshal(&mut buf);
        assert_eq!(
            &buf[..],
            &b"DESCRIBE rtsp://example.com/stream RTSP/1.0\r\nCSeq: 1\r\nAccept: application/sdp\r\n\r\n"[..]
        );
    }

    #[test]
    fn test_response_marshal_sets_content_length() {
        let res = Response::ok()
            .with_header("CSeq", "2")
            .with_body("application/sdp", "v=0\r\n");
        let mut buf = BytesMut::new();
        res.marshal(&mut buf);
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn test_parse_head_response() {
        let (msg, len) =
            parse_head(b"RTSP/1.0 454 Session Not Found\r\nCSeq: 3\r\nContent-Length: 4").unwrap();
        assert_eq!(len, 4);
        match msg {
            RtspMessage::Response(res) => {
                assert_eq!(res.status, StatusCode::SESSION_NOT_FOUND);
                assert_eq!(res.reason, "Session Not Found");
                assert_eq!(res.headers.cseq(), Some(3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_head_request() {
        let (msg, len) = parse_head(
            b"PLAY rtsp://example.com/stream RTSP/1.0\r\nCSeq: 4\r\nSession: 12345678;timeout=60",
        )
        .unwrap();
        assert_eq!(len, 0);
        match msg {
            RtspMessage::Request(req) => {
                assert_eq!(req.method, Method::Play);
                assert_eq!(req.uri, "rtsp://example.com/stream");
                assert_eq!(req.headers.session_id(), Some("12345678"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_head_rejects_garbage() {
        assert!(parse_head(b"HELLO").is_err());
        assert!(parse_head(b"FETCH rtsp://x/").is_err());
        assert!(parse_head(b"RTSP/1.0 abc OK").is_err());
        assert!(parse_head(b"RTSP/1.0 200 OK\r\nbroken header").is_err());
    }

    #[test]
    fn test_parse_head_keeps_unknown_method() {
        let (msg, _) = parse_head(b"FETCH rtsp://x/ RTSP/1.0\r\nCSeq: 1").unwrap();
        match msg {
            RtspMessage::Request(req) => {
                assert_eq!(req.method, Method::Other("FETCH".into()));
                assert_eq!(req.method.to_string(), "FETCH");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!("".parse::<Method>().is_err());
    }

    #[test]
    fn test_headers_case_insensitive() {
        let mut headers = Headers::new();
        headers.set("cseq", "7");
        assert_eq!(headers.get("CSeq"), Some("7"));
        headers.set("CSEQ", "8");
        assert_eq!(headers.iter().count(), 1);
        assert_eq!(headers.cseq(), Some(8));
    }
}
