use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, BytesMut};
use rand::RngCore;
use sha1::{Digest, Sha1};
use spcore::{SpError, SpResult};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on an upgrade head; anything longer is treated as hostile.
pub const MAX_HEAD: usize = 8192;

/// `Sec-WebSocket-Accept` for a given `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// A fresh client key: 16 random bytes, base64 (24 characters).
pub fn make_key() -> String {
    let mut raw = [0u8; 16];
    rand::rng().fill_bytes(&mut raw);
    BASE64.encode(raw)
}

fn header_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Does a comma-separated header value contain `token` (case-insensitive)?
fn has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| header_eq(t.trim(), token))
}

/// An HTTP/1.1 request head, just enough for the upgrade bootstrap.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn new(method: &str, uri: &str) -> RequestHead {
        RequestHead {
            method: method.to_string(),
            uri: uri.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| header_eq(n, name))
            .map(|(_, v)| v.as_str())
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(self.method.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.uri.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");
        for (name, value) in &self.headers {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
    }

    pub fn deser(raw: &[u8]) -> SpResult<RequestHead> {
        let text = std::str::from_utf8(raw).map_err(|_| SpError::ProtocolError)?;
        let mut lines = text.split("\r\n");
        let request = lines.next().ok_or(SpError::ProtocolError)?;
        let mut parts = request.split(' ');
        let method = parts.next().ok_or(SpError::ProtocolError)?;
        let uri = parts.next().ok_or(SpError::ProtocolError)?;
        let version = parts.next().ok_or(SpError::ProtocolError)?;
        if version != "HTTP/1.1" || parts.next().is_some() {
            return Err(SpError::ProtocolError);
        }
        let mut head = RequestHead::new(method, uri);
        head.headers = parse_headers(lines)?;
        Ok(head)
    }
}

/// An HTTP/1.1 response head.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new(status: u16, reason: &str) -> ResponseHead {
        ResponseHead {
            status,
            reason: reason.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(n, _)| !header_eq(n, name));
        self.add_header(name, value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| header_eq(n, name))
            .map(|(_, v)| v.as_str())
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        for (name, value) in &self.headers {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
    }

    pub fn deser(raw: &[u8]) -> SpResult<ResponseHead> {
        let text = std::str::from_utf8(raw).map_err(|_| SpError::ProtocolError)?;
        let mut lines = text.split("\r\n");
        let status_line = lines.next().ok_or(SpError::ProtocolError)?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().ok_or(SpError::ProtocolError)?;
        if !version.starts_with("HTTP/1.") {
            return Err(SpError::ProtocolError);
        }
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(SpError::ProtocolError)?;
        let reason = parts.next().unwrap_or("");
        let mut head = ResponseHead::new(status, reason);
        head.headers = parse_headers(lines)?;
        Ok(head)
    }
}

fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> SpResult<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(SpError::ProtocolError)?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

/// Find the end of a head (the CRLFCRLF) in a growing buffer. Returns the offset
///  just past the terminator.
pub fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Build the client upgrade request for `host` and `path`.
pub fn client_request(host: &str, path: &str, key: &str, protocols: &[String]) -> RequestHead {
    let mut req = RequestHead::new("GET", path);
    req.add_header("Host", host);
    req.add_header("Upgrade", "websocket");
    req.add_header("Connection", "Upgrade");
    req.add_header("Sec-WebSocket-Key", key);
    req.add_header("Sec-WebSocket-Version", "13");
    if !protocols.is_empty() {
        req.add_header("Sec-WebSocket-Protocol", &protocols.join(", "));
    }
    req
}

/// Validate a server 101 against the key we sent. Returns the sub-protocol the
///  server selected, if any.
pub fn check_server_response(res: &ResponseHead, key: &str) -> SpResult<Option<String>> {
    match res.status {
        101 => {}
        403 => return Err(SpError::PermissionDenied),
        _ => return Err(SpError::ConnRefused),
    }
    let upgraded = res.header("Upgrade").map(|v| header_eq(v, "websocket"));
    let connection = res.header("Connection").map(|v| has_token(v, "upgrade"));
    let accept = res.header("Sec-WebSocket-Accept");
    if upgraded != Some(true) || connection != Some(true) || accept != Some(accept_key(key).as_str())
    {
        return Err(SpError::ProtocolError);
    }
    Ok(res.header("Sec-WebSocket-Protocol").map(str::to_string))
}

/// Validate a client upgrade request. On success returns the response to send
///  (101 with the accept key and, when we support one of the requested
///  sub-protocols, that protocol). On failure returns the error response.
pub fn check_client_request(
    req: &RequestHead,
    supported: &[String],
) -> Result<ResponseHead, ResponseHead> {
    if req.method != "GET" {
        return Err(ResponseHead::new(405, "Method Not Allowed"));
    }
    if req.header("Host").is_none() {
        return Err(ResponseHead::new(400, "Bad Request"));
    }
    let upgraded = req.header("Upgrade").map(|v| has_token(v, "websocket"));
    let connection = req.header("Connection").map(|v| has_token(v, "upgrade"));
    if upgraded != Some(true) || connection != Some(true) {
        return Err(ResponseHead::new(426, "Upgrade Required"));
    }
    if req.header("Sec-WebSocket-Version") != Some("13") {
        let mut res = ResponseHead::new(426, "Upgrade Required");
        res.add_header("Sec-WebSocket-Version", "13");
        return Err(res);
    }
    let Some(key) = req.header("Sec-WebSocket-Key") else {
        return Err(ResponseHead::new(400, "Bad Request"));
    };

    let mut res = ResponseHead::new(101, "Switching Protocols");
    res.add_header("Upgrade", "websocket");
    res.add_header("Connection", "Upgrade");
    res.add_header("Sec-WebSocket-Accept", &accept_key(key));

    if let Some(requested) = req.header("Sec-WebSocket-Protocol") {
        let selected = requested
            .split(',')
            .map(str::trim)
            .find(|r| supported.iter().any(|s| header_eq(s, r)));
        if let Some(proto) = selected {
            res.add_header("Sec-WebSocket-Protocol", proto);
        } else if !supported.is_empty() {
            return Err(ResponseHead::new(400, "Bad Request"));
        }
    }
    Ok(res)
}
