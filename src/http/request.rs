//! Line-oriented HTTP/1.1 request parser: a resumable state machine over the
//! connection's read buffer. No chunked transfer encoding, no pipelining —
//! the body is read as a single trailing line, matching the source this was
//! distilled from (see module docs on `HttpConnection` for the tradeoff).

use std::collections::HashMap;
use std::fmt;

use crate::buffer::ByteBuffer;
use crate::db::DbPool;

// `simdutf8` (also used transitively by `zero-mysql`'s own text-protocol
// decoding, see `examples/elbaro-zero-mysql/src/raw.rs`) gives the
// request-line/header validation a fast path with no allocation when the
// bytes are plain ASCII, which is the overwhelming common case on this
// line-oriented parse.

/// Paths that get special register/login handling once form-decoded.
const REGISTER_PATH: &str = "/register.html";
const LOGIN_PATH: &str = "/login.html";

/// Extensionless paths that should have `.html` appended, mirroring the
/// source's `DEFAULT_HTML` set.
const DEFAULT_HTML: &[&str] = &["/index", "/register", "/login", "/welcome", "/video", "/picture"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    MalformedRequestLine,
    InvalidMethod,
    MalformedHeaderLine,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MalformedRequestLine => write!(f, "malformed request line"),
            ParseError::InvalidMethod => write!(f, "invalid HTTP method"),
            ParseError::MalformedHeaderLine => write!(f, "malformed header line"),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug)]
pub struct HttpRequest {
    pub state: ParseState,
    pub method: Method,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub post: HashMap<String, String>,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequest {
    pub fn new() -> Self {
        HttpRequest {
            state: ParseState::RequestLine,
            method: Method::Get,
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: String::new(),
            post: HashMap::new(),
        }
    }

    /// Resets to the initial state for the next request on a keep-alive
    /// connection. Buffers are owned by the connection, not here.
    pub fn reset(&mut self) {
        *self = HttpRequest::new();
    }

    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("Connection") {
            Some(v) => v.eq_ignore_ascii_case("keep-alive") && self.version == "1.1",
            None => false,
        }
    }

    /// Resumable parse over `buf`'s readable region. Returns `Ok(true)` once
    /// `Finish` is reached, `Ok(false)` if more bytes are needed. `db` is
    /// consulted only when a register/login form submission completes.
    pub fn parse(&mut self, buf: &mut ByteBuffer, db: Option<&DbPool>) -> Result<bool, ParseError> {
        loop {
            if self.state == ParseState::Finish {
                return Ok(true);
            }

            // The body isn't CRLF-framed (it's Content-Length framed, read
            // here as a single trailing chunk), so it can't wait on
            // `find_crlf` the way the request line and headers do: a real
            // form POST has no terminator after its last byte. Consume a
            // CRLF if one happens to be present, otherwise take the whole
            // readable region as the body.
            if self.state == ParseState::Body {
                let available = buf.readable();
                if available == 0 {
                    return Ok(false);
                }
                let line_end = find_crlf(buf.peek());
                let line_len = line_end.unwrap_or(available);
                let consume = line_end.map_or(available, |e| e + 2);
                self.body = decode_line(&buf.peek()[..line_len]);
                self.parse_form_body(db);
                self.state = ParseState::Finish;
                buf.retrieve(consume);
                return Ok(true);
            }

            let Some(line_end) = find_crlf(buf.peek()) else {
                return Ok(false);
            };
            let readable_before_line = buf.readable();
            let line = decode_line(&buf.peek()[..line_end]);
            match self.state {
                ParseState::RequestLine => {
                    self.parse_request_line(&line)?;
                    self.normalize_path();
                }
                ParseState::Headers => {
                    if !self.parse_header_line(&line) {
                        self.state = ParseState::Body;
                    }
                    // Mirrors the source: checked against the readable count
                    // *including* the line just processed, so a request with
                    // no body (just the trailing blank line) finishes here
                    // instead of waiting for a BODY line that never arrives.
                    if readable_before_line <= 2 {
                        self.state = ParseState::Finish;
                    }
                }
                ParseState::Body | ParseState::Finish => unreachable!(),
            }
            buf.retrieve(line_end + 2);
        }
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut parts = line.splitn(3, ' ');
        let (Some(method), Some(path), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::MalformedRequestLine);
        };
        let Some(version) = version.strip_prefix("HTTP/") else {
            return Err(ParseError::MalformedRequestLine);
        };
        self.method = match method {
            "GET" => Method::Get,
            "POST" => Method::Post,
            _ => return Err(ParseError::InvalidMethod),
        };
        self.path = path.to_string();
        self.version = version.to_string();
        self.state = ParseState::Headers;
        Ok(())
    }

    fn normalize_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    /// Returns `false` when the line fails to match `key: value`, signaling
    /// the end of the headers section (the blank line before the body).
    fn parse_header_line(&mut self, line: &str) -> bool {
        match line.find(':') {
            Some(idx) => {
                let key = line[..idx].trim().to_string();
                let value = line[idx + 1..].trim().to_string();
                self.headers.insert(key, value);
                true
            }
            None => false,
        }
    }

    fn parse_form_body(&mut self, db: Option<&DbPool>) {
        let is_form_post = self.method == Method::Post
            && self
                .headers
                .get("Content-Type")
                .is_some_and(|ct| ct == "application/x-www-form-urlencoded");
        if !is_form_post {
            return;
        }
        self.post = url_decode_form(&self.body);

        let tag = if self.path == REGISTER_PATH {
            Some(false)
        } else if self.path == LOGIN_PATH {
            Some(true)
        } else {
            None
        };
        if let Some(is_login) = tag {
            let username = self.post.get("username").cloned().unwrap_or_default();
            let password = self.post.get("password").cloned().unwrap_or_default();
            let verified = match db {
                Some(pool) => crate::db::verify_user(pool, &username, &password, is_login),
                None => false,
            };
            self.path = if verified {
                "/welcome.html".to_string()
            } else {
                "/error.html".to_string()
            };
        }
    }
}

/// Most request lines are plain ASCII, so the common case is a validated
/// borrow with no copy; only malformed/non-UTF-8 input falls back to the
/// lossy conversion.
fn decode_line(bytes: &[u8]) -> String {
    match simdutf8::basic::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    let mut start = 0;
    while let Some(rel) = memchr::memchr(b'\r', &data[start..]) {
        let pos = start + rel;
        if data.get(pos + 1) == Some(&b'\n') {
            return Some(pos);
        }
        start = pos + 1;
    }
    None
}

/// `%HH` with a non-hex digit is treated as a literal percent sign followed
/// by the raw characters: the escape is simply not decoded. This resolves
/// the open question in favor of "reject the escape" without discarding
/// input bytes.
fn decode_hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

fn url_decode_form(body: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if body.is_empty() {
        return out;
    }
    let bytes = body.as_bytes();
    let mut key = String::new();
    let mut value = Vec::new();
    let mut in_value = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'=' if !in_value => {
                key = String::from_utf8_lossy(&value).into_owned();
                value.clear();
                in_value = true;
                i += 1;
            }
            b'+' => {
                value.push(b' ');
                i += 1;
            }
            b'%' => {
                match (
                    bytes.get(i + 1).copied().and_then(decode_hex_digit),
                    bytes.get(i + 2).copied().and_then(decode_hex_digit),
                ) {
                    (Some(hi), Some(lo)) => {
                        value.push(hi * 16 + lo);
                        i += 3;
                    }
                    _ => {
                        value.push(b'%');
                        i += 1;
                    }
                }
            }
            b'&' => {
                out.insert(key.clone(), String::from_utf8_lossy(&value).into_owned());
                key.clear();
                value.clear();
                in_value = false;
                i += 1;
            }
            c => {
                value.push(c);
                i += 1;
            }
        }
    }
    if in_value {
        out.insert(key, String::from_utf8_lossy(&value).into_owned());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(bytes: &[u8]) -> (ByteBuffer, HttpRequest) {
        let mut buf = ByteBuffer::new();
        buf.append(bytes);
        (buf, HttpRequest::new())
    }

    #[test]
    fn parses_simple_get_and_normalizes_root() {
        let (mut buf, mut req) = feed(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n");
        assert!(req.parse(&mut buf, None).unwrap());
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/index.html");
        assert!(req.is_keep_alive());
    }

    #[test]
    fn resumes_across_partial_writes() {
        let mut buf = ByteBuffer::new();
        let mut req = HttpRequest::new();
        buf.append(b"GET /a.html HTTP/1.1\r\n");
        assert!(!req.parse(&mut buf, None).unwrap());
        assert_eq!(req.state, ParseState::Headers);
        buf.append(b"\r\n");
        assert!(req.parse(&mut buf, None).unwrap());
        assert_eq!(req.path, "/a.html");
    }

    #[test]
    fn url_decode_handles_plus_and_percent_escapes() {
        let form = url_decode_form("a=hello+world&b=%21");
        assert_eq!(form.get("a").unwrap(), "hello world");
        assert_eq!(form.get("b").unwrap(), "!");
    }

    #[test]
    fn url_decode_treats_bad_escape_as_literal() {
        let form = url_decode_form("a=100%zz");
        assert_eq!(form.get("a").unwrap(), "100%zz");
    }

    #[test]
    fn register_without_db_pool_redirects_to_error() {
        // No trailing CRLF after the body: a real client's form POST ends at
        // the last body byte, since the body is Content-Length framed, not
        // CRLF-framed like the request line and headers.
        let (mut buf, mut req) = feed(
            b"POST /register.html HTTP/1.1\r\n\
Content-Type: application/x-www-form-urlencoded\r\n\r\n\
username=alice&password=pw",
        );
        assert!(req.parse(&mut buf, None).unwrap());
        assert_eq!(req.path, "/error.html");
    }

    #[test]
    fn body_without_trailing_crlf_still_finishes() {
        let (mut buf, mut req) = feed(b"POST /submit HTTP/1.1\r\nHost: x\r\n\r\nabc");
        assert!(req.parse(&mut buf, None).unwrap());
        assert_eq!(req.body, "abc");
        assert_eq!(req.state, ParseState::Finish);
        assert_eq!(buf.readable(), 0);
    }
}
