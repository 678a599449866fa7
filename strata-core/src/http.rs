use crate::error::ProxyError;
use http::{Method, StatusCode, Version};

const MAX_HEADERS: usize = 64;

/// Ordered multimap of header fields. Lookup is case-insensitive; insertion
/// order is preserved for serialization.
#[derive(Debug, Clone, Default)]
pub struct Fields(Vec<(String, String)>);

impl Fields {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace all values of `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.0.push((name.to_string(), value.into()));
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
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

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        for (k, v) in &self.0 {
            buf.extend_from_slice(k.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(v.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
    }
}

fn version_str(v: Version) -> &'static str {
    match v {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

fn parse_version(minor: u8) -> Version {
    if minor == 0 { Version::HTTP_10 } else { Version::HTTP_11 }
}

/// A parsed client or origin request header. Once parse-complete the
/// request line is final for hook semantics; fields stay mutable.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub fields: Fields,
}

impl RequestHeader {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            version: Version::HTTP_11,
            fields: Fields::default(),
        }
    }

    /// Parse from a byte prefix. Returns the header and its wire length, or
    /// `None` when more bytes are needed.
    pub fn parse(data: &[u8]) -> Result<Option<(Self, usize)>, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(data) {
            Ok(httparse::Status::Complete(len)) => {
                let method = req
                    .method
                    .unwrap_or("GET")
                    .parse::<Method>()
                    .map_err(|e| ProxyError::ParseError(e.to_string()))?;
                let mut fields = Fields::default();
                for h in req.headers.iter() {
                    if h.name.is_empty() {
                        break;
                    }
                    let value = std::str::from_utf8(h.value)
                        .map_err(|_| ProxyError::ParseError("non-UTF8 header value".into()))?;
                    fields.append(h.name, value);
                }
                Ok(Some((
                    Self {
                        method,
                        target: req.path.unwrap_or("/").to_string(),
                        version: parse_version(req.version.unwrap_or(1)),
                        fields,
                    },
                    len,
                )))
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(e) => Err(ProxyError::ParseError(e.to_string())),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.target.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(version_str(self.version).as_bytes());
        buf.extend_from_slice(b"\r\n");
        self.fields.write_to(&mut buf);
        buf.extend_from_slice(b"\r\n");
        buf
    }

    pub fn host(&self) -> Option<&str> {
        if let Some(rest) = self
            .target
            .strip_prefix("http://")
            .or_else(|| self.target.strip_prefix("https://"))
        {
            let end = rest.find('/').unwrap_or(rest.len());
            return Some(&rest[..end]);
        }
        self.fields.get("host")
    }

    /// Absolute URL used as the cache key base.
    pub fn effective_url(&self) -> String {
        if self.target.starts_with("http://") || self.target.starts_with("https://") {
            return self.target.clone();
        }
        match self.fields.get("host") {
            Some(host) => format!("http://{host}{}", self.target),
            None => self.target.clone(),
        }
    }

    /// Path portion of the request-target (absolute-form aware).
    pub fn path(&self) -> &str {
        if let Some(rest) = self
            .target
            .strip_prefix("http://")
            .or_else(|| self.target.strip_prefix("https://"))
        {
            match rest.find('/') {
                Some(i) => &rest[i..],
                None => "/",
            }
        } else {
            &self.target
        }
    }

    pub fn keep_alive(&self) -> bool {
        match self.fields.get("connection") {
            Some(v) => !v.eq_ignore_ascii_case("close"),
            None => self.version != Version::HTTP_10,
        }
    }

    pub fn strip_hop_by_hop(&mut self) {
        for name in HOP_BY_HOP {
            self.fields.remove(name);
        }
    }
}

/// A parsed origin or synthesized response header.
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    pub status: StatusCode,
    pub version: Version,
    pub fields: Fields,
}

impl ResponseHeader {
    pub fn new(status: StatusCode) -> Self {
        Self { status, version: Version::HTTP_11, fields: Fields::default() }
    }

    pub fn parse(data: &[u8]) -> Result<Option<(Self, usize)>, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        match resp.parse(data) {
            Ok(httparse::Status::Complete(len)) => {
                let status = StatusCode::from_u16(resp.code.unwrap_or(200))
                    .map_err(|e| ProxyError::ParseError(e.to_string()))?;
                let mut fields = Fields::default();
                for h in resp.headers.iter() {
                    if h.name.is_empty() {
                        break;
                    }
                    let value = std::str::from_utf8(h.value)
                        .map_err(|_| ProxyError::ParseError("non-UTF8 header value".into()))?;
                    fields.append(h.name, value);
                }
                Ok(Some((
                    Self {
                        status,
                        version: parse_version(resp.version.unwrap_or(1)),
                        fields,
                    },
                    len,
                )))
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(e) => Err(ProxyError::ParseError(e.to_string())),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(version_str(self.version).as_bytes());
        buf.push(b' ');
        let mut itoa_buf = itoa::Buffer::new();
        buf.extend_from_slice(itoa_buf.format(self.status.as_u16()).as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(status_text(self.status.as_u16()).as_bytes());
        buf.extend_from_slice(b"\r\n");
        self.fields.write_to(&mut buf);
        buf.extend_from_slice(b"\r\n");
        buf
    }

    pub fn content_length(&self) -> Option<u64> {
        self.fields.get("content-length").and_then(|v| v.trim().parse().ok())
    }

    pub fn keep_alive(&self) -> bool {
        match self.fields.get("connection") {
            Some(v) => !v.eq_ignore_ascii_case("close"),
            None => self.version != Version::HTTP_10,
        }
    }

    pub fn strip_hop_by_hop(&mut self) {
        for name in HOP_BY_HOP {
            self.fields.remove(name);
        }
    }

    pub fn etag(&self) -> Option<&str> {
        self.fields.get("etag")
    }
}

pub fn status_text(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "proxy-authenticate",
    "proxy-authorization",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

// ── Body framing ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

pub fn request_body_framing(req: &RequestHeader) -> BodyFraming {
    if let Some(te) = req.fields.get("transfer-encoding")
        && te.to_ascii_lowercase().contains("chunked")
    {
        return BodyFraming::Chunked;
    }
    match req.fields.get("content-length").and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(0) | None => BodyFraming::None,
        Some(n) => BodyFraming::ContentLength(n),
    }
}

pub fn response_body_framing(req_method: &Method, resp: &ResponseHeader) -> BodyFraming {
    let code = resp.status.as_u16();
    if *req_method == Method::HEAD || code == 204 || code == 304 || (100..200).contains(&code) {
        return BodyFraming::None;
    }
    if let Some(te) = resp.fields.get("transfer-encoding")
        && te.to_ascii_lowercase().contains("chunked")
    {
        return BodyFraming::Chunked;
    }
    match resp.content_length() {
        Some(n) => BodyFraming::ContentLength(n),
        None => BodyFraming::CloseDelimited,
    }
}

/// Incremental chunked-transfer decoder. Feed wire bytes, collect decoded
/// body bytes; `done` flips after the terminal chunk and trailers.
pub struct ChunkedDecoder {
    state: ChunkState,
    remaining: u64,
    line: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data,
    DataCrlf,
    Trailer,
    Done,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: ChunkState::Size, remaining: 0, line: Vec::new() }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Consume `input`, appending decoded bytes to `out`. Returns the number
    /// of input bytes consumed.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ProxyError> {
        let mut pos = 0;
        while pos < input.len() && self.state != ChunkState::Done {
            match self.state {
                ChunkState::Size => {
                    let byte = input[pos];
                    pos += 1;
                    if byte == b'\n' {
                        let text = std::str::from_utf8(&self.line)
                            .map_err(|_| ProxyError::ParseError("bad chunk size".into()))?;
                        let size_part = text.trim_end_matches('\r');
                        let size_hex = size_part.split(';').next().unwrap_or("").trim();
                        let size = u64::from_str_radix(size_hex, 16)
                            .map_err(|_| ProxyError::ParseError(format!("bad chunk size {size_hex:?}")))?;
                        self.line.clear();
                        if size == 0 {
                            self.state = ChunkState::Trailer;
                        } else {
                            self.remaining = size;
                            self.state = ChunkState::Data;
                        }
                    } else {
                        if self.line.len() > 16 {
                            return Err(ProxyError::ParseError("chunk size line too long".into()));
                        }
                        self.line.push(byte);
                    }
                }
                ChunkState::Data => {
                    let take = ((input.len() - pos) as u64).min(self.remaining) as usize;
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        self.state = ChunkState::DataCrlf;
                    }
                }
                ChunkState::DataCrlf => {
                    let byte = input[pos];
                    pos += 1;
                    if byte == b'\n' {
                        self.state = ChunkState::Size;
                    } else if byte != b'\r' {
                        return Err(ProxyError::ParseError("missing chunk CRLF".into()));
                    }
                }
                ChunkState::Trailer => {
                    let byte = input[pos];
                    pos += 1;
                    if byte == b'\n' {
                        if self.line.iter().all(|b| *b == b'\r') {
                            self.state = ChunkState::Done;
                        }
                        self.line.clear();
                    } else {
                        self.line.push(byte);
                    }
                }
                ChunkState::Done => {}
            }
        }
        Ok(pos)
    }
}

// ── Freshness & conditionals ──────────────────────────────────

fn cache_control_directive(fields: &Fields, directive: &str) -> Option<String> {
    let cc = fields.get("cache-control")?;
    for part in cc.split(',') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix(directive) {
            if rest.is_empty() {
                return Some(String::new());
            }
            if let Some(v) = rest.strip_prefix('=') {
                return Some(v.trim_matches('"').to_string());
            }
        } else if part.eq_ignore_ascii_case(directive) {
            return Some(String::new());
        }
    }
    None
}

fn parse_http_date(value: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    chrono::DateTime::parse_from_rfc2822(value).ok()
}

/// Freshness lifetime in seconds: `max-age` wins over `Expires - Date`.
pub fn freshness_lifetime_secs(resp: &ResponseHeader) -> Option<i64> {
    if let Some(v) = cache_control_directive(&resp.fields, "max-age")
        && let Ok(secs) = v.parse::<i64>()
    {
        return Some(secs);
    }
    let expires = parse_http_date(resp.fields.get("expires")?)?;
    let date = resp.fields.get("date").and_then(parse_http_date)?;
    Some((expires - date).num_seconds())
}

pub fn has_no_store(resp: &ResponseHeader) -> bool {
    cache_control_directive(&resp.fields, "no-store").is_some()
        || cache_control_directive(&resp.fields, "private").is_some()
}

pub fn has_no_cache(resp: &ResponseHeader) -> bool {
    cache_control_directive(&resp.fields, "no-cache").is_some()
}

/// Baseline cacheability: method, status, and response directives. The 206
/// case is deliberately excluded here; the state machine re-evaluates it at
/// send-response time after plugins have had a chance to rewrite the status.
pub fn is_cacheable_response(method: &Method, resp: &ResponseHeader) -> bool {
    if *method != Method::GET {
        return false;
    }
    if has_no_store(resp) {
        return false;
    }
    matches!(resp.status.as_u16(), 200 | 203 | 300 | 301 | 308 | 410)
}

/// RFC 9110 `If-None-Match` evaluation (weak comparison).
pub fn if_none_match_matches(header_value: &str, etag: &str) -> bool {
    if header_value.trim() == "*" {
        return true;
    }
    let normalize = |t: &str| t.trim().trim_start_matches("W/").to_string();
    let target = normalize(etag);
    header_value.split(',').any(|candidate| normalize(candidate) == target)
}
