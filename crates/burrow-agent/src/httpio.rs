use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use burrow_proto::HttpResponseInfo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const IO_CHUNK_SIZE: usize = 8 * 1024;
const HEAD_BYTE_LIMIT: usize = 64 * 1024;
const BODY_DEADLINE: Duration = Duration::from_secs(60);
const BODY_IDLE_GRACE: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum HttpParseError {
    #[error("connection closed before a request arrived")]
    Eof,
    #[error("read timed out")]
    Timeout,
    #[error("malformed request line {0:?}")]
    MalformedRequestLine(String),
    #[error("malformed header line {0:?}")]
    HeaderParse(String),
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),
    #[error("request head exceeded {0} bytes")]
    HeadTooLarge(usize),
    #[error("origin-form target without a Host header")]
    MissingHost,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One parsed proxy request: request line, headers, best-effort body.
#[derive(Debug, Clone)]
pub struct RawHttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl RawHttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// `close` on Proxy-Connection or Connection ends the exchange loop
    /// after this request.
    pub fn wants_close(&self) -> bool {
        let header = self
            .header("Proxy-Connection")
            .or_else(|| self.header("Connection"));
        header.is_some_and(|value| value.eq_ignore_ascii_case("close"))
    }

    /// Absolute URL for the proxied request: an absolute-form target is
    /// used directly, an origin-form target is combined with the Host
    /// header under the scheme of the enclosing tunnel.
    pub fn target_url(&self, https: bool) -> Result<String, HttpParseError> {
        if self.target.starts_with("http://") || self.target.starts_with("https://") {
            return Ok(self.target.clone());
        }
        if self.target.starts_with('/') {
            let host = self.header("Host").ok_or(HttpParseError::MissingHost)?;
            let scheme = if https { "https" } else { "http" };
            return Ok(format!("{scheme}://{host}{}", self.target));
        }
        Err(HttpParseError::MalformedRequestLine(format!(
            "{} {} {}",
            self.method, self.target, self.version
        )))
    }

    /// CONNECT authority, defaulting to port 443.
    pub fn connect_authority(&self) -> Option<(String, u16)> {
        if !self.is_connect() {
            return None;
        }
        match self.target.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                port.parse::<u16>().ok().map(|port| (host.to_string(), port))
            }
            _ if !self.target.is_empty() => Some((self.target.clone(), 443)),
            _ => None,
        }
    }
}

/// Byte stream with a pull-through buffer, so line-based head parsing and
/// raw body reads can share one socket.
pub struct BufferedStream<S> {
    pub stream: S,
    buffer: Vec<u8>,
}

impl<S> BufferedStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> BufferedStream<S> {
    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = self.stream.read(&mut chunk).await?;
        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    /// Reads one CRLF-terminated line. Returns None on a clean EOF before
    /// any byte of the line.
    async fn read_line(&mut self) -> Result<Option<String>, HttpParseError> {
        loop {
            if let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=position).collect();
                if line.last() == Some(&b'\n') {
                    line.pop();
                }
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let text = String::from_utf8(line)
                    .map_err(|error| HttpParseError::HeaderParse(error.to_string()))?;
                return Ok(Some(text));
            }
            if self.buffer.len() > HEAD_BYTE_LIMIT {
                return Err(HttpParseError::HeadTooLarge(HEAD_BYTE_LIMIT));
            }
            let read = self.fill().await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(HttpParseError::Eof);
            }
        }
    }

    async fn read_body_exact(&mut self, length: usize) -> Result<Vec<u8>, HttpParseError> {
        let deadline = tokio::time::Instant::now() + BODY_DEADLINE;
        while self.buffer.len() < length {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.fill()).await {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {}
                Ok(Err(error)) => return Err(error.into()),
                Err(_) => break,
            }
        }
        let take = length.min(self.buffer.len());
        Ok(self.buffer.drain(..take).collect())
    }

    /// Without a Content-Length the body is whatever is already available:
    /// buffered bytes plus anything that arrives before the line goes
    /// idle. Deliberately not a chunked-transfer decoder.
    async fn drain_available(&mut self) -> Result<Vec<u8>, HttpParseError> {
        let deadline = tokio::time::Instant::now() + BODY_DEADLINE;
        loop {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            match tokio::time::timeout(BODY_IDLE_GRACE, self.fill()).await {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {}
                Ok(Err(error)) => return Err(error.into()),
                Err(_) => break,
            }
        }
        Ok(std::mem::take(&mut self.buffer))
    }
}

/// Parses one request off the stream. A timeout waiting for the request
/// line ends a keep-alive connection gracefully.
pub async fn parse_request<S>(
    conn: &mut BufferedStream<S>,
    read_timeout: Duration,
) -> Result<RawHttpRequest, HttpParseError>
where
    S: AsyncRead + Unpin,
{
    let request_line = match tokio::time::timeout(read_timeout, conn.read_line()).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => return Err(HttpParseError::Eof),
        Ok(Err(error)) => return Err(error),
        Err(_) => return Err(HttpParseError::Timeout),
    };

    let parts: Vec<&str> = request_line.split(' ').collect();
    let [method, target, version] = parts.as_slice() else {
        return Err(HttpParseError::MalformedRequestLine(request_line.clone()));
    };
    if method.is_empty() || target.is_empty() || !version.starts_with("HTTP/") {
        return Err(HttpParseError::MalformedRequestLine(request_line.clone()));
    }
    let (method, target, version) =
        (method.to_string(), target.to_string(), version.to_string());

    let mut headers = BTreeMap::new();
    loop {
        let line = match conn.read_line().await? {
            Some(line) => line,
            None => return Err(HttpParseError::Eof),
        };
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpParseError::HeaderParse(line.clone()))?;
        if name.trim().is_empty() {
            return Err(HttpParseError::HeaderParse(line.clone()));
        }
        headers.insert(name.trim().to_string(), value.trim().to_string());
    }

    let request = RawHttpRequest {
        method,
        target,
        version,
        headers,
        body: Vec::new(),
    };

    if request.is_connect() {
        return Ok(request);
    }

    let content_length = match request.header("Content-Length") {
        Some(value) => Some(
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| HttpParseError::InvalidContentLength(value.to_string()))?,
        ),
        None => None,
    };

    let body = match content_length {
        Some(0) => Vec::new(),
        Some(length) => conn.read_body_exact(length).await?,
        None => conn.drain_available().await?,
    };

    Ok(RawHttpRequest { body, ..request })
}

/// Serializes a tunnel response back to the proxy client. Any inbound
/// Content-Length is discarded and recomputed from the actual body.
pub async fn write_response<W>(
    writer: &mut W,
    version: &str,
    response: &HttpResponseInfo,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!(
        "{version} {} {}\r\n",
        response.http_status,
        reason_phrase(response.http_status)
    );
    for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", response.body_len()));

    writer.write_all(head.as_bytes()).await?;
    if let Some(body) = response.payload.as_deref() {
        for chunk in body.chunks(IO_CHUNK_SIZE) {
            writer.write_all(chunk).await?;
        }
    }
    writer.flush().await
}

pub async fn write_error_response<W>(writer: &mut W, status: u16, body: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut response = HttpResponseInfo::with_status(status);
    response
        .headers
        .insert("Content-Type".to_string(), "text/plain".to_string());
    response.payload = Some(body.as_bytes().to_vec());
    write_response(writer, "HTTP/1.1", &response).await
}

fn reason_phrase(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("Unknown")
}
