//! Minimal HTTP/1.0 GET client.
//!
//! One request per connection: the request asks for `Connection: close` and
//! `Accept-Encoding: identity`, so the body is whatever arrives before the
//! server closes the stream. No chunked decoding.

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{clock::Clock, error::FetchError};

pub const DEFAULT_USER_AGENT: &str = "GroundBoardBA";
pub const HEADER_LIMIT: usize = 4096;
pub const HTTPS_PORT: u16 = 443;
pub const HTTP_PORT: u16 = 80;

const HEADER_CHUNK: usize = 256;
const BODY_CHUNK: usize = 1024;
const PROBE_READ_LIMIT: usize = 64;

/// A byte stream owned by exactly one request.
pub trait Connection: Read + Write {}

impl<T: Read + Write> Connection for T {}

/// Opens outbound connections. Closing happens on drop.
pub trait Transport {
    fn open(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, FetchError>;
}

/// Platform TLS primitive: resolve, connect and complete a handshake.
pub trait TlsConnector {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, FetchError>;
}

/// Plain TCP for most ports, the platform TLS connector for the TLS ones.
pub struct NetTransport<C> {
    tls: C,
    tls_ports: Vec<u16>,
}

impl<C: TlsConnector> NetTransport<C> {
    pub fn new(tls: C) -> Self {
        Self {
            tls,
            tls_ports: vec![HTTPS_PORT],
        }
    }

    pub fn uses_tls(&self, port: u16) -> bool {
        self.tls_ports.contains(&port)
    }
}

impl<C: TlsConnector> Transport for NetTransport<C> {
    fn open(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, FetchError> {
        if self.uses_tls(port) {
            self.tls.connect(host, port, timeout)
        } else {
            Ok(Box::new(connect_tcp(host, port, timeout)?))
        }
    }
}

/// Resolves `host` and connects to the first address that answers. Every
/// subsequent read and write on the stream carries `timeout`.
pub fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, FetchError> {
    let timeout = timeout.max(Duration::from_millis(1));
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|err| FetchError::Connectivity(format!("dns lookup for {host} failed: {err}")))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(timeout))
                    .map_err(FetchError::from_socket)?;
                stream
                    .set_write_timeout(Some(timeout))
                    .map_err(FetchError::from_socket)?;
                return Ok(stream);
            }
            Err(err) => {
                debug!("connect to {addr} failed: {err}");
                last_err = Some(err);
            }
        }
    }

    Err(match last_err {
        Some(err) => FetchError::from_socket(err),
        None => FetchError::Connectivity(format!("no addresses for {host}")),
    })
}

#[derive(Debug, Clone)]
pub struct Request<'a> {
    pub host: &'a str,
    pub path: &'a str,
    pub port: u16,
    pub timeout: Duration,
    pub headers: &'a [(&'a str, &'a str)],
}

impl<'a> Request<'a> {
    pub fn get(host: &'a str, path: &'a str) -> Self {
        Self {
            host,
            path,
            port: HTTPS_PORT,
            timeout: Duration::from_secs(12),
            headers: &[],
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn headers(mut self, headers: &'a [(&'a str, &'a str)]) -> Self {
        self.headers = headers;
        self
    }

    pub fn render(&self, user_agent: &str) -> String {
        let mut out = format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\nAccept-Encoding: identity\r\nConnection: close\r\n",
            self.path, self.host, user_agent
        );
        for (name, value) in self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }
}

/// Where the body of a response goes.
pub enum BodySink<'a> {
    /// Buffer in memory, failing once more than `limit` bytes arrive.
    Memory { buffer: &'a mut Vec<u8>, limit: usize },
    /// Stream to `dest` through a temp file. The destination is replaced
    /// only after the whole body arrived (and matched `sha256`, if given).
    File {
        dest: &'a Path,
        sha256: Option<&'a str>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub status: u16,
    pub bytes: u64,
}

pub struct HttpClient<T> {
    transport: T,
    user_agent: String,
    header_limit: usize,
}

impl<T: Transport> HttpClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            header_limit: HEADER_LIMIT,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Issues one GET and streams the body into `sink`.
    ///
    /// The connection lives on this stack frame, so it is closed exactly once
    /// whichever way the function returns.
    pub fn fetch(
        &mut self,
        request: &Request<'_>,
        sink: BodySink<'_>,
    ) -> Result<FetchOutcome, FetchError> {
        let mut conn = self
            .transport
            .open(request.host, request.port, request.timeout)?;

        conn.write_all(request.render(&self.user_agent).as_bytes())
            .map_err(FetchError::from_socket)?;
        conn.flush().map_err(FetchError::from_socket)?;

        let (head, leftover) = read_head(conn.as_mut(), self.header_limit)?;
        debug!(
            "GET {}{} -> {} ({} header(s))",
            request.host,
            request.path,
            head.status,
            head.headers.len()
        );

        let bytes = match sink {
            BodySink::Memory { buffer, limit } => {
                buffer.clear();
                read_body_to_memory(conn.as_mut(), &leftover, buffer, limit)?
            }
            BodySink::File { dest, sha256 } => {
                if head.status != 200 {
                    return Err(FetchError::Status(head.status));
                }
                write_body_to_file(conn.as_mut(), &leftover, dest, sha256, head.content_length())?
            }
        };

        if let Some(expected) = head.content_length() {
            if bytes < expected {
                return Err(FetchError::Protocol(format!(
                    "body truncated at {bytes} of {expected} bytes"
                )));
            }
        }

        Ok(FetchOutcome {
            status: head.status,
            bytes,
        })
    }

    /// Convenience wrapper for the in-memory sink.
    pub fn get_bytes(
        &mut self,
        request: &Request<'_>,
        limit: usize,
    ) -> Result<(u16, Vec<u8>), FetchError> {
        let mut body = Vec::new();
        let outcome = self.fetch(
            request,
            BodySink::Memory {
                buffer: &mut body,
                limit,
            },
        )?;
        Ok((outcome.status, body))
    }

    /// Protocol-shallow reachability check: any reply that starts with the
    /// HTTP signature counts.
    pub fn probe(
        &mut self,
        host: &str,
        port: u16,
        path: &str,
        timeout: Duration,
    ) -> Result<bool, FetchError> {
        let mut conn = self.transport.open(host, port, timeout)?;
        let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
        conn.write_all(request.as_bytes())
            .map_err(FetchError::from_socket)?;

        let mut reply = Vec::with_capacity(PROBE_READ_LIMIT);
        let mut chunk = [0_u8; PROBE_READ_LIMIT];
        while reply.len() < 5 {
            let read = read_some(conn.as_mut(), &mut chunk)?;
            if read == 0 {
                break;
            }
            reply.extend_from_slice(&chunk[..read]);
        }
        Ok(reply.starts_with(b"HTTP/"))
    }
}

fn read_some(conn: &mut dyn Connection, buf: &mut [u8]) -> Result<usize, FetchError> {
    loop {
        match conn.read(buf) {
            Ok(read) => return Ok(read),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(FetchError::from_socket(err)),
        }
    }
}

/// Reads until the blank line ending the header block, within `limit` bytes.
/// Returns the parsed head and whatever body bytes arrived with it.
pub fn read_head(
    conn: &mut dyn Connection,
    limit: usize,
) -> Result<(ResponseHead, Vec<u8>), FetchError> {
    let mut data = Vec::with_capacity(HEADER_CHUNK * 2);
    let mut chunk = [0_u8; HEADER_CHUNK];

    let split = loop {
        if let Some(pos) = find_terminator(&data) {
            break pos;
        }
        if data.len() >= limit {
            return Err(FetchError::Protocol(format!(
                "no header terminator within {limit} bytes"
            )));
        }
        let read = read_some(conn, &mut chunk)?;
        if read == 0 {
            return Err(FetchError::Protocol(
                "connection closed before headers completed".to_string(),
            ));
        }
        data.extend_from_slice(&chunk[..read]);
    };
    if split + 4 > limit {
        return Err(FetchError::Protocol(format!(
            "no header terminator within {limit} bytes"
        )));
    }

    let head = parse_head(&data[..split])?;
    Ok((head, data[split + 4..].to_vec()))
}

fn find_terminator(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}

pub fn parse_head(raw: &[u8]) -> Result<ResponseHead, FetchError> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(FetchError::Protocol(format!(
            "bad status line `{status_line}`"
        )));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| FetchError::Protocol(format!("bad status line `{status_line}`")))?;

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Ok(ResponseHead { status, headers })
}

fn read_body_to_memory(
    conn: &mut dyn Connection,
    leftover: &[u8],
    buffer: &mut Vec<u8>,
    limit: usize,
) -> Result<u64, FetchError> {
    if leftover.len() > limit {
        return Err(FetchError::ResourceExceeded { limit });
    }
    buffer.extend_from_slice(leftover);

    let mut chunk = [0_u8; BODY_CHUNK];
    loop {
        let read = read_some(conn, &mut chunk)?;
        if read == 0 {
            break;
        }
        if buffer.len() + read > limit {
            return Err(FetchError::ResourceExceeded { limit });
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
    Ok(buffer.len() as u64)
}

pub fn temp_path_for(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    dest.with_file_name(name)
}

fn write_body_to_file(
    conn: &mut dyn Connection,
    leftover: &[u8],
    dest: &Path,
    sha256: Option<&str>,
    content_length: Option<u64>,
) -> Result<u64, FetchError> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(FetchError::from_storage)?;
    }

    let tmp = temp_path_for(dest);
    let result = stream_to_temp(conn, leftover, &tmp, sha256, content_length)
        .and_then(|written| replace_file(&tmp, dest).map(|()| written));

    if result.is_err() {
        if let Err(err) = fs::remove_file(&tmp) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove {}: {err}", tmp.display());
            }
        }
    }
    result
}

fn stream_to_temp(
    conn: &mut dyn Connection,
    leftover: &[u8],
    tmp: &Path,
    sha256: Option<&str>,
    content_length: Option<u64>,
) -> Result<u64, FetchError> {
    let mut file = File::create(tmp).map_err(FetchError::from_storage)?;
    let mut hasher = Sha256::new();
    let mut written = 0_u64;

    file.write_all(leftover).map_err(FetchError::from_storage)?;
    hasher.update(leftover);
    written += leftover.len() as u64;

    let mut chunk = [0_u8; BODY_CHUNK];
    loop {
        let read = read_some(conn, &mut chunk)?;
        if read == 0 {
            break;
        }
        file.write_all(&chunk[..read])
            .map_err(FetchError::from_storage)?;
        hasher.update(&chunk[..read]);
        written += read as u64;
    }

    if let Some(expected) = content_length {
        if written < expected {
            return Err(FetchError::Protocol(format!(
                "body truncated at {written} of {expected} bytes"
            )));
        }
    }

    if let Some(expected) = sha256 {
        let actual = hex_digest(&hasher.finalize());
        let expected = expected.trim().to_ascii_lowercase();
        if actual != expected {
            return Err(FetchError::Integrity { expected, actual });
        }
    }

    file.sync_all().map_err(FetchError::from_storage)?;
    Ok(written)
}

/// Swaps `tmp` into place. Falls back to copy + delete where rename over an
/// existing file is not supported.
fn replace_file(tmp: &Path, dest: &Path) -> Result<(), FetchError> {
    match fs::rename(tmp, dest) {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!("rename {} failed ({err}); copying instead", tmp.display());
            fs::copy(tmp, dest).map_err(FetchError::from_storage)?;
            fs::remove_file(tmp).map_err(FetchError::from_storage)
        }
    }
}

pub fn hex_digest(digest: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. `op` receives the 1-based attempt number.
pub fn retry<T, C, F>(policy: RetryPolicy, clock: &mut C, mut op: F) -> Result<T, FetchError>
where
    C: Clock + ?Sized,
    F: FnMut(u32) -> Result<T, FetchError>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                warn!("attempt {attempt}/{attempts} timed out; retrying");
                clock.sleep(policy.backoff);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
