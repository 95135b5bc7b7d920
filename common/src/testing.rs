//! Scripted stand-ins for the hardware seams, shared by the unit tests.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    io::{self, Cursor, Read, Write},
    net::Ipv4Addr,
    rc::Rc,
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};

use crate::{
    clock::Clock,
    config::{BoardConfig, ConfigStore},
    error::{ConfigError, FetchError},
    http::{Connection, Transport},
    portal::Listener,
    wifi::{LinkStatus, ScanEntry, WifiDriver, WifiError},
};

/// Canned server reply.
#[derive(Debug, Clone)]
pub struct Reply {
    bytes: Vec<u8>,
    time_out_at_end: bool,
}

impl Reply {
    pub fn ok(body: &[u8]) -> Self {
        Self::status(200, body)
    }

    pub fn status(code: u16, body: &[u8]) -> Self {
        let mut bytes = format!("HTTP/1.0 {code} X\r\nServer: mock\r\n\r\n").into_bytes();
        bytes.extend_from_slice(body);
        Self::raw(bytes)
    }

    pub fn raw(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            time_out_at_end: false,
        }
    }

    /// Sends `bytes`, then every further read times out.
    pub fn timeout_after(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            time_out_at_end: true,
        }
    }
}

#[derive(Debug, Default)]
struct TransportLog {
    opened: usize,
    dropped: usize,
    requests: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TransportStats(Rc<RefCell<TransportLog>>);

impl TransportStats {
    pub fn opened(&self) -> usize {
        self.0.borrow().opened
    }

    pub fn dropped(&self) -> usize {
        self.0.borrow().dropped
    }

    /// Raw request text of every closed connection, in close order.
    pub fn requests(&self) -> Vec<String> {
        self.0.borrow().requests.clone()
    }

    /// Request paths (`GET <path> ...`), in close order.
    pub fn paths(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|request| request.split_whitespace().nth(1).map(str::to_string))
            .collect()
    }
}

type Routes = Rc<RefCell<HashMap<String, VecDeque<Reply>>>>;

/// Serves replies keyed by request path, whatever the host or port.
/// Unrouted paths get a 404. When several replies are queued for one path
/// they are served in order and the last one repeats.
#[derive(Default)]
pub struct MockTransport {
    routes: Routes,
    stats: TransportStats,
    refuse: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, path: &str, reply: Reply) -> Self {
        self.routes
            .borrow_mut()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Every open fails as if the network were down.
    pub fn refuse_all(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

impl Transport for MockTransport {
    fn open(
        &mut self,
        host: &str,
        port: u16,
        _timeout: Duration,
    ) -> Result<Box<dyn Connection>, FetchError> {
        if self.refuse {
            return Err(FetchError::Connectivity(format!("{host}:{port} unreachable")));
        }
        self.stats.0.borrow_mut().opened += 1;
        Ok(Box::new(MockConnection {
            routes: Rc::clone(&self.routes),
            stats: self.stats.clone(),
            written: Vec::new(),
            reply: None,
        }))
    }
}

struct MockConnection {
    routes: Routes,
    stats: TransportStats,
    written: Vec<u8>,
    reply: Option<(Cursor<Vec<u8>>, bool)>,
}

impl MockConnection {
    fn select_reply(&self) -> Reply {
        let text = String::from_utf8_lossy(&self.written);
        let path = text.split_whitespace().nth(1).unwrap_or_default().to_string();
        let mut routes = self.routes.borrow_mut();
        match routes.get_mut(&path) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Reply::status(404, b"not found"),
        }
    }
}

impl Read for MockConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.reply.is_none() {
            let reply = self.select_reply();
            self.reply = Some((Cursor::new(reply.bytes), reply.time_out_at_end));
        }
        let (cursor, time_out_at_end) = self.reply.as_mut().unwrap();
        let read = cursor.read(buf)?;
        if read == 0 && *time_out_at_end {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock read timeout"));
        }
        Ok(read)
    }
}

impl Write for MockConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        let mut log = self.stats.0.borrow_mut();
        log.dropped += 1;
        log.requests
            .push(String::from_utf8_lossy(&self.written).into_owned());
    }
}

/// Virtual time: sleeping advances `now` instantly.
pub struct FakeClock {
    start: Instant,
    elapsed: Duration,
    slept: Duration,
    ntp_calls: u32,
    fail_ntp: bool,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Duration::ZERO,
            slept: Duration::ZERO,
            ntp_calls: 0,
            fail_ntp: false,
        }
    }

    pub fn slept(&self) -> Duration {
        self.slept
    }

    pub fn advance(&mut self, by: Duration) {
        self.elapsed += by;
    }

    pub fn ntp_calls(&self) -> u32 {
        self.ntp_calls
    }

    pub fn fail_ntp(&mut self, fail: bool) {
        self.fail_ntp = fail;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed
    }

    fn sleep(&mut self, duration: Duration) {
        self.elapsed += duration;
        self.slept += duration;
    }

    fn sync_from_ntp(
        &mut self,
        _host: &str,
        _timeout: Duration,
    ) -> Result<DateTime<Utc>, FetchError> {
        self.ntp_calls += 1;
        if self.fail_ntp {
            return Err(FetchError::Timeout);
        }
        Utc.timestamp_opt(1_760_000_000, 0)
            .single()
            .ok_or(FetchError::Timeout)
    }
}

/// Scripted radio. State-changing calls are recorded by name in `calls`.
#[derive(Debug, Default)]
pub struct MockWifi {
    pub calls: Vec<String>,
    pub status_polls: usize,
    pub scans: usize,
    scan_result: Option<Vec<ScanEntry>>,
    statuses: Vec<LinkStatus>,
    connect_after: Option<usize>,
    ip: Option<Ipv4Addr>,
    active: bool,
    connected: bool,
    connect_requested: bool,
    checks: usize,
    ap_up: bool,
}

impl MockWifi {
    pub fn new() -> Self {
        Self {
            scan_result: Some(Vec::new()),
            ..Self::default()
        }
    }

    /// Scan lists these SSIDs, strongest first.
    pub fn scan_ok(mut self, ssids: &[&str]) -> Self {
        self.scan_result = Some(
            ssids
                .iter()
                .enumerate()
                .map(|(index, ssid)| ScanEntry {
                    ssid: ssid.to_string(),
                    rssi: -40 - 5 * index as i8,
                })
                .collect(),
        );
        self
    }

    pub fn scan_err(mut self) -> Self {
        self.scan_result = None;
        self
    }

    /// Successive `status()` results; the last one repeats.
    pub fn statuses(mut self, statuses: &[LinkStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    /// Link comes up on the `n`-th `is_connected` check after `connect`.
    pub fn connect_after(mut self, checks: usize) -> Self {
        self.connect_after = Some(checks);
        self
    }

    pub fn ip(mut self, octets: [u8; 4]) -> Self {
        self.ip = Some(Ipv4Addr::from(octets));
        self
    }

    /// (active, connected, access point up)
    pub fn snapshot(&self) -> (bool, bool, bool) {
        (self.active, self.connected, self.ap_up)
    }

    fn record(&mut self, call: &str) {
        self.calls.push(call.to_string());
    }
}

impl WifiDriver for MockWifi {
    fn set_active(&mut self, active: bool) -> Result<(), WifiError> {
        self.record(if active { "activate" } else { "deactivate" });
        self.active = active;
        if !active {
            self.connected = false;
        }
        Ok(())
    }

    fn disable_power_save(&mut self) -> Result<(), WifiError> {
        self.record("disable_power_save");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), WifiError> {
        self.record("disconnect");
        self.connected = false;
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<ScanEntry>, WifiError> {
        self.record("scan");
        self.scans += 1;
        self.scan_result
            .clone()
            .ok_or_else(|| WifiError::Scan("scan timed out".to_string()))
    }

    fn connect(&mut self, _ssid: &str, _password: &str) -> Result<(), WifiError> {
        self.record("connect");
        self.connect_requested = true;
        self.checks = 0;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        if self.connect_requested && !self.connected {
            let ready = matches!(self.connect_after, Some(n) if self.checks >= n);
            self.checks += 1;
            self.connected = ready;
        }
        self.connected
    }

    fn status(&mut self) -> Result<LinkStatus, WifiError> {
        self.status_polls += 1;
        if self.connected {
            return Ok(LinkStatus::GotIp);
        }
        let index = (self.status_polls - 1).min(self.statuses.len().saturating_sub(1));
        Ok(self
            .statuses
            .get(index)
            .copied()
            .unwrap_or(LinkStatus::Connecting))
    }

    fn ip_address(&mut self) -> Option<Ipv4Addr> {
        self.connected.then_some(self.ip).flatten()
    }

    fn reinitialize(&mut self) -> Result<(), WifiError> {
        self.record("reinitialize");
        self.active = false;
        self.connected = false;
        self.connect_requested = false;
        self.checks = 0;
        Ok(())
    }

    fn start_access_point(&mut self, _ssid: &str, _password: &str) -> Result<Ipv4Addr, WifiError> {
        self.record("start_access_point");
        self.ap_up = true;
        Ok(Ipv4Addr::new(192, 168, 4, 1))
    }

    fn stop_access_point(&mut self) -> Result<(), WifiError> {
        self.record("stop_access_point");
        self.ap_up = false;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    config: RefCell<BoardConfig>,
    pub saves: RefCell<usize>,
}

impl MemoryStore {
    pub fn new(config: BoardConfig) -> Self {
        Self {
            config: RefCell::new(config),
            saves: RefCell::new(0),
        }
    }

    pub fn snapshot(&self) -> BoardConfig {
        self.config.borrow().clone()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<BoardConfig, ConfigError> {
        Ok(self.config.borrow().clone())
    }

    fn save(&self, config: &BoardConfig) -> Result<(), ConfigError> {
        *self.config.borrow_mut() = config.clone();
        *self.saves.borrow_mut() += 1;
        Ok(())
    }
}

/// Hands out one scripted browser request per `accept`; once the script is
/// exhausted `accept` fails. Responses are collected as they are closed.
#[derive(Default)]
pub struct MockListener {
    clients: VecDeque<Vec<u8>>,
    responses: Rc<RefCell<Vec<String>>>,
}

impl MockListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(mut self, request: impl Into<Vec<u8>>) -> Self {
        self.clients.push_back(request.into());
        self
    }

    pub fn get(self, path: &str) -> Self {
        self.client(format!("GET {path} HTTP/1.1\r\nHost: 192.168.4.1\r\n\r\n"))
    }

    pub fn post(self, path: &str, form: &str) -> Self {
        self.client(format!(
            "POST {path} HTTP/1.1\r\nHost: 192.168.4.1\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: {}\r\n\r\n{form}",
            form.len()
        ))
    }

    pub fn responses(&self) -> Rc<RefCell<Vec<String>>> {
        Rc::clone(&self.responses)
    }
}

impl Listener for MockListener {
    fn accept(&mut self) -> io::Result<Box<dyn Connection>> {
        let request = self
            .clients
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "no more clients"))?;
        Ok(Box::new(MockClient {
            request: Cursor::new(request),
            response: Vec::new(),
            responses: Rc::clone(&self.responses),
        }))
    }
}

struct MockClient {
    request: Cursor<Vec<u8>>,
    response: Vec<u8>,
    responses: Rc<RefCell<Vec<String>>>,
}

impl Read for MockClient {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.request.read(buf)
    }
}

impl Write for MockClient {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.response.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MockClient {
    fn drop(&mut self) {
        self.responses
            .borrow_mut()
            .push(String::from_utf8_lossy(&self.response).into_owned());
    }
}
