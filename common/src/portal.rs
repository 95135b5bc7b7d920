//! Captive setup portal served over the board's own access point.
//!
//! One client at a time: a connection is read, answered and closed before
//! the next `accept`.

use std::{
    collections::HashMap,
    io::{self, Write},
    net::{Ipv4Addr, TcpListener},
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::{BoardConfig, ConfigStore},
    error::{ConfigError, FetchError},
    http::{Connection, Transport},
    wifi::{ConnectionManager, ScanEntry, WifiDriver, WifiError},
};

pub const PORTAL_PORT: u16 = 80;
pub const REQUEST_LIMIT: usize = 4096;

const REQUEST_CHUNK: usize = 512;
const CLIENT_TIMEOUT: Duration = Duration::from_secs(3);
const SCAN_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PortalError {
    #[error(transparent)]
    Wifi(#[from] WifiError),

    #[error("failed to bind setup server: {0}")]
    Bind(#[source] io::Error),

    #[error("setup server stopped accepting: {0}")]
    Accept(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Accepts browser connections for the portal.
pub trait Listener {
    fn accept(&mut self) -> io::Result<Box<dyn Connection>>;
}

impl Listener for TcpListener {
    fn accept(&mut self) -> io::Result<Box<dyn Connection>> {
        let (stream, peer) = TcpListener::accept(self)?;
        debug!("setup client {peer}");
        stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
        stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;
        Ok(Box::new(stream))
    }
}

/// How a portal session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalExit {
    /// Settings saved; resume normal station operation.
    Saved,
    /// `UPDATE_MODE` was set; the caller should reboot into the updater.
    Reboot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl PortalRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// `application/x-www-form-urlencoded` body fields. Later duplicates win.
    pub fn form(&self) -> HashMap<String, String> {
        form_urlencoded::parse(&self.body).into_owned().collect()
    }

    /// Path without any query string.
    pub fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or_default()
    }
}

/// Reads one request: headers, then as much body as `Content-Length`
/// declares, never more than `limit` bytes in total. `Ok(None)` when the
/// client hung up without sending anything.
pub fn read_request(
    conn: &mut dyn Connection,
    limit: usize,
) -> Result<Option<PortalRequest>, FetchError> {
    let mut data = Vec::with_capacity(REQUEST_CHUNK);
    let mut chunk = [0_u8; REQUEST_CHUNK];

    let split = loop {
        if let Some(pos) = data.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos;
        }
        if data.len() >= limit {
            return Err(FetchError::ResourceExceeded { limit });
        }
        match conn.read(&mut chunk) {
            Ok(0) if data.is_empty() => return Ok(None),
            Ok(0) => return Err(FetchError::Protocol("request ended inside headers".to_string())),
            Ok(read) => data.extend_from_slice(&chunk[..read]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(FetchError::from_socket(err)),
        }
    };
    if split + 4 > limit {
        return Err(FetchError::ResourceExceeded { limit });
    }

    let head = String::from_utf8_lossy(&data[..split]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_ascii_uppercase();
    let path = request_line.next().unwrap_or("/").to_string();
    if method.is_empty() {
        return Err(FetchError::Protocol("empty request line".to_string()));
    }
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    let mut body = data[split + 4..].to_vec();
    let declared = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let wanted = declared.min(limit.saturating_sub(split + 4));

    while body.len() < wanted {
        match conn.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => body.extend_from_slice(&chunk[..read]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(FetchError::from_socket(err)),
        }
    }
    body.truncate(wanted);

    Ok(Some(PortalRequest {
        method,
        path,
        headers,
        body,
    }))
}

/// Integer percentage from a form field: decimals truncate, out-of-range
/// values clamp to [0, 100], blank or non-numeric input yields `None`.
pub fn parse_percent(raw: &str) -> Option<u8> {
    let value: f64 = raw.trim().parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(value.trunc().clamp(0.0, 100.0) as u8)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub location: Option<&'static str>,
    pub body: String,
}

impl Response {
    fn html(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/html; charset=utf-8",
            location: None,
            body,
        }
    }

    fn redirect(location: &'static str) -> Self {
        Self {
            status: 303,
            content_type: "text/plain",
            location: Some(location),
            body: String::new(),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            location: None,
            body: message.to_string(),
        }
    }

    pub fn render(&self) -> Vec<u8> {
        let reason = match self.status {
            200 => "OK",
            303 => "See Other",
            400 => "Bad Request",
            404 => "Not Found",
            _ => "Internal Server Error",
        };
        let mut out = format!("HTTP/1.1 {} {reason}\r\n", self.status);
        out.push_str(&format!("Content-Type: {}\r\n", self.content_type));
        if let Some(location) = self.location {
            out.push_str(&format!("Location: {location}\r\n"));
        }
        out.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n",
            self.body.len()
        ));
        out.push_str(&self.body);
        out.into_bytes()
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

const PAGE_HEAD: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Ground Board Setup</title>
  <style>
    body{font-family:sans-serif;max-width:420px;margin:20px auto;padding:0 1rem}
    label{display:block;margin-top:12px}
    input[type=text],input[type=password],input[type=number]{width:100%;padding:8px;box-sizing:border-box}
    input[type=submit]{margin-top:16px;padding:10px 16px}.muted{color:#555}
  </style>
</head>
<body>
  <h2>Binary Aviation Ground Board</h2>
"#;

const PAGE_TAIL: &str = "</body>\n</html>\n";

fn page(content: &str) -> String {
    format!("{PAGE_HEAD}{content}{PAGE_TAIL}")
}

fn optional_value(value: Option<u8>) -> String {
    value.map(|value| value.to_string()).unwrap_or_default()
}

pub fn render_main_form(config: &BoardConfig) -> String {
    page(&format!(
        r#"  <form method="POST" action="/">
    <label>LED Brightness (%):
      <input type="number" name="led_brightness" min="0" max="100" step="1" value="{led}">
    </label>
    <label>Crosswind Threshold (kts 0-100):
      <input type="number" name="crosswind_threshold" min="0" max="100" step="1" value="{cross}">
    </label>
    <input type="submit" name="action" value="Save">
    <input type="submit" name="action" value="WiFi Settings">
    <input type="submit" name="action" value="Update">
  </form>
"#,
        led = optional_value(config.led_brightness),
        cross = optional_value(config.crosswind_threshold_kts),
    ))
}

pub fn render_wifi_form(config: &BoardConfig, networks: &[ScanEntry], note: Option<&str>) -> String {
    let mut content = String::new();
    if let Some(note) = note {
        content.push_str(&format!("  <p class=\"muted\">{}</p>\n", escape_html(note)));
    }
    if !networks.is_empty() {
        content.push_str("  <ul>\n");
        for network in networks {
            content.push_str(&format!(
                "    <li>{} <span class=\"muted\">({} dBm)</span></li>\n",
                escape_html(&network.ssid),
                network.rssi
            ));
        }
        content.push_str("  </ul>\n");
    }
    content.push_str(&format!(
        r#"  <form method="POST" action="/wifi">
    <label>WiFi SSID:
      <input type="text" name="ssid" list="networks" value="{ssid}">
    </label>
    <datalist id="networks">
{options}    </datalist>
    <label>WiFi Password (blank for an open network):
      <input type="password" name="password">
    </label>
    <input type="submit" name="action" value="Scan">
    <input type="submit" name="action" value="Save WiFi">
  </form>
"#,
        ssid = escape_html(&config.wifi_ssid),
        options = networks
            .iter()
            .map(|network| format!("      <option value=\"{}\">\n", escape_html(&network.ssid)))
            .collect::<String>(),
    ));
    page(&content)
}

const SAVED_PAGE: &str = "  <h3>Saved</h3>\n  <p>Settings were saved.</p>\n  <p>You can now disconnect from this Wi-Fi network.</p>\n";
const UPDATE_PAGE: &str = "  <h3>Update Mode Enabled</h3>\n  <p>The board will reboot and install the latest files.</p>\n";

fn apply_board_settings(config: &mut BoardConfig, form: &HashMap<String, String>) {
    if let Some(led) = form.get("led_brightness").and_then(|raw| parse_percent(raw)) {
        config.led_brightness = Some(led);
    }
    if let Some(cross) = form
        .get("crosswind_threshold")
        .and_then(|raw| parse_percent(raw))
    {
        config.crosswind_threshold_kts = Some(cross);
    }
}

/// What the serve loop should do after answering a request.
enum Routed {
    Continue(Response),
    Finish(Response, PortalExit),
}

/// Request router bound to the config store.
pub struct Portal<'a, S> {
    store: &'a S,
    scan_ttl: Duration,
}

impl<'a, S: ConfigStore> Portal<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            scan_ttl: SCAN_TTL,
        }
    }

    fn route<D, T, C>(
        &self,
        manager: &mut ConnectionManager<D, T, C>,
        request: &PortalRequest,
    ) -> Result<Routed, ConfigError>
    where
        D: WifiDriver,
        T: Transport,
        C: Clock,
    {
        let config = self.store.load()?;

        match (request.method.as_str(), request.route()) {
            ("GET", "/wifi") => Ok(Routed::Continue(Response::html(render_wifi_form(
                &config,
                &[],
                None,
            )))),
            // Captive-portal probes land here too.
            ("GET", _) => Ok(Routed::Continue(Response::html(render_main_form(&config)))),
            ("POST", "/wifi") => {
                let form = request.form();
                match form.get("action").map(String::as_str).unwrap_or("Save WiFi") {
                    "Scan" => {
                        let page = match manager.scan_networks(self.scan_ttl) {
                            Ok(networks) => {
                                let note = format!("Found {} network(s).", networks.len());
                                render_wifi_form(&config, &networks, Some(&note))
                            }
                            Err(err) => {
                                warn!("portal scan failed: {err}");
                                render_wifi_form(&config, &[], Some("Scan failed, try again."))
                            }
                        };
                        Ok(Routed::Continue(Response::html(page)))
                    }
                    "Save WiFi" => {
                        let ssid = form.get("ssid").cloned().unwrap_or_default();
                        let password = form.get("password").cloned().unwrap_or_default();
                        info!(
                            "portal: saving wifi ssid=`{ssid}` (password {} chars)",
                            password.len()
                        );
                        self.store.update(|cfg| {
                            cfg.wifi_ssid = ssid;
                            cfg.wifi_password = password;
                        })?;
                        Ok(Routed::Finish(
                            Response::html(page(SAVED_PAGE)),
                            PortalExit::Saved,
                        ))
                    }
                    other => Ok(Routed::Continue(Response::error(
                        400,
                        &format!("unknown action `{other}`"),
                    ))),
                }
            }
            ("POST", "/") => {
                let form = request.form();
                match form.get("action").map(String::as_str).unwrap_or("Save") {
                    "Save" => {
                        let saved = self.store.update(|cfg| apply_board_settings(cfg, &form))?;
                        info!(
                            "portal: saved board settings led={:?} crosswind={:?}",
                            saved.led_brightness, saved.crosswind_threshold_kts
                        );
                        Ok(Routed::Finish(
                            Response::html(page(SAVED_PAGE)),
                            PortalExit::Saved,
                        ))
                    }
                    "WiFi Settings" => Ok(Routed::Continue(Response::redirect("/wifi"))),
                    "Update" => {
                        self.store.update(|cfg| {
                            apply_board_settings(cfg, &form);
                            cfg.update_mode = true;
                        })?;
                        info!("portal: update requested; UPDATE_MODE set");
                        Ok(Routed::Finish(
                            Response::html(page(UPDATE_PAGE)),
                            PortalExit::Reboot,
                        ))
                    }
                    other => Ok(Routed::Continue(Response::error(
                        400,
                        &format!("unknown action `{other}`"),
                    ))),
                }
            }
            _ => Ok(Routed::Continue(Response::error(404, "not found"))),
        }
    }

    /// Serves clients until a save or update request ends the session.
    pub fn serve<D, T, C, L>(
        &self,
        manager: &mut ConnectionManager<D, T, C>,
        listener: &mut L,
    ) -> Result<PortalExit, PortalError>
    where
        D: WifiDriver,
        T: Transport,
        C: Clock,
        L: Listener + ?Sized,
    {
        loop {
            let mut conn = listener.accept().map_err(PortalError::Accept)?;

            let request = match read_request(conn.as_mut(), REQUEST_LIMIT) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(err) => {
                    warn!("dropping setup client: {err}");
                    continue;
                }
            };
            debug!("portal {} {}", request.method, request.path);

            let (response, exit) = match self.route(manager, &request) {
                Ok(Routed::Continue(response)) => (response, None),
                Ok(Routed::Finish(response, exit)) => (response, Some(exit)),
                Err(err) => {
                    warn!("portal config access failed: {err}");
                    (Response::error(500, "could not save settings"), None)
                }
            };

            if let Err(err) = conn
                .write_all(&response.render())
                .and_then(|()| conn.flush())
            {
                warn!("failed to answer setup client: {err}");
            }
            drop(conn);

            if let Some(exit) = exit {
                return Ok(exit);
            }
        }
    }
}

/// Brings up the access point, serves the setup portal and always tears the
/// access point down again, rebuilding the station interface.
///
/// `bind` opens the listener once the access point address is known.
pub fn run_captive_portal<D, T, C, S, L, B>(
    manager: &mut ConnectionManager<D, T, C>,
    store: &S,
    bind: B,
) -> Result<PortalExit, PortalError>
where
    D: WifiDriver,
    T: Transport,
    C: Clock,
    S: ConfigStore,
    L: Listener,
    B: FnOnce(Ipv4Addr) -> io::Result<L>,
{
    let mut config = store.load()?;
    config.sanitize();
    let ap = config.access_point_settings();

    let ip = manager.start_access_point(&ap)?;
    info!("setup portal: join `{}` and open http://{ip}", ap.ssid);

    let served = bind(ip)
        .map_err(PortalError::Bind)
        .and_then(|mut listener| Portal::new(store).serve(manager, &mut listener));

    match &served {
        Ok(exit) => info!("setup portal finished: {exit:?}"),
        Err(err) => warn!("setup portal aborted: {err}"),
    }

    info!("waiting {:?} before shutting down the access point", ap.linger);
    manager.clock().sleep(ap.linger);
    let stopped = manager.stop_access_point();

    let exit = served?;
    stopped?;
    Ok(exit)
}
