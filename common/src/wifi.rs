use std::{
    collections::HashSet,
    net::Ipv4Addr,
    time::{Duration, Instant},
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::{AccessPointSettings, WifiSettings},
    error::FetchError,
    http::{HttpClient, Transport, HTTP_PORT},
};

const TOGGLE_SETTLE: Duration = Duration::from_millis(250);
const PRE_SCAN_SETTLE: Duration = Duration::from_secs(1);
const AP_SETTLE: Duration = Duration::from_millis(150);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const NTP_TIMEOUT: Duration = Duration::from_secs(5);
const NTP_BACKOFF: Duration = Duration::from_millis(300);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum WifiError {
    #[error("wifi interface error: {0}")]
    Interface(String),
    #[error("wifi scan failed: {0}")]
    Scan(String),
    #[error("access point error: {0}")]
    AccessPoint(String),
}

/// Station link status as reported by the radio driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    Idle,
    Connecting,
    WrongPassword,
    NoApFound,
    ConnectFail,
    GotIp,
    Other(i32),
}

impl LinkStatus {
    /// Maps the CYW43/ESP-style numeric codes (-3..=3).
    pub fn from_code(code: i32) -> Self {
        match code {
            -3 => Self::WrongPassword,
            -2 => Self::NoApFound,
            -1 => Self::ConnectFail,
            0 => Self::Idle,
            1 | 2 => Self::Connecting,
            3 => Self::GotIp,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::WrongPassword => -3,
            Self::NoApFound => -2,
            Self::ConnectFail => -1,
            Self::Idle => 0,
            Self::Connecting => 1,
            Self::GotIp => 3,
            Self::Other(code) => code,
        }
    }

    /// The driver gave up; further polling will not change the result.
    pub fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            Self::WrongPassword | Self::NoApFound | Self::ConnectFail
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoSsidConfigured,
    NoSsidFound,
    PasswordIncorrect,
    ConnectFailed,
    NoInternet,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoSsidConfigured => "no_ssid_configured",
            Self::NoSsidFound => "no_ssid_found",
            Self::PasswordIncorrect => "password_incorrect",
            Self::ConnectFailed => "connect_failed",
            Self::NoInternet => "no_internet",
        }
    }

    /// Short status line for the display.
    pub fn display_message(self) -> &'static str {
        match self {
            Self::NoSsidConfigured => "No WiFi Set",
            Self::NoSsidFound => "AP Not Found",
            Self::PasswordIncorrect => "Bad Password",
            Self::ConnectFailed => "Connection ERR",
            Self::NoInternet => "No Internet",
        }
    }
}

/// Result of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionOutcome {
    pub connected: bool,
    #[serde(rename = "internetReachable")]
    pub internet_reachable: bool,
    #[serde(rename = "failureReason")]
    pub failure_reason: Option<FailureReason>,
    #[serde(rename = "statusCode")]
    pub status_code: Option<i32>,
    #[serde(rename = "ssidObservedInScan")]
    pub ssid_observed_in_scan: bool,
    #[serde(rename = "ipAddress")]
    pub ip_address: Option<Ipv4Addr>,
}

impl ConnectionOutcome {
    fn not_configured() -> Self {
        Self {
            connected: false,
            internet_reachable: false,
            failure_reason: Some(FailureReason::NoSsidConfigured),
            status_code: None,
            ssid_observed_in_scan: false,
            ip_address: None,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.connected && self.internet_reachable
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub ssid: String,
    pub rssi: i8,
}

/// What the scan told us about the configured SSID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanObservation {
    Seen,
    Absent,
    /// The scan itself failed, so absence means nothing.
    Unknown,
}

/// Picks the failure reason for an attempt that never connected.
///
/// Wrong-password and no-AP statuses come straight from the driver and win.
/// A generic connect failure is less specific than a scan that succeeded
/// without listing the SSID.
pub fn classify_failure(last_status: Option<LinkStatus>, scan: ScanObservation) -> FailureReason {
    match last_status {
        Some(LinkStatus::WrongPassword) => FailureReason::PasswordIncorrect,
        Some(LinkStatus::NoApFound) => FailureReason::NoSsidFound,
        _ if scan == ScanObservation::Absent => FailureReason::NoSsidFound,
        _ => FailureReason::ConnectFailed,
    }
}

/// The radio. One instance, owned by [`ConnectionManager`].
pub trait WifiDriver {
    fn set_active(&mut self, active: bool) -> Result<(), WifiError>;

    fn disable_power_save(&mut self) -> Result<(), WifiError>;

    fn disconnect(&mut self) -> Result<(), WifiError>;

    fn scan(&mut self) -> Result<Vec<ScanEntry>, WifiError>;

    /// Starts association; completion is observed through `is_connected`.
    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), WifiError>;

    fn is_connected(&mut self) -> bool;

    fn status(&mut self) -> Result<LinkStatus, WifiError>;

    fn ip_address(&mut self) -> Option<Ipv4Addr>;

    /// Throws away the station interface object and builds a fresh one.
    fn reinitialize(&mut self) -> Result<(), WifiError>;

    fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<Ipv4Addr, WifiError>;

    fn stop_access_point(&mut self) -> Result<(), WifiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Disabling,
    Scanning,
    Connecting,
    Connected,
    Failed,
    AccessPoint,
}

/// Endpoint used by the reachability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Default for ProbeTarget {
    fn default() -> Self {
        Self {
            host: "clients3.google.com".to_string(),
            port: HTTP_PORT,
            path: "/generate_204".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct ScanCache {
    taken_at: Instant,
    entries: Vec<ScanEntry>,
}

/// Owns the network interface, the single outbound HTTP client and the
/// clock. Constructed once at startup and reset on demand.
pub struct ConnectionManager<D, T, C> {
    driver: D,
    http: HttpClient<T>,
    clock: C,
    settings: WifiSettings,
    probe: ProbeTarget,
    state: LinkState,
    time_synced: bool,
    scan_cache: Option<ScanCache>,
}

impl<D, T, C> ConnectionManager<D, T, C>
where
    D: WifiDriver,
    T: Transport,
    C: Clock,
{
    pub fn new(driver: D, http: HttpClient<T>, clock: C, settings: WifiSettings) -> Self {
        Self {
            driver,
            http,
            clock,
            settings,
            probe: ProbeTarget::default(),
            state: LinkState::Idle,
            time_synced: false,
            scan_cache: None,
        }
    }

    pub fn with_probe(mut self, probe: ProbeTarget) -> Self {
        self.probe = probe;
        self
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn time_synced(&self) -> bool {
        self.time_synced
    }

    pub fn settings(&self) -> &WifiSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: WifiSettings) {
        self.settings = settings;
    }

    pub fn http(&mut self) -> &mut HttpClient<T> {
        &mut self.http
    }

    pub fn clock(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn driver(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Borrows the HTTP client and the clock together.
    pub fn http_and_clock(&mut self) -> (&mut HttpClient<T>, &mut C) {
        (&mut self.http, &mut self.clock)
    }

    pub fn is_connected(&mut self) -> bool {
        self.state == LinkState::Connected && self.driver.is_connected()
    }

    /// Disconnects, disables and rebuilds the station interface and forgets
    /// per-session state. Afterwards `connect` behaves like a cold boot.
    pub fn reset(&mut self) -> Result<(), WifiError> {
        info!("wifi reset: disconnect + disable interface");
        self.state = LinkState::Disabling;
        self.time_synced = false;
        self.scan_cache = None;

        if let Err(err) = self.driver.disconnect() {
            debug!("disconnect during reset: {err}");
        }
        if let Err(err) = self.driver.set_active(false) {
            warn!("failed to disable station interface: {err}");
        }
        self.clock.sleep(TOGGLE_SETTLE);

        let rebuilt = self.driver.reinitialize();
        if let Err(err) = self.driver.set_active(false) {
            warn!("failed to leave rebuilt interface disabled: {err}");
        }
        self.state = LinkState::Idle;
        rebuilt?;

        info!("wifi reset: complete");
        Ok(())
    }

    /// One full connection attempt using the configured credentials.
    ///
    /// `Err` only when the interface could not be brought up at all; every
    /// other failure is described by the returned outcome.
    pub fn connect(&mut self) -> Result<ConnectionOutcome, WifiError> {
        if self.settings.ssid.is_empty() {
            warn!("wifi ssid not configured; skipping connection attempt");
            self.state = LinkState::Failed;
            return Ok(ConnectionOutcome::not_configured());
        }

        let ssid = self.settings.ssid.clone();
        let password = self.settings.password.clone();
        info!(
            "wifi connecting to `{ssid}` (password {} chars, max wait {:?})",
            password.len(),
            self.settings.max_wait
        );

        self.state = LinkState::Disabling;
        if let Err(err) = self.driver.set_active(false) {
            debug!("interface disable before connect: {err}");
        }
        self.clock.sleep(TOGGLE_SETTLE);
        if let Err(err) = self.driver.set_active(true) {
            self.state = LinkState::Failed;
            return Err(err);
        }
        self.clock.sleep(TOGGLE_SETTLE);

        if let Err(err) = self.driver.disable_power_save() {
            warn!("failed to disable wifi power save: {err}");
        }
        if let Err(err) = self.driver.disconnect() {
            debug!("disconnect before connect: {err}");
        }
        self.clock.sleep(PRE_SCAN_SETTLE);

        self.state = LinkState::Scanning;
        let scan = match self.driver.scan() {
            Ok(entries) => {
                let names: Vec<&str> = entries.iter().map(|entry| entry.ssid.as_str()).collect();
                info!("nearby networks: {names:?}");
                let seen = entries.iter().any(|entry| entry.ssid == ssid);
                self.scan_cache = Some(ScanCache {
                    taken_at: self.clock.now(),
                    entries,
                });
                if seen {
                    ScanObservation::Seen
                } else {
                    warn!("configured ssid `{ssid}` not seen in scan");
                    ScanObservation::Absent
                }
            }
            Err(err) => {
                warn!("network scan failed: {err}");
                ScanObservation::Unknown
            }
        };

        self.state = LinkState::Connecting;
        if let Err(err) = self.driver.connect(&ssid, &password) {
            warn!("connect request failed: {err}");
        }

        let mut last_status = None;
        let mut remaining = self.settings.max_wait.as_secs();
        while remaining > 0 {
            if self.driver.is_connected() {
                break;
            }
            match self.driver.status() {
                Ok(status) => {
                    last_status = Some(status);
                    if status.is_terminal_failure() {
                        debug!("driver reported {status:?}; giving up early");
                        break;
                    }
                    debug!("waiting for connection... status={status:?}");
                }
                Err(err) => debug!("waiting for connection... status unavailable: {err}"),
            }
            remaining -= 1;
            self.clock.sleep(POLL_INTERVAL);
        }

        let ssid_observed_in_scan = scan == ScanObservation::Seen;

        if !self.driver.is_connected() {
            let reason = classify_failure(last_status, scan);
            warn!(
                "wifi connect failed: reason={} status={last_status:?}",
                reason.as_str()
            );
            self.state = LinkState::Failed;
            return Ok(ConnectionOutcome {
                connected: false,
                internet_reachable: false,
                failure_reason: Some(reason),
                status_code: last_status.map(LinkStatus::code),
                ssid_observed_in_scan,
                ip_address: None,
            });
        }

        self.state = LinkState::Connected;
        let ip_address = self.driver.ip_address();
        let internet_reachable = self.internet_check(PROBE_TIMEOUT);
        if internet_reachable {
            if let Err(err) = self.time_sync(false) {
                warn!("time sync failed: {err}");
            }
        }

        info!("wifi connected: ip={ip_address:?} internet={internet_reachable}");
        Ok(ConnectionOutcome {
            connected: true,
            internet_reachable,
            failure_reason: (!internet_reachable).then_some(FailureReason::NoInternet),
            status_code: last_status.map(LinkStatus::code),
            ssid_observed_in_scan,
            ip_address,
        })
    }

    /// DNS + TCP + any HTTP reply from a well-known host.
    pub fn internet_check(&mut self, timeout: Duration) -> bool {
        let ProbeTarget { host, port, path } = self.probe.clone();
        match self.http.probe(&host, port, &path, timeout) {
            Ok(reachable) => reachable,
            Err(err) => {
                warn!("internet check failed: {err}");
                false
            }
        }
    }

    /// Sets the clock from NTP once per session; later calls are no-ops
    /// unless `force` is set.
    pub fn time_sync(&mut self, force: bool) -> Result<(), FetchError> {
        if self.time_synced && !force {
            return Ok(());
        }

        let host = self.settings.ntp_host.clone();
        let attempts = self.settings.ntp_retries.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            info!("ntp sync attempt {attempt}/{attempts} host={host}");
            match self.clock.sync_from_ntp(&host, NTP_TIMEOUT) {
                Ok(now) => {
                    self.time_synced = true;
                    info!("ntp synced: {}", now.format("%H:%M:%SZ"));
                    return Ok(());
                }
                Err(err) => {
                    warn!("ntp sync failed: {err}");
                    last_err = Some(err);
                    if attempt < attempts {
                        self.clock.sleep(NTP_BACKOFF);
                    }
                }
            }
        }
        Err(last_err.unwrap_or(FetchError::Timeout))
    }

    /// Station scan for the setup page, reusing results younger than `ttl`.
    pub fn scan_networks(&mut self, ttl: Duration) -> Result<Vec<ScanEntry>, WifiError> {
        let now = self.clock.now();
        if let Some(cache) = &self.scan_cache {
            if now.saturating_duration_since(cache.taken_at) < ttl {
                debug!("using cached scan ({} networks)", cache.entries.len());
                return Ok(cache.entries.clone());
            }
        }

        self.driver.set_active(true)?;
        let mut entries = self.driver.scan()?;
        entries.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        let mut seen = HashSet::new();
        entries.retain(|entry| !entry.ssid.is_empty() && seen.insert(entry.ssid.clone()));
        self.scan_cache = Some(ScanCache {
            taken_at: now,
            entries: entries.clone(),
        });
        Ok(entries)
    }

    /// Leaves station mode and brings up the setup access point.
    pub fn start_access_point(
        &mut self,
        settings: &AccessPointSettings,
    ) -> Result<Ipv4Addr, WifiError> {
        if let Err(err) = self.driver.disconnect() {
            debug!("disconnect before access point: {err}");
        }
        if let Err(err) = self.driver.set_active(false) {
            warn!("failed to disable station interface: {err}");
        }
        self.clock.sleep(AP_SETTLE);

        let ip = self
            .driver
            .start_access_point(&settings.ssid, &settings.password)?;
        self.state = LinkState::AccessPoint;
        info!("access point `{}` up at {ip}", settings.ssid);
        Ok(ip)
    }

    /// Tears the access point down and rebuilds the station interface.
    pub fn stop_access_point(&mut self) -> Result<(), WifiError> {
        let stopped = self.driver.stop_access_point();
        if let Err(err) = &stopped {
            warn!("failed to stop access point: {err}");
        }
        self.scan_cache = None;
        self.driver.reinitialize()?;
        self.state = LinkState::Idle;
        info!("access point stopped");
        stopped
    }
}
