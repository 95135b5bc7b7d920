use core::convert::TryInto;
use std::{
    ffi::c_void,
    io::{self, Read, Write},
    net::{Ipv4Addr, TcpListener},
    path::Path,
    sync::{
        atomic::{AtomicU16, Ordering},
        Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use embedded_svc::wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::gpio::{AnyIOPin, Input, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SntpConf, SyncStatus},
    sys::{self, EspError},
    tls::{Config as TlsConfig, EspTls, InternalSocket},
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};

use groundboard_common::{
    http::Connection, portal::PORTAL_PORT, wifi::ScanEntry, BoardConfig, Clock,
    ConfigError, ConfigStore, ConnectionManager, FetchError, HttpClient, LinkStatus, NetTransport,
    TlsConnector, WifiDriver, WifiError,
};

use crate::app::{self, Platform};

const NVS_NAMESPACE: &str = "groundboard";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_BUFFER_SIZE: usize = 8192;
const STORAGE_MOUNT: &str = "/storage";
const DEFAULT_BUTTON_PIN: i32 = 15;

/// Last `WIFI_EVENT_STA_DISCONNECTED` reason, zero while none is pending.
static DISCONNECT_REASON: AtomicU16 = AtomicU16::new(0);

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsConfigStore {
        partition: nvs_partition.clone(),
        lock: Mutex::new(()),
    };

    mount_storage()?;
    register_disconnect_handler()?;

    let config = store.load().unwrap_or_else(|err| {
        warn!("failed to load config from NVS: {err}");
        BoardConfig::default()
    });
    let button_pin = config
        .extra
        .get("BUTTON_PIN_AP")
        .and_then(|value| value.as_i64())
        .and_then(|pin| i32::try_from(pin).ok())
        .unwrap_or(DEFAULT_BUTTON_PIN);

    let esp_wifi = EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs_partition))?;
    let wifi = EspWifiDriver {
        wifi: BlockingWifi::wrap(esp_wifi, sys_loop)?,
        access_point: false,
    };
    let mut manager = ConnectionManager::new(
        wifi,
        HttpClient::new(NetTransport::new(EspTlsConnector)),
        EspClock::default(),
        config.wifi_settings(),
    );
    let mut platform = EspPlatform {
        button: setup_button(button_pin),
    };

    if let Err(err) = app::run_once(&mut manager, &store, Path::new(STORAGE_MOUNT), &mut platform) {
        error!("halted: {err:#}");
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }

    info!("restarting");
    thread::sleep(Duration::from_millis(200));
    unsafe { esp_idf_svc::sys::esp_restart() };
    Ok(())
}

fn mount_storage() -> anyhow::Result<()> {
    let mount_config = sys::esp_vfs_fat_mount_config_t {
        format_if_mount_failed: true,
        max_files: 8,
        allocation_unit_size: 4096,
        ..Default::default()
    };
    let mut handle: sys::wl_handle_t = sys::WL_INVALID_HANDLE;
    let rc = unsafe {
        sys::esp_vfs_fat_spiflash_mount_rw_wl(
            c"/storage".as_ptr(),
            c"storage".as_ptr(),
            &mount_config,
            &mut handle,
        )
    };
    if rc == sys::ESP_OK {
        info!("FAT storage mounted at {STORAGE_MOUNT}");
        return Ok(());
    }
    Err(anyhow!("esp_vfs_fat_spiflash_mount_rw_wl failed with code {rc}"))
}

unsafe extern "C" fn on_sta_disconnected(
    _arg: *mut c_void,
    _base: sys::esp_event_base_t,
    _id: i32,
    data: *mut c_void,
) {
    if data.is_null() {
        return;
    }
    let event = &*(data as *const sys::wifi_event_sta_disconnected_t);
    DISCONNECT_REASON.store(event.reason as u16, Ordering::Relaxed);
}

fn register_disconnect_handler() -> anyhow::Result<()> {
    let rc = unsafe {
        sys::esp_event_handler_register(
            sys::WIFI_EVENT,
            sys::wifi_event_t_WIFI_EVENT_STA_DISCONNECTED as i32,
            Some(on_sta_disconnected),
            core::ptr::null_mut(),
        )
    };
    if rc == sys::ESP_OK {
        return Ok(());
    }
    Err(anyhow!("esp_event_handler_register failed with code {rc}"))
}

fn setup_button(pin: i32) -> Option<PinDriver<'static, AnyIOPin, Input>> {
    let driver = unsafe { PinDriver::input(AnyIOPin::new(pin)) };
    match driver {
        Ok(mut button) => {
            if let Err(err) = button.set_pull(Pull::Up) {
                warn!("failed to enable pull-up on GPIO{pin}: {err}");
            }
            info!("setup button on GPIO{pin}");
            Some(button)
        }
        Err(err) => {
            warn!("setup button unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

struct EspPlatform {
    button: Option<PinDriver<'static, AnyIOPin, Input>>,
}

impl Platform for EspPlatform {
    fn setup_requested(&mut self) -> bool {
        // Active low.
        self.button.as_ref().is_some_and(|button| button.is_low())
    }

    fn portal_listener(&mut self, ip: Ipv4Addr) -> io::Result<TcpListener> {
        TcpListener::bind((ip, PORTAL_PORT))
    }

    fn show_status(&mut self, title: &str, detail: &str) {
        info!("status: {title} | {detail}");
    }
}

struct NvsConfigStore {
    partition: EspDefaultNvsPartition,
    lock: Mutex<()>,
}

impl ConfigStore for NvsConfigStore {
    fn load(&self) -> Result<BoardConfig, ConfigError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| ConfigError::Backend("nvs lock poisoned".to_string()))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(nvs_error)?;
        let mut buffer = vec![0_u8; NVS_BUFFER_SIZE];

        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer).map_err(nvs_error)? {
            Some(value) => BoardConfig::from_json(value.as_bytes()),
            None => Ok(BoardConfig::default()),
        }
    }

    fn save(&self, config: &BoardConfig) -> Result<(), ConfigError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| ConfigError::Backend("nvs lock poisoned".to_string()))?;
        let mut nvs =
            EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(nvs_error)?;
        let payload = serde_json::to_string(config)?;
        nvs.set_str(NVS_CONFIG_KEY, &payload).map_err(nvs_error)?;
        Ok(())
    }
}

fn nvs_error(err: EspError) -> ConfigError {
    ConfigError::Backend(format!("nvs: {err}"))
}

const SNTP_POLL: Duration = Duration::from_millis(100);

/// Time comes from the ESP-IDF SNTP service, which also sets the system
/// clock; sleeping yields to FreeRTOS.
#[derive(Default)]
struct EspClock {
    sntp: Option<EspSntp<'static>>,
}

impl Clock for EspClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }

    fn sync_from_ntp(
        &mut self,
        host: &str,
        timeout: Duration,
    ) -> Result<DateTime<Utc>, FetchError> {
        // Only one SNTP service may exist at a time.
        self.sntp = None;
        let mut conf = SntpConf::default();
        conf.servers[0] = host;
        let sntp = EspSntp::new(&conf)
            .map_err(|err| FetchError::Connectivity(format!("sntp start failed: {err}")))?;

        let deadline = Instant::now() + timeout;
        while sntp.get_sync_status() != SyncStatus::Completed {
            if Instant::now() >= deadline {
                return Err(FetchError::Timeout);
            }
            thread::sleep(SNTP_POLL);
        }
        self.sntp = Some(sntp);

        let now = Utc::now();
        info!("time synchronized from {host}: {now}");
        Ok(now)
    }
}

/// esp-tls with the bundled CA store.
struct EspTlsConnector;

impl TlsConnector for EspTlsConnector {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, FetchError> {
        let config = TlsConfig {
            common_name: Some(host),
            use_crt_bundle_attach: true,
            timeout_ms: u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX),
            ..TlsConfig::new()
        };
        let mut tls = EspTls::new()
            .map_err(|err| FetchError::Connectivity(format!("esp-tls init failed: {err}")))?;
        tls.connect(host, port, &config).map_err(|err| {
            if err.code() == sys::ESP_ERR_TIMEOUT {
                FetchError::Timeout
            } else {
                FetchError::Connectivity(format!("tls connect to {host}:{port} failed: {err}"))
            }
        })?;
        Ok(Box::new(TlsStream(tls)))
    }
}

struct TlsStream(EspTls<InternalSocket>);

fn tls_io_error(err: EspError) -> io::Error {
    if err.code() == sys::ESP_ERR_TIMEOUT {
        io::Error::new(io::ErrorKind::TimedOut, err)
    } else {
        io::Error::other(err)
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).map_err(tls_io_error)
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf).map_err(tls_io_error)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct EspWifiDriver {
    wifi: BlockingWifi<EspWifi<'static>>,
    access_point: bool,
}

impl EspWifiDriver {
    fn apply(&mut self, client: ClientConfiguration) -> Result<(), WifiError> {
        let configuration = if self.access_point {
            let ap = match self.wifi.get_configuration().map_err(interface_error)? {
                Configuration::Mixed(_, ap) | Configuration::AccessPoint(ap) => ap,
                _ => AccessPointConfiguration::default(),
            };
            Configuration::Mixed(client, ap)
        } else {
            Configuration::Client(client)
        };
        self.wifi
            .set_configuration(&configuration)
            .map_err(interface_error)
    }
}

fn interface_error(err: EspError) -> WifiError {
    WifiError::Interface(err.to_string())
}

fn auth_for(password: &str) -> AuthMethod {
    if password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    }
}

impl WifiDriver for EspWifiDriver {
    fn set_active(&mut self, active: bool) -> Result<(), WifiError> {
        let started = self.wifi.is_started().map_err(interface_error)?;
        match (active, started) {
            (true, false) => {
                self.apply(ClientConfiguration::default())?;
                self.wifi.start().map_err(interface_error)
            }
            (false, true) => {
                self.access_point = false;
                self.wifi.stop().map_err(interface_error)
            }
            _ => Ok(()),
        }
    }

    fn disable_power_save(&mut self) -> Result<(), WifiError> {
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
        if rc == sys::ESP_OK {
            return Ok(());
        }
        Err(WifiError::Interface(format!("esp_wifi_set_ps failed: {rc}")))
    }

    fn disconnect(&mut self) -> Result<(), WifiError> {
        if self.wifi.is_connected().map_err(interface_error)? {
            self.wifi.disconnect().map_err(interface_error)?;
        }
        DISCONNECT_REASON.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<ScanEntry>, WifiError> {
        let found = self
            .wifi
            .scan()
            .map_err(|err| WifiError::Scan(err.to_string()))?;
        Ok(found
            .into_iter()
            .map(|ap| ScanEntry {
                ssid: ap.ssid.to_string(),
                rssi: ap.signal_strength,
            })
            .collect())
    }

    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), WifiError> {
        let client = ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| WifiError::Interface("wifi ssid too long".to_string()))?,
            password: password
                .try_into()
                .map_err(|_| WifiError::Interface("wifi password too long".to_string()))?,
            auth_method: auth_for(password),
            ..Default::default()
        };
        self.apply(client)?;
        DISCONNECT_REASON.store(0, Ordering::Relaxed);
        // Non-blocking; the manager polls for the outcome.
        self.wifi.wifi_mut().connect().map_err(interface_error)
    }

    fn is_connected(&mut self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn status(&mut self) -> Result<LinkStatus, WifiError> {
        if self.wifi.is_up().map_err(interface_error)? {
            return Ok(LinkStatus::GotIp);
        }
        if !self.wifi.is_started().map_err(interface_error)? {
            return Ok(LinkStatus::Idle);
        }
        Ok(match DISCONNECT_REASON.load(Ordering::Relaxed) {
            0 => LinkStatus::Connecting,
            // 4WAY_HANDSHAKE_TIMEOUT, AUTH_FAIL, HANDSHAKE_TIMEOUT
            15 | 202 | 204 => LinkStatus::WrongPassword,
            // NO_AP_FOUND
            201 => LinkStatus::NoApFound,
            _ => LinkStatus::ConnectFail,
        })
    }

    fn ip_address(&mut self) -> Option<Ipv4Addr> {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
            .filter(|ip| !ip.is_unspecified())
    }

    fn reinitialize(&mut self) -> Result<(), WifiError> {
        // The modem is owned for the life of the program, so a fresh station
        // means stopped and reconfigured from scratch.
        if self.wifi.is_started().map_err(interface_error)? {
            self.wifi.stop().map_err(interface_error)?;
        }
        self.access_point = false;
        DISCONNECT_REASON.store(0, Ordering::Relaxed);
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration::default()))
            .map_err(interface_error)
    }

    fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<Ipv4Addr, WifiError> {
        let ap = AccessPointConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| WifiError::AccessPoint("AP ssid too long".to_string()))?,
            password: password
                .try_into()
                .map_err(|_| WifiError::AccessPoint("AP password too long".to_string()))?,
            auth_method: if password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            channel: 1,
            ..Default::default()
        };
        let ap_error = |err: EspError| WifiError::AccessPoint(err.to_string());

        // Mixed mode keeps the station side available for scans.
        self.wifi
            .set_configuration(&Configuration::Mixed(ClientConfiguration::default(), ap))
            .map_err(ap_error)?;
        if !self.wifi.is_started().map_err(ap_error)? {
            self.wifi.start().map_err(ap_error)?;
        }
        self.access_point = true;

        let info = self.wifi.wifi().ap_netif().get_ip_info().map_err(ap_error)?;
        info!("access point `{ssid}` up at {}", info.ip);
        Ok(info.ip)
    }

    fn stop_access_point(&mut self) -> Result<(), WifiError> {
        if !self.access_point {
            return Ok(());
        }
        self.access_point = false;
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration::default()))
            .map_err(|err| WifiError::AccessPoint(err.to_string()))
    }
}
