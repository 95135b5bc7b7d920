use std::{
    fs::File,
    io::{self, BufReader},
    net::{Ipv4Addr, TcpListener},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use rustls::{pki_types::ServerName, ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use tracing::info;

use groundboard_common::{
    http::{connect_tcp, Connection},
    wifi::ScanEntry,
    BoardConfig, ConnectionManager, FetchError, HttpClient, JsonFileStore, LinkStatus, NetTransport,
    SystemClock, TlsConnector, WifiDriver, WifiError,
};

use crate::app::{self, Platform};

const DEFAULT_CA_BUNDLE: &str = "/etc/ssl/certs/ca-certificates.crt";
const DEFAULT_PORTAL_ADDR: &str = "127.0.0.1:8080";

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path =
        std::env::var("GROUNDBOARD_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let root = PathBuf::from(std::env::var("GROUNDBOARD_ROOT").unwrap_or_else(|_| ".".to_string()));
    let ca_bundle =
        std::env::var("GROUNDBOARD_CA_BUNDLE").unwrap_or_else(|_| DEFAULT_CA_BUNDLE.to_string());

    let store = JsonFileStore::new(&config_path);
    let tls = RustlsConnector::from_pem_file(&ca_bundle)
        .with_context(|| format!("failed to load CA bundle {ca_bundle}"))?;
    let mut manager = ConnectionManager::new(
        HostWifi::from_env(),
        HttpClient::new(NetTransport::new(tls)),
        SystemClock::new(),
        BoardConfig::default().wifi_settings(),
    );
    let mut platform = HostPlatform {
        setup_pending: std::env::var("GROUNDBOARD_SETUP").is_ok_and(|value| value == "1"),
        portal_addr: std::env::var("GROUNDBOARD_PORTAL_ADDR")
            .unwrap_or_else(|_| DEFAULT_PORTAL_ADDR.to_string()),
    };

    info!(
        "groundboard host starting: config={config_path} root={}",
        root.display()
    );

    // Each pass is one simulated boot.
    loop {
        app::run_once(&mut manager, &store, &root, &mut platform)?;
        info!("restart requested; rebooting");
        manager.reset().context("wifi reset failed")?;
    }
}

struct HostPlatform {
    setup_pending: bool,
    portal_addr: String,
}

impl Platform for HostPlatform {
    fn setup_requested(&mut self) -> bool {
        std::mem::take(&mut self.setup_pending)
    }

    fn portal_listener(&mut self, _ip: Ipv4Addr) -> io::Result<TcpListener> {
        info!("setup portal listening on http://{}", self.portal_addr);
        TcpListener::bind(&self.portal_addr)
    }

    fn show_status(&mut self, title: &str, detail: &str) {
        info!("display: {title} | {detail}");
    }
}

/// rustls client over a std `TcpStream`.
struct RustlsConnector {
    config: Arc<ClientConfig>,
}

impl RustlsConnector {
    fn from_pem_file(path: &str) -> anyhow::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut reader) {
            roots.add(cert?)?;
        }
        info!("loaded {} trust anchors from {path}", roots.len());

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            config: Arc::new(config),
        })
    }
}

impl TlsConnector for RustlsConnector {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, FetchError> {
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|err| FetchError::Config(format!("bad TLS server name {host}: {err}")))?;
        let session = ClientConnection::new(Arc::clone(&self.config), server_name)
            .map_err(|err| FetchError::Protocol(format!("TLS setup failed: {err}")))?;
        let tcp = connect_tcp(host, port, timeout)?;
        Ok(Box::new(StreamOwned::new(session, tcp)))
    }
}

/// Stand-in radio for desktop runs: the host network is always there, and
/// scans report whatever `GROUNDBOARD_NETWORKS` lists.
struct HostWifi {
    networks: Vec<String>,
    active: bool,
    connected: bool,
    access_point: bool,
}

impl HostWifi {
    fn from_env() -> Self {
        let networks = std::env::var("GROUNDBOARD_NETWORKS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|ssid| !ssid.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            networks,
            active: false,
            connected: false,
            access_point: false,
        }
    }
}

impl WifiDriver for HostWifi {
    fn set_active(&mut self, active: bool) -> Result<(), WifiError> {
        self.active = active;
        if !active {
            self.connected = false;
        }
        Ok(())
    }

    fn disable_power_save(&mut self) -> Result<(), WifiError> {
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), WifiError> {
        self.connected = false;
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<ScanEntry>, WifiError> {
        if !self.active {
            return Err(WifiError::Scan("station interface is down".to_string()));
        }
        Ok(self
            .networks
            .iter()
            .map(|ssid| ScanEntry {
                ssid: ssid.clone(),
                rssi: -50,
            })
            .collect())
    }

    fn connect(&mut self, ssid: &str, _password: &str) -> Result<(), WifiError> {
        if !self.active {
            return Err(WifiError::Interface("station interface is down".to_string()));
        }
        info!("simulated association with `{ssid}`");
        self.connected = true;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn status(&mut self) -> Result<LinkStatus, WifiError> {
        Ok(match (self.active, self.connected) {
            (_, true) => LinkStatus::GotIp,
            (true, false) => LinkStatus::Connecting,
            (false, false) => LinkStatus::Idle,
        })
    }

    fn ip_address(&mut self) -> Option<Ipv4Addr> {
        self.connected.then_some(Ipv4Addr::LOCALHOST)
    }

    fn reinitialize(&mut self) -> Result<(), WifiError> {
        self.active = false;
        self.connected = false;
        Ok(())
    }

    fn start_access_point(&mut self, ssid: &str, _password: &str) -> Result<Ipv4Addr, WifiError> {
        info!("simulated access point `{ssid}`");
        self.access_point = true;
        Ok(Ipv4Addr::LOCALHOST)
    }

    fn stop_access_point(&mut self) -> Result<(), WifiError> {
        self.access_point = false;
        Ok(())
    }
}
