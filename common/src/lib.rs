pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod metar;
pub mod ota;
pub mod portal;
pub mod wifi;

#[cfg(test)]
mod testing;

pub use clock::{Clock, SystemClock};
pub use config::{BoardConfig, ConfigStore, JsonFileStore};
pub use error::{ConfigError, ErrorKind, FetchError};
pub use http::{HttpClient, NetTransport, Request, RetryPolicy, TlsConnector, Transport};
pub use metar::{MetarClient, MetarSettings, Observation};
pub use ota::{run_update, UpdateError, UpdateResult, UpdateSummary};
pub use portal::{run_captive_portal, Listener, PortalExit};
pub use wifi::{
    ConnectionManager, ConnectionOutcome, FailureReason, LinkStatus, ScanEntry, WifiDriver,
    WifiError,
};
