//! METAR observations from aviationweather.gov.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::BoardConfig,
    error::FetchError,
    http::{retry, Request, RetryPolicy, Transport},
    wifi::{ConnectionManager, WifiDriver},
};

pub const METAR_HOST: &str = "aviationweather.gov";

const METAR_BODY_LIMIT: usize = 32 * 1024;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum WindDirection {
    Degrees(u16),
    /// `"VRB"` for variable winds.
    Variable(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Observation {
    #[serde(rename = "icaoId", default)]
    pub station: String,
    #[serde(rename = "rawOb", default)]
    pub raw: String,
    #[serde(rename = "obsTime", default)]
    pub obs_time: Option<i64>,
    #[serde(rename = "wspd", default)]
    pub wind_speed_kt: Option<u16>,
    #[serde(rename = "wdir", default)]
    pub wind_direction: Option<WindDirection>,
    #[serde(rename = "temp", default)]
    pub temperature_c: Option<f64>,
    #[serde(rename = "fltCat", default)]
    pub flight_category: Option<String>,
}

impl Observation {
    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.obs_time?, 0).single()
    }

    /// `HH:MMZ`, or empty when the report carries no time.
    pub fn observed_zulu(&self) -> String {
        self.observed_at()
            .map(|time| time.format("%H:%MZ").to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetarSettings {
    pub stations: Option<String>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl MetarSettings {
    pub fn from_config(config: &BoardConfig) -> Self {
        Self {
            stations: config
                .metar_station_id
                .as_deref()
                .map(str::trim)
                .filter(|ids| !ids.is_empty())
                .map(str::to_string),
            timeout: Duration::from_secs(u64::from(config.metar_timeout_s)),
            retry: RetryPolicy {
                attempts: config.metar_retries,
                backoff: RETRY_BACKOFF,
            },
        }
    }
}

/// Joins station identifiers into the `ids=` list, rejecting anything that
/// is not a plain ICAO-style code.
pub fn format_stations<S: AsRef<str>>(stations: &[S]) -> Result<String, FetchError> {
    let mut ids = Vec::with_capacity(stations.len());
    for station in stations {
        for id in station.as_ref().split(',').map(str::trim).filter(|id| !id.is_empty()) {
            if !id.chars().all(|ch| ch.is_ascii_alphanumeric()) {
                return Err(FetchError::Config(format!("bad station id `{id}`")));
            }
            ids.push(id.to_ascii_uppercase());
        }
    }
    if ids.is_empty() {
        return Err(FetchError::Config("no METAR station configured".to_string()));
    }
    Ok(ids.join(","))
}

pub struct MetarClient {
    settings: MetarSettings,
}

impl MetarClient {
    pub fn new(settings: MetarSettings) -> Self {
        Self { settings }
    }

    /// Fetches the latest observations for `stations`, or for the configured
    /// stations when the slice is empty. Timeouts are retried per the
    /// configured policy; anything else fails the call.
    pub fn fetch<D, T, C, S>(
        &self,
        manager: &mut ConnectionManager<D, T, C>,
        stations: &[S],
    ) -> Result<Vec<Observation>, FetchError>
    where
        D: WifiDriver,
        T: Transport,
        C: Clock,
        S: AsRef<str>,
    {
        let ids = if stations.is_empty() {
            format_stations(self.settings.stations.as_slice())?
        } else {
            format_stations(stations)?
        };

        if manager.is_connected() && !manager.time_synced() && manager.internet_check(PROBE_TIMEOUT) {
            if let Err(err) = manager.time_sync(false) {
                warn!("time sync before METAR fetch failed: {err}");
            }
        }

        let path = format!("/api/data/metar?ids={ids}&format=json");
        let request = Request::get(METAR_HOST, &path).timeout(self.settings.timeout);
        let attempts = self.settings.retry.attempts.max(1);

        let (http, clock) = manager.http_and_clock();
        let observations = retry(self.settings.retry, clock, |attempt| {
            debug!("METAR fetch {ids} attempt {attempt}/{attempts}");
            let (status, body) = http.get_bytes(&request, METAR_BODY_LIMIT)?;
            if status != 200 {
                return Err(FetchError::Status(status));
            }
            if body.is_empty() {
                return Err(FetchError::Protocol("empty METAR body".to_string()));
            }
            serde_json::from_slice::<Vec<Observation>>(&body)
                .map_err(|err| FetchError::Protocol(format!("METAR decode failed: {err}")))
        })?;

        info!("METAR {ids}: {} observation(s)", observations.len());
        Ok(observations)
    }
}
