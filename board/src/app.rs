//! Boot sequence shared by the host and ESP builds.

use std::{
    io,
    net::{Ipv4Addr, TcpListener},
    path::Path,
    time::Duration,
};

use anyhow::{anyhow, Context};
use tracing::{info, warn};

use groundboard_common::{
    metar::WindDirection, run_captive_portal, run_update, Clock, ConfigStore, ConnectionManager,
    MetarClient, MetarSettings, Observation, PortalExit, Transport, UpdateResult, WifiDriver,
};

const METAR_REFRESH_SECS: u32 = 600;
const RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// What differs between the real board and the desktop build.
pub trait Platform {
    /// The user asked for the setup portal (AP button, env flag).
    fn setup_requested(&mut self) -> bool;

    fn portal_listener(&mut self, ip: Ipv4Addr) -> io::Result<TcpListener>;

    /// Two-line status for the display.
    fn show_status(&mut self, title: &str, detail: &str);
}

/// One boot. Returns when the board should restart; an error means halt.
pub fn run_once<D, T, C, S, P>(
    manager: &mut ConnectionManager<D, T, C>,
    store: &S,
    root: &Path,
    platform: &mut P,
) -> anyhow::Result<()>
where
    D: WifiDriver,
    T: Transport,
    C: Clock,
    S: ConfigStore,
    P: Platform,
{
    let mut config = store.load().context("failed to load config")?;
    config.sanitize();

    if config.update_mode {
        platform.show_status("Update Mode", "Updating...");
        let result = run_update(manager, store, root, true);
        info!(
            "update result: {}",
            serde_json::to_string(&UpdateResult::from(&result))?
        );
        return match result {
            Ok(summary) => {
                store
                    .update(|cfg| cfg.update_mode = false)
                    .context("failed to clear UPDATE_MODE")?;
                platform.show_status("Update OK", &format!("{} files", summary.files_updated));
                Ok(())
            }
            Err(err) => {
                platform.show_status("Update Failed", err.display_message());
                Err(anyhow!(err).context("update failed; halting"))
            }
        };
    }

    manager.set_settings(config.wifi_settings());
    let outcome = manager.connect().context("wifi interface failed")?;
    info!("wifi outcome: {}", serde_json::to_string(&outcome)?);

    if !outcome.is_usable() {
        let message = outcome
            .failure_reason
            .map(|reason| reason.display_message())
            .unwrap_or("WiFi ERR");
        platform.show_status("WiFi Failed", message);

        let mut waited = Duration::ZERO;
        while waited < RECONNECT_DELAY {
            if platform.setup_requested() {
                return enter_setup(manager, store, platform);
            }
            manager.clock().sleep(Duration::from_secs(1));
            waited += Duration::from_secs(1);
        }
        return Ok(());
    }

    let metar = MetarClient::new(MetarSettings::from_config(&config));
    loop {
        match metar.fetch::<_, _, _, &str>(manager, &[]) {
            Ok(observations) => match observations.first() {
                Some(observation) => {
                    let (title, detail) = summarize(observation);
                    platform.show_status(&title, &detail);
                }
                None => platform.show_status("METAR", "No Data"),
            },
            Err(err) => {
                warn!("METAR fetch failed: {err}");
                platform.show_status("METAR", "Fetch ERR");
            }
        }

        for _ in 0..METAR_REFRESH_SECS {
            if platform.setup_requested() {
                return enter_setup(manager, store, platform);
            }
            manager.clock().sleep(Duration::from_secs(1));
        }

        if !manager.is_connected() {
            warn!("wifi link lost; restarting");
            return Ok(());
        }
    }
}

fn enter_setup<D, T, C, S, P>(
    manager: &mut ConnectionManager<D, T, C>,
    store: &S,
    platform: &mut P,
) -> anyhow::Result<()>
where
    D: WifiDriver,
    T: Transport,
    C: Clock,
    S: ConfigStore,
    P: Platform,
{
    platform.show_status("WiFi AP Mode", "Open 192.168.4.1");
    let exit = run_captive_portal(manager, store, |ip| platform.portal_listener(ip))
        .context("setup portal failed")?;
    match exit {
        PortalExit::Saved => platform.show_status("Saved", "Restarting"),
        PortalExit::Reboot => platform.show_status("Update Mode", "Rebooting"),
    }
    Ok(())
}

fn summarize(observation: &Observation) -> (String, String) {
    let wind = match (&observation.wind_direction, observation.wind_speed_kt) {
        (Some(direction), Some(speed)) => {
            let direction = match direction {
                WindDirection::Degrees(deg) => format!("{deg:03}"),
                WindDirection::Variable(raw) => raw.clone(),
            };
            format!("{direction}@{speed}kt")
        }
        _ => "wind n/a".to_string(),
    };
    let category = observation.flight_category.as_deref().unwrap_or("----");
    (
        format!("{} {category}", observation.station),
        format!("{wind} {}", observation.observed_zulu()),
    )
}
