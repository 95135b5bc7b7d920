use std::{
    net::UdpSocket,
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::error::FetchError;

const NTP_PORT: u16 = 123;
const NTP_PACKET_SIZE: usize = 48;
/// Seconds between 1900-01-01 and 1970-01-01.
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

/// Time source, blocking sleep and wall-clock setting for the control thread.
pub trait Clock {
    fn now(&self) -> Instant;

    fn sleep(&mut self, duration: Duration);

    /// Sets the device wall clock from `host` and returns the new UTC time.
    fn sync_from_ntp(&mut self, host: &str, timeout: Duration)
        -> Result<DateTime<Utc>, FetchError>;
}

/// Std clock. Hosts rarely allow setting the system time, so the NTP result
/// is kept as an offset applied by [`SystemClock::utc_now`].
#[derive(Debug, Default)]
pub struct SystemClock {
    offset: Option<chrono::Duration>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn utc_now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.offset {
            Some(offset) => now + offset,
            None => now,
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn sync_from_ntp(
        &mut self,
        host: &str,
        timeout: Duration,
    ) -> Result<DateTime<Utc>, FetchError> {
        let network_time = sntp_query(host, timeout)?;
        self.offset = Some(network_time - Utc::now());
        Ok(network_time)
    }
}

/// One SNTP v4 client exchange. Half the round trip is added to the server's
/// transmit timestamp.
pub fn sntp_query(host: &str, timeout: Duration) -> Result<DateTime<Utc>, FetchError> {
    let timeout = timeout.max(Duration::from_millis(1));
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(FetchError::from_socket)?;
    socket
        .set_read_timeout(Some(timeout))
        .map_err(FetchError::from_socket)?;
    socket
        .connect((host, NTP_PORT))
        .map_err(|err| FetchError::Connectivity(format!("ntp host {host}: {err}")))?;

    let mut packet = [0_u8; NTP_PACKET_SIZE];
    // LI 0, version 4, mode 3 (client)
    packet[0] = 0b00_100_011;

    let sent = Instant::now();
    socket.send(&packet).map_err(FetchError::from_socket)?;

    let mut response = [0_u8; NTP_PACKET_SIZE];
    let len = socket.recv(&mut response).map_err(FetchError::from_socket)?;
    let rtt = sent.elapsed();
    debug!("ntp reply from {host} in {rtt:?}");

    parse_sntp_reply(&response[..len], rtt)
}

pub fn parse_sntp_reply(reply: &[u8], rtt: Duration) -> Result<DateTime<Utc>, FetchError> {
    if reply.len() != NTP_PACKET_SIZE {
        return Err(FetchError::Protocol(format!(
            "ntp reply is {} bytes",
            reply.len()
        )));
    }
    let mode = reply[0] & 0b111;
    if mode != 4 && mode != 5 {
        return Err(FetchError::Protocol(format!("ntp reply has mode {mode}")));
    }

    let seconds = u64::from(u32::from_be_bytes([reply[40], reply[41], reply[42], reply[43]]));
    let fraction = u64::from(u32::from_be_bytes([reply[44], reply[45], reply[46], reply[47]]));
    if seconds < NTP_EPOCH_OFFSET {
        return Err(FetchError::Protocol("ntp timestamp predates 1970".to_string()));
    }

    let unix_ms = (seconds - NTP_EPOCH_OFFSET) * 1000 + ((fraction * 1000) >> 32);
    let adjusted_ms = unix_ms + (rtt.as_millis() / 2) as u64;
    Utc.timestamp_millis_opt(adjusted_ms as i64)
        .single()
        .ok_or_else(|| FetchError::Protocol("ntp timestamp out of range".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_for(unix_seconds: u64) -> [u8; NTP_PACKET_SIZE] {
        let mut reply = [0_u8; NTP_PACKET_SIZE];
        reply[0] = 0b00_100_100;
        let ntp_seconds = (unix_seconds + NTP_EPOCH_OFFSET) as u32;
        reply[40..44].copy_from_slice(&ntp_seconds.to_be_bytes());
        reply
    }

    #[test]
    fn decodes_transmit_timestamp() {
        let time = parse_sntp_reply(&reply_for(1_700_000_000), Duration::ZERO).unwrap();
        assert_eq!(time.timestamp(), 1_700_000_000);
    }

    #[test]
    fn adds_half_the_round_trip() {
        let time = parse_sntp_reply(&reply_for(1_700_000_000), Duration::from_millis(400)).unwrap();
        assert_eq!(time.timestamp_millis(), 1_700_000_000_200);
    }

    #[test]
    fn rejects_short_or_client_mode_replies() {
        assert!(parse_sntp_reply(&[0_u8; 12], Duration::ZERO).is_err());

        let mut reply = reply_for(1_700_000_000);
        reply[0] = 0b00_100_011;
        assert!(parse_sntp_reply(&reply, Duration::ZERO).is_err());
    }
}
