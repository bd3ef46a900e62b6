//! Best-effort SNTP offset probe, grounded on
//! `examples/original_source/gtoaes_hr/src/GeneralControl.cpp`'s
//! `ntpEnable`/`ntpHost`/`ntpMaxDiff` configuration (`parameter.h`): a
//! periodic query against a configured NTP server, logging a warning
//! once the measured offset exceeds the configured maximum difference.
//! This never adjusts the system clock — it only reports drift.

use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

const NTP_PORT: u16 = 123;
const NTP_EPOCH_OFFSET_SECS: u64 = 2_208_988_800; // 1900-01-01 -> 1970-01-01
const QUERY_TIMEOUT: StdDuration = StdDuration::from_secs(3);
/// Probe cadence.
pub const PROBE_INTERVAL: StdDuration = StdDuration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NtpProbe {
    pub offset: StdDuration,
    pub offset_is_negative: bool,
}

async fn query(host: &str) -> std::io::Result<NtpProbe> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect((host, NTP_PORT)).await?;

    let mut packet = [0u8; 48];
    packet[0] = 0b00_011_011; // LI=0, VN=3, Mode=3 (client)

    let t1 = SystemTime::now();
    socket.send(&packet).await?;

    let mut buf = [0u8; 48];
    timeout(QUERY_TIMEOUT, socket.recv(&mut buf)).await??;
    let t4 = SystemTime::now();

    let server_secs = u32::from_be_bytes(buf[40..44].try_into().unwrap()) as u64;
    let server_time = UNIX_EPOCH + StdDuration::from_secs(server_secs.saturating_sub(NTP_EPOCH_OFFSET_SECS));

    let local_mid = t1 + t4.duration_since(t1).unwrap_or_default() / 2;
    let (offset, offset_is_negative) = if server_time >= local_mid {
        (server_time.duration_since(local_mid).unwrap_or_default(), false)
    } else {
        (local_mid.duration_since(server_time).unwrap_or_default(), true)
    };

    Ok(NtpProbe { offset, offset_is_negative })
}

/// Spawns the periodic probe task. `max_diff` is the configured
/// tolerance (`ntpMaxDiff`); exceeding it only logs a warning, since
/// this daemon does not itself steer the system clock.
pub fn spawn(host: String, max_diff: StdDuration) {
    tokio::spawn(async move {
        loop {
            match query(&host).await {
                Ok(probe) => {
                    debug!(
                        "ntp offset against {} is {}{:?}",
                        host,
                        if probe.offset_is_negative { "-" } else { "+" },
                        probe.offset
                    );
                    if probe.offset > max_diff {
                        warn!(
                            "ntp offset against {} ({}{:?}) exceeds configured max {:?}",
                            host,
                            if probe.offset_is_negative { "-" } else { "+" },
                            probe.offset,
                            max_diff
                        );
                    }
                }
                Err(err) => warn!("ntp probe against {} failed: {}", host, err),
            }
            sleep(PROBE_INTERVAL).await;
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn probe_struct_distinguishes_sign() {
        let ahead = NtpProbe { offset: StdDuration::from_millis(50), offset_is_negative: false };
        let behind = NtpProbe { offset: StdDuration::from_millis(50), offset_is_negative: true };
        assert_ne!(ahead, behind);
    }
}
