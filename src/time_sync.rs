use anyhow::Result;
use esp_idf_svc::sntp::{EspSntp, OperatingMode, SntpConf, SyncMode, SyncStatus};
use log::info;
use std::thread;
use std::time::Duration;

const SNTP_SERVER: &str = "pool.ntp.org";
const SYNC_TIMEOUT_MS: u32 = 20_000;
const POLL_INTERVAL_MS: u32 = 250;

/// POSIX TZ string for a fixed UTC offset in minutes. POSIX inverts the
/// sign: UTC+8 is "UTC-8".
pub fn posix_tz(offset_minutes: i16) -> String {
    let total = -(offset_minutes as i32);
    let sign = if total < 0 { "-" } else { "+" };
    let abs = total.abs();
    let hours = abs / 60;
    let mins = abs % 60;
    if mins == 0 {
        format!("UTC{}{}", sign, hours)
    } else {
        format!("UTC{}{}:{:02}", sign, hours, mins)
    }
}

/// Start SNTP time synchronization with the given POSIX timezone string.
///
/// Sets the TZ environment variable, then creates an SNTP client that polls
/// pool.ntp.org. Waits up to 20 seconds for an initial sync before returning.
/// The returned EspSntp must be kept alive to maintain periodic re-sync.
pub fn sync_time(tz: &str) -> Result<(EspSntp<'static>, bool)> {
    info!("Setting timezone: {}", tz);
    std::env::set_var("TZ", tz);

    let conf = SntpConf {
        servers: [SNTP_SERVER, "time.nist.gov"],
        sync_mode: SyncMode::Immediate,
        operating_mode: OperatingMode::Poll,
    };

    info!("Starting SNTP sync with {}", SNTP_SERVER);
    let sntp = EspSntp::new_with_callback(&conf, |_| {
        info!("SNTP sync callback triggered");
    })?;

    let mut elapsed_ms = 0u32;
    while elapsed_ms < SYNC_TIMEOUT_MS {
        if sntp.get_sync_status() == SyncStatus::Completed {
            info!("SNTP time synchronized after {}ms", elapsed_ms);
            if let Some(t) = format_local_time(true) {
                info!("Current local time: {}", t);
            }
            return Ok((sntp, true));
        }
        thread::sleep(Duration::from_millis(POLL_INTERVAL_MS as u64));
        elapsed_ms += POLL_INTERVAL_MS;
    }

    log::warn!(
        "SNTP sync not completed within {}s, continuing anyway (will sync in background)",
        SYNC_TIMEOUT_MS / 1000
    );
    Ok((sntp, false))
}

/// "HH:MM" or "H:MM AM" depending on the clock-format setting.
pub fn format_hhmm(hour24: i32, minute: i32, clock_24h: bool) -> String {
    if clock_24h {
        return format!("{:02}:{:02}", hour24, minute);
    }
    let (hour12, ampm) = if hour24 == 0 {
        (12, "AM")
    } else if hour24 < 12 {
        (hour24, "AM")
    } else if hour24 == 12 {
        (12, "PM")
    } else {
        (hour24 - 12, "PM")
    };
    format!("{}:{:02} {}", hour12, minute, ampm)
}

/// Format the current local time, or None if the clock is not set.
pub fn format_local_time(clock_24h: bool) -> Option<String> {
    let mut now: libc::time_t = 0;
    unsafe {
        libc::time(&mut now);
    }
    // If time is near epoch, clock probably hasn't been set yet
    if now < 1_000_000_000 {
        return None;
    }
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    unsafe {
        libc::localtime_r(&now, &mut tm);
    }
    Some(format_hhmm(tm.tm_hour, tm.tm_min, clock_24h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posix_tz_inverts_sign() {
        assert_eq!(posix_tz(0), "UTC+0");
        assert_eq!(posix_tz(480), "UTC-8");
        assert_eq!(posix_tz(-300), "UTC+5");
        assert_eq!(posix_tz(330), "UTC-5:30");
        assert_eq!(posix_tz(-570), "UTC+9:30");
    }

    #[test]
    fn clock_formats() {
        assert_eq!(format_hhmm(0, 5, true), "00:05");
        assert_eq!(format_hhmm(0, 5, false), "12:05 AM");
        assert_eq!(format_hhmm(12, 0, false), "12:00 PM");
        assert_eq!(format_hhmm(13, 30, false), "1:30 PM");
        assert_eq!(format_hhmm(23, 59, true), "23:59");
    }
}
