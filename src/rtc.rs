use anyhow::{bail, Result};
use esp_idf_hal::delay::BLOCK;
use esp_idf_hal::i2c::I2cDriver;
use log::info;

/// DS3231 real-time clock.
pub const ADDR: u8 = 0x68;

const REG_SECONDS: u8 = 0x00;
const REG_TEMP_MSB: u8 = 0x11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16, // full year, 2000-2099
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

fn bcd2dec(v: u8) -> u8 {
    (v >> 4) * 10 + (v & 0x0F)
}

fn dec2bcd(v: u8) -> u8 {
    ((v / 10) << 4) | (v % 10)
}

/// Days since 1970-01-01 for a Gregorian civil date (valid for the
/// RTC's 2000-2099 range and well beyond).
fn days_from_civil(year: i32, month: u8, day: u8) -> i64 {
    let y = if month <= 2 { year - 1 } else { year } as i64;
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = month as i64;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

/// Unix timestamp for a UTC date/time.
pub fn unix_from_utc(dt: &DateTime) -> i64 {
    days_from_civil(dt.year as i32, dt.month, dt.day) * 86400
        + dt.hour as i64 * 3600
        + dt.minute as i64 * 60
        + dt.second as i64
}

pub fn probe(i2c: &mut I2cDriver) -> bool {
    let mut buf = [0u8; 1];
    i2c.write_read(ADDR, &[REG_SECONDS], &mut buf, BLOCK).is_ok()
}

/// Read the current UTC date/time from the chip.
pub fn read(i2c: &mut I2cDriver) -> Result<DateTime> {
    let mut regs = [0u8; 7];
    i2c.write_read(ADDR, &[REG_SECONDS], &mut regs, BLOCK)?;

    let dt = DateTime {
        second: bcd2dec(regs[0] & 0x7F),
        minute: bcd2dec(regs[1] & 0x7F),
        // bit 6 selects 12h mode; we always program 24h
        hour: bcd2dec(regs[2] & 0x3F),
        day: bcd2dec(regs[4] & 0x3F),
        month: bcd2dec(regs[5] & 0x1F),
        year: 2000 + bcd2dec(regs[6]) as u16,
    };
    if dt.month == 0 || dt.month > 12 || dt.day == 0 || dt.day > 31 {
        bail!("rtc returned implausible date {:?}", dt);
    }
    Ok(dt)
}

/// Program the chip with a UTC date/time (24-hour mode).
pub fn set(i2c: &mut I2cDriver, dt: &DateTime) -> Result<()> {
    if !(2000..=2099).contains(&dt.year) {
        bail!("rtc year {} out of range", dt.year);
    }
    let payload = [
        REG_SECONDS,
        dec2bcd(dt.second),
        dec2bcd(dt.minute),
        dec2bcd(dt.hour),
        1, // day-of-week, unused
        dec2bcd(dt.day),
        dec2bcd(dt.month),
        dec2bcd((dt.year - 2000) as u8),
    ];
    i2c.write(ADDR, &payload, BLOCK)?;
    Ok(())
}

/// Die temperature in 0.25 °C steps.
pub fn temperature_c(i2c: &mut I2cDriver) -> Result<f32> {
    let mut regs = [0u8; 2];
    i2c.write_read(ADDR, &[REG_TEMP_MSB], &mut regs, BLOCK)?;
    let raw = ((regs[0] as i8 as i16) << 2) | (regs[1] >> 6) as i16;
    Ok(raw as f32 * 0.25)
}

/// Seed the system clock from the RTC so timestamps are sane before (or
/// without) an SNTP sync.
pub fn seed_system_clock(i2c: &mut I2cDriver) -> Result<()> {
    let dt = read(i2c)?;
    let ts = unix_from_utc(&dt);
    let tv = libc::timeval {
        tv_sec: ts as libc::time_t,
        tv_usec: 0,
    };
    unsafe {
        libc::settimeofday(&tv, std::ptr::null());
    }
    info!(
        "rtc: system clock seeded to {:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
        dt.year, dt.month, dt.day, dt.hour, dt.minute, dt.second
    );
    Ok(())
}

/// Write the (SNTP-synced) system clock back into the RTC.
pub fn store_system_clock(i2c: &mut I2cDriver) -> Result<()> {
    let now = unsafe { libc::time(std::ptr::null_mut()) } as i64;
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    let t = now as libc::time_t;
    unsafe {
        libc::gmtime_r(&t, &mut tm);
    }
    let dt = DateTime {
        year: (tm.tm_year + 1900) as u16,
        month: (tm.tm_mon + 1) as u8,
        day: tm.tm_mday as u8,
        hour: tm.tm_hour as u8,
        minute: tm.tm_min as u8,
        second: tm.tm_sec as u8,
    };
    set(i2c, &dt)?;
    info!("rtc: stored synced time");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcd_round_trip() {
        for v in 0..=99u8 {
            assert_eq!(bcd2dec(dec2bcd(v)), v);
        }
        assert_eq!(dec2bcd(59), 0x59);
        assert_eq!(bcd2dec(0x23), 23);
    }

    #[test]
    fn epoch_is_zero() {
        let dt = DateTime {
            year: 1970,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        };
        // days_from_civil handles pre-2000 fine even though the chip can't
        assert_eq!(unix_from_utc(&dt), 0);
    }

    #[test]
    fn known_timestamps() {
        // 2000-03-01 00:00:00 UTC (leap-year boundary)
        let dt = DateTime {
            year: 2000,
            month: 3,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        };
        assert_eq!(unix_from_utc(&dt), 951_868_800);

        // 2026-08-24 12:34:56 UTC
        let dt = DateTime {
            year: 2026,
            month: 8,
            day: 24,
            hour: 12,
            minute: 34,
            second: 56,
        };
        assert_eq!(unix_from_utc(&dt), 1_787_574_896);
    }
}
