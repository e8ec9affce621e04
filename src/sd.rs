use anyhow::{Context, Result};
use esp_idf_hal::gpio::AnyIOPin;
use esp_idf_hal::spi::{config::DriverConfig, SpiDriver, SPI3};
use esp_idf_svc::fs::fatfs::Fatfs;
use esp_idf_svc::io::vfs::MountedFatfs;
use esp_idf_svc::sd::{spi::SdSpiHostDriver, SdCardConfiguration, SdCardDriver};
use log::{info, warn};

pub const MOUNT_POINT: &str = "/sdcard";

const MOUNT_ATTEMPTS: u32 = 3;
const MAX_OPEN_FILES: usize = 4;
const RETRY_DELAY_MS: u64 = 500;

pub type SdFs<'d> = MountedFatfs<Fatfs<SdCardDriver<SdSpiHostDriver<'d, SpiDriver<'d>>>>>;

fn try_mount<'d>(
    spi: impl esp_idf_hal::peripheral::Peripheral<P = SPI3> + 'd,
    sclk: impl esp_idf_hal::peripheral::Peripheral<P = AnyIOPin> + 'd,
    mosi: impl esp_idf_hal::peripheral::Peripheral<P = AnyIOPin> + 'd,
    miso: impl esp_idf_hal::peripheral::Peripheral<P = AnyIOPin> + 'd,
    cs: impl esp_idf_hal::peripheral::Peripheral<P = AnyIOPin> + 'd,
) -> Result<SdFs<'d>> {
    let spi_driver = SpiDriver::new(spi, sclk, mosi, Some(miso), &DriverConfig::default())?;
    let host_driver = SdSpiHostDriver::new(
        spi_driver,
        Some(cs),
        AnyIOPin::none(),
        AnyIOPin::none(),
        AnyIOPin::none(),
        None,
    )?;
    let card_driver = SdCardDriver::new_spi(host_driver, &SdCardConfiguration::new())?;
    let mounted = MountedFatfs::mount(Fatfs::new_sdcard(0, card_driver)?, MOUNT_POINT, MAX_OPEN_FILES)?;
    Ok(mounted)
}

/// Mount the SD card, retrying up to three times with an unmount between
/// attempts. After the last failure the card is treated as absent and every
/// SD-backed feature runs degraded.
pub fn mount<'d>(
    spi: &'d mut SPI3,
    sclk: &'d mut AnyIOPin,
    mosi: &'d mut AnyIOPin,
    miso: &'d mut AnyIOPin,
    cs: &'d mut AnyIOPin,
) -> Result<SdFs<'d>> {
    for attempt in 1..MOUNT_ATTEMPTS {
        match try_mount(&mut *spi, &mut *sclk, &mut *mosi, &mut *miso, &mut *cs) {
            Ok(fs) => {
                // Dropping unmounts; the final attempt below takes ownership
                // of the borrows for the lifetime of the filesystem.
                drop(fs);
                break;
            }
            Err(e) => {
                warn!("sd: mount attempt {}/{} failed: {}", attempt, MOUNT_ATTEMPTS, e);
                std::thread::sleep(std::time::Duration::from_millis(RETRY_DELAY_MS));
            }
        }
    }
    let fs = try_mount(spi, sclk, mosi, miso, cs).context("mounting SD card")?;
    info!("sd: mounted at {}", MOUNT_POINT);
    Ok(fs)
}

/// Directory listing for the console's `sd ls`.
pub fn list_dir(path: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let suffix = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            "/"
        } else {
            ""
        };
        names.push(format!("{}{}", entry.file_name().to_string_lossy(), suffix));
    }
    names.sort();
    Ok(names)
}
