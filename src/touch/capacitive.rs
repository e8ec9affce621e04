use esp_idf_hal::i2c::I2cDriver;
use log::{debug, info, warn};

/// FT6336-class capacitive controller.
const TOUCH_ADDR: u8 = 0x38;

/// Touch-point count register; coordinate bytes follow immediately.
const REG_TD_STATUS: u8 = 0x02;
const REG_CHIP_VENDOR: u8 = 0xA8;

const I2C_TIMEOUT_MS: u32 = 50;

pub struct TouchDriver {
    present: bool,
}

impl TouchDriver {
    /// One-shot probe; a missing controller degrades to a touchless UI
    /// rather than an error.
    pub fn probe(i2c: &mut I2cDriver<'_>) -> Self {
        let mut id = [0u8];
        let present = i2c
            .write_read(TOUCH_ADDR, &[REG_CHIP_VENDOR], &mut id, I2C_TIMEOUT_MS)
            .is_ok();
        if present {
            info!("touch: capacitive controller at 0x{:02X} (vendor 0x{:02X})", TOUCH_ADDR, id[0]);
        } else {
            warn!("touch: no controller at 0x{:02X}", TOUCH_ADDR);
        }
        Self { present }
    }

    /// Read at most one point in raw portrait coordinates. A failed or short
    /// read means "not touched", never an error.
    pub fn read_point(&mut self, i2c: &mut I2cDriver<'_>) -> Option<(i16, i16)> {
        if !self.present {
            return None;
        }
        // count(1) + XH XL YH YL for the first point
        let mut data = [0u8; 5];
        i2c.write_read(TOUCH_ADDR, &[REG_TD_STATUS], &mut data, I2C_TIMEOUT_MS)
            .ok()?;

        let points = data[0] & 0x0F;
        if points == 0 || points > 2 {
            return None;
        }

        let x = (((data[1] & 0x0F) as i16) << 8) | data[2] as i16;
        let y = (((data[3] & 0x0F) as i16) << 8) | data[4] as i16;
        debug!("touch raw ({}, {})", x, y);
        Some((x, y))
    }
}
