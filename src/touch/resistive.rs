use anyhow::Result;
use esp_idf_hal::i2c::I2cDriver;
use log::{info, warn};

use super::{PANEL_HEIGHT, PANEL_WIDTH};

const ADC_UNIT: esp_idf_sys::adc_unit_t = esp_idf_sys::adc_unit_t_ADC_UNIT_1;
const X_CHANNEL: esp_idf_sys::adc_channel_t = esp_idf_sys::adc_channel_t_ADC_CHANNEL_3;
const Y_CHANNEL: esp_idf_sys::adc_channel_t = esp_idf_sys::adc_channel_t_ADC_CHANNEL_4;

/// Raw readings below this count as "not pressed"; the panel floats near
/// zero when idle.
const PRESS_THRESHOLD: i32 = 180;
const ADC_MAX: i32 = 4095;

fn esp_check(res: esp_idf_sys::esp_err_t, msg: &str) -> Result<()> {
    if res != esp_idf_sys::ESP_OK {
        Err(anyhow::anyhow!("{} (err {})", msg, res))
    } else {
        Ok(())
    }
}

/// Four-wire resistive panel read through two oneshot ADC channels.
pub struct TouchDriver {
    unit: esp_idf_sys::adc_oneshot_unit_handle_t,
}

impl TouchDriver {
    /// The `i2c` argument is unused by this strategy but keeps the call
    /// signature identical to the capacitive driver.
    pub fn probe(_i2c: &mut I2cDriver<'_>) -> Self {
        match Self::init_adc() {
            Ok(unit) => {
                info!("touch: resistive panel on ADC1 ch{}/ch{}", X_CHANNEL, Y_CHANNEL);
                Self { unit }
            }
            Err(e) => {
                warn!("touch: ADC init failed: {}", e);
                Self {
                    unit: std::ptr::null_mut(),
                }
            }
        }
    }

    fn init_adc() -> Result<esp_idf_sys::adc_oneshot_unit_handle_t> {
        let mut unit: esp_idf_sys::adc_oneshot_unit_handle_t = std::ptr::null_mut();
        let unit_cfg = esp_idf_sys::adc_oneshot_unit_init_cfg_t {
            unit_id: ADC_UNIT,
            clk_src: 0,
            ulp_mode: esp_idf_sys::adc_ulp_mode_t_ADC_ULP_MODE_DISABLE,
        };
        esp_check(
            unsafe { esp_idf_sys::adc_oneshot_new_unit(&unit_cfg, &mut unit) },
            "adc_oneshot_new_unit",
        )?;

        let chan_cfg = esp_idf_sys::adc_oneshot_chan_cfg_t {
            atten: esp_idf_sys::adc_atten_t_ADC_ATTEN_DB_12,
            bitwidth: esp_idf_sys::adc_bitwidth_t_ADC_BITWIDTH_12,
        };
        for channel in [X_CHANNEL, Y_CHANNEL] {
            esp_check(
                unsafe { esp_idf_sys::adc_oneshot_config_channel(unit, channel, &chan_cfg) },
                "adc_oneshot_config_channel",
            )?;
        }
        Ok(unit)
    }

    fn read_channel(&self, channel: esp_idf_sys::adc_channel_t) -> Option<i32> {
        let mut raw: i32 = 0;
        let res = unsafe { esp_idf_sys::adc_oneshot_read(self.unit, channel, &mut raw) };
        if res != esp_idf_sys::ESP_OK {
            return None;
        }
        Some(raw)
    }

    /// Read at most one point in raw portrait coordinates. Idle or failed
    /// reads are "not touched".
    pub fn read_point(&mut self, _i2c: &mut I2cDriver<'_>) -> Option<(i16, i16)> {
        if self.unit.is_null() {
            return None;
        }
        let rx = self.read_channel(X_CHANNEL)?;
        let ry = self.read_channel(Y_CHANNEL)?;
        if rx < PRESS_THRESHOLD || ry < PRESS_THRESHOLD {
            return None;
        }
        let x = (rx * (PANEL_WIDTH as i32 - 1) / ADC_MAX) as i16;
        let y = (ry * (PANEL_HEIGHT as i32 - 1) / ADC_MAX) as i16;
        Some((x, y))
    }
}
