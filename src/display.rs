use anyhow::{anyhow, Result};
use esp_idf_hal::gpio::AnyOutputPin;
use esp_idf_hal::ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, CHANNEL0, TIMER0};
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::units::FromValueType;
use log::info;

use crate::framebuffer::{CHUNK_LINES, PANEL_WIDTH};

// ── Pins (Watt-IZ board wiring) ─────────────────────────────────────
const PIN_LCD_SCLK: i32 = 12;
const PIN_LCD_MOSI: i32 = 11;
const PIN_LCD_CS: i32 = 10;
const PIN_LCD_DC: i32 = 13;
const PIN_LCD_RST: i32 = 14;

const PCLK_HZ: u32 = 40_000_000;
const BACKLIGHT_PWM_HZ: u32 = 5_000;

fn esp_check(res: esp_idf_sys::esp_err_t, msg: &str) -> Result<()> {
    if res != esp_idf_sys::ESP_OK {
        Err(anyhow!("{} (err {})", msg, res))
    } else {
        Ok(())
    }
}

pub struct Panel {
    pub panel: esp_idf_sys::esp_lcd_panel_handle_t,
}

/// Bring up the SPI bus and the ST7789-class portrait panel through the
/// esp_lcd driver. The bus transfer size is bounded by the flush chunk.
pub fn init_panel() -> Result<Panel> {
    let mut bus_cfg = esp_idf_sys::spi_bus_config_t::default();
    bus_cfg.__bindgen_anon_1.mosi_io_num = PIN_LCD_MOSI;
    bus_cfg.__bindgen_anon_2.miso_io_num = -1;
    bus_cfg.__bindgen_anon_3.quadwp_io_num = -1;
    bus_cfg.__bindgen_anon_4.quadhd_io_num = -1;
    bus_cfg.sclk_io_num = PIN_LCD_SCLK;
    bus_cfg.max_transfer_sz = PANEL_WIDTH as i32 * CHUNK_LINES * 2;

    let host = esp_idf_sys::spi_host_device_t_SPI2_HOST;
    esp_check(
        unsafe {
            esp_idf_sys::spi_bus_initialize(
                host,
                &bus_cfg,
                esp_idf_sys::spi_common_dma_t_SPI_DMA_CH_AUTO,
            )
        },
        "spi_bus_initialize",
    )?;

    let mut io: esp_idf_sys::esp_lcd_panel_io_handle_t = std::ptr::null_mut();
    let io_cfg = esp_idf_sys::esp_lcd_panel_io_spi_config_t {
        cs_gpio_num: PIN_LCD_CS,
        dc_gpio_num: PIN_LCD_DC,
        spi_mode: 0,
        pclk_hz: PCLK_HZ,
        trans_queue_depth: 10,
        on_color_trans_done: None,
        user_ctx: std::ptr::null_mut(),
        lcd_cmd_bits: 8,
        lcd_param_bits: 8,
        flags: esp_idf_sys::esp_lcd_panel_io_spi_config_t__bindgen_ty_1 {
            _bitfield_align_1: [],
            _bitfield_1: esp_idf_sys::esp_lcd_panel_io_spi_config_t__bindgen_ty_1::new_bitfield_1(
                0, 0, 0, 0, 0, 0, 0, 0,
            ),
            __bindgen_padding_0: [0; 3],
        },
    };
    esp_check(
        unsafe {
            esp_idf_sys::esp_lcd_new_panel_io_spi(
                host as esp_idf_sys::esp_lcd_spi_bus_handle_t,
                &io_cfg,
                &mut io,
            )
        },
        "esp_lcd_new_panel_io_spi",
    )?;

    let mut panel: esp_idf_sys::esp_lcd_panel_handle_t = std::ptr::null_mut();
    let panel_cfg = esp_idf_sys::esp_lcd_panel_dev_config_t {
        reset_gpio_num: PIN_LCD_RST,
        __bindgen_anon_1: esp_idf_sys::esp_lcd_panel_dev_config_t__bindgen_ty_1 {
            rgb_ele_order: esp_idf_sys::lcd_rgb_element_order_t_LCD_RGB_ELEMENT_ORDER_RGB,
        },
        data_endian: esp_idf_sys::lcd_rgb_data_endian_t_LCD_RGB_DATA_ENDIAN_BIG,
        bits_per_pixel: 16,
        flags: esp_idf_sys::esp_lcd_panel_dev_config_t__bindgen_ty_2 {
            _bitfield_align_1: [],
            _bitfield_1: esp_idf_sys::esp_lcd_panel_dev_config_t__bindgen_ty_2::new_bitfield_1(0),
            __bindgen_padding_0: [0; 3],
        },
        vendor_config: std::ptr::null_mut(),
    };
    esp_check(
        unsafe { esp_idf_sys::esp_lcd_new_panel_st7789(io, &panel_cfg, &mut panel) },
        "esp_lcd_new_panel_st7789",
    )?;

    esp_check(unsafe { esp_idf_sys::esp_lcd_panel_reset(panel) }, "panel_reset")?;
    esp_check(unsafe { esp_idf_sys::esp_lcd_panel_init(panel) }, "panel_init")?;
    esp_check(
        unsafe { esp_idf_sys::esp_lcd_panel_invert_color(panel, true) },
        "panel_invert_color",
    )?;
    esp_check(
        unsafe { esp_idf_sys::esp_lcd_panel_disp_on_off(panel, true) },
        "panel_disp_on",
    )?;

    info!("display: panel initialized");
    Ok(Panel { panel })
}

/// PWM backlight; duty follows the brightness setting.
pub struct Backlight {
    driver: LedcDriver<'static>,
}

impl Backlight {
    pub fn new(
        timer: impl Peripheral<P = TIMER0> + 'static,
        channel: impl Peripheral<P = CHANNEL0> + 'static,
        pin: AnyOutputPin,
    ) -> Result<Self> {
        let timer_driver = LedcTimerDriver::new(
            timer,
            &TimerConfig::default().frequency(BACKLIGHT_PWM_HZ.Hz().into()),
        )?;
        let driver = LedcDriver::new(channel, timer_driver, pin)?;
        Ok(Self { driver })
    }

    pub fn set_brightness(&mut self, pct: u8) -> Result<()> {
        let pct = pct.min(100) as u32;
        let duty = self.driver.get_max_duty() * pct / 100;
        self.driver.set_duty(duty)?;
        Ok(())
    }
}
