use esp_idf_hal::gpio::OutputPin;
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::rmt::RmtChannel;
use log::warn;
use smart_leds::{SmartLedsWrite, RGB8};
use ws2812_esp32_rmt_driver::Ws2812Esp32Rmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Boot,
    Ready,
    Degraded,
    Updating,
    Recording,
    Error,
}

impl Status {
    // Dim values; the pixel sits next to the display.
    fn color(self) -> RGB8 {
        match self {
            Status::Boot => RGB8::new(0, 0, 24),
            Status::Ready => RGB8::new(0, 24, 0),
            Status::Degraded => RGB8::new(24, 12, 0),
            Status::Updating => RGB8::new(16, 0, 24),
            Status::Recording => RGB8::new(24, 24, 0),
            Status::Error => RGB8::new(24, 0, 0),
        }
    }
}

/// Single WS2812 status pixel. Init failure is tolerated: `set` becomes a
/// no-op so the rest of boot proceeds.
pub struct StatusLed {
    driver: Option<Ws2812Esp32Rmt<'static>>,
    current: Status,
}

impl StatusLed {
    pub fn new(
        channel: impl Peripheral<P = impl RmtChannel> + 'static,
        pin: impl Peripheral<P = impl OutputPin> + 'static,
    ) -> Self {
        let driver = match Ws2812Esp32Rmt::new(channel, pin) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!("led: init failed, running without status LED: {:?}", e);
                None
            }
        };
        Self {
            driver,
            current: Status::Boot,
        }
    }

    pub fn set(&mut self, status: Status) {
        self.current = status;
        if let Some(driver) = self.driver.as_mut() {
            if let Err(e) = driver.write([status.color()].into_iter()) {
                warn!("led: write failed: {:?}", e);
            }
        }
    }

    pub fn current(&self) -> Status {
        self.current
    }
}
