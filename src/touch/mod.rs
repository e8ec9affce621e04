#[cfg(feature = "capacitive-touch")]
mod capacitive;
#[cfg(feature = "capacitive-touch")]
pub use capacitive::TouchDriver;

#[cfg(feature = "resistive-touch")]
mod resistive;
#[cfg(feature = "resistive-touch")]
pub use resistive::TouchDriver;

#[cfg(all(feature = "capacitive-touch", feature = "resistive-touch"))]
compile_error!("enable exactly one of `capacitive-touch` / `resistive-touch`");
#[cfg(not(any(feature = "capacitive-touch", feature = "resistive-touch")))]
compile_error!("enable exactly one of `capacitive-touch` / `resistive-touch`");

use esp_idf_hal::i2c::I2cDriver;
use log::debug;

/// Native (portrait) panel dimensions; raw controller coordinates live in
/// this space before remapping.
pub const PANEL_WIDTH: i16 = 320;
pub const PANEL_HEIGHT: i16 = 480;

const SWIPE_MIN_PX: i32 = 56;
const SWIPE_COOLDOWN_MS: u32 = 300;
const TAP_MAX_MOVE_PX: i32 = 18;

/// Map a raw portrait-space point into the rotated screen space.
///
/// rotation 0: `x = px`,                  `y = py`
/// rotation 1: `x = py`,                  `y = PANEL_WIDTH - 1 - px`
/// rotation 2: `x = PANEL_WIDTH - 1 - px`, `y = PANEL_HEIGHT - 1 - py`
/// rotation 3: `x = PANEL_HEIGHT - 1 - py`, `y = px`
pub fn remap(px: i16, py: i16, rotation: u8) -> (i16, i16) {
    match rotation & 3 {
        0 => (px, py),
        1 => (py, PANEL_WIDTH - 1 - px),
        2 => (PANEL_WIDTH - 1 - px, PANEL_HEIGHT - 1 - py),
        _ => (PANEL_HEIGHT - 1 - py, px),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gesture {
    None,
    Tap { x: i16, y: i16 },
    SwipeLeft,
    SwipeRight,
    SwipeUp,
    SwipeDown,
}

/// Press/release tracker over whichever driver is compiled in. At most one
/// point per poll; gestures are classified on release.
pub struct TouchState {
    driver: TouchDriver,
    pressed: bool,
    start_x: i16,
    start_y: i16,
    last_x: i16,
    last_y: i16,
    last_swipe_ms: u32,
}

impl TouchState {
    pub fn new(driver: TouchDriver) -> Self {
        Self {
            driver,
            pressed: false,
            start_x: 0,
            start_y: 0,
            last_x: 0,
            last_y: 0,
            last_swipe_ms: 0,
        }
    }

    pub fn poll(&mut self, i2c: &mut I2cDriver<'_>, now_ms: u32, rotation: u8) -> Gesture {
        if let Some((px, py)) = self.driver.read_point(i2c) {
            let (x, y) = remap(px, py, rotation);
            if !self.pressed {
                self.pressed = true;
                self.start_x = x;
                self.start_y = y;
                debug!("touch down at ({}, {})", x, y);
            }
            self.last_x = x;
            self.last_y = y;
            return Gesture::None;
        }

        if !self.pressed {
            return Gesture::None;
        }
        self.pressed = false;

        let dx = self.last_x as i32 - self.start_x as i32;
        let dy = self.last_y as i32 - self.start_y as i32;

        if dx.abs() <= TAP_MAX_MOVE_PX && dy.abs() <= TAP_MAX_MOVE_PX {
            debug!("touch tap at ({}, {})", self.last_x, self.last_y);
            return Gesture::Tap {
                x: self.last_x,
                y: self.last_y,
            };
        }

        if now_ms.wrapping_sub(self.last_swipe_ms) < SWIPE_COOLDOWN_MS {
            return Gesture::None;
        }

        let g = if dx.abs() >= dy.abs() && dx.abs() >= SWIPE_MIN_PX {
            if dx < 0 {
                Gesture::SwipeLeft
            } else {
                Gesture::SwipeRight
            }
        } else if dy.abs() >= SWIPE_MIN_PX {
            if dy < 0 {
                Gesture::SwipeUp
            } else {
                Gesture::SwipeDown
            }
        } else {
            Gesture::None
        };
        if g != Gesture::None {
            self.last_swipe_ms = now_ms;
            debug!("touch {:?}", g);
        }
        g
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_0_is_identity() {
        assert_eq!(remap(17, 250, 0), (17, 250));
    }

    #[test]
    fn rotation_1_swaps_and_mirrors_x() {
        assert_eq!(remap(17, 250, 1), (250, PANEL_WIDTH - 1 - 17));
        assert_eq!(remap(0, 0, 1), (0, PANEL_WIDTH - 1));
        assert_eq!(remap(PANEL_WIDTH - 1, PANEL_HEIGHT - 1, 1), (PANEL_HEIGHT - 1, 0));
    }

    #[test]
    fn rotation_2_mirrors_both_axes() {
        assert_eq!(
            remap(17, 250, 2),
            (PANEL_WIDTH - 1 - 17, PANEL_HEIGHT - 1 - 250)
        );
    }

    #[test]
    fn rotation_3_swaps_and_mirrors_y() {
        assert_eq!(remap(17, 250, 3), (PANEL_HEIGHT - 1 - 250, 17));
        assert_eq!(remap(0, 0, 3), (PANEL_HEIGHT - 1, 0));
    }

    #[test]
    fn rotation_wraps_modulo_four() {
        assert_eq!(remap(40, 60, 4), remap(40, 60, 0));
        assert_eq!(remap(40, 60, 7), remap(40, 60, 3));
    }
}
