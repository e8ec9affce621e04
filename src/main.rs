mod audio;
mod cloud;
mod console;
mod credentials;
mod display;
mod framebuffer;
mod led;
mod ota;
mod pipeline;
mod requests;
mod rtc;
mod sd;
mod settings;
mod time_sync;
mod touch;
mod ui;
mod wifi;

use anyhow::Result;
use embedded_graphics::geometry::OriginDimensions;
use esp_idf_hal::gpio::{AnyIOPin, IOPin, OutputPin};
use esp_idf_hal::i2c::{I2cConfig, I2cDriver};
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_hal::units::Hertz;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};
use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::audio::RecState;
use crate::framebuffer::Framebuffer;
use crate::led::{Status, StatusLed};
use crate::pipeline::{PipelineCommand, PipelineHandle, PipelineState};
use crate::settings::{NvsBackend, SettingsStore};
use crate::touch::{Gesture, TouchDriver, TouchState};
use crate::ui::{DemoMode, UiSnapshot};

// ── I2C ──────────────────────────────────────────────────────────────
const I2C_FREQ_HZ: u32 = 100_000;

// ── Timing ──────────────────────────────────────────────────────────
const TICK_MS: u64 = 50;
const TIME_UPDATE_TICKS: u32 = 20; // every second
const SETTINGS_SAVE_TICKS: u32 = 100; // every 5 seconds
const WIFI_RETRY_TICKS: u32 = 6_000; // every 5 minutes
const VOLUME_STEP: u8 = 10;

type SharedSettings = Arc<Mutex<SettingsStore<NvsBackend>>>;

/// Everything the main loop owns. Assembled once in main(); no file-scope
/// mutable state anywhere.
struct App {
    fb: Framebuffer,
    panel: display::Panel,
    backlight: display::Backlight,
    settings: SharedSettings,
    touch: TouchState,
    led: StatusLed,
    pipeline: Option<PipelineHandle>,
    rotation: u8,
    mode: DemoMode,
    wifi_ok: bool,
    sd_ok: bool,
    time_text: Option<String>,
    applied_brightness: u8,
    dirty: bool,
}

impl App {
    fn snapshot(&self) -> UiSnapshot {
        let stg = self.settings.lock().unwrap();
        let s = stg.get();
        let (state, transcript, reply, error) = match &self.pipeline {
            Some(p) => {
                let st = p.snapshot();
                (st.state, st.transcript, st.reply, st.error)
            }
            None => (
                PipelineState::Failed,
                String::new(),
                String::new(),
                "no cloud pipeline (check SD card and wifi)".to_string(),
            ),
        };
        let recording_pct = self.pipeline.as_ref().and_then(|p| {
            let rec = p.recording.lock().unwrap();
            if rec.state == RecState::Recording && rec.frames_expected > 0 {
                Some((rec.frames_captured * 100 / rec.frames_expected) as u8)
            } else {
                None
            }
        });
        UiSnapshot {
            device_name: s.device_name.clone(),
            time_text: self.time_text.clone(),
            wifi_ok: self.wifi_ok,
            sd_ok: self.sd_ok,
            mode: self.mode,
            state,
            transcript,
            reply,
            error,
            speaker_volume: s.speaker_volume,
            recording_pct,
        }
    }

    fn dispatch(&mut self, gesture: Gesture) {
        if !matches!(gesture, Gesture::None) && requests::is_on(&requests::DEBUG_TOUCH) {
            info!("gesture: {:?}", gesture);
        }
        match gesture {
            Gesture::None => return,
            Gesture::Tap { y, .. } => {
                if ui::in_record_zone(y as i32, self.fb.size().height) {
                    let busy = self
                        .pipeline
                        .as_ref()
                        .map(|p| p.state().is_busy())
                        .unwrap_or(true);
                    if busy {
                        info!("tap ignored, pipeline busy");
                    } else if let Some(p) = &self.pipeline {
                        let cmd = match self.mode {
                            DemoMode::Dictation => PipelineCommand::Dictate,
                            DemoMode::Translation => PipelineCommand::Translate,
                            DemoMode::Chat => PipelineCommand::Converse,
                        };
                        p.send(cmd);
                    }
                }
            }
            Gesture::SwipeLeft => {
                self.mode = self.mode.next();
                info!("mode: {}", self.mode.label());
            }
            Gesture::SwipeRight => {
                self.mode = self.mode.prev();
                info!("mode: {}", self.mode.label());
            }
            Gesture::SwipeUp | Gesture::SwipeDown => {
                let mut stg = self.settings.lock().unwrap();
                let cur = stg.get().speaker_volume;
                let new = if matches!(gesture, Gesture::SwipeUp) {
                    cur.saturating_add(VOLUME_STEP).min(100)
                } else {
                    cur.saturating_sub(VOLUME_STEP)
                };
                stg.set_speaker_volume(new);
                drop(stg);
                if let Some(p) = &self.pipeline {
                    p.set_speaker_volume(new);
                }
                info!("speaker volume: {}%", new);
            }
        }
        self.dirty = true;
    }

    fn led_status(&self) -> Status {
        if let Some(p) = &self.pipeline {
            match p.state() {
                PipelineState::Failed => return Status::Error,
                PipelineState::Recording => return Status::Recording,
                s if s.is_busy() => return Status::Updating,
                _ => {}
            }
        }
        if self.wifi_ok && self.sd_ok {
            Status::Ready
        } else {
            Status::Degraded
        }
    }

    fn run_update_check(&mut self) {
        if !self.sd_ok {
            warn!("update: no SD card mounted");
            return;
        }
        self.led.set(Status::Updating);
        ui::draw_splash(&mut self.fb, "updating firmware...");
        self.fb.flush_to_panel(self.panel.panel, self.rotation);
        match ota::update_from_sd() {
            Ok(true) => {
                info!("update applied, restarting");
                std::thread::sleep(Duration::from_millis(200));
                unsafe { esp_idf_sys::esp_restart() };
            }
            Ok(false) => info!("update: no image on SD card"),
            Err(e) => warn!("update failed: {:#}", e),
        }
        self.dirty = true;
    }
}

fn main() -> Result<()> {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    info!("Watt-IZ demo firmware starting");

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;

    // Settings first; rotation and brightness shape everything after.
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs = EspNvs::new(nvs_partition, settings::NS, true)?;
    let settings: SharedSettings = Arc::new(Mutex::new(SettingsStore::initialize(
        NvsBackend(nvs),
    )?));
    let (rotation, brightness, spk_volume, mic_volume) = {
        let stg = settings.lock().unwrap();
        let s = stg.get();
        (s.rotation, s.brightness, s.speaker_volume, s.mic_volume)
    };

    // Display up early so boot progress is visible.
    let panel = display::init_panel()?;
    let mut backlight = display::Backlight::new(
        peripherals.ledc.timer0,
        peripherals.ledc.channel0,
        peripherals.pins.gpio15.downgrade_output(),
    )?;
    backlight.set_brightness(brightness)?;
    let mut fb = Framebuffer::new(rotation);
    ui::draw_splash(&mut fb, "starting...");
    fb.flush_to_panel(panel.panel, rotation);

    // SD card (degraded without it: no credentials, no OTA, no recordings)
    let mut sd_spi = peripherals.spi3;
    let mut sd_sclk: AnyIOPin = peripherals.pins.gpio39.downgrade();
    let mut sd_mosi: AnyIOPin = peripherals.pins.gpio40.downgrade();
    let mut sd_miso: AnyIOPin = peripherals.pins.gpio41.downgrade();
    let mut sd_cs: AnyIOPin = peripherals.pins.gpio38.downgrade();
    let _sd_fs = match sd::mount(&mut sd_spi, &mut sd_sclk, &mut sd_mosi, &mut sd_miso, &mut sd_cs)
    {
        Ok(fs) => Some(fs),
        Err(e) => {
            warn!("sd: unavailable, running degraded: {:#}", e);
            None
        }
    };
    let sd_ok = _sd_fs.is_some();

    let creds = if sd_ok {
        match credentials::Credentials::load(credentials::PATH) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("credentials: {:#}", e);
                if let Err(e) = credentials::Credentials::write_template(credentials::PATH) {
                    warn!("credentials: template write failed: {:#}", e);
                }
                None
            }
        }
    } else {
        None
    };

    // I2C bus shared by touch and RTC
    let i2c_config = I2cConfig::new().baudrate(Hertz(I2C_FREQ_HZ));
    let mut i2c = I2cDriver::new(
        peripherals.i2c0,
        peripherals.pins.gpio8,
        peripherals.pins.gpio9,
        &i2c_config,
    )?;

    let touch_state = TouchState::new(TouchDriver::probe(&mut i2c));

    let rtc_ok = rtc::probe(&mut i2c);
    if rtc_ok {
        if let Err(e) = rtc::seed_system_clock(&mut i2c) {
            warn!("rtc: {:#}", e);
        }
    } else {
        warn!("rtc: DS3231 not found");
    }

    // WiFi: SD credentials win, NVS settings are the fallback
    ui::draw_splash(&mut fb, "connecting wifi...");
    fb.flush_to_panel(panel.panel, rotation);
    let (wifi_ssid, wifi_pass) = {
        let stg = settings.lock().unwrap();
        let s = stg.get();
        match &creds {
            Some(c) if !c.wifi.ssid.is_empty() => (c.wifi.ssid.clone(), c.wifi.password.clone()),
            _ => (s.wifi_ssid.clone(), s.wifi_pass.clone()),
        }
    };
    let mut wifi_ok = false;
    let mut wifi_handle = None;
    if wifi_ssid.is_empty() {
        warn!("wifi: no SSID configured (console: wifi set <ssid> <pass>)");
    } else {
        let result = wifi::connect(peripherals.modem, sysloop.clone(), &wifi_ssid, &wifi_pass)?;
        wifi_ok = result.connected;
        wifi_handle = Some(result.wifi);
    }

    // Time: SNTP when online, then write the synced time back into the RTC
    let mut _sntp = None;
    if wifi_ok {
        let tz = {
            let stg = settings.lock().unwrap();
            time_sync::posix_tz(stg.get().tz_offset_minutes)
        };
        match time_sync::sync_time(&tz) {
            Ok((sntp, synced)) => {
                if synced && rtc_ok {
                    if let Err(e) = rtc::store_system_clock(&mut i2c) {
                        warn!("rtc: {:#}", e);
                    }
                }
                _sntp = Some(sntp);
            }
            Err(e) => warn!("sntp: {:#}", e),
        }
    }

    let mut led = StatusLed::new(peripherals.rmt.channel0, peripherals.pins.gpio48);
    led.set(Status::Boot);

    // Boot-time firmware check: /sdcard/firmware.bin, renamed .used after
    if sd_ok {
        ui::draw_splash(&mut fb, "checking for updates...");
        fb.flush_to_panel(panel.panel, rotation);
        led.set(Status::Updating);
        match ota::update_from_sd() {
            Ok(true) => {
                info!("update applied, restarting");
                std::thread::sleep(Duration::from_millis(200));
                unsafe { esp_idf_sys::esp_restart() };
            }
            Ok(false) => {}
            Err(e) => warn!("update failed: {:#}", e),
        }
    }

    // Cloud pipeline worker (needs credentials and SD for the WAV files)
    let pipeline = if let (Some(creds), true) = (&creds, sd_ok) {
        let recorder = audio::Recorder::new(
            peripherals.i2s0,
            peripherals.pins.gpio4,
            peripherals.pins.gpio5,
            peripherals.pins.gpio6,
        )?;
        let player = audio::Player::new(
            peripherals.i2s1,
            peripherals.pins.gpio16,
            peripherals.pins.gpio17,
            peripherals.pins.gpio18,
        )?;
        Some(pipeline::spawn(
            creds.services.clone(),
            recorder,
            player,
            spk_volume,
            mic_volume,
        )?)
    } else {
        warn!("pipeline: disabled (missing credentials or SD card)");
        None
    };

    console::spawn_console(settings.clone());

    let mut app = App {
        fb,
        panel,
        backlight,
        settings,
        touch: touch_state,
        led,
        pipeline,
        rotation,
        mode: DemoMode::Dictation,
        wifi_ok,
        sd_ok,
        time_text: None,
        applied_brightness: brightness,
        dirty: true,
    };
    app.led.set(app.led_status());
    info!("boot complete, entering main loop");

    let mut tick: u32 = 0;
    let mut last_pipeline_state = PipelineState::Idle;
    loop {
        let now_ms = (unsafe { esp_idf_sys::esp_timer_get_time() } / 1000) as u32;

        let gesture = app.touch.poll(&mut i2c, now_ms, app.rotation);
        app.dispatch(gesture);

        // Pipeline/recording state changes drive redraw and the LED
        if let Some(p) = &app.pipeline {
            let state = p.state();
            if state != last_pipeline_state {
                last_pipeline_state = state;
                app.dirty = true;
            } else if state == PipelineState::Recording {
                // progress percentage moves without a state change
                app.dirty = true;
            }
        }
        let led_status = app.led_status();
        if led_status != app.led.current() {
            app.led.set(led_status);
        }

        if tick % TIME_UPDATE_TICKS == 0 {
            let clock_24h = app.settings.lock().unwrap().get().clock_24h;
            let text = time_sync::format_local_time(clock_24h);
            if text != app.time_text {
                app.time_text = text;
                app.dirty = true;
            }
        }

        // Console-originated requests
        if requests::take(&requests::REQUEST_UPDATE_CHECK) {
            app.run_update_check();
        }

        // Periodic reconnect while offline; blocking, but nothing else is
        // pending when the link is down.
        if !app.wifi_ok && tick > 0 && tick % WIFI_RETRY_TICKS == 0 {
            if let Some(wifi) = wifi_handle.as_mut() {
                match wifi::reconnect_existing(wifi, sysloop.clone()) {
                    Ok(Some(ip)) => {
                        info!("wifi: back online at {}", ip);
                        app.wifi_ok = true;
                        app.dirty = true;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("wifi: reconnect failed: {:#}", e),
                }
            }
        }

        // Brightness applies immediately; rotation needs a reboot
        {
            let brightness = app.settings.lock().unwrap().get().brightness;
            if brightness != app.applied_brightness {
                app.backlight.set_brightness(brightness)?;
                app.applied_brightness = brightness;
            }
        }

        // Opportunistic save: only while nothing latency-sensitive runs
        if tick % SETTINGS_SAVE_TICKS == 0 {
            let idle = app
                .pipeline
                .as_ref()
                .map(|p| !p.state().is_busy())
                .unwrap_or(true);
            if idle {
                let mut stg = app.settings.lock().unwrap();
                if stg.is_changed() {
                    if let Err(e) = stg.save(false) {
                        warn!("settings: save failed: {:#}", e);
                    }
                }
            }
        }

        if app.dirty {
            let snap = app.snapshot();
            ui::draw_main(&mut app.fb, &snap);
            app.fb.flush_to_panel(app.panel.panel, app.rotation);
            app.dirty = false;
        }

        tick = tick.wrapping_add(1);
        std::thread::sleep(Duration::from_millis(TICK_MS));
    }
}
