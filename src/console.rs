use anyhow::Result;
use log::{info, warn};
use std::io::{self, Read};
use std::sync::{Arc, Mutex};

use crate::requests;
use crate::sd;
use crate::settings::{NvsBackend, SettingsStore};

type SharedSettings = Arc<Mutex<SettingsStore<NvsBackend>>>;

pub fn spawn_console(settings: SharedSettings) {
    std::thread::Builder::new()
        .name("console".into())
        .stack_size(8192)
        .spawn(move || {
            info!("console: ready (type 'help') — use minicom Ctrl+A E for local echo");
            let stdin = io::stdin();
            let mut reader = stdin.lock();
            let mut line = String::new();
            let mut buf = [0u8; 1];
            let mut in_escape = false;
            loop {
                match reader.read(&mut buf) {
                    Ok(1) => {
                        let ch = buf[0];
                        if in_escape {
                            if (ch as char).is_ascii_alphabetic() || ch == b'~' {
                                in_escape = false;
                            }
                            continue;
                        }
                        if ch == 0x1b {
                            in_escape = true;
                            continue;
                        }
                        if ch == b'\n' || ch == b'\r' {
                            if line.is_empty() {
                                continue;
                            }
                            info!("> {}", line);
                            if let Err(e) = process_line(&line, &settings) {
                                warn!("console: error: {}", e);
                            }
                            line.clear();
                        } else if ch == 0x7f || ch == 0x08 {
                            line.pop();
                        } else if ch >= 0x20 {
                            line.push(ch as char);
                        }
                    }
                    Ok(_) => {
                        std::thread::sleep(std::time::Duration::from_millis(50));
                    }
                    Err(_) => {
                        std::thread::sleep(std::time::Duration::from_millis(100));
                    }
                }
            }
        })
        .expect("failed to spawn console thread");
}

fn process_line(line: &str, settings: &SharedSettings) -> Result<()> {
    let clean = line.trim().trim_end_matches('\\');
    if clean.is_empty() {
        return Ok(());
    }
    let mut parts = clean.splitn(3, char::is_whitespace);
    let cmd = parts.next().unwrap_or("");
    let sub = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    match cmd {
        "help" | "?" => print_help(),
        "status" => show_status(settings),
        "name" => handle_name(sub, rest, settings)?,
        "wifi" => handle_wifi(sub, rest, settings)?,
        "brightness" => handle_brightness(sub, settings)?,
        "volume" => handle_volume(sub, rest, settings)?,
        "rotation" => handle_rotation(sub, settings)?,
        "clock" => handle_clock(sub, settings)?,
        "tz" => handle_tz(sub, settings)?,
        "save" => {
            settings.lock().unwrap().save(false)?;
            info!("settings saved");
        }
        "reset" => {
            let mut stg = settings.lock().unwrap();
            stg.reset_to_defaults();
            stg.save(false)?;
            info!("settings reset to defaults (saved)");
        }
        "update" => {
            info!("update: check requested (will run on next tick)");
            requests::set(&requests::REQUEST_UPDATE_CHECK, true);
        }
        "sd" => handle_sd(sub, rest),
        "debug" => handle_debug(sub),
        "reboot" => {
            info!("console: rebooting now");
            std::thread::sleep(std::time::Duration::from_millis(100));
            unsafe { esp_idf_sys::esp_restart() };
        }
        _ => {
            warn!("console: unknown command '{}' (type 'help')", cmd);
        }
    }
    Ok(())
}

fn print_help() {
    info!("commands:");
    info!("  status                     - show system status");
    info!("  name set <text>            - set device name");
    info!("  wifi show                  - show Wi-Fi config");
    info!("  wifi set <ssid> <pass>     - set Wi-Fi credentials");
    info!("  brightness <0-100>         - set backlight brightness");
    info!("  volume spk|mic <0-100>     - set speaker/mic volume");
    info!("  rotation <0-3>             - set display rotation");
    info!("  clock 12|24                - set clock format");
    info!("  tz <minutes>               - set UTC offset in minutes");
    info!("  save                       - persist settings to NVS");
    info!("  reset                      - restore default settings");
    info!("  update                     - check SD card for firmware.bin");
    info!("  sd ls [path]               - list SD card directory");
    info!("  debug <module>             - toggle debug for module");
    info!("    modules: touch, cloud, audio, all");
    info!("  debug show                 - show debug flag status");
    info!("  reboot                     - reboot device");
}

fn show_status(settings: &SharedSettings) {
    let stg = settings.lock().unwrap();
    let s = stg.get();
    info!("device name: {}", s.device_name);
    info!(
        "wifi: {}",
        if s.wifi_ssid.is_empty() { "not configured" } else { &s.wifi_ssid }
    );
    info!("brightness: {}%", s.brightness);
    info!("rotation: {}", s.rotation);
    info!("tz offset: {} min", s.tz_offset_minutes);
    info!("clock: {}", if s.clock_24h { "24h" } else { "12h" });
    info!("volume: spk {}% mic {}%", s.speaker_volume, s.mic_volume);
    info!("unsaved changes: {}", stg.is_changed());
    let heap_kb = unsafe { esp_idf_sys::esp_get_free_heap_size() } / 1024;
    info!("free heap: {} KB", heap_kb);
    info!("debug: {}", requests::status_line());
}

fn handle_name(sub: &str, rest: &str, settings: &SharedSettings) -> Result<()> {
    match sub {
        "" | "show" => {
            info!("device name: {}", settings.lock().unwrap().get().device_name);
        }
        "set" => {
            let name = rest.trim_matches('"').trim_matches('\'');
            if name.is_empty() {
                warn!("usage: name set <text>");
                return Ok(());
            }
            settings.lock().unwrap().set_device_name(name);
            info!("device name set: {} (type 'save' to persist)", name);
        }
        _ => info!("usage: name show|set <text>"),
    }
    Ok(())
}

fn handle_wifi(sub: &str, rest: &str, settings: &SharedSettings) -> Result<()> {
    match sub {
        "" | "show" => {
            let stg = settings.lock().unwrap();
            let s = stg.get();
            info!("wifi ssid: {}", s.wifi_ssid);
            let pass_len = s.wifi_pass.len();
            info!(
                "wifi pass: {} ({} chars)",
                if pass_len == 0 { "<empty>" } else { "********" },
                pass_len
            );
        }
        "set" => {
            let (ssid, pass) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let ssid = ssid.trim_matches('"').trim_matches('\'');
            let pass = pass.trim().trim_matches('"').trim_matches('\'');
            if ssid.is_empty() {
                warn!("usage: wifi set <ssid> <password>");
                return Ok(());
            }
            let mut stg = settings.lock().unwrap();
            stg.set_wifi(ssid, pass);
            stg.save(false)?;
            info!("saved: SSID='{}' pass=******** ({} chars)", ssid, pass.len());
            info!("type 'reboot' to apply");
        }
        _ => info!("usage: wifi show|set <ssid> <pass>"),
    }
    Ok(())
}

fn handle_brightness(sub: &str, settings: &SharedSettings) -> Result<()> {
    match sub.parse::<u8>() {
        Ok(pct) => {
            settings.lock().unwrap().set_brightness(pct);
            info!("brightness: {}% (applied on next tick)", pct.min(100));
        }
        Err(_) => info!("usage: brightness <0-100>"),
    }
    Ok(())
}

fn handle_volume(sub: &str, rest: &str, settings: &SharedSettings) -> Result<()> {
    let Ok(pct) = rest.parse::<u8>() else {
        info!("usage: volume spk|mic <0-100>");
        return Ok(());
    };
    match sub {
        "spk" | "speaker" => {
            settings.lock().unwrap().set_speaker_volume(pct);
            info!("speaker volume: {}%", pct.min(100));
        }
        "mic" => {
            settings.lock().unwrap().set_mic_volume(pct);
            info!("mic volume: {}%", pct.min(100));
        }
        _ => info!("usage: volume spk|mic <0-100>"),
    }
    Ok(())
}

fn handle_rotation(sub: &str, settings: &SharedSettings) -> Result<()> {
    match sub.parse::<u8>() {
        Ok(r) if r < 4 => {
            settings.lock().unwrap().set_rotation(r);
            info!("rotation: {} (type 'save' then 'reboot' to apply)", r);
        }
        _ => info!("usage: rotation <0-3>"),
    }
    Ok(())
}

fn handle_clock(sub: &str, settings: &SharedSettings) -> Result<()> {
    match sub {
        "24" => {
            settings.lock().unwrap().set_clock_24h(true);
            info!("clock: 24h");
        }
        "12" => {
            settings.lock().unwrap().set_clock_24h(false);
            info!("clock: 12h");
        }
        _ => info!("usage: clock 12|24"),
    }
    Ok(())
}

fn handle_tz(sub: &str, settings: &SharedSettings) -> Result<()> {
    match sub.parse::<i16>() {
        Ok(minutes) => {
            settings.lock().unwrap().set_tz_offset(minutes);
            info!("tz offset: {} min", minutes);
        }
        Err(_) => info!("usage: tz <minutes, e.g. -300 or 480>"),
    }
    Ok(())
}

fn handle_sd(sub: &str, rest: &str) {
    match sub {
        "ls" => {
            let path = if rest.is_empty() { sd::MOUNT_POINT } else { rest };
            match sd::list_dir(path) {
                Ok(names) if names.is_empty() => info!("{}: empty", path),
                Ok(names) => {
                    for name in names {
                        info!("  {}", name);
                    }
                }
                Err(e) => warn!("sd ls {}: {}", path, e),
            }
        }
        _ => info!("usage: sd ls [path]"),
    }
}

fn handle_debug(sub: &str) {
    use crate::requests::*;
    match sub {
        "show" | "" => {
            info!("debug: {}", status_line());
        }
        "touch" => {
            let on = toggle(&DEBUG_TOUCH);
            info!("debug touch: {}", if on { "ON" } else { "OFF" });
        }
        "cloud" => {
            let on = toggle(&DEBUG_CLOUD);
            info!("debug cloud: {}", if on { "ON" } else { "OFF" });
        }
        "audio" => {
            let on = toggle(&DEBUG_AUDIO);
            info!("debug audio: {}", if on { "ON" } else { "OFF" });
        }
        "all" => {
            // If any flag is off, turn all on; if all on, turn all off
            let any_off =
                !is_on(&DEBUG_TOUCH) || !is_on(&DEBUG_CLOUD) || !is_on(&DEBUG_AUDIO);
            set(&DEBUG_TOUCH, any_off);
            set(&DEBUG_CLOUD, any_off);
            set(&DEBUG_AUDIO, any_off);
            info!("debug all: {}", if any_off { "ON" } else { "OFF" });
        }
        _ => {
            info!("unknown module '{}'. options: touch, cloud, audio, all", sub);
        }
    }
}
