use anyhow::Result;
use esp_idf_svc::nvs::{EspNvs, NvsDefault};
use log::{info, warn};

pub const NS: &str = "wattiz";

const KEY_SENTINEL: &str = "stg_sentinel";
const KEY_RECORD: &str = "stg_record";

/// Bumped together with [`SCHEMA_VERSION`] whenever the record layout changes.
pub const SENTINEL: u64 = 0x5741_5454_495A_0003;

/// Layout version embedded in the serialized record itself, so a stale blob
/// is detected even if the sentinel key was left untouched.
pub const SCHEMA_VERSION: u16 = 3;

const NAME_LEN: usize = 32;
const SSID_LEN: usize = 32;
const PASS_LEN: usize = 64;

/// version(2) + name(32) + ssid(32) + pass(64) + brightness(1) + rotation(1)
/// + tz_offset(2) + clock_24h(1) + speaker(1) + mic(1)
pub const RECORD_LEN: usize = 2 + NAME_LEN + SSID_LEN + PASS_LEN + 1 + 1 + 2 + 1 + 1 + 1;

const DEFAULT_DEVICE_NAME: &str = "Watt-IZ";
const DEFAULT_BRIGHTNESS: u8 = 80;
const DEFAULT_SPEAKER_VOLUME: u8 = 70;
const DEFAULT_MIC_VOLUME: u8 = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemSettings {
    pub device_name: String,
    pub wifi_ssid: String,
    pub wifi_pass: String,
    /// Backlight duty, 0-100.
    pub brightness: u8,
    /// Screen rotation in 90° steps, 0-3.
    pub rotation: u8,
    /// Minutes east of UTC.
    pub tz_offset_minutes: i16,
    pub clock_24h: bool,
    pub speaker_volume: u8,
    pub mic_volume: u8,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            brightness: DEFAULT_BRIGHTNESS,
            rotation: 0,
            tz_offset_minutes: 0,
            clock_24h: true,
            speaker_volume: DEFAULT_SPEAKER_VOLUME,
            mic_volume: DEFAULT_MIC_VOLUME,
        }
    }
}

fn put_str(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
    for b in buf[n..].iter_mut() {
        *b = 0;
    }
}

fn take_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl SystemSettings {
    /// Serialize as the fixed-width little-endian record. Strings longer
    /// than their field are truncated at a byte boundary on the way in,
    /// so setters clamp lengths up front.
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..2].copy_from_slice(&SCHEMA_VERSION.to_le_bytes());
        let mut at = 2;
        put_str(&mut out[at..at + NAME_LEN], &self.device_name);
        at += NAME_LEN;
        put_str(&mut out[at..at + SSID_LEN], &self.wifi_ssid);
        at += SSID_LEN;
        put_str(&mut out[at..at + PASS_LEN], &self.wifi_pass);
        at += PASS_LEN;
        out[at] = self.brightness;
        out[at + 1] = self.rotation & 3;
        out[at + 2..at + 4].copy_from_slice(&self.tz_offset_minutes.to_le_bytes());
        out[at + 4] = self.clock_24h as u8;
        out[at + 5] = self.speaker_volume;
        out[at + 6] = self.mic_volume;
        out
    }

    /// Decode a stored record. Wrong length or wrong embedded schema
    /// version yields `None`; the caller falls back to defaults.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != RECORD_LEN {
            return None;
        }
        let version = u16::from_le_bytes([buf[0], buf[1]]);
        if version != SCHEMA_VERSION {
            return None;
        }
        let mut at = 2;
        let device_name = take_str(&buf[at..at + NAME_LEN]);
        at += NAME_LEN;
        let wifi_ssid = take_str(&buf[at..at + SSID_LEN]);
        at += SSID_LEN;
        let wifi_pass = take_str(&buf[at..at + PASS_LEN]);
        at += PASS_LEN;
        Some(Self {
            device_name,
            wifi_ssid,
            wifi_pass,
            brightness: buf[at].min(100),
            rotation: buf[at + 1] & 3,
            tz_offset_minutes: i16::from_le_bytes([buf[at + 2], buf[at + 3]]),
            clock_24h: buf[at + 4] != 0,
            speaker_volume: buf[at + 5].min(100),
            mic_volume: buf[at + 6].min(100),
        })
    }
}

/// Key-value persistence the store runs against. Hardware uses NVS; tests
/// use an in-memory map.
pub trait SettingsBackend {
    fn get_u64(&self, key: &str) -> Option<u64>;
    fn set_u64(&mut self, key: &str, value: u64) -> Result<()>;
    fn blob_len(&self, key: &str) -> Option<usize>;
    fn get_blob<'a>(&self, key: &str, buf: &'a mut [u8]) -> Option<&'a [u8]>;
    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<()>;
    fn restart(&mut self) -> !;
}

pub struct NvsBackend(pub EspNvs<NvsDefault>);

impl SettingsBackend for NvsBackend {
    fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get_u64(key).unwrap_or(None)
    }

    fn set_u64(&mut self, key: &str, value: u64) -> Result<()> {
        self.0.set_u64(key, value)?;
        Ok(())
    }

    fn blob_len(&self, key: &str) -> Option<usize> {
        self.0.blob_len(key).unwrap_or(None)
    }

    fn get_blob<'a>(&self, key: &str, buf: &'a mut [u8]) -> Option<&'a [u8]> {
        match self.0.get_raw(key, buf) {
            Ok(Some(data)) => Some(data),
            _ => None,
        }
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.0.set_raw(key, value)?;
        Ok(())
    }

    fn restart(&mut self) -> ! {
        std::thread::sleep(std::time::Duration::from_millis(200));
        unsafe { esp_idf_sys::esp_restart() };
        unreachable!()
    }
}

pub struct SettingsStore<B: SettingsBackend> {
    backend: B,
    settings: SystemSettings,
    changed: bool,
}

impl<B: SettingsBackend> SettingsStore<B> {
    /// Load the persisted record, or populate and persist defaults when the
    /// sentinel is absent/stale, the blob size is off, or the embedded
    /// schema version doesn't match.
    pub fn initialize(backend: B) -> Result<Self> {
        let mut store = Self {
            backend,
            settings: SystemSettings::default(),
            changed: false,
        };

        let stored = match store.backend.get_u64(KEY_SENTINEL) {
            Some(SENTINEL) => store.read_record(),
            Some(other) => {
                warn!(
                    "settings: sentinel mismatch (stored {:#018x}, expected {:#018x})",
                    other, SENTINEL
                );
                None
            }
            None => {
                info!("settings: no sentinel, first boot");
                None
            }
        };

        match stored {
            Some(settings) => {
                info!("settings: loaded '{}'", settings.device_name);
                store.settings = settings;
            }
            None => {
                info!("settings: persisting defaults");
                store.save(false)?;
            }
        }
        Ok(store)
    }

    fn read_record(&self) -> Option<SystemSettings> {
        match self.backend.blob_len(KEY_RECORD) {
            Some(RECORD_LEN) => {}
            Some(n) => {
                warn!("settings: record is {} bytes, expected {}", n, RECORD_LEN);
                return None;
            }
            None => return None,
        }
        let mut buf = [0u8; RECORD_LEN];
        let data = self.backend.get_blob(KEY_RECORD, &mut buf)?;
        SystemSettings::decode(data)
    }

    /// Persist the full record and refresh the sentinel. With `reboot` the
    /// device restarts after a short delay; the call does not return.
    pub fn save(&mut self, reboot: bool) -> Result<()> {
        self.backend.set_blob(KEY_RECORD, &self.settings.encode())?;
        if self.backend.get_u64(KEY_SENTINEL) != Some(SENTINEL) {
            self.backend.set_u64(KEY_SENTINEL, SENTINEL)?;
        }
        self.changed = false;
        info!("settings: saved");
        if reboot {
            info!("settings: rebooting");
            self.backend.restart();
        }
        Ok(())
    }

    pub fn get(&self) -> &SystemSettings {
        &self.settings
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn reset_to_defaults(&mut self) {
        self.settings = SystemSettings::default();
        self.changed = true;
    }

    pub fn set_device_name(&mut self, name: &str) {
        self.settings.device_name = clamp_str(name, NAME_LEN);
        self.changed = true;
    }

    pub fn set_wifi(&mut self, ssid: &str, pass: &str) {
        self.settings.wifi_ssid = clamp_str(ssid, SSID_LEN);
        self.settings.wifi_pass = clamp_str(pass, PASS_LEN);
        self.changed = true;
    }

    pub fn set_brightness(&mut self, pct: u8) {
        self.settings.brightness = pct.min(100);
        self.changed = true;
    }

    pub fn set_rotation(&mut self, rotation: u8) {
        self.settings.rotation = rotation & 3;
        self.changed = true;
    }

    pub fn set_tz_offset(&mut self, minutes: i16) {
        self.settings.tz_offset_minutes = minutes;
        self.changed = true;
    }

    pub fn set_clock_24h(&mut self, on: bool) {
        self.settings.clock_24h = on;
        self.changed = true;
    }

    pub fn set_speaker_volume(&mut self, pct: u8) {
        self.settings.speaker_volume = pct.min(100);
        self.changed = true;
    }

    pub fn set_mic_volume(&mut self, pct: u8) {
        self.settings.mic_volume = pct.min(100);
        self.changed = true;
    }
}

fn clamp_str(s: &str, max: usize) -> String {
    let mut out = String::with_capacity(max);
    for ch in s.chars() {
        if out.len() + ch.len_utf8() > max {
            break;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapBackend {
        u64s: HashMap<String, u64>,
        blobs: HashMap<String, Vec<u8>>,
    }

    impl SettingsBackend for MapBackend {
        fn get_u64(&self, key: &str) -> Option<u64> {
            self.u64s.get(key).copied()
        }

        fn set_u64(&mut self, key: &str, value: u64) -> Result<()> {
            self.u64s.insert(key.to_string(), value);
            Ok(())
        }

        fn blob_len(&self, key: &str) -> Option<usize> {
            self.blobs.get(key).map(|b| b.len())
        }

        fn get_blob<'a>(&self, key: &str, buf: &'a mut [u8]) -> Option<&'a [u8]> {
            let data = self.blobs.get(key)?;
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Some(&buf[..n])
        }

        fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<()> {
            self.blobs.insert(key.to_string(), value.to_vec());
            Ok(())
        }

        fn restart(&mut self) -> ! {
            panic!("restart requested");
        }
    }

    fn take_backend<B: SettingsBackend>(store: SettingsStore<B>) -> B {
        store.backend
    }

    #[test]
    fn encode_decode_identity() {
        let mut s = SystemSettings::default();
        s.device_name = "Bench unit 7".to_string();
        s.wifi_ssid = "lab-2.4".to_string();
        s.wifi_pass = "hunter2hunter2".to_string();
        s.brightness = 33;
        s.rotation = 2;
        s.tz_offset_minutes = -330;
        s.clock_24h = false;
        s.speaker_volume = 55;
        s.mic_volume = 91;
        assert_eq!(SystemSettings::decode(&s.encode()), Some(s));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let enc = SystemSettings::default().encode();
        assert_eq!(SystemSettings::decode(&enc[..RECORD_LEN - 1]), None);
    }

    #[test]
    fn decode_rejects_wrong_embedded_version() {
        let mut enc = SystemSettings::default().encode();
        enc[0] = enc[0].wrapping_add(1);
        assert_eq!(SystemSettings::decode(&enc), None);
    }

    #[test]
    fn first_boot_persists_defaults() {
        let store = SettingsStore::initialize(MapBackend::default()).unwrap();
        assert_eq!(*store.get(), SystemSettings::default());
        let backend = take_backend(store);
        assert_eq!(backend.get_u64(KEY_SENTINEL), Some(SENTINEL));
        assert_eq!(backend.blob_len(KEY_RECORD), Some(RECORD_LEN));
    }

    #[test]
    fn save_then_initialize_round_trips() {
        let mut store = SettingsStore::initialize(MapBackend::default()).unwrap();
        store.set_device_name("Kiosk 3");
        store.set_wifi("shop-floor", "s3cret!");
        store.set_brightness(45);
        store.set_rotation(1);
        store.set_tz_offset(120);
        store.set_clock_24h(false);
        store.set_speaker_volume(60);
        store.set_mic_volume(75);
        let expected = store.get().clone();
        store.save(false).unwrap();
        assert!(!store.is_changed());

        let reopened = SettingsStore::initialize(take_backend(store)).unwrap();
        assert_eq!(*reopened.get(), expected);
    }

    #[test]
    fn sentinel_mismatch_falls_back_to_defaults() {
        let mut store = SettingsStore::initialize(MapBackend::default()).unwrap();
        store.set_device_name("old name");
        store.save(false).unwrap();

        let mut backend = take_backend(store);
        backend.set_u64(KEY_SENTINEL, SENTINEL ^ 1).unwrap();
        let reopened = SettingsStore::initialize(backend).unwrap();
        assert_eq!(*reopened.get(), SystemSettings::default());
        // Defaults were re-persisted under the correct sentinel.
        let backend = take_backend(reopened);
        assert_eq!(backend.get_u64(KEY_SENTINEL), Some(SENTINEL));
    }

    #[test]
    fn blob_size_mismatch_falls_back_to_defaults() {
        let mut backend = MapBackend::default();
        backend.set_u64(KEY_SENTINEL, SENTINEL).unwrap();
        backend.set_blob(KEY_RECORD, &[0u8; RECORD_LEN - 4]).unwrap();

        let store = SettingsStore::initialize(backend).unwrap();
        assert_eq!(*store.get(), SystemSettings::default());
        assert_eq!(take_backend(store).blob_len(KEY_RECORD), Some(RECORD_LEN));
    }

    #[test]
    fn setters_clamp_and_mark_changed() {
        let mut store = SettingsStore::initialize(MapBackend::default()).unwrap();
        assert!(!store.is_changed());
        store.set_brightness(250);
        assert_eq!(store.get().brightness, 100);
        store.set_rotation(5);
        assert_eq!(store.get().rotation, 1);
        store.set_device_name(&"x".repeat(100));
        assert_eq!(store.get().device_name.len(), NAME_LEN);
        assert!(store.is_changed());
    }
}
