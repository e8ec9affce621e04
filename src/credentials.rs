use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

/// Credentials and per-service endpoints, provisioned on the SD card.
pub const PATH: &str = "/sdcard/wattiz.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    pub endpoint: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Services {
    pub speech_to_text: Service,
    pub translation: Service,
    pub chat: Service,
    pub text_to_speech: Service,
    /// Pinged while idle so the long-lived client isn't dropped.
    #[serde(default)]
    pub keep_alive_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub wifi: WifiCredentials,
    pub services: Services,
}

impl Credentials {
    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path))?;
        let creds: Credentials =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path))?;
        info!(
            "credentials: loaded (wifi '{}', stt key {} chars)",
            creds.wifi.ssid,
            creds.services.speech_to_text.api_key.len()
        );
        Ok(creds)
    }

    /// Write a fill-in-the-blanks template so the user can provision the
    /// card on a PC.
    pub fn write_template(path: &str) -> Result<()> {
        let template = Credentials {
            wifi: WifiCredentials {
                ssid: "YOUR_WIFI_SSID".to_string(),
                password: "YOUR_WIFI_PASSWORD".to_string(),
            },
            services: Services {
                speech_to_text: Service {
                    endpoint: "https://api.example.com/v1/transcribe".to_string(),
                    api_key: "YOUR_API_KEY".to_string(),
                },
                translation: Service {
                    endpoint: "https://api.example.com/v1/translate".to_string(),
                    api_key: "YOUR_API_KEY".to_string(),
                },
                chat: Service {
                    endpoint: "https://api.example.com/v1/chat".to_string(),
                    api_key: "YOUR_API_KEY".to_string(),
                },
                text_to_speech: Service {
                    endpoint: "https://api.example.com/v1/speech".to_string(),
                    api_key: "YOUR_API_KEY".to_string(),
                },
                keep_alive_url: "https://api.example.com/v1/ping".to_string(),
            },
        };
        let text = serde_json::to_string_pretty(&template)?;
        std::fs::write(path, text).with_context(|| format!("writing {}", path))?;
        info!("credentials: template written to {}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_document() {
        let text = r#"{
            "wifi": { "ssid": "lab", "password": "pw" },
            "services": {
                "speech_to_text": { "endpoint": "https://stt.example/v1", "api_key": "k1" },
                "translation": { "endpoint": "https://tr.example/v1", "api_key": "k2" },
                "chat": { "endpoint": "https://chat.example/v1", "api_key": "k3" },
                "text_to_speech": { "endpoint": "https://tts.example/v1", "api_key": "k4" }
            }
        }"#;
        let creds: Credentials = serde_json::from_str(text).unwrap();
        assert_eq!(creds.wifi.ssid, "lab");
        assert_eq!(creds.services.chat.api_key, "k3");
        // keep_alive_url is optional
        assert!(creds.services.keep_alive_url.is_empty());
    }

    #[test]
    fn template_round_trips() {
        let template = Credentials::default();
        let text = serde_json::to_string(&template).unwrap();
        let parsed: Credentials = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.wifi.ssid, template.wifi.ssid);
    }
}
