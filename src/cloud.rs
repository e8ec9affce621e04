use anyhow::{anyhow, bail, Result};
use embedded_svc::http::client::Client;
use embedded_svc::http::Status;
use embedded_svc::io::{Read, Write};
use esp_idf_svc::http::client::{Configuration, EspHttpConnection};
use log::{debug, info, warn};

use crate::credentials::{Service, Services};

const TIMEOUT_MS: u64 = 20_000;
const MAX_JSON_RESPONSE: usize = 32 * 1024;
const IO_CHUNK: usize = 4096;

fn new_client() -> Result<Client<EspHttpConnection>> {
    let config = Configuration {
        timeout: Some(std::time::Duration::from_millis(TIMEOUT_MS)),
        use_global_ca_store: true,
        crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    Ok(Client::wrap(EspHttpConnection::new(&config)?))
}

fn read_json_body<R>(response: &mut R) -> Result<serde_json::Value>
where
    R: Read,
    R::Error: std::fmt::Debug,
{
    let mut body: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = response
            .read(&mut buf)
            .map_err(|e| anyhow!("reading response: {:?}", e))?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
        if body.len() > MAX_JSON_RESPONSE {
            bail!("response too large (>{} bytes)", MAX_JSON_RESPONSE);
        }
    }
    Ok(serde_json::from_slice(&body)?)
}

/// POST a JSON document and parse the JSON response.
pub fn post_json(url: &str, api_key: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
    let payload = serde_json::to_vec(body)?;
    let auth = format!("Bearer {}", api_key);
    let length = payload.len().to_string();
    let headers = [
        ("authorization", auth.as_str()),
        ("content-type", "application/json"),
        ("content-length", length.as_str()),
    ];

    let mut client = new_client()?;
    let mut request = client.post(url, &headers)?;
    request.write_all(&payload)?;
    let mut response = request.submit()?;
    let status = response.status();
    debug!("POST {} -> {}", url.chars().take(80).collect::<String>(), status);
    if status != 200 {
        bail!("HTTP error: status {}", status);
    }
    read_json_body(&mut response)
}

/// POST a file as a raw octet stream (the speech upload path) and parse the
/// JSON response. The file is streamed in small chunks so a long recording
/// never has to fit in RAM twice.
pub fn post_file(url: &str, api_key: &str, path: &str) -> Result<serde_json::Value> {
    let mut file = std::fs::File::open(path)?;
    let length = file.metadata()?.len().to_string();
    let auth = format!("Bearer {}", api_key);
    let headers = [
        ("authorization", auth.as_str()),
        ("content-type", "application/octet-stream"),
        ("content-length", length.as_str()),
    ];

    let mut client = new_client()?;
    let mut request = client.post(url, &headers)?;
    let mut buf = vec![0u8; IO_CHUNK];
    loop {
        let n = std::io::Read::read(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        request.write_all(&buf[..n])?;
    }
    let mut response = request.submit()?;
    let status = response.status();
    debug!("POST {} -> {}", url.chars().take(80).collect::<String>(), status);
    if status != 200 {
        bail!("HTTP error: status {}", status);
    }
    read_json_body(&mut response)
}

/// POST a JSON document and stream the binary response body to a file (the
/// speech-synthesis download path).
pub fn post_json_to_file(
    url: &str,
    api_key: &str,
    body: &serde_json::Value,
    out_path: &str,
) -> Result<usize> {
    let payload = serde_json::to_vec(body)?;
    let auth = format!("Bearer {}", api_key);
    let length = payload.len().to_string();
    let headers = [
        ("authorization", auth.as_str()),
        ("content-type", "application/json"),
        ("content-length", length.as_str()),
    ];

    let mut client = new_client()?;
    let mut request = client.post(url, &headers)?;
    request.write_all(&payload)?;
    let mut response = request.submit()?;
    let status = response.status();
    if status != 200 {
        bail!("HTTP error: status {}", status);
    }

    let mut out = std::fs::File::create(out_path)?;
    let mut buf = vec![0u8; IO_CHUNK];
    let mut total = 0usize;
    loop {
        let n = response
            .read(&mut buf)
            .map_err(|e| anyhow!("reading response: {:?}", e))?;
        if n == 0 {
            break;
        }
        std::io::Write::write_all(&mut out, &buf[..n])?;
        total += n;
    }
    debug!("downloaded {} bytes to {}", total, out_path);
    Ok(total)
}

fn ping(url: &str) -> Result<()> {
    let mut client = new_client()?;
    let response = client.get(url)?.submit()?;
    let status = response.status();
    if status >= 400 {
        bail!("keep-alive status {}", status);
    }
    Ok(())
}

/// Idle-time keep-alive. On failure attempts exactly one reconnect.
pub fn keep_alive(services: &Services) -> Result<()> {
    let url = &services.keep_alive_url;
    if url.is_empty() {
        return Ok(());
    }
    match ping(url) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("keep-alive failed, reconnecting once: {}", e);
            ping(url)
        }
    }
}

fn field<'a>(value: &'a serde_json::Value, name: &str) -> Result<&'a str> {
    value
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("response missing '{}'", name))
}

/// Speech-to-text on a recorded WAV file.
pub fn transcribe(svc: &Service, wav_path: &str, language: &str) -> Result<String> {
    let url = format!("{}?language={}", svc.endpoint, language);
    let response = post_file(&url, &svc.api_key, wav_path)?;
    let text = field(&response, "text")?.to_string();
    info!("transcribed {} chars", text.len());
    Ok(text)
}

pub fn translate(svc: &Service, text: &str, from: &str, to: &str) -> Result<String> {
    let body = serde_json::json!({
        "text": text,
        "source": from,
        "target": to,
    });
    let response = post_json(&svc.endpoint, &svc.api_key, &body)?;
    Ok(field(&response, "translation")?.to_string())
}

pub fn chat(svc: &Service, prompt: &str) -> Result<String> {
    let body = serde_json::json!({
        "messages": [
            { "role": "user", "content": prompt }
        ],
    });
    let response = post_json(&svc.endpoint, &svc.api_key, &body)?;
    let reply = response
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("chat response missing message content"))?;
    Ok(reply.to_string())
}

/// Text-to-speech; writes the returned WAV to `out_path`.
pub fn synthesize(svc: &Service, text: &str, out_path: &str) -> Result<()> {
    let body = serde_json::json!({
        "text": text,
        "format": "wav",
    });
    let bytes = post_json_to_file(&svc.endpoint, &svc.api_key, &body, out_path)?;
    if bytes == 0 {
        bail!("synthesis returned an empty body");
    }
    Ok(())
}
