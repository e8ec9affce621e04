use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use esp_idf_hal::gpio::{InputPin, OutputPin};
use esp_idf_hal::i2s::config::{DataBitWidth, StdConfig};
use esp_idf_hal::i2s::{I2sDriver, I2sRx, I2sTx, I2S0, I2S1};
use esp_idf_hal::peripheral::Peripheral;
use log::{info, warn};

pub const SAMPLE_RATE: u32 = 16_000;
pub const CHANNELS: u16 = 1;
pub const BITS_PER_SAMPLE: u16 = 16;

pub const RECORDING_PATH: &str = "/sdcard/recording.wav";
pub const REPLY_PATH: &str = "/sdcard/reply.wav";

const WAV_HEADER_LEN: usize = 44;
const IO_CHUNK: usize = 4096;
const READ_TIMEOUT_MS: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecState {
    Idle,
    Recording,
    Complete,
    Error,
}

/// Shared with the pipeline so the GUI can draw capture progress.
#[derive(Debug, Clone, Copy)]
pub struct RecordingStatus {
    pub state: RecState,
    pub frames_captured: u32,
    pub frames_expected: u32,
}

impl RecordingStatus {
    pub const fn idle() -> Self {
        Self {
            state: RecState::Idle,
            frames_captured: 0,
            frames_expected: 0,
        }
    }
}

/// Canonical 44-byte PCM WAV header.
pub fn wav_header(data_len: u32, sample_rate: u32, channels: u16, bits: u16) -> [u8; 44] {
    let block_align = channels * (bits / 8);
    let byte_rate = sample_rate * block_align as u32;

    let mut h = [0u8; 44];
    h[0..4].copy_from_slice(b"RIFF");
    h[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    h[8..12].copy_from_slice(b"WAVE");
    h[12..16].copy_from_slice(b"fmt ");
    h[16..20].copy_from_slice(&16u32.to_le_bytes()); // PCM fmt chunk size
    h[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    h[22..24].copy_from_slice(&channels.to_le_bytes());
    h[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    h[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    h[32..34].copy_from_slice(&block_align.to_le_bytes());
    h[34..36].copy_from_slice(&bits.to_le_bytes());
    h[36..40].copy_from_slice(b"data");
    h[40..44].copy_from_slice(&data_len.to_le_bytes());
    h
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits: u16,
    pub data_len: u32,
}

/// Parse a plain 44-byte PCM header (the only shape this firmware writes or
/// downloads). Anything with extra chunks is rejected rather than guessed at.
pub fn parse_wav_header(h: &[u8]) -> Result<WavInfo> {
    if h.len() < WAV_HEADER_LEN {
        bail!("WAV header truncated ({} bytes)", h.len());
    }
    if &h[0..4] != b"RIFF" || &h[8..12] != b"WAVE" || &h[12..16] != b"fmt " {
        bail!("not a WAV file");
    }
    let format = u16::from_le_bytes([h[20], h[21]]);
    if format != 1 {
        bail!("unsupported WAV format {}", format);
    }
    if &h[36..40] != b"data" {
        bail!("unsupported WAV chunk layout");
    }
    Ok(WavInfo {
        sample_rate: u32::from_le_bytes([h[24], h[25], h[26], h[27]]),
        channels: u16::from_le_bytes([h[22], h[23]]),
        bits: u16::from_le_bytes([h[34], h[35]]),
        data_len: u32::from_le_bytes([h[40], h[41], h[42], h[43]]),
    })
}

/// I2S microphone capture.
pub struct Recorder<'d> {
    rx: I2sDriver<'d, I2sRx>,
}

impl<'d> Recorder<'d> {
    pub fn new(
        i2s: impl Peripheral<P = I2S0> + 'd,
        bclk: impl Peripheral<P = impl InputPin + OutputPin> + 'd,
        din: impl Peripheral<P = impl InputPin> + 'd,
        ws: impl Peripheral<P = impl InputPin + OutputPin> + 'd,
    ) -> Result<Self> {
        let config = StdConfig::philips(SAMPLE_RATE, DataBitWidth::Bits16);
        let rx = I2sDriver::new_std_rx(i2s, &config, bclk, din, None::<esp_idf_hal::gpio::AnyIOPin>, ws)?;
        Ok(Self { rx })
    }

    /// Drop whatever the mic pushed while we weren't listening.
    fn drain(&mut self) {
        let mut scratch = [0u8; 512];
        while matches!(self.rx.read(&mut scratch, 0), Ok(n) if n > 0) {}
    }

    /// Record `seconds` of mono 16-bit audio and write it as a WAV file,
    /// applying `gain_pct` (0-100) as input gain. Progress is published
    /// through `status` for the GUI.
    pub fn record_to_wav(
        &mut self,
        path: &str,
        seconds: u32,
        gain_pct: u8,
        status: &Arc<Mutex<RecordingStatus>>,
    ) -> Result<()> {
        let frames_expected = SAMPLE_RATE * seconds;
        let total_bytes = frames_expected as usize * 2;

        {
            let mut s = status.lock().unwrap();
            *s = RecordingStatus {
                state: RecState::Recording,
                frames_captured: 0,
                frames_expected,
            };
        }

        self.rx.rx_enable()?;
        self.drain();

        let mut pcm: Vec<u8> = Vec::with_capacity(total_bytes);
        let mut buf = [0u8; 1024];
        while pcm.len() < total_bytes {
            let want = (total_bytes - pcm.len()).min(buf.len());
            let n = match self.rx.read(&mut buf[..want], READ_TIMEOUT_MS) {
                Ok(n) => n,
                Err(e) => {
                    status.lock().unwrap().state = RecState::Error;
                    let _ = self.rx.rx_disable();
                    return Err(e).context("i2s read");
                }
            };
            if n == 0 {
                continue;
            }
            let gain = gain_pct.min(100) as i32;
            for chunk in buf[..n & !1].chunks_exact_mut(2) {
                let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as i32;
                let scaled = (sample * gain / 100) as i16;
                chunk.copy_from_slice(&scaled.to_le_bytes());
            }
            pcm.extend_from_slice(&buf[..n]);
            status.lock().unwrap().frames_captured = (pcm.len() / 2) as u32;
        }
        self.rx.rx_disable()?;

        let header = wav_header(pcm.len() as u32, SAMPLE_RATE, CHANNELS, BITS_PER_SAMPLE);
        let mut out = std::fs::File::create(path).with_context(|| format!("creating {}", path))?;
        std::io::Write::write_all(&mut out, &header)?;
        std::io::Write::write_all(&mut out, &pcm)?;

        status.lock().unwrap().state = RecState::Complete;
        info!("audio: recorded {} frames to {}", pcm.len() / 2, path);
        Ok(())
    }
}

/// I2S speaker output.
pub struct Player<'d> {
    tx: I2sDriver<'d, I2sTx>,
}

impl<'d> Player<'d> {
    pub fn new(
        i2s: impl Peripheral<P = I2S1> + 'd,
        bclk: impl Peripheral<P = impl InputPin + OutputPin> + 'd,
        dout: impl Peripheral<P = impl OutputPin> + 'd,
        ws: impl Peripheral<P = impl InputPin + OutputPin> + 'd,
    ) -> Result<Self> {
        let config = StdConfig::philips(SAMPLE_RATE, DataBitWidth::Bits16);
        let tx = I2sDriver::new_std_tx(i2s, &config, bclk, dout, None::<esp_idf_hal::gpio::AnyIOPin>, ws)?;
        Ok(Self { tx })
    }

    /// Stream a WAV file from SD to the speaker, scaling samples by
    /// `volume_pct` (0-100).
    pub fn play_wav(&mut self, path: &str, volume_pct: u8) -> Result<()> {
        let mut file = std::fs::File::open(path).with_context(|| format!("opening {}", path))?;
        let mut header = [0u8; WAV_HEADER_LEN];
        std::io::Read::read_exact(&mut file, &mut header)?;
        let info = parse_wav_header(&header)?;
        if info.bits != 16 {
            bail!("only 16-bit WAV playback is supported, got {}", info.bits);
        }
        if info.sample_rate != SAMPLE_RATE {
            warn!(
                "audio: {} is {} Hz, playing at {} Hz",
                path, info.sample_rate, SAMPLE_RATE
            );
        }

        let volume = volume_pct.min(100) as i32;
        self.tx.tx_enable()?;
        let mut remaining = info.data_len as usize;
        let mut buf = vec![0u8; IO_CHUNK];
        while remaining > 0 {
            let want = remaining.min(buf.len()) & !1;
            if want == 0 {
                break;
            }
            let n = std::io::Read::read(&mut file, &mut buf[..want])?;
            if n == 0 {
                break;
            }
            for chunk in buf[..n & !1].chunks_exact_mut(2) {
                let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as i32;
                let scaled = (sample * volume / 100) as i16;
                chunk.copy_from_slice(&scaled.to_le_bytes());
            }
            let mut written = 0usize;
            while written < n {
                written += self.tx.write(&buf[written..n], u32::MAX)?;
            }
            remaining -= n;
        }
        self.tx.tx_disable()?;
        info!("audio: played {}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_are_derived() {
        let h = wav_header(32_000, 16_000, 1, 16);
        assert_eq!(&h[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([h[4], h[5], h[6], h[7]]), 36 + 32_000);
        // byte rate = rate * channels * bytes-per-sample
        assert_eq!(u32::from_le_bytes([h[28], h[29], h[30], h[31]]), 32_000);
        // block align
        assert_eq!(u16::from_le_bytes([h[32], h[33]]), 2);
        assert_eq!(u32::from_le_bytes([h[40], h[41], h[42], h[43]]), 32_000);
    }

    #[test]
    fn header_parses_back() {
        let h = wav_header(12_345, 16_000, 1, 16);
        let info = parse_wav_header(&h).unwrap();
        assert_eq!(
            info,
            WavInfo {
                sample_rate: 16_000,
                channels: 1,
                bits: 16,
                data_len: 12_345,
            }
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let mut h = wav_header(100, 16_000, 1, 16);
        h[0] = b'X';
        assert!(parse_wav_header(&h).is_err());
    }

    #[test]
    fn rejects_truncated() {
        let h = wav_header(100, 16_000, 1, 16);
        assert!(parse_wav_header(&h[..20]).is_err());
    }

    #[test]
    fn rejects_non_pcm() {
        let mut h = wav_header(100, 16_000, 1, 16);
        h[20] = 3; // IEEE float
        assert!(parse_wav_header(&h).is_err());
    }
}
