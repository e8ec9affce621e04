use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};

use crate::audio::{self, RecordingStatus, Recorder, Player};
use crate::cloud;
use crate::credentials::Services;
use crate::requests::{self, DEBUG_AUDIO, DEBUG_CLOUD};

const RECORD_SECONDS: u32 = 5;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);
const LANG_PRIMARY: &str = "en";
const LANG_SECONDARY: &str = "zh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineCommand {
    /// Record and show the transcription.
    Dictate,
    /// Record, transcribe, translate, speak the translation.
    Translate,
    /// Record, transcribe, send to the chat service, speak the reply.
    Converse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Recording,
    Transcribing,
    Translating,
    Thinking,
    Synthesizing,
    Speaking,
    Failed,
}

impl PipelineState {
    pub fn label(self) -> &'static str {
        match self {
            PipelineState::Idle => "ready",
            PipelineState::Recording => "listening...",
            PipelineState::Transcribing => "transcribing...",
            PipelineState::Translating => "translating...",
            PipelineState::Thinking => "thinking...",
            PipelineState::Synthesizing => "preparing speech...",
            PipelineState::Speaking => "speaking...",
            PipelineState::Failed => "failed",
        }
    }

    pub fn is_busy(self) -> bool {
        !matches!(self, PipelineState::Idle | PipelineState::Failed)
    }
}

/// Polled by the GUI loop each tick; the worker is the only writer.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub transcript: String,
    pub reply: String,
    pub error: String,
}

impl PipelineStatus {
    fn idle() -> Self {
        Self {
            state: PipelineState::Idle,
            transcript: String::new(),
            reply: String::new(),
            error: String::new(),
        }
    }
}

pub struct PipelineHandle {
    tx: mpsc::Sender<PipelineCommand>,
    pub status: Arc<Mutex<PipelineStatus>>,
    pub recording: Arc<Mutex<RecordingStatus>>,
    pub speaker_volume: Arc<AtomicU8>,
    pub mic_volume: Arc<AtomicU8>,
}

impl PipelineHandle {
    pub fn send(&self, cmd: PipelineCommand) {
        if self.tx.send(cmd).is_err() {
            error!("pipeline: worker is gone");
        }
    }

    pub fn state(&self) -> PipelineState {
        self.status.lock().unwrap().state
    }

    pub fn snapshot(&self) -> PipelineStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn set_speaker_volume(&self, pct: u8) {
        self.speaker_volume.store(pct.min(100), Ordering::Relaxed);
    }

    pub fn set_mic_volume(&self, pct: u8) {
        self.mic_volume.store(pct.min(100), Ordering::Relaxed);
    }
}

struct Worker {
    services: Services,
    recorder: Recorder<'static>,
    player: Player<'static>,
    status: Arc<Mutex<PipelineStatus>>,
    recording: Arc<Mutex<RecordingStatus>>,
    speaker_volume: Arc<AtomicU8>,
    mic_volume: Arc<AtomicU8>,
}

impl Worker {
    fn set_state(&self, state: PipelineState) {
        self.status.lock().unwrap().state = state;
    }

    fn capture_and_transcribe(&mut self) -> Result<String> {
        self.set_state(PipelineState::Recording);
        let gain = self.mic_volume.load(Ordering::Relaxed);
        self.recorder
            .record_to_wav(audio::RECORDING_PATH, RECORD_SECONDS, gain, &self.recording)?;

        self.set_state(PipelineState::Transcribing);
        let text = cloud::transcribe(
            &self.services.speech_to_text,
            audio::RECORDING_PATH,
            LANG_PRIMARY,
        )?;
        {
            let mut s = self.status.lock().unwrap();
            s.transcript = text.clone();
            s.reply.clear();
        }
        Ok(text)
    }

    fn speak(&mut self, text: &str) -> Result<()> {
        self.set_state(PipelineState::Synthesizing);
        cloud::synthesize(&self.services.text_to_speech, text, audio::REPLY_PATH)?;

        self.set_state(PipelineState::Speaking);
        let volume = self.speaker_volume.load(Ordering::Relaxed);
        if requests::is_on(&DEBUG_AUDIO) {
            info!("pipeline: playing reply at {}%", volume);
        }
        self.player.play_wav(audio::REPLY_PATH, volume)?;
        Ok(())
    }

    fn run_command(&mut self, cmd: PipelineCommand) -> Result<()> {
        let transcript = self.capture_and_transcribe()?;
        if requests::is_on(&DEBUG_CLOUD) {
            info!("pipeline: transcript: {}", transcript);
        }

        match cmd {
            PipelineCommand::Dictate => {}
            PipelineCommand::Translate => {
                self.set_state(PipelineState::Translating);
                let translation = cloud::translate(
                    &self.services.translation,
                    &transcript,
                    LANG_PRIMARY,
                    LANG_SECONDARY,
                )?;
                self.status.lock().unwrap().reply = translation.clone();
                self.speak(&translation)?;
            }
            PipelineCommand::Converse => {
                self.set_state(PipelineState::Thinking);
                let reply = cloud::chat(&self.services.chat, &transcript)?;
                self.status.lock().unwrap().reply = reply.clone();
                self.speak(&reply)?;
            }
        }
        Ok(())
    }

    fn serve(&mut self, rx: mpsc::Receiver<PipelineCommand>) {
        loop {
            match rx.recv_timeout(KEEP_ALIVE_INTERVAL) {
                Ok(cmd) => {
                    info!("pipeline: running {:?}", cmd);
                    match self.run_command(cmd) {
                        Ok(()) => {
                            let mut s = self.status.lock().unwrap();
                            s.state = PipelineState::Idle;
                            s.error.clear();
                        }
                        Err(e) => {
                            warn!("pipeline: {:?} failed: {:#}", cmd, e);
                            let mut s = self.status.lock().unwrap();
                            s.state = PipelineState::Failed;
                            s.error = format!("{:#}", e);
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !self.status.lock().unwrap().state.is_busy() {
                        if let Err(e) = cloud::keep_alive(&self.services) {
                            warn!("pipeline: keep-alive failed twice: {:#}", e);
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    info!("pipeline: command channel closed, exiting");
                    break;
                }
            }
        }
    }
}

/// Spawn the cloud pipeline worker. All slow I/O (audio capture, HTTPS,
/// SD writes) happens on this thread; the GUI only ever touches the
/// channel and the shared status.
pub fn spawn(
    services: Services,
    recorder: Recorder<'static>,
    player: Player<'static>,
    initial_speaker_volume: u8,
    initial_mic_volume: u8,
) -> Result<PipelineHandle> {
    let (tx, rx) = mpsc::channel();
    let status = Arc::new(Mutex::new(PipelineStatus::idle()));
    let recording = Arc::new(Mutex::new(RecordingStatus::idle()));
    let speaker_volume = Arc::new(AtomicU8::new(initial_speaker_volume.min(100)));
    let mic_volume = Arc::new(AtomicU8::new(initial_mic_volume.min(100)));

    let mut worker = Worker {
        services,
        recorder,
        player,
        status: status.clone(),
        recording: recording.clone(),
        speaker_volume: speaker_volume.clone(),
        mic_volume: mic_volume.clone(),
    };

    std::thread::Builder::new()
        .name("cloud-pipeline".into())
        .stack_size(16 * 1024)
        .spawn(move || worker.serve(rx))?;

    Ok(PipelineHandle {
        tx,
        status,
        recording,
        speaker_volume,
        mic_volume,
    })
}
