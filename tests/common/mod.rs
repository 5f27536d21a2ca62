//! Shared test utilities
//!
//! In-memory stand-ins for the microphone, the output device and the live
//! voice service, plus probes to inspect what the code under test did.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use live_coach::live::{
    Content, LiveEvent, LiveLink, OutboundSender, Part, ServerContent, ServerMessage, SessionEvent,
    SessionId, VoiceTransport,
};
use live_coach::voice::codec;
use live_coach::voice::{
    AudioInput, AudioOutput, InputDevice, OUTPUT_SAMPLE_RATE, PlaybackBuffer, PlaybackEvent,
    SampleCallback, TransportEnvelope, UnitId,
};
use live_coach::{Error, Result, SessionController};

// --- microphone ---

#[derive(Default)]
struct InputLog {
    deny: bool,
    acquired: usize,
    started: usize,
    stopped: usize,
    callback: Option<SampleCallback>,
}

/// Inspects and drives a [`FakeInput`]
#[derive(Clone, Default)]
pub struct InputProbe(Arc<Mutex<InputLog>>);

impl InputProbe {
    /// Refuse the next acquisitions
    pub fn deny(&self, deny: bool) {
        self.0.lock().unwrap().deny = deny;
    }

    /// Deliver samples as if the device produced them
    pub fn push(&self, samples: &[f32]) {
        if let Some(callback) = self.0.lock().unwrap().callback.as_mut() {
            callback(samples);
        }
    }

    pub fn acquired(&self) -> usize {
        self.0.lock().unwrap().acquired
    }

    pub fn started(&self) -> usize {
        self.0.lock().unwrap().started
    }

    pub fn stopped(&self) -> usize {
        self.0.lock().unwrap().stopped
    }

    pub fn is_streaming(&self) -> bool {
        self.0.lock().unwrap().callback.is_some()
    }
}

/// Microphone that hands out [`FakeDevice`]s
pub struct FakeInput {
    probe: InputProbe,
    sample_rate: u32,
}

impl FakeInput {
    pub fn new(sample_rate: u32) -> (Self, InputProbe) {
        let probe = InputProbe::default();
        (
            Self {
                probe: probe.clone(),
                sample_rate,
            },
            probe,
        )
    }
}

impl AudioInput for FakeInput {
    fn acquire(&self) -> Result<Box<dyn InputDevice>> {
        let mut log = self.probe.0.lock().unwrap();
        if log.deny {
            return Err(Error::PermissionDenied("user declined".to_string()));
        }
        log.acquired += 1;
        Ok(Box::new(FakeDevice {
            probe: self.probe.clone(),
            sample_rate: self.sample_rate,
        }))
    }
}

pub struct FakeDevice {
    probe: InputProbe,
    sample_rate: u32,
}

impl FakeDevice {
    pub fn new(sample_rate: u32) -> (Self, InputProbe) {
        let probe = InputProbe::default();
        (
            Self {
                probe: probe.clone(),
                sample_rate,
            },
            probe,
        )
    }
}

impl InputDevice for FakeDevice {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, on_samples: SampleCallback) -> Result<()> {
        let mut log = self.probe.0.lock().unwrap();
        log.started += 1;
        log.callback = Some(on_samples);
        Ok(())
    }

    fn stop(&mut self) {
        let mut log = self.probe.0.lock().unwrap();
        log.stopped += 1;
        log.callback = None;
    }
}

// --- output ---

/// One buffer handed to the output
#[derive(Debug, Clone, PartialEq)]
pub struct Scheduled {
    pub id: UnitId,
    pub start_time: f64,
    pub samples: usize,
}

struct OutputLog {
    now: f64,
    gain: f32,
    fail: bool,
    scheduled: Vec<Scheduled>,
    stopped: Vec<UnitId>,
}

/// Inspects and drives a [`FakeOutput`]
#[derive(Clone)]
pub struct OutputProbe(Arc<Mutex<OutputLog>>);

impl OutputProbe {
    /// Move the output clock
    pub fn set_now(&self, now: f64) {
        self.0.lock().unwrap().now = now;
    }

    /// Make every later `schedule` call fail
    pub fn fail_schedule(&self, fail: bool) {
        self.0.lock().unwrap().fail = fail;
    }

    pub fn scheduled(&self) -> Vec<Scheduled> {
        self.0.lock().unwrap().scheduled.clone()
    }

    pub fn start_times(&self) -> Vec<f64> {
        self.scheduled().iter().map(|s| s.start_time).collect()
    }

    pub fn stopped(&self) -> Vec<UnitId> {
        self.0.lock().unwrap().stopped.clone()
    }

    pub fn gain(&self) -> f32 {
        self.0.lock().unwrap().gain
    }
}

/// Output with a manually driven clock
pub struct FakeOutput {
    probe: OutputProbe,
    sample_rate: u32,
}

impl FakeOutput {
    pub fn new(sample_rate: u32) -> (Self, OutputProbe) {
        let probe = OutputProbe(Arc::new(Mutex::new(OutputLog {
            now: 0.0,
            gain: 1.0,
            fail: false,
            scheduled: Vec::new(),
            stopped: Vec::new(),
        })));
        (
            Self {
                probe: probe.clone(),
                sample_rate,
            },
            probe,
        )
    }
}

impl AudioOutput for FakeOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.probe.0.lock().unwrap().now
    }

    fn schedule(&mut self, id: UnitId, buffer: PlaybackBuffer, start_time: f64) -> Result<()> {
        let mut log = self.probe.0.lock().unwrap();
        if log.fail {
            return Err(Error::Playback("device lost".to_string()));
        }
        log.scheduled.push(Scheduled {
            id,
            start_time,
            samples: buffer.samples().len(),
        });
        Ok(())
    }

    fn stop(&mut self, id: UnitId) {
        self.probe.0.lock().unwrap().stopped.push(id);
    }

    fn set_gain(&mut self, gain: f32) {
        self.probe.0.lock().unwrap().gain = gain;
    }
}

// --- live service ---

/// How the fake service answers `connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Open,
    Fail,
    /// Never resolves
    Hang,
}

/// One link handed out by [`FakeTransport`]
pub struct LinkRecord {
    pub session: SessionId,
    pub events: mpsc::UnboundedSender<LiveEvent>,
    pub outbound: Option<mpsc::Receiver<TransportEnvelope>>,
    pub closed: Arc<AtomicBool>,
}

/// In-memory live voice service
pub struct FakeTransport {
    mode: Mutex<ConnectMode>,
    attempts: AtomicUsize,
    links: Mutex<Vec<LinkRecord>>,
    early: Mutex<Vec<SessionEvent>>,
}

impl FakeTransport {
    pub fn new(mode: ConnectMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            attempts: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
            early: Mutex::new(Vec::new()),
        })
    }

    pub fn set_mode(&self, mode: ConnectMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Emit `kind` on the next opened link before `connect` returns
    pub fn send_before_open(&self, kind: SessionEvent) {
        self.early.lock().unwrap().push(kind);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    /// Push an event from the remote side of link `index`
    pub fn deliver(&self, index: usize, kind: SessionEvent) {
        let links = self.links.lock().unwrap();
        let link = &links[index];
        link.events
            .send(LiveEvent {
                session: link.session,
                kind,
            })
            .unwrap();
    }

    /// Take the receiving end of link `index`'s outbound queue
    pub fn take_outbound(&self, index: usize) -> mpsc::Receiver<TransportEnvelope> {
        self.links.lock().unwrap()[index].outbound.take().unwrap()
    }

    pub fn is_closed(&self, index: usize) -> bool {
        let links = self.links.lock().unwrap();
        links[index].closed.load(Ordering::SeqCst)
    }
}

struct FakeLink {
    outbound: OutboundSender,
    closed: Arc<AtomicBool>,
}

impl LiveLink for FakeLink {
    fn outbound(&self) -> OutboundSender {
        self.outbound.clone()
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl VoiceTransport for FakeTransport {
    async fn connect(
        &self,
        session: SessionId,
        events: mpsc::UnboundedSender<LiveEvent>,
    ) -> Result<Box<dyn LiveLink>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            ConnectMode::Open => {
                let (outbound, rx) = OutboundSender::channel(64);
                let closed = Arc::new(AtomicBool::new(false));
                for kind in self.early.lock().unwrap().drain(..) {
                    events.send(LiveEvent { session, kind }).unwrap();
                }
                self.links.lock().unwrap().push(LinkRecord {
                    session,
                    events,
                    outbound: Some(rx),
                    closed: Arc::clone(&closed),
                });
                Ok(Box::new(FakeLink { outbound, closed }))
            }
            ConnectMode::Fail => Err(Error::Connection("handshake refused".to_string())),
            ConnectMode::Hang => std::future::pending().await,
        }
    }
}

// --- controller harness ---

/// Everything a controller test needs to observe and drive
pub struct Harness {
    pub transport: Arc<FakeTransport>,
    pub input: InputProbe,
    pub output: OutputProbe,
    pub playback_events: mpsc::UnboundedSender<PlaybackEvent>,
}

/// Controller over fakes: 16kHz microphone, 24kHz output
pub fn controller(mode: ConnectMode) -> (SessionController, Harness) {
    let transport = FakeTransport::new(mode);
    let (input, input_probe) = FakeInput::new(16_000);
    let (output, output_probe) = FakeOutput::new(OUTPUT_SAMPLE_RATE);
    let (playback_tx, playback_rx) = mpsc::unbounded_channel();

    let controller = SessionController::new(
        Arc::clone(&transport) as Arc<dyn VoiceTransport>,
        Box::new(input),
        Box::new(output),
        playback_rx,
    );

    (
        controller,
        Harness {
            transport,
            input: input_probe,
            output: output_probe,
            playback_events: playback_tx,
        },
    )
}

// --- server messages ---

/// Silent model speech lasting `seconds` at the output rate
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn speech(seconds: f64) -> TransportEnvelope {
    let len = (seconds * f64::from(OUTPUT_SAMPLE_RATE)) as usize;
    codec::encode(&vec![0.0; len], OUTPUT_SAMPLE_RATE)
}

/// Server message carrying the given audio parts
pub fn audio_message(parts: Vec<TransportEnvelope>) -> ServerMessage {
    server_message(parts, false)
}

/// Server message signalling barge-in, optionally with new audio
pub fn interrupted_message(parts: Vec<TransportEnvelope>) -> ServerMessage {
    server_message(parts, true)
}

fn server_message(parts: Vec<TransportEnvelope>, interrupted: bool) -> ServerMessage {
    ServerMessage {
        server_content: Some(ServerContent {
            model_turn: Some(Content {
                role: Some("model".to_string()),
                parts: parts.into_iter().map(Part::inline).collect(),
            }),
            interrupted,
            turn_complete: false,
        }),
        ..ServerMessage::default()
    }
}

/// Assert two clock times match
pub fn assert_time(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}
