//! Session controller
//!
//! Owns the session state machine and every resource of a voice
//! conversation: the microphone, the live link, the capture pipeline and the
//! playback scheduler. All callbacks (control commands, link events, playback
//! completions) are handled one at a time on a single task, so none of that
//! state needs locking.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::live::{LiveEvent, LiveLink, ServerMessage, SessionEvent, SessionId, VoiceTransport};
use crate::voice::{
    AudioInput, AudioOutput, CaptureHandle, InputDevice, LevelMeter, OUTPUT_SAMPLE_RATE,
    PlaybackEvent, PlaybackScheduler,
};
use crate::{Error, Result};

/// Lifecycle of a voice conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Live,
    Error,
    /// Terminal; the controller has shut down
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Live => "live",
            Self::Error => "error",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Observable snapshot published on every change
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Short message for the last failure, cleared on the next start
    pub last_error: Option<String>,
    pub muted: bool,
}

impl SessionStatus {
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state == SessionState::Live
    }
}

/// Requests from the surrounding application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
    SetMuted(bool),
    Shutdown,
}

/// The session state machine and its resources
pub struct SessionController {
    transport: Arc<dyn VoiceTransport>,
    input: Box<dyn AudioInput>,
    playback: PlaybackScheduler,
    playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    events_tx: mpsc::UnboundedSender<LiveEvent>,
    events_rx: mpsc::UnboundedReceiver<LiveEvent>,
    commands_tx: mpsc::UnboundedSender<ControlCommand>,
    commands_rx: Option<mpsc::UnboundedReceiver<ControlCommand>>,
    status_tx: watch::Sender<SessionStatus>,
    state: SessionState,
    last_error: Option<String>,
    current: Option<SessionId>,
    next_session: SessionId,
    device: Option<Box<dyn InputDevice>>,
    connect_task: Option<JoinHandle<()>>,
    early_events: Vec<SessionEvent>,
    link: Option<Box<dyn LiveLink>>,
    capture: Option<CaptureHandle>,
    level: LevelMeter,
}

impl SessionController {
    /// Create an idle controller
    ///
    /// `playback_events` must be the receiving end of the channel `output`
    /// reports finished units and device failures on.
    #[must_use]
    pub fn new(
        transport: Arc<dyn VoiceTransport>,
        input: Box<dyn AudioInput>,
        output: Box<dyn AudioOutput>,
        playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(SessionStatus::default());

        Self {
            transport,
            input,
            playback: PlaybackScheduler::new(output),
            playback_rx: playback_events,
            events_tx,
            events_rx,
            commands_tx,
            commands_rx: Some(commands_rx),
            status_tx,
            state: SessionState::Idle,
            last_error: None,
            current: None,
            next_session: 1,
            device: None,
            connect_task: None,
            early_events: Vec::new(),
            link: None,
            capture: None,
            level: LevelMeter::new(),
        }
    }

    /// Start with output gain at zero
    #[must_use]
    pub fn start_muted(mut self, muted: bool) -> Self {
        self.playback.set_muted(muted);
        self.publish();
        self
    }

    /// Cloneable upward interface driving this controller's [`run`](Self::run) loop
    #[must_use]
    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            commands: self.commands_tx.clone(),
            status: self.status_tx.subscribe(),
            level: self.level.clone(),
        }
    }

    /// `Idle`/`Error` → `Connecting`: acquire the microphone and open a link
    ///
    /// Failures land in `Error` with a user-facing message.
    pub fn start(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Error => {}
            SessionState::Connecting | SessionState::Live => {
                tracing::debug!(state = %self.state, "start ignored, session already active");
                return;
            }
            SessionState::Closed => {
                tracing::warn!("start rejected, controller is closed");
                return;
            }
        }

        self.last_error = None;

        let device = match self.input.acquire() {
            Ok(device) => device,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        self.device = Some(device);

        let session = self.next_session;
        self.next_session += 1;
        self.current = Some(session);
        self.set_state(SessionState::Connecting);

        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        self.connect_task = Some(tokio::spawn(async move {
            let kind = match transport.connect(session, events.clone()).await {
                Ok(link) => SessionEvent::Open(link),
                Err(e) => SessionEvent::ConnectFailed(e),
            };
            let _ = events.send(LiveEvent { session, kind });
        }));
    }

    /// Any state → `Idle`, releasing everything; no-op while `Idle`
    pub fn stop(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Closed => return,
            SessionState::Connecting | SessionState::Live | SessionState::Error => {}
        }
        self.teardown();
        self.last_error = None;
        self.set_state(SessionState::Idle);
    }

    /// Silence or restore playback; ignored while `Idle`
    pub fn set_muted(&mut self, muted: bool) {
        if matches!(self.state, SessionState::Idle | SessionState::Closed) {
            tracing::debug!(muted, state = %self.state, "mute ignored, no active session");
            return;
        }
        if self.playback.is_muted() != muted {
            self.playback.set_muted(muted);
            tracing::info!(muted, "output mute changed");
            self.publish();
        }
    }

    /// Release everything and enter the terminal `Closed` state
    pub fn shutdown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.teardown();
        self.set_state(SessionState::Closed);
    }

    /// Apply one control command; returns `false` once shut down
    pub fn apply(&mut self, command: ControlCommand) -> bool {
        match command {
            ControlCommand::Start => self.start(),
            ControlCommand::Stop => self.stop(),
            ControlCommand::SetMuted(muted) => self.set_muted(muted),
            ControlCommand::Shutdown => self.shutdown(),
        }
        self.state != SessionState::Closed
    }

    /// Dispatch one event from a live link
    pub fn handle_event(&mut self, event: LiveEvent) {
        if self.current != Some(event.session) {
            tracing::trace!(session = event.session, kind = ?event.kind, "ignoring stale session event");
            if let SessionEvent::Open(mut link) = event.kind {
                link.close();
            }
            return;
        }

        match event.kind {
            SessionEvent::Open(link) => self.on_open(link),
            SessionEvent::ConnectFailed(e) => self.fail(e),
            // The reader may forward traffic before the connect task posts Open
            kind if self.state == SessionState::Connecting => {
                tracing::trace!(kind = ?kind, "holding session event until open");
                self.early_events.push(kind);
            }
            SessionEvent::Message(message) => self.on_message(&message),
            SessionEvent::Error(reason) => self.fail(Error::Connection(reason)),
            SessionEvent::Closed(reason) => self.on_close(reason),
        }
    }

    /// Dispatch one notification from the output device
    pub fn handle_playback_event(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Ended(id) => {
                self.playback.on_unit_ended(id);
            }
            PlaybackEvent::Failed(reason) => {
                if self.state == SessionState::Live {
                    self.fail(Error::Playback(reason));
                } else {
                    tracing::warn!(reason = %reason, state = %self.state, "output failure outside live session");
                }
            }
        }
    }

    fn on_open(&mut self, mut link: Box<dyn LiveLink>) {
        if self.state != SessionState::Connecting {
            link.close();
            return;
        }

        let outbound = link.outbound();
        self.link = Some(link);
        self.connect_task = None;

        let Some(device) = self.device.take() else {
            self.fail(Error::PermissionDenied("microphone released before open".to_string()));
            return;
        };

        // Capture only begins once the link is usable
        match CaptureHandle::start(device, outbound, self.level.clone()) {
            Ok(capture) => {
                self.capture = Some(capture);
                self.set_state(SessionState::Live);
            }
            Err(e) => {
                self.fail(e);
                return;
            }
        }

        for kind in std::mem::take(&mut self.early_events) {
            let Some(session) = self.current else { break };
            if self.state != SessionState::Live {
                break;
            }
            self.handle_event(LiveEvent { session, kind });
        }
    }

    fn on_message(&mut self, message: &ServerMessage) {
        if self.state != SessionState::Live {
            return;
        }

        // Barge-in takes effect before any audio in the same message
        if message.is_interrupted() {
            self.playback.interrupt();
        }

        for part in message.audio_parts() {
            let scheduled = part
                .decode_audio(OUTPUT_SAMPLE_RATE, 1)
                .and_then(|frame| self.playback.enqueue(&frame));
            if let Err(e) = scheduled {
                self.fail(e);
                return;
            }
        }

        if message.is_turn_complete() {
            tracing::debug!(active = self.playback.active_len(), "model turn complete");
        }
    }

    fn on_close(&mut self, reason: Option<String>) {
        tracing::info!(reason = reason.as_deref().unwrap_or(""), "live session closed by remote");
        self.teardown();
        self.set_state(SessionState::Idle);
    }

    fn fail(&mut self, error: Error) {
        tracing::error!(error = %error, state = %self.state, "voice session failed");
        self.teardown();
        self.last_error = Some(error.user_message().to_string());
        self.set_state(SessionState::Error);
    }

    /// Release every session resource; safe in any state
    fn teardown(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.current = None;
        self.early_events.clear();
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut device) = self.device.take() {
            device.stop();
        }
        if let Some(mut link) = self.link.take() {
            let dropped = link.outbound().dropped_frames();
            if dropped > 0 {
                tracing::debug!(dropped, "outbound frames dropped during session");
            }
            link.close();
        }
        self.playback.reset();
        self.level.reset();
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::info!(from = %self.state, to = %state, "session state changed");
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status());
    }

    /// Wait for the next link or playback event and handle it
    ///
    /// Returns `false` only if both event sources are exhausted.
    pub async fn process_next_event(&mut self) -> bool {
        tokio::select! {
            biased;
            Some(event) = self.events_rx.recv() => {
                self.handle_event(event);
                true
            }
            Some(event) = self.playback_rx.recv() => {
                self.handle_playback_event(event);
                true
            }
            else => false,
        }
    }

    /// Handle every event already queued without waiting
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        while let Ok(event) = self.playback_rx.try_recv() {
            self.handle_playback_event(event);
            handled += 1;
        }
        handled
    }

    /// Run the event loop until shut down through a [`ControllerHandle`]
    ///
    /// Commands take priority over link events, which take priority over
    /// playback completions.
    #[allow(clippy::future_not_send)]
    pub async fn run(mut self) {
        let Some(mut commands) = self.commands_rx.take() else {
            tracing::warn!("controller loop already consumed");
            return;
        };

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown();
                        break;
                    };
                    if !self.apply(command) {
                        break;
                    }
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(event) = self.playback_rx.recv() => self.handle_playback_event(event),
            }
        }

        tracing::debug!("controller loop finished");
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            last_error: self.last_error.clone(),
            muted: self.playback.is_muted(),
        }
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    #[must_use]
    pub const fn playback(&self) -> &PlaybackScheduler {
        &self.playback
    }

    /// Whether the capture pipeline is running
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.capture.as_ref().is_some_and(CaptureHandle::is_active)
    }

    /// Session id of the current attempt, if any
    #[must_use]
    pub const fn current_session(&self) -> Option<SessionId> {
        self.current
    }

    #[must_use]
    pub fn volume_level(&self) -> f32 {
        self.level.get()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Upward interface to a running [`SessionController`]
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<ControlCommand>,
    status: watch::Receiver<SessionStatus>,
    level: LevelMeter,
}

impl ControllerHandle {
    fn send(&self, command: ControlCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Connection("session controller has stopped".to_string()))
    }

    /// Request a new conversation
    ///
    /// # Errors
    ///
    /// Returns error if the controller loop has exited
    pub fn open_session(&self) -> Result<()> {
        self.send(ControlCommand::Start)
    }

    /// End the current conversation
    ///
    /// # Errors
    ///
    /// Returns error if the controller loop has exited
    pub fn close_session(&self) -> Result<()> {
        self.send(ControlCommand::Stop)
    }

    /// Mute or unmute model speech
    ///
    /// # Errors
    ///
    /// Returns error if the controller loop has exited
    pub fn mute(&self, muted: bool) -> Result<()> {
        self.send(ControlCommand::SetMuted(muted))
    }

    /// Release everything and stop the controller loop
    ///
    /// # Errors
    ///
    /// Returns error if the controller loop has already exited
    pub fn shutdown(&self) -> Result<()> {
        self.send(ControlCommand::Shutdown)
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.status.borrow().is_live()
    }

    /// Latest microphone level in [0, 1]
    #[must_use]
    pub fn volume_level(&self) -> f32 {
        self.level.get()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.status.borrow().last_error.clone()
    }

    /// Receiver notified on every status change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }
}
