//! The peer-connection orchestrator.
//!
//! One state machine per session, driving signaling, transport negotiation,
//! recovery, and teardown for either role:
//!
//! ```text
//! Disconnected ──start──► Connecting ──session-created──► WaitingForPeer   (host)
//!                             │  ▲                              │
//!                             │  └────── peer lost ─────────────┤ peer-joined
//!                             ▼                                 ▼
//!                         Streaming ◄──── ICE connected ── Connecting
//! ```
//!
//! The host outlives its peers: a departed or failed client drops the host
//! back to `WaitingForPeer` with the session intact. The client tears down
//! fully on any terminal condition.
//!
//! Everything the UI needs arrives on one event channel; everything the UI
//! wants done goes through one command channel. The orchestrator task owns
//! all the moving parts in between.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use couchcast_core::input::GamepadInputState;
use couchcast_core::protocol::messages::{ClientMessage, ServerMessage};
use couchcast_core::quality::ConnectionQuality;
use couchcast_relay::{IceServer, RelayCredentialService};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::code::generate_session_code;
use crate::input::{InputReceiver, InputSink};
use crate::quality_loop::QualityController;
use crate::sdp::{apply_video_bandwidth, prefer_video_codec};
use crate::signaling::{SignalingClient, SignalingError};
use crate::transport::{
    MediaConfig, PeerTransport, TransportError, TransportEvent, TransportFactory,
};

/// Grace period before an ICE disconnect triggers restart renegotiation.
const RESTART_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Host,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Host only: session registered, no peer yet.
    WaitingForPeer,
    Streaming,
}

/// Everything the UI layer hears about.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    StateChanged(SessionState),
    PeerConnected { peer_id: String },
    PeerDisconnected,
    Error(String),
    LatencyUpdate(ConnectionQuality),
    StreamReceived,
    InputReceived(GamepadInputState),
}

/// Everything the UI layer can ask for.
#[derive(Debug)]
pub enum Command {
    /// Full teardown. Safe to send repeatedly, from any state.
    Teardown,
    SetAdaptive(bool),
    /// Client side: push one polled gamepad state to the host.
    SendInput(GamepadInputState),
}

/// Session-wide settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// This peer's id as it appears in signaling.
    pub peer_id: String,
    /// Encoder ceiling, bits per second.
    pub target_bitrate: u32,
    /// Codec moved to the front of the offer's video section.
    pub preferred_codec: Option<String>,
    /// Whether host capture produced an audio track.
    pub capture_audio: bool,
}

impl OrchestratorConfig {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            target_bitrate: 10_000_000,
            preferred_codec: Some("H264".to_string()),
            capture_audio: false,
        }
    }
}

// ── Collaborator seams ────────────────────────────────────────────────────────

/// Outbound half of the signaling connection, mockable for tests.
#[cfg_attr(test, mockall::automock)]
pub trait SignalChannel: Send + Sync {
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError>;
    fn close(&self);
}

impl SignalChannel for SignalingClient {
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        SignalingClient::send(self, msg)
    }

    fn close(&self) {
        SignalingClient::close(self)
    }
}

/// Where the transport's ICE server list comes from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IceServerSource: Send + Sync {
    async fn ice_servers(&self, user_id: &str) -> Result<Vec<IceServer>, String>;
}

#[async_trait]
impl IceServerSource for RelayCredentialService {
    async fn ice_servers(&self, user_id: &str) -> Result<Vec<IceServer>, String> {
        Ok(RelayCredentialService::ice_servers(self, user_id).await)
    }
}

/// The orchestrator's collaborators, bundled.
pub struct PeerDeps {
    pub signaling: Arc<dyn SignalChannel>,
    pub signal_events: mpsc::UnboundedReceiver<ServerMessage>,
    pub transport_factory: Arc<dyn TransportFactory>,
    pub ice_source: Arc<dyn IceServerSource>,
}

impl PeerDeps {
    /// Dials the signaling server and bundles the rest.
    pub async fn connect(
        signal_addr: &str,
        transport_factory: Arc<dyn TransportFactory>,
        ice_source: Arc<dyn IceServerSource>,
    ) -> Result<Self, SignalingError> {
        let (signaling, signal_events) = SignalingClient::connect(signal_addr).await?;
        Ok(Self {
            signaling: Arc::new(signaling),
            signal_events,
            transport_factory,
            ice_source,
        })
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Caller-facing handle to a running orchestrator task.
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    pub events: mpsc::UnboundedReceiver<UiEvent>,
}

impl OrchestratorHandle {
    pub fn teardown(&self) {
        let _ = self.commands.send(Command::Teardown);
    }

    pub fn set_adaptive(&self, enabled: bool) {
        let _ = self.commands.send(Command::SetAdaptive(enabled));
    }

    pub fn send_input(&self, state: GamepadInputState) {
        let _ = self.commands.send(Command::SendInput(state));
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

enum Step {
    Continue,
    /// A new transport was built; its event stream replaces the old one.
    NewTransport(mpsc::UnboundedReceiver<TransportEvent>),
    Exit,
}

pub struct Orchestrator {
    role: PeerRole,
    config: OrchestratorConfig,
    state: SessionState,
    session_code: String,
    remote_peer: Option<String>,

    signaling: Arc<dyn SignalChannel>,
    transport_factory: Arc<dyn TransportFactory>,
    ice_source: Arc<dyn IceServerSource>,
    transport: Option<Arc<dyn PeerTransport>>,
    quality: Option<QualityController>,
    input: Option<InputReceiver<Box<dyn InputSink>>>,

    ui: mpsc::UnboundedSender<UiEvent>,
    /// Armed while an ICE disconnect waits out the restart grace period.
    restart_at: Option<Instant>,
    torn_down: bool,
}

impl Orchestrator {
    /// Starts hosting: registers a fresh session code and waits for a peer.
    /// Returns the handle and the code to share.
    pub fn start_host(
        config: OrchestratorConfig,
        deps: PeerDeps,
        sink: Box<dyn InputSink>,
    ) -> Result<(OrchestratorHandle, String), OrchestratorError> {
        let session_code = generate_session_code();
        deps.signaling.send(ClientMessage::CreateSession {
            session_code: session_code.clone(),
            host_id: config.peer_id.clone(),
        })?;
        let handle = Self::spawn(
            PeerRole::Host,
            config,
            session_code.clone(),
            deps,
            Some(sink),
        );
        Ok((handle, session_code))
    }

    /// Starts joining an existing session by code.
    pub fn start_client(
        session_code: &str,
        config: OrchestratorConfig,
        deps: PeerDeps,
    ) -> Result<OrchestratorHandle, OrchestratorError> {
        deps.signaling.send(ClientMessage::JoinSession {
            session_code: session_code.to_string(),
            client_id: config.peer_id.clone(),
        })?;
        Ok(Self::spawn(
            PeerRole::Client,
            config,
            session_code.to_string(),
            deps,
            None,
        ))
    }

    fn spawn(
        role: PeerRole,
        config: OrchestratorConfig,
        session_code: String,
        deps: PeerDeps,
        sink: Option<Box<dyn InputSink>>,
    ) -> OrchestratorHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();

        let mut orchestrator = Orchestrator {
            role,
            config,
            state: SessionState::Disconnected,
            session_code,
            remote_peer: None,
            signaling: deps.signaling,
            transport_factory: deps.transport_factory,
            ice_source: deps.ice_source,
            transport: None,
            quality: None,
            input: sink.map(InputReceiver::new),
            ui: ui_tx,
            restart_at: None,
            torn_down: false,
        };
        orchestrator.set_state(SessionState::Connecting);

        tokio::spawn(orchestrator.run(command_rx, deps.signal_events));

        OrchestratorHandle {
            commands: command_tx,
            events: ui_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signal_events: mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        let mut transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>> = None;

        loop {
            let restart_at = self.restart_at;
            let step = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // Every handle dropped: the session is abandoned.
                    None => self.handle_command(Command::Teardown).await,
                },
                msg = signal_events.recv() => match msg {
                    Some(msg) => self.handle_signal(msg).await,
                    None => {
                        debug!("signaling stream ended");
                        self.teardown().await;
                        Step::Exit
                    }
                },
                event = next_event(&mut transport_events) => match event {
                    Some(event) => self.handle_transport(event).await,
                    None => {
                        // Transport event stream gone without a Failed event.
                        transport_events = None;
                        Step::Continue
                    }
                },
                _ = sleep_until_opt(restart_at) => self.handle_restart_deadline().await,
            };

            match step {
                Step::Continue => {}
                Step::NewTransport(rx) => transport_events = Some(rx),
                Step::Exit => break,
            }
        }
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> Step {
        match cmd {
            Command::Teardown => {
                self.teardown().await;
                Step::Exit
            }
            Command::SetAdaptive(enabled) => {
                if let Some(quality) = &self.quality {
                    quality.set_adaptive(enabled);
                }
                Step::Continue
            }
            Command::SendInput(state) => {
                if let Some(transport) = &self.transport {
                    if let Err(e) = crate::input::send_state(transport.as_ref(), &state).await {
                        debug!("input send dropped: {e}");
                    }
                }
                Step::Continue
            }
        }
    }

    // ── Signaling events ──────────────────────────────────────────────────────

    async fn handle_signal(&mut self, msg: ServerMessage) -> Step {
        match msg {
            ServerMessage::SessionCreated => {
                info!("session {} registered", self.session_code);
                match self.build_transport().await {
                    Ok(rx) => {
                        self.set_state(SessionState::WaitingForPeer);
                        Step::NewTransport(rx)
                    }
                    Err(e) => {
                        self.emit(UiEvent::Error(format!("transport setup failed: {e}")));
                        self.teardown().await;
                        Step::Exit
                    }
                }
            }
            ServerMessage::SessionJoined { data } => {
                info!("joined session hosted by {}", data.host_id);
                self.remote_peer = Some(data.host_id);
                match self.build_transport().await {
                    Ok(rx) => Step::NewTransport(rx),
                    Err(e) => {
                        self.emit(UiEvent::Error(format!("transport setup failed: {e}")));
                        self.teardown().await;
                        Step::Exit
                    }
                }
            }
            ServerMessage::SessionNotFound => {
                self.emit(UiEvent::Error(format!(
                    "no session with code {}",
                    self.session_code
                )));
                self.teardown().await;
                Step::Exit
            }
            ServerMessage::PeerJoined { data } => {
                info!("peer {} joined", data.peer_id);
                self.remote_peer = Some(data.peer_id.clone());
                self.set_state(SessionState::Connecting);
                self.emit(UiEvent::PeerConnected {
                    peer_id: data.peer_id,
                });
                if let Err(e) = self.send_offer(false).await {
                    self.emit(UiEvent::Error(format!("offer failed: {e}")));
                }
                Step::Continue
            }
            ServerMessage::PeerLeft { .. } => {
                info!("peer left");
                self.drop_pairing().await
            }
            ServerMessage::HostLeft => {
                self.emit(UiEvent::Error("host ended the session".to_string()));
                self.teardown().await;
                Step::Exit
            }
            ServerMessage::Signal { from, payload } => {
                if let Err(e) = self.handle_negotiation(from, payload).await {
                    warn!("negotiation message failed: {e}");
                }
                Step::Continue
            }
            ServerMessage::Error { message } => {
                self.emit(UiEvent::Error(message));
                Step::Continue
            }
        }
    }

    /// Applies one `signal` payload: offer, answer, or trickled candidate.
    async fn handle_negotiation(
        &mut self,
        from: Option<String>,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        let Some(transport) = self.transport.clone() else {
            debug!("negotiation message before transport exists; dropped");
            return Ok(());
        };

        match payload.get("type").and_then(|t| t.as_str()) {
            Some("offer") => {
                let sdp = payload.get("sdp").and_then(|s| s.as_str()).unwrap_or("");
                transport.set_remote_offer(sdp).await?;
                let answer = transport.create_answer().await?;
                self.send_signal(serde_json::json!({"type": "answer", "sdp": answer}));
            }
            Some("answer") => {
                let sdp = payload.get("sdp").and_then(|s| s.as_str()).unwrap_or("");
                transport.set_remote_answer(sdp).await?;
            }
            Some("candidate") => {
                if let Some(candidate) = payload.get("candidate") {
                    transport.add_remote_candidate(candidate.clone()).await?;
                }
            }
            other => debug!("unknown negotiation payload {other:?} from {from:?}; dropped"),
        }
        Ok(())
    }

    // ── Transport events ──────────────────────────────────────────────────────

    async fn handle_transport(&mut self, event: TransportEvent) -> Step {
        match event {
            TransportEvent::Connected => {
                self.restart_at = None;
                self.set_state(SessionState::Streaming);
                self.start_quality_loop();
                Step::Continue
            }
            TransportEvent::Disconnected => {
                // Often self-heals; give ICE the grace period before
                // forcing a restart. Host drives renegotiation.
                if self.role == PeerRole::Host && self.restart_at.is_none() {
                    self.restart_at = Some(Instant::now() + RESTART_GRACE);
                    debug!("ICE disconnected; restart armed");
                }
                Step::Continue
            }
            TransportEvent::Failed => {
                warn!("ICE failed; pairing is over");
                self.restart_at = None;
                match self.role {
                    PeerRole::Host => self.drop_pairing().await,
                    PeerRole::Client => {
                        self.teardown().await;
                        Step::Exit
                    }
                }
            }
            TransportEvent::LocalCandidate(candidate) => {
                self.send_signal(serde_json::json!({
                    "type": "candidate",
                    "candidate": candidate,
                }));
                Step::Continue
            }
            TransportEvent::StreamReceived => {
                self.emit(UiEvent::StreamReceived);
                Step::Continue
            }
            TransportEvent::InputChannelOpen => {
                debug!("input channel open");
                Step::Continue
            }
            TransportEvent::InputChannelMessage(payload) => {
                if let Some(receiver) = &mut self.input {
                    if let Some(state) = receiver.handle_packet(&payload) {
                        self.emit(UiEvent::InputReceived(state));
                    }
                }
                Step::Continue
            }
        }
    }

    async fn handle_restart_deadline(&mut self) -> Step {
        self.restart_at = None;
        // Connected would have disarmed the timer; still disconnected, so
        // renegotiate with fresh ICE credentials.
        info!("restart grace elapsed; renegotiating with ICE restart");
        if let Err(e) = self.send_offer(true).await {
            self.emit(UiEvent::Error(format!("ICE restart failed: {e}")));
        }
        Step::Continue
    }

    // ── Negotiation helpers ───────────────────────────────────────────────────

    /// Builds a fresh transport seeded with relay ICE servers, attaches
    /// media (host) and pre-negotiates the input channel.
    async fn build_transport(
        &mut self,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let ice_servers = match self.ice_source.ice_servers(&self.config.peer_id).await {
            Ok(servers) if !servers.is_empty() => servers,
            Ok(_) => {
                warn!("ICE source returned nothing; using the public fallback");
                couchcast_relay::public_fallback()
            }
            Err(e) => {
                warn!("ICE source unavailable ({e}); using the public fallback");
                couchcast_relay::public_fallback()
            }
        };

        let (transport, events) = self.transport_factory.create(ice_servers).await?;

        if self.role == PeerRole::Host {
            let media = if self.config.capture_audio {
                MediaConfig::with_audio()
            } else {
                MediaConfig::video_only()
            };
            transport.attach_media(media).await?;
        }
        transport.open_input_channel().await?;

        self.transport = Some(transport);
        Ok(events)
    }

    /// Creates, munges, and sends the host's offer.
    async fn send_offer(&mut self, ice_restart: bool) -> Result<(), TransportError> {
        let Some(transport) = self.transport.clone() else {
            return Err(TransportError::Closed);
        };

        let mut sdp = transport.create_offer(ice_restart).await?;
        sdp = apply_video_bandwidth(&sdp, self.config.target_bitrate / 1000);
        if let Some(codec) = &self.config.preferred_codec {
            sdp = prefer_video_codec(&sdp, codec);
        }

        self.send_signal(serde_json::json!({"type": "offer", "sdp": sdp}));
        Ok(())
    }

    fn send_signal(&self, payload: serde_json::Value) {
        let result = self.signaling.send(ClientMessage::Signal {
            session_code: self.session_code.clone(),
            to: self.remote_peer.clone(),
            from: Some(self.config.peer_id.clone()),
            payload,
        });
        if let Err(e) = result {
            debug!("signal send failed: {e}");
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Host only: the peer is gone but the session lives on. Releases the
    /// pairing's resources, rebuilds a fresh transport for the next peer,
    /// and returns to waiting.
    async fn drop_pairing(&mut self) -> Step {
        self.restart_at = None;
        self.remote_peer = None;
        if let Some(quality) = self.quality.take() {
            quality.stop();
        }
        if let Some(transport) = self.transport.take() {
            let _ = transport.close_input_channel().await;
            let _ = transport.close().await;
        }
        self.emit(UiEvent::PeerDisconnected);
        self.set_state(SessionState::WaitingForPeer);

        match self.build_transport().await {
            Ok(rx) => Step::NewTransport(rx),
            Err(e) => {
                warn!("transport rebuild failed: {e}");
                Step::Continue
            }
        }
    }

    /// Full teardown, idempotent from any state. Release order: quality
    /// loop, data channel, transport, media, session, signaling.
    async fn teardown(&mut self) {
        if self.torn_down {
            debug!("teardown already done");
            return;
        }
        self.torn_down = true;
        self.restart_at = None;

        if let Some(quality) = self.quality.take() {
            quality.stop();
        }
        if let Some(transport) = self.transport.take() {
            let _ = transport.close_input_channel().await;
            let _ = transport.close().await;
            let _ = transport.stop_media().await;
        }
        let _ = self.signaling.send(ClientMessage::LeaveSession {
            session_code: self.session_code.clone(),
        });
        self.signaling.close();

        self.set_state(SessionState::Disconnected);
        info!("session torn down");
    }

    fn start_quality_loop(&mut self) {
        if self.quality.is_some() {
            return;
        }
        let Some(transport) = self.transport.clone() else {
            return;
        };
        // Both roles sample and surface quality; only the host owns the
        // encoder and may move its bitrate.
        let (controller, mut quality_rx) = QualityController::spawn(
            transport,
            self.config.target_bitrate,
            self.role == PeerRole::Host,
        );
        self.quality = Some(controller);

        // Forward snapshots to the UI until the controller stops.
        let ui = self.ui.clone();
        tokio::spawn(async move {
            while quality_rx.changed().await.is_ok() {
                let snapshot = *quality_rx.borrow_and_update();
                if ui.send(UiEvent::LatencyUpdate(snapshot)).is_err() {
                    break;
                }
            }
        });
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!("state {:?} -> {state:?}", self.state);
        self.state = state;
        self.emit(UiEvent::StateChanged(state));
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.ui.send(event);
    }
}

async fn next_event(
    rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
