//! Gateway session: one shard, one socket
//!
//! [`Shard`] is the connection state machine. It consumes decoded envelopes,
//! close codes and heartbeat firings and answers with [`Directive`]s; it never
//! touches the socket. [`GatewaySession`] owns the socket, the
//! [`FrameDecoder`] and the shard, and runs them on a single task so the state
//! machine is never entered concurrently.
//!
//! ```text
//! Idle → Connecting → AwaitingHello → Authenticating → Ready
//!                          ▲                              │
//!                          └──────── Reconnecting ◄───────┘   (fatal close → Closed)
//! ```

use super::decoder::FrameDecoder;
use super::heartbeat::{Beat, HeartbeatTimer};
use super::identify::IdentifyQueue;
use super::opcode::{classify_close, close_code, CloseAction, OpCode};
use super::payload::{
    ConnectionProperties, Envelope, HelloPayload, IdentifyPayload, PresenceUpdate, ReadyPayload,
    RequestGuildMembers, ResumePayload, VoiceStateUpdate,
};
use super::state::{ConnectionState, ShardState};
use crate::config::{ReconnectPolicy, SessionConfig};
use crate::context::Context;
use crate::error::{GatewayError, ProtocolError};
use crate::events::{DispatchEvent, EventBus};
use crate::metrics::GatewayMetrics;

use futures_util::{Sink, SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on the close handshake of a connection being replaced
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shard identity: `[id, count]` in Identify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardInfo {
    pub id: u64,
    pub total: u64,
}

/// Why a connection is being replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    /// Reconnect opcode from the server
    Requested,
    InvalidSession { resumable: bool },
    Closed(Option<u16>),
    /// Heartbeats went unacknowledged
    Zombie,
    Protocol,
    Transport,
}

impl ReconnectReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::InvalidSession { .. } => "invalid_session",
            Self::Closed(_) => "closed",
            Self::Zombie => "zombie",
            Self::Protocol => "protocol",
            Self::Transport => "transport",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconnect {
    pub reason: ReconnectReason,
    /// The next handshake will be a Resume
    pub resume: bool,
    /// Wait a random 1-5s before reconnecting (when the policy allows it)
    pub jitter: bool,
    /// Close code to send if the socket is still open
    pub close_code: Option<u16>,
}

/// What the driver must do after the state machine consumed an input
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Send(Envelope),
    Emit(DispatchEvent),
    HeartbeatAcked(Option<Duration>),
    Reconnect(Reconnect),
}

/// Connection state machine for one shard
#[derive(Debug)]
pub struct Shard {
    info: ShardInfo,
    token: String,
    large_threshold: u16,
    properties: ConnectionProperties,
    session_id: Option<String>,
    last_seq: Option<u64>,
    user: Option<Value>,
    state: ConnectionState,
    heartbeat: HeartbeatTimer,
    reached_ready: bool,
}

impl Shard {
    pub fn new(info: ShardInfo, config: &SessionConfig) -> Self {
        Self {
            info,
            token: config.token.clone(),
            large_threshold: config.large_threshold,
            properties: ConnectionProperties::default(),
            session_id: None,
            last_seq: None,
            user: None,
            state: ConnectionState::Idle,
            heartbeat: HeartbeatTimer::new(),
            reached_ready: false,
        }
    }

    pub fn info(&self) -> ShardInfo {
        self.info
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Current user object from READY
    pub fn user(&self) -> Option<&Value> {
        self.user.as_ref()
    }

    pub fn ack_missed(&self) -> u32 {
        self.heartbeat.ack_missed()
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat.period()
    }

    /// Whether Ready/Resumed was reached since the last `begin_connect`
    pub fn reached_ready(&self) -> bool {
        self.reached_ready
    }

    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
        self.reached_ready = false;
    }

    pub fn socket_opened(&mut self) {
        self.state = ConnectionState::AwaitingHello;
    }

    /// Tear down per-connection state; the session identity survives.
    pub fn connection_lost(&mut self) {
        self.heartbeat.stop();
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Reconnecting;
        }
    }

    pub fn close(&mut self) {
        self.heartbeat.stop();
        self.state = ConnectionState::Closed;
    }

    /// Feed one decoded envelope
    pub fn handle(&mut self, envelope: Envelope) -> Vec<Directive> {
        let shard_id = self.info.id;

        match envelope.op {
            OpCode::Hello => {
                let hello = match HelloPayload::deserialize(&envelope.d) {
                    Ok(hello) => hello,
                    Err(e) => return vec![self.protocol_error(&ProtocolError::Decode(e))],
                };
                let period = Duration::from_millis(hello.heartbeat_interval);
                self.heartbeat.start(period);
                self.state = ConnectionState::Authenticating;
                debug!(shard_id, interval_ms = hello.heartbeat_interval, "Hello received");
                vec![Directive::Send(self.handshake())]
            }
            OpCode::Dispatch => self.handle_dispatch(envelope),
            OpCode::HeartbeatAck => {
                self.heartbeat.ack();
                vec![Directive::HeartbeatAcked(self.heartbeat.latency())]
            }
            OpCode::Heartbeat => {
                self.heartbeat.record_sent();
                vec![Directive::Send(Envelope::heartbeat(self.last_seq))]
            }
            OpCode::Reconnect => {
                info!(shard_id, "Gateway requested reconnect");
                vec![Directive::Reconnect(self.reconnect(ReconnectReason::Requested))]
            }
            OpCode::InvalidSession => {
                let resumable = envelope.d.as_bool().unwrap_or(false);
                if !resumable {
                    self.forget_session();
                }
                warn!(shard_id, resumable, "Session invalidated");
                let mut reconnect = self.reconnect(ReconnectReason::InvalidSession { resumable });
                reconnect.jitter = true;
                vec![Directive::Reconnect(reconnect)]
            }
            other => {
                debug!(shard_id, op = %other, "Ignoring client-only opcode");
                Vec::new()
            }
        }
    }

    /// The heartbeat timer fired
    pub fn heartbeat_due(&mut self) -> Directive {
        match self.heartbeat.fire() {
            Beat::Send => Directive::Send(Envelope::heartbeat(self.last_seq)),
            Beat::Zombie => {
                warn!(
                    shard_id = self.info.id,
                    ack_missed = self.heartbeat.ack_missed(),
                    "Heartbeats unacknowledged, abandoning connection"
                );
                Directive::Reconnect(self.reconnect(ReconnectReason::Zombie))
            }
        }
    }

    /// The socket closed (`None`: dropped without a close frame)
    pub fn handle_close(&mut self, code: Option<u16>) -> Result<Reconnect, GatewayError> {
        let shard_id = self.info.id;
        let raw = code.unwrap_or_default();

        match classify_close(code) {
            CloseAction::Resume => {
                info!(shard_id, close_code = ?code, "Gateway connection closed");
            }
            CloseAction::Reidentify => {
                warn!(shard_id, close_code = raw, "Session no longer resumable");
                self.forget_session();
            }
            CloseAction::FatalAuthentication => {
                self.close();
                return Err(GatewayError::Authentication { shard_id, code: raw });
            }
            CloseAction::FatalSharding => {
                self.close();
                return Err(GatewayError::Sharding { shard_id, code: raw });
            }
            CloseAction::FatalRejected => {
                self.close();
                return Err(GatewayError::Rejected { shard_id, code: raw });
            }
        }

        let mut reconnect = self.reconnect(ReconnectReason::Closed(code));
        reconnect.close_code = None;
        Ok(reconnect)
    }

    /// A frame failed to decode
    pub fn protocol_error(&mut self, error: &ProtocolError) -> Directive {
        warn!(shard_id = self.info.id, error = %error, "Protocol error, reconnecting");
        Directive::Reconnect(self.reconnect(ReconnectReason::Protocol))
    }

    fn handle_dispatch(&mut self, envelope: Envelope) -> Vec<Directive> {
        let shard_id = self.info.id;

        if let Some(seq) = envelope.s {
            self.last_seq = Some(self.last_seq.map_or(seq, |last| last.max(seq)));
        }

        let Some(name) = envelope.t else {
            warn!(shard_id, seq = ?envelope.s, "Dispatch without event name");
            return Vec::new();
        };

        match name.as_str() {
            "READY" => match ReadyPayload::deserialize(&envelope.d) {
                Ok(ready) => {
                    info!(
                        shard_id,
                        guilds = ready.guilds.len(),
                        session_id = %ready.session_id,
                        "Shard ready"
                    );
                    self.session_id = Some(ready.session_id);
                    self.user = Some(ready.user);
                    self.mark_ready();
                }
                Err(e) => return vec![self.protocol_error(&ProtocolError::Decode(e))],
            },
            "RESUMED" => {
                info!(shard_id, seq = ?self.last_seq, "Shard resumed");
                self.mark_ready();
            }
            _ => {}
        }

        vec![Directive::Emit(DispatchEvent {
            shard_id,
            name,
            sequence: envelope.s,
            payload: envelope.d,
        })]
    }

    fn mark_ready(&mut self) {
        self.state = ConnectionState::Ready;
        self.reached_ready = true;
    }

    fn forget_session(&mut self) {
        self.session_id = None;
        self.last_seq = None;
    }

    fn reconnect(&self, reason: ReconnectReason) -> Reconnect {
        Reconnect {
            reason,
            resume: self.session_id.is_some(),
            jitter: false,
            close_code: Some(close_code::CLIENT_RECONNECT),
        }
    }

    /// Resume when a session exists, Identify otherwise
    fn handshake(&self) -> Envelope {
        match &self.session_id {
            Some(session_id) => {
                debug!(shard_id = self.info.id, seq = ?self.last_seq, "Resuming session");
                Envelope::resume(&ResumePayload {
                    token: self.token.clone(),
                    session_id: session_id.clone(),
                    seq: self.last_seq,
                })
            }
            None => {
                debug!(shard_id = self.info.id, "Identifying");
                Envelope::identify(&IdentifyPayload {
                    token: self.token.clone(),
                    properties: self.properties.clone(),
                    // Transport compression is negotiated in the URL; the
                    // per-payload mode cannot be layered on top of it.
                    compress: false,
                    large_threshold: self.large_threshold,
                    shard: [self.info.id, self.info.total],
                })
            }
        }
    }
}

/// Send a close frame and flush the socket, giving up after `limit` so a dead
/// peer cannot hold up the reconnect. Returns whether the close completed.
async fn close_within<S>(
    ws: &mut S,
    frame: CloseFrame<'static>,
    limit: Duration,
    shard_id: u64,
) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let close = async move {
        ws.send(Message::Close(Some(frame))).await?;
        ws.close().await
    };
    match tokio::time::timeout(limit, close).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(shard_id, error = %e, "Close handshake failed");
            false
        }
        Err(_) => {
            debug!(shard_id, "Close handshake timed out");
            false
        }
    }
}

/// Caller-side handle to a running session
#[derive(Debug, Clone)]
pub struct ShardHandle {
    info: ShardInfo,
    commands: mpsc::UnboundedSender<Envelope>,
    state: ShardState,
}

impl ShardHandle {
    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn info(&self) -> ShardInfo {
        self.info
    }

    pub fn state(&self) -> Option<ConnectionState> {
        self.state.get_state(self.info.id)
    }

    pub fn latency(&self) -> Option<Duration> {
        self.state.latency(self.info.id)
    }

    /// Returns false once the session has stopped.
    pub fn update_presence(&self, presence: &PresenceUpdate) -> bool {
        self.commands.send(Envelope::status_update(presence)).is_ok()
    }

    pub fn update_voice_state(&self, voice: &VoiceStateUpdate) -> bool {
        self.commands.send(Envelope::voice_state_update(voice)).is_ok()
    }

    pub fn request_guild_members(&self, request: &RequestGuildMembers) -> bool {
        self.commands
            .send(Envelope::request_guild_members(request))
            .is_ok()
    }
}

/// Drives one [`Shard`] over a real socket until shutdown or a fatal close.
pub struct GatewaySession {
    shard: Shard,
    url: String,
    policy: ReconnectPolicy,
    decoder: FrameDecoder,
    commands: mpsc::UnboundedReceiver<Envelope>,
    events: EventBus,
    state: ShardState,
    identify: Arc<IdentifyQueue>,
    metrics: Arc<GatewayMetrics>,
}

impl GatewaySession {
    /// `url` is the full gateway URL including query parameters. Sessions of
    /// one bot must share `identify`.
    pub fn new(
        info: ShardInfo,
        url: impl Into<String>,
        config: &SessionConfig,
        ctx: &Context,
        state: ShardState,
        identify: Arc<IdentifyQueue>,
    ) -> (Self, ShardHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ShardHandle {
            info,
            commands: tx,
            state: state.clone(),
        };
        let session = Self {
            shard: Shard::new(info, config),
            url: url.into(),
            policy: config.reconnect.clone(),
            decoder: FrameDecoder::new(),
            commands: rx,
            events: ctx.events.clone(),
            state,
            identify,
            metrics: Arc::clone(&ctx.metrics),
        };
        (session, handle)
    }

    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    /// Run until a fatal error. Recoverable failures reconnect internally.
    pub async fn run(mut self) -> Result<(), GatewayError> {
        let shard_id = self.shard.info().id;
        let mut consecutive_failures: u32 = 0;

        info!(shard_id, total = self.shard.info().total, "Shard starting");

        loop {
            self.shard.begin_connect();
            self.report_state();

            if self.shard.session_id().is_none() {
                let waited = self.identify.acquire(shard_id).await;
                if !waited.is_zero() {
                    debug!(shard_id, waited_ms = waited.as_millis() as u64, "Identify slot granted");
                }
            }

            let mut ws = match self.connect().await {
                Ok(ws) => ws,
                Err(err) => return Err(self.fail(err)),
            };

            self.shard.socket_opened();
            self.report_state();
            self.decoder.reset();

            let outcome = self.drive(&mut ws).await;
            self.shard.connection_lost();
            self.decoder.reset();

            let reconnect = match outcome {
                Ok(reconnect) => reconnect,
                Err(err) => return Err(self.fail(err)),
            };

            if let Some(code) = reconnect.close_code {
                let frame = CloseFrame {
                    code: WsCloseCode::from(code),
                    reason: "reconnecting".into(),
                };
                close_within(&mut ws, frame, CLOSE_TIMEOUT, shard_id).await;
            }
            drop(ws);

            if self.shard.reached_ready() {
                consecutive_failures = 0;
            } else {
                consecutive_failures += 1;
            }
            if consecutive_failures >= self.policy.max_consecutive_failures {
                return Err(self.fail(GatewayError::ShardCircuitBroken {
                    shard_id,
                    count: consecutive_failures,
                    max: self.policy.max_consecutive_failures,
                }));
            }

            self.report_state();
            self.state.record_reconnect(shard_id);
            self.metrics.record_reconnect(shard_id, reconnect.reason.label());

            let delay = self.reconnect_delay(&reconnect, consecutive_failures);
            info!(
                shard_id,
                reason = reconnect.reason.label(),
                resume = reconnect.resume,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn reconnect_delay(&self, reconnect: &Reconnect, consecutive_failures: u32) -> Duration {
        if reconnect.jitter && self.policy.invalid_session_jitter {
            return Duration::from_millis(rand::thread_rng().gen_range(1_000..=5_000));
        }
        self.policy.backoff(consecutive_failures)
    }

    async fn connect(&self) -> Result<WsStream, GatewayError> {
        let shard_id = self.shard.info().id;
        let attempts = self.policy.max_connect_attempts.max(1);
        let mut last_error: Box<dyn std::error::Error + Send + Sync> = "no connection attempt".into();

        for attempt in 1..=attempts {
            match connect_async(self.url.as_str()).await {
                Ok((ws, _response)) => {
                    debug!(shard_id, attempt, "Socket open");
                    return Ok(ws);
                }
                Err(e) => {
                    warn!(shard_id, attempt, error = %e, "Gateway connect failed");
                    last_error = Box::new(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.connect_retry_pause).await;
                    }
                }
            }
        }

        Err(GatewayError::Connection {
            shard_id,
            attempts,
            source: last_error,
        })
    }

    /// Pump one connection until it must be replaced.
    async fn drive(&mut self, ws: &mut WsStream) -> Result<Reconnect, GatewayError> {
        let shard_id = self.shard.info().id;

        loop {
            let directives = tokio::select! {
                _ = self.shard.heartbeat.tick() => vec![self.shard.heartbeat_due()],
                Some(command) = self.commands.recv(), if self.shard.state().is_ready() => {
                    vec![Directive::Send(command)]
                }
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => match self.decoder.push_text(&text) {
                        Ok(envelope) => self.shard.handle(envelope),
                        Err(e) => vec![self.shard.protocol_error(&e)],
                    },
                    Some(Ok(Message::Binary(bytes))) => match self.decoder.push_binary(&bytes) {
                        Ok(Some(envelope)) => self.shard.handle(envelope),
                        Ok(None) => continue,
                        Err(e) => vec![self.shard.protocol_error(&e)],
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code));
                        vec![Directive::Reconnect(self.shard.handle_close(code)?)]
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(shard_id, error = %e, "Gateway socket error");
                        let mut reconnect = self.shard.handle_close(None)?;
                        reconnect.reason = ReconnectReason::Transport;
                        vec![Directive::Reconnect(reconnect)]
                    }
                    None => vec![Directive::Reconnect(self.shard.handle_close(None)?)],
                },
            };

            for directive in directives {
                match directive {
                    Directive::Send(envelope) => {
                        if let Err(e) = ws.send(Message::Text(envelope.to_json())).await {
                            warn!(shard_id, op = %envelope.op, error = %e, "Gateway send failed");
                            let mut reconnect = self.shard.handle_close(None)?;
                            reconnect.reason = ReconnectReason::Transport;
                            return Ok(reconnect);
                        }
                    }
                    Directive::Emit(event) => self.emit(event),
                    Directive::HeartbeatAcked(latency) => {
                        self.state.record_heartbeat(shard_id, latency);
                        self.metrics.record_heartbeat(shard_id, latency);
                    }
                    Directive::Reconnect(reconnect) => return Ok(reconnect),
                }
            }
            self.report_state();
        }
    }

    fn emit(&self, event: DispatchEvent) {
        let shard_id = event.shard_id;
        self.state.record_event(shard_id);
        self.metrics.record_event(shard_id, &event.name);

        if event.name == "READY" {
            let guilds = event.payload["guilds"].as_array().map_or(0, Vec::len);
            self.state.set_guilds(shard_id, guilds as u64);
        }

        self.events.publish(event);
    }

    fn report_state(&self) {
        let shard_id = self.shard.info().id;
        if self.state.get_state(shard_id) != Some(self.shard.state()) {
            self.state.set_state(shard_id, self.shard.state());
            self.metrics.set_shards_ready(self.state.ready_shards());
        }
    }

    fn fail(&mut self, err: GatewayError) -> GatewayError {
        let shard_id = self.shard.info().id;
        self.shard.close();
        self.report_state();
        self.state.record_error(shard_id, &err);
        self.metrics.record_error(shard_id, err.error_type_label());
        error!(shard_id, error = %err, "Shard stopped");
        err
    }
}
