//! WebSocket connection lifecycle for the Gemini Live API.
//!
//! # Connection Flow
//!
//! 1. `connect()` - close any previous socket, dial, emit `Open`, send `setup`,
//!    wait for `setupComplete`
//! 2. `send()` / `send_realtime_input()` / `send_tool_response()` - queue frames
//!    on the writer task (non-blocking)
//! 3. events - the reader task decodes frames and publishes them on the bus
//! 4. `disconnect()` - synchronous local teardown, emits the final `Close`
//!
//! The transport never reconnects on its own.

use crate::codec::{self, is_voice_rejection};
use crate::error::{ConnectError, LiveError};
use crate::events::{
    CloseInfo, ConnectionId, EventBus, EventKind, LiveEvent, Subscription, SubscriptionId,
};
use crate::types::{
    Blob, ClientContent, ClientMessage, Content, LiveConfig, Part, RealtimeInput, ToolResponse,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode},
};
use tracing::{debug, info, warn};

/// Public Live API endpoint (API key is appended as `?key=`).
pub const DEFAULT_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where to connect and with which credential.
#[derive(Clone, Debug)]
pub struct Endpoint {
    url: String,
    api_key: SecretString,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: SecretString::from(api_key.into()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_url(&self) -> Result<String, ConnectError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConnectError::InvalidEndpoint(self.url.clone()));
        }
        let key = self.api_key.expose_secret();
        if key.is_empty() {
            return Ok(self.url.clone());
        }
        let separator = if self.url.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}key={}", self.url, separator, key))
    }
}

#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub setup_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            setup_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Publishes the events of one connection and guarantees `Close` is last.
struct Emitter {
    connection: ConnectionId,
    bus: Arc<EventBus>,
    closed: Mutex<bool>,
}

impl Emitter {
    fn new(connection: ConnectionId, bus: Arc<EventBus>) -> Self {
        Self {
            connection,
            bus,
            closed: Mutex::new(false),
        }
    }

    fn emit(&self, event: LiveEvent) {
        let closed = lock(&self.closed);
        if !*closed {
            self.bus.publish(event);
        }
    }

    /// Emits `Close` once; later calls are ignored.
    fn close(&self, code: Option<u16>, reason: String, local: bool) -> bool {
        let mut closed = lock(&self.closed);
        if *closed {
            return false;
        }
        *closed = true;
        self.bus.publish(LiveEvent::Close(CloseInfo {
            connection: self.connection,
            code,
            reason,
            local,
        }));
        true
    }
}

struct ActiveConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Message>,
    pending_calls: Arc<Mutex<HashSet<String>>>,
    emitter: Arc<Emitter>,
    reader: JoinHandle<()>,
}

struct TransportState {
    phase: ConnectionState,
    /// Bumped by every connect and disconnect; an in-flight connect whose
    /// attempt no longer matches has been cancelled.
    attempt: u64,
    active: Option<ActiveConnection>,
}

/// Duplex connection to the Live service. One socket at a time.
pub struct LiveTransport {
    endpoint: Endpoint,
    options: TransportOptions,
    bus: Arc<EventBus>,
    state: Arc<Mutex<TransportState>>,
    next_connection: AtomicU64,
}

impl LiveTransport {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_options(endpoint, TransportOptions::default())
    }

    pub fn with_options(endpoint: Endpoint, options: TransportOptions) -> Self {
        Self {
            endpoint,
            options,
            bus: Arc::new(EventBus::new()),
            state: Arc::new(Mutex::new(TransportState {
                phase: ConnectionState::Idle,
                attempt: 0,
                active: None,
            })),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.bus.subscribe(kinds)
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.bus.subscribe_all()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.state).phase
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The connection that currently owns the transport, open or closed by
    /// the remote but not yet replaced or disconnected.
    pub fn current_connection(&self) -> Option<ConnectionId> {
        lock(&self.state).active.as_ref().map(|c| c.id)
    }

    /// Ids of tool calls received on the current connection and not yet answered.
    pub fn pending_tool_calls(&self) -> Vec<String> {
        let state = lock(&self.state);
        let mut ids: Vec<String> = state
            .active
            .as_ref()
            .map(|c| lock(&c.pending_calls).iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Opens a new connection configured with `config`.
    ///
    /// Any existing connection is closed first. Resolves once the service
    /// acknowledges the setup frame.
    pub async fn connect(&self, config: &LiveConfig) -> Result<ConnectionId, LiveError> {
        self.disconnect();

        let url = self.endpoint.request_url()?;
        let setup = codec::encode(&ClientMessage::Setup(config))?;
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let attempt = {
            let mut state = lock(&self.state);
            state.attempt += 1;
            state.phase = ConnectionState::Connecting;
            state.attempt
        };
        let emitter = Arc::new(Emitter::new(id, self.bus.clone()));

        info!(
            connection = %id,
            endpoint = %self.endpoint.url,
            model = %config.model,
            "Connecting to Live API"
        );
        let ws = match timeout(self.options.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => return Err(self.fail(attempt, None, ConnectError::Dial(e.to_string()))),
            Err(_) => {
                let err = ConnectError::Timeout(self.options.connect_timeout);
                return Err(self.fail(attempt, None, err));
            }
        };
        if !self.is_current_attempt(attempt) {
            return Err(ConnectError::Cancelled.into());
        }

        emitter.emit(LiveEvent::Open(id));
        let (mut sink, mut stream) = ws.split();

        if let Err(e) = sink.send(Message::Text(setup.into())).await {
            let err = ConnectError::Dial(e.to_string());
            return Err(self.fail(attempt, Some(&emitter), err));
        }
        debug!(connection = %id, "Setup frame sent, waiting for setupComplete");

        let setup_result = timeout(
            self.options.setup_timeout,
            await_setup_complete(&mut stream, &emitter),
        )
        .await
        .unwrap_or(Err(ConnectError::SetupTimeout(self.options.setup_timeout)));
        if let Err(e) = setup_result {
            let _ = sink.close().await;
            return Err(self.fail(attempt, Some(&emitter), e));
        }

        let mut state = lock(&self.state);
        if state.attempt != attempt {
            drop(state);
            emitter.close(Some(1000), "connect cancelled".into(), true);
            return Err(ConnectError::Cancelled.into());
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let pending_calls = Arc::new(Mutex::new(HashSet::new()));
        tokio::spawn(write_loop(id, sink, outbound_rx));
        let reader = tokio::spawn(read_loop(
            stream,
            emitter.clone(),
            pending_calls.clone(),
            self.state.clone(),
        ));
        state.active = Some(ActiveConnection {
            id,
            outbound,
            pending_calls,
            emitter,
            reader,
        });
        state.phase = ConnectionState::Open;
        info!(connection = %id, "Live session setup complete");
        Ok(id)
    }

    /// Closes the current connection, if any. Safe to call at any time.
    ///
    /// Also cancels a connect that is still in flight.
    pub fn disconnect(&self) {
        let active = {
            let mut state = lock(&self.state);
            state.attempt += 1;
            if state.phase != ConnectionState::Idle {
                state.phase = ConnectionState::Closed;
            }
            state.active.take()
        };
        if let Some(conn) = active {
            info!(connection = %conn.id, "Disconnecting from Live API");
            let _ = conn.outbound.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            })));
            conn.reader.abort();
            conn.emitter
                .close(Some(1000), "client disconnect".to_string(), true);
        }
    }

    /// Sends a user turn made of `parts`.
    pub fn send(&self, parts: Vec<Part>, turn_complete: bool) -> Result<(), LiveError> {
        let frame = codec::encode(&ClientMessage::ClientContent(ClientContent {
            turns: vec![Content::user(parts)],
            turn_complete,
        }))?;
        let state = lock(&self.state);
        open_connection(&state)?.push(frame)
    }

    /// Streams media (e.g. `audio/pcm;rate=16000` microphone chunks).
    pub fn send_realtime_input(&self, media_chunks: Vec<Blob>) -> Result<(), LiveError> {
        let frame = codec::encode(&ClientMessage::RealtimeInput(RealtimeInput { media_chunks }))?;
        let state = lock(&self.state);
        open_connection(&state)?.push(frame)
    }

    /// Answers tool calls. Every id must belong to an outstanding call of
    /// this connection and appear once; otherwise nothing is sent.
    pub fn send_tool_response(&self, response: &ToolResponse) -> Result<(), LiveError> {
        let frame = codec::encode(&ClientMessage::ToolResponse(response))?;
        let state = lock(&self.state);
        let conn = open_connection(&state)?;
        let mut pending = lock(&conn.pending_calls);

        let mut seen = HashSet::new();
        for r in &response.function_responses {
            if !seen.insert(r.id.as_str()) {
                return Err(LiveError::DuplicateToolResponse(r.id.clone()));
            }
            if !pending.contains(&r.id) {
                return Err(LiveError::UnknownToolCall(r.id.clone()));
            }
        }
        conn.push(frame)?;
        for id in seen {
            pending.remove(id);
        }
        debug!(
            connection = %conn.id,
            count = response.function_responses.len(),
            "Sent tool response"
        );
        Ok(())
    }

    fn is_current_attempt(&self, attempt: u64) -> bool {
        lock(&self.state).attempt == attempt
    }

    /// Records a failed connect and emits `Close` if the socket had opened.
    fn fail(&self, attempt: u64, emitter: Option<&Arc<Emitter>>, err: ConnectError) -> LiveError {
        let cancelled = {
            let mut state = lock(&self.state);
            if state.attempt == attempt {
                state.phase = ConnectionState::Closed;
                false
            } else {
                true
            }
        };
        warn!(error = %err, cancelled, "Live API connect failed");
        if let Some(emitter) = emitter {
            let reason = match &err {
                ConnectError::SetupRejected(reason) | ConnectError::VoiceRejected(reason) => {
                    reason.clone()
                }
                other => other.to_string(),
            };
            emitter.close(None, reason, cancelled);
        }
        if cancelled {
            ConnectError::Cancelled.into()
        } else {
            err.into()
        }
    }
}

impl Drop for LiveTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl ActiveConnection {
    fn push(&self, frame: String) -> Result<(), LiveError> {
        self.outbound
            .send(Message::Text(frame.into()))
            .map_err(|_| LiveError::NotConnected)
    }
}

fn open_connection(state: &TransportState) -> Result<&ActiveConnection, LiveError> {
    match (&state.phase, &state.active) {
        (ConnectionState::Open, Some(conn)) => Ok(conn),
        _ => Err(LiveError::NotConnected),
    }
}

/// Reads frames until `setupComplete`, publishing anything else that decodes.
async fn await_setup_complete(
    stream: &mut SplitStream<WsStream>,
    emitter: &Emitter,
) -> Result<(), ConnectError> {
    while let Some(msg) = stream.next().await {
        let events = match msg {
            Ok(Message::Text(text)) => codec::decode_frame(text.as_bytes()),
            Ok(Message::Binary(data)) => codec::decode_frame(&data),
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "closed before setupComplete".to_string());
                if is_voice_rejection(&reason) {
                    emitter.emit(LiveEvent::VoiceError(reason.clone()));
                    return Err(ConnectError::VoiceRejected(reason));
                }
                return Err(ConnectError::SetupRejected(reason));
            }
            Ok(_) => continue,
            Err(e) => return Err(ConnectError::Dial(e.to_string())),
        };
        match events {
            Ok(events) => {
                let mut complete = false;
                for event in events {
                    complete |= event == LiveEvent::SetupComplete;
                    // the service may still close with an unrelated reason
                    if let LiveEvent::VoiceError(reason) = &event {
                        let reason = reason.clone();
                        emitter.emit(event);
                        return Err(ConnectError::VoiceRejected(reason));
                    }
                    emitter.emit(event);
                }
                if complete {
                    return Ok(());
                }
            }
            Err(e) => warn!(error = %e, "Dropping malformed frame during setup"),
        }
    }
    Err(ConnectError::SetupRejected(
        "connection ended before setupComplete".to_string(),
    ))
}

async fn write_loop(
    id: ConnectionId,
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            warn!(connection = %id, error = %e, "Failed to write to Live WebSocket");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
    debug!(connection = %id, "Writer finished");
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    emitter: Arc<Emitter>,
    pending_calls: Arc<Mutex<HashSet<String>>>,
    state: Arc<Mutex<TransportState>>,
) {
    let id = emitter.connection;
    let (code, reason) = loop {
        let payload = match stream.next().await {
            Some(Ok(Message::Text(text))) => codec::decode_frame(text.as_bytes()),
            Some(Ok(Message::Binary(data))) => codec::decode_frame(&data),
            Some(Ok(Message::Close(frame))) => {
                info!(connection = %id, ?frame, "Live WebSocket closed by server");
                break match frame {
                    Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                    None => (None, String::new()),
                };
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(connection = %id, error = %e, "Error reading from Live WebSocket");
                break (None, e.to_string());
            }
            None => break (None, "stream ended".to_string()),
        };
        let events = match payload {
            Ok(events) => events,
            Err(e) => {
                warn!(connection = %id, error = %e, "Dropping malformed frame");
                continue;
            }
        };
        for event in events {
            match &event {
                LiveEvent::ToolCall(call) => {
                    let mut pending = lock(&pending_calls);
                    pending.extend(call.function_calls.iter().map(|c| c.id.clone()));
                }
                LiveEvent::ToolCallCancellation(cancel) => {
                    let mut pending = lock(&pending_calls);
                    for cancelled in &cancel.ids {
                        pending.remove(cancelled);
                    }
                }
                _ => {}
            }
            emitter.emit(event);
        }
    };

    {
        let mut state = lock(&state);
        if state.active.as_ref().is_some_and(|c| c.id == id) {
            state.phase = ConnectionState::Closed;
        }
    }
    if is_voice_rejection(&reason) {
        emitter.emit(LiveEvent::VoiceError(reason.clone()));
    }
    emitter.close(code, reason, false);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
