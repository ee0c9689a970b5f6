//! Session Controller
//!
//! Owns the session configuration, routes transport events to audio playback
//! and recovers once from a rejected voice by reconnecting with a fallback.
//!
//! One router task per controller consumes the transport's events in wire
//! order. Connects (user-initiated or recovery) are serialized by an async
//! mutex; all other state sits behind short synchronous locks.

use crate::config::{DEFAULT_FALLBACK_VOICE, with_function_declarations, with_voice};
use crate::instructions::{TutorProfile, apply_profile};
use crate::playback::PlaybackSink;
use gemini_realtime::{
    Blob, ConnectError, ConnectionId, EventKind, FunctionDeclaration, LiveConfig, LiveError,
    LiveEvent, LiveTransport, Part, Subscription, ToolResponse,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of the session as seen by the rest of the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Open,
    /// Reconnecting with the fallback voice after a voice rejection.
    Recovering { voice: String },
    Closed,
    Failed { reason: String },
}

impl SessionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, SessionStatus::Open)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No session config has been set")]
    ConfigNotSet,
    #[error("Voice '{voice}' was rejected after fallback: {reason}")]
    VoiceRejected { voice: String, reason: String },
    #[error(transparent)]
    Live(#[from] LiveError),
}

#[derive(Default)]
struct ControllerState {
    config: Option<LiveConfig>,
    profile: Option<TutorProfile>,
    /// Set once the fallback voice has been tried; cleared by a user connect.
    recovery_used: bool,
}

struct Inner {
    transport: Arc<LiveTransport>,
    playback: Arc<dyn PlaybackSink>,
    fallback_voice: String,
    state: Mutex<ControllerState>,
    status: watch::Sender<SessionStatus>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// The single control surface over one Live session.
///
/// Must be created inside a Tokio runtime: construction spawns the event
/// router, and dropping the controller stops it.
pub struct SessionController {
    inner: Arc<Inner>,
    router: JoinHandle<()>,
}

impl SessionController {
    /// Creates a controller driving `transport` and playing audio into `playback`.
    pub fn new(transport: Arc<LiveTransport>, playback: Arc<dyn PlaybackSink>) -> Self {
        Self::with_fallback_voice(transport, playback, DEFAULT_FALLBACK_VOICE)
    }

    /// Like [`new`](Self::new), with a custom voice to fall back to when the
    /// configured one is rejected.
    pub fn with_fallback_voice(
        transport: Arc<LiveTransport>,
        playback: Arc<dyn PlaybackSink>,
        fallback_voice: impl Into<String>,
    ) -> Self {
        let events = transport.subscribe(&[
            EventKind::Open,
            EventKind::Audio,
            EventKind::Interrupted,
            EventKind::TurnComplete,
            EventKind::VoiceError,
            EventKind::Close,
        ]);
        let inner = Arc::new(Inner {
            transport,
            playback,
            fallback_voice: fallback_voice.into(),
            state: Mutex::new(ControllerState::default()),
            status: watch::Sender::new(SessionStatus::Idle),
            connect_lock: tokio::sync::Mutex::new(()),
        });
        let router = tokio::spawn(route_events(inner.clone(), events));
        Self { inner, router }
    }

    pub fn transport(&self) -> &Arc<LiveTransport> {
        &self.inner.transport
    }

    /// Subscribes to transport events, e.g. tool calls for a tool responder.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.inner.transport.subscribe(kinds)
    }

    // --- Configuration ---

    /// A snapshot of the current configuration.
    pub fn config(&self) -> Option<LiveConfig> {
        self.inner.lock_state().config.clone()
    }

    /// Replaces the configuration. Takes effect on the next connect.
    pub fn set_config(&self, config: LiveConfig) {
        self.inner.lock_state().config = Some(config);
    }

    /// Applies `patch` to the current configuration. Takes effect on the next
    /// connect.
    pub fn update_config(
        &self,
        patch: impl FnOnce(LiveConfig) -> LiveConfig,
    ) -> Result<(), SessionError> {
        let mut state = self.inner.lock_state();
        let config = state.config.take().ok_or(SessionError::ConfigNotSet)?;
        state.config = Some(patch(config));
        Ok(())
    }

    /// Replaces the declared functions, keeping built-in tools. An empty list
    /// removes function declarations from the config.
    pub fn set_tools(&self, declarations: Vec<FunctionDeclaration>) -> Result<(), SessionError> {
        self.update_config(|config| with_function_declarations(config, declarations))
    }

    /// Sets the tutor profile.
    ///
    /// While disconnected the system instruction and voice are rebuilt right
    /// away. While connected the change is held until the next connect, which
    /// always re-applies the current profile.
    pub fn set_profile(&self, profile: TutorProfile) {
        let connected = self.connected();
        let mut state = self.inner.lock_state();
        if !connected {
            if let Some(config) = state.config.take() {
                state.config = Some(apply_profile(config, &profile));
            }
        } else {
            debug!(name = %profile.name, "Session is open, profile applies on next connect");
        }
        state.profile = Some(profile);
    }

    pub fn profile(&self) -> Option<TutorProfile> {
        self.inner.lock_state().profile.clone()
    }

    // --- Lifecycle ---

    /// Opens a session with the current configuration, replacing any open one.
    ///
    /// Resolves once the service has acknowledged setup. If the configured
    /// voice is rejected, reconnects once with the fallback voice.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let _guard = self.inner.connect_lock.lock().await;

        let config = {
            let mut state = self.inner.lock_state();
            let mut config = state.config.take().ok_or(SessionError::ConfigNotSet)?;
            if let Some(profile) = &state.profile {
                config = apply_profile(config, profile);
            }
            state.config = Some(config.clone());
            state.recovery_used = false;
            config
        };

        if self.inner.transport.is_open() {
            self.inner.playback.stop();
        }
        self.inner.set_status(SessionStatus::Connecting);
        info!(model = %config.model, voice = ?config.voice_name(), "Connecting session");

        match self.inner.transport.connect(&config).await {
            Ok(id) => {
                self.inner.mark_open(id);
                Ok(())
            }
            Err(LiveError::Connect(ConnectError::VoiceRejected(reason))) => {
                self.inner.recover(reason).await
            }
            Err(e) => {
                self.inner.connect_failed(&e);
                Err(e.into())
            }
        }
    }

    /// Closes the session and silences playback. Safe to call at any time.
    pub fn disconnect(&self) {
        self.inner.transport.disconnect();
        self.inner.playback.stop();
        self.inner.set_status(SessionStatus::Closed);
    }

    /// True only while a session is open.
    pub fn connected(&self) -> bool {
        self.inner.status.borrow().is_open() && self.inner.transport.is_open()
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    pub fn current_status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    /// Output level of model speech in `[0, 1]`.
    pub fn volume(&self) -> watch::Receiver<f32> {
        self.inner.playback.volume()
    }

    // --- Sending ---

    pub fn send(&self, parts: Vec<Part>, turn_complete: bool) -> Result<(), SessionError> {
        Ok(self.inner.transport.send(parts, turn_complete)?)
    }

    /// Sends a complete user turn made of one text part.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(vec![Part::text(text)], true)
    }

    pub fn send_realtime_input(&self, media_chunks: Vec<Blob>) -> Result<(), SessionError> {
        Ok(self.inner.transport.send_realtime_input(media_chunks)?)
    }

    pub fn send_tool_response(&self, response: &ToolResponse) -> Result<(), SessionError> {
        Ok(self.inner.transport.send_tool_response(response)?)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.router.abort();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                debug!(from = ?current, to = ?status, "Session status changed");
                *current = status;
                true
            }
        });
    }

    /// Records a successful connect, unless the socket already went away.
    fn mark_open(&self, id: ConnectionId) {
        if self.transport.is_open() {
            info!(connection = %id, "Session open");
            self.set_status(SessionStatus::Open);
        } else {
            self.set_status(SessionStatus::Closed);
        }
    }

    fn connect_failed(&self, err: &LiveError) {
        match err {
            // a disconnect overtook the connect and already set the status
            LiveError::Connect(ConnectError::Cancelled) => {
                debug!("Connect cancelled by disconnect");
            }
            _ => {
                error!(error = %err, "Failed to connect session");
                self.set_status(SessionStatus::Failed {
                    reason: err.to_string(),
                });
            }
        }
    }

    /// Reacts to a rejected voice. Must be called with `connect_lock` held.
    ///
    /// The first rejection since the last user connect switches to the
    /// fallback voice and reconnects; any further one fails the session.
    async fn recover(&self, reason: String) -> Result<(), SessionError> {
        let config = {
            let mut state = self.lock_state();
            let rejected = state
                .config
                .as_ref()
                .and_then(|c| c.voice_name())
                .unwrap_or_default()
                .to_string();
            if state.recovery_used {
                drop(state);
                error!(voice = %rejected, reason = %reason, "Voice rejected again, giving up");
                self.transport.disconnect();
                self.playback.stop();
                self.set_status(SessionStatus::Failed {
                    reason: reason.clone(),
                });
                return Err(SessionError::VoiceRejected {
                    voice: rejected,
                    reason,
                });
            }
            let config = state.config.take().ok_or(SessionError::ConfigNotSet)?;
            let config = with_voice(config, &self.fallback_voice);
            state.config = Some(config.clone());
            state.recovery_used = true;
            warn!(
                voice = %rejected,
                fallback = %self.fallback_voice,
                reason = %reason,
                "Voice rejected, reconnecting with fallback voice"
            );
            config
        };

        self.playback.stop();
        self.set_status(SessionStatus::Recovering {
            voice: self.fallback_voice.clone(),
        });
        match self.transport.connect(&config).await {
            Ok(id) => {
                self.mark_open(id);
                Ok(())
            }
            Err(LiveError::Connect(ConnectError::VoiceRejected(reason))) => {
                error!(voice = %self.fallback_voice, reason = %reason, "Fallback voice rejected");
                self.transport.disconnect();
                self.set_status(SessionStatus::Failed {
                    reason: reason.clone(),
                });
                Err(SessionError::VoiceRejected {
                    voice: self.fallback_voice.clone(),
                    reason,
                })
            }
            Err(e) => {
                if !matches!(e, LiveError::Connect(ConnectError::Cancelled)) {
                    self.transport.disconnect();
                }
                self.connect_failed(&e);
                Err(e.into())
            }
        }
    }
}

async fn route_events(inner: Arc<Inner>, mut events: Subscription) {
    // Most recent connection to open; voice errors only ever follow its Open.
    let mut last_open: Option<ConnectionId> = None;

    while let Some(event) = events.recv().await {
        match event {
            LiveEvent::Open(id) => last_open = Some(id),
            LiveEvent::Audio(chunk) => inner.playback.add_pcm16(&chunk.samples, chunk.sample_rate),
            LiveEvent::Interrupted => {
                debug!("Model turn interrupted, stopping playback");
                inner.playback.stop();
            }
            LiveEvent::TurnComplete => debug!("Model turn complete"),
            LiveEvent::VoiceError(reason) => {
                // A rejected connect reports its voice error through its own
                // result, so only voice errors on the live session land here.
                let is_current =
                    last_open.is_some() && last_open == inner.transport.current_connection();
                if !is_current || !inner.status.borrow().is_open() {
                    debug!(reason = %reason, "Ignoring voice error outside an open session");
                    continue;
                }
                let _guard = inner.connect_lock.lock().await;
                if last_open != inner.transport.current_connection() {
                    continue;
                }
                if let Err(e) = inner.recover(reason).await {
                    warn!(error = %e, "Voice recovery failed");
                }
            }
            LiveEvent::Close(close) => {
                if Some(close.connection) != inner.transport.current_connection() {
                    continue;
                }
                info!(
                    connection = %close.connection,
                    code = ?close.code,
                    reason = %close.reason,
                    "Session closed by server"
                );
                inner.playback.stop();
                inner.set_status(SessionStatus::Closed);
            }
            _ => {}
        }
    }
}
