//! Gemini Live API client
//!
//! A duplex WebSocket client for the `BidiGenerateContent` streaming service:
//!
//! - `types`: the JSON wire format (setup config, content parts, tool calls).
//! - `codec`: frame encoding and decoding into typed events.
//! - `events`: the event enum and the subscription bus that delivers it.
//! - `transport`: connection lifecycle, outbound sends and tool-call bookkeeping.

pub mod codec;
pub mod error;
pub mod events;
pub mod transport;
pub mod types;

pub use error::{ConnectError, LiveError};
pub use events::{
    AudioChunk, CloseInfo, ConnectionId, EventBus, EventKind, LiveEvent, Subscription,
    SubscriptionId,
};
pub use transport::{ConnectionState, DEFAULT_LIVE_URL, Endpoint, LiveTransport, TransportOptions};
pub use types::{
    Blob, Content, FunctionCall, FunctionDeclaration, FunctionResponse, GenerationConfig,
    LiveConfig, Part, ResponseModality, ServerPart, SpeechConfig, Tool, ToolCall,
    ToolCallCancellation, ToolResponse,
};
