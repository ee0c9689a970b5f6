//! Encoding of outbound frames and decoding of inbound frames into events.

use crate::error::LiveError;
use crate::events::{AudioChunk, LiveEvent};
use crate::types::{ClientMessage, ServerMessage, ServerPart};
use base64::Engine;
use tracing::warn;

/// Output rate of the Live service when the mime type does not say otherwise.
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24_000;

pub(crate) fn encode(message: &ClientMessage<'_>) -> Result<String, LiveError> {
    Ok(serde_json::to_string(message)?)
}

/// Decodes one inbound frame (JSON, sent as text or binary) into events.
///
/// A frame that is valid JSON but matches no known message yields no events.
pub fn decode_frame(payload: &[u8]) -> Result<Vec<LiveEvent>, LiveError> {
    let message: ServerMessage = serde_json::from_slice(payload)
        .map_err(|e| LiveError::MalformedFrame(e.to_string()))?;

    let mut events = Vec::new();

    if let Some(error) = message.error {
        if is_voice_rejection(&error.message) {
            events.push(LiveEvent::VoiceError(error.message));
        } else {
            warn!(message = %error.message, "Live service reported an error");
        }
    }
    if message.setup_complete.is_some() {
        events.push(LiveEvent::SetupComplete);
    }
    if let Some(call) = message.tool_call {
        events.push(LiveEvent::ToolCall(call));
    }
    if let Some(cancellation) = message.tool_call_cancellation {
        events.push(LiveEvent::ToolCallCancellation(cancellation));
    }
    if let Some(content) = message.server_content {
        if content.interrupted {
            events.push(LiveEvent::Interrupted);
            return Ok(events);
        }
        if content.turn_complete {
            events.push(LiveEvent::TurnComplete);
        }
        if let Some(turn) = content.model_turn {
            let mut rest: Vec<ServerPart> = Vec::new();
            for part in turn.parts {
                match part.inline_data.as_ref() {
                    Some(blob) if blob.mime_type.starts_with("audio/pcm") => {
                        let samples = decode_pcm16(&blob.data)?;
                        if !samples.is_empty() {
                            events.push(LiveEvent::Audio(AudioChunk {
                                samples,
                                sample_rate: sample_rate_of(&blob.mime_type),
                            }));
                        }
                    }
                    _ => rest.push(part),
                }
            }
            if !rest.is_empty() {
                events.push(LiveEvent::Content(rest));
            }
        }
    }

    if events.is_empty() {
        warn!(
            frame = %String::from_utf8_lossy(payload),
            "Received unmatched message"
        );
    }
    Ok(events)
}

/// Decodes base64 little-endian PCM16. A trailing odd byte is dropped.
pub fn decode_pcm16(data: &str) -> Result<Vec<i16>, LiveError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| LiveError::MalformedFrame(format!("invalid base64 audio: {e}")))?;
    if bytes.len() % 2 != 0 {
        warn!(len = bytes.len(), "Audio payload has an odd byte count");
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

pub fn encode_pcm16(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Reads `rate=N` from a mime type such as `audio/pcm;rate=24000`.
pub fn sample_rate_of(mime_type: &str) -> u32 {
    mime_type
        .split(';')
        .filter_map(|p| p.trim().strip_prefix("rate="))
        .find_map(|r| r.parse().ok())
        .unwrap_or(DEFAULT_OUTPUT_SAMPLE_RATE)
}

/// True when a close reason or error message is about the configured voice.
pub fn is_voice_rejection(reason: &str) -> bool {
    reason.to_ascii_lowercase().contains("voice")
}
