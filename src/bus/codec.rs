//! Wire codec for events.
//!
//! Events travel as UTF-8 JSON objects whose fields mirror the event struct.

use super::event::Event;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode '{event}': {source}")]
    Encode {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Payload for '{event}' is not UTF-8 text: {source}")]
    Utf8 {
        event: &'static str,
        #[source]
        source: std::str::Utf8Error,
    },

    #[error("Failed to decode '{event}': {source}")]
    Decode {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode an event to its text payload.
pub fn encode<E: Event>(event: &E) -> Result<Vec<u8>> {
    serde_json::to_string(event)
        .map(String::into_bytes)
        .map_err(|source| CodecError::Encode {
            event: E::event_name(),
            source,
        })
}

/// Decode a text payload into an `E`.
pub fn decode<E: Event>(payload: &[u8]) -> Result<E> {
    let text = std::str::from_utf8(payload).map_err(|source| CodecError::Utf8 {
        event: E::event_name(),
        source,
    })?;

    serde_json::from_str(text).map_err(|source| CodecError::Decode {
        event: E::event_name(),
        source,
    })
}
