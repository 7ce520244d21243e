//! Frame Codec Port (Driven Port)
//!
//! Stateless translation between wire text and domain frames.

use crate::domain::streaming::{ControlFrame, InboundFrame};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame had no `channel` field.
    #[error("frame has no channel")]
    MissingChannel,

    /// A field held a value the codec cannot interpret.
    #[error("invalid {field}: {value}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// Encodes outbound control frames and decodes inbound frames.
pub trait FrameCodec: Send + Sync {
    /// Encode a control frame as wire text.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    fn encode(&self, frame: &ControlFrame) -> Result<String, CodecError>;

    /// Decode one inbound text frame.
    ///
    /// A single wire frame may carry several events (a trades frame with
    /// more than one symbol), so the result is a list.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON or a known channel with an
    /// unexpected payload. Unknown channels decode to
    /// [`InboundFrame::Ignored`].
    fn decode(&self, text: &str) -> Result<Vec<InboundFrame>, CodecError>;
}
