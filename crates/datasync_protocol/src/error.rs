//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A persisted model could not be decoded.
    #[error("failed to decode {model_name}: {message}")]
    Decode {
        /// Name of the model being decoded.
        model_name: String,
        /// Decoder message.
        message: String,
    },

    /// A model could not be serialized.
    #[error("failed to encode {model_name}: {message}")]
    Encode {
        /// Name of the model being encoded.
        model_name: String,
        /// Encoder message.
        message: String,
    },

    /// A mutation type string did not match any known type.
    #[error("unknown mutation type: {0}")]
    UnknownMutationType(String),

    /// A required field was missing from a payload.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
}

impl ProtocolError {
    /// Creates a decode error for the given model.
    pub fn decode(model_name: impl Into<String>, message: impl ToString) -> Self {
        Self::Decode {
            model_name: model_name.into(),
            message: message.to_string(),
        }
    }

    /// Creates an encode error for the given model.
    pub fn encode(model_name: impl Into<String>, message: impl ToString) -> Self {
        Self::Encode {
            model_name: model_name.into(),
            message: message.to_string(),
        }
    }
}
