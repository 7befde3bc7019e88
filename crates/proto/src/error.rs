//! Errors raised while encoding or decoding wire messages.

use thiserror::Error;

use crate::operation::OperationKind;

/// Errors produced by the operation and envelope codecs.
///
/// Every variant is scoped to a single message: callers drop the message and
/// keep serving.
#[derive(Debug, Error)]
pub enum ProtocolError {
	/// The `type` tag does not name any known operation.
	#[error("unknown operation type '{0}'")]
	UnknownOperation(String),

	/// The message is not valid JSON or does not match its variant's shape.
	#[error("malformed message: {0}")]
	Malformed(String),

	/// The message decoded to a different operation than the caller required.
	#[error("expected a '{expected}' operation, got '{actual}'")]
	UnexpectedOperation {
		/// The variant the caller asked for.
		expected: OperationKind,
		/// The variant actually decoded.
		actual: OperationKind,
	},

	/// Encoding failed.
	#[error("failed to encode message: {0}")]
	Encode(#[source] serde_json::Error),
}

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
