//! Error types for the coordination engine.

use std::fmt;
use std::path::PathBuf;

use coedit_proto::{ContentVersion, ContextId, DesignId, OperationKind, ProtocolError};
use thiserror::Error;

/// Why a session token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
	/// Never issued, or already consumed.
	Unknown,
	/// Issued for a different design, user or secret.
	Mismatch,
	/// Issued too long ago.
	Expired,
}

impl fmt::Display for TokenRejection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Unknown => "unknown or already used",
			Self::Mismatch => "binding mismatch",
			Self::Expired => "expired",
		})
	}
}

/// A join was attempted with a token that cannot be redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session token: {0}")]
pub struct InvalidSessionToken(pub TokenRejection);

/// The transport behind a session context is gone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport for context {0} is closed")]
pub struct DeliveryError(pub ContextId);

/// Failures reported by the storage collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
	/// No command was committed at the given version.
	#[error("design {design} has no command at version {version}")]
	UnknownVersion {
		/// Design that was addressed.
		design: DesignId,
		/// Version that was looked up.
		version: ContentVersion,
	},

	/// Canonical content would move behind what is already stored.
	#[error("design {design} is rolled up to {stored}, refusing to store {attempted}")]
	StaleCanonical {
		/// Design that was addressed.
		design: DesignId,
		/// Version already stored.
		stored: ContentVersion,
		/// Version that was offered.
		attempted: ContentVersion,
	},

	/// The backing store failed.
	#[error("storage backend failure: {0}")]
	Backend(String),
}

/// Failures reported by the command executor.
#[derive(Debug, Error)]
pub enum CommandApplyError {
	/// A command payload could not be understood.
	#[error("command #{index} has an invalid payload: {reason}")]
	InvalidPayload {
		/// Position of the command in the applied batch.
		index: usize,
		/// Parser message.
		reason: String,
	},

	/// A command does not fit the document it is applied to.
	#[error("command #{index} cannot be applied: {reason}")]
	Rejected {
		/// Position of the command in the applied batch.
		index: usize,
		/// Why the command does not apply.
		reason: String,
	},

	/// The executor task did not complete.
	#[error("executor task aborted: {0}")]
	Aborted(String),
}

/// A rollup cycle was abandoned. Stored state is left untouched.
#[derive(Debug, Error)]
pub enum RollupError {
	/// The executor refused one of the pending commands.
	#[error("command application failed: {0}")]
	CommandApply(#[from] CommandApplyError),

	/// Reading the log or writing the new canonical content failed.
	#[error("persistence failed: {0}")]
	Persistence(#[from] StorageError),
}

/// Failures of the event distribution backbone.
#[derive(Debug, Error)]
pub enum BackboneError {
	/// The backbone was stopped; nothing more can be published.
	#[error("backbone is stopped")]
	Stopped,

	/// A participant counter went negative.
	///
	/// The counter is only ever changed by commutative merges, so this
	/// indicates a join/leave bookkeeping bug. It is reported, never corrected.
	#[error("participant counter for design {design} is inconsistent ({value})")]
	CounterInconsistency {
		/// Design whose counter is wrong.
		design: DesignId,
		/// Observed value.
		value: i64,
	},

	/// An envelope could not be encoded.
	#[error(transparent)]
	Codec(#[from] ProtocolError),
}

/// Errors surfaced by the coordinator entry points.
#[derive(Debug, Error)]
pub enum EngineError {
	/// Join rejected.
	#[error(transparent)]
	Token(#[from] InvalidSessionToken),

	/// A client message could not be decoded.
	#[error(transparent)]
	Protocol(#[from] ProtocolError),

	/// The context is not part of the design's local session.
	#[error("context {context} is not in a session for design {design}")]
	UnknownContext {
		/// Design that was addressed.
		design: DesignId,
		/// Context that was addressed.
		context: ContextId,
	},

	/// Clients may not submit this operation.
	#[error("'{0}' operations are produced by the server only")]
	ServerOnlyOperation(OperationKind),

	/// The storage collaborator failed.
	#[error(transparent)]
	Storage(#[from] StorageError),

	/// The backbone failed.
	#[error(transparent)]
	Backbone(#[from] BackboneError),
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error reading a configuration file.
	#[error("I/O error reading {path}: {error}")]
	Io {
		/// Path to the file that failed to read.
		path: PathBuf,
		/// The underlying I/O error.
		error: std::io::Error,
	},

	/// Error parsing TOML.
	#[error("TOML parse error: {0}")]
	Toml(#[from] toml::de::Error),

	/// A value is out of range.
	#[error("invalid value for '{key}': {reason}")]
	Invalid {
		/// Offending key.
		key: &'static str,
		/// What is wrong with it.
		reason: String,
	},
}

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, EngineError>;
