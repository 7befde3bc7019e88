//! Client-facing operations.
//!
//! Operations are the only messages editor clients and server nodes exchange
//! about a design. On the wire each one is a JSON object whose `type` field
//! names the variant; field names are camelCase.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::types::{CommandId, ContentVersion, ContextId};

/// Persisted form of a command, including audit fields.
///
/// This is what the pending command log stores and what rollup replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullCommand {
	/// Version assigned when the command was committed.
	pub content_version: ContentVersion,
	/// Opaque command payload understood by the command executor.
	pub command: Value,
	/// Client-chosen identifier of the command.
	pub command_id: CommandId,
	/// User who submitted the command.
	pub author: String,
	/// Whether the command was undone. Reverted commands are skipped by rollup.
	pub reverted: bool,
}

/// A message exchanged between clients and servers about one design.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Operation {
	/// A participant joined the session.
	Join {
		/// Display identity of the participant.
		user: String,
		/// Context of the participant.
		id: ContextId,
	},
	/// A participant left the session.
	Leave {
		/// Display identity of the participant.
		user: String,
		/// Context of the participant.
		id: ContextId,
	},
	/// A participant moved their selection.
	Selection {
		/// Display identity of the participant.
		user: String,
		/// Context of the participant.
		id: ContextId,
		/// Opaque selection descriptor.
		selection: Value,
	},
	/// Revert the command committed at `content_version`.
	Undo {
		/// Version of the command to revert.
		content_version: ContentVersion,
	},
	/// Re-apply the command committed at `content_version`.
	Redo {
		/// Version of the command to re-apply.
		content_version: ContentVersion,
	},
	/// An edit to apply.
	///
	/// From a client, `content_version` is the version the edit was made
	/// against. From the server, it is the version the edit was committed at.
	Command {
		/// Base or committed content version.
		content_version: ContentVersion,
		/// Opaque command payload.
		command: Value,
		/// Client-chosen identifier of the command.
		command_id: CommandId,
	},
	/// Persisted or replayed form of a command.
	FullCommand(FullCommand),
	/// Server confirmation that a command was durably queued.
	Ack {
		/// Version the command was committed at.
		content_version: ContentVersion,
		/// Identifier of the acknowledged command.
		command_id: CommandId,
	},
}

impl Operation {
	/// Builds a `join` notification.
	pub fn join(user: impl Into<String>, id: ContextId) -> Self {
		Self::Join { user: user.into(), id }
	}

	/// Builds a `leave` notification.
	pub fn leave(user: impl Into<String>, id: ContextId) -> Self {
		Self::Leave { user: user.into(), id }
	}

	/// Returns the variant discriminator.
	pub fn kind(&self) -> OperationKind {
		match self {
			Self::Join { .. } => OperationKind::Join,
			Self::Leave { .. } => OperationKind::Leave,
			Self::Selection { .. } => OperationKind::Selection,
			Self::Undo { .. } => OperationKind::Undo,
			Self::Redo { .. } => OperationKind::Redo,
			Self::Command { .. } => OperationKind::Command,
			Self::FullCommand(_) => OperationKind::FullCommand,
			Self::Ack { .. } => OperationKind::Ack,
		}
	}

	/// Returns the content version carried by versioned variants.
	pub fn content_version(&self) -> Option<ContentVersion> {
		match self {
			Self::Undo { content_version }
			| Self::Redo { content_version }
			| Self::Command { content_version, .. }
			| Self::Ack { content_version, .. } => Some(*content_version),
			Self::FullCommand(full) => Some(full.content_version),
			Self::Join { .. } | Self::Leave { .. } | Self::Selection { .. } => None,
		}
	}
}

/// Discriminator of an [`Operation`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
	/// `join`
	Join,
	/// `leave`
	Leave,
	/// `selection`
	Selection,
	/// `undo`
	Undo,
	/// `redo`
	Redo,
	/// `command`
	Command,
	/// `fullCommand`
	FullCommand,
	/// `ack`
	Ack,
}

impl OperationKind {
	/// All variants, in declaration order.
	pub const ALL: [Self; 8] = [
		Self::Join,
		Self::Leave,
		Self::Selection,
		Self::Undo,
		Self::Redo,
		Self::Command,
		Self::FullCommand,
		Self::Ack,
	];

	/// The wire tag of this variant.
	pub const fn tag(self) -> &'static str {
		match self {
			Self::Join => "join",
			Self::Leave => "leave",
			Self::Selection => "selection",
			Self::Undo => "undo",
			Self::Redo => "redo",
			Self::Command => "command",
			Self::FullCommand => "fullCommand",
			Self::Ack => "ack",
		}
	}

	/// Resolves a wire tag.
	pub fn from_tag(tag: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|kind| kind.tag() == tag)
	}
}

impl fmt::Display for OperationKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.tag())
	}
}

/// Encodes an operation as a JSON text frame.
pub fn serialize(op: &Operation) -> Result<String> {
	serde_json::to_string(op).map_err(ProtocolError::Encode)
}

/// Decodes an operation from a JSON frame.
///
/// When `expected` is set, a well-formed operation of another variant is
/// rejected with [`ProtocolError::UnexpectedOperation`].
///
/// # Errors
///
/// Returns [`ProtocolError::UnknownOperation`] when the `type` tag names no
/// known variant, and [`ProtocolError::Malformed`] for anything else that does
/// not parse.
pub fn deserialize(bytes: impl AsRef<[u8]>, expected: Option<OperationKind>) -> Result<Operation> {
	let value: Value = serde_json::from_slice(bytes.as_ref()).map_err(|err| ProtocolError::Malformed(err.to_string()))?;

	let kind = {
		let tag = value
			.get("type")
			.and_then(Value::as_str)
			.ok_or_else(|| ProtocolError::Malformed("missing 'type' tag".to_string()))?;
		OperationKind::from_tag(tag).ok_or_else(|| ProtocolError::UnknownOperation(tag.to_string()))?
	};

	if let Some(expected) = expected
		&& expected != kind
	{
		return Err(ProtocolError::UnexpectedOperation { expected, actual: kind });
	}

	serde_json::from_value(value).map_err(|err| ProtocolError::Malformed(err.to_string()))
}
