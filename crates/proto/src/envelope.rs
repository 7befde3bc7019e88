//! Cross-node envelopes.
//!
//! An [`EventAction`] is the unit a node hands to the distribution backbone
//! when something happened locally that other nodes hosting the same design
//! must react to.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::types::{ContextId, NodeId};

/// What the receiving node should do with an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
	/// The publishing node's last local context left; check for a rollup.
	Close,
	/// Explicit rollup trigger. Reserved: no code path publishes it.
	Rollup,
	/// Deliver the enclosed operation to every local context except the
	/// correlated one.
	SendToOthers,
	/// Announce the enclosed `join` to local contexts, then send the local
	/// roster to the correlated (remote) context.
	SendToList,
	/// Deliver the enclosed join batch to the correlated context.
	SendToExecute,
}

impl ActionType {
	/// Wire name of the action.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Close => "CLOSE",
			Self::Rollup => "ROLLUP",
			Self::SendToOthers => "SEND_TO_OTHERS",
			Self::SendToList => "SEND_TO_LIST",
			Self::SendToExecute => "SEND_TO_EXECUTE",
		}
	}
}

/// Transport unit between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAction {
	/// Requested action.
	pub action: ActionType,
	/// Node that published the envelope.
	pub origin: NodeId,
	/// Excluded context for [`ActionType::SendToOthers`], target context for
	/// [`ActionType::SendToList`] and [`ActionType::SendToExecute`].
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub correlation_id: Option<ContextId>,
	/// Serialized operation for [`ActionType::SendToOthers`], or the
	/// newcomer's `join` for [`ActionType::SendToList`].
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub operation: Option<String>,
	/// Serialized `join` operations for [`ActionType::SendToExecute`].
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub join_batch: Option<Vec<String>>,
}

impl EventAction {
	fn bare(action: ActionType, origin: NodeId) -> Self {
		Self {
			action,
			origin,
			correlation_id: None,
			operation: None,
			join_batch: None,
		}
	}

	/// The publishing node has no local contexts left for the design.
	pub fn close(origin: NodeId) -> Self {
		Self::bare(ActionType::Close, origin)
	}

	/// Fan an operation out to every context except `exclude`.
	pub fn send_to_others(origin: NodeId, exclude: ContextId, operation: String) -> Self {
		Self {
			correlation_id: Some(exclude),
			operation: Some(operation),
			..Self::bare(ActionType::SendToOthers, origin)
		}
	}

	/// Announce `target` to every other node and ask each for its roster on
	/// its behalf. `announcement` is the newcomer's serialized `join`.
	pub fn send_to_list(origin: NodeId, target: ContextId, announcement: String) -> Self {
		Self {
			correlation_id: Some(target),
			operation: Some(announcement),
			..Self::bare(ActionType::SendToList, origin)
		}
	}

	/// Deliver a precomputed roster to `target`.
	pub fn send_to_execute(origin: NodeId, target: ContextId, join_batch: Vec<String>) -> Self {
		Self {
			correlation_id: Some(target),
			join_batch: Some(join_batch),
			..Self::bare(ActionType::SendToExecute, origin)
		}
	}

	/// Encodes the envelope as JSON.
	pub fn encode(&self) -> Result<String> {
		serde_json::to_string(self).map_err(ProtocolError::Encode)
	}

	/// Decodes an envelope from JSON.
	pub fn decode(bytes: impl AsRef<[u8]>) -> Result<Self> {
		serde_json::from_slice(bytes.as_ref()).map_err(|err| ProtocolError::Malformed(err.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use serde_json::{Value, json};

	use super::*;

	#[test]
	fn send_to_others_wire_shape() {
		let action = EventAction::send_to_others(NodeId::new("n1"), ContextId::new("c1"), "{}".to_string());
		let wire: Value = serde_json::from_str(&action.encode().unwrap()).unwrap();

		assert_eq!(
			wire,
			json!({
				"action": "SEND_TO_OTHERS",
				"origin": "n1",
				"correlationId": "c1",
				"operation": "{}",
			})
		);
	}

	#[test]
	fn send_to_list_carries_the_announcement() {
		let action = EventAction::send_to_list(NodeId::new("n1"), ContextId::new("c1"), "join".to_string());
		let wire: Value = serde_json::from_str(&action.encode().unwrap()).unwrap();
		assert_eq!(
			wire,
			json!({
				"action": "SEND_TO_LIST",
				"origin": "n1",
				"correlationId": "c1",
				"operation": "join",
			})
		);
	}

	#[test]
	fn execute_batch_survives_decode() {
		let batch = vec![r#"{"type":"join","user":"ada","id":"c2"}"#.to_string()];
		let action = EventAction::send_to_execute(NodeId::new("n2"), ContextId::new("c1"), batch);

		let decoded = EventAction::decode(action.encode().unwrap()).unwrap();
		assert_eq!(decoded, action);
	}

	#[test]
	fn unknown_action_is_malformed() {
		let err = EventAction::decode(r#"{"action":"EXPLODE","origin":"n1"}"#).unwrap_err();
		assert!(matches!(err, ProtocolError::Malformed(_)));
	}
}
