//! Per-design, per-node registry of connected editors.
//!
//! A [`LocalSession`] owns the contexts a single node hosts for one design and
//! performs local fan-out only. Cross-node effects are published by the
//! coordinator after the session lock is released, so backbone I/O never runs
//! under it.
//!
//! Delivery to a dead transport is not retried: the failed context ids are
//! returned to the caller, which reaps them as if they had left.

use std::collections::HashMap;

use coedit_proto::{ContextId, DesignId, Operation, ProtocolError, serialize};
use parking_lot::Mutex;

use crate::context::SessionContext;

/// Result of delivering one frame to a set of local contexts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanOut {
	/// Number of contexts the frame was queued for.
	pub delivered: usize,
	/// Contexts whose transport is dead.
	pub failed: Vec<ContextId>,
}

impl FanOut {
	fn merge(&mut self, other: FanOut) {
		self.delivered += other.delivered;
		self.failed.extend(other.failed);
	}
}

/// Outcome of [`LocalSession::join`].
#[derive(Debug)]
pub enum JoinResult {
	/// The context was added.
	Joined {
		/// The context id was already present and has been rebound.
		rejoined: bool,
		/// Delivery of the join notification and the local roster.
		fan_out: FanOut,
	},
	/// The session was closed concurrently; the caller must fetch a fresh one.
	Closed,
}

/// Outcome of [`LocalSession::leave`].
#[derive(Debug)]
pub struct Departure {
	/// User that was bound to the context.
	pub user: String,
	/// No local contexts remain.
	pub now_empty: bool,
	/// Delivery of the leave notification.
	pub fan_out: FanOut,
}

#[derive(Debug)]
struct Participant {
	user: String,
	context: SessionContext,
}

#[derive(Debug, Default)]
struct SessionState {
	contexts: HashMap<ContextId, Participant>,
	closed: bool,
}

/// Contexts one node hosts for one design.
#[derive(Debug)]
pub struct LocalSession {
	design_id: DesignId,
	state: Mutex<SessionState>,
}

impl LocalSession {
	/// Creates an empty session.
	pub fn new(design_id: DesignId) -> Self {
		Self {
			design_id,
			state: Mutex::new(SessionState::default()),
		}
	}

	/// Design this session belongs to.
	pub fn design_id(&self) -> &DesignId {
		&self.design_id
	}

	/// Adds a context.
	///
	/// Every other local context receives a `join` for the newcomer, and the
	/// newcomer receives a `join` for every local participant already present.
	/// Participants on other nodes are covered by the backbone roster exchange.
	pub fn join(&self, context: SessionContext, user: &str) -> Result<JoinResult, ProtocolError> {
		let id = context.id().clone();
		let join_frame = serialize(&Operation::join(user, id.clone()))?;

		let (peers, roster, rejoined) = {
			let mut state = self.state.lock();
			if state.closed {
				return Ok(JoinResult::Closed);
			}

			let rejoined = state
				.contexts
				.insert(
					id.clone(),
					Participant {
						user: user.to_string(),
						context: context.clone(),
					},
				)
				.is_some();

			let mut peers = Vec::with_capacity(state.contexts.len());
			let mut roster = Vec::with_capacity(state.contexts.len());
			for (peer_id, participant) in &state.contexts {
				if *peer_id == id {
					continue;
				}
				peers.push(participant.context.clone());
				roster.push(Operation::join(participant.user.clone(), peer_id.clone()));
			}
			(peers, roster, rejoined)
		};

		let mut fan_out = fan_out(&peers, &join_frame);
		for op in &roster {
			let frame = serialize(op)?;
			if context.send(frame).is_err() {
				fan_out.failed.push(id.clone());
				break;
			}
		}

		Ok(JoinResult::Joined { rejoined, fan_out })
	}

	/// Removes a context and tells the remaining local contexts.
	///
	/// Returns `None` when the context is not part of this session.
	pub fn leave(&self, id: &ContextId) -> Result<Option<Departure>, ProtocolError> {
		let (participant, peers, now_empty) = {
			let mut state = self.state.lock();
			let Some(participant) = state.contexts.remove(id) else {
				return Ok(None);
			};
			let peers: Vec<_> = state.contexts.values().map(|p| p.context.clone()).collect();
			(participant, peers, state.contexts.is_empty())
		};

		let frame = serialize(&Operation::leave(participant.user.clone(), id.clone()))?;
		let fan_out = fan_out(&peers, &frame);

		Ok(Some(Departure {
			user: participant.user,
			now_empty,
			fan_out,
		}))
	}

	/// Delivers a frame to every local context except `exclude`.
	pub fn send_to_others(&self, frame: &str, exclude: Option<&ContextId>) -> FanOut {
		let targets: Vec<_> = {
			let state = self.state.lock();
			state
				.contexts
				.iter()
				.filter(|(id, _)| Some(*id) != exclude)
				.map(|(_, p)| p.context.clone())
				.collect()
		};
		fan_out(&targets, frame)
	}

	/// Delivers frames, in order, to one local context.
	///
	/// Returns `None` when the context is not hosted here.
	pub fn deliver_to(&self, target: &ContextId, frames: &[String]) -> Option<FanOut> {
		let context = self.state.lock().contexts.get(target).map(|p| p.context.clone())?;

		let mut out = FanOut::default();
		for frame in frames {
			let single = fan_out(std::slice::from_ref(&context), frame);
			let failed = !single.failed.is_empty();
			out.merge(single);
			if failed {
				break;
			}
		}
		Some(out)
	}

	/// Serialized `join` operations for every local participant except `exclude`.
	pub fn roster(&self, exclude: Option<&ContextId>) -> Result<Vec<String>, ProtocolError> {
		let ops: Vec<_> = {
			let state = self.state.lock();
			state
				.contexts
				.iter()
				.filter(|(id, _)| Some(*id) != exclude)
				.map(|(id, p)| Operation::join(p.user.clone(), id.clone()))
				.collect()
		};
		ops.iter().map(serialize).collect()
	}

	/// User bound to a local context.
	pub fn user_of(&self, id: &ContextId) -> Option<String> {
		self.state.lock().contexts.get(id).map(|p| p.user.clone())
	}

	/// Whether the context is hosted here.
	pub fn contains(&self, id: &ContextId) -> bool {
		self.state.lock().contexts.contains_key(id)
	}

	/// Number of local contexts.
	pub fn len(&self) -> usize {
		self.state.lock().contexts.len()
	}

	/// Whether no local contexts remain.
	pub fn is_empty(&self) -> bool {
		self.state.lock().contexts.is_empty()
	}

	/// Marks the session closed if it has no contexts.
	///
	/// A closed session refuses joins so a concurrent joiner never lands in a
	/// session that is being discarded.
	pub(crate) fn try_close(&self) -> bool {
		let mut state = self.state.lock();
		if state.contexts.is_empty() {
			state.closed = true;
		}
		state.closed
	}
}

fn fan_out(targets: &[SessionContext], frame: &str) -> FanOut {
	let mut out = FanOut::default();
	for context in targets {
		match context.send(frame) {
			Ok(()) => out.delivered += 1,
			Err(err) => {
				tracing::debug!(error = %err, "local delivery failed");
				out.failed.push(err.0);
			}
		}
	}
	out
}
