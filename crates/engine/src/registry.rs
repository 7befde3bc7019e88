//! Node-local map of active editing sessions.

use std::collections::HashMap;
use std::sync::Arc;

use coedit_proto::DesignId;
use parking_lot::Mutex;

use crate::session::LocalSession;

/// Sessions this node currently hosts, keyed by design.
///
/// Owned by the coordinator; nothing else holds it.
#[derive(Debug, Default)]
pub struct SessionRegistry {
	sessions: Mutex<HashMap<DesignId, Arc<LocalSession>>>,
}

impl SessionRegistry {
	/// Creates an empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the session for `design_id`, creating it on first use.
	pub fn get_or_create(&self, design_id: &DesignId) -> Arc<LocalSession> {
		let mut sessions = self.sessions.lock();
		if let Some(session) = sessions.get(design_id) {
			return Arc::clone(session);
		}
		tracing::debug!(design = %design_id, "local session created");
		let session = Arc::new(LocalSession::new(design_id.clone()));
		sessions.insert(design_id.clone(), Arc::clone(&session));
		session
	}

	/// Returns the session for `design_id` if one is active.
	pub fn get(&self, design_id: &DesignId) -> Option<Arc<LocalSession>> {
		self.sessions.lock().get(design_id).cloned()
	}

	/// Deregisters the session for `design_id` if it has no contexts.
	///
	/// Returns true when the session was removed. The removed session is
	/// marked closed under the registry lock, so a joiner holding a stale
	/// handle sees [`JoinResult::Closed`](crate::session::JoinResult::Closed)
	/// and fetches a fresh session instead.
	pub fn close(&self, design_id: &DesignId) -> bool {
		let mut sessions = self.sessions.lock();
		let Some(session) = sessions.get(design_id) else {
			return false;
		};
		if !session.try_close() {
			return false;
		}
		sessions.remove(design_id);
		tracing::debug!(design = %design_id, "local session closed");
		true
	}

	/// Number of active sessions.
	pub fn len(&self) -> usize {
		self.sessions.lock().len()
	}

	/// Whether no sessions are active.
	pub fn is_empty(&self) -> bool {
		self.sessions.lock().is_empty()
	}
}
