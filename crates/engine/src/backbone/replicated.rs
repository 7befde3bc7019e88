//! Replicated-map backbone.
//!
//! A publish is a put into a single slot per design. Listeners are woken on
//! change and read the latest value of every key that changed since they last
//! looked, so a burst of puts to one design can coalesce: a listener that is
//! slower than the publisher only observes the last write. Commands carry their
//! own content version, which is how receivers detect what they missed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use coedit_proto::{ContextId, DesignId, EventAction, NodeId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::counters::ClusterCounters;
use super::{Backbone, Inbound, forward};
use crate::config::BackboneKind;
use crate::error::BackboneError;

#[derive(Debug, Clone)]
struct Slot {
	version: u64,
	payload: Arc<str>,
}

#[derive(Debug, Default)]
struct MapState {
	slots: HashMap<DesignId, Slot>,
	version: u64,
}

/// Map shared by every node of a cluster, one slot per design.
#[derive(Debug)]
pub struct ReplicatedMap {
	state: Mutex<MapState>,
	version: watch::Sender<u64>,
}

impl Default for ReplicatedMap {
	fn default() -> Self {
		Self::new()
	}
}

impl ReplicatedMap {
	/// Creates an empty map.
	pub fn new() -> Self {
		let (version, _) = watch::channel(0);
		Self {
			state: Mutex::new(MapState::default()),
			version,
		}
	}

	/// Overwrites the design's slot and returns the new map version.
	pub fn put(&self, design_id: DesignId, payload: Arc<str>) -> u64 {
		let mut state = self.state.lock();
		state.version += 1;
		let version = state.version;
		state.slots.insert(design_id, Slot { version, payload });
		self.version.send_replace(version);
		version
	}

	/// Drops the design's slot if `idle` holds.
	///
	/// `idle` runs under the map lock, so a publisher that has already
	/// counted a participant either sees its put survive or recreates the slot.
	pub fn retire(&self, design_id: &DesignId, idle: impl FnOnce() -> bool) -> bool {
		let mut state = self.state.lock();
		if !state.slots.contains_key(design_id) || !idle() {
			return false;
		}
		state.slots.remove(design_id).is_some()
	}

	/// Latest value of the design's slot.
	pub fn get(&self, design_id: &DesignId) -> Option<Arc<str>> {
		self.state.lock().slots.get(design_id).map(|slot| Arc::clone(&slot.payload))
	}

	/// Latest value of every slot written after `cursor`, oldest write first,
	/// together with the version to resume from.
	pub fn changes_since(&self, cursor: u64) -> (Vec<(DesignId, Arc<str>)>, u64) {
		let state = self.state.lock();
		let mut changed: Vec<_> = state
			.slots
			.iter()
			.filter(|(_, slot)| slot.version > cursor)
			.map(|(design, slot)| (slot.version, design.clone(), Arc::clone(&slot.payload)))
			.collect();
		changed.sort_unstable_by_key(|(version, ..)| *version);
		let changes = changed.into_iter().map(|(_, design, payload)| (design, payload)).collect();
		(changes, state.version)
	}

	/// Watches the map version.
	pub fn subscribe(&self) -> watch::Receiver<u64> {
		self.version.subscribe()
	}

	/// Number of designs with a slot.
	pub fn len(&self) -> usize {
		self.state.lock().slots.len()
	}

	/// Whether no slot has been written.
	pub fn is_empty(&self) -> bool {
		self.state.lock().slots.is_empty()
	}
}

/// Node-side handle on a [`ReplicatedMap`].
#[derive(Debug)]
pub struct ReplicatedBackbone {
	node_id: NodeId,
	map: Arc<ReplicatedMap>,
	counters: Arc<ClusterCounters>,
	inbound: mpsc::UnboundedSender<Inbound>,
	started: AtomicBool,
	shutdown: CancellationToken,
}

impl ReplicatedBackbone {
	/// Creates a handle. No listener is registered until [`Backbone::start`].
	pub fn new(
		node_id: NodeId,
		map: Arc<ReplicatedMap>,
		counters: Arc<ClusterCounters>,
		inbound: mpsc::UnboundedSender<Inbound>,
	) -> Self {
		Self {
			node_id,
			map,
			counters,
			inbound,
			started: AtomicBool::new(false),
			shutdown: CancellationToken::new(),
		}
	}
}

#[async_trait]
impl Backbone for ReplicatedBackbone {
	fn kind(&self) -> BackboneKind {
		BackboneKind::Replicated
	}

	fn node_id(&self) -> &NodeId {
		&self.node_id
	}

	async fn start(&self) -> Result<(), BackboneError> {
		if self.shutdown.is_cancelled() {
			return Err(BackboneError::Stopped);
		}
		if self.started.swap(true, Ordering::AcqRel) {
			return Ok(());
		}

		let mut version = self.map.subscribe();
		let cursor = *version.borrow_and_update();
		tracing::info!(node = %self.node_id, cursor, "replicated map listener registered");

		tokio::spawn(run_listener(
			self.node_id.clone(),
			Arc::clone(&self.map),
			version,
			cursor,
			self.inbound.clone(),
			self.shutdown.clone(),
		));
		Ok(())
	}

	async fn send(&self, design_id: &DesignId, action: EventAction) -> Result<(), BackboneError> {
		self.start().await?;
		let payload = action.encode()?;
		let version = self.map.put(design_id.clone(), payload.into());
		tracing::trace!(
			node = %self.node_id,
			design = %design_id,
			action = action.action.as_str(),
			version,
			"slot written"
		);
		Ok(())
	}

	async fn add_session_context(&self, design_id: &DesignId, context: &ContextId) -> Result<i64, BackboneError> {
		tracing::trace!(design = %design_id, context = %context, "participant added");
		self.counters.merge(design_id, 1)
	}

	async fn remove_session_context(&self, design_id: &DesignId, context: &ContextId) -> Result<i64, BackboneError> {
		tracing::trace!(design = %design_id, context = %context, "participant removed");
		self.counters.merge(design_id, -1)
	}

	async fn participants(&self, design_id: &DesignId) -> i64 {
		self.counters.value(design_id)
	}

	async fn claim_rollup(&self, design_id: &DesignId) -> Result<bool, BackboneError> {
		self.counters.claim_rollup(design_id)
	}

	async fn finish_rollup(&self, design_id: &DesignId) -> bool {
		if self.counters.finish_rollup(design_id) {
			return true;
		}
		if self.map.retire(design_id, || self.counters.value(design_id) == 0) {
			tracing::trace!(node = %self.node_id, design = %design_id, "slot retired");
		}
		false
	}

	async fn stop(&self) {
		self.shutdown.cancel();
	}
}

async fn run_listener(
	node_id: NodeId,
	map: Arc<ReplicatedMap>,
	mut version: watch::Receiver<u64>,
	mut cursor: u64,
	inbound: mpsc::UnboundedSender<Inbound>,
	shutdown: CancellationToken,
) {
	loop {
		let (changes, next) = map.changes_since(cursor);
		cursor = next;
		for (design_id, payload) in changes {
			if !forward(&node_id, design_id, &payload, &inbound) {
				tracing::debug!(node = %node_id, "dispatcher gone, map listener exiting");
				return;
			}
		}

		tokio::select! {
			biased;
			_ = shutdown.cancelled() => break,
			changed = version.changed() => {
				if changed.is_err() {
					break;
				}
			}
		}
	}
	tracing::debug!(node = %node_id, "map listener stopped");
}
