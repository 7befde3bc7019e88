//! Event distribution backbone.
//!
//! The backbone carries [`EventAction`] envelopes between the nodes of a
//! cluster and owns the replicated participant counters. Two strategies
//! implement [`Backbone`]:
//!
//! * [`LogBackbone`]: ordered append log, every node sees every envelope.
//! * [`ReplicatedBackbone`]: one slot per design with change listeners; a
//!   burst of envelopes for one design may coalesce to the latest.
//!
//! A node never receives its own envelopes back. The coordinator applies the
//! local effect of an envelope at the moment it publishes it, so the backbone
//! drops records whose `origin` is the subscribing node.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use coedit_proto::{ContextId, DesignId, EventAction, NodeId};
use tokio::sync::mpsc;

use crate::config::{BackboneConfig, BackboneKind};
use crate::error::BackboneError;

mod counters;
mod log;
mod replicated;

pub use counters::ClusterCounters;
pub use self::log::{LogBackbone, LogBatch, LogBroker, LogRecord};
pub use replicated::{ReplicatedBackbone, ReplicatedMap};

/// Envelope published by another node, handed to the local dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
	/// Design the envelope concerns.
	pub design_id: DesignId,
	/// The envelope.
	pub action: EventAction,
}

/// Cross-node fan-out and participant counting.
#[async_trait]
pub trait Backbone: Send + Sync + fmt::Debug {
	/// Strategy behind this handle.
	fn kind(&self) -> BackboneKind;

	/// Node this handle publishes as.
	fn node_id(&self) -> &NodeId;

	/// Subscribes to the cluster. Idempotent; [`send`](Self::send) calls it
	/// lazily.
	async fn start(&self) -> Result<(), BackboneError>;

	/// Publishes an envelope for a design.
	async fn send(&self, design_id: &DesignId, action: EventAction) -> Result<(), BackboneError>;

	/// Counts a new live context. Returns the cluster-wide count.
	async fn add_session_context(&self, design_id: &DesignId, context: &ContextId) -> Result<i64, BackboneError>;

	/// Uncounts a departed context. Returns the cluster-wide count.
	async fn remove_session_context(&self, design_id: &DesignId, context: &ContextId) -> Result<i64, BackboneError>;

	/// Cluster-wide count of live contexts.
	async fn participants(&self, design_id: &DesignId) -> i64;

	/// Asks for the right to roll the design up.
	///
	/// Granted at most once per time the counter reaches zero.
	async fn claim_rollup(&self, design_id: &DesignId) -> Result<bool, BackboneError>;

	/// Releases a granted claim. True means the design emptied again while
	/// the rollup ran and the caller holds the claim for that cycle too.
	async fn finish_rollup(&self, design_id: &DesignId) -> bool;

	/// Stops the subscriber. Later publishes fail with
	/// [`BackboneError::Stopped`].
	async fn stop(&self);
}

/// Decodes a record and hands it to the dispatcher unless this node published
/// it. Returns false once the dispatcher is gone.
fn forward(node_id: &NodeId, design_id: DesignId, payload: &str, inbound: &mpsc::UnboundedSender<Inbound>) -> bool {
	let action = match EventAction::decode(payload) {
		Ok(action) => action,
		Err(err) => {
			tracing::warn!(node = %node_id, design = %design_id, error = %err, "dropping undecodable envelope");
			return true;
		}
	};
	if action.origin == *node_id {
		return true;
	}
	inbound.send(Inbound { design_id, action }).is_ok()
}

/// Shared state of an in-process cluster.
///
/// Every node connected to the same fabric sees the same log, map and
/// counters. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct ClusterFabric {
	log: Arc<LogBroker>,
	map: Arc<ReplicatedMap>,
	counters: Arc<ClusterCounters>,
}

impl ClusterFabric {
	/// Creates an empty fabric.
	pub fn new(config: &BackboneConfig) -> Self {
		Self {
			log: Arc::new(LogBroker::new(config.log_retention)),
			map: Arc::new(ReplicatedMap::new()),
			counters: Arc::new(ClusterCounters::new()),
		}
	}

	/// Connects a node using the given strategy.
	///
	/// Envelopes from other nodes are pushed into `inbound` once the returned
	/// handle is started.
	pub fn connect(
		&self,
		kind: BackboneKind,
		node_id: NodeId,
		inbound: mpsc::UnboundedSender<Inbound>,
	) -> Arc<dyn Backbone> {
		let counters = Arc::clone(&self.counters);
		match kind {
			BackboneKind::Log => Arc::new(LogBackbone::new(node_id, Arc::clone(&self.log), counters, inbound)),
			BackboneKind::Replicated => {
				Arc::new(ReplicatedBackbone::new(node_id, Arc::clone(&self.map), counters, inbound))
			}
		}
	}

	/// Participant counters of the cluster.
	pub fn counters(&self) -> &Arc<ClusterCounters> {
		&self.counters
	}

	/// Append log of the cluster.
	pub fn log(&self) -> &Arc<LogBroker> {
		&self.log
	}

	/// Replicated map of the cluster.
	pub fn map(&self) -> &Arc<ReplicatedMap> {
		&self.map
	}
}
