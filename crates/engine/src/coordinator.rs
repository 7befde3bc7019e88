//! Per-node coordinator.
//!
//! The [`Coordinator`] is the single owner of a node's session registry, token
//! issuer, backbone handle and rollup engine. The transport layer calls its
//! entry points; envelopes from other nodes arrive through a dispatcher task
//! that looks sessions up by design id.
//!
//! Sessions only fan out locally. Every backbone publish happens here, after
//! the session lock has been released, and a node applies the local effect of
//! an envelope at the moment it publishes it rather than waiting for the
//! backbone to echo it back.

use std::sync::Arc;

use coedit_proto::{
	ActionType, ContentVersion, ContextId, DesignId, EventAction, FullCommand, NodeId, Operation, deserialize, serialize,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backbone::{Backbone, ClusterFabric, Inbound};
use crate::config::{BackboneKind, EngineConfig};
use crate::context::SessionContext;
use crate::error::{EngineError, Result};
use crate::executor::CommandExecutor;
use crate::registry::SessionRegistry;
use crate::rollup::{RollupEngine, RollupOutcome};
use crate::session::{JoinResult, LocalSession};
use crate::storage::DesignStorage;
use crate::token::SessionTokenIssuer;

const EVENT_CAPACITY: usize = 64;

/// Notifications about background work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
	/// A rollup triggered by this node finished.
	RollupCompleted {
		/// Design that was rolled up.
		design_id: DesignId,
		/// What the rollup did.
		outcome: RollupOutcome,
	},
	/// A rollup triggered by this node was abandoned.
	RollupFailed {
		/// Design whose rollup failed.
		design_id: DesignId,
		/// Rendered error.
		error: String,
	},
}

struct Shared {
	node_id: NodeId,
	registry: SessionRegistry,
	tokens: SessionTokenIssuer,
	backbone: Arc<dyn Backbone>,
	storage: Arc<dyn DesignStorage>,
	rollup: RollupEngine,
	inbound: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
	events: broadcast::Sender<CoordinatorEvent>,
	shutdown: CancellationToken,
}

/// Coordination service for one node. Cloning shares the same node.
#[derive(Clone)]
pub struct Coordinator {
	shared: Arc<Shared>,
}

impl std::fmt::Debug for Coordinator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Coordinator")
			.field("node_id", &self.shared.node_id)
			.field("backbone", &self.shared.backbone.kind())
			.field("sessions", &self.shared.registry.len())
			.finish_non_exhaustive()
	}
}

impl Coordinator {
	/// Builds a node connected to `fabric` with the configured strategy.
	///
	/// Nothing runs until [`start`](Self::start).
	pub fn new(
		config: &EngineConfig,
		fabric: &ClusterFabric,
		storage: Arc<dyn DesignStorage>,
		executor: Arc<dyn CommandExecutor>,
	) -> Self {
		let node_id = config.resolve_node_id();
		let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
		let backbone = fabric.connect(config.backbone.kind, node_id.clone(), inbound_tx);
		let (events, _) = broadcast::channel(EVENT_CAPACITY);

		Self {
			shared: Arc::new(Shared {
				node_id,
				registry: SessionRegistry::new(),
				tokens: SessionTokenIssuer::new(config.tokens.ttl()),
				rollup: RollupEngine::new(Arc::clone(&storage), executor),
				backbone,
				storage,
				inbound: Mutex::new(Some(inbound_rx)),
				events,
				shutdown: CancellationToken::new(),
			}),
		}
	}

	/// Starts the backbone subscriber and the dispatcher. Idempotent.
	pub async fn start(&self) -> Result<()> {
		self.shared.backbone.start().await?;

		let Some(inbound) = self.shared.inbound.lock().take() else {
			return Ok(());
		};
		tracing::info!(
			node = %self.shared.node_id,
			backbone = %self.shared.backbone.kind(),
			"coordinator started"
		);
		tokio::spawn(self.clone().run_dispatcher(inbound));
		Ok(())
	}

	/// Stops the dispatcher and the backbone subscriber.
	pub async fn shutdown(&self) {
		self.shared.shutdown.cancel();
		self.shared.backbone.stop().await;
		tracing::info!(node = %self.shared.node_id, "coordinator stopped");
	}

	/// Identifier of this node.
	pub fn node_id(&self) -> &NodeId {
		&self.shared.node_id
	}

	/// Backbone strategy in use.
	pub fn backbone_kind(&self) -> BackboneKind {
		self.shared.backbone.kind()
	}

	/// Subscribes to background notifications.
	pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
		self.shared.events.subscribe()
	}

	/// Local session for a design, if this node hosts one.
	pub fn session(&self, design_id: &DesignId) -> Option<Arc<LocalSession>> {
		self.shared.registry.get(design_id)
	}

	/// Cluster-wide count of live contexts for a design.
	pub async fn participants(&self, design_id: &DesignId) -> i64 {
		self.shared.backbone.participants(design_id).await
	}

	/// Highest committed content version of a design.
	pub async fn latest_version(&self, design_id: &DesignId) -> Result<ContentVersion> {
		Ok(self.shared.storage.latest_version(design_id).await?)
	}

	/// Mints a one-time join token.
	pub fn create_session_token(
		&self,
		design_id: &DesignId,
		user: &str,
		secret: &str,
		content_version: ContentVersion,
	) -> Uuid {
		self.shared.tokens.issue(design_id.clone(), user, secret, content_version)
	}

	/// Redeems a join token and returns the content version it was issued for.
	pub fn validate_session_token(
		&self,
		token: Uuid,
		design_id: &DesignId,
		user: &str,
		secret: &str,
	) -> Result<ContentVersion> {
		self.shared
			.tokens
			.validate(token, design_id, user, secret)
			.map_err(|err| {
				tracing::info!(design = %design_id, user, error = %err, "join rejected");
				EngineError::from(err)
			})
	}

	/// Adds a context to the design's session.
	///
	/// Local peers are told immediately and the newcomer receives the local
	/// roster. Remote nodes get a single `SEND_TO_LIST` that both announces
	/// the newcomer and asks for their rosters. If counting or publishing
	/// fails, the join is taken back before the error is returned.
	pub async fn join(&self, design_id: &DesignId, context: SessionContext, user: &str) -> Result<()> {
		let shared = &self.shared;
		let id = context.id().clone();
		let join_frame = serialize(&Operation::join(user, id.clone()))?;

		let (rejoined, fan_out) = loop {
			let session = shared.registry.get_or_create(design_id);
			match session.join(context.clone(), user)? {
				JoinResult::Joined { rejoined, fan_out } => break (rejoined, fan_out),
				JoinResult::Closed => {
					tracing::trace!(design = %design_id, "session closed during join, retrying");
				}
			}
		};

		if rejoined {
			tracing::debug!(design = %design_id, context = %id, user, "context rebound");
		} else {
			match shared.backbone.add_session_context(design_id, &id).await {
				Ok(count) => {
					tracing::info!(design = %design_id, context = %id, user, participants = count, "context joined");
				}
				Err(err) => {
					self.undo_join(design_id, &id, false).await;
					return Err(err.into());
				}
			}
		}

		let announce = EventAction::send_to_list(shared.node_id.clone(), id.clone(), join_frame);
		if let Err(err) = shared.backbone.send(design_id, announce).await {
			if !rejoined {
				self.undo_join(design_id, &id, true).await;
			}
			return Err(err.into());
		}

		self.reap(design_id, fan_out.failed).await;
		Ok(())
	}

	/// Takes back a fresh join that could not be completed. Local peers that
	/// were already told see a `leave`; `counted` says whether the cluster
	/// counter must be given back too.
	async fn undo_join(&self, design_id: &DesignId, context: &ContextId, counted: bool) {
		let shared = &self.shared;
		let Some(session) = shared.registry.get(design_id) else {
			return;
		};
		let departure = match session.leave(context) {
			Ok(Some(departure)) => departure,
			Ok(None) => return,
			Err(err) => {
				tracing::warn!(design = %design_id, context = %context, error = %err, "failed to take back join");
				return;
			}
		};
		if counted && let Err(err) = shared.backbone.remove_session_context(design_id, context).await {
			tracing::error!(design = %design_id, context = %context, error = %err, "failed to uncount taken back join");
		}
		tracing::warn!(design = %design_id, context = %context, "join taken back");

		let closed = departure.now_empty && shared.registry.close(design_id);
		self.reap(design_id, departure.fan_out.failed).await;
		if closed {
			self.handle_close(design_id).await;
		}
	}

	/// Removes a context from the design's session.
	///
	/// When it was the last local context the session is discarded, a `CLOSE`
	/// envelope is published and the rollup claim is attempted.
	pub async fn leave(&self, design_id: &DesignId, context: &ContextId) -> Result<()> {
		let unknown = || EngineError::UnknownContext {
			design: design_id.clone(),
			context: context.clone(),
		};
		let session = self.shared.registry.get(design_id).ok_or_else(unknown)?;
		let failed = self.depart(design_id, &session, context).await?.ok_or_else(unknown)?;
		self.reap(design_id, failed).await;
		Ok(())
	}

	/// Decodes and submits a raw client frame.
	///
	/// Malformed frames are logged and reported to the caller only; nothing is
	/// forwarded.
	pub async fn submit_operation(&self, design_id: &DesignId, context: &ContextId, frame: &str) -> Result<()> {
		let op = match deserialize(frame, None) {
			Ok(op) => op,
			Err(err) => {
				tracing::warn!(design = %design_id, context = %context, error = %err, "dropping client message");
				return Err(err.into());
			}
		};
		self.submit(design_id, context, op).await
	}

	/// Submits an operation from a joined context.
	///
	/// Commands are committed in arrival order: storage assigns the next
	/// content version, the originator gets an `ack`, and every other
	/// participant gets the command stamped with the committed version.
	pub async fn submit(&self, design_id: &DesignId, context: &ContextId, op: Operation) -> Result<()> {
		let shared = &self.shared;
		let session = shared.registry.get(design_id);
		let Some((session, user)) = session.and_then(|s| s.user_of(context).map(|user| (s, user))) else {
			return Err(EngineError::UnknownContext {
				design: design_id.clone(),
				context: context.clone(),
			});
		};

		let mut failed = Vec::new();
		let forwarded = match op {
			Operation::Command {
				content_version: base,
				command,
				command_id,
			} => {
				let full = FullCommand {
					content_version: base,
					command: command.clone(),
					command_id: command_id.clone(),
					author: user,
					reverted: false,
				};
				let committed = shared.storage.append_command(design_id, full).await?;
				if base.next() < committed {
					tracing::debug!(
						design = %design_id,
						context = %context,
						base = %base,
						committed = %committed,
						"command made against a stale version"
					);
				}

				let ack = serialize(&Operation::Ack {
					content_version: committed,
					command_id: command_id.clone(),
				})?;
				if let Some(fan_out) = session.deliver_to(context, &[ack]) {
					failed.extend(fan_out.failed);
				}
				Operation::Command {
					content_version: committed,
					command,
					command_id,
				}
			}
			Operation::Undo { content_version } => {
				shared.storage.set_reverted(design_id, content_version, true).await?;
				Operation::Undo { content_version }
			}
			Operation::Redo { content_version } => {
				shared.storage.set_reverted(design_id, content_version, false).await?;
				Operation::Redo { content_version }
			}
			Operation::Selection { selection, .. } => Operation::Selection {
				user,
				id: context.clone(),
				selection,
			},
			other => {
				tracing::warn!(design = %design_id, context = %context, kind = %other.kind(), "client sent a server-only operation");
				return Err(EngineError::ServerOnlyOperation(other.kind()));
			}
		};

		let frame = serialize(&forwarded)?;
		let fan_out = session.send_to_others(&frame, Some(context));
		failed.extend(fan_out.failed);
		shared
			.backbone
			.send(
				design_id,
				EventAction::send_to_others(shared.node_id.clone(), context.clone(), frame),
			)
			.await?;

		self.reap(design_id, failed).await;
		Ok(())
	}

	/// Removes one context and performs every cross-node effect of its
	/// departure. Returns contexts whose transport failed while being told, or
	/// `None` when the context was not in the session.
	async fn depart(
		&self,
		design_id: &DesignId,
		session: &LocalSession,
		context: &ContextId,
	) -> Result<Option<Vec<ContextId>>> {
		let shared = &self.shared;
		let Some(departure) = session.leave(context)? else {
			return Ok(None);
		};

		let remaining = shared.backbone.remove_session_context(design_id, context).await?;
		tracing::info!(
			design = %design_id,
			context = %context,
			user = %departure.user,
			participants = remaining,
			"context left"
		);

		let leave_frame = serialize(&Operation::leave(departure.user, context.clone()))?;
		shared
			.backbone
			.send(
				design_id,
				EventAction::send_to_others(shared.node_id.clone(), context.clone(), leave_frame),
			)
			.await?;

		if departure.now_empty && shared.registry.close(design_id) {
			shared
				.backbone
				.send(design_id, EventAction::close(shared.node_id.clone()))
				.await?;
			self.handle_close(design_id).await;
		}

		Ok(Some(departure.fan_out.failed))
	}

	/// Treats contexts with dead transports as departed, including any whose
	/// transport fails while being told about the others.
	async fn reap(&self, design_id: &DesignId, failed: Vec<ContextId>) {
		let mut pending = failed;
		while let Some(context) = pending.pop() {
			let Some(session) = self.shared.registry.get(design_id) else {
				return;
			};
			tracing::warn!(design = %design_id, context = %context, "reaping context with closed transport");
			match self.depart(design_id, &session, &context).await {
				Ok(Some(more)) => pending.extend(more),
				Ok(None) => {}
				Err(err) => {
					tracing::warn!(design = %design_id, context = %context, error = %err, "failed to reap context");
				}
			}
		}
	}

	async fn handle_close(&self, design_id: &DesignId) {
		match self.shared.backbone.claim_rollup(design_id).await {
			Ok(true) => {
				tracing::info!(design = %design_id, node = %self.shared.node_id, "design unattended, rolling up");
				tokio::spawn(self.clone().run_rollup(design_id.clone()));
			}
			Ok(false) => {
				tracing::trace!(design = %design_id, "rollup not claimed");
			}
			Err(err) => {
				tracing::error!(design = %design_id, error = %err, "rollup claim failed");
			}
		}
	}

	/// Rolls the design up, again for as long as it keeps emptying while a
	/// rollup runs. Only one of these runs per design across the cluster.
	async fn run_rollup(self, design_id: DesignId) {
		loop {
			let event = match self.shared.rollup.rollup(&design_id).await {
				Ok(outcome) => CoordinatorEvent::RollupCompleted {
					design_id: design_id.clone(),
					outcome,
				},
				Err(err) => {
					tracing::error!(design = %design_id, error = %err, "rollup abandoned, stored content untouched");
					CoordinatorEvent::RollupFailed {
						design_id: design_id.clone(),
						error: err.to_string(),
					}
				}
			};
			let _ = self.shared.events.send(event);

			if !self.shared.backbone.finish_rollup(&design_id).await {
				break;
			}
			tracing::info!(design = %design_id, "design emptied again during rollup, rolling up again");
		}
	}

	async fn run_dispatcher(self, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
		let shutdown = self.shared.shutdown.clone();
		loop {
			let next = tokio::select! {
				biased;
				_ = shutdown.cancelled() => break,
				next = inbound.recv() => next,
			};
			let Some(next) = next else {
				break;
			};
			self.dispatch(next).await;
		}
		tracing::debug!(node = %self.shared.node_id, "dispatcher stopped");
	}

	async fn dispatch(&self, inbound: Inbound) {
		let Inbound { design_id, action } = inbound;
		let shared = &self.shared;
		tracing::trace!(
			node = %shared.node_id,
			design = %design_id,
			action = action.action.as_str(),
			origin = %action.origin,
			"envelope received"
		);

		match action.action {
			ActionType::SendToOthers => {
				let Some(operation) = action.operation else {
					tracing::warn!(design = %design_id, "SEND_TO_OTHERS without an operation");
					return;
				};
				let Some(session) = shared.registry.get(&design_id) else {
					return;
				};
				let fan_out = session.send_to_others(&operation, action.correlation_id.as_ref());
				self.reap(&design_id, fan_out.failed).await;
			}
			ActionType::SendToList => {
				let Some(target) = action.correlation_id else {
					tracing::warn!(design = %design_id, "SEND_TO_LIST without a target");
					return;
				};
				let Some(session) = shared.registry.get(&design_id) else {
					return;
				};
				if let Some(announcement) = &action.operation {
					let fan_out = session.send_to_others(announcement, Some(&target));
					self.reap(&design_id, fan_out.failed).await;
				}
				let batch = match session.roster(Some(&target)) {
					Ok(batch) => batch,
					Err(err) => {
						tracing::warn!(design = %design_id, error = %err, "failed to build roster");
						return;
					}
				};
				if batch.is_empty() {
					return;
				}
				let reply = EventAction::send_to_execute(shared.node_id.clone(), target, batch);
				if let Err(err) = shared.backbone.send(&design_id, reply).await {
					tracing::warn!(design = %design_id, error = %err, "failed to publish roster");
				}
			}
			ActionType::SendToExecute => {
				let (Some(target), Some(batch)) = (action.correlation_id, action.join_batch) else {
					tracing::warn!(design = %design_id, "SEND_TO_EXECUTE without a target or batch");
					return;
				};
				let Some(session) = shared.registry.get(&design_id) else {
					return;
				};
				if let Some(fan_out) = session.deliver_to(&target, &batch) {
					self.reap(&design_id, fan_out.failed).await;
				}
			}
			ActionType::Close => self.handle_close(&design_id).await,
			ActionType::Rollup => {
				tracing::debug!(design = %design_id, origin = %action.origin, "ignoring reserved ROLLUP envelope");
			}
		}
	}
}
