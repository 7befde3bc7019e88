//! Multi-node tests over an in-process cluster fabric.

use std::sync::Arc;
use std::time::Duration;

use coedit_proto::{CommandId, ContentVersion, ContextId, DesignId, Operation, deserialize, serialize};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use crate::backbone::ClusterFabric;
use crate::config::{BackboneKind, EngineConfig};
use crate::context::{ContextSink, SessionContext};
use crate::coordinator::{Coordinator, CoordinatorEvent};
use crate::executor::{CommandExecutor, TextCommandExecutor};
use crate::storage::MemoryStorage;

mod rollup_trigger;
mod roster;

const KINDS: [BackboneKind; 2] = [BackboneKind::Log, BackboneKind::Replicated];

pub(super) struct Cluster {
	pub fabric: ClusterFabric,
	pub storage: Arc<MemoryStorage>,
	pub nodes: Vec<Coordinator>,
}

impl Cluster {
	pub async fn start(kind: BackboneKind, nodes: usize) -> Self {
		Self::start_with(kind, nodes, Arc::new(TextCommandExecutor)).await
	}

	/// Like [`start`](Self::start) with every node sharing `executor`.
	pub async fn start_with(kind: BackboneKind, nodes: usize, executor: Arc<dyn CommandExecutor>) -> Self {
		let mut config = EngineConfig::default();
		config.backbone.kind = kind;
		let fabric = ClusterFabric::new(&config.backbone);
		let storage = Arc::new(MemoryStorage::new());
		storage.insert_design(design(), "C0");

		let mut started = Vec::with_capacity(nodes);
		for n in 0..nodes {
			config.node_id = Some(format!("node-{n}"));
			let node = Coordinator::new(&config, &fabric, storage.clone(), Arc::clone(&executor));
			node.start().await.expect("start node");
			started.push(node);
		}

		Self {
			fabric,
			storage,
			nodes: started,
		}
	}

	pub fn node(&self, n: usize) -> &Coordinator {
		&self.nodes[n]
	}

	/// Joins a client through node `n` and lets the cluster settle.
	pub async fn join(&self, n: usize, client: &TestClient) {
		self.nodes[n]
			.join(&design(), client.context(), &client.user)
			.await
			.expect("join");
		settle().await;
	}

	/// Removes a client through node `n` and lets the cluster settle.
	pub async fn leave(&self, n: usize, client: &TestClient) {
		self.nodes[n].leave(&design(), &client.id).await.expect("leave");
		settle().await;
	}

	/// Submits a raw frame through node `n` and lets the cluster settle.
	pub async fn submit(&self, n: usize, client: &TestClient, op: &Operation) {
		let frame = serialize(op).expect("serialize");
		self.nodes[n]
			.submit_operation(&design(), &client.id, &frame)
			.await
			.expect("submit");
		settle().await;
	}

	pub fn subscribe_all(&self) -> Vec<broadcast::Receiver<CoordinatorEvent>> {
		self.nodes.iter().map(Coordinator::subscribe).collect()
	}

	pub async fn shutdown(self) {
		for node in &self.nodes {
			node.shutdown().await;
		}
	}
}

pub(super) struct TestClient {
	pub id: ContextId,
	pub user: String,
	sink: ContextSink,
	rx: mpsc::UnboundedReceiver<String>,
}

impl TestClient {
	pub fn new(id: &str, user: &str) -> Self {
		let (sink, rx) = ContextSink::channel();
		Self {
			id: ContextId::new(id),
			user: user.to_string(),
			sink,
			rx,
		}
	}

	pub fn context(&self) -> SessionContext {
		SessionContext::new(self.id.clone(), self.sink.clone())
	}

	pub fn drain(&mut self) -> Vec<Operation> {
		let mut ops = Vec::new();
		while let Ok(frame) = self.rx.try_recv() {
			ops.push(deserialize(&frame, None).expect("server sent a valid operation"));
		}
		ops
	}

	/// Ids of every participant this client was told joined.
	pub fn joined_ids(&mut self) -> Vec<ContextId> {
		let mut ids: Vec<_> = self
			.drain()
			.into_iter()
			.filter_map(|op| match op {
				Operation::Join { id, .. } => Some(id),
				_ => None,
			})
			.collect();
		ids.sort();
		ids
	}

	/// Simulates the transport dying.
	pub fn disconnect(&mut self) {
		self.rx.close();
	}
}

pub(super) fn design() -> DesignId {
	DesignId::new("petstore")
}

pub(super) fn insert(base: u64, pos: usize, text: &str, id: &str) -> Operation {
	Operation::Command {
		content_version: ContentVersion(base),
		command: json!([{ "retain": pos }, { "insert": text }]),
		command_id: CommandId::new(id),
	}
}

/// Lets every ready task on the test runtime run to completion.
pub(super) async fn settle() {
	for _ in 0..4 {
		tokio::task::yield_now().await;
	}
	tokio::time::sleep(Duration::from_millis(25)).await;
}

pub(super) async fn next_event(rx: &mut broadcast::Receiver<CoordinatorEvent>) -> Option<CoordinatorEvent> {
	tokio::time::timeout(Duration::from_millis(500), rx.recv()).await.ok()?.ok()
}

pub(super) fn no_event(rx: &mut broadcast::Receiver<CoordinatorEvent>) -> bool {
	matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty))
}
