use std::sync::atomic::{AtomicUsize, Ordering};

use coedit_proto::{ActionType, EventAction, NodeId};
use pretty_assertions::assert_eq;
use serde_json::Value;

use super::*;
use crate::error::CommandApplyError;
use crate::executor::{CommandExecutor, TextCommandExecutor};
use crate::rollup::RollupOutcome;
use crate::storage::{CanonicalContent, DesignStorage};

/// Text executor that takes its time and remembers how many ran at once.
#[derive(Debug, Default)]
struct SlowExecutor {
	running: AtomicUsize,
	peak: AtomicUsize,
}

impl CommandExecutor for SlowExecutor {
	fn apply(&self, base: &str, commands: &[Value]) -> Result<String, CommandApplyError> {
		let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
		self.peak.fetch_max(running, Ordering::SeqCst);
		std::thread::sleep(Duration::from_millis(150));
		let result = TextCommandExecutor.apply(base, commands);
		self.running.fetch_sub(1, Ordering::SeqCst);
		result
	}
}

async fn canonical(cluster: &Cluster) -> CanonicalContent {
	cluster.storage.load_canonical(&design()).await.unwrap()
}

#[tokio::test(flavor = "current_thread")]
async fn only_the_last_leave_rolls_up_and_exactly_once() {
	for kind in KINDS {
		let cluster = Cluster::start(kind, 3).await;
		let clients: Vec<_> = (0..3).map(|n| TestClient::new(&format!("c{n}"), "u")).collect();
		for (node, client) in clients.iter().enumerate() {
			cluster.join(node, client).await;
		}

		cluster.submit(0, &clients[0], &insert(0, 2, "A", "a")).await;
		cluster.submit(1, &clients[1], &insert(1, 3, "B", "b")).await;
		cluster.submit(2, &clients[2], &insert(2, 4, "X", "x")).await;
		let undo = Operation::Undo {
			content_version: ContentVersion(3),
		};
		cluster.submit(2, &clients[2], &undo).await;

		let mut events = cluster.subscribe_all();
		cluster.leave(0, &clients[0]).await;
		cluster.leave(1, &clients[1]).await;
		for rx in &mut events {
			assert!(no_event(rx), "{kind}: rollup before the last leave");
		}
		assert_eq!(canonical(&cluster).await.content, "C0", "{kind}");

		cluster.leave(2, &clients[2]).await;
		let event = next_event(&mut events[2]).await;
		assert_eq!(
			event,
			Some(CoordinatorEvent::RollupCompleted {
				design_id: design(),
				outcome: RollupOutcome::RolledUp {
					content_version: ContentVersion(3),
					applied: 2,
					skipped_reverted: 1,
				},
			}),
			"{kind}"
		);

		settle().await;
		for rx in &mut events {
			assert!(no_event(rx), "{kind}: rollup ran more than once");
		}
		assert_eq!(
			canonical(&cluster).await,
			CanonicalContent {
				content: "C0AB".to_string(),
				content_version: ContentVersion(3),
			},
			"{kind}"
		);
		cluster.shutdown().await;
	}
}

#[tokio::test(flavor = "current_thread")]
async fn every_emptying_cycle_rolls_up_and_unchanged_cycles_are_no_ops() {
	let cluster = Cluster::start(BackboneKind::Log, 2).await;
	let mut events = cluster.subscribe_all();
	let a = TestClient::new("a", "ada");

	cluster.join(0, &a).await;
	cluster.submit(0, &a, &insert(0, 0, ">", "c1")).await;
	cluster.leave(0, &a).await;
	assert!(matches!(
		next_event(&mut events[0]).await,
		Some(CoordinatorEvent::RollupCompleted {
			outcome: RollupOutcome::RolledUp { .. },
			..
		})
	));

	cluster.join(1, &a).await;
	cluster.leave(1, &a).await;
	assert_eq!(
		next_event(&mut events[1]).await,
		Some(CoordinatorEvent::RollupCompleted {
			design_id: design(),
			outcome: RollupOutcome::Unchanged {
				content_version: ContentVersion(1),
			},
		})
	);
	assert_eq!(canonical(&cluster).await.content, ">C0");
}

#[tokio::test(flavor = "current_thread")]
async fn failed_rollup_keeps_content_and_the_next_cycle_recovers() {
	let cluster = Cluster::start(BackboneKind::Log, 1).await;
	let mut events = cluster.subscribe_all();
	let a = TestClient::new("a", "ada");

	cluster.join(0, &a).await;
	cluster.submit(0, &a, &insert(0, 2, "A", "good")).await;
	cluster.submit(0, &a, &insert(1, 99, "!", "bad")).await;
	cluster.leave(0, &a).await;

	let Some(CoordinatorEvent::RollupFailed { error, .. }) = next_event(&mut events[0]).await else {
		panic!("expected a failed rollup");
	};
	assert!(error.contains("command #1"), "{error}");
	assert_eq!(
		canonical(&cluster).await,
		CanonicalContent {
			content: "C0".to_string(),
			content_version: ContentVersion(0),
		}
	);
	assert_eq!(cluster.storage.command_log(&design()).len(), 2);

	cluster.join(0, &a).await;
	let undo = Operation::Undo {
		content_version: ContentVersion(2),
	};
	cluster.submit(0, &a, &undo).await;
	cluster.leave(0, &a).await;

	assert!(matches!(
		next_event(&mut events[0]).await,
		Some(CoordinatorEvent::RollupCompleted { .. })
	));
	assert_eq!(
		canonical(&cluster).await,
		CanonicalContent {
			content: "C0A".to_string(),
			content_version: ContentVersion(2),
		}
	);
}

#[tokio::test(flavor = "current_thread")]
async fn close_from_a_node_that_is_not_last_does_not_roll_up() {
	for kind in KINDS {
		let cluster = Cluster::start(kind, 2).await;
		let mut events = cluster.subscribe_all();
		let a = TestClient::new("a", "ada");
		let b = TestClient::new("b", "bob");
		cluster.join(0, &a).await;
		cluster.join(1, &b).await;

		cluster.leave(0, &a).await;
		assert!(cluster.node(0).session(&design()).is_none(), "{kind}");
		assert_eq!(cluster.node(1).participants(&design()).await, 1, "{kind}");
		for rx in &mut events {
			assert!(no_event(rx), "{kind}");
		}

		cluster.leave(1, &b).await;
		assert!(next_event(&mut events[1]).await.is_some(), "{kind}");
		assert!(no_event(&mut events[0]), "{kind}");
	}
}

#[tokio::test(flavor = "current_thread")]
async fn rollup_envelopes_are_ignored() {
	let cluster = Cluster::start(BackboneKind::Log, 1).await;
	let mut events = cluster.subscribe_all();
	let a = TestClient::new("a", "ada");
	cluster.join(0, &a).await;
	cluster.submit(0, &a, &insert(0, 0, "x", "c1")).await;

	let (tx, _rx) = mpsc::unbounded_channel();
	let intruder = cluster.fabric.connect(BackboneKind::Log, NodeId::new("intruder"), tx);
	let rollup = EventAction {
		action: ActionType::Rollup,
		origin: NodeId::new("intruder"),
		correlation_id: None,
		operation: None,
		join_batch: None,
	};
	intruder.send(&design(), rollup).await.unwrap();
	intruder.send(&design(), EventAction::close(NodeId::new("intruder"))).await.unwrap();
	settle().await;

	assert!(no_event(&mut events[0]));
	assert_eq!(canonical(&cluster).await.content, "C0");
	assert_eq!(cluster.node(0).participants(&design()).await, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn cycle_emptied_during_a_rollup_waits_for_it() {
	for kind in KINDS {
		let executor = Arc::new(SlowExecutor::default());
		let cluster = Cluster::start_with(kind, 2, executor.clone()).await;
		let mut events = cluster.subscribe_all();
		let a = TestClient::new("a", "ada");

		cluster.join(0, &a).await;
		cluster.submit(0, &a, &insert(0, 2, "A", "first")).await;
		cluster.leave(0, &a).await;

		cluster.join(1, &a).await;
		cluster.submit(1, &a, &insert(1, 3, "B", "second")).await;
		cluster.leave(1, &a).await;

		let mut versions = Vec::new();
		for _ in 0..2 {
			let Some(CoordinatorEvent::RollupCompleted { outcome, .. }) = next_event(&mut events[0]).await else {
				panic!("{kind}: expected a completed rollup");
			};
			versions.push(outcome.content_version());
		}
		assert_eq!(versions, vec![ContentVersion(1), ContentVersion(2)], "{kind}");
		assert!(no_event(&mut events[1]), "{kind}");
		assert_eq!(executor.peak.load(Ordering::SeqCst), 1, "{kind}");
		assert_eq!(
			canonical(&cluster).await,
			CanonicalContent {
				content: "C0AB".to_string(),
				content_version: ContentVersion(2),
			},
			"{kind}"
		);
		cluster.shutdown().await;
	}
}
