use pretty_assertions::assert_eq;

use super::*;

fn ids(names: &[&str]) -> Vec<ContextId> {
	let mut ids: Vec<_> = names.iter().map(|n| ContextId::new(*n)).collect();
	ids.sort();
	ids
}

#[tokio::test(flavor = "current_thread")]
async fn every_participant_learns_of_every_other_across_nodes() {
	let cluster = Cluster::start(BackboneKind::Log, 3).await;
	let mut clients = [
		(0, TestClient::new("c0", "ada")),
		(1, TestClient::new("c1", "bob")),
		(2, TestClient::new("c2", "cy")),
		(0, TestClient::new("c3", "dee")),
	];
	for (node, client) in &clients {
		cluster.join(*node, client).await;
	}

	let all = ["c0", "c1", "c2", "c3"];
	for (_, client) in &mut clients {
		let others: Vec<_> = all.iter().copied().filter(|n| *n != client.id.0).collect();
		assert_eq!(client.joined_ids(), ids(&others), "roster of {}", client.id);
	}
}

#[tokio::test(flavor = "current_thread")]
async fn local_joins_are_complete_on_either_backbone() {
	for kind in KINDS {
		let cluster = Cluster::start(kind, 1).await;
		let mut a = TestClient::new("a", "ada");
		let mut b = TestClient::new("b", "bob");
		let mut c = TestClient::new("c", "cy");
		cluster.join(0, &a).await;
		cluster.join(0, &b).await;
		cluster.join(0, &c).await;

		assert_eq!(a.joined_ids(), ids(&["b", "c"]), "{kind}");
		assert_eq!(b.joined_ids(), ids(&["a", "c"]), "{kind}");
		assert_eq!(c.joined_ids(), ids(&["a", "b"]), "{kind}");
	}
}

#[tokio::test(flavor = "current_thread")]
async fn replicated_join_is_announced_and_answered_in_one_write() {
	let cluster = Cluster::start(BackboneKind::Replicated, 2).await;
	let mut a = TestClient::new("a", "ada");
	let mut b = TestClient::new("b", "bob");
	cluster.join(0, &a).await;
	cluster.join(1, &b).await;

	assert_eq!(a.joined_ids(), ids(&["b"]));
	assert_eq!(b.joined_ids(), ids(&["a"]));
}

#[tokio::test(flavor = "current_thread")]
async fn replicated_newcomer_is_announced_everywhere_but_remote_rosters_coalesce() {
	let cluster = Cluster::start(BackboneKind::Replicated, 3).await;
	let mut a = TestClient::new("a", "ada");
	let mut b = TestClient::new("b", "bob");
	let mut c = TestClient::new("c", "cy");
	cluster.join(0, &a).await;
	cluster.join(1, &b).await;
	a.drain();
	b.drain();

	cluster.join(2, &c).await;

	assert_eq!(a.joined_ids(), ids(&["c"]));
	assert_eq!(b.joined_ids(), ids(&["c"]));
	// Both remote replies land in the design's slot; at least the last is seen.
	let roster = c.joined_ids();
	assert!(!roster.is_empty(), "newcomer saw no remote roster");
	assert!(roster.iter().all(|id| ids(&["a", "b"]).contains(id)), "{roster:?}");
}

#[tokio::test(flavor = "current_thread")]
async fn rejoining_context_is_counted_once() {
	let cluster = Cluster::start(BackboneKind::Log, 2).await;
	let a = TestClient::new("a", "ada");
	let mut b = TestClient::new("b", "bob");
	cluster.join(0, &a).await;
	cluster.join(1, &b).await;
	cluster.join(0, &a).await;

	assert_eq!(cluster.node(1).participants(&design()).await, 2);
	assert_eq!(cluster.node(0).session(&design()).map(|s| s.len()), Some(1));
	assert_eq!(b.joined_ids(), ids(&["a", "a"]));
}

#[tokio::test(flavor = "current_thread")]
async fn participant_counter_tracks_live_contexts() {
	for kind in KINDS {
		let cluster = Cluster::start(kind, 3).await;
		let clients: Vec<_> = (0..6).map(|n| (n % 3, TestClient::new(&format!("c{n}"), "u"))).collect();
		let count = || cluster.fabric.counters().value(&design());

		for (live, (node, client)) in clients.iter().enumerate() {
			cluster.join(*node, client).await;
			assert_eq!(count(), live as i64 + 1, "{kind}: after join {}", client.id);
		}
		for (gone, (node, client)) in clients.iter().enumerate().rev() {
			cluster.leave(*node, client).await;
			assert_eq!(count(), gone as i64, "{kind}: after leave {}", client.id);
		}
		for node in &cluster.nodes {
			assert!(node.session(&design()).is_none(), "{kind}: session discarded");
		}
	}
}

#[tokio::test(flavor = "current_thread")]
async fn leave_is_announced_on_every_node() {
	let cluster = Cluster::start(BackboneKind::Log, 2).await;
	let a = TestClient::new("a", "ada");
	let mut a2 = TestClient::new("a2", "alan");
	let mut b = TestClient::new("b", "bob");
	cluster.join(0, &a).await;
	cluster.join(0, &a2).await;
	cluster.join(1, &b).await;
	a2.drain();
	b.drain();

	cluster.leave(0, &a).await;

	let leave = Operation::leave("ada", ContextId::new("a"));
	assert_eq!(a2.drain(), vec![leave.clone()]);
	assert_eq!(b.drain(), vec![leave]);
}

#[tokio::test(flavor = "current_thread")]
async fn leaving_an_unknown_context_is_an_error() {
	let cluster = Cluster::start(BackboneKind::Log, 1).await;
	let err = cluster.node(0).leave(&design(), &ContextId::new("ghost")).await.unwrap_err();
	assert!(matches!(err, crate::error::EngineError::UnknownContext { .. }));
}
