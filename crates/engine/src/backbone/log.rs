//! Append-log backbone.
//!
//! Every publish is appended to one ordered topic shared by the cluster. Each
//! node runs a subscriber that reads from its own cursor, so all nodes observe
//! every envelope in publish order. Retention is bounded: a subscriber that
//! falls out of the retained window logs the gap and resumes at the oldest
//! record still held.

use std::collections::VecDeque;
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

/// One appended envelope.
#[derive(Debug, Clone)]
pub struct LogRecord {
	/// Position in the topic.
	pub offset: u64,
	/// Design the envelope concerns.
	pub design_id: DesignId,
	/// Encoded [`EventAction`].
	pub payload: Arc<str>,
}

/// Records returned by [`LogBroker::read_from`].
#[derive(Debug, Default)]
pub struct LogBatch {
	/// Records at or after the requested cursor, in order.
	pub records: Vec<LogRecord>,
	/// Records between the cursor and the oldest retained one that were lost
	/// to retention.
	pub skipped: u64,
}

#[derive(Debug, Default)]
struct LogState {
	records: VecDeque<LogRecord>,
	next_offset: u64,
}

/// Ordered topic shared by every node of a cluster.
#[derive(Debug)]
pub struct LogBroker {
	retention: usize,
	state: Mutex<LogState>,
	head: watch::Sender<u64>,
}

impl LogBroker {
	/// Creates an empty topic that keeps at most `retention` records.
	pub fn new(retention: usize) -> Self {
		let (head, _) = watch::channel(0);
		Self {
			retention: retention.max(1),
			state: Mutex::new(LogState::default()),
			head,
		}
	}

	/// Appends a record and returns its offset.
	pub fn append(&self, design_id: DesignId, payload: Arc<str>) -> u64 {
		let mut state = self.state.lock();
		let offset = state.next_offset;
		state.next_offset += 1;
		state.records.push_back(LogRecord {
			offset,
			design_id,
			payload,
		});
		while state.records.len() > self.retention {
			state.records.pop_front();
		}
		self.head.send_replace(state.next_offset);
		offset
	}

	/// Offset the next appended record will get.
	pub fn head(&self) -> u64 {
		*self.head.borrow()
	}

	/// Watches the head offset.
	pub fn subscribe(&self) -> watch::Receiver<u64> {
		self.head.subscribe()
	}

	/// Returns every retained record at or after `cursor`.
	pub fn read_from(&self, cursor: u64) -> LogBatch {
		let state = self.state.lock();
		let Some(oldest) = state.records.front().map(|r| r.offset) else {
			return LogBatch::default();
		};

		let skipped = oldest.saturating_sub(cursor);
		let start = cursor.saturating_sub(oldest);
		let Ok(start) = usize::try_from(start) else {
			return LogBatch { records: Vec::new(), skipped };
		};
		LogBatch {
			records: state.records.iter().skip(start).cloned().collect(),
			skipped,
		}
	}

	/// Number of retained records.
	pub fn len(&self) -> usize {
		self.state.lock().records.len()
	}

	/// Whether nothing has been retained.
	pub fn is_empty(&self) -> bool {
		self.state.lock().records.is_empty()
	}
}

/// Node-side handle on a [`LogBroker`].
#[derive(Debug)]
pub struct LogBackbone {
	node_id: NodeId,
	broker: Arc<LogBroker>,
	counters: Arc<ClusterCounters>,
	inbound: mpsc::UnboundedSender<Inbound>,
	started: AtomicBool,
	shutdown: CancellationToken,
}

impl LogBackbone {
	/// Creates a handle. Nothing is subscribed until [`Backbone::start`].
	pub fn new(
		node_id: NodeId,
		broker: Arc<LogBroker>,
		counters: Arc<ClusterCounters>,
		inbound: mpsc::UnboundedSender<Inbound>,
	) -> Self {
		Self {
			node_id,
			broker,
			counters,
			inbound,
			started: AtomicBool::new(false),
			shutdown: CancellationToken::new(),
		}
	}
}

#[async_trait]
impl Backbone for LogBackbone {
	fn kind(&self) -> BackboneKind {
		BackboneKind::Log
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

		let mut head = self.broker.subscribe();
		let cursor = *head.borrow_and_update();
		tracing::info!(node = %self.node_id, cursor, "log backbone subscribed");

		tokio::spawn(run_subscriber(
			self.node_id.clone(),
			Arc::clone(&self.broker),
			head,
			cursor,
			self.inbound.clone(),
			self.shutdown.clone(),
		));
		Ok(())
	}

	async fn send(&self, design_id: &DesignId, action: EventAction) -> Result<(), BackboneError> {
		self.start().await?;
		let payload = action.encode()?;
		let offset = self.broker.append(design_id.clone(), payload.into());
		tracing::trace!(
			node = %self.node_id,
			design = %design_id,
			action = action.action.as_str(),
			offset,
			"envelope appended"
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
		self.counters.finish_rollup(design_id)
	}

	async fn stop(&self) {
		self.shutdown.cancel();
	}
}

async fn run_subscriber(
	node_id: NodeId,
	broker: Arc<LogBroker>,
	mut head: watch::Receiver<u64>,
	mut cursor: u64,
	inbound: mpsc::UnboundedSender<Inbound>,
	shutdown: CancellationToken,
) {
	loop {
		let batch = broker.read_from(cursor);
		if batch.skipped > 0 {
			tracing::warn!(node = %node_id, cursor, skipped = batch.skipped, "log subscriber fell behind retention");
		}
		cursor += batch.skipped;

		for record in batch.records {
			cursor = record.offset + 1;
			if !forward(&node_id, record.design_id, &record.payload, &inbound) {
				tracing::debug!(node = %node_id, "dispatcher gone, log subscriber exiting");
				return;
			}
		}

		tokio::select! {
			biased;
			_ = shutdown.cancelled() => break,
			changed = head.changed() => {
				if changed.is_err() {
					break;
				}
			}
		}
	}
	tracing::debug!(node = %node_id, "log subscriber stopped");
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(broker: &LogBroker, n: u64) {
		broker.append(DesignId::new("d1"), Arc::from(format!("payload-{n}")));
	}

	#[test]
	fn read_from_returns_records_in_order() {
		let broker = LogBroker::new(16);
		for n in 0..4 {
			record(&broker, n);
		}

		let batch = broker.read_from(1);
		assert_eq!(batch.skipped, 0);
		let offsets: Vec<_> = batch.records.iter().map(|r| r.offset).collect();
		assert_eq!(offsets, vec![1, 2, 3]);
		assert_eq!(broker.head(), 4);
		assert!(broker.read_from(4).records.is_empty());
	}

	#[test]
	fn retention_drops_oldest_and_reports_the_gap() {
		let broker = LogBroker::new(3);
		for n in 0..5 {
			record(&broker, n);
		}

		assert_eq!(broker.len(), 3);
		let batch = broker.read_from(0);
		assert_eq!(batch.skipped, 2);
		assert_eq!(batch.records.first().map(|r| r.offset), Some(2));
		assert_eq!(&*batch.records[0].payload, "payload-2");
	}
}
