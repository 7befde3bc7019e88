//! Cluster-wide participant counters.

use std::collections::HashMap;

use coedit_proto::DesignId;
use parking_lot::Mutex;

use crate::error::BackboneError;

#[derive(Debug, Default, Clone, Copy)]
struct Counter {
	/// Live contexts across the cluster.
	value: i64,
	/// Incremented on every transition from zero to positive.
	cycle: u64,
	/// Last cycle a rollup was granted for.
	claimed: u64,
	/// A granted rollup has not finished yet.
	rolling: bool,
}

/// Replicated participant counter store shared by every node of a cluster.
///
/// Counters only change through [`merge`](Self::merge), a single atomic add,
/// so concurrent joins and leaves on different nodes commute. Each design
/// additionally tracks an emptying cycle, which lets
/// [`claim_rollup`](Self::claim_rollup) grant exactly one rollup per time the
/// counter drops back to zero, no matter how many `CLOSE` envelopes race.
/// At most one rollup per design runs at a time: a cycle that empties while
/// one is running is handed over by [`finish_rollup`](Self::finish_rollup).
#[derive(Debug, Default)]
pub struct ClusterCounters {
	counters: Mutex<HashMap<DesignId, Counter>>,
}

impl ClusterCounters {
	/// Creates an empty store.
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds `delta` to the design's counter and returns the new value.
	///
	/// # Errors
	///
	/// A result below zero is a bookkeeping bug. It is logged and reported as
	/// [`BackboneError::CounterInconsistency`]; the value is kept as is.
	pub fn merge(&self, design_id: &DesignId, delta: i64) -> Result<i64, BackboneError> {
		let value = {
			let mut counters = self.counters.lock();
			let counter = counters.entry(design_id.clone()).or_default();
			let before = counter.value;
			counter.value += delta;
			if before <= 0 && counter.value > 0 {
				counter.cycle += 1;
			}
			counter.value
		};

		if value < 0 {
			tracing::error!(design = %design_id, value, delta, "participant counter went negative");
			return Err(BackboneError::CounterInconsistency {
				design: design_id.clone(),
				value,
			});
		}
		tracing::trace!(design = %design_id, value, delta, "participant counter merged");
		Ok(value)
	}

	/// Current value of the design's counter.
	pub fn value(&self, design_id: &DesignId) -> i64 {
		self.counters.lock().get(design_id).map_or(0, |c| c.value)
	}

	/// Grants the rollup for the current emptying cycle.
	///
	/// Returns true at most once per cycle, only while the counter is exactly
	/// zero and no rollup of the design is running. The holder must call
	/// [`finish_rollup`](Self::finish_rollup) when done.
	pub fn claim_rollup(&self, design_id: &DesignId) -> Result<bool, BackboneError> {
		let mut counters = self.counters.lock();
		let Some(counter) = counters.get_mut(design_id) else {
			return Ok(false);
		};

		if counter.value < 0 {
			let value = counter.value;
			drop(counters);
			tracing::error!(design = %design_id, value, "rollup claim on negative participant counter");
			return Err(BackboneError::CounterInconsistency {
				design: design_id.clone(),
				value,
			});
		}
		if counter.value != 0 || counter.claimed >= counter.cycle {
			return Ok(false);
		}
		if counter.rolling {
			tracing::debug!(design = %design_id, cycle = counter.cycle, "rollup running, cycle deferred");
			return Ok(false);
		}

		counter.claimed = counter.cycle;
		counter.rolling = true;
		Ok(true)
	}

	/// Releases a granted rollup.
	///
	/// Returns true when another cycle emptied while it ran; the claim passes
	/// straight to the caller, who must roll up again and call this once more.
	/// Otherwise an idle design's entry is dropped.
	pub fn finish_rollup(&self, design_id: &DesignId) -> bool {
		let mut counters = self.counters.lock();
		let Some(counter) = counters.get_mut(design_id) else {
			return false;
		};

		if counter.value == 0 && counter.claimed < counter.cycle {
			counter.claimed = counter.cycle;
			return true;
		}
		counter.rolling = false;
		if counter.value == 0 {
			counters.remove(design_id);
		}
		false
	}
}
