//! Consolidation of the pending command log into canonical content.
//!
//! A rollup folds every non-reverted command committed after the canonical
//! high-water version into the canonical content and persists the result.
//! Nothing is written until the whole fold has succeeded, so a failed cycle
//! leaves stored state exactly as it was and the next zero-crossing retries.

use std::sync::Arc;

use coedit_proto::{ContentVersion, DesignId};
use serde_json::Value;

use crate::error::{CommandApplyError, RollupError};
use crate::executor::CommandExecutor;
use crate::storage::DesignStorage;

/// Result of a successful rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupOutcome {
	/// Nothing to fold; stored state was not touched.
	Unchanged {
		/// Canonical high-water version.
		content_version: ContentVersion,
	},
	/// New canonical content was persisted.
	RolledUp {
		/// New high-water version.
		content_version: ContentVersion,
		/// Commands folded into the content.
		applied: usize,
		/// Reverted commands that were skipped.
		skipped_reverted: usize,
	},
}

impl RollupOutcome {
	/// High-water version after the rollup.
	pub fn content_version(&self) -> ContentVersion {
		match self {
			Self::Unchanged { content_version } | Self::RolledUp { content_version, .. } => *content_version,
		}
	}
}

/// Runs rollups against a storage and an executor.
#[derive(Debug, Clone)]
pub struct RollupEngine {
	storage: Arc<dyn DesignStorage>,
	executor: Arc<dyn CommandExecutor>,
}

impl RollupEngine {
	/// Creates an engine over the given collaborators.
	pub fn new(storage: Arc<dyn DesignStorage>, executor: Arc<dyn CommandExecutor>) -> Self {
		Self { storage, executor }
	}

	/// Folds pending commands of `design_id` into its canonical content.
	///
	/// # Errors
	///
	/// [`RollupError::CommandApply`] when the executor refuses a command and
	/// [`RollupError::Persistence`] when storage fails. Either way nothing has
	/// been persisted.
	pub async fn rollup(&self, design_id: &DesignId) -> Result<RollupOutcome, RollupError> {
		let canonical = self.storage.load_canonical(design_id).await?;
		let mut pending = self
			.storage
			.load_pending_commands(design_id, canonical.content_version)
			.await?;
		pending.sort_by_key(|command| command.content_version);

		let Some(high_water) = pending.last().map(|command| command.content_version) else {
			tracing::debug!(design = %design_id, version = %canonical.content_version, "nothing to roll up");
			return Ok(RollupOutcome::Unchanged {
				content_version: canonical.content_version,
			});
		};

		let total = pending.len();
		let payloads: Vec<Value> = pending
			.into_iter()
			.filter(|command| !command.reverted)
			.map(|command| command.command)
			.collect();
		let skipped_reverted = total - payloads.len();

		if payloads.is_empty() {
			tracing::debug!(
				design = %design_id,
				skipped_reverted,
				"only reverted commands pending, canonical content kept"
			);
			return Ok(RollupOutcome::Unchanged {
				content_version: canonical.content_version,
			});
		}

		let applied = payloads.len();
		let executor = Arc::clone(&self.executor);
		let base = canonical.content;
		let content = tokio::task::spawn_blocking(move || executor.apply(&base, &payloads))
			.await
			.map_err(|err| CommandApplyError::Aborted(err.to_string()))??;

		self.storage.persist_canonical(design_id, content, high_water).await?;
		tracing::info!(
			design = %design_id,
			from = %canonical.content_version,
			to = %high_water,
			applied,
			skipped_reverted,
			"rollup persisted"
		);

		Ok(RollupOutcome::RolledUp {
			content_version: high_water,
			applied,
			skipped_reverted,
		})
	}
}
