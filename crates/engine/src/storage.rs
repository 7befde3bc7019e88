//! Storage collaborator contract and an in-memory implementation.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use coedit_proto::{ContentVersion, DesignId, FullCommand};
use parking_lot::Mutex;

use crate::error::StorageError;

/// Last rolled-up content of a design.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalContent {
	/// Document text.
	pub content: String,
	/// Highest command version folded into `content`.
	pub content_version: ContentVersion,
}

/// Durable store for canonical content and the pending command log.
#[async_trait]
pub trait DesignStorage: Send + Sync + fmt::Debug {
	/// Appends a command and returns the version it was committed at.
	///
	/// Versions are assigned atomically and strictly increase per design; the
	/// incoming `content_version` is ignored.
	async fn append_command(&self, design_id: &DesignId, command: FullCommand) -> Result<ContentVersion, StorageError>;

	/// Commands committed after `after`, in ascending version order.
	async fn load_pending_commands(
		&self,
		design_id: &DesignId,
		after: ContentVersion,
	) -> Result<Vec<FullCommand>, StorageError>;

	/// Flags or unflags the command at `version` as reverted.
	async fn set_reverted(&self, design_id: &DesignId, version: ContentVersion, reverted: bool) -> Result<(), StorageError>;

	/// Current canonical content.
	async fn load_canonical(&self, design_id: &DesignId) -> Result<CanonicalContent, StorageError>;

	/// Replaces the canonical content and its high-water version.
	///
	/// A version below the stored one is refused with
	/// [`StorageError::StaleCanonical`].
	async fn persist_canonical(
		&self,
		design_id: &DesignId,
		content: String,
		content_version: ContentVersion,
	) -> Result<(), StorageError>;

	/// Highest committed version, rolled up or not.
	async fn latest_version(&self, design_id: &DesignId) -> Result<ContentVersion, StorageError>;
}

#[derive(Debug, Default)]
struct DesignRecord {
	canonical: CanonicalContent,
	log: Vec<FullCommand>,
}

impl DesignRecord {
	fn latest_version(&self) -> ContentVersion {
		self.log
			.last()
			.map(|c| c.content_version)
			.unwrap_or_default()
			.max(self.canonical.content_version)
	}
}

/// Process-local [`DesignStorage`].
///
/// Designs spring into existence, empty, on first access. The command log is
/// append-only; rolled-up entries are kept for audit.
#[derive(Debug, Default)]
pub struct MemoryStorage {
	designs: Mutex<HashMap<DesignId, DesignRecord>>,
}

impl MemoryStorage {
	/// Creates an empty store.
	pub fn new() -> Self {
		Self::default()
	}

	/// Seeds a design with initial content at version zero.
	pub fn insert_design(&self, design_id: DesignId, content: impl Into<String>) {
		self.designs.lock().insert(
			design_id,
			DesignRecord {
				canonical: CanonicalContent {
					content: content.into(),
					content_version: ContentVersion::default(),
				},
				log: Vec::new(),
			},
		);
	}

	/// Every logged command of a design, rolled up or not.
	pub fn command_log(&self, design_id: &DesignId) -> Vec<FullCommand> {
		self.designs
			.lock()
			.get(design_id)
			.map(|record| record.log.clone())
			.unwrap_or_default()
	}
}

#[async_trait]
impl DesignStorage for MemoryStorage {
	async fn append_command(
		&self,
		design_id: &DesignId,
		mut command: FullCommand,
	) -> Result<ContentVersion, StorageError> {
		let mut designs = self.designs.lock();
		let record = designs.entry(design_id.clone()).or_default();
		let version = record.latest_version().next();
		command.content_version = version;
		record.log.push(command);
		Ok(version)
	}

	async fn load_pending_commands(
		&self,
		design_id: &DesignId,
		after: ContentVersion,
	) -> Result<Vec<FullCommand>, StorageError> {
		let designs = self.designs.lock();
		let Some(record) = designs.get(design_id) else {
			return Ok(Vec::new());
		};
		Ok(record
			.log
			.iter()
			.filter(|c| c.content_version > after)
			.cloned()
			.collect())
	}

	async fn set_reverted(&self, design_id: &DesignId, version: ContentVersion, reverted: bool) -> Result<(), StorageError> {
		let mut designs = self.designs.lock();
		let command = designs
			.get_mut(design_id)
			.and_then(|record| record.log.iter_mut().find(|c| c.content_version == version));
		let Some(command) = command else {
			return Err(StorageError::UnknownVersion {
				design: design_id.clone(),
				version,
			});
		};
		command.reverted = reverted;
		Ok(())
	}

	async fn load_canonical(&self, design_id: &DesignId) -> Result<CanonicalContent, StorageError> {
		Ok(self
			.designs
			.lock()
			.get(design_id)
			.map(|record| record.canonical.clone())
			.unwrap_or_default())
	}

	async fn persist_canonical(
		&self,
		design_id: &DesignId,
		content: String,
		content_version: ContentVersion,
	) -> Result<(), StorageError> {
		let mut designs = self.designs.lock();
		let record = designs.entry(design_id.clone()).or_default();
		let stored = record.canonical.content_version;
		if content_version < stored {
			return Err(StorageError::StaleCanonical {
				design: design_id.clone(),
				stored,
				attempted: content_version,
			});
		}
		record.canonical = CanonicalContent {
			content,
			content_version,
		};
		Ok(())
	}

	async fn latest_version(&self, design_id: &DesignId) -> Result<ContentVersion, StorageError> {
		Ok(self
			.designs
			.lock()
			.get(design_id)
			.map(DesignRecord::latest_version)
			.unwrap_or_default())
	}
}
