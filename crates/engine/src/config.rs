//! Engine configuration.
//!
//! Configuration is read from TOML. Every section is optional; missing keys
//! take their defaults and unknown keys are rejected.
//!
//! ```toml
//! node_id = "node-a"
//!
//! [backbone]
//! kind = "replicated"
//! log_retention = 10000
//!
//! [tokens]
//! ttl_secs = 300
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use coedit_proto::NodeId;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::ConfigError;

/// Backing strategy for the event distribution backbone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
	/// Ordered append log; every node sees every envelope.
	#[default]
	Log,
	/// Replicated map with change listeners; bursts may coalesce.
	Replicated,
}

impl BackboneKind {
	/// Configuration name of the strategy.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Log => "log",
			Self::Replicated => "replicated",
		}
	}
}

impl fmt::Display for BackboneKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for BackboneKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"log" => Ok(Self::Log),
			"replicated" => Ok(Self::Replicated),
			other => Err(format!("unknown backbone '{other}' (expected 'log' or 'replicated')")),
		}
	}
}

/// Backbone settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackboneConfig {
	/// Which strategy to use.
	pub kind: BackboneKind,
	/// Records kept by the append log before the oldest are dropped.
	pub log_retention: usize,
}

impl Default for BackboneConfig {
	fn default() -> Self {
		Self {
			kind: BackboneKind::Log,
			log_retention: 10_000,
		}
	}
}

/// Session token settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenConfig {
	/// Seconds a token stays redeemable after issuance.
	pub ttl_secs: u64,
}

impl TokenConfig {
	/// Token lifetime.
	pub fn ttl(&self) -> Duration {
		Duration::from_secs(self.ttl_secs)
	}
}

impl Default for TokenConfig {
	fn default() -> Self {
		Self { ttl_secs: 300 }
	}
}

/// Configuration for one engine instance (one node).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
	/// Stable node identifier. A random one is generated when unset.
	pub node_id: Option<String>,
	/// Backbone settings.
	pub backbone: BackboneConfig,
	/// Token settings.
	pub tokens: TokenConfig,
}

impl EngineConfig {
	/// Parses and validates a TOML document.
	pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(input)?;
		config.validate()?;
		Ok(config)
	}

	/// Checks value ranges that the type system cannot express.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.backbone.log_retention == 0 {
			return Err(ConfigError::Invalid {
				key: "backbone.log_retention",
				reason: "must be greater than zero".to_string(),
			});
		}
		if self.tokens.ttl_secs == 0 {
			return Err(ConfigError::Invalid {
				key: "tokens.ttl_secs",
				reason: "must be greater than zero".to_string(),
			});
		}
		if let Some(node_id) = &self.node_id
			&& node_id.trim().is_empty()
		{
			return Err(ConfigError::Invalid {
				key: "node_id",
				reason: "must not be blank".to_string(),
			});
		}
		Ok(())
	}

	/// Resolves the node identifier, generating one when unset.
	pub fn resolve_node_id(&self) -> NodeId {
		self.node_id.clone().map(NodeId::new).unwrap_or_else(NodeId::random)
	}
}

/// Reads and parses a TOML file into any configuration type.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
	let input = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
		path: path.to_path_buf(),
		error,
	})?;
	Ok(toml::from_str(&input)?)
}
