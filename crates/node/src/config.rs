//! Node configuration file.
//!
//! ```toml
//! listen = "127.0.0.1:7420"
//!
//! [engine]
//! node_id = "node-a"
//!
//! [engine.backbone]
//! kind = "log"
//!
//! [log]
//! filter = "coedit_engine=debug,info"
//! dir = "/var/log/coedit"
//!
//! [[designs]]
//! id = "petstore"
//! content = "openapi: 3.1.0\n"
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use coedit_engine::{ConfigError, EngineConfig, load_toml};
use serde::Deserialize;

const DEFAULT_PORT: u16 = 7420;

/// A design seeded into storage at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesignSeed {
	/// Design identifier.
	pub id: String,
	/// Initial canonical content.
	#[serde(default)]
	pub content: String,
}

/// Logging settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
	/// `EnvFilter` directives used when `RUST_LOG` is unset.
	pub filter: Option<String>,
	/// Directory for log files. `COEDIT_LOG_DIR` takes precedence.
	pub dir: Option<PathBuf>,
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
	/// Address the client transport listens on.
	pub listen: SocketAddr,
	/// Engine settings.
	pub engine: EngineConfig,
	/// Designs to create at startup.
	pub designs: Vec<DesignSeed>,
	/// Logging settings.
	pub log: LogConfig,
}

impl Default for NodeConfig {
	fn default() -> Self {
		Self {
			listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
			engine: EngineConfig::default(),
			designs: Vec::new(),
			log: LogConfig::default(),
		}
	}
}

impl NodeConfig {
	/// Loads the configuration.
	///
	/// An explicit path must exist. Without one, the default location is used
	/// when present and built-in defaults otherwise.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let config = match path {
			Some(path) => load_toml(path)?,
			None => match default_path().filter(|p| p.exists()) {
				Some(path) => {
					tracing::debug!(path = %path.display(), "using default config file");
					load_toml(&path)?
				}
				None => Self::default(),
			},
		};
		config.engine.validate()?;
		Ok(config)
	}
}

/// `<config dir>/coedit/node.toml`.
pub fn default_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join("coedit").join("node.toml"))
}
