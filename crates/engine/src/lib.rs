//! Collaborative editing coordination engine.
//!
//! Several server nodes may each host editors of the same design. This crate
//! keeps their views consistent and consolidates the edit stream:
//!
//! * [`token`] mints and redeems one-time join credentials.
//! * [`session`] and [`registry`] track the contexts a node hosts and fan
//!   operations out to them.
//! * [`backbone`] carries envelopes between nodes and counts participants
//!   cluster-wide, over an append log or a replicated map.
//! * [`rollup`] folds pending commands into canonical content once a design
//!   is unattended.
//! * [`coordinator`] owns all of the above for one node and exposes the entry
//!   points the transport layer calls.

#![warn(missing_docs)]

pub mod backbone;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod registry;
pub mod rollup;
pub mod session;
pub mod storage;
pub mod token;

#[cfg(test)]
mod tests;

pub use backbone::{Backbone, ClusterFabric, Inbound};
pub use config::{BackboneConfig, BackboneKind, EngineConfig, TokenConfig, load_toml};
pub use context::{ContextSink, SessionContext};
pub use coordinator::{Coordinator, CoordinatorEvent};
pub use error::{
	BackboneError, CommandApplyError, ConfigError, DeliveryError, EngineError, InvalidSessionToken, Result, RollupError,
	StorageError, TokenRejection,
};
pub use executor::{CommandExecutor, TextCommandExecutor, TextOp};
pub use rollup::{RollupEngine, RollupOutcome};
pub use session::{FanOut, LocalSession};
pub use storage::{CanonicalContent, DesignStorage, MemoryStorage};
pub use token::SessionTokenIssuer;
