//! Shared wire types for collaborative design editing.
//!
//! This crate defines the messages exchanged between editor clients and server
//! nodes ([`Operation`]) and between server nodes ([`EventAction`]). Both use a
//! JSON encoding; operations are discriminated by a `type` tag.

#![warn(missing_docs)]

pub mod envelope;
pub mod error;
pub mod operation;
pub mod types;

pub use envelope::{ActionType, EventAction};
pub use error::{ProtocolError, Result};
pub use operation::{FullCommand, Operation, OperationKind, deserialize, serialize};
pub use types::*;
