//! Command executor contract and a plain-text implementation.

use std::fmt;

use ropey::Rope;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CommandApplyError;

/// Folds command payloads into a document.
///
/// Treated as a pure, possibly slow, function. The rollup engine runs it on
/// the blocking pool.
pub trait CommandExecutor: Send + Sync + fmt::Debug {
	/// Applies `commands`, in order, to `base` and returns the new content.
	fn apply(&self, base: &str, commands: &[Value]) -> Result<String, CommandApplyError>;
}

/// One step of a text edit, in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextOp {
	/// Skip over characters.
	Retain(usize),
	/// Remove characters at the cursor.
	Delete(usize),
	/// Insert text at the cursor.
	Insert(String),
}

/// Executor whose command payload is a JSON array of [`TextOp`]s.
///
/// ```json
/// [{ "retain": 5 }, { "delete": 2 }, { "insert": "AB" }]
/// ```
///
/// Characters past the last op are left untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCommandExecutor;

impl TextCommandExecutor {
	fn apply_one(rope: &mut Rope, ops: &[TextOp], index: usize) -> Result<(), CommandApplyError> {
		let mut pos = 0usize;
		for op in ops {
			match op {
				TextOp::Retain(n) => {
					pos = checked_end(rope, pos, *n, index, "retain")?;
				}
				TextOp::Delete(n) => {
					let end = checked_end(rope, pos, *n, index, "delete")?;
					rope.remove(pos..end);
				}
				TextOp::Insert(text) => {
					rope.insert(pos, text);
					pos += text.chars().count();
				}
			}
		}
		Ok(())
	}
}

fn checked_end(rope: &Rope, pos: usize, n: usize, index: usize, what: &str) -> Result<usize, CommandApplyError> {
	let end = pos.saturating_add(n);
	if end > rope.len_chars() {
		return Err(CommandApplyError::Rejected {
			index,
			reason: format!("{what} of {n} at {pos} runs past end of document ({} chars)", rope.len_chars()),
		});
	}
	Ok(end)
}

impl CommandExecutor for TextCommandExecutor {
	fn apply(&self, base: &str, commands: &[Value]) -> Result<String, CommandApplyError> {
		let mut rope = Rope::from_str(base);
		for (index, command) in commands.iter().enumerate() {
			let ops: Vec<TextOp> =
				serde_json::from_value(command.clone()).map_err(|err| CommandApplyError::InvalidPayload {
					index,
					reason: err.to_string(),
				})?;
			Self::apply_one(&mut rope, &ops, index)?;
		}
		Ok(rope.to_string())
	}
}
