use std::collections::HashMap;

use crate::probe::ProcessIdent;

/// In-memory record of the last-observed OS identity per managed process.
///
/// Pure state, no I/O. Owned by the supervisor and passed explicitly; there
/// is no process-wide singleton.
#[derive(Debug, Default)]
pub struct Registry {
	entries: HashMap<String, ProcessIdent>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, name: &str, ident: ProcessIdent) {
		self.entries.insert(name.to_string(), ident);
	}

	pub fn lookup(&self, name: &str) -> Option<ProcessIdent> {
		self.entries.get(name).copied()
	}

	/// Unknown names are a no-op.
	pub fn clear(&mut self, name: &str) {
		self.entries.remove(name);
	}
}
