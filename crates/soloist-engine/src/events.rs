use soloist_core::types::ProcessState;
use tokio::sync::broadcast;

/// One status event: a process entered `state`, with an optional
/// human-readable detail (skip reasons, exit codes, warnings).
#[derive(Debug, Clone)]
pub struct Event {
	pub process: String,
	pub state: ProcessState,
	pub detail: Option<String>,
}

/// Fan-out of supervision events to whoever is displaying them. Dropped
/// events (no subscriber, or a slow one) are fine; `status` is built from
/// the records, not from this stream.
#[derive(Clone)]
pub struct EventBus {
	sender: broadcast::Sender<Event>,
}

impl EventBus {
	pub fn new() -> Self {
		let (sender, _) = broadcast::channel(256);
		Self { sender }
	}

	pub fn emit(&self, process: &str, state: ProcessState, detail: Option<String>) {
		let _ = self.sender.send(Event {
			process: process.to_string(),
			state,
			detail,
		});
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Event> {
		self.sender.subscribe()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new()
	}
}
