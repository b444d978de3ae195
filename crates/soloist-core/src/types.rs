use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Immutable definition of one managed process. Built by config resolution
/// at startup and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
	pub name: String,
	pub command: String,
	#[serde(default)]
	pub cwd: Option<PathBuf>,
	#[serde(default)]
	pub policy: RestartPolicy,
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
	#[serde(default = "default_backoff_ms")]
	pub backoff_ms: u64,
	#[serde(default = "default_backoff_cap_ms")]
	pub backoff_cap_ms: u64,
	#[serde(default = "default_grace_secs")]
	pub grace_secs: u64,
	#[serde(default)]
	pub env: HashMap<String, String>,
}

impl ProcessSpec {
	/// Delay before the next launch attempt after `failures` consecutive
	/// failures. Doubles per failure, capped at `backoff_cap_ms`.
	pub fn backoff_delay(&self, failures: u32) -> Duration {
		let exp = failures.saturating_sub(1).min(16);
		let ms = self
			.backoff_ms
			.saturating_mul(1u64 << exp)
			.min(self.backoff_cap_ms);
		Duration::from_millis(ms)
	}

	pub fn grace(&self) -> Duration {
		Duration::from_secs(self.grace_secs)
	}
}

fn default_max_retries() -> u32 {
	3
}
fn default_backoff_ms() -> u64 {
	500
}
fn default_backoff_cap_ms() -> u64 {
	30_000
}
fn default_grace_secs() -> u64 {
	5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
	#[default]
	Always,
	Never,
	OnFailure,
}

impl RestartPolicy {
	/// Whether `start-all` (and daemon startup) launches this process.
	pub fn autostart(&self) -> bool {
		!matches!(self, RestartPolicy::Never)
	}

	pub fn restarts_on_failure(&self) -> bool {
		!matches!(self, RestartPolicy::Never)
	}

	pub fn restarts_on_clean_exit(&self) -> bool {
		matches!(self, RestartPolicy::Always)
	}
}

impl std::fmt::Display for RestartPolicy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RestartPolicy::Always => write!(f, "always"),
			RestartPolicy::Never => write!(f, "never"),
			RestartPolicy::OnFailure => write!(f, "on-failure"),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
	/// No live instance is known. Eligible for a fresh start if policy permits.
	Unknown,
	Starting,
	Running {
		pid: u32,
		uptime_secs: u64,
		/// Inherited from a previous supervisor run instead of launched here.
		adopted: bool,
	},
	Stopping {
		pid: u32,
	},
	/// `retrying: true` means a restart is pending after backoff;
	/// `retrying: false` means retries are exhausted and the process stays
	/// here until a manual restart.
	Crashed {
		exit_code: Option<i32>,
		failures: u32,
		retrying: bool,
	},
}

impl ProcessState {
	pub fn is_running(&self) -> bool {
		matches!(self, ProcessState::Running { .. })
	}

	pub fn is_active(&self) -> bool {
		matches!(
			self,
			ProcessState::Starting | ProcessState::Running { .. } | ProcessState::Stopping { .. }
		)
	}

	pub fn pid(&self) -> Option<u32> {
		match self {
			ProcessState::Running { pid, .. } | ProcessState::Stopping { pid } => Some(*pid),
			_ => None,
		}
	}

	pub fn label(&self) -> &'static str {
		match self {
			ProcessState::Unknown => "unknown",
			ProcessState::Starting => "starting",
			ProcessState::Running { .. } => "running",
			ProcessState::Stopping { .. } => "stopping",
			ProcessState::Crashed { .. } => "crashed",
		}
	}
}

/// One row of the `status` control command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessReport {
	pub name: String,
	pub state: ProcessState,
	pub pid: Option<u32>,
	pub policy: RestartPolicy,
	pub failures: u32,
	/// The most recent liveness probe could not be confirmed either way.
	pub probe_ambiguous: bool,
}
