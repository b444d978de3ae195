use crate::types::ProcessReport;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
	StartAll,
	StopAll,
	Status,
	Restart { name: String },
	Ping,
	Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
	Ok { message: Option<String> },
	Status { processes: Vec<ProcessReport> },
	Error { message: String },
	Pong,
}

pub const SOCKET_NAME: &str = "daemon.sock";

pub fn socket_path() -> PathBuf {
	state_dir().join(SOCKET_NAME)
}

pub fn pid_path() -> PathBuf {
	state_dir().join("daemon.pid")
}

pub fn marker_dir() -> PathBuf {
	state_dir().join("markers")
}

pub fn log_dir() -> PathBuf {
	state_dir().join("logs")
}

pub fn state_dir() -> PathBuf {
	if let Ok(dir) = std::env::var("XDG_STATE_HOME") {
		PathBuf::from(dir).join("soloist")
	} else if let Some(home) = home_dir() {
		home.join(".local").join("state").join("soloist")
	} else {
		PathBuf::from("/tmp/soloist")
	}
}

pub fn config_dir() -> PathBuf {
	if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
		PathBuf::from(dir).join("soloist")
	} else if let Some(home) = home_dir() {
		home.join(".config").join("soloist")
	} else {
		PathBuf::from("/tmp/soloist/config")
	}
}

/// `SOLOIST_CONFIG` overrides the default location; the CLI's `--config`
/// flag is forwarded to the daemon through this variable.
pub fn config_path() -> PathBuf {
	if let Ok(path) = std::env::var("SOLOIST_CONFIG") {
		PathBuf::from(path)
	} else {
		config_dir().join("config.toml")
	}
}

fn home_dir() -> Option<PathBuf> {
	std::env::var("HOME").ok().map(PathBuf::from)
}
