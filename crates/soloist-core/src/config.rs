use crate::types::{ProcessSpec, RestartPolicy};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration-validation failures are the only fatal startup errors:
/// the supervision core assumes it receives a validated, immutable list.
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse {path}: {source}")]
	Parse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},
	#[error("duplicate process name: {0}")]
	DuplicateName(String),
	#[error("process entry {0} has an empty name")]
	EmptyName(usize),
	#[error("process {0}: empty command")]
	EmptyCommand(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
	#[serde(default)]
	pub daemon: DaemonConfig,
	#[serde(default)]
	pub defaults: DefaultsConfig,
	#[serde(default, rename = "process")]
	pub processes: Vec<ProcessEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
	/// Probe cadence for adopted processes, in seconds.
	#[serde(default = "default_tick_secs")]
	pub tick_secs: u64,
	#[serde(default = "default_log_max_size")]
	pub log_max_size_bytes: u64,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self {
			tick_secs: default_tick_secs(),
			log_max_size_bytes: default_log_max_size(),
		}
	}
}

fn default_tick_secs() -> u64 {
	2
}
fn default_log_max_size() -> u64 {
	10 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
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

impl Default for DefaultsConfig {
	fn default() -> Self {
		Self {
			max_retries: default_max_retries(),
			backoff_ms: default_backoff_ms(),
			backoff_cap_ms: default_backoff_cap_ms(),
			grace_secs: default_grace_secs(),
			env: HashMap::new(),
		}
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

/// One `[[process]]` table. Per-process fields override `[defaults]`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessEntry {
	pub name: String,
	pub command: String,
	#[serde(default)]
	pub cwd: Option<PathBuf>,
	#[serde(default)]
	pub policy: RestartPolicy,
	pub max_retries: Option<u32>,
	pub backoff_ms: Option<u64>,
	pub backoff_cap_ms: Option<u64>,
	pub grace_secs: Option<u64>,
	#[serde(default)]
	pub env: HashMap<String, String>,
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
	if !path.exists() {
		return Ok(Config::default());
	}
	let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
		path: path.to_path_buf(),
		source,
	})?;
	toml::from_str(&content).map_err(|source| ConfigError::Parse {
		path: path.to_path_buf(),
		source,
	})
}

/// Merge defaults into each entry and validate the result. Rejects duplicate
/// and empty names and empty commands before the supervision core ever sees
/// the list.
pub fn resolve(config: &Config) -> Result<Vec<ProcessSpec>, ConfigError> {
	let mut seen = HashSet::new();
	let mut specs = Vec::with_capacity(config.processes.len());

	for (idx, entry) in config.processes.iter().enumerate() {
		let name = entry.name.trim();
		if name.is_empty() {
			return Err(ConfigError::EmptyName(idx));
		}
		if entry.command.trim().is_empty() {
			return Err(ConfigError::EmptyCommand(name.to_string()));
		}
		if !seen.insert(name.to_string()) {
			return Err(ConfigError::DuplicateName(name.to_string()));
		}

		let mut env = config.defaults.env.clone();
		env.extend(entry.env.clone());

		specs.push(ProcessSpec {
			name: name.to_string(),
			command: entry.command.trim().to_string(),
			cwd: entry.cwd.clone(),
			policy: entry.policy,
			max_retries: entry.max_retries.unwrap_or(config.defaults.max_retries),
			backoff_ms: entry.backoff_ms.unwrap_or(config.defaults.backoff_ms),
			backoff_cap_ms: entry
				.backoff_cap_ms
				.unwrap_or(config.defaults.backoff_cap_ms),
			grace_secs: entry.grace_secs.unwrap_or(config.defaults.grace_secs),
			env,
		});
	}

	Ok(specs)
}
