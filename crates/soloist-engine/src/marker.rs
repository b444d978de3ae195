use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::probe::ProcessIdent;

#[derive(Debug, Error)]
pub enum MarkerError {
	#[error("another live instance holds the marker (pid {pid})")]
	AlreadyLocked { pid: u32 },
	#[error("marker store: {0}")]
	Io(#[from] io::Error),
}

/// Persisted assertion that a specific process is the sole supervised
/// instance for its name. One JSON file per process name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Marker {
	pub pid: u32,
	pub start_ticks: u64,
	pub command: String,
}

impl Marker {
	pub fn ident(&self) -> ProcessIdent {
		ProcessIdent {
			pid: self.pid,
			start_ticks: self.start_ticks,
		}
	}

	/// A marker created by `acquire` but not yet committed: the supervisor
	/// claimed the name but the launch had not happened when it was written.
	pub fn is_placeholder(&self) -> bool {
		self.pid == 0
	}
}

/// Proof that this supervisor holds the marker for a process name.
#[derive(Debug)]
pub struct MarkerToken {
	name: String,
	path: PathBuf,
}

impl MarkerToken {
	pub fn name(&self) -> &str {
		&self.name
	}
}

pub struct MarkerStore {
	dir: PathBuf,
}

impl MarkerStore {
	pub fn new(dir: &Path) -> io::Result<Self> {
		fs::create_dir_all(dir)?;
		Ok(Self {
			dir: dir.to_path_buf(),
		})
	}

	fn marker_path(&self, name: &str) -> PathBuf {
		self.dir.join(format!("{name}.json"))
	}

	/// Claim the name with create-if-absent semantics, so two supervisors
	/// racing to start the same process cannot both succeed.
	///
	/// An existing marker is checked through `verify`: a live verified holder
	/// yields `AlreadyLocked`; a dead one is swept and acquisition retried.
	pub fn acquire(
		&self,
		name: &str,
		verify: impl Fn(&Marker) -> bool,
	) -> Result<MarkerToken, MarkerError> {
		let path = self.marker_path(name);
		for _ in 0..2 {
			match OpenOptions::new().write(true).create_new(true).open(&path) {
				Ok(mut file) => {
					let placeholder = Marker {
						pid: 0,
						start_ticks: 0,
						command: String::new(),
					};
					let data = serde_json::to_vec(&placeholder).map_err(io::Error::other)?;
					file.write_all(&data)?;
					return Ok(MarkerToken {
						name: name.to_string(),
						path,
					});
				}
				Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
					match self.read(name)? {
						Some(marker) if !marker.is_placeholder() && verify(&marker) => {
							return Err(MarkerError::AlreadyLocked { pid: marker.pid });
						}
						_ => {
							// stale, corrupt, or abandoned placeholder
							match fs::remove_file(&path) {
								Ok(()) => {}
								Err(e) if e.kind() == io::ErrorKind::NotFound => {}
								Err(e) => return Err(e.into()),
							}
						}
					}
				}
				Err(e) => return Err(e.into()),
			}
		}
		// lost the create race twice; whoever won owns the name now
		let pid = self.read(name).ok().flatten().map(|m| m.pid).unwrap_or(0);
		Err(MarkerError::AlreadyLocked { pid })
	}

	/// Record the launched process's identity under a held token.
	/// Written to a temp file and renamed so readers never see a torn write.
	pub fn commit(
		&self,
		token: &MarkerToken,
		ident: ProcessIdent,
		command: &str,
	) -> io::Result<()> {
		let marker = Marker {
			pid: ident.pid,
			start_ticks: ident.start_ticks,
			command: command.to_string(),
		};
		let tmp = self.dir.join(format!(".{}.tmp", token.name));
		let data = serde_json::to_vec(&marker).map_err(io::Error::other)?;
		fs::write(&tmp, data)?;
		fs::rename(&tmp, &token.path)
	}

	pub fn release(&self, token: MarkerToken) -> io::Result<()> {
		match fs::remove_file(&token.path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e),
		}
	}

	/// Token for a marker whose holder this supervisor has already verified
	/// (the adoption path). Does not create or check anything on disk.
	pub fn resume(&self, name: &str) -> MarkerToken {
		MarkerToken {
			name: name.to_string(),
			path: self.marker_path(name),
		}
	}

	/// Last persisted marker for `name`, if any. Corrupt markers read as
	/// `None` and are treated like stale ones.
	pub fn read_stale(&self, name: &str) -> io::Result<Option<Marker>> {
		self.read(name)
	}

	/// Remove a marker known to be stale, without holding a token.
	pub fn sweep(&self, name: &str) -> io::Result<()> {
		match fs::remove_file(self.marker_path(name)) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e),
		}
	}

	fn read(&self, name: &str) -> io::Result<Option<Marker>> {
		match fs::read_to_string(self.marker_path(name)) {
			Ok(content) => Ok(serde_json::from_str(&content).ok()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e),
		}
	}
}
