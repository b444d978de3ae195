use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

/// Append-only capture of one process's stdout/stderr into
/// `<log_dir>/<name>.log`, with a single size-capped rotation to `.1`.
#[derive(Clone)]
pub struct OutputCapture {
	writer: Arc<Mutex<LogWriter>>,
}

struct LogWriter {
	file: Option<File>,
	path: PathBuf,
	bytes_written: u64,
	max_size: u64,
}

impl OutputCapture {
	pub fn new(log_dir: &Path, process: &str, max_size: u64) -> Self {
		let _ = fs::create_dir_all(log_dir);
		let path = log_dir.join(format!("{process}.log"));

		let file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&path)
			.ok();
		let bytes_written = file
			.as_ref()
			.and_then(|f| f.metadata().ok())
			.map(|m| m.len())
			.unwrap_or(0);

		Self {
			writer: Arc::new(Mutex::new(LogWriter {
				file,
				path,
				bytes_written,
				max_size,
			})),
		}
	}

	pub async fn write(&self, data: &[u8]) {
		self.writer.lock().await.write(data);
	}
}

impl LogWriter {
	fn write(&mut self, data: &[u8]) {
		if let Some(ref mut file) = self.file {
			let _ = file.write_all(data);
			self.bytes_written += data.len() as u64;
			if self.bytes_written >= self.max_size {
				self.rotate();
			}
		}
	}

	fn rotate(&mut self) {
		self.file.take();
		let rotated = self.path.with_extension("log.1");
		let _ = fs::rename(&self.path, &rotated);
		self.file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.path)
			.ok();
		self.bytes_written = 0;
	}
}

pub async fn pipe<R: tokio::io::AsyncRead + Unpin>(mut reader: R, output: OutputCapture) {
	let mut buf = [0u8; 4096];
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => output.write(&buf[..n]).await,
			Err(_) => break,
		}
	}
}

pub fn log_path(log_dir: &Path, process: &str) -> PathBuf {
	log_dir.join(format!("{process}.log"))
}

/// Last `lines` lines of a log file, for the CLI `logs` command.
pub fn tail_file(path: &Path, lines: usize) -> std::io::Result<String> {
	let content = fs::read_to_string(path)?;
	let all: Vec<&str> = content.lines().collect();
	let start = all.len().saturating_sub(lines);
	Ok(all[start..].join("\n"))
}
