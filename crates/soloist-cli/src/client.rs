use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;

use soloist_core::protocol::{self, Request, Response};

#[derive(Debug)]
pub enum ClientError {
	/// Daemon is not running (socket not connectable).
	NotRunning,
	Io(io::Error),
	Protocol(String),
}

impl std::fmt::Display for ClientError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ClientError::NotRunning => write!(f, "daemon not running"),
			ClientError::Io(e) => write!(f, "io error: {e}"),
			ClientError::Protocol(e) => write!(f, "protocol error: {e}"),
		}
	}
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
	fn from(e: io::Error) -> Self {
		ClientError::Io(e)
	}
}

/// Synchronous JSON-lines client for the daemon's unix socket.
pub struct Client {
	stream: UnixStream,
}

impl Client {
	pub fn connect() -> Result<Self, ClientError> {
		let stream =
			UnixStream::connect(protocol::socket_path()).map_err(|_| ClientError::NotRunning)?;
		Ok(Self { stream })
	}

	pub fn send(&mut self, request: &Request) -> Result<Response, ClientError> {
		let mut data =
			serde_json::to_vec(request).map_err(|e| ClientError::Protocol(e.to_string()))?;
		data.push(b'\n');
		self.stream.write_all(&data)?;

		let mut reader = BufReader::new(&self.stream);
		let mut line = String::new();
		reader.read_line(&mut line)?;
		serde_json::from_str(&line).map_err(|e| ClientError::Protocol(e.to_string()))
	}
}

pub fn is_running() -> bool {
	UnixStream::connect(protocol::socket_path()).is_ok()
}

pub fn read_pid() -> Option<u32> {
	std::fs::read_to_string(protocol::pid_path())
		.ok()
		.and_then(|s| s.trim().parse().ok())
}

/// Connect to the daemon, starting it in the background first if needed.
pub fn ensure_daemon() -> Result<Client, ClientError> {
	if let Ok(client) = Client::connect() {
		return Ok(client);
	}

	let binary = std::env::current_exe()?;
	std::process::Command::new(binary)
		.args(["daemon", "run"])
		.stdin(std::process::Stdio::null())
		.stdout(std::process::Stdio::null())
		.stderr(std::process::Stdio::null())
		.spawn()?;

	for _ in 0..50 {
		std::thread::sleep(std::time::Duration::from_millis(100));
		if let Ok(client) = Client::connect() {
			return Ok(client);
		}
	}

	Err(ClientError::NotRunning)
}
