mod client;
mod daemon;
mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use client::ClientError;
use soloist_core::protocol::{self, Request, Response};

/// Supervises a small, statically configured set of long-running processes,
/// guaranteeing at most one live instance of each.
#[derive(Parser)]
#[command(name = "soloist", version, about)]
struct Cli {
	/// Config file (default: $XDG_CONFIG_HOME/soloist/config.toml)
	#[arg(short, long, global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Launch every process whose policy permits autostart
	Start,
	/// Stop all managed processes
	Stop,
	/// Show the state of every managed process
	Status,
	/// Stop one process if live, reset its failure count, and launch it
	Restart { name: String },
	/// Show the last lines of a process's captured output
	Logs {
		name: String,
		#[arg(short = 'n', long, default_value_t = 100)]
		lines: usize,
	},
	/// Daemon lifecycle
	Daemon {
		#[command(subcommand)]
		command: DaemonCommands,
	},
}

#[derive(Subcommand)]
enum DaemonCommands {
	/// Run the daemon in the foreground
	Run,
	/// Stop the daemon; its managed processes are stopped too
	Stop,
	/// Show whether the daemon is running
	Status,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	if let Some(path) = &cli.config {
		std::env::set_var("SOLOIST_CONFIG", path);
	}

	match cli.command {
		Commands::Daemon { command } => match command {
			DaemonCommands::Run => daemon::run().await,
			DaemonCommands::Stop => cmd_daemon_stop(),
			DaemonCommands::Status => cmd_daemon_status(),
		},
		Commands::Start => cmd_send(Request::StartAll),
		Commands::Stop => cmd_send(Request::StopAll),
		Commands::Restart { name } => cmd_send(Request::Restart { name }),
		Commands::Status => cmd_status(),
		Commands::Logs { name, lines } => cmd_logs(&name, lines),
	}
}

fn cmd_send(request: Request) {
	match client::ensure_daemon().and_then(|mut c| c.send(&request)) {
		Ok(Response::Ok { message }) => {
			if let Some(message) = message {
				println!("{message}");
			}
		}
		Ok(Response::Error { message }) => {
			eprintln!("error: {message}");
			std::process::exit(1);
		}
		Ok(_) => {
			eprintln!("error: unexpected response");
			std::process::exit(1);
		}
		Err(e) => {
			eprintln!("error: {e}");
			std::process::exit(1);
		}
	}
}

fn cmd_status() {
	match client::ensure_daemon().and_then(|mut c| c.send(&Request::Status)) {
		Ok(Response::Status { processes }) => output::render_status(&processes),
		Ok(Response::Error { message }) => {
			eprintln!("error: {message}");
			std::process::exit(1);
		}
		Ok(_) => {
			eprintln!("error: unexpected response");
			std::process::exit(1);
		}
		Err(e) => {
			eprintln!("error: {e}");
			std::process::exit(1);
		}
	}
}

fn cmd_logs(name: &str, lines: usize) {
	let path = soloist_engine::output::log_path(&protocol::log_dir(), name);
	match soloist_engine::output::tail_file(&path, lines) {
		Ok(tail) => println!("{tail}"),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			eprintln!("no captured output for {name} ({})", path.display());
			std::process::exit(1);
		}
		Err(e) => {
			eprintln!("error: {e}");
			std::process::exit(1);
		}
	}
}

fn cmd_daemon_stop() {
	match client::Client::connect() {
		Ok(mut c) => match c.send(&Request::Shutdown) {
			Ok(_) => println!("daemon stopping"),
			Err(e) => {
				eprintln!("error: {e}");
				std::process::exit(1);
			}
		},
		Err(ClientError::NotRunning) => {
			// socket gone; fall back to the pid file
			if let Some(pid) = client::read_pid() {
				use nix::sys::signal::{kill, Signal};
				use nix::unistd::Pid;
				let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
				println!("daemon stopping (pid {pid})");
			} else {
				eprintln!("daemon not running");
			}
		}
		Err(e) => {
			eprintln!("error: {e}");
			std::process::exit(1);
		}
	}
}

fn cmd_daemon_status() {
	if client::is_running() {
		match client::read_pid() {
			Some(pid) => println!("daemon running (pid {pid})"),
			None => println!("daemon running"),
		}
	} else {
		println!("daemon not running");
	}
}
