use std::io;

/// A PID paired with the kernel start time from `/proc/<pid>/stat`.
///
/// PIDs are recycled; the start-tick pairing is what makes an identifier
/// trustworthy across supervisor restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdent {
	pub pid: u32,
	pub start_ticks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
	Alive,
	Dead,
	/// The process seems to exist but its identity could not be read.
	/// Callers treat this as dead and log a warning; duplicate detection at
	/// start time is the real safety net.
	Ambiguous,
}

/// Snapshot the identity of a live process. `Ok(None)` means no such process;
/// zombies also read as gone, since a zombie is not a live instance.
pub fn read_ident(pid: u32) -> io::Result<Option<ProcessIdent>> {
	let stat = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
		Ok(s) => s,
		Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(e),
	};
	match parse_stat(&stat) {
		Some(('Z', _)) => Ok(None),
		Some((_, start_ticks)) => Ok(Some(ProcessIdent { pid, start_ticks })),
		None => Err(io::Error::new(
			io::ErrorKind::InvalidData,
			format!("unparseable /proc/{pid}/stat"),
		)),
	}
}

// State (field 3) and starttime (field 22) of /proc/<pid>/stat. The comm
// field may contain spaces and parentheses, so count from the last ')'.
fn parse_stat(stat: &str) -> Option<(char, u64)> {
	let (_, rest) = stat.rsplit_once(')')?;
	let mut fields = rest.split_whitespace();
	let state = fields.next()?.chars().next()?;
	let start_ticks = fields.nth(18)?.parse().ok()?;
	Some((state, start_ticks))
}

/// NUL-separated argv, joined with spaces. `None` for kernel threads,
/// zombies, and processes that are already gone.
pub fn cmdline(pid: u32) -> Option<String> {
	let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
	if raw.is_empty() {
		return None;
	}
	let joined = raw
		.split(|&b| b == 0)
		.filter(|part| !part.is_empty())
		.map(|part| String::from_utf8_lossy(part).into_owned())
		.collect::<Vec<_>>()
		.join(" ");
	Some(joined)
}

/// Is `ident` still the process we think it is?
///
/// PID equality alone is not trusted: the start ticks must match, and when a
/// command line is readable it must contain the command we launched.
pub fn probe(ident: ProcessIdent, command: &str) -> Liveness {
	match read_ident(ident.pid) {
		Ok(None) => Liveness::Dead,
		Ok(Some(current)) => {
			if current.start_ticks != ident.start_ticks {
				// PID recycled by the kernel
				return Liveness::Dead;
			}
			match cmdline(ident.pid) {
				Some(cmd) if !cmd.contains(command) => Liveness::Dead,
				_ => Liveness::Alive,
			}
		}
		Err(_) => {
			// stat unreadable; signal 0 settles whether anything is there
			use nix::errno::Errno;
			use nix::sys::signal::kill;
			use nix::unistd::Pid;
			match kill(Pid::from_raw(ident.pid as i32), None) {
				Err(Errno::ESRCH) => Liveness::Dead,
				_ => Liveness::Ambiguous,
			}
		}
	}
}

/// Scan the process table for a live process whose command line contains
/// `command`. Used at reconciliation when no verified marker exists, so a
/// supervisor crash between launch and marker commit still ends in adoption
/// rather than a duplicate launch.
pub fn find_by_command(command: &str) -> Option<ProcessIdent> {
	let own = std::process::id();
	let entries = std::fs::read_dir("/proc").ok()?;
	for entry in entries.flatten() {
		let name = entry.file_name();
		let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
			continue;
		};
		if pid == own {
			continue;
		}
		let Some(cmd) = cmdline(pid) else {
			continue;
		};
		if !cmd.contains(command) {
			continue;
		}
		if let Ok(Some(ident)) = read_ident(pid) {
			return Some(ident);
		}
	}
	None
}
