use owo_colors::OwoColorize;
use soloist_core::types::{ProcessReport, ProcessState, RestartPolicy};

pub fn render_status(processes: &[ProcessReport]) {
	if processes.is_empty() {
		println!("no processes configured");
		return;
	}

	let name_width = processes
		.iter()
		.map(|p| p.name.len())
		.max()
		.unwrap_or(4)
		.max(4);

	for proc in processes {
		let (dot, label, extra) = match &proc.state {
			ProcessState::Running { pid, uptime_secs, adopted } => (
				"●".green().to_string(),
				"running".green().to_string(),
				{
					let mut extra = format!("pid {}  up {}", pid, format_uptime(*uptime_secs));
					if *adopted {
						extra.push_str("  (adopted)");
					}
					extra
				},
			),
			ProcessState::Starting => (
				"◐".yellow().to_string(),
				"starting".yellow().to_string(),
				String::new(),
			),
			ProcessState::Stopping { pid } => (
				"◐".yellow().to_string(),
				"stopping".yellow().to_string(),
				format!("pid {pid}"),
			),
			ProcessState::Crashed { exit_code, failures, retrying: true } => (
				"●".yellow().to_string(),
				"crashed".yellow().to_string(),
				format!("{}  retry {}", format_exit(*exit_code), failures),
			),
			ProcessState::Crashed { exit_code, failures, retrying: false } => (
				"●".red().to_string(),
				"failed".red().to_string(),
				format!("{}  after {} failure(s)", format_exit(*exit_code), failures),
			),
			ProcessState::Unknown if proc.policy == RestartPolicy::Never => (
				"○".dimmed().to_string(),
				"manual".dimmed().to_string(),
				String::new(),
			),
			ProcessState::Unknown => (
				"○".dimmed().to_string(),
				"stopped".dimmed().to_string(),
				String::new(),
			),
		};

		let ambiguous = if proc.probe_ambiguous {
			format!("  {}", "(probe unconfirmed)".yellow())
		} else {
			String::new()
		};

		println!(
			"  {} {:<name_width$}  {:<10} {}{}",
			dot, proc.name, label, extra, ambiguous
		);
	}
}

fn format_exit(code: Option<i32>) -> String {
	match code {
		Some(code) => format!("exit {code}"),
		None => "killed".to_string(),
	}
}

fn format_uptime(secs: u64) -> String {
	if secs >= 86_400 {
		format!("{}d {}h", secs / 86_400, (secs % 86_400) / 3600)
	} else if secs >= 3600 {
		format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
	} else if secs >= 60 {
		format!("{}m {}s", secs / 60, secs % 60)
	} else {
		format!("{secs}s")
	}
}
