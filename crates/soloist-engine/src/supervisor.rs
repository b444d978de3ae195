use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use soloist_core::types::{ProcessReport, ProcessSpec, ProcessState};

use crate::events::EventBus;
use crate::marker::{MarkerError, MarkerStore, MarkerToken};
use crate::output::{self, OutputCapture};
use crate::probe::{self, Liveness, ProcessIdent};
use crate::registry::Registry;

pub struct SupervisorConfig {
	pub marker_dir: PathBuf,
	pub log_dir: PathBuf,
	/// Probe cadence for adopted processes.
	pub tick: Duration,
	pub max_log_size: u64,
}

/// The uniqueness-enforcing supervision loop.
///
/// One record per configured process; one driver task per live process,
/// serializing every lifecycle action for that name. Acquire-marker always
/// precedes launch; marker release always precedes the transition back to
/// `Unknown`.
pub struct Supervisor {
	records: Arc<RwLock<HashMap<String, ProcessRecord>>>,
	registry: Mutex<Registry>,
	markers: MarkerStore,
	events: EventBus,
	specs: Vec<ProcessSpec>,
	config: SupervisorConfig,
}

struct ProcessRecord {
	spec: ProcessSpec,
	state: ProcessState,
	started_at: Option<Instant>,
	failures: u32,
	probe_ambiguous: bool,
	/// Reconciliation could not rule out a live instance (marker store I/O
	/// failure). Excluded from autostart until manually restarted.
	unmanaged: bool,
	cancel: Option<watch::Sender<bool>>,
	driver: Option<JoinHandle<()>>,
}

impl ProcessRecord {
	fn new(spec: ProcessSpec) -> Self {
		Self {
			spec,
			state: ProcessState::Unknown,
			started_at: None,
			failures: 0,
			probe_ambiguous: false,
			unmanaged: false,
			cancel: None,
			driver: None,
		}
	}

	fn is_active(&self) -> bool {
		self.state.is_active() || self.driver.as_ref().is_some_and(|d| !d.is_finished())
	}
}

enum Outcome {
	/// Stop was requested; the watcher already cleaned up.
	Cancelled,
	/// The driver should exit; state has been set by the watcher.
	Finished,
	CleanExit,
	Crashed { exit_code: Option<i32> },
}

impl Supervisor {
	pub fn new(specs: Vec<ProcessSpec>, config: SupervisorConfig) -> std::io::Result<Arc<Self>> {
		let markers = MarkerStore::new(&config.marker_dir)?;
		std::fs::create_dir_all(&config.log_dir)?;
		let records = specs
			.iter()
			.map(|spec| (spec.name.clone(), ProcessRecord::new(spec.clone())))
			.collect();
		Ok(Arc::new(Self {
			records: Arc::new(RwLock::new(records)),
			registry: Mutex::new(Registry::new()),
			markers,
			events: EventBus::new(),
			specs,
			config,
		}))
	}

	pub fn events(&self) -> &EventBus {
		&self.events
	}

	pub fn log_path(&self, name: &str) -> PathBuf {
		output::log_path(&self.config.log_dir, name)
	}

	/// Last-observed identity for a process, if one is registered.
	pub fn registered_ident(&self, name: &str) -> Option<ProcessIdent> {
		self.registry().lookup(name)
	}

	fn registry(&self) -> MutexGuard<'_, Registry> {
		self.registry.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Rebuild in-memory state from persisted markers and live probes after
	/// a supervisor restart. Verified holders are adopted without a new
	/// launch; dead markers are swept; a marker store I/O failure leaves that
	/// process unmanaged and the rest unaffected.
	pub async fn reconcile(self: &Arc<Self>) {
		for spec in self.specs.clone() {
			match self.markers.read_stale(&spec.name) {
				Err(e) => {
					tracing::error!(
						process = %spec.name,
						"marker store unreadable, process left unmanaged: {e}"
					);
					let mut records = self.records.write().await;
					if let Some(rec) = records.get_mut(&spec.name) {
						rec.unmanaged = true;
						rec.probe_ambiguous = true;
					}
					self.events.emit(
						&spec.name,
						ProcessState::Unknown,
						Some(format!("marker unreadable: {e}")),
					);
				}
				Ok(found) => {
					let verified = found
						.as_ref()
						.filter(|m| !m.is_placeholder())
						.map(|m| (m.ident(), probe::probe(m.ident(), &m.command)));
					match verified {
						Some((ident, Liveness::Alive)) => {
							let token = self.markers.resume(&spec.name);
							self.adopt(&spec, ident, token).await;
						}
						other => {
							if let Some((ident, Liveness::Ambiguous)) = other {
								tracing::warn!(
									process = %spec.name,
									pid = ident.pid,
									"liveness probe ambiguous during reconcile, treating as dead"
								);
							}
							if found.is_some() {
								if let Err(e) = self.markers.sweep(&spec.name) {
									tracing::warn!(process = %spec.name, "failed to sweep stale marker: {e}");
								}
							}
							// The previous supervisor may have died between
							// launch and marker commit; scan before relaunching.
							if let Some(ident) = probe::find_by_command(&spec.command) {
								match self.markers.acquire(&spec.name, |_| false) {
									Ok(token) => self.adopt(&spec, ident, token).await,
									Err(e) => {
										tracing::warn!(process = %spec.name, "could not re-mark surviving instance: {e}");
									}
								}
							}
						}
					}
				}
			}
		}
	}

	async fn adopt(self: &Arc<Self>, spec: &ProcessSpec, ident: ProcessIdent, token: MarkerToken) {
		if let Err(e) = self.markers.commit(&token, ident, &spec.command) {
			tracing::warn!(process = %spec.name, "marker refresh failed: {e}");
		}
		self.registry().register(&spec.name, ident);

		let (cancel_tx, cancel_rx) = watch::channel(false);
		let state = ProcessState::Running {
			pid: ident.pid,
			uptime_secs: 0,
			adopted: true,
		};
		{
			let mut records = self.records.write().await;
			let Some(rec) = records.get_mut(&spec.name) else {
				return;
			};
			rec.state = state.clone();
			rec.started_at = Some(Instant::now());
			rec.probe_ambiguous = false;
			rec.cancel = Some(cancel_tx);
			rec.driver = Some(tokio::spawn(run_driver(
				Arc::clone(self),
				spec.clone(),
				cancel_rx,
				Some((ident, token)),
			)));
		}
		self.events.emit(
			&spec.name,
			state,
			Some(format!("adopted existing instance (pid {})", ident.pid)),
		);
		tracing::info!(process = %spec.name, pid = ident.pid, "adopted existing instance");
	}

	/// Launch every process whose policy permits autostart and which is not
	/// already live. Idempotent: processes that are running are left alone.
	pub async fn start_all(self: &Arc<Self>) -> String {
		let mut launched = Vec::new();
		let mut records = self.records.write().await;
		for spec in &self.specs {
			let Some(rec) = records.get_mut(&spec.name) else {
				continue;
			};
			if !spec.policy.autostart() || rec.unmanaged || rec.is_active() {
				continue;
			}
			// a terminal crash needs an explicit restart
			if matches!(rec.state, ProcessState::Crashed { retrying: false, .. }) {
				continue;
			}
			spawn_driver(self, rec, spec.clone(), None);
			launched.push(spec.name.clone());
		}
		if launched.is_empty() {
			"nothing to start".to_string()
		} else {
			format!("starting: {}", launched.join(", "))
		}
	}

	/// Drive every live process through `Stopping` and wait for the drivers
	/// to finish. No marker stays held for a process we did not terminate.
	pub async fn stop_all(self: &Arc<Self>) -> String {
		let mut handles = Vec::new();
		{
			let mut records = self.records.write().await;
			for rec in records.values_mut() {
				if let Some(cancel) = rec.cancel.take() {
					let _ = cancel.send(true);
				}
				if let Some(driver) = rec.driver.take() {
					handles.push(driver);
				}
			}
		}
		let stopped = handles.len();
		for handle in handles {
			let _ = handle.await;
		}
		// terminally crashed records have no driver to unwind; reset them too
		{
			let mut records = self.records.write().await;
			for rec in records.values_mut() {
				if rec.state != ProcessState::Unknown {
					rec.state = ProcessState::Unknown;
					self.events.emit(&rec.spec.name, ProcessState::Unknown, None);
				}
			}
		}
		format!("stopped {stopped} process(es)")
	}

	/// Manual restart: stops the current instance if there is one, resets the
	/// failure count, and launches regardless of policy.
	pub async fn restart(self: &Arc<Self>, name: &str) -> Result<String, String> {
		let spec = self
			.specs
			.iter()
			.find(|s| s.name == name)
			.cloned()
			.ok_or_else(|| format!("unknown process: {name}"))?;

		let (cancel, driver) = {
			let mut records = self.records.write().await;
			let Some(rec) = records.get_mut(name) else {
				return Err(format!("unknown process: {name}"));
			};
			(rec.cancel.take(), rec.driver.take())
		};
		if let Some(cancel) = cancel {
			let _ = cancel.send(true);
		}
		if let Some(driver) = driver {
			let _ = driver.await;
		}

		let mut records = self.records.write().await;
		if let Some(rec) = records.get_mut(name) {
			rec.failures = 0;
			rec.unmanaged = false;
			rec.probe_ambiguous = false;
			spawn_driver(self, rec, spec, None);
		}
		Ok(format!("{name}: restarting"))
	}

	pub async fn status(&self) -> Vec<ProcessReport> {
		let records = self.records.read().await;
		self.specs
			.iter()
			.filter_map(|spec| records.get(&spec.name))
			.map(|rec| {
				let state = match &rec.state {
					ProcessState::Running { pid, adopted, .. } => ProcessState::Running {
						pid: *pid,
						uptime_secs: rec
							.started_at
							.map(|t| t.elapsed().as_secs())
							.unwrap_or(0),
						adopted: *adopted,
					},
					other => other.clone(),
				};
				ProcessReport {
					name: rec.spec.name.clone(),
					pid: state.pid(),
					state,
					policy: rec.spec.policy,
					failures: rec.failures,
					probe_ambiguous: rec.probe_ambiguous,
				}
			})
			.collect()
	}

	/// Global shutdown: every running/starting process is driven through
	/// `Stopping` before the supervisor exits.
	pub async fn shutdown(self: &Arc<Self>) {
		let _ = self.stop_all().await;
	}

	async fn set_state(&self, name: &str, state: ProcessState, detail: Option<String>) {
		let mut records = self.records.write().await;
		if let Some(rec) = records.get_mut(name) {
			if rec.state != state || detail.is_some() {
				rec.state = state.clone();
				self.events.emit(name, state, detail);
			}
		}
	}

	async fn mark_running(&self, name: &str, pid: u32, adopted: bool) {
		let state = ProcessState::Running {
			pid,
			uptime_secs: 0,
			adopted,
		};
		let mut records = self.records.write().await;
		if let Some(rec) = records.get_mut(name) {
			rec.started_at = Some(Instant::now());
			rec.probe_ambiguous = false;
			rec.state = state.clone();
			self.events.emit(name, state, None);
		}
	}

	async fn bump_failures(&self, name: &str) -> u32 {
		let mut records = self.records.write().await;
		match records.get_mut(name) {
			Some(rec) => {
				rec.failures = rec.failures.saturating_add(1);
				rec.failures
			}
			None => 0,
		}
	}

	async fn set_ambiguous(&self, name: &str, flag: bool) {
		let mut records = self.records.write().await;
		if let Some(rec) = records.get_mut(name) {
			rec.probe_ambiguous = flag;
		}
	}

	/// Marker release precedes the transition back to `Unknown`.
	fn relinquish(&self, name: &str, token: MarkerToken) {
		if let Err(e) = self.markers.release(token) {
			tracing::warn!(process = %name, "marker release failed: {e}");
		}
		self.registry().clear(name);
	}
}

fn spawn_driver(
	sup: &Arc<Supervisor>,
	rec: &mut ProcessRecord,
	spec: ProcessSpec,
	adopted: Option<(ProcessIdent, MarkerToken)>,
) {
	let (cancel_tx, cancel_rx) = watch::channel(false);
	rec.cancel = Some(cancel_tx);
	rec.driver = Some(tokio::spawn(run_driver(
		Arc::clone(sup),
		spec,
		cancel_rx,
		adopted,
	)));
}

async fn run_driver(
	sup: Arc<Supervisor>,
	spec: ProcessSpec,
	mut cancel: watch::Receiver<bool>,
	mut adopted: Option<(ProcessIdent, MarkerToken)>,
) {
	loop {
		if *cancel.borrow() {
			sup.set_state(&spec.name, ProcessState::Unknown, None).await;
			return;
		}

		let outcome = match adopted.take() {
			Some((ident, token)) => watch_adopted(&sup, &spec, ident, token, &mut cancel).await,
			None => launch_and_watch(&sup, &spec, &mut cancel).await,
		};

		match outcome {
			Outcome::Cancelled | Outcome::Finished => return,
			Outcome::CleanExit => {
				if spec.policy.restarts_on_clean_exit() {
					sup.set_state(
						&spec.name,
						ProcessState::Unknown,
						Some("exited cleanly, relaunching".to_string()),
					)
					.await;
					if sleep_or_cancel(spec.backoff_delay(1), &mut cancel).await {
						sup.set_state(&spec.name, ProcessState::Unknown, None).await;
						return;
					}
					continue;
				}
				sup.set_state(
					&spec.name,
					ProcessState::Unknown,
					Some("exited cleanly".to_string()),
				)
				.await;
				return;
			}
			Outcome::Crashed { exit_code } => {
				let failures = sup.bump_failures(&spec.name).await;
				let retrying =
					spec.policy.restarts_on_failure() && failures < spec.max_retries;
				sup.set_state(
					&spec.name,
					ProcessState::Crashed {
						exit_code,
						failures,
						retrying,
					},
					exit_code.map(|c| format!("exit {c}")),
				)
				.await;

				if !retrying {
					if spec.policy.restarts_on_failure() {
						tracing::warn!(
							process = %spec.name,
							failures,
							"retries exhausted, giving up until manual restart"
						);
					}
					return;
				}

				let delay = spec.backoff_delay(failures);
				tracing::info!(
					process = %spec.name,
					failures,
					delay_ms = delay.as_millis() as u64,
					"restarting after backoff"
				);
				if sleep_or_cancel(delay, &mut cancel).await {
					sup.set_state(&spec.name, ProcessState::Unknown, None).await;
					return;
				}
				sup.set_state(&spec.name, ProcessState::Unknown, None).await;
			}
		}
	}
}

async fn launch_and_watch(
	sup: &Arc<Supervisor>,
	spec: &ProcessSpec,
	cancel: &mut watch::Receiver<bool>,
) -> Outcome {
	sup.set_state(&spec.name, ProcessState::Starting, None).await;

	// acquire before launch: a verified live holder means some instance
	// (possibly under another supervisor) already owns this name
	let token = match sup.markers.acquire(&spec.name, |marker| {
		probe::probe(marker.ident(), &marker.command) == Liveness::Alive
	}) {
		Ok(token) => token,
		Err(MarkerError::AlreadyLocked { pid }) => {
			tracing::warn!(process = %spec.name, pid, "already running elsewhere, skipping");
			sup.set_state(
				&spec.name,
				ProcessState::Unknown,
				Some(format!("already running elsewhere (pid {pid}), skipped")),
			)
			.await;
			return Outcome::Finished;
		}
		Err(MarkerError::Io(e)) => {
			tracing::error!(process = %spec.name, "marker store unusable: {e}");
			sup.set_state(
				&spec.name,
				ProcessState::Unknown,
				Some(format!("marker store unusable: {e}")),
			)
			.await;
			return Outcome::Finished;
		}
	};

	let capture = OutputCapture::new(&sup.config.log_dir, &spec.name, sup.config.max_log_size);
	let mut child = match spawn_child(spec) {
		Ok(child) => child,
		Err(e) => {
			tracing::warn!(process = %spec.name, "launch failed: {e}");
			sup.events.emit(
				&spec.name,
				ProcessState::Starting,
				Some(format!("launch failed: {e}")),
			);
			sup.relinquish(&spec.name, token);
			return Outcome::Crashed { exit_code: None };
		}
	};

	let pid = child.id().unwrap_or(0);
	// identity snapshot and marker commit immediately after launch
	let ident = probe::read_ident(pid)
		.ok()
		.flatten()
		.unwrap_or(ProcessIdent {
			pid,
			start_ticks: 0,
		});
	if let Err(e) = sup.markers.commit(&token, ident, &spec.command) {
		tracing::warn!(process = %spec.name, "marker commit failed: {e}");
	}
	sup.registry().register(&spec.name, ident);
	sup.mark_running(&spec.name, pid, false).await;

	if let Some(stdout) = child.stdout.take() {
		tokio::spawn(output::pipe(stdout, capture.clone()));
	}
	if let Some(stderr) = child.stderr.take() {
		tokio::spawn(output::pipe(stderr, capture.clone()));
	}

	let exit = tokio::select! {
		status = child.wait() => status,
		_ = cancel.changed() => {
			stop_child(sup, spec, &mut child, pid).await;
			sup.relinquish(&spec.name, token);
			sup.set_state(&spec.name, ProcessState::Unknown, None).await;
			return Outcome::Cancelled;
		}
	};

	sup.relinquish(&spec.name, token);

	match exit {
		Ok(status) if status.success() => Outcome::CleanExit,
		Ok(status) => Outcome::Crashed {
			exit_code: status.code(),
		},
		Err(e) => {
			tracing::warn!(process = %spec.name, "wait failed: {e}");
			Outcome::Crashed { exit_code: None }
		}
	}
}

/// Drive an instance inherited from a previous supervisor run. There is no
/// child handle to wait on, so liveness rides on the probe tick.
async fn watch_adopted(
	sup: &Arc<Supervisor>,
	spec: &ProcessSpec,
	ident: ProcessIdent,
	token: MarkerToken,
	cancel: &mut watch::Receiver<bool>,
) -> Outcome {
	let mut tick = tokio::time::interval(sup.config.tick);
	tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			_ = cancel.changed() => {
				stop_adopted(sup, spec, ident).await;
				sup.relinquish(&spec.name, token);
				sup.set_state(&spec.name, ProcessState::Unknown, None).await;
				return Outcome::Cancelled;
			}
			_ = tick.tick() => {
				match probe::probe(ident, &spec.command) {
					Liveness::Alive => {
						sup.set_ambiguous(&spec.name, false).await;
					}
					Liveness::Ambiguous => {
						tracing::warn!(
							process = %spec.name,
							pid = ident.pid,
							"liveness probe ambiguous, treating as dead"
						);
						sup.set_ambiguous(&spec.name, true).await;
						sup.relinquish(&spec.name, token);
						return Outcome::Crashed { exit_code: None };
					}
					Liveness::Dead => {
						sup.relinquish(&spec.name, token);
						return Outcome::Crashed { exit_code: None };
					}
				}
			}
		}
	}
}

async fn stop_child(sup: &Arc<Supervisor>, spec: &ProcessSpec, child: &mut Child, pid: u32) {
	sup.set_state(&spec.name, ProcessState::Stopping { pid }, None).await;
	signal_group(pid, nix::sys::signal::Signal::SIGTERM);
	match tokio::time::timeout(spec.grace(), child.wait()).await {
		Ok(_) => {}
		Err(_) => {
			tracing::warn!(
				process = %spec.name,
				grace_secs = spec.grace_secs,
				"graceful stop timed out, killing"
			);
			signal_group(pid, nix::sys::signal::Signal::SIGKILL);
			let _ = child.wait().await;
		}
	}
}

async fn stop_adopted(sup: &Arc<Supervisor>, spec: &ProcessSpec, ident: ProcessIdent) {
	sup.set_state(&spec.name, ProcessState::Stopping { pid: ident.pid }, None)
		.await;
	signal_pid(ident.pid, nix::sys::signal::Signal::SIGTERM);
	let deadline = Instant::now() + spec.grace();
	while Instant::now() < deadline {
		tokio::time::sleep(Duration::from_millis(100)).await;
		if probe::probe(ident, &spec.command) == Liveness::Dead {
			return;
		}
	}
	tracing::warn!(
		process = %spec.name,
		grace_secs = spec.grace_secs,
		"graceful stop timed out, killing"
	);
	signal_pid(ident.pid, nix::sys::signal::Signal::SIGKILL);
}

fn spawn_child(spec: &ProcessSpec) -> std::io::Result<Child> {
	let mut cmd = Command::new("sh");
	cmd.args(["-c", &spec.command])
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		// own process group so the whole tree can be signalled
		.process_group(0);
	if let Some(dir) = &spec.cwd {
		cmd.current_dir(dir);
	}
	for (key, val) in &spec.env {
		cmd.env(key, val);
	}
	cmd.spawn()
}

fn signal_group(pid: u32, sig: nix::sys::signal::Signal) {
	use nix::sys::signal::killpg;
	use nix::unistd::Pid;
	let _ = killpg(Pid::from_raw(pid as i32), sig);
}

fn signal_pid(pid: u32, sig: nix::sys::signal::Signal) {
	use nix::sys::signal::kill;
	use nix::unistd::Pid;
	let _ = kill(Pid::from_raw(pid as i32), sig);
}

/// True if cancel fired before the delay elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
	tokio::select! {
		_ = tokio::time::sleep(delay) => false,
		_ = cancel.changed() => true,
	}
}
