use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use soloist_core::types::{ProcessSpec, ProcessState, RestartPolicy};
use soloist_engine::marker::{MarkerError, MarkerStore};
use soloist_engine::probe::{self, Liveness, ProcessIdent};
use soloist_engine::registry::Registry;
use soloist_engine::supervisor::{Supervisor, SupervisorConfig};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir(name: &str) -> PathBuf {
	let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
	let dir = std::env::temp_dir().join(format!("soloist-test-{n}-{name}"));
	let _ = std::fs::create_dir_all(&dir);
	dir
}

// Each test uses a distinct sleep duration so reconciliation's process-table
// scan can never match a child spawned by another test.
fn spec(name: &str, command: &str, policy: RestartPolicy, max_retries: u32) -> ProcessSpec {
	ProcessSpec {
		name: name.to_string(),
		command: command.to_string(),
		cwd: None,
		policy,
		max_retries,
		backoff_ms: 100,
		backoff_cap_ms: 1000,
		grace_secs: 2,
		env: HashMap::new(),
	}
}

fn build(base: &Path, specs: Vec<ProcessSpec>) -> Arc<Supervisor> {
	build_with_dirs(specs, base.join("markers"), base.join("logs"))
}

fn build_with_dirs(specs: Vec<ProcessSpec>, marker_dir: PathBuf, log_dir: PathBuf) -> Arc<Supervisor> {
	Supervisor::new(
		specs,
		SupervisorConfig {
			marker_dir,
			log_dir,
			tick: Duration::from_millis(200),
			max_log_size: 1024 * 1024,
		},
	)
	.unwrap()
}

async fn settle(ms: u64) {
	tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn kill_hard(pid: u32) {
	use nix::sys::signal::{kill, Signal};
	use nix::unistd::Pid;
	let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

// --- Registry ---

#[test]
fn registry_register_lookup_clear() {
	let mut registry = Registry::new();
	let ident = ProcessIdent {
		pid: 1,
		start_ticks: 2,
	};
	assert_eq!(registry.lookup("web"), None);
	registry.register("web", ident);
	assert_eq!(registry.lookup("web"), Some(ident));
	registry.clear("web");
	assert_eq!(registry.lookup("web"), None);
	// unknown name is a no-op
	registry.clear("web");
}

// --- Probe ---

#[test]
fn probe_self_is_alive() {
	let pid = std::process::id();
	let ident = probe::read_ident(pid).unwrap().unwrap();
	assert_eq!(probe::probe(ident, ""), Liveness::Alive);
}

#[test]
fn probe_rejects_recycled_start_ticks() {
	let pid = std::process::id();
	let ident = probe::read_ident(pid).unwrap().unwrap();
	let recycled = ProcessIdent {
		pid,
		start_ticks: ident.start_ticks.wrapping_add(999),
	};
	assert_eq!(probe::probe(recycled, ""), Liveness::Dead);
}

#[test]
fn probe_rejects_command_mismatch() {
	let pid = std::process::id();
	let ident = probe::read_ident(pid).unwrap().unwrap();
	assert_eq!(
		probe::probe(ident, "surely-not-our-command-a8f3"),
		Liveness::Dead
	);
}

#[test]
fn probe_missing_process_is_dead() {
	assert!(probe::read_ident(4_999_999).unwrap().is_none());
	let ident = ProcessIdent {
		pid: 4_999_999,
		start_ticks: 1,
	};
	assert_eq!(probe::probe(ident, ""), Liveness::Dead);
}

// --- Marker store ---

#[test]
fn marker_acquire_commit_release() {
	let dir = temp_dir("marker-lifecycle");
	let store = MarkerStore::new(&dir).unwrap();

	let token = store.acquire("web", |_| true).unwrap();
	let placeholder = store.read_stale("web").unwrap().unwrap();
	assert!(placeholder.is_placeholder());

	let ident = ProcessIdent {
		pid: 42,
		start_ticks: 7,
	};
	store.commit(&token, ident, "run-web").unwrap();
	let marker = store.read_stale("web").unwrap().unwrap();
	assert_eq!(marker.ident(), ident);
	assert_eq!(marker.command, "run-web");

	store.release(token).unwrap();
	assert!(store.read_stale("web").unwrap().is_none());
	let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn marker_blocked_by_live_verified_holder() {
	let dir = temp_dir("marker-locked");
	let store = MarkerStore::new(&dir).unwrap();

	let token = store.acquire("web", |_| true).unwrap();
	let ident = ProcessIdent {
		pid: 42,
		start_ticks: 7,
	};
	store.commit(&token, ident, "run-web").unwrap();

	match store.acquire("web", |_| true) {
		Err(MarkerError::AlreadyLocked { pid }) => assert_eq!(pid, 42),
		other => panic!("expected AlreadyLocked, got {other:?}"),
	}
	let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn marker_sweeps_dead_holder() {
	let dir = temp_dir("marker-sweep");
	let store = MarkerStore::new(&dir).unwrap();

	let token = store.acquire("web", |_| true).unwrap();
	let ident = ProcessIdent {
		pid: 42,
		start_ticks: 7,
	};
	store.commit(&token, ident, "run-web").unwrap();

	// holder verified dead: the stale marker is swept and re-acquired
	let token2 = store.acquire("web", |_| false).unwrap();
	assert!(store.read_stale("web").unwrap().unwrap().is_placeholder());
	store.release(token2).unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn marker_placeholder_is_never_verified() {
	let dir = temp_dir("marker-placeholder");
	let store = MarkerStore::new(&dir).unwrap();

	// claimed but never committed: an abandoned acquire
	let _token = store.acquire("web", |_| true).unwrap();
	// even an always-true verifier cannot bless a placeholder
	let token2 = store.acquire("web", |_| true).unwrap();
	store.release(token2).unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn marker_corrupt_file_reads_as_stale() {
	let dir = temp_dir("marker-corrupt");
	let store = MarkerStore::new(&dir).unwrap();
	std::fs::write(dir.join("web.json"), "not json at all").unwrap();

	assert!(store.read_stale("web").unwrap().is_none());
	let token = store.acquire("web", |_| true).unwrap();
	store.release(token).unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn marker_sweep_missing_is_noop() {
	let dir = temp_dir("marker-noop");
	let store = MarkerStore::new(&dir).unwrap();
	store.sweep("ghost").unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Supervisor: lifecycle ---

#[tokio::test]
async fn start_and_stop() {
	let base = temp_dir("start-stop");
	let sup = build(&base, vec![spec("sleeper", "sleep 57", RestartPolicy::Always, 3)]);

	let msg = sup.start_all().await;
	assert!(msg.contains("sleeper"), "got: {msg}");
	settle(400).await;

	let status = sup.status().await;
	assert_eq!(status.len(), 1);
	assert!(status[0].state.is_running(), "got: {:?}", status[0].state);
	let pid = status[0].pid.unwrap();

	// marker committed with the live identity
	let store = MarkerStore::new(&base.join("markers")).unwrap();
	let marker = store.read_stale("sleeper").unwrap().unwrap();
	assert_eq!(marker.pid, pid);
	assert!(!marker.is_placeholder());

	sup.stop_all().await;
	let status = sup.status().await;
	assert_eq!(status[0].state, ProcessState::Unknown);
	assert!(store.read_stale("sleeper").unwrap().is_none());
	assert!(probe::read_ident(pid).unwrap().is_none());
	let _ = std::fs::remove_dir_all(&base);
}

#[tokio::test]
async fn start_all_is_idempotent() {
	let base = temp_dir("idempotent");
	let sup = build(&base, vec![spec("svc", "sleep 56", RestartPolicy::Always, 3)]);

	sup.start_all().await;
	settle(400).await;
	let pid = sup.status().await[0].pid.unwrap();

	let msg = sup.start_all().await;
	assert_eq!(msg, "nothing to start");
	settle(200).await;

	let status = sup.status().await;
	assert!(status[0].state.is_running());
	assert_eq!(status[0].pid, Some(pid), "no new launch expected");

	sup.stop_all().await;
	let _ = std::fs::remove_dir_all(&base);
}

#[tokio::test]
async fn never_policy_waits_for_manual_start() {
	let base = temp_dir("never");
	let sup = build(&base, vec![spec("manual", "sleep 55", RestartPolicy::Never, 3)]);

	let msg = sup.start_all().await;
	assert_eq!(msg, "nothing to start");
	assert_eq!(sup.status().await[0].state, ProcessState::Unknown);

	sup.restart("manual").await.unwrap();
	settle(400).await;
	assert!(sup.status().await[0].state.is_running());

	sup.stop_all().await;
	let _ = std::fs::remove_dir_all(&base);
}

#[tokio::test]
async fn restart_unknown_name_is_an_error() {
	let base = temp_dir("unknown-name");
	let sup = build(&base, vec![]);
	assert!(sup.restart("ghost").await.is_err());
	let _ = std::fs::remove_dir_all(&base);
}

#[tokio::test]
async fn clean_exit_is_not_a_failure() {
	let base = temp_dir("clean-exit");
	let sup = build(&base, vec![spec("oneshot", "true", RestartPolicy::OnFailure, 3)]);

	sup.start_all().await;
	settle(600).await;

	let status = sup.status().await;
	assert_eq!(status[0].state, ProcessState::Unknown);
	assert_eq!(status[0].failures, 0);

	let store = MarkerStore::new(&base.join("markers")).unwrap();
	assert!(store.read_stale("oneshot").unwrap().is_none());
	let _ = std::fs::remove_dir_all(&base);
}

// --- Supervisor: crash accounting ---

#[tokio::test]
async fn on_failure_crash_restart_accounting() {
	let base = temp_dir("crash-accounting");
	// max_retries 2: one retry happens, the second failure is terminal
	let sup = build(&base, vec![spec("flaky", "exit 3", RestartPolicy::OnFailure, 2)]);

	sup.start_all().await;
	settle(1500).await;

	let status = sup.status().await;
	assert_eq!(
		status[0].state,
		ProcessState::Crashed {
			exit_code: Some(3),
			failures: 2,
			retrying: false,
		}
	);

	// a terminal crash is not restarted by start-all
	assert_eq!(sup.start_all().await, "nothing to start");

	// a manual restart resets the count and tries again
	sup.restart("flaky").await.unwrap();
	settle(1500).await;
	let status = sup.status().await;
	assert_eq!(
		status[0].state,
		ProcessState::Crashed {
			exit_code: Some(3),
			failures: 2,
			retrying: false,
		}
	);
	let _ = std::fs::remove_dir_all(&base);
}

#[tokio::test]
async fn scenario_three_policies() {
	let base = temp_dir("scenario");
	let sup = build(
		&base,
		vec![
			spec("a", "sleep 54", RestartPolicy::Always, 3),
			spec("b", "sleep 53", RestartPolicy::Never, 3),
			spec("c", "sleep 52", RestartPolicy::OnFailure, 2),
		],
	);

	sup.start_all().await;
	settle(500).await;

	let status = sup.status().await;
	assert!(status[0].state.is_running(), "a: {:?}", status[0].state);
	assert_eq!(status[1].state, ProcessState::Unknown);
	assert!(status[2].state.is_running(), "c: {:?}", status[2].state);

	// first kill: counted exactly once, restarted after backoff
	let pid_c = status[2].pid.unwrap();
	kill_hard(pid_c);
	settle(1000).await;
	let status = sup.status().await;
	assert!(status[2].state.is_running(), "c: {:?}", status[2].state);
	assert_eq!(status[2].failures, 1);
	let new_pid = status[2].pid.unwrap();
	assert_ne!(new_pid, pid_c);

	// second kill exhausts retries at count 2
	kill_hard(new_pid);
	settle(1000).await;
	let status = sup.status().await;
	assert_eq!(
		status[2].state,
		ProcessState::Crashed {
			exit_code: None,
			failures: 2,
			retrying: false,
		}
	);
	// a is unaffected
	assert!(status[0].state.is_running());

	sup.stop_all().await;
	for report in sup.status().await {
		assert_eq!(report.state, ProcessState::Unknown);
	}
	let _ = std::fs::remove_dir_all(&base);
}

// --- Uniqueness across supervisors ---

#[tokio::test]
async fn second_supervisor_does_not_duplicate() {
	let base = temp_dir("unique");
	let markers = base.join("markers");
	let sup1 = build_with_dirs(
		vec![spec("solo", "sleep 51", RestartPolicy::Always, 3)],
		markers.clone(),
		base.join("logs1"),
	);
	let sup2 = build_with_dirs(
		vec![spec("solo", "sleep 51", RestartPolicy::Always, 3)],
		markers.clone(),
		base.join("logs2"),
	);

	sup1.start_all().await;
	settle(400).await;
	let pid = sup1.status().await[0].pid.unwrap();

	sup2.start_all().await;
	settle(400).await;
	// the second supervisor sees the live verified holder and skips
	assert_eq!(sup2.status().await[0].state, ProcessState::Unknown);
	assert_eq!(sup1.status().await[0].pid, Some(pid));

	sup1.stop_all().await;
	settle(100).await;

	// with the marker released, the second supervisor may start fresh
	sup2.start_all().await;
	settle(400).await;
	assert!(sup2.status().await[0].state.is_running());

	sup2.stop_all().await;
	let _ = std::fs::remove_dir_all(&base);
}

// --- Reconciliation ---

#[tokio::test]
async fn reconcile_adopts_surviving_instance() {
	let base = temp_dir("adopt");

	// a process left over from a previous supervisor run, marker intact
	let mut orphan = std::process::Command::new("sh")
		.args(["-c", "sleep 50"])
		.spawn()
		.unwrap();
	let pid = orphan.id();
	settle(100).await;
	let ident = probe::read_ident(pid).unwrap().unwrap();

	let store = MarkerStore::new(&base.join("markers")).unwrap();
	let token = store.acquire("svc", |_| false).unwrap();
	store.commit(&token, ident, "sleep 50").unwrap();

	let sup = build(&base, vec![spec("svc", "sleep 50", RestartPolicy::Always, 3)]);
	sup.reconcile().await;
	settle(200).await;

	let status = sup.status().await;
	match &status[0].state {
		ProcessState::Running { pid: p, adopted, .. } => {
			assert_eq!(*p, pid, "same instance, no relaunch");
			assert!(*adopted);
		}
		other => panic!("expected adopted running, got {other:?}"),
	}
	assert_eq!(sup.registered_ident("svc"), Some(ident));
	assert_eq!(sup.start_all().await, "nothing to start");

	sup.stop_all().await;
	let _ = orphan.wait();
	assert!(store.read_stale("svc").unwrap().is_none());
	assert_eq!(probe::probe(ident, "sleep 50"), Liveness::Dead);
	let _ = std::fs::remove_dir_all(&base);
}

#[tokio::test]
async fn adopted_instance_death_triggers_relaunch() {
	let base = temp_dir("adopt-death");

	let mut orphan = std::process::Command::new("sh")
		.args(["-c", "sleep 49"])
		.spawn()
		.unwrap();
	let pid = orphan.id();
	settle(100).await;
	let ident = probe::read_ident(pid).unwrap().unwrap();

	let store = MarkerStore::new(&base.join("markers")).unwrap();
	let token = store.acquire("svc", |_| false).unwrap();
	store.commit(&token, ident, "sleep 49").unwrap();

	let sup = build(&base, vec![spec("svc", "sleep 49", RestartPolicy::Always, 3)]);
	sup.reconcile().await;
	settle(200).await;
	assert!(sup.status().await[0].state.is_running());

	orphan.kill().unwrap();
	let _ = orphan.wait();
	settle(1200).await;

	let status = sup.status().await;
	match &status[0].state {
		ProcessState::Running { pid: p, adopted, .. } => {
			assert_ne!(*p, pid, "a fresh instance should have been launched");
			assert!(!adopted);
		}
		other => panic!("expected relaunched running, got {other:?}"),
	}
	assert_eq!(status[0].failures, 1);

	sup.stop_all().await;
	let _ = std::fs::remove_dir_all(&base);
}

#[tokio::test]
async fn reconcile_sweeps_dead_marker() {
	let base = temp_dir("sweep-dead");

	let store = MarkerStore::new(&base.join("markers")).unwrap();
	let token = store.acquire("svc", |_| false).unwrap();
	let dead = ProcessIdent {
		pid: 4_999_998,
		start_ticks: 5,
	};
	store.commit(&token, dead, "sleep 48").unwrap();

	let sup = build(&base, vec![spec("svc", "sleep 48", RestartPolicy::OnFailure, 3)]);
	sup.reconcile().await;

	assert!(store.read_stale("svc").unwrap().is_none());
	assert_eq!(sup.status().await[0].state, ProcessState::Unknown);
	let _ = std::fs::remove_dir_all(&base);
}

// --- Shutdown ---

#[tokio::test]
async fn shutdown_stops_everything_and_releases_markers() {
	let base = temp_dir("shutdown");
	let sup = build(
		&base,
		vec![
			spec("one", "sleep 47", RestartPolicy::Always, 3),
			spec("two", "sleep 46", RestartPolicy::OnFailure, 3),
		],
	);

	sup.start_all().await;
	settle(400).await;
	assert!(sup.status().await.iter().all(|r| r.state.is_running()));

	sup.shutdown().await;

	let store = MarkerStore::new(&base.join("markers")).unwrap();
	for report in sup.status().await {
		assert_eq!(report.state, ProcessState::Unknown);
		assert!(store.read_stale(&report.name).unwrap().is_none());
	}
	let _ = std::fs::remove_dir_all(&base);
}

// --- Output capture ---

#[tokio::test]
async fn output_captured_to_log_file() {
	let base = temp_dir("logs");
	let sup = build(
		&base,
		vec![spec("echoer", "echo hello-soloist-log", RestartPolicy::OnFailure, 3)],
	);

	sup.start_all().await;
	settle(600).await;

	let content = std::fs::read_to_string(base.join("logs").join("echoer.log")).unwrap();
	assert!(content.contains("hello-soloist-log"), "got: {content}");
	let _ = std::fs::remove_dir_all(&base);
}

// --- Events ---

#[tokio::test]
async fn events_report_transitions() {
	let base = temp_dir("events");
	let sup = build(&base, vec![spec("ev", "sleep 45", RestartPolicy::Always, 3)]);

	let mut events = sup.events().subscribe();
	sup.start_all().await;

	let mut saw_starting = false;
	let mut saw_running = false;
	for _ in 0..10 {
		match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
			Ok(Ok(event)) => {
				assert_eq!(event.process, "ev");
				match event.state {
					ProcessState::Starting => saw_starting = true,
					ProcessState::Running { .. } => {
						saw_running = true;
						break;
					}
					_ => {}
				}
			}
			_ => break,
		}
	}
	assert!(saw_starting, "no Starting event seen");
	assert!(saw_running, "no Running event seen");

	sup.stop_all().await;
	let _ = std::fs::remove_dir_all(&base);
}
