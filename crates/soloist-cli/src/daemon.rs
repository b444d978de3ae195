use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::watch;

use soloist_core::config;
use soloist_core::protocol::{self, Request, Response};
use soloist_engine::supervisor::{Supervisor, SupervisorConfig};

pub async fn run() {
	tracing_subscriber::fmt().init();

	// only one supervisor daemon per state dir
	if crate::client::is_running() {
		tracing::error!("daemon already running");
		std::process::exit(1);
	}

	let config_path = protocol::config_path();
	let cfg = match config::load_config(&config_path) {
		Ok(cfg) => cfg,
		Err(e) => {
			tracing::error!("{e}");
			std::process::exit(1);
		}
	};
	let specs = match config::resolve(&cfg) {
		Ok(specs) => specs,
		Err(e) => {
			tracing::error!("invalid configuration: {e}");
			std::process::exit(1);
		}
	};
	if specs.is_empty() {
		tracing::warn!("no processes configured in {}", config_path.display());
	}

	let state_dir = protocol::state_dir();
	let _ = std::fs::create_dir_all(&state_dir);
	let _ = std::fs::write(protocol::pid_path(), std::process::id().to_string());

	let socket_path = protocol::socket_path();
	if socket_path.exists() {
		let _ = std::fs::remove_file(&socket_path);
	}

	let supervisor = match Supervisor::new(
		specs,
		SupervisorConfig {
			marker_dir: protocol::marker_dir(),
			log_dir: protocol::log_dir(),
			tick: Duration::from_secs(cfg.daemon.tick_secs),
			max_log_size: cfg.daemon.log_max_size_bytes,
		},
	) {
		Ok(sup) => sup,
		Err(e) => {
			tracing::error!("failed to initialize state dir: {e}");
			std::process::exit(1);
		}
	};

	// status event stream → log output
	{
		let mut events = supervisor.events().subscribe();
		tokio::spawn(async move {
			loop {
				match events.recv().await {
					Ok(event) => {
						let state = event.state.label();
						match event.detail {
							Some(detail) => {
								tracing::info!(process = %event.process, state, "{detail}")
							}
							None => tracing::info!(process = %event.process, "now {state}"),
						}
					}
					Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
					Err(_) => break,
				}
			}
		});
	}

	supervisor.reconcile().await;
	let started = supervisor.start_all().await;
	tracing::info!("{started}");

	let listener = match UnixListener::bind(&socket_path) {
		Ok(listener) => listener,
		Err(e) => {
			tracing::error!("failed to bind socket {}: {e}", socket_path.display());
			std::process::exit(1);
		}
	};
	tracing::info!(
		"daemon started (pid {}), listening on {}",
		std::process::id(),
		socket_path.display()
	);

	let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

	let accept_sup = Arc::clone(&supervisor);
	let accept = tokio::spawn(async move {
		accept_loop(listener, accept_sup, shutdown_tx).await;
	});

	let mut sigterm =
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(sigterm) => sigterm,
			Err(e) => {
				tracing::error!("failed to install SIGTERM handler: {e}");
				std::process::exit(1);
			}
		};

	tokio::select! {
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("interrupted, shutting down");
		}
		_ = sigterm.recv() => {
			tracing::info!("terminated, shutting down");
		}
		_ = shutdown_rx.changed() => {
			tracing::info!("shutdown requested");
		}
	}

	accept.abort();
	supervisor.shutdown().await;
	let _ = std::fs::remove_file(protocol::socket_path());
	let _ = std::fs::remove_file(protocol::pid_path());
}

async fn accept_loop(
	listener: UnixListener,
	supervisor: Arc<Supervisor>,
	shutdown: watch::Sender<bool>,
) {
	loop {
		let (stream, _) = match listener.accept().await {
			Ok(conn) => conn,
			Err(e) => {
				tracing::error!("accept error: {e}");
				continue;
			}
		};

		let sup = Arc::clone(&supervisor);
		let shutdown = shutdown.clone();
		tokio::spawn(async move {
			let (reader, mut writer) = stream.into_split();
			let mut lines = BufReader::new(reader).lines();

			while let Ok(Some(line)) = lines.next_line().await {
				let request: Request = match serde_json::from_str(&line) {
					Ok(request) => request,
					Err(e) => {
						let resp = Response::Error {
							message: format!("invalid request: {e}"),
						};
						if write_response(&mut writer, &resp).await.is_err() {
							break;
						}
						continue;
					}
				};

				let response = handle_request(&sup, request, &shutdown).await;
				if write_response(&mut writer, &response).await.is_err() {
					break;
				}
			}
		});
	}
}

async fn handle_request(
	supervisor: &Arc<Supervisor>,
	request: Request,
	shutdown: &watch::Sender<bool>,
) -> Response {
	match request {
		Request::Ping => Response::Pong,
		Request::Status => Response::Status {
			processes: supervisor.status().await,
		},
		Request::StartAll => Response::Ok {
			message: Some(supervisor.start_all().await),
		},
		Request::StopAll => Response::Ok {
			message: Some(supervisor.stop_all().await),
		},
		Request::Restart { name } => match supervisor.restart(&name).await {
			Ok(message) => Response::Ok {
				message: Some(message),
			},
			Err(message) => Response::Error { message },
		},
		Request::Shutdown => {
			let _ = shutdown.send(true);
			Response::Ok {
				message: Some("shutting down".to_string()),
			}
		}
	}
}

async fn write_response(
	writer: &mut tokio::net::unix::OwnedWriteHalf,
	response: &Response,
) -> Result<(), std::io::Error> {
	let mut data = serde_json::to_vec(response).map_err(std::io::Error::other)?;
	data.push(b'\n');
	writer.write_all(&data).await
}
