use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use exthost_runtime::{ExtensionHostSupervisor, HostCommand, SupervisorConfig};
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

use crate::cli::ServeArgs;

pub async fn run(args: ServeArgs) -> Result<()> {
	let config = build_config(&args)?;
	let listen = args
		.listen
		.clone()
		.unwrap_or_else(|| config.socket_dir.join("exthost.sock"));

	let supervisor = ExtensionHostSupervisor::new(config).context("Invalid supervisor configuration")?;
	let listener = bind_listener(&listen)?;
	info!(
		target = "exthost.supervisor",
		socket = %listen.display(),
		max_processes = supervisor.config().max_process_count,
		"listening for ui connections"
	);

	let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
	let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

	loop {
		tokio::select! {
			_ = sigterm.recv() => {
				info!(target = "exthost.supervisor", "received SIGTERM, shutting down");
				break;
			}
			_ = sigint.recv() => {
				info!(target = "exthost.supervisor", "received SIGINT, shutting down");
				break;
			}
			accept = listener.accept() => {
				let (stream, _) = accept.context("Accept on ui socket failed")?;
				let supervisor = supervisor.clone();
				tokio::spawn(async move {
					if let Err(err) = supervisor.serve_main_connection(stream).await {
						if err.is_process_not_found() {
							debug!(target = "exthost.supervisor", error = %err, "ui connection refused");
						} else {
							warn!(target = "exthost.supervisor", error = %err, "ui connection failed");
						}
					}
				});
			}
		}
	}

	supervisor.dispose_all().await;
	if let Err(err) = std::fs::remove_file(&listen) {
		debug!(target = "exthost.supervisor", error = %err, "failed to remove ui socket");
	}
	Ok(())
}

/// Config file values first, then command line overrides.
fn build_config(args: &ServeArgs) -> Result<SupervisorConfig> {
	let mut config = match &args.config {
		Some(path) => SupervisorConfig::from_file(path)
			.with_context(|| format!("Failed to load config: {}", path.display()))?,
		None => SupervisorConfig::default(),
	};

	if let Some(count) = args.max_process_count {
		config.max_process_count = count;
	}
	if let Some(secs) = args.reconnect_grace {
		config.reconnect_grace = Duration::from_secs(secs);
	}
	if let Some(secs) = args.ready_timeout {
		config.ready_timeout = Duration::from_secs(secs);
	}
	if let Some(dir) = &args.socket_dir {
		config.socket_dir = dir.clone();
	}
	if !args.extension_dirs.is_empty() {
		config.extension_dirs = args.extension_dirs.clone();
	}
	if let Some(preload) = &args.preload {
		config.preload = Some(preload.clone());
	}
	if let Some(dir) = &args.log_dir {
		config.log_dir = Some(dir.clone());
	}
	if args.debug {
		config.debug = true;
	}

	// Without an explicit host command, hosts are this binary's `host`
	// subcommand.
	if config.host_command == HostCommand::default() {
		let program = std::env::current_exe().context("Failed to locate the exthost binary")?;
		config.host_command = HostCommand {
			program,
			args: vec!["host".to_string()],
		};
	}

	config.validate().context("Invalid supervisor configuration")?;
	Ok(config)
}

fn bind_listener(path: &Path) -> Result<UnixListener> {
	if path.exists() {
		std::fs::remove_file(path)
			.with_context(|| format!("Failed to remove existing socket: {}", path.display()))?;
	}
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)
			.with_context(|| format!("Failed to create socket directory: {}", parent.display()))?;
	}
	UnixListener::bind(path).with_context(|| format!("Failed to bind ui socket: {}", path.display()))
}
