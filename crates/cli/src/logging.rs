use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use exthost_protocol::AppConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

/// Logging for `exthost serve`.
pub fn init_logging(verbosity: u8) {
	// 0 = warnings, and whatever hosts print to stderr
	// 1 (-v) = supervisor lifecycle
	// 2+ (-vv) = everything, including bridge traffic
	let filter = match verbosity {
		0 => "warn,exthost.process=info",
		1 => "info",
		_ => "debug",
	};

	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

	let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

	tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_writer(stderr)
		.with_target(true)
		.with_level(true)
		.compact()
		.init();
}

/// Logging for a spawned host.
///
/// Writes to stderr, which the supervisor captures, and additionally to
/// `<logDir>/exthost-<pid>.log` when a log directory is configured. If the
/// log file cannot be opened, stderr logging is still installed and the error
/// is returned.
pub fn init_host_logging(config: &AppConfig) -> std::io::Result<()> {
	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));

	let (writer, file_error) = match config.log_dir.as_deref().map(open_host_log).transpose() {
		Ok(Some(file)) => (BoxMakeWriter::new(std::io::stderr.and(Arc::new(file))), None),
		Ok(None) => (BoxMakeWriter::new(std::io::stderr), None),
		Err(err) => (BoxMakeWriter::new(std::io::stderr), Some(err)),
	};

	tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_writer(writer)
		.with_ansi(false)
		.with_target(true)
		.compact()
		.init();

	match file_error {
		Some(err) => Err(err),
		None => Ok(()),
	}
}

fn open_host_log(dir: &Path) -> std::io::Result<File> {
	std::fs::create_dir_all(dir)?;
	std::fs::OpenOptions::new()
		.create(true)
		.append(true)
		.open(dir.join(format!("exthost-{}.log", std::process::id())))
}
