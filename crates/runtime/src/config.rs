//! Supervisor configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use exthost_protocol::LogLevel;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_MAX_PROCESS_COUNT: usize = 5;
pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_FINISH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_INSPECT_BASE_PORT: u16 = 9229;

/// Program and leading arguments used to start an extension host.
///
/// The launch contract flags (`--sockpath=...` etc.) are appended after
/// `args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCommand {
	pub program: PathBuf,
	#[serde(default)]
	pub args: Vec<String>,
}

impl Default for HostCommand {
	fn default() -> Self {
		Self {
			program: PathBuf::from("exthost"),
			args: vec!["host".to_string()],
		}
	}
}

/// Configuration for [`ExtensionHostSupervisor`](crate::ExtensionHostSupervisor).
///
/// Every field has a default, so a partial JSON document is a valid config.
/// Durations are expressed in milliseconds on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorConfig {
	/// Ceiling on concurrently live extension host processes.
	pub max_process_count: usize,
	/// How long a session survives without a UI connection.
	#[serde(with = "millis", rename = "reconnectGraceMs")]
	pub reconnect_grace: Duration,
	/// How long a new process may take to send `ready`.
	#[serde(with = "millis", rename = "readyTimeoutMs")]
	pub ready_timeout: Duration,
	/// How long teardown waits for `finish` before killing the process.
	#[serde(with = "millis", rename = "finishTimeoutMs")]
	pub finish_timeout: Duration,
	/// Directory holding per-client sockets.
	pub socket_dir: PathBuf,
	pub host_command: HostCommand,
	pub preload: Option<PathBuf>,
	pub log_dir: Option<PathBuf>,
	pub log_level: LogLevel,
	pub extension_dirs: Vec<PathBuf>,
	/// Start hosts with `--inspect` on a free port.
	pub debug: bool,
	pub inspect_base_port: u16,
	pub inspect_probe_attempts: u16,
	#[serde(with = "millis", rename = "inspectProbeTimeoutMs")]
	pub inspect_probe_timeout: Duration,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			max_process_count: DEFAULT_MAX_PROCESS_COUNT,
			reconnect_grace: DEFAULT_RECONNECT_GRACE,
			ready_timeout: DEFAULT_READY_TIMEOUT,
			finish_timeout: DEFAULT_FINISH_TIMEOUT,
			socket_dir: default_socket_dir(),
			host_command: HostCommand::default(),
			preload: None,
			log_dir: None,
			log_level: LogLevel::default(),
			extension_dirs: Vec::new(),
			debug: false,
			inspect_base_port: DEFAULT_INSPECT_BASE_PORT,
			inspect_probe_attempts: 20,
			inspect_probe_timeout: Duration::from_secs(2),
		}
	}
}

impl SupervisorConfig {
	/// Loads a JSON config file; missing fields take their defaults.
	pub fn from_file(path: &Path) -> Result<Self> {
		let raw = std::fs::read_to_string(path)?;
		let config: Self = serde_json::from_str(&raw)?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		if self.max_process_count == 0 {
			return Err(Error::InvalidConfig(
				"maxProcessCount must be at least 1".to_string(),
			));
		}
		if self.inspect_probe_attempts == 0 && self.debug {
			return Err(Error::InvalidConfig(
				"inspectProbeAttempts must be at least 1 in debug mode".to_string(),
			));
		}
		Ok(())
	}

	pub fn with_max_process_count(mut self, count: usize) -> Self {
		self.max_process_count = count;
		self
	}

	pub fn with_reconnect_grace(mut self, grace: Duration) -> Self {
		self.reconnect_grace = grace;
		self
	}

	pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
		self.ready_timeout = timeout;
		self
	}

	pub fn with_finish_timeout(mut self, timeout: Duration) -> Self {
		self.finish_timeout = timeout;
		self
	}

	pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.socket_dir = dir.into();
		self
	}

	pub fn with_host_command(mut self, command: HostCommand) -> Self {
		self.host_command = command;
		self
	}

	pub fn with_debug(mut self, debug: bool) -> Self {
		self.debug = debug;
		self
	}
}

/// `$XDG_RUNTIME_DIR/exthost` when available, otherwise under the temp dir.
pub fn default_socket_dir() -> PathBuf {
	dirs::runtime_dir()
		.unwrap_or_else(std::env::temp_dir)
		.join("exthost")
}

mod millis {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(value.as_millis() as u64)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partial_json_takes_defaults() {
		let config: SupervisorConfig =
			serde_json::from_str(r#"{"maxProcessCount": 2, "reconnectGraceMs": 1500}"#).unwrap();
		assert_eq!(config.max_process_count, 2);
		assert_eq!(config.reconnect_grace, Duration::from_millis(1500));
		assert_eq!(config.ready_timeout, DEFAULT_READY_TIMEOUT);
		assert_eq!(config.host_command, HostCommand::default());
	}

	#[test]
	fn defaults_match_documented_values() {
		let config = SupervisorConfig::default();
		assert_eq!(config.max_process_count, 5);
		assert_eq!(config.reconnect_grace, Duration::from_secs(300));
		assert!(!config.debug);
		assert!(config.validate().is_ok());
	}

	#[test]
	fn zero_capacity_is_rejected() {
		let config = SupervisorConfig::default().with_max_process_count(0);
		assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
	}
}
