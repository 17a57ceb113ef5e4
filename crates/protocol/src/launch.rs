//! Launch contract for the extension host process.
//!
//! The supervisor passes everything the host needs on the command line:
//!
//! ```text
//! --sockpath=<path>      Unix socket the host connects to for RPC frames
//! --preload=<path>       bootstrap module loaded before extensions
//! --app-config=<json>    serialized AppConfig
//! --inspect=<port>       optional debugger port
//! ```
//!
//! The control channel is an inherited socket whose descriptor number is
//! published in [`CONTROL_FD_ENV`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Descriptor number the control socket is installed at in the child.
pub const CONTROL_FD: i32 = 3;

/// Environment variable carrying the control descriptor number.
pub const CONTROL_FD_ENV: &str = "EXTHOST_CONTROL_FD";

/// Log verbosity forwarded to the host process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
	Error,
	Warn,
	#[default]
	Info,
	Debug,
	Trace,
}

impl LogLevel {
	/// Directive understood by `tracing_subscriber::EnvFilter`.
	pub fn as_filter(self) -> &'static str {
		match self {
			Self::Error => "error",
			Self::Warn => "warn",
			Self::Info => "info",
			Self::Debug => "debug",
			Self::Trace => "trace",
		}
	}
}

/// Configuration blob passed through `--app-config`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
	/// Directory the host writes its log file into.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub log_dir: Option<PathBuf>,
	#[serde(default)]
	pub log_level: LogLevel,
	/// Directories scanned for extension manifests.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub extension_dirs: Vec<PathBuf>,
}

/// Parsed or to-be-rendered host process arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostArgs {
	pub sockpath: PathBuf,
	pub preload: Option<PathBuf>,
	pub app_config: AppConfig,
	pub inspect: Option<u16>,
}

impl HostArgs {
	/// Renders the flags in `--name=value` form.
	pub fn to_args(&self) -> serde_json::Result<Vec<String>> {
		let mut args = vec![format!("--sockpath={}", self.sockpath.display())];
		if let Some(preload) = &self.preload {
			args.push(format!("--preload={}", preload.display()));
		}
		args.push(format!(
			"--app-config={}",
			serde_json::to_string(&self.app_config)?
		));
		if let Some(port) = self.inspect {
			args.push(format!("--inspect={port}"));
		}
		Ok(args)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn renders_argv_contract() {
		let args = HostArgs {
			sockpath: PathBuf::from("/tmp/exthost-a.sock"),
			preload: Some(PathBuf::from("/opt/exthost/preload.js")),
			app_config: AppConfig {
				log_dir: Some(PathBuf::from("/var/log/exthost")),
				log_level: LogLevel::Debug,
				extension_dirs: vec![],
			},
			inspect: Some(9230),
		};

		let rendered = args.to_args().unwrap();
		assert_eq!(rendered[0], "--sockpath=/tmp/exthost-a.sock");
		assert_eq!(rendered[1], "--preload=/opt/exthost/preload.js");
		assert_eq!(
			rendered[2],
			r#"--app-config={"logDir":"/var/log/exthost","logLevel":"debug"}"#
		);
		assert_eq!(rendered[3], "--inspect=9230");
	}

	#[test]
	fn inspect_flag_is_optional() {
		let args = HostArgs {
			sockpath: PathBuf::from("/tmp/s.sock"),
			preload: None,
			app_config: AppConfig::default(),
			inspect: None,
		};
		let rendered = args.to_args().unwrap();
		assert_eq!(rendered.len(), 2);
		assert!(rendered.iter().all(|a| !a.starts_with("--inspect")));
	}

	#[test]
	fn app_config_defaults_missing_fields() {
		let config: AppConfig = serde_json::from_str("{}").unwrap();
		assert_eq!(config.log_level, LogLevel::Info);
		assert!(config.log_dir.is_none());
		assert!(config.extension_dirs.is_empty());
	}
}
