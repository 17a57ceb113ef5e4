use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use exthost_protocol::{AppConfig, HostArgs};

#[derive(Parser, Debug)]
#[command(name = "exthost")]
#[command(about = "Supervise one extension host process per UI client")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = ArgAction::Count)]
	pub verbose: u8,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Run the supervisor and accept UI connections on a Unix socket
	Serve(ServeArgs),

	/// Run an extension host (started by `serve`, not by hand)
	#[command(hide = true)]
	Host(HostCliArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
	/// JSON config file; flags below override its values
	#[arg(long, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Socket UI connections arrive on [default: <socket-dir>/exthost.sock]
	#[arg(long, value_name = "PATH")]
	pub listen: Option<PathBuf>,

	/// Maximum number of live extension host processes
	#[arg(long, value_name = "N")]
	pub max_process_count: Option<usize>,

	/// Seconds a session survives without a UI connection
	#[arg(long, value_name = "SECS")]
	pub reconnect_grace: Option<u64>,

	/// Seconds a new host may take to report ready
	#[arg(long, value_name = "SECS")]
	pub ready_timeout: Option<u64>,

	/// Directory for per-client host sockets
	#[arg(long, value_name = "DIR")]
	pub socket_dir: Option<PathBuf>,

	/// Directory scanned for extensions (repeatable)
	#[arg(long = "extension-dir", value_name = "DIR")]
	pub extension_dirs: Vec<PathBuf>,

	/// Bootstrap file handed to every host
	#[arg(long, value_name = "FILE")]
	pub preload: Option<PathBuf>,

	/// Directory hosts write their log files into
	#[arg(long, value_name = "DIR")]
	pub log_dir: Option<PathBuf>,

	/// Start hosts with an inspector port
	#[arg(long)]
	pub debug: bool,
}

/// The host side of the launch contract, parsed from `--name=value` flags.
#[derive(Args, Debug)]
pub struct HostCliArgs {
	#[arg(long, value_name = "PATH")]
	pub sockpath: PathBuf,

	#[arg(long, value_name = "PATH")]
	pub preload: Option<PathBuf>,

	#[arg(long = "app-config", value_name = "JSON", value_parser = parse_app_config, default_value = "{}")]
	pub app_config: AppConfig,

	#[arg(long, value_name = "PORT")]
	pub inspect: Option<u16>,
}

impl From<HostCliArgs> for HostArgs {
	fn from(args: HostCliArgs) -> Self {
		HostArgs {
			sockpath: args.sockpath,
			preload: args.preload,
			app_config: args.app_config,
			inspect: args.inspect,
		}
	}
}

fn parse_app_config(raw: &str) -> Result<AppConfig, String> {
	serde_json::from_str(raw).map_err(|err| format!("invalid app config: {err}"))
}

#[cfg(test)]
mod tests {
	use exthost_protocol::LogLevel;

	use super::*;

	#[test]
	fn host_flags_round_trip_through_the_launch_contract() {
		let original = HostArgs {
			sockpath: PathBuf::from("/run/exthost/a.sock"),
			preload: Some(PathBuf::from("/opt/preload.json")),
			app_config: AppConfig {
				log_dir: Some(PathBuf::from("/var/log/exthost")),
				log_level: LogLevel::Debug,
				extension_dirs: vec![PathBuf::from("/ext")],
			},
			inspect: Some(9231),
		};

		let mut argv = vec!["exthost".to_string(), "host".to_string()];
		argv.extend(original.to_args().unwrap());
		let cli = Cli::try_parse_from(argv).unwrap();
		let Commands::Host(parsed) = cli.command else {
			panic!("expected the host subcommand");
		};
		assert_eq!(HostArgs::from(parsed), original);
	}

	#[test]
	fn app_config_defaults_when_absent() {
		let cli = Cli::try_parse_from(["exthost", "host", "--sockpath=/tmp/s.sock"]).unwrap();
		let Commands::Host(parsed) = cli.command else {
			panic!("expected the host subcommand");
		};
		assert_eq!(parsed.app_config, AppConfig::default());
		assert_eq!(parsed.inspect, None);
	}

	#[test]
	fn malformed_app_config_is_rejected() {
		let err = Cli::try_parse_from(["exthost", "host", "--sockpath=/s", "--app-config={nope"]).unwrap_err();
		assert!(err.to_string().contains("invalid app config"));
	}

	#[test]
	fn serve_accepts_repeated_extension_dirs() {
		let cli = Cli::try_parse_from([
			"exthost",
			"-vv",
			"serve",
			"--extension-dir",
			"/a",
			"--extension-dir",
			"/b",
			"--max-process-count",
			"2",
		])
		.unwrap();
		assert_eq!(cli.verbose, 2);
		let Commands::Serve(args) = cli.command else {
			panic!("expected the serve subcommand");
		};
		assert_eq!(args.extension_dirs, [PathBuf::from("/a"), PathBuf::from("/b")]);
		assert_eq!(args.max_process_count, Some(2));
	}
}
