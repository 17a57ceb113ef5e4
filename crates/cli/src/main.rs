mod cli;
mod host;
mod logging;
mod serve;

use std::process::ExitCode;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();

	let result = match cli.command {
		Commands::Serve(args) => {
			logging::init_logging(cli.verbose);
			serve::run(args).await
		}
		Commands::Host(args) => {
			if let Err(err) = logging::init_host_logging(&args.app_config) {
				eprintln!("warning: host log file unavailable: {err}");
			}
			host::run(args).await
		}
	};

	match result {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			eprintln!("error: {err:#}");
			ExitCode::FAILURE
		}
	}
}
