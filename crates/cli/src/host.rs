use anyhow::{Context, Result};
use exthost_host::HostRuntime;
use exthost_protocol::HostArgs;
use tracing::info;

use crate::cli::HostCliArgs;

pub async fn run(args: HostCliArgs) -> Result<()> {
	let args = HostArgs::from(args);
	info!(
		target = "exthost.host",
		pid = std::process::id(),
		sockpath = %args.sockpath.display(),
		"extension host starting"
	);
	HostRuntime::new(args)
		.run()
		.await
		.context("Extension host failed")
}
