//! Debug port discovery.
//!
//! Two halves: picking a free port to pass as `--inspect=<port>`, and
//! recognising the line a host prints once its debugger endpoint is up.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::net::TcpListener;
use tracing::debug;

static DEBUGGER_URL: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"(?i)listening on (?:ws|tcp)://[^\s/]+:(\d{1,5})(?:/|\s|$)")
		.expect("debugger url pattern is valid")
});

/// Probes `base`, `base + 1`, ... for a port that can be bound on loopback.
///
/// Gives up after `attempts` ports or once `timeout` elapses, whichever comes
/// first. A `None` result is not an error: the host runs without an inspector.
pub async fn find_free_port(base: u16, attempts: u16, timeout: Duration) -> Option<u16> {
	let probe = async {
		for offset in 0..attempts {
			let port = base.checked_add(offset)?;
			if port_available(port).await {
				return Some(port);
			}
		}
		None
	};

	match tokio::time::timeout(timeout, probe).await {
		Ok(found) => found,
		Err(_) => {
			debug!(target = "exthost.supervisor", base, attempts, "inspect port probe timed out");
			None
		}
	}
}

async fn port_available(port: u16) -> bool {
	TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

/// Extracts the port from a `Debugger listening on ws://host:port/...` line.
pub fn parse_inspect_port(line: &str) -> Option<u16> {
	DEBUGGER_URL
		.captures(line)
		.and_then(|caps| caps.get(1))
		.and_then(|port| port.as_str().parse().ok())
}
