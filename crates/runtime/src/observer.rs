//! Client-facing notifications.
//!
//! The supervisor recovers from process-level failures on its own and only
//! reports them through these narrow calls. Every method has a default that
//! logs, so [`TracingObserver`] is just the empty implementation.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::spawner::{ExitReport, OutputStream};

/// Describes an extension host that exited while its session was live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashReport {
	pub pid: Option<u32>,
	pub code: Option<i32>,
	pub signal: Option<i32>,
}

impl CrashReport {
	pub fn new(pid: Option<u32>, exit: ExitReport) -> Self {
		Self {
			pid,
			code: exit.code,
			signal: exit.signal,
		}
	}
}

pub trait SessionObserver: Send + Sync {
	fn process_crashed(&self, client_id: &str, report: &CrashReport) {
		error!(
			target = "exthost.supervisor",
			client = client_id,
			pid = ?report.pid,
			code = ?report.code,
			signal = ?report.signal,
			"extension host crashed"
		);
	}

	fn handshake_timed_out(&self, client_id: &str, timeout: Duration) {
		warn!(
			target = "exthost.supervisor",
			client = client_id,
			timeout_ms = timeout.as_millis() as u64,
			"extension host never signalled ready"
		);
	}

	/// `{type: "reporter"}` payloads from the host.
	fn reporter(&self, client_id: &str, data: &Value) {
		info!(target = "exthost.supervisor", client = client_id, %data, "reporter");
	}

	fn process_output(&self, client_id: &str, stream: OutputStream, line: &str) {
		info!(target = "exthost.process", client = client_id, %stream, "{line}");
	}
}

/// Reports everything through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {}
