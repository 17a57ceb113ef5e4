//! Error types for the extension host supervisor.

use exthost_protocol::FrameError;
use thiserror::Error;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while supervising extension host processes.
#[derive(Debug, Error)]
pub enum Error {
	/// The OS refused to start the extension host process.
	#[error("Failed to launch extension host: {0}")]
	LaunchFailed(String),

	/// The process started but never sent `ready`.
	#[error("Extension host for '{client_id}' did not signal ready within {timeout_ms}ms")]
	HandshakeTimeout { client_id: String, timeout_ms: u64 },

	/// No live extension host process exists for the client.
	#[error("Extension host process not found for client '{client_id}'")]
	ProcessNotFound { client_id: String },

	/// The session was replaced or disposed while it was still launching.
	#[error("Session for '{client_id}' was closed before it finished launching")]
	SessionClosed { client_id: String },

	/// Supervisor configuration is unusable.
	#[error("Invalid configuration: {0}")]
	InvalidConfig(String),

	/// Framing error on a bridge endpoint.
	#[error("Bridge frame error: {0}")]
	Frame(#[from] FrameError),

	/// I/O error.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// JSON serialization/deserialization error.
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	pub(crate) fn not_found(client_id: &str) -> Self {
		Error::ProcessNotFound {
			client_id: client_id.to_string(),
		}
	}

	/// Returns true if the UI side should be told the process does not exist.
	pub fn is_process_not_found(&self) -> bool {
		matches!(self, Error::ProcessNotFound { .. })
	}

	/// Returns true if the process could not be started at all.
	pub fn is_launch_failure(&self) -> bool {
		matches!(self, Error::LaunchFailed(_))
	}

	/// Returns true if this is a handshake timeout.
	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::HandshakeTimeout { .. })
	}
}
