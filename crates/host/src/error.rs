//! Error types for the extension host runtime.

use std::path::PathBuf;
use std::sync::Arc;

use exthost_protocol::FrameError;
use thiserror::Error;

/// Result type alias for host runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error raised by extension code (an entry point or an exported service).
pub type EntryError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
	/// A `package.json` could not be read or parsed.
	#[error("Invalid extension manifest {path}: {message}")]
	Manifest { path: PathBuf, message: String },

	#[error("Extension not found: {0}")]
	ExtensionNotFound(String),

	#[error(transparent)]
	Activation(Arc<ActivationError>),

	/// The extension did not declare the requested browser component.
	#[error("Extension '{extension_id}' has no browser component '{component_id}'")]
	UnknownComponent {
		extension_id: String,
		component_id: String,
	},

	#[error("No service '{name}' registered by extension '{extension_id}'")]
	UnknownService { extension_id: String, name: String },

	/// The extension's own code returned an error.
	#[error("Extension code failed: {0}")]
	Extension(String),

	/// The inherited control channel is missing or unusable.
	#[error("Control channel unavailable: {0}")]
	ControlChannel(String),

	#[error("Unknown method: {0}")]
	UnknownMethod(String),

	/// The peer answered an RPC request with an error.
	#[error("Remote error: {0}")]
	Remote(String),

	/// The RPC connection closed before a response arrived.
	#[error("Connection closed")]
	ChannelClosed,

	#[error("Bridge frame error: {0}")]
	Frame(#[from] FrameError),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Why an extension could not be activated.
///
/// Stored behind an `Arc` on the extension record so every caller that joined
/// the same activation observes the same failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivationError {
	#[error("Extension not found: {0}")]
	UnknownExtension(String),

	/// The manifest names an entry point that no loader can provide.
	#[error("Extension '{extension_id}' declares entry '{entry}' but it could not be loaded")]
	MissingEntry { extension_id: String, entry: String },

	#[error("Activating extension '{extension_id}' failed: {message}")]
	EntryFailed { extension_id: String, message: String },

	#[error("Activating extension '{extension_id}' panicked: {message}")]
	EntryPanicked { extension_id: String, message: String },

	/// The host is shutting down and extensions were deactivated.
	#[error("Extension '{0}' was deactivated")]
	Deactivated(String),
}

impl From<Arc<ActivationError>> for Error {
	fn from(err: Arc<ActivationError>) -> Self {
		Error::Activation(err)
	}
}

impl ActivationError {
	pub fn extension_id(&self) -> &str {
		match self {
			ActivationError::UnknownExtension(id) | ActivationError::Deactivated(id) => id,
			ActivationError::MissingEntry { extension_id, .. }
			| ActivationError::EntryFailed { extension_id, .. }
			| ActivationError::EntryPanicked { extension_id, .. } => extension_id,
		}
	}
}
