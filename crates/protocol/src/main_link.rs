//! Opening exchange on a UI-side (main thread) connection.
//!
//! 1. The UI connects and sends [`MainHello`] as the first frame
//! 2. The supervisor answers with [`MainReply::Attached`] or
//!    [`MainReply::ProcessNotFound`]
//! 3. After `Attached`, every further frame is opaque RPC traffic relayed
//!    verbatim to the client's extension host process

use serde::{Deserialize, Serialize};

/// First frame sent by the UI side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MainHello {
	pub client_id: String,
	/// Launch a process when none is live for `client_id`.
	#[serde(default = "default_true")]
	pub create: bool,
}

fn default_true() -> bool {
	true
}

/// Supervisor answer to [`MainHello`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum MainReply {
	/// Forwarding is installed.
	Attached {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		inspect_port: Option<u16>,
	},
	/// No live extension host process exists for the client.
	ProcessNotFound { client_id: String },
	/// The session could not be created.
	Error { message: String },
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hello_defaults_to_create() {
		let hello: MainHello = serde_json::from_str(r#"{"clientId":"tab-1"}"#).unwrap();
		assert_eq!(hello.client_id, "tab-1");
		assert!(hello.create);
	}

	#[test]
	fn process_not_found_is_distinct() {
		let reply = MainReply::ProcessNotFound {
			client_id: "tab-1".into(),
		};
		let json = serde_json::to_string(&reply).unwrap();
		assert!(json.contains(r#""type":"processNotFound""#));
		assert!(json.contains(r#""clientId":"tab-1""#));
	}
}
