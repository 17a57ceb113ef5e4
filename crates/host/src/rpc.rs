//! JSON RPC over the bridge socket.
//!
//! Each frame on the host's bridge endpoint carries one JSON message. Both
//! sides may issue requests: the UI calls into the host (`activateExtension`,
//! `getExtension`, ...) and the host calls back into the browser for
//! component invocations.
//!
//! # Message Flow
//!
//! 1. [`RpcConnection::call`] allocates an id and parks a oneshot sender
//! 2. The request is queued to the writer task and framed onto the socket
//! 3. The read loop in [`RpcConnection::run`] matches the response by id
//! 4. Incoming requests are dispatched to a [`RequestHandler`] on their own task
//!
//! Closing the socket fails every call still waiting for a response.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use exthost_protocol::{ControlMessage, FrameError, FrameReader, FrameWriter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::activator::ExtensionActivator;
use crate::context::BrowserServices;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
	pub id: u64,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
	pub id: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
	pub message: String,
}

impl RpcResponse {
	fn from_result(id: u64, result: Result<Value>) -> Self {
		match result {
			Ok(value) => Self {
				id,
				result: Some(value),
				error: None,
			},
			Err(err) => Self {
				id,
				result: None,
				error: Some(RpcErrorBody {
					message: err.to_string(),
				}),
			},
		}
	}
}

/// Requests carry `method`; anything else with an `id` is a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcMessage {
	Request(RpcRequest),
	Response(RpcResponse),
}

/// Serves requests arriving from the peer.
pub trait RequestHandler: Send + Sync {
	fn handle(&self, method: &str, params: Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>>;
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// Removes the pending entry when a call is dropped before its response.
struct PendingGuard {
	id: u64,
	pending: PendingMap,
}

impl Drop for PendingGuard {
	fn drop(&mut self) {
		if self.pending.lock().remove(&self.id).is_some() {
			debug!(target = "exthost.host", id = self.id, "dropped pending rpc call");
		}
	}
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
	fn drop(&mut self) {
		self.0.abort();
	}
}

pub struct RpcConnection {
	last_id: AtomicU64,
	pending: PendingMap,
	outbound_tx: mpsc::UnboundedSender<RpcMessage>,
	outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<RpcMessage>>>,
}

impl RpcConnection {
	pub fn new() -> Arc<Self> {
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
		Arc::new(Self {
			last_id: AtomicU64::new(0),
			pending: Arc::new(Mutex::new(HashMap::new())),
			outbound_tx,
			outbound_rx: Mutex::new(Some(outbound_rx)),
		})
	}

	/// Sends a request to the peer and waits for its response.
	pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
		let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(id, tx);
		let _guard = PendingGuard {
			id,
			pending: self.pending.clone(),
		};

		let request = RpcMessage::Request(RpcRequest {
			id,
			method: method.to_string(),
			params,
		});
		if self.outbound_tx.send(request).is_err() {
			return Err(Error::ChannelClosed);
		}
		rx.await.map_err(|_| Error::ChannelClosed)?
	}

	/// Runs the read loop until the peer closes the stream.
	///
	/// Can only be called once per connection.
	pub async fn run<R, W>(self: &Arc<Self>, reader: R, writer: W, handler: Arc<dyn RequestHandler>) -> Result<()>
	where
		R: AsyncRead + Unpin + Send,
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let Some(mut outbound_rx) = self.outbound_rx.lock().take() else {
			return Err(Error::ChannelClosed);
		};

		let _writer = AbortOnDrop(tokio::spawn(async move {
			let mut writer = FrameWriter::new(writer);
			while let Some(message) = outbound_rx.recv().await {
				if let Err(err) = writer.write_json(&message).await {
					error!(target = "exthost.host", error = %err, "rpc write failed");
					break;
				}
			}
		}));

		let mut reader = FrameReader::new(reader);
		let outcome = loop {
			let message = match reader.read_json::<RpcMessage>().await {
				Ok(Some(message)) => message,
				Ok(None) => break Ok(()),
				Err(FrameError::Json(err)) => {
					warn!(target = "exthost.host", error = %err, "ignoring malformed rpc frame");
					continue;
				}
				Err(err) => break Err(Error::from(err)),
			};

			match message {
				RpcMessage::Request(request) => {
					let handler = handler.clone();
					let outbound = self.outbound_tx.clone();
					tokio::spawn(async move {
						let result = handler.handle(&request.method, request.params).await;
						if let Err(err) = &result {
							debug!(target = "exthost.host", method = %request.method, error = %err, "rpc request failed");
						}
						let _ = outbound.send(RpcMessage::Response(RpcResponse::from_result(request.id, result)));
					});
				}
				RpcMessage::Response(response) => {
					let Some(tx) = self.pending.lock().remove(&response.id) else {
						debug!(target = "exthost.host", id = response.id, "response for unknown request");
						continue;
					};
					let result = match response.error {
						Some(body) => Err(Error::Remote(body.message)),
						None => Ok(response.result.unwrap_or(Value::Null)),
					};
					let _ = tx.send(result);
				}
			}
		};

		// Dropping the senders wakes every waiter with `ChannelClosed`.
		self.pending.lock().clear();
		outcome
	}
}

/// Reaches browser-side components by calling back over the bridge.
pub struct RpcBrowserServices {
	connection: Arc<RpcConnection>,
}

impl RpcBrowserServices {
	pub fn new(connection: Arc<RpcConnection>) -> Self {
		Self { connection }
	}
}

impl BrowserServices for RpcBrowserServices {
	fn invoke(
		&self,
		extension_id: &str,
		component_id: &str,
		method: &str,
		args: Value,
	) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>> {
		let params = json!({
			"extensionId": extension_id,
			"componentId": component_id,
			"method": method,
			"args": args,
		});
		Box::pin(async move { self.connection.call("invokeBrowserComponent", params).await })
	}
}

#[derive(Debug, Deserialize)]
struct IdParams {
	id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceParams {
	extension_id: String,
	name: String,
	#[serde(default)]
	args: Value,
}

/// The host's RPC surface as seen from the UI side.
pub struct HostService {
	activator: Arc<ExtensionActivator>,
	reporter: Option<mpsc::UnboundedSender<ControlMessage>>,
}

impl HostService {
	pub fn new(activator: Arc<ExtensionActivator>) -> Self {
		Self {
			activator,
			reporter: None,
		}
	}

	/// Emits a reporter control message after each activation request.
	pub fn with_reporter(mut self, reporter: mpsc::UnboundedSender<ControlMessage>) -> Self {
		self.reporter = Some(reporter);
		self
	}

	async fn activate(&self, id: &str) -> Result<Value> {
		let started = Instant::now();
		let outcome = self.activator.activate(id).await;
		if let Some(reporter) = &self.reporter {
			let _ = reporter.send(ControlMessage::reporter(json!({
				"event": "activateExtension",
				"extensionId": id,
				"success": outcome.is_ok(),
				"elapsedMs": started.elapsed().as_millis() as u64,
			})));
		}
		outcome?;
		Ok(Value::Null)
	}

	async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
		match method {
			"activateExtension" => {
				let IdParams { id } = serde_json::from_value(params)?;
				self.activate(&id).await
			}
			"isActivated" => {
				let IdParams { id } = serde_json::from_value(params)?;
				Ok(Value::Bool(self.activator.is_activated(&id)))
			}
			"getExtension" => {
				let IdParams { id } = serde_json::from_value(params)?;
				let snapshot = self
					.activator
					.get_extension(&id)
					.ok_or(Error::ExtensionNotFound(id))?;
				Ok(serde_json::to_value(snapshot)?)
			}
			"listExtensions" => Ok(serde_json::to_value(self.activator.list())?),
			"invokeService" => {
				let ServiceParams { extension_id, name, args } = serde_json::from_value(params)?;
				self.activator.services().invoke(&extension_id, &name, args).await
			}
			other => Err(Error::UnknownMethod(other.to_string())),
		}
	}
}

impl RequestHandler for HostService {
	fn handle(&self, method: &str, params: Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>> {
		let method = method.to_string();
		Box::pin(async move { self.dispatch(&method, params).await })
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::duplex;

	use super::*;

	struct Upper;

	impl RequestHandler for Upper {
		fn handle(&self, method: &str, params: Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>> {
			let method = method.to_string();
			Box::pin(async move {
				match method.as_str() {
					"upper" => Ok(json!(params.as_str().unwrap_or_default().to_uppercase())),
					other => Err(Error::UnknownMethod(other.to_string())),
				}
			})
		}
	}

	#[test]
	fn requests_and_responses_are_told_apart() {
		let request: RpcMessage = serde_json::from_str(r#"{"id":1,"method":"isActivated","params":{"id":"a"}}"#).unwrap();
		assert!(matches!(request, RpcMessage::Request(RpcRequest { id: 1, .. })));

		let response: RpcMessage = serde_json::from_str(r#"{"id":1,"result":true}"#).unwrap();
		assert_eq!(
			response,
			RpcMessage::Response(RpcResponse {
				id: 1,
				result: Some(json!(true)),
				error: None,
			})
		);
	}

	#[tokio::test]
	async fn calls_round_trip_between_two_connections() {
		let (left, right) = duplex(4096);
		let (left_read, left_write) = tokio::io::split(left);
		let (right_read, right_write) = tokio::io::split(right);

		let client = RpcConnection::new();
		let server = RpcConnection::new();
		let client_run = {
			let client = client.clone();
			tokio::spawn(async move { client.run(left_read, left_write, Arc::new(Upper)).await })
		};
		let server_run = {
			let server = server.clone();
			tokio::spawn(async move { server.run(right_read, right_write, Arc::new(Upper)).await })
		};

		assert_eq!(client.call("upper", json!("abc")).await.unwrap(), json!("ABC"));
		assert_eq!(server.call("upper", json!("xyz")).await.unwrap(), json!("XYZ"));
		let err = client.call("nope", Value::Null).await.unwrap_err();
		assert!(matches!(&err, Error::Remote(message) if message.contains("Unknown method")));

		server_run.abort();
		let _ = server_run.await;
		client_run.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn pending_calls_fail_when_the_peer_closes() {
		let (left, right) = duplex(4096);
		let (left_read, left_write) = tokio::io::split(left);
		let client = RpcConnection::new();
		let run = {
			let client = client.clone();
			tokio::spawn(async move { client.run(left_read, left_write, Arc::new(Upper)).await })
		};

		let call = {
			let client = client.clone();
			tokio::spawn(async move { client.call("upper", json!("never answered")).await })
		};
		// Read the request so the peer is known to have it, then hang up.
		let mut peer = FrameReader::new(right);
		let request: RpcMessage = peer.read_json().await.unwrap().unwrap();
		assert!(matches!(request, RpcMessage::Request(_)));
		drop(peer);

		assert!(matches!(call.await.unwrap(), Err(Error::ChannelClosed)));
		run.await.unwrap().unwrap();
	}
}
