//! End-to-end tests for `exthost serve`.
//!
//! These start the real binary, which spawns real `exthost host` processes,
//! and talk to it the way a UI would.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use exthost_protocol::{FrameReader, FrameWriter, MainHello, MainReply};
use serde_json::{Value, json};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

fn exthost_binary() -> PathBuf {
	PathBuf::from(env!("CARGO_BIN_EXE_exthost"))
}

fn write_manifest(dir: &Path, json: &str) {
	std::fs::create_dir_all(dir).unwrap();
	std::fs::write(dir.join("package.json"), json).unwrap();
}

struct Server {
	child: Child,
	listen: PathBuf,
}

impl Server {
	fn start(root: &Path, extra: &[&str]) -> Self {
		let listen = root.join("ui.sock");
		let child = Command::new(exthost_binary())
			.arg("serve")
			.arg("--listen")
			.arg(&listen)
			.arg("--socket-dir")
			.arg(root.join("hosts"))
			.arg("--extension-dir")
			.arg(root.join("extensions"))
			.args(extra)
			.stdout(Stdio::null())
			.stderr(Stdio::inherit())
			.spawn()
			.expect("failed to start exthost serve");
		Self { child, listen }
	}

	async fn connect(&self) -> UnixStream {
		let deadline = Instant::now() + Duration::from_secs(10);
		loop {
			match UnixStream::connect(&self.listen).await {
				Ok(stream) => return stream,
				Err(_) if Instant::now() < deadline => {
					tokio::time::sleep(Duration::from_millis(50)).await;
				}
				Err(err) => panic!("server never started listening: {err}"),
			}
		}
	}

	fn terminate(mut self) -> ExitStatus {
		unsafe {
			libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
		}
		let deadline = Instant::now() + Duration::from_secs(20);
		loop {
			if let Some(status) = self.child.try_wait().unwrap() {
				return status;
			}
			if Instant::now() > deadline {
				let _ = self.child.kill();
				panic!("exthost serve did not exit after SIGTERM");
			}
			std::thread::sleep(Duration::from_millis(50));
		}
	}
}

struct Ui {
	reader: FrameReader<OwnedReadHalf>,
	writer: FrameWriter<OwnedWriteHalf>,
	next_id: u64,
}

impl Ui {
	async fn hello(stream: UnixStream, client_id: &str, create: bool) -> (Self, MainReply) {
		let (read, write) = stream.into_split();
		let mut ui = Self {
			reader: FrameReader::new(read),
			writer: FrameWriter::new(write),
			next_id: 0,
		};
		ui.writer
			.write_json(&MainHello {
				client_id: client_id.to_string(),
				create,
			})
			.await
			.unwrap();
		let reply = ui.reader.read_json::<MainReply>().await.unwrap().unwrap();
		(ui, reply)
	}

	async fn call(&mut self, method: &str, params: Value) -> Value {
		self.next_id += 1;
		let id = self.next_id;
		self.writer
			.write_json(&json!({ "id": id, "method": method, "params": params }))
			.await
			.unwrap();
		let response: Value = tokio::time::timeout(Duration::from_secs(10), self.reader.read_json())
			.await
			.expect("rpc response timed out")
			.unwrap()
			.unwrap();
		assert_eq!(response["id"], json!(id));
		response
	}
}

#[tokio::test]
async fn ui_reaches_extensions_through_a_spawned_host() {
	let root = tempfile::tempdir().unwrap();
	write_manifest(&root.path().join("extensions/notes"), r#"{"name":"notes","publisher":"acme"}"#);
	let server = Server::start(root.path(), &[]);

	let (mut ui, reply) = Ui::hello(server.connect().await, "tab-1", true).await;
	assert_eq!(reply, MainReply::Attached { inspect_port: None });

	let listed = ui.call("listExtensions", Value::Null).await;
	assert_eq!(listed["result"][0]["id"], "acme.notes");
	assert_eq!(listed["result"][0]["state"], "inactive");

	let activated = ui.call("activateExtension", json!({ "id": "acme.notes" })).await;
	assert!(activated.get("error").is_none(), "activation failed: {activated}");
	let active = ui.call("isActivated", json!({ "id": "acme.notes" })).await;
	assert_eq!(active["result"], json!(true));

	let missing = ui.call("getExtension", json!({ "id": "acme.nothing" })).await;
	assert!(missing["error"]["message"].as_str().unwrap().contains("acme.nothing"));

	drop(ui);
	assert!(server.terminate().success());
}

#[tokio::test]
async fn reconnecting_ui_finds_the_same_host() {
	let root = tempfile::tempdir().unwrap();
	write_manifest(&root.path().join("extensions/notes"), r#"{"name":"notes","publisher":"acme"}"#);
	let server = Server::start(root.path(), &[]);

	let (mut first, reply) = Ui::hello(server.connect().await, "tab-2", true).await;
	assert!(matches!(reply, MainReply::Attached { .. }));
	first.call("activateExtension", json!({ "id": "acme.notes" })).await;
	drop(first);

	let (mut second, reply) = Ui::hello(server.connect().await, "tab-2", false).await;
	assert!(matches!(reply, MainReply::Attached { .. }));
	let active = second.call("isActivated", json!({ "id": "acme.notes" })).await;
	assert_eq!(active["result"], json!(true));

	let (_, reply) = Ui::hello(server.connect().await, "tab-unknown", false).await;
	assert_eq!(
		reply,
		MainReply::ProcessNotFound {
			client_id: "tab-unknown".to_string()
		}
	);

	drop(second);
	assert!(server.terminate().success());
}
