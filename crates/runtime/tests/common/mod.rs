//! Scripted extension hosts for supervisor tests.
//!
//! A fake host is a tokio task that behaves like the real one: it connects to
//! `sockpath`, sends `ready` and a reporter message, prints a debugger line
//! when launched with `--inspect`, echoes every frame it receives, and
//! answers `close` with `finish`. Every spawn, close, and exit is appended to a
//! shared event log so tests can assert on ordering.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use exthost_protocol::{ControlMessage, FrameReader, FrameWriter, ReporterMessage};
use exthost_runtime::{
	CrashReport, Error, ExitReport, LaunchSpec, OutputLine, OutputStream, ProcessKiller,
	ProcessSpawner, Result, SessionObserver, SpawnedProcess, SupervisorConfig,
};
use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
	#[default]
	Echo,
	/// Never sends `ready`.
	NeverReady,
	/// Ignores `close`, so teardown has to kill it.
	IgnoreClose,
	/// Spawning fails.
	FailSpawn,
}

#[derive(Default)]
pub struct FakeSpawner {
	events: Arc<Mutex<Vec<String>>>,
	behaviors: Mutex<HashMap<String, Behavior>>,
	crash_triggers: Mutex<HashMap<String, oneshot::Sender<i32>>>,
	next_pid: AtomicU32,
	last_args: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeSpawner {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			next_pid: AtomicU32::new(1000),
			..Default::default()
		})
	}

	pub fn set_behavior(&self, client_id: &str, behavior: Behavior) {
		self.behaviors.lock().insert(client_id.to_string(), behavior);
	}

	pub fn events(&self) -> Vec<String> {
		self.events.lock().clone()
	}

	/// Command-line arguments the supervisor asked for on the last spawn.
	pub fn last_args(&self, client_id: &str) -> Option<Vec<String>> {
		self.last_args.lock().get(client_id).cloned()
	}

	/// Makes the client's current fake host exit with `code`.
	pub fn crash(&self, client_id: &str, code: i32) -> bool {
		match self.crash_triggers.lock().remove(client_id) {
			Some(trigger) => trigger.send(code).is_ok(),
			None => false,
		}
	}

	/// Waits until `event` shows up in the log.
	pub async fn wait_for_event(&self, event: &str) {
		tokio::time::timeout(Duration::from_secs(5), async {
			loop {
				if self.events.lock().iter().any(|e| e == event) {
					return;
				}
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
		})
		.await
		.unwrap_or_else(|_| panic!("event {event:?} never happened; log: {:?}", self.events()));
	}
}

impl ProcessSpawner for FakeSpawner {
	fn spawn(&self, spec: LaunchSpec) -> Pin<Box<dyn Future<Output = Result<SpawnedProcess>> + Send + '_>> {
		Box::pin(async move {
			let client_id = spec.client_id.clone();
			let behavior = self.behaviors.lock().get(&client_id).copied().unwrap_or_default();
			if behavior == Behavior::FailSpawn {
				return Err(Error::LaunchFailed(format!("fake spawn refused for {client_id}")));
			}

			self.last_args
				.lock()
				.insert(client_id.clone(), spec.args.to_args()?);
			self.events.lock().push(format!("spawn {client_id}"));

			let (to_host_tx, to_host_rx) = mpsc::unbounded_channel();
			let (from_host_tx, from_host_rx) = mpsc::unbounded_channel();
			let (output_tx, output_rx) = mpsc::unbounded_channel();
			let (exit_tx, exit_rx) = oneshot::channel();
			let (kill_tx, kill_rx) = oneshot::channel();
			let (crash_tx, crash_rx) = oneshot::channel();
			self.crash_triggers.lock().insert(client_id.clone(), crash_tx);

			let host = FakeHost {
				client_id,
				behavior,
				events: self.events.clone(),
				control_in: to_host_rx,
				control_out: from_host_tx,
				output: output_tx,
			};
			tokio::spawn(host.run(spec, kill_rx, crash_rx, exit_tx));

			Ok(SpawnedProcess {
				pid: Some(self.next_pid.fetch_add(1, Ordering::Relaxed)),
				control_tx: to_host_tx,
				control_rx: from_host_rx,
				output_rx,
				exit: exit_rx,
				killer: ProcessKiller::new(kill_tx),
			})
		})
	}
}

struct FakeHost {
	client_id: String,
	behavior: Behavior,
	events: Arc<Mutex<Vec<String>>>,
	control_in: mpsc::UnboundedReceiver<ControlMessage>,
	control_out: mpsc::UnboundedSender<ControlMessage>,
	output: mpsc::UnboundedSender<OutputLine>,
}

impl FakeHost {
	async fn run(
		mut self,
		spec: LaunchSpec,
		mut kill_rx: oneshot::Receiver<()>,
		mut crash_rx: oneshot::Receiver<i32>,
		exit_tx: oneshot::Sender<ExitReport>,
	) {
		let report = match UnixStream::connect(&spec.args.sockpath).await {
			Ok(stream) => {
				let _ = self.output.send(OutputLine {
					stream: OutputStream::Stdout,
					line: format!("fake host {} up", self.client_id),
				});
				if let Some(port) = spec.args.inspect {
					let _ = self.output.send(OutputLine {
						stream: OutputStream::Stderr,
						line: format!("Debugger listening on ws://127.0.0.1:{port}/fake-{}", self.client_id),
					});
				}
				if self.behavior != Behavior::NeverReady {
					let _ = self.control_out.send(ControlMessage::READY);
					let _ = self.control_out.send(ControlMessage::Reporter(ReporterMessage::Reporter {
						data: serde_json::json!({ "event": "started", "clientId": self.client_id }),
					}));
				}

				let (read, write) = stream.into_split();
				let echo = async {
					echo_frames(FrameReader::new(read), FrameWriter::new(write)).await;
					std::future::pending::<()>().await;
				};

				let events = self.events.clone();
				let client_id = self.client_id.clone();
				let behavior = self.behavior;
				let control_out = self.control_out.clone();
				let control_in = &mut self.control_in;
				let closed = async move {
					while let Some(message) = control_in.recv().await {
						if message == ControlMessage::CLOSE {
							events.lock().push(format!("close {client_id}"));
							if behavior != Behavior::IgnoreClose {
								let _ = control_out.send(ControlMessage::FINISH);
								return;
							}
						}
					}
					std::future::pending::<()>().await;
				};

				tokio::select! {
					Ok(()) = &mut kill_rx => ExitReport::signal(9),
					Ok(code) = &mut crash_rx => ExitReport::code(code),
					_ = closed => ExitReport::code(0),
					_ = echo => ExitReport::code(0),
				}
			}
			Err(_) => ExitReport::code(1),
		};

		self.events.lock().push(format!("exit {}", self.client_id));
		let _ = exit_tx.send(report);
	}
}

async fn echo_frames(
	mut reader: FrameReader<tokio::net::unix::OwnedReadHalf>,
	mut writer: FrameWriter<tokio::net::unix::OwnedWriteHalf>,
) {
	while let Ok(Some(frame)) = reader.read_frame().await {
		if writer.write_frame(&frame).await.is_err() {
			break;
		}
	}
}

/// Records observer calls for assertions.
#[derive(Default)]
pub struct RecordingObserver {
	pub crashes: Mutex<Vec<(String, CrashReport)>>,
	pub timeouts: Mutex<Vec<String>>,
	pub reports: Mutex<Vec<(String, serde_json::Value)>>,
	pub output: Mutex<Vec<(String, String)>>,
}

impl SessionObserver for RecordingObserver {
	fn process_crashed(&self, client_id: &str, report: &CrashReport) {
		self.crashes.lock().push((client_id.to_string(), *report));
	}

	fn handshake_timed_out(&self, client_id: &str, _timeout: Duration) {
		self.timeouts.lock().push(client_id.to_string());
	}

	fn reporter(&self, client_id: &str, data: &serde_json::Value) {
		self.reports.lock().push((client_id.to_string(), data.clone()));
	}

	fn process_output(&self, client_id: &str, _stream: OutputStream, line: &str) {
		self.output.lock().push((client_id.to_string(), line.to_string()));
	}
}

/// Short timings so tests run in well under a second each.
pub fn test_config(socket_dir: &std::path::Path) -> SupervisorConfig {
	SupervisorConfig::default()
		.with_socket_dir(socket_dir)
		.with_reconnect_grace(Duration::from_millis(300))
		.with_ready_timeout(Duration::from_secs(2))
		.with_finish_timeout(Duration::from_millis(500))
}

/// Polls `check` until it holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
	for _ in 0..300 {
		if check() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	check()
}
