//! The extension host supervisor.
//!
//! One [`ExtensionHostSupervisor`] owns every client session in the process.
//! It launches hosts, drives the `ready`/`close`/`finish` handshake, relays
//! UI connections onto host sockets, and tears sessions down on dispose,
//! eviction, crash, grace-period expiry, or shutdown.
//!
//! All session-table mutation happens under one `parking_lot` lock that is
//! never held across an await. A session leaves the table before its
//! teardown starts, so later lookups for that client never observe a
//! half-torn-down process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use exthost_protocol::{
	AppConfig, ControlMessage, ControlSignal, FrameReader, FrameWriter, HostArgs, MainHello,
	MainReply, ReporterMessage,
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::bridge::{ActiveLink, BoxedRead, BoxedWrite, HostHalves, LinkEnd, relay};
use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::inspect::{find_free_port, parse_inspect_port};
use crate::observer::{CrashReport, SessionObserver, TracingObserver};
use crate::session::{ClientSession, SessionInfo, SessionState, SessionTable};
use crate::spawner::{
	CommandSpawner, ExitReport, LaunchSpec, OutputLine, ProcessSpawner, SpawnedProcess,
};

/// Supervises one extension host process per client.
///
/// Cheap to clone; clones share the same session table.
#[derive(Clone)]
pub struct ExtensionHostSupervisor {
	inner: Arc<Inner>,
}

struct Inner {
	config: SupervisorConfig,
	spawner: Arc<dyn ProcessSpawner>,
	observer: Arc<dyn SessionObserver>,
	sessions: Mutex<SessionTable>,
	next_session_id: AtomicU64,
}

/// Assembles a supervisor with non-default collaborators.
pub struct SupervisorBuilder {
	config: SupervisorConfig,
	spawner: Option<Arc<dyn ProcessSpawner>>,
	observer: Arc<dyn SessionObserver>,
}

impl SupervisorBuilder {
	/// Replaces the process spawner (defaults to [`CommandSpawner`]).
	pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
		self.spawner = Some(spawner);
		self
	}

	/// Replaces the observer (defaults to [`TracingObserver`]).
	pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
		self.observer = observer;
		self
	}

	pub fn build(self) -> Result<ExtensionHostSupervisor> {
		self.config.validate()?;
		let spawner = self
			.spawner
			.unwrap_or_else(|| Arc::new(CommandSpawner::new(self.config.host_command.clone())));
		Ok(ExtensionHostSupervisor {
			inner: Arc::new(Inner {
				config: self.config,
				spawner,
				observer: self.observer,
				sessions: Mutex::new(SessionTable::default()),
				next_session_id: AtomicU64::new(1),
			}),
		})
	}
}

impl ExtensionHostSupervisor {
	/// Creates a supervisor that spawns `config.host_command`.
	pub fn new(config: SupervisorConfig) -> Result<Self> {
		Self::builder(config).build()
	}

	pub fn builder(config: SupervisorConfig) -> SupervisorBuilder {
		SupervisorBuilder {
			config,
			spawner: None,
			observer: Arc::new(TracingObserver),
		}
	}

	pub fn config(&self) -> &SupervisorConfig {
		&self.inner.config
	}

	/// Starts a fresh extension host for `client_id`.
	///
	/// An existing session for the same client is torn down first, as are the
	/// oldest sessions needed to stay within `max_process_count`. All of that
	/// teardown completes before the new process is spawned.
	pub async fn launch(&self, client_id: &str) -> Result<SessionInfo> {
		let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
		let sockpath = self.socket_path(id, client_id);
		let session = Arc::new(ClientSession::new(id, client_id, sockpath));

		let displaced = {
			let mut table = self.inner.sessions.lock();
			let mut displaced = Vec::new();
			if let Some(previous) = table.remove(client_id) {
				displaced.push(previous);
			}
			let keep = self.inner.config.max_process_count.saturating_sub(1);
			displaced.extend(table.evict_oldest(keep));
			let displaced: Vec<_> = displaced
				.into_iter()
				.map(|old| {
					let state = old.set_state(SessionState::Closing);
					(old, state)
				})
				.collect();
			table.insert(session.clone());
			displaced
		};

		for (old, previous) in displaced {
			if old.client_id == client_id {
				info!(target = "exthost.supervisor", client = client_id, "replacing existing session");
			} else {
				info!(
					target = "exthost.supervisor",
					client = %old.client_id,
					"evicting oldest session to stay within maxProcessCount"
				);
			}
			self.teardown(&old, previous).await;
		}

		match self.start_process(&session).await {
			Ok(()) => Ok(session.info()),
			Err(err) => {
				let previous = {
					let mut table = self.inner.sessions.lock();
					table.remove_current(&session);
					session.set_state(SessionState::Closing)
				};
				self.teardown(&session, previous).await;
				Err(err)
			}
		}
	}

	async fn start_process(&self, session: &Arc<ClientSession>) -> Result<()> {
		let config = &self.inner.config;
		let client_id = session.client_id.as_str();

		tokio::fs::create_dir_all(&config.socket_dir).await?;
		remove_socket_file(&session.sockpath).await;
		let listener = UnixListener::bind(&session.sockpath)?;
		session.track(tokio::spawn(accept_host(session.clone(), listener)));

		let inspect = if config.debug {
			let port = find_free_port(
				config.inspect_base_port,
				config.inspect_probe_attempts,
				config.inspect_probe_timeout,
			)
			.await;
			if port.is_none() {
				warn!(target = "exthost.supervisor", client = client_id, "no free inspect port; starting without debugger");
			}
			port
		} else {
			None
		};

		let spec = LaunchSpec {
			client_id: client_id.to_string(),
			args: HostArgs {
				sockpath: session.sockpath.clone(),
				preload: config.preload.clone(),
				app_config: AppConfig {
					log_dir: config.log_dir.clone(),
					log_level: config.log_level,
					extension_dirs: config.extension_dirs.clone(),
				},
				inspect,
			},
		};

		let process = self.inner.spawner.spawn(spec).await.map_err(|err| match err {
			Error::LaunchFailed(_) => err,
			other => Error::LaunchFailed(other.to_string()),
		})?;

		let SpawnedProcess {
			pid,
			control_tx,
			control_rx,
			output_rx,
			exit,
			killer,
		} = process;

		if let Err(mut killer) = session.attach_process(pid, control_tx, killer) {
			killer.kill();
			return Err(Error::SessionClosed {
				client_id: client_id.to_string(),
			});
		}
		info!(target = "exthost.supervisor", client = client_id, ?pid, ?inspect, "extension host started");

		session.track(tokio::spawn(self.clone().control_loop(session.clone(), control_rx)));
		session.track(tokio::spawn(self.clone().output_loop(session.clone(), output_rx)));
		// Neither of these is tracked: the exit watcher must survive teardown to
		// open the `exited` gate, and the ready timer may itself run a teardown.
		tokio::spawn(self.clone().watch_exit(session.clone(), exit));
		tokio::spawn(self.clone().ready_timer(session.clone()));
		Ok(())
	}

	async fn control_loop(
		self,
		session: Arc<ClientSession>,
		mut control_rx: mpsc::UnboundedReceiver<ControlMessage>,
	) {
		let client_id = session.client_id.as_str();
		while let Some(message) = control_rx.recv().await {
			match message {
				ControlMessage::Signal(ControlSignal::Ready) => {
					if session.transition(SessionState::AwaitingReady, SessionState::Ready) {
						session.rearm_finish();
						session.init.open();
						info!(target = "exthost.supervisor", client = client_id, "extension host ready");
					} else {
						debug!(target = "exthost.supervisor", client = client_id, state = ?session.state(), "ignoring ready");
					}
				}
				ControlMessage::Signal(ControlSignal::Finish) => {
					session.finish_gate().open();
					session.transition(SessionState::Closing, SessionState::Closed);
					debug!(target = "exthost.supervisor", client = client_id, "extension host finished");
				}
				ControlMessage::Signal(ControlSignal::Close) => {
					debug!(target = "exthost.supervisor", client = client_id, "ignoring close sent by host");
				}
				ControlMessage::Reporter(ReporterMessage::Reporter { data }) => {
					self.inner.observer.reporter(client_id, &data);
				}
			}
		}
	}

	async fn output_loop(self, session: Arc<ClientSession>, mut output_rx: mpsc::UnboundedReceiver<OutputLine>) {
		while let Some(OutputLine { stream, line }) = output_rx.recv().await {
			if let Some(port) = parse_inspect_port(&line) {
				session.set_inspect_port(port);
				info!(target = "exthost.supervisor", client = %session.client_id, port, "debugger listening");
			} else {
				self.inner.observer.process_output(&session.client_id, stream, &line);
			}
		}
	}

	async fn watch_exit(self, session: Arc<ClientSession>, exit: oneshot::Receiver<ExitReport>) {
		let report = exit.await.unwrap_or_default();
		session.exited.open();

		let crashed = {
			let mut table = self.inner.sessions.lock();
			if session.state().is_live() && table.remove_current(&session) {
				session.set_state(SessionState::Crashed);
				true
			} else {
				false
			}
		};

		if !crashed {
			session.transition(SessionState::Closing, SessionState::Closed);
			debug!(target = "exthost.supervisor", client = %session.client_id, code = ?report.code, signal = ?report.signal, "extension host exited");
			return;
		}

		let crash = CrashReport::new(session.pid(), report);
		self.release(&session).await;
		self.inner.observer.process_crashed(&session.client_id, &crash);
	}

	async fn ready_timer(self, session: Arc<ClientSession>) {
		let timeout = self.inner.config.ready_timeout;
		tokio::select! {
			_ = session.init.wait() => return,
			_ = session.exited.wait() => return,
			_ = tokio::time::sleep_until(session.launched_at + timeout) => {}
		}

		let previous = {
			let mut table = self.inner.sessions.lock();
			if session.state() != SessionState::AwaitingReady || !table.remove_current(&session) {
				return;
			}
			session.set_state(SessionState::Closing)
		};
		self.inner.observer.handshake_timed_out(&session.client_id, timeout);
		self.teardown(&session, previous).await;
	}

	/// Waits until the client's host has signalled `ready`.
	pub async fn wait_ready(&self, client_id: &str) -> Result<()> {
		let session = self.live_session(client_id).ok_or_else(|| Error::not_found(client_id))?;
		self.await_ready(&session, false).await
	}

	async fn await_ready(&self, session: &ClientSession, need_host: bool) -> Result<()> {
		let timeout = self.inner.config.ready_timeout;
		let ready = async {
			session.init.wait().await;
			if need_host {
				session.host_connected.wait().await;
			}
		};
		// Same deadline as the ready timer, checked before `exited` so a host
		// killed for missing it reports the timeout.
		tokio::select! {
			biased;
			_ = ready => Ok(()),
			_ = tokio::time::sleep_until(session.launched_at + timeout) => Err(Error::HandshakeTimeout {
				client_id: session.client_id.clone(),
				timeout_ms: timeout.as_millis() as u64,
			}),
			_ = session.exited.wait() => Err(Error::not_found(&session.client_id)),
		}
	}

	/// Relays a UI connection to the client's existing host.
	///
	/// Fails with [`Error::ProcessNotFound`] when the client has no live
	/// process. Returns once the relay is running.
	pub async fn attach_main<S>(&self, client_id: &str, stream: S) -> Result<()>
	where
		S: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (read, write) = tokio::io::split(stream);
		let reader = FrameReader::new(Box::new(read) as BoxedRead);
		let writer = FrameWriter::new(Box::new(write) as BoxedWrite);
		self.link_main(client_id, reader, writer, false).await
	}

	/// Serves one connection on the front-door listener.
	///
	/// Reads a [`MainHello`], launches or reuses the client's session, replies
	/// with a [`MainReply`], and then relays frames.
	pub async fn serve_main_connection<S>(&self, stream: S) -> Result<()>
	where
		S: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (read, write) = tokio::io::split(stream);
		let mut reader = FrameReader::new(Box::new(read) as BoxedRead);
		let mut writer = FrameWriter::new(Box::new(write) as BoxedWrite);

		let Some(hello) = reader.read_json::<MainHello>().await? else {
			debug!(target = "exthost.bridge", "ui connection closed before hello");
			return Ok(());
		};
		let client_id = hello.client_id.as_str();
		debug!(target = "exthost.bridge", client = client_id, create = hello.create, "ui hello");

		if self.live_session(client_id).is_none() {
			if !hello.create {
				writer
					.write_json(&MainReply::ProcessNotFound {
						client_id: client_id.to_string(),
					})
					.await?;
				return Err(Error::not_found(client_id));
			}
			if let Err(err) = self.launch(client_id).await {
				writer
					.write_json(&MainReply::Error {
						message: err.to_string(),
					})
					.await?;
				return Err(err);
			}
		}

		self.link_main(client_id, reader, writer, true).await
	}

	async fn link_main(
		&self,
		client_id: &str,
		mut main_reader: FrameReader<BoxedRead>,
		mut main_writer: FrameWriter<BoxedWrite>,
		announce: bool,
	) -> Result<()> {
		let result = self.claim_host(client_id).await;
		let (session, host_halves) = match result {
			Ok(claimed) => claimed,
			Err(err) => {
				if announce {
					let reply = match &err {
						Error::ProcessNotFound { .. } => MainReply::ProcessNotFound {
							client_id: client_id.to_string(),
						},
						other => MainReply::Error {
							message: other.to_string(),
						},
					};
					main_writer.write_json(&reply).await?;
				}
				return Err(err);
			}
		};

		if announce {
			let reply = MainReply::Attached {
				inspect_port: session.inspect_port(),
			};
			if let Err(err) = main_writer.write_json(&reply).await {
				session.host.lock().await.idle = Some(host_halves);
				self.on_main_disconnect(&session);
				return Err(err.into());
			}
		}

		let (stop_tx, mut stop_rx) = watch::channel(false);
		let supervisor = self.clone();
		let relay_session = session.clone();
		let (mut host_reader, mut host_writer) = host_halves;
		let task = tokio::spawn(async move {
			let end = relay(
				&mut main_reader,
				&mut main_writer,
				&mut host_reader,
				&mut host_writer,
				&mut stop_rx,
			)
			.await;

			match end {
				LinkEnd::MainClosed => supervisor.on_main_disconnect(&relay_session),
				LinkEnd::HostClosed => {
					debug!(target = "exthost.bridge", client = %relay_session.client_id, "host socket closed under relay");
				}
				LinkEnd::Stopped => {}
			}
			(host_reader, host_writer)
		});

		let mut host = session.host.lock().await;
		if !self.is_live(&session) {
			let _ = stop_tx.send(true);
			task.abort();
			return Err(Error::not_found(client_id));
		}
		host.link = Some(ActiveLink { stop: stop_tx, task });
		info!(target = "exthost.bridge", client = client_id, "ui attached");
		Ok(())
	}

	/// Waits for the handshake, then takes the host halves away from any
	/// previous UI connection and cancels the grace timer.
	async fn claim_host(&self, client_id: &str) -> Result<(Arc<ClientSession>, HostHalves)> {
		let session = self.live_session(client_id).ok_or_else(|| Error::not_found(client_id))?;
		self.await_ready(&session, true).await?;

		let halves = session.host.lock().await.reclaim().await;
		let Some(halves) = halves else {
			return Err(Error::not_found(client_id));
		};
		// Only after the old relay handed back the socket: its exit may have
		// armed the timer.
		if session.cancel_eviction_timer() {
			info!(target = "exthost.bridge", client = client_id, "ui reconnected within grace period");
		}
		if !self.is_live(&session) {
			return Err(Error::not_found(client_id));
		}
		Ok((session, halves))
	}

	fn on_main_disconnect(&self, session: &Arc<ClientSession>) {
		if !self.is_live(session) {
			return;
		}
		let grace = self.inner.config.reconnect_grace;
		info!(
			target = "exthost.bridge",
			client = %session.client_id,
			grace_ms = grace.as_millis() as u64,
			"ui disconnected; waiting for reconnect"
		);

		let supervisor = self.clone();
		let timed = session.clone();
		let timer = tokio::spawn(async move {
			tokio::time::sleep(grace).await;
			let previous = {
				let mut table = supervisor.inner.sessions.lock();
				if !table.remove_current(&timed) {
					return;
				}
				timed.disarm_eviction_timer();
				timed.set_state(SessionState::Closing)
			};
			info!(target = "exthost.supervisor", client = %timed.client_id, "grace period expired");
			supervisor.teardown(&timed, previous).await;
		});
		session.arm_eviction_timer(timer);
	}

	/// Tears down the client's session, if any.
	///
	/// A ready host is asked to `close` and given `finish_timeout` to answer
	/// with `finish` before it is killed. Nothing for `client_id` remains
	/// afterwards.
	pub async fn dispose_client_session(&self, client_id: &str) {
		let removed = {
			let mut table = self.inner.sessions.lock();
			table
				.remove(client_id)
				.map(|session| {
					let previous = session.set_state(SessionState::Closing);
					(session, previous)
				})
		};
		match removed {
			Some((session, previous)) => {
				info!(target = "exthost.supervisor", client = client_id, "disposing session");
				self.teardown(&session, previous).await;
			}
			None => debug!(target = "exthost.supervisor", client = client_id, "dispose: no session"),
		}
	}

	/// Tears down every session concurrently.
	pub async fn dispose_all(&self) {
		let drained: Vec<_> = {
			let mut table = self.inner.sessions.lock();
			table
				.drain()
				.into_iter()
				.map(|session| {
					let previous = session.set_state(SessionState::Closing);
					(session, previous)
				})
				.collect()
		};
		if drained.is_empty() {
			return;
		}
		info!(target = "exthost.supervisor", count = drained.len(), "disposing all sessions");
		join_all(
			drained
				.iter()
				.map(|(session, previous)| self.teardown(session, *previous)),
		)
		.await;
	}

	pub fn session_info(&self, client_id: &str) -> Option<SessionInfo> {
		self.inner.sessions.lock().get(client_id).map(|session| session.info())
	}

	/// Live client ids, oldest first.
	pub fn client_ids(&self) -> Vec<String> {
		self.inner.sessions.lock().client_ids()
	}

	/// Runs the close handshake (when the host reached ready) and releases
	/// everything. The session must already be out of the table.
	async fn teardown(&self, session: &ClientSession, previous: SessionState) {
		if previous == SessionState::Ready && session.send_control(ControlMessage::CLOSE) {
			let finish = session.finish_gate();
			let finished = tokio::time::timeout(self.inner.config.finish_timeout, async {
				tokio::select! {
					_ = finish.wait() => {}
					_ = session.exited.wait() => {}
				}
			})
			.await;
			if finished.is_err() {
				warn!(target = "exthost.supervisor", client = %session.client_id, "no finish before timeout; killing");
			}
		}
		self.release(session).await;
		session.set_state(SessionState::Closed);
	}

	async fn release(&self, session: &ClientSession) {
		session.cancel_eviction_timer();
		if session.kill() && !session.exited.is_open() {
			let reaped = tokio::time::timeout(self.inner.config.finish_timeout, session.exited.wait()).await;
			if reaped.is_err() {
				error!(target = "exthost.supervisor", client = %session.client_id, pid = ?session.pid(), "extension host not reaped after kill");
			}
		}
		session.host.lock().await.close();
		session.release_handles();
		remove_socket_file(&session.sockpath).await;
		debug!(target = "exthost.supervisor", client = %session.client_id, "session resources released");
	}

	fn live_session(&self, client_id: &str) -> Option<Arc<ClientSession>> {
		self.inner
			.sessions
			.lock()
			.get(client_id)
			.filter(|session| session.state().is_live())
	}

	fn is_live(&self, session: &ClientSession) -> bool {
		self.inner.sessions.lock().is_current(session) && session.state().is_live()
	}

	fn socket_path(&self, session_id: u64, client_id: &str) -> std::path::PathBuf {
		let safe: String = client_id
			.chars()
			.map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
			.take(32)
			.collect();
		self.inner
			.config
			.socket_dir
			.join(format!("exthost-{}-{session_id}-{safe}.sock", std::process::id()))
	}
}

async fn accept_host(session: Arc<ClientSession>, listener: UnixListener) {
	match listener.accept().await {
		Ok((stream, _)) => {
			let (read, write) = stream.into_split();
			session.host.lock().await.idle = Some((
				FrameReader::new(Box::new(read) as BoxedRead),
				FrameWriter::new(Box::new(write) as BoxedWrite),
			));
			session.host_connected.open();
			debug!(target = "exthost.bridge", client = %session.client_id, "extension host connected");
		}
		Err(err) => {
			warn!(target = "exthost.bridge", client = %session.client_id, error = %err, "accept on host socket failed");
		}
	}
}

async fn remove_socket_file(path: &std::path::Path) {
	match tokio::fs::remove_file(path).await {
		Ok(()) => {}
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
		Err(err) => {
			debug!(target = "exthost.supervisor", path = %path.display(), error = %err, "failed to remove socket file");
		}
	}
}
