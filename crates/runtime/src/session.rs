//! Per-client session records and the session table.
//!
//! A [`ClientSession`] is shared between the supervisor and the tasks that
//! observe its process, so its mutable fields sit behind `parking_lot`
//! locks that are never held across an await. The [`SessionTable`] is the
//! only state shared between clients.

use std::path::PathBuf;
use std::sync::Arc;

use exthost_protocol::ControlMessage;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bridge::HostEndpoint;
use crate::gate::Gate;
use crate::spawner::ProcessKiller;

/// Handshake and lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
	Launching,
	AwaitingReady,
	Ready,
	Closing,
	Closed,
	Crashed,
}

impl SessionState {
	/// A process exit in this state is a crash.
	pub fn is_live(self) -> bool {
		matches!(
			self,
			SessionState::Launching | SessionState::AwaitingReady | SessionState::Ready
		)
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, SessionState::Closed | SessionState::Crashed)
	}
}

/// Snapshot of a session for callers outside the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
	pub client_id: String,
	pub session_id: u64,
	pub pid: Option<u32>,
	pub state: SessionState,
	pub inspect_port: Option<u16>,
	pub sockpath: PathBuf,
	/// No UI is attached and the grace timer is running.
	pub awaiting_reconnect: bool,
}

pub(crate) struct ClientSession {
	pub(crate) id: u64,
	pub(crate) client_id: String,
	pub(crate) sockpath: PathBuf,
	/// Start of the `ready` deadline.
	pub(crate) launched_at: Instant,
	/// Opened on `ready`.
	pub(crate) init: Gate,
	/// Opened once the extension process connected to `sockpath`.
	pub(crate) host_connected: Gate,
	/// Opened once the process has been reaped.
	pub(crate) exited: Gate,
	pub(crate) host: tokio::sync::Mutex<HostEndpoint>,
	state: Mutex<SessionState>,
	/// Re-armed on every `ready`; opened on `finish`.
	finish: Mutex<Gate>,
	pid: Mutex<Option<u32>>,
	inspect_port: Mutex<Option<u16>>,
	control_tx: Mutex<Option<mpsc::UnboundedSender<ControlMessage>>>,
	killer: Mutex<Option<ProcessKiller>>,
	eviction_timer: Mutex<Option<JoinHandle<()>>>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientSession {
	pub(crate) fn new(id: u64, client_id: &str, sockpath: PathBuf) -> Self {
		Self {
			id,
			client_id: client_id.to_string(),
			sockpath,
			launched_at: Instant::now(),
			init: Gate::new(),
			host_connected: Gate::new(),
			exited: Gate::new(),
			host: tokio::sync::Mutex::new(HostEndpoint::default()),
			state: Mutex::new(SessionState::Launching),
			finish: Mutex::new(Gate::new()),
			pid: Mutex::new(None),
			inspect_port: Mutex::new(None),
			control_tx: Mutex::new(None),
			killer: Mutex::new(None),
			eviction_timer: Mutex::new(None),
			tasks: Mutex::new(Vec::new()),
		}
	}

	pub(crate) fn info(&self) -> SessionInfo {
		SessionInfo {
			client_id: self.client_id.clone(),
			session_id: self.id,
			pid: *self.pid.lock(),
			state: self.state(),
			inspect_port: *self.inspect_port.lock(),
			sockpath: self.sockpath.clone(),
			awaiting_reconnect: self.has_eviction_timer(),
		}
	}

	pub(crate) fn state(&self) -> SessionState {
		*self.state.lock()
	}

	/// Sets the state and returns the previous one. Terminal states stick.
	pub(crate) fn set_state(&self, next: SessionState) -> SessionState {
		let mut state = self.state.lock();
		let previous = *state;
		if !previous.is_terminal() {
			*state = next;
		}
		previous
	}

	/// Moves `from -> to` atomically; false if the session was elsewhere.
	pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
		let mut state = self.state.lock();
		if *state != from {
			return false;
		}
		*state = to;
		true
	}

	/// Installs the spawned process. Hands the killer back if the session was
	/// closed while the process was starting.
	pub(crate) fn attach_process(
		&self,
		pid: Option<u32>,
		control_tx: mpsc::UnboundedSender<ControlMessage>,
		killer: ProcessKiller,
	) -> Result<(), ProcessKiller> {
		let mut state = self.state.lock();
		if *state != SessionState::Launching {
			return Err(killer);
		}
		*self.pid.lock() = pid;
		*self.control_tx.lock() = Some(control_tx);
		*self.killer.lock() = Some(killer);
		*state = SessionState::AwaitingReady;
		Ok(())
	}

	pub(crate) fn pid(&self) -> Option<u32> {
		*self.pid.lock()
	}

	pub(crate) fn set_inspect_port(&self, port: u16) {
		*self.inspect_port.lock() = Some(port);
	}

	pub(crate) fn inspect_port(&self) -> Option<u16> {
		*self.inspect_port.lock()
	}

	pub(crate) fn finish_gate(&self) -> Gate {
		self.finish.lock().clone()
	}

	pub(crate) fn rearm_finish(&self) {
		*self.finish.lock() = Gate::new();
	}

	/// Sends a control message; false if the channel is gone.
	pub(crate) fn send_control(&self, message: ControlMessage) -> bool {
		match self.control_tx.lock().as_ref() {
			Some(tx) => tx.send(message).is_ok(),
			None => false,
		}
	}

	/// Requests a kill. Returns false if no process was ever attached.
	pub(crate) fn kill(&self) -> bool {
		match self.killer.lock().as_mut() {
			Some(killer) => {
				killer.kill();
				true
			}
			None => false,
		}
	}

	pub(crate) fn track(&self, task: JoinHandle<()>) {
		self.tasks.lock().push(task);
	}

	/// Arms the grace-period timer, cancelling any previous one.
	pub(crate) fn arm_eviction_timer(&self, timer: JoinHandle<()>) {
		if let Some(previous) = self.eviction_timer.lock().replace(timer) {
			previous.abort();
		}
	}

	/// Cancels the grace-period timer. Returns true if one was armed.
	pub(crate) fn cancel_eviction_timer(&self) -> bool {
		match self.eviction_timer.lock().take() {
			Some(timer) => {
				timer.abort();
				true
			}
			None => false,
		}
	}

	/// Forgets the timer without aborting it; used by the timer task itself.
	pub(crate) fn disarm_eviction_timer(&self) {
		self.eviction_timer.lock().take();
	}

	pub(crate) fn has_eviction_timer(&self) -> bool {
		self.eviction_timer.lock().is_some()
	}

	/// Drops the control channel and aborts background tasks.
	pub(crate) fn release_handles(&self) {
		self.control_tx.lock().take();
		self.cancel_eviction_timer();
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}
}

/// Live sessions keyed by client id, in insertion order.
#[derive(Default)]
pub(crate) struct SessionTable {
	sessions: IndexMap<String, Arc<ClientSession>>,
}

impl SessionTable {
	pub(crate) fn get(&self, client_id: &str) -> Option<Arc<ClientSession>> {
		self.sessions.get(client_id).cloned()
	}

	/// True if `session` is the entry currently registered for its client.
	pub(crate) fn is_current(&self, session: &ClientSession) -> bool {
		self.sessions
			.get(&session.client_id)
			.is_some_and(|current| current.id == session.id)
	}

	/// Appends a session. The caller removes any previous entry first.
	pub(crate) fn insert(&mut self, session: Arc<ClientSession>) {
		self.sessions.insert(session.client_id.clone(), session);
	}

	pub(crate) fn remove(&mut self, client_id: &str) -> Option<Arc<ClientSession>> {
		self.sessions.shift_remove(client_id)
	}

	/// Removes `session` only if it is still the registered entry.
	pub(crate) fn remove_current(&mut self, session: &ClientSession) -> bool {
		if self.is_current(session) {
			self.sessions.shift_remove(&session.client_id);
			true
		} else {
			false
		}
	}

	/// Removes oldest sessions until at most `keep` remain.
	pub(crate) fn evict_oldest(&mut self, keep: usize) -> Vec<Arc<ClientSession>> {
		let mut evicted = Vec::new();
		while self.sessions.len() > keep {
			match self.sessions.shift_remove_index(0) {
				Some((_, session)) => evicted.push(session),
				None => break,
			}
		}
		evicted
	}

	pub(crate) fn client_ids(&self) -> Vec<String> {
		self.sessions.keys().cloned().collect()
	}

	pub(crate) fn drain(&mut self) -> Vec<Arc<ClientSession>> {
		self.sessions.drain(..).map(|(_, session)| session).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn session(id: u64, client: &str) -> Arc<ClientSession> {
		Arc::new(ClientSession::new(id, client, PathBuf::from(format!("/tmp/{client}.sock"))))
	}

	#[test]
	fn evicts_in_insertion_order() {
		let mut table = SessionTable::default();
		table.insert(session(1, "a"));
		table.insert(session(2, "b"));
		table.insert(session(3, "c"));

		let evicted = table.evict_oldest(1);
		let ids: Vec<_> = evicted.iter().map(|s| s.client_id.as_str()).collect();
		assert_eq!(ids, ["a", "b"]);
		assert_eq!(table.client_ids(), ["c"]);
	}

	#[test]
	fn reinserting_a_client_moves_it_to_the_back() {
		let mut table = SessionTable::default();
		table.insert(session(1, "a"));
		table.insert(session(2, "b"));

		table.remove("a");
		table.insert(session(3, "a"));
		assert_eq!(table.client_ids(), ["b", "a"]);
		assert_eq!(table.client_ids().len(), 2);
	}

	#[test]
	fn remove_current_ignores_stale_sessions() {
		let mut table = SessionTable::default();
		let old = session(1, "a");
		table.insert(old.clone());
		table.remove("a");
		table.insert(session(2, "a"));

		assert!(!table.remove_current(&old));
		assert_eq!(table.client_ids().len(), 1);
	}

	#[test]
	fn terminal_states_are_sticky() {
		let s = session(1, "a");
		s.set_state(SessionState::Crashed);
		assert_eq!(s.set_state(SessionState::Closed), SessionState::Crashed);
		assert_eq!(s.state(), SessionState::Crashed);
	}

	#[test]
	fn attach_process_refuses_closed_sessions() {
		let s = session(1, "a");
		s.set_state(SessionState::Closing);
		let (control_tx, _rx) = mpsc::unbounded_channel();
		let (kill_tx, _kill_rx) = tokio::sync::oneshot::channel();
		assert!(s.attach_process(Some(42), control_tx, ProcessKiller::new(kill_tx)).is_err());
		assert_eq!(s.pid(), None);
	}
}
