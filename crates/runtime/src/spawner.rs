//! Starting extension host processes.
//!
//! The supervisor never touches `tokio::process` directly; it asks a
//! [`ProcessSpawner`] for a [`SpawnedProcess`], which bundles the channels the
//! supervisor observes (control messages, output lines, exit) and a
//! [`ProcessKiller`]. [`CommandSpawner`] is the real implementation; tests
//! substitute scripted processes.

use std::fmt;
use std::future::Future;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use exthost_protocol::{
	CONTROL_FD, CONTROL_FD_ENV, ControlMessage, HostArgs, read_control, write_control,
};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::HostCommand;
use crate::error::{Error, Result};

/// Everything needed to start one extension host.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
	pub client_id: String,
	pub args: HostArgs,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExitReport {
	pub code: Option<i32>,
	pub signal: Option<i32>,
}

impl ExitReport {
	pub fn from_status(status: ExitStatus) -> Self {
		Self {
			code: status.code(),
			signal: status.signal(),
		}
	}

	pub fn code(code: i32) -> Self {
		Self {
			code: Some(code),
			signal: None,
		}
	}

	pub fn signal(signal: i32) -> Self {
		Self {
			code: None,
			signal: Some(signal),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
	Stdout,
	Stderr,
}

impl fmt::Display for OutputStream {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			OutputStream::Stdout => f.write_str("stdout"),
			OutputStream::Stderr => f.write_str("stderr"),
		}
	}
}

/// One line of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
	pub stream: OutputStream,
	pub line: String,
}

/// Requests termination of a spawned process (and its process group).
#[derive(Debug)]
pub struct ProcessKiller {
	tx: Option<oneshot::Sender<()>>,
}

impl ProcessKiller {
	pub fn new(tx: oneshot::Sender<()>) -> Self {
		Self { tx: Some(tx) }
	}

	/// Returns false if a kill was already requested or the process is gone.
	pub fn kill(&mut self) -> bool {
		match self.tx.take() {
			Some(tx) => tx.send(()).is_ok(),
			None => false,
		}
	}
}

/// Channels attached to a freshly started process.
///
/// `exit` resolves exactly once, after the process has been reaped.
#[derive(Debug)]
pub struct SpawnedProcess {
	pub pid: Option<u32>,
	pub control_tx: mpsc::UnboundedSender<ControlMessage>,
	pub control_rx: mpsc::UnboundedReceiver<ControlMessage>,
	pub output_rx: mpsc::UnboundedReceiver<OutputLine>,
	pub exit: oneshot::Receiver<ExitReport>,
	pub killer: ProcessKiller,
}

/// Starts extension host processes.
pub trait ProcessSpawner: Send + Sync {
	fn spawn(
		&self,
		spec: LaunchSpec,
	) -> Pin<Box<dyn Future<Output = Result<SpawnedProcess>> + Send + '_>>;
}

/// Spawns the configured host command as a real OS process.
///
/// The child runs in its own process group so teardown can kill the whole
/// tree. Its control channel is one end of a socket pair installed at
/// descriptor [`CONTROL_FD`].
#[derive(Debug, Clone)]
pub struct CommandSpawner {
	command: HostCommand,
}

impl CommandSpawner {
	pub fn new(command: HostCommand) -> Self {
		Self { command }
	}

	async fn spawn_process(&self, spec: LaunchSpec) -> Result<SpawnedProcess> {
		let (parent_end, child_end) = std::os::unix::net::UnixStream::pair()?;
		let child_fd = child_end.as_raw_fd();

		let mut cmd = Command::new(&self.command.program);
		cmd.args(&self.command.args)
			.args(spec.args.to_args()?)
			.env(CONTROL_FD_ENV, CONTROL_FD.to_string())
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.process_group(0);

		// SAFETY: only async-signal-safe libc calls run between fork and exec.
		unsafe {
			cmd.pre_exec(move || install_control_fd(child_fd));
		}

		let mut child = cmd
			.spawn()
			.map_err(|e| Error::LaunchFailed(format!("Failed to spawn process: {e}")))?;
		drop(child_end);

		let pid = child.id();
		debug!(target = "exthost.supervisor", client = %spec.client_id, ?pid, "spawned extension host");

		let (output_tx, output_rx) = mpsc::unbounded_channel();
		if let Some(stdout) = child.stdout.take() {
			tokio::spawn(forward_lines(stdout, OutputStream::Stdout, output_tx.clone()));
		}
		if let Some(stderr) = child.stderr.take() {
			tokio::spawn(forward_lines(stderr, OutputStream::Stderr, output_tx));
		}

		parent_end.set_nonblocking(true)?;
		let control = tokio::net::UnixStream::from_std(parent_end)?;
		let (control_read, mut control_write) = control.into_split();

		let (inbound_tx, control_rx) = mpsc::unbounded_channel();
		let client_id = spec.client_id.clone();
		tokio::spawn(async move {
			let mut reader = BufReader::new(control_read);
			loop {
				match read_control(&mut reader).await {
					Ok(Some(message)) => {
						if inbound_tx.send(message).is_err() {
							break;
						}
					}
					Ok(None) => break,
					Err(err) => {
						warn!(target = "exthost.supervisor", client = %client_id, error = %err, "bad control message");
					}
				}
			}
		});

		let (control_tx, mut outbound_rx) = mpsc::unbounded_channel::<ControlMessage>();
		tokio::spawn(async move {
			while let Some(message) = outbound_rx.recv().await {
				if write_control(&mut control_write, &message).await.is_err() {
					break;
				}
			}
		});

		let (exit_tx, exit) = oneshot::channel();
		let (kill_tx, kill_rx) = oneshot::channel::<()>();
		tokio::spawn(async move {
			let status = tokio::select! {
				status = child.wait() => status,
				Ok(()) = kill_rx => {
					if let Some(pid) = pid {
						kill_process_group(pid);
					}
					let _ = child.start_kill();
					child.wait().await
				}
			};
			let report = match status {
				Ok(status) => ExitReport::from_status(status),
				Err(err) => {
					warn!(target = "exthost.supervisor", error = %err, "failed to reap extension host");
					ExitReport::default()
				}
			};
			let _ = exit_tx.send(report);
		});

		Ok(SpawnedProcess {
			pid,
			control_tx,
			control_rx,
			output_rx,
			exit,
			killer: ProcessKiller::new(kill_tx),
		})
	}
}

impl ProcessSpawner for CommandSpawner {
	fn spawn(
		&self,
		spec: LaunchSpec,
	) -> Pin<Box<dyn Future<Output = Result<SpawnedProcess>> + Send + '_>> {
		Box::pin(self.spawn_process(spec))
	}
}

fn install_control_fd(fd: RawFd) -> std::io::Result<()> {
	// dup2 onto the same descriptor keeps FD_CLOEXEC, so clear it by hand.
	if fd == CONTROL_FD {
		let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
		if flags == -1 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } == -1 {
			return Err(std::io::Error::last_os_error());
		}
		return Ok(());
	}
	if unsafe { libc::dup2(fd, CONTROL_FD) } == -1 {
		return Err(std::io::Error::last_os_error());
	}
	Ok(())
}

fn kill_process_group(pid: u32) {
	let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
	if result == -1 {
		debug!(
			target = "exthost.supervisor",
			pid,
			error = %std::io::Error::last_os_error(),
			"killpg failed"
		);
	}
}

async fn forward_lines<R>(stream: R, kind: OutputStream, tx: mpsc::UnboundedSender<OutputLine>)
where
	R: AsyncRead + Unpin,
{
	let mut lines = BufReader::new(stream).lines();
	while let Ok(Some(line)) = lines.next_line().await {
		if tx.send(OutputLine { stream: kind, line }).is_err() {
			break;
		}
	}
}
