//! The spawned extension host process.
//!
//! Lifecycle:
//!
//! ```text
//! open control fd ─▶ scan extensions ─▶ connect sockpath ─▶ send "ready"
//!        ─▶ serve rpc ... ─▶ "close" (or control EOF) ─▶ deactivate ─▶ send "finish"
//! ```

use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use exthost_protocol::{CONTROL_FD, CONTROL_FD_ENV, ControlMessage, ControlSignal, HostArgs, read_control, write_control};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::activator::ExtensionActivator;
use crate::entry::{EntryLoader, EntryRegistry};
use crate::error::{Error, Result};
use crate::manifest::scan_extension_dirs;
use crate::resolver::{ApiFactory, DefaultApiFactory, ModuleResolver};
use crate::rpc::{HostService, RpcBrowserServices, RpcConnection};

/// Contents of the `--preload` file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Preload {
	#[serde(default)]
	extension_dirs: Vec<PathBuf>,
}

pub struct HostRuntime {
	args: HostArgs,
	loader: Arc<dyn EntryLoader>,
	api_factory: Arc<dyn ApiFactory>,
}

impl HostRuntime {
	pub fn new(args: HostArgs) -> Self {
		Self {
			args,
			loader: Arc::new(EntryRegistry::new()),
			api_factory: Arc::new(DefaultApiFactory),
		}
	}

	pub fn with_loader(mut self, loader: Arc<dyn EntryLoader>) -> Self {
		self.loader = loader;
		self
	}

	pub fn with_api_factory(mut self, factory: Arc<dyn ApiFactory>) -> Self {
		self.api_factory = factory;
		self
	}

	/// Runs on the control channel inherited from the supervisor.
	pub async fn run(self) -> Result<()> {
		let control = open_control_channel()?;
		self.serve(control).await
	}

	/// Runs the host until the supervisor sends `close` or the control
	/// channel ends.
	pub async fn serve<C>(self, control: C) -> Result<()>
	where
		C: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (control_read, mut control_write) = tokio::io::split(control);
		let mut control_read = BufReader::new(control_read);

		let extension_dirs = self.extension_dirs().await;
		let extensions = scan_extension_dirs(&extension_dirs);
		info!(target = "exthost.host", count = extensions.len(), "extensions discovered");

		let _inspector = match self.args.inspect {
			Some(port) => match start_inspector(port, extensions.len()).await {
				Ok(guard) => Some(guard),
				Err(err) => {
					warn!(target = "exthost.host", port, error = %err, "inspector unavailable; continuing without it");
					None
				}
			},
			None => None,
		};

		let bridge = UnixStream::connect(&self.args.sockpath).await?;
		let (bridge_read, bridge_write) = bridge.into_split();
		debug!(target = "exthost.host", sockpath = %self.args.sockpath.display(), "connected to bridge");

		let connection = RpcConnection::new();
		let resolver = Arc::new(ModuleResolver::new(self.api_factory.clone()));
		let activator = ExtensionActivator::new(
			resolver,
			self.loader.clone(),
			Arc::new(RpcBrowserServices::new(connection.clone())),
		);
		for extension in extensions {
			activator.add(extension);
		}

		let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlMessage>();
		let control_writer = tokio::spawn(async move {
			while let Some(message) = control_rx.recv().await {
				if let Err(err) = write_control(&mut control_write, &message).await {
					warn!(target = "exthost.host", error = %err, "control write failed");
					break;
				}
			}
			let _ = control_write.shutdown().await;
		});

		let service = HostService::new(activator.clone()).with_reporter(control_tx.clone());
		let rpc = {
			let connection = connection.clone();
			tokio::spawn(async move { connection.run(bridge_read, bridge_write, Arc::new(service)).await })
		};

		let _ = control_tx.send(ControlMessage::READY);
		info!(target = "exthost.host", pid = std::process::id(), "extension host ready");

		loop {
			match read_control(&mut control_read).await {
				Ok(Some(message)) if message.signal() == Some(ControlSignal::Close) => {
					info!(target = "exthost.host", "close requested");
					break;
				}
				Ok(Some(message)) => debug!(target = "exthost.host", ?message, "ignoring control message"),
				Ok(None) => {
					info!(target = "exthost.host", "control channel closed");
					break;
				}
				Err(err) => {
					warn!(target = "exthost.host", error = %err, "control channel failed");
					break;
				}
			}
		}

		activator.deactivate_all().await;
		let _ = control_tx.send(ControlMessage::FINISH);
		drop(control_tx);
		let _ = control_writer.await;
		rpc.abort();
		Ok(())
	}

	/// `extensionDirs` from `--app-config` followed by those in the preload
	/// file.
	async fn extension_dirs(&self) -> Vec<PathBuf> {
		let mut dirs = self.args.app_config.extension_dirs.clone();
		let Some(path) = &self.args.preload else {
			return dirs;
		};
		match tokio::fs::read_to_string(path).await {
			Ok(raw) => match serde_json::from_str::<Preload>(&raw) {
				Ok(preload) => dirs.extend(preload.extension_dirs),
				Err(err) => warn!(target = "exthost.host", path = %path.display(), error = %err, "invalid preload file"),
			},
			Err(err) => warn!(target = "exthost.host", path = %path.display(), error = %err, "cannot read preload file"),
		}
		dirs
	}
}

/// Adopts the control socket the supervisor left at `EXTHOST_CONTROL_FD`.
fn open_control_channel() -> Result<UnixStream> {
	let fd: RawFd = match std::env::var(CONTROL_FD_ENV) {
		Ok(raw) => raw
			.parse()
			.map_err(|_| Error::ControlChannel(format!("{CONTROL_FD_ENV}={raw} is not a descriptor")))?,
		Err(_) => CONTROL_FD,
	};

	if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
		return Err(Error::ControlChannel(format!("descriptor {fd} is not open")));
	}
	// SAFETY: the descriptor is open and nothing else in this process owns it.
	let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
	stream.set_nonblocking(true)?;
	Ok(UnixStream::from_std(stream)?)
}

/// Serves a one-shot JSON status document on loopback and announces it the
/// way a debugger would, so the supervisor can discover the port.
async fn start_inspector(port: u16, extension_count: usize) -> Result<InspectorGuard> {
	let listener = TcpListener::bind(("127.0.0.1", port)).await?;
	let port = listener.local_addr()?.port();
	eprintln!("Debugger listening on tcp://127.0.0.1:{port}/status");

	let task = tokio::spawn(async move {
		loop {
			let Ok((mut stream, _)) = listener.accept().await else {
				break;
			};
			let body = json!({
				"pid": std::process::id(),
				"extensions": extension_count,
			})
			.to_string();
			let _ = stream.write_all(body.as_bytes()).await;
			let _ = stream.shutdown().await;
		}
	});
	Ok(InspectorGuard(task))
}

struct InspectorGuard(tokio::task::JoinHandle<()>);

impl Drop for InspectorGuard {
	fn drop(&mut self) {
		self.0.abort();
	}
}
