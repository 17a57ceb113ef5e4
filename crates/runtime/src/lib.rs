//! Extension host supervision.
//!
//! [`ExtensionHostSupervisor`] runs one extension host process per client
//! session: it spawns the process, waits for its `ready` handshake, relays
//! framed traffic between the UI connection and the host socket, keeps the
//! process alive across short UI disconnects, and reports crashes.
//!
//! ```ignore
//! let supervisor = ExtensionHostSupervisor::new(SupervisorConfig::default())?;
//! let info = supervisor.launch("window-1").await?;
//! supervisor.wait_ready("window-1").await?;
//! supervisor.attach_main("window-1", ui_stream).await?;
//! // ...
//! supervisor.dispose_client_session("window-1").await;
//! ```

mod bridge;
pub mod config;
pub mod error;
mod gate;
pub mod inspect;
mod observer;
mod session;
pub mod spawner;
mod supervisor;

pub use config::{HostCommand, SupervisorConfig};
pub use error::{Error, Result};
pub use gate::Gate;
pub use observer::{CrashReport, SessionObserver, TracingObserver};
pub use session::{SessionInfo, SessionState};
pub use spawner::{
	CommandSpawner, ExitReport, LaunchSpec, OutputLine, OutputStream, ProcessKiller,
	ProcessSpawner, SpawnedProcess,
};
pub use supervisor::{ExtensionHostSupervisor, SupervisorBuilder};
