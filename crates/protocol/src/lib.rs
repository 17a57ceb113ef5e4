//! Wire types for the extension host supervisor.
//!
//! Everything that crosses a process or socket boundary lives here, so the
//! supervisor (`exthost-runtime`) and the spawned host (`exthost-host`) agree
//! on one definition:
//!
//! - [`control`]: out-of-band `ready` / `finish` / `close` / reporter messages
//! - [`launch`]: the argv contract of the spawned extension host process
//! - [`main_link`]: the opening exchange on a UI-side connection
//! - [`frame`]: length-prefixed framing used on both bridge endpoints
//!
//! Types in this crate carry no behaviour beyond (de)serialization and framing.

pub mod control;
pub mod frame;
pub mod launch;
pub mod main_link;

pub use control::{ControlMessage, ControlSignal, ReporterMessage, read_control, write_control};
pub use frame::{FrameError, FrameReader, FrameWriter, MAX_FRAME_LEN};
pub use launch::{AppConfig, CONTROL_FD, CONTROL_FD_ENV, HostArgs, LogLevel};
pub use main_link::{MainHello, MainReply};
