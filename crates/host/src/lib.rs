//! Extension host runtime.
//!
//! This crate is the process the supervisor spawns. It discovers extensions
//! from `package.json` manifests, activates them on request with per-extension
//! failure isolation, and serves a small JSON RPC over the bridge socket.
//!
//! # Architecture
//!
//! - [`manifest`]: manifest parsing and directory scanning
//! - [`resolver`]: `vscode` / `sumi` virtual module tables, built once per extension
//! - [`entry`]: the entry point seam ([`ExtensionEntry`], [`EntryLoader`])
//! - [`context`]: the object handed to entry points
//! - [`activator`]: the activation state machine
//! - [`rpc`]: request/response correlation over framed JSON
//! - [`runtime`]: control channel, bridge connection, shutdown

pub mod activator;
pub mod context;
pub mod entry;
pub mod error;
pub mod manifest;
pub mod resolver;
pub mod rpc;
pub mod runtime;

pub use activator::{ActivationState, ExtensionActivator, ExtensionSnapshot};
pub use context::{BrowserServices, ComponentProxy, ExportedServices, ExtensionContext, Memento, NoBrowser, ServiceHandler};
pub use entry::{EntryKind, EntryLoader, EntryRegistry, EntryResult, ExtensionEntry, FnEntry};
pub use error::{ActivationError, EntryError, Error, Result};
pub use manifest::{ExtensionDescription, PackageManifest, scan_extension_dirs};
pub use resolver::{API_VERSION, ApiFactory, ApiTable, DefaultApiFactory, ModuleResolver, ScopedResolver, VirtualModule};
pub use rpc::{HostService, RequestHandler, RpcBrowserServices, RpcConnection, RpcMessage};
pub use runtime::HostRuntime;
