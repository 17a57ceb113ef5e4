//! Per-extension activation state machine.
//!
//! ```text
//! Inactive ──activate──▶ Activating ──ok──▶ Active ──shutdown──▶ Deactivated
//!                            │
//!                            └──error / panic / missing entry──▶ Failed
//! ```
//!
//! `Activating` holds a shared handle to the one in-flight activation, so
//! concurrent callers join it instead of running the entry again. The slot is
//! checked and set synchronously before the first await. `Failed` is terminal.
//!
//! The primary and extend entries fail independently: the extend entry runs
//! even when the primary one is missing or fails, and its exports are kept on
//! the failed record.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, join_all};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::{BrowserServices, ComponentProxy, ExportedServices, ExtensionContext, Memento};
use crate::entry::{EntryKind, EntryLoader, ExtensionEntry};
use crate::error::ActivationError;
use crate::manifest::ExtensionDescription;
use crate::resolver::{ModuleResolver, ScopedResolver};

type Outcome = Result<(), Arc<ActivationError>>;

/// Observable activation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivationState {
	Inactive,
	Activating,
	Active,
	Failed,
	Deactivated,
}

/// What callers outside the activator see of one extension.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSnapshot {
	pub id: String,
	pub path: std::path::PathBuf,
	pub state: ActivationState,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub exports: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub extend_exports: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

/// Results of the entries that ran. `main` and `extend` are only kept for
/// entries that activated, since those are the ones to deactivate later.
#[derive(Default)]
struct Activated {
	exports: Value,
	extend_exports: Option<Value>,
	main: Option<Arc<dyn ExtensionEntry>>,
	extend: Option<Arc<dyn ExtensionEntry>>,
}

enum Slot {
	Inactive,
	Activating(Shared<BoxFuture<'static, Outcome>>),
	Active(Arc<Activated>),
	Failed(Arc<ActivationError>, Arc<Activated>),
	Deactivated,
}

struct Record {
	description: Arc<ExtensionDescription>,
	slot: Slot,
}

/// Storage handles per extension, kept across activations of the process.
#[derive(Default)]
struct StateStore {
	by_extension: HashMap<String, (Arc<Memento>, Arc<Memento>)>,
}

/// Why one entry did not produce exports.
enum EntryFailure {
	Error(String),
	Panic(String),
}

/// Activates extensions on demand and remembers the outcome.
pub struct ExtensionActivator {
	records: Mutex<IndexMap<String, Record>>,
	/// Set under the `records` lock once shutdown begins.
	closing: AtomicBool,
	resolver: Arc<ModuleResolver>,
	loader: Arc<dyn EntryLoader>,
	browser: Arc<dyn BrowserServices>,
	services: Arc<ExportedServices>,
	storage: Mutex<StateStore>,
}

impl ExtensionActivator {
	pub fn new(
		resolver: Arc<ModuleResolver>,
		loader: Arc<dyn EntryLoader>,
		browser: Arc<dyn BrowserServices>,
	) -> Arc<Self> {
		Arc::new(Self {
			records: Mutex::new(IndexMap::new()),
			closing: AtomicBool::new(false),
			resolver,
			loader,
			browser,
			services: Arc::new(ExportedServices::default()),
			storage: Mutex::new(StateStore::default()),
		})
	}

	/// Functions extensions registered through their context.
	pub fn services(&self) -> &Arc<ExportedServices> {
		&self.services
	}

	/// Registers a discovered extension. Re-adding an id that has already
	/// left `Inactive` is ignored.
	pub fn add(&self, description: ExtensionDescription) {
		let description = Arc::new(description);
		let mut records = self.records.lock();
		if let Some(existing) = records.get(&description.id) {
			if !matches!(existing.slot, Slot::Inactive) {
				warn!(target = "exthost.host", id = %description.id, "extension already activated; ignoring re-registration");
				return;
			}
		}
		self.resolver.register(description.clone());
		records.insert(
			description.id.clone(),
			Record {
				description,
				slot: Slot::Inactive,
			},
		);
	}

	/// Activates `id`, or joins the activation already in flight.
	///
	/// The entry runs at most once per process; every caller sees the same
	/// outcome.
	pub async fn activate(self: &Arc<Self>, id: &str) -> Result<(), Arc<ActivationError>> {
		let pending = {
			let mut records = self.records.lock();
			let Some(record) = records.get_mut(id) else {
				return Err(Arc::new(ActivationError::UnknownExtension(id.to_string())));
			};
			match &record.slot {
				Slot::Active(_) => return Ok(()),
				Slot::Failed(err, _) => return Err(err.clone()),
				Slot::Deactivated => return Err(Arc::new(ActivationError::Deactivated(id.to_string()))),
				Slot::Activating(pending) => pending.clone(),
				Slot::Inactive if self.closing.load(Ordering::Acquire) => {
					return Err(Arc::new(ActivationError::Deactivated(id.to_string())));
				}
				Slot::Inactive => {
					let pending = self.start_activation(record.description.clone());
					record.slot = Slot::Activating(pending.clone());
					pending
				}
			}
		};
		pending.await
	}

	/// Spawns the activation so it completes even if every caller goes away,
	/// and records the outcome on the slot when done.
	fn start_activation(self: &Arc<Self>, description: Arc<ExtensionDescription>) -> Shared<BoxFuture<'static, Outcome>> {
		let id = description.id.clone();
		let this = self.clone();
		let task = tokio::spawn(async move {
			let started = Instant::now();
			let (activated, failure) = this.run_entries(&description).await;
			let (slot, outcome) = match failure {
				None => {
					info!(
						target = "exthost.host",
						id = %description.id,
						elapsed_ms = started.elapsed().as_millis() as u64,
						"extension activated"
					);
					(Slot::Active(activated), Ok(()))
				}
				Some(err) => {
					warn!(target = "exthost.host", id = %description.id, error = %err, "extension activation failed");
					(Slot::Failed(err.clone(), activated), Err(err))
				}
			};
			this.settle(&description.id, slot);
			outcome
		});

		let this = self.clone();
		async move {
			match task.await {
				Ok(outcome) => outcome,
				Err(err) => {
					let err = Arc::new(ActivationError::EntryPanicked {
						extension_id: id.clone(),
						message: err.to_string(),
					});
					this.settle(&id, Slot::Failed(err.clone(), Arc::default()));
					Err(err)
				}
			}
		}
		.boxed()
		.shared()
	}

	/// Replaces the slot of `id` if it is still `Activating`.
	fn settle(&self, id: &str, slot: Slot) {
		let mut records = self.records.lock();
		if let Some(record) = records.get_mut(id) {
			if matches!(record.slot, Slot::Activating(_)) {
				record.slot = slot;
			}
		}
	}

	/// Runs the primary entry, then the extend entry, each isolated from the
	/// other.
	///
	/// Returns the error that fails the extension, if any: a missing or
	/// failing primary entry. A failing extend entry is logged and leaves
	/// `extend_exports` empty.
	async fn run_entries(&self, description: &ExtensionDescription) -> (Arc<Activated>, Option<Arc<ActivationError>>) {
		let id = description.id.as_str();
		let mut failure = None;

		let main = description.manifest.main.as_ref().and_then(|entry| {
			let path = description.entry_path(entry);
			let loaded = self.loader.load(description, EntryKind::Main, &path);
			if loaded.is_none() {
				failure = Some(Arc::new(ActivationError::MissingEntry {
					extension_id: id.to_string(),
					entry: entry.clone(),
				}));
			}
			loaded
		});
		let extend = description.manifest.extend_main().and_then(|entry| {
			let path = description.entry_path(entry);
			let loaded = self.loader.load(description, EntryKind::Extend, &path);
			if loaded.is_none() {
				warn!(target = "exthost.host", id, entry, "extend entry could not be loaded");
			}
			loaded
		});

		let context = Arc::new(self.build_context(description));
		let modules = self.resolver.scoped(description);

		let mut exports = Value::Null;
		let main = match main {
			Some(entry) => match run_entry(entry.as_ref(), context.clone(), modules.clone()).await {
				Ok(value) => {
					exports = value;
					Some(entry)
				}
				Err(EntryFailure::Error(message)) => {
					failure = Some(Arc::new(ActivationError::EntryFailed {
						extension_id: id.to_string(),
						message,
					}));
					None
				}
				Err(EntryFailure::Panic(message)) => {
					failure = Some(Arc::new(ActivationError::EntryPanicked {
						extension_id: id.to_string(),
						message,
					}));
					None
				}
			},
			None => None,
		};

		let (extend, extend_exports) = match extend {
			Some(entry) => match run_entry(entry.as_ref(), context, modules).await {
				Ok(value) => (Some(entry), Some(value)),
				Err(EntryFailure::Error(message)) => {
					warn!(target = "exthost.host", id, error = %message, "extend entry failed");
					(None, None)
				}
				Err(EntryFailure::Panic(message)) => {
					warn!(target = "exthost.host", id, error = %message, "extend entry panicked");
					(None, None)
				}
			},
			None => (None, None),
		};

		let activated = Arc::new(Activated {
			exports,
			extend_exports,
			main,
			extend,
		});
		(activated, failure)
	}

	fn build_context(&self, description: &ExtensionDescription) -> ExtensionContext {
		let (global_state, workspace_state) = self
			.storage
			.lock()
			.by_extension
			.entry(description.id.clone())
			.or_default()
			.clone();
		let components = ComponentProxy::new(
			description.id.clone(),
			description.manifest.component_ids().to_vec(),
			self.browser.clone(),
		);
		ExtensionContext::new(
			description.id.clone(),
			description.path.clone(),
			global_state,
			workspace_state,
			components,
			self.services.clone(),
		)
	}

	pub fn is_activated(&self, id: &str) -> bool {
		matches!(
			self.records.lock().get(id).map(|record| &record.slot),
			Some(Slot::Active(_))
		)
	}

	pub fn state(&self, id: &str) -> Option<ActivationState> {
		self.records.lock().get(id).map(|record| slot_state(&record.slot))
	}

	pub fn get_extension(&self, id: &str) -> Option<ExtensionSnapshot> {
		self.records.lock().get(id).map(snapshot)
	}

	/// All known extensions in registration order.
	pub fn list(&self) -> Vec<ExtensionSnapshot> {
		self.records.lock().values().map(snapshot).collect()
	}

	/// Runs `deactivate` on every entry that activated.
	///
	/// Activations already in flight are awaited first; new ones are refused.
	/// Failures are logged and ignored. Afterwards no extension can be
	/// activated again.
	pub async fn deactivate_all(&self) {
		let in_flight: Vec<_> = {
			let records = self.records.lock();
			self.closing.store(true, Ordering::Release);
			records
				.values()
				.filter_map(|record| match &record.slot {
					Slot::Activating(pending) => Some(pending.clone()),
					_ => None,
				})
				.collect()
		};
		if !in_flight.is_empty() {
			debug!(target = "exthost.host", count = in_flight.len(), "waiting for in-flight activations");
			join_all(in_flight).await;
		}

		let ran: Vec<(String, Arc<Activated>)> = {
			let mut records = self.records.lock();
			records
				.iter_mut()
				.filter_map(|(id, record)| match std::mem::replace(&mut record.slot, Slot::Deactivated) {
					Slot::Active(activated) => Some((id.clone(), activated)),
					Slot::Failed(err, activated) => {
						record.slot = Slot::Failed(err, activated.clone());
						Some((id.clone(), activated))
					}
					_ => None,
				})
				.collect()
		};

		for (id, activated) in ran {
			for (kind, entry) in [(EntryKind::Extend, &activated.extend), (EntryKind::Main, &activated.main)] {
				let Some(entry) = entry else { continue };
				match stop_entry(entry.as_ref()).await {
					Ok(()) => debug!(target = "exthost.host", %id, %kind, "deactivated"),
					Err(EntryFailure::Error(message)) => {
						warn!(target = "exthost.host", %id, %kind, error = %message, "deactivate failed");
					}
					Err(EntryFailure::Panic(message)) => {
						warn!(target = "exthost.host", %id, %kind, error = %message, "deactivate panicked");
					}
				}
			}
			self.services.remove_extension(&id);
		}
	}
}

/// Runs `activate`, catching panics raised both while building the future
/// and while polling it.
async fn run_entry(
	entry: &dyn ExtensionEntry,
	context: Arc<ExtensionContext>,
	modules: ScopedResolver,
) -> Result<Value, EntryFailure> {
	let run = std::panic::catch_unwind(AssertUnwindSafe(|| entry.activate(context, modules)))
		.map_err(|panic| EntryFailure::Panic(panic_message(panic.as_ref())))?;
	match AssertUnwindSafe(run).catch_unwind().await {
		Ok(Ok(value)) => Ok(value),
		Ok(Err(err)) => Err(EntryFailure::Error(err.to_string())),
		Err(panic) => Err(EntryFailure::Panic(panic_message(panic.as_ref()))),
	}
}

async fn stop_entry(entry: &dyn ExtensionEntry) -> Result<(), EntryFailure> {
	let run = std::panic::catch_unwind(AssertUnwindSafe(|| entry.deactivate()))
		.map_err(|panic| EntryFailure::Panic(panic_message(panic.as_ref())))?;
	match AssertUnwindSafe(run).catch_unwind().await {
		Ok(Ok(())) => Ok(()),
		Ok(Err(err)) => Err(EntryFailure::Error(err.to_string())),
		Err(panic) => Err(EntryFailure::Panic(panic_message(panic.as_ref()))),
	}
}

fn slot_state(slot: &Slot) -> ActivationState {
	match slot {
		Slot::Inactive => ActivationState::Inactive,
		Slot::Activating(_) => ActivationState::Activating,
		Slot::Active(_) => ActivationState::Active,
		Slot::Failed(..) => ActivationState::Failed,
		Slot::Deactivated => ActivationState::Deactivated,
	}
}

fn snapshot(record: &Record) -> ExtensionSnapshot {
	let (exports, extend_exports, error) = match &record.slot {
		Slot::Active(activated) => (
			Some(activated.exports.clone()),
			activated.extend_exports.clone(),
			None,
		),
		Slot::Failed(err, activated) => (None, activated.extend_exports.clone(), Some(err.to_string())),
		_ => (None, None, None),
	};
	ExtensionSnapshot {
		id: record.description.id.clone(),
		path: record.description.path.clone(),
		state: slot_state(&record.slot),
		exports,
		extend_exports,
		error,
	}
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
	if let Some(message) = panic.downcast_ref::<&str>() {
		(*message).to_string()
	} else if let Some(message) = panic.downcast_ref::<String>() {
		message.clone()
	} else {
		"unknown panic".to_string()
	}
}
