//! Extension entry points.
//!
//! A manifest names its entries by path (`main`, `extendConfig.node.main`);
//! an [`EntryLoader`] turns those into callable [`ExtensionEntry`] values.
//! [`EntryRegistry`] is the built-in loader: entries are registered up front
//! by extension id.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;

use crate::context::ExtensionContext;
use crate::error::EntryError;
use crate::manifest::ExtensionDescription;
use crate::resolver::ScopedResolver;

/// What an entry's `activate` produces: the extension's exports.
pub type EntryResult = std::result::Result<Value, EntryError>;

pub trait ExtensionEntry: Send + Sync {
	fn activate(&self, context: Arc<ExtensionContext>, modules: ScopedResolver) -> BoxFuture<'static, EntryResult>;

	fn deactivate(&self) -> BoxFuture<'static, std::result::Result<(), EntryError>> {
		Box::pin(async { Ok(()) })
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
	/// The manifest's `main`.
	Main,
	/// The manifest's `extendConfig.node.main`.
	Extend,
}

impl fmt::Display for EntryKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			EntryKind::Main => f.write_str("main"),
			EntryKind::Extend => f.write_str("extend"),
		}
	}
}

pub trait EntryLoader: Send + Sync {
	/// Returns the entry at `path`, or `None` if it cannot be provided.
	fn load(&self, extension: &ExtensionDescription, kind: EntryKind, path: &Path) -> Option<Arc<dyn ExtensionEntry>>;
}

/// Entries registered in-process, keyed by extension id and kind.
#[derive(Default)]
pub struct EntryRegistry {
	entries: RwLock<HashMap<(String, EntryKind), Arc<dyn ExtensionEntry>>>,
}

impl EntryRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, extension_id: impl Into<String>, kind: EntryKind, entry: Arc<dyn ExtensionEntry>) {
		self.entries.write().insert((extension_id.into(), kind), entry);
	}

	pub fn contains(&self, extension_id: &str, kind: EntryKind) -> bool {
		self.entries.read().contains_key(&(extension_id.to_string(), kind))
	}
}

impl EntryLoader for EntryRegistry {
	fn load(&self, extension: &ExtensionDescription, kind: EntryKind, _path: &Path) -> Option<Arc<dyn ExtensionEntry>> {
		self.entries.read().get(&(extension.id.clone(), kind)).cloned()
	}
}

/// Adapts a closure into an [`ExtensionEntry`] with a no-op `deactivate`.
pub struct FnEntry<F> {
	activate: F,
}

impl<F, Fut> FnEntry<F>
where
	F: Fn(Arc<ExtensionContext>, ScopedResolver) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = EntryResult> + Send + 'static,
{
	pub fn new(activate: F) -> Arc<Self> {
		Arc::new(Self { activate })
	}
}

impl<F, Fut> ExtensionEntry for FnEntry<F>
where
	F: Fn(Arc<ExtensionContext>, ScopedResolver) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = EntryResult> + Send + 'static,
{
	fn activate(&self, context: Arc<ExtensionContext>, modules: ScopedResolver) -> BoxFuture<'static, EntryResult> {
		Box::pin((self.activate)(context, modules))
	}
}
