//! The context object handed to an extension's entry points.
//!
//! Built once per activation and shared by the main and extend entries. Its
//! fields cannot be replaced after construction; the storage handles and the
//! service registry are the only mutable parts.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::error::{EntryError, Error, Result};

/// Key-value storage scoped to one extension.
#[derive(Debug, Default)]
pub struct Memento {
	values: Mutex<Map<String, Value>>,
}

impl Memento {
	pub fn get(&self, key: &str) -> Option<Value> {
		self.values.lock().get(key).cloned()
	}

	/// Stores `value`; `null` removes the key.
	pub fn update(&self, key: impl Into<String>, value: Value) {
		let key = key.into();
		let mut values = self.values.lock();
		if value.is_null() {
			values.remove(&key);
		} else {
			values.insert(key, value);
		}
	}

	pub fn keys(&self) -> Vec<String> {
		self.values.lock().keys().cloned().collect()
	}
}

/// Browser-side services an extension's components are reached through.
pub trait BrowserServices: Send + Sync {
	fn invoke(
		&self,
		extension_id: &str,
		component_id: &str,
		method: &str,
		args: Value,
	) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>>;
}

/// Used when no browser is attached; every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBrowser;

impl BrowserServices for NoBrowser {
	fn invoke(
		&self,
		_extension_id: &str,
		_component_id: &str,
		_method: &str,
		_args: Value,
	) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>> {
		Box::pin(async { Err(Error::ChannelClosed) })
	}
}

/// Calls into the extension's own browser components.
#[derive(Clone)]
pub struct ComponentProxy {
	extension_id: String,
	component_ids: Vec<String>,
	services: Arc<dyn BrowserServices>,
}

impl ComponentProxy {
	pub fn new(extension_id: impl Into<String>, component_ids: Vec<String>, services: Arc<dyn BrowserServices>) -> Self {
		Self {
			extension_id: extension_id.into(),
			component_ids,
			services,
		}
	}

	pub fn component_ids(&self) -> &[String] {
		&self.component_ids
	}

	pub async fn invoke(&self, component_id: &str, method: &str, args: Value) -> Result<Value> {
		if !self.component_ids.iter().any(|id| id == component_id) {
			return Err(Error::UnknownComponent {
				extension_id: self.extension_id.clone(),
				component_id: component_id.to_string(),
			});
		}
		self.services
			.invoke(&self.extension_id, component_id, method, args)
			.await
	}
}

/// Handler for a function an extension exposes as a service.
pub type ServiceHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, EntryError>> + Send + Sync>;

/// Functions extensions expose to the UI side, keyed by extension and name.
#[derive(Default)]
pub struct ExportedServices {
	handlers: RwLock<HashMap<(String, String), ServiceHandler>>,
}

impl ExportedServices {
	pub fn register(&self, extension_id: &str, name: impl Into<String>, handler: ServiceHandler) {
		self.handlers
			.write()
			.insert((extension_id.to_string(), name.into()), handler);
	}

	pub async fn invoke(&self, extension_id: &str, name: &str, args: Value) -> Result<Value> {
		let handler = self
			.handlers
			.read()
			.get(&(extension_id.to_string(), name.to_string()))
			.cloned()
			.ok_or_else(|| Error::UnknownService {
				extension_id: extension_id.to_string(),
				name: name.to_string(),
			})?;
		handler(args).await.map_err(|err| Error::Extension(err.to_string()))
	}

	pub fn names(&self, extension_id: &str) -> Vec<String> {
		let mut names: Vec<String> = self
			.handlers
			.read()
			.keys()
			.filter(|(owner, _)| owner == extension_id)
			.map(|(_, name)| name.clone())
			.collect();
		names.sort();
		names
	}

	/// Drops every handler the extension registered.
	pub fn remove_extension(&self, extension_id: &str) {
		self.handlers.write().retain(|(owner, _), _| owner != extension_id);
	}
}

pub struct ExtensionContext {
	extension_id: String,
	extension_path: PathBuf,
	global_state: Arc<Memento>,
	workspace_state: Arc<Memento>,
	components: ComponentProxy,
	services: Arc<ExportedServices>,
}

impl ExtensionContext {
	pub(crate) fn new(
		extension_id: String,
		extension_path: PathBuf,
		global_state: Arc<Memento>,
		workspace_state: Arc<Memento>,
		components: ComponentProxy,
		services: Arc<ExportedServices>,
	) -> Self {
		Self {
			extension_id,
			extension_path,
			global_state,
			workspace_state,
			components,
			services,
		}
	}

	pub fn extension_id(&self) -> &str {
		&self.extension_id
	}

	pub fn extension_path(&self) -> &Path {
		&self.extension_path
	}

	/// `extensionPath` joined with `relative`.
	pub fn as_absolute_path(&self, relative: &str) -> PathBuf {
		self.extension_path.join(relative)
	}

	pub fn global_state(&self) -> &Memento {
		&self.global_state
	}

	pub fn workspace_state(&self) -> &Memento {
		&self.workspace_state
	}

	pub fn components(&self) -> &ComponentProxy {
		&self.components
	}

	/// Exposes `handler` to the UI side as `name`.
	pub fn register_service(&self, name: impl Into<String>, handler: ServiceHandler) {
		self.services.register(&self.extension_id, name, handler);
	}
}
