//! Virtual module resolution.
//!
//! Extensions `require` two reserved module names (`vscode` and `sumi`). The
//! [`ModuleResolver`] maps the requesting file to the extension that owns it
//! (longest matching root) and hands back that extension's [`ApiTable`],
//! built at most once per (extension, module) by an [`ApiFactory`].
//!
//! The resolver is handed to entry points explicitly as a
//! [`ScopedResolver`]; nothing is installed process-wide.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::manifest::ExtensionDescription;

/// API version reported in every table's `version` entry.
pub const API_VERSION: &str = "1.68.0";

/// Reserved module names intercepted by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VirtualModule {
	Vscode,
	Sumi,
}

impl VirtualModule {
	/// Returns the virtual module for `request`, or `None` for ordinary
	/// module names. `kaitian` is the legacy name of `sumi`.
	pub fn parse(request: &str) -> Option<Self> {
		match request {
			"vscode" => Some(VirtualModule::Vscode),
			"sumi" | "kaitian" => Some(VirtualModule::Sumi),
			_ => None,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			VirtualModule::Vscode => "vscode",
			VirtualModule::Sumi => "sumi",
		}
	}
}

impl fmt::Display for VirtualModule {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The API surface one extension sees for one virtual module.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTable {
	pub extension_id: String,
	pub module: VirtualModule,
	pub surface: BTreeMap<String, Value>,
}

impl ApiTable {
	pub fn new(extension_id: impl Into<String>, module: VirtualModule) -> Self {
		Self {
			extension_id: extension_id.into(),
			module,
			surface: BTreeMap::new(),
		}
	}

	pub fn with_entry(mut self, name: impl Into<String>, value: Value) -> Self {
		self.surface.insert(name.into(), value);
		self
	}

	pub fn get(&self, name: &str) -> Option<&Value> {
		self.surface.get(name)
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.surface.keys().map(String::as_str)
	}
}

/// Builds API tables. Normally called once per successful (extension,
/// module); see [`ModuleResolver::table_for`].
pub trait ApiFactory: Send + Sync {
	fn build(&self, extension: &ExtensionDescription, module: VirtualModule) -> Result<ApiTable, String>;
}

/// Namespaces every table exposes.
const CORE_NAMESPACES: &[&str] = &[
	"commands",
	"env",
	"extensions",
	"languages",
	"window",
	"workspace",
];

/// Namespaces only the `sumi` module adds.
const SUMI_NAMESPACES: &[&str] = &["layout", "ideWindow", "toolbar", "webview"];

/// Describes the fixed API surface plus the extension's extend surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultApiFactory;

impl ApiFactory for DefaultApiFactory {
	fn build(&self, extension: &ExtensionDescription, module: VirtualModule) -> Result<ApiTable, String> {
		let mut table = ApiTable::new(&extension.id, module)
			.with_entry("version", Value::String(API_VERSION.to_string()))
			.with_entry(
				"extension",
				json!({
					"id": extension.id,
					"extensionPath": extension.path,
					"version": extension.manifest.version,
				}),
			);

		for namespace in CORE_NAMESPACES {
			table.surface.insert((*namespace).to_string(), json!({ "namespace": namespace }));
		}

		if module == VirtualModule::Sumi {
			for namespace in SUMI_NAMESPACES {
				table.surface.insert((*namespace).to_string(), json!({ "namespace": namespace }));
			}
			let components = extension.manifest.component_ids();
			if !components.is_empty() {
				table
					.surface
					.insert("componentProxy".to_string(), json!({ "componentIds": components }));
			}
		}
		Ok(table)
	}
}

type CacheKey = (String, VirtualModule);

/// Maps requesting paths to extensions and caches their API tables.
pub struct ModuleResolver {
	factory: Arc<dyn ApiFactory>,
	/// Known extension roots.
	roots: RwLock<Vec<Arc<ExtensionDescription>>>,
	cache: Mutex<HashMap<CacheKey, Arc<ApiTable>>>,
}

impl ModuleResolver {
	pub fn new(factory: Arc<dyn ApiFactory>) -> Self {
		Self {
			factory,
			roots: RwLock::new(Vec::new()),
			cache: Mutex::new(HashMap::new()),
		}
	}

	pub fn register(&self, extension: Arc<ExtensionDescription>) {
		let mut roots = self.roots.write();
		roots.retain(|known| known.id != extension.id);
		roots.push(extension);
	}

	/// The extension whose root is the longest prefix of `path`.
	///
	/// Matching is per path component, so `/ext/a-b` does not belong to
	/// `/ext/a`.
	pub fn owner_of(&self, path: &Path) -> Option<Arc<ExtensionDescription>> {
		self.roots
			.read()
			.iter()
			.filter(|extension| path.starts_with(&extension.path))
			.max_by_key(|extension| extension.path.components().count())
			.cloned()
	}

	/// Resolves `request` as seen from the file at `from`.
	///
	/// Returns `None` for ordinary module names, for files outside every known
	/// extension, and when the factory fails.
	pub fn resolve(&self, request: &str, from: &Path) -> Option<Arc<ApiTable>> {
		let module = VirtualModule::parse(request)?;
		let Some(owner) = self.owner_of(from) else {
			debug!(target = "exthost.host", request, from = %from.display(), "no extension owns requesting file");
			return None;
		};
		self.table_for(&owner, module)
	}

	/// The cached table for `extension`, building it on first use.
	///
	/// The factory runs without the cache lock held, so it may resolve other
	/// modules itself. Racing first requests may each build; the first table
	/// stored is the one every caller gets.
	pub fn table_for(&self, extension: &ExtensionDescription, module: VirtualModule) -> Option<Arc<ApiTable>> {
		let key = (extension.id.clone(), module);
		if let Some(table) = self.cache.lock().get(&key) {
			return Some(table.clone());
		}
		match self.factory.build(extension, module) {
			Ok(table) => Some(self.cache.lock().entry(key).or_insert_with(|| Arc::new(table)).clone()),
			Err(message) => {
				warn!(target = "exthost.host", extension = %extension.id, %module, error = %message, "api factory failed");
				None
			}
		}
	}

	/// A resolver bound to one extension, handed to its entry points.
	pub fn scoped(self: &Arc<Self>, extension: &ExtensionDescription) -> ScopedResolver {
		ScopedResolver {
			resolver: self.clone(),
			root: extension.path.clone(),
		}
	}
}

/// Module resolution as seen from one extension.
#[derive(Clone)]
pub struct ScopedResolver {
	resolver: Arc<ModuleResolver>,
	root: PathBuf,
}

impl ScopedResolver {
	/// Resolves `request` from the extension's root.
	pub fn require(&self, request: &str) -> Option<Arc<ApiTable>> {
		self.resolver.resolve(request, &self.root)
	}

	/// Resolves `request` from a specific file, which may belong to a nested
	/// extension.
	pub fn require_from(&self, request: &str, from: &Path) -> Option<Arc<ApiTable>> {
		self.resolver.resolve(request, from)
	}

	pub fn root(&self) -> &Path {
		&self.root
	}
}

impl fmt::Debug for ScopedResolver {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ScopedResolver").field("root", &self.root).finish()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;
	use crate::manifest::PackageManifest;

	fn extension(id: &str, path: &str) -> Arc<ExtensionDescription> {
		Arc::new(ExtensionDescription {
			id: id.to_string(),
			path: PathBuf::from(path),
			manifest: PackageManifest {
				name: id.to_string(),
				..Default::default()
			},
		})
	}

	#[derive(Default)]
	struct CountingFactory {
		builds: AtomicUsize,
		fail_for: Option<String>,
	}

	impl ApiFactory for CountingFactory {
		fn build(&self, extension: &ExtensionDescription, module: VirtualModule) -> Result<ApiTable, String> {
			self.builds.fetch_add(1, Ordering::SeqCst);
			if self.fail_for.as_deref() == Some(extension.id.as_str()) {
				return Err("boom".to_string());
			}
			Ok(ApiTable::new(&extension.id, module))
		}
	}

	#[test]
	fn longest_root_wins() {
		let resolver = ModuleResolver::new(Arc::new(DefaultApiFactory));
		resolver.register(extension("outer", "/ext/outer"));
		resolver.register(extension("inner", "/ext/outer/node_modules/inner"));
		resolver.register(extension("a", "/ext/a"));

		let owner = |p: &str| resolver.owner_of(Path::new(p)).map(|e| e.id.clone());
		assert_eq!(owner("/ext/outer/out/main.js").as_deref(), Some("outer"));
		assert_eq!(owner("/ext/outer/node_modules/inner/index.js").as_deref(), Some("inner"));
		assert_eq!(owner("/ext/a-b/index.js"), None);
		assert_eq!(owner("/elsewhere/x.js"), None);
	}

	#[test]
	fn tables_are_built_once_per_extension_and_module() {
		let factory = Arc::new(CountingFactory::default());
		let resolver = ModuleResolver::new(factory.clone());
		resolver.register(extension("a", "/ext/a"));

		let first = resolver.resolve("vscode", Path::new("/ext/a/main.js")).unwrap();
		let second = resolver.resolve("vscode", Path::new("/ext/a/lib/util.js")).unwrap();
		assert!(Arc::ptr_eq(&first, &second));
		assert_eq!(first.extension_id, "a");

		resolver.resolve("sumi", Path::new("/ext/a/main.js")).unwrap();
		resolver.resolve("kaitian", Path::new("/ext/a/main.js")).unwrap();
		assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
	}

	/// Builds `sumi` on top of the extension's `vscode` table.
	struct LayeredFactory {
		resolver: std::sync::OnceLock<std::sync::Weak<ModuleResolver>>,
	}

	impl ApiFactory for LayeredFactory {
		fn build(&self, extension: &ExtensionDescription, module: VirtualModule) -> Result<ApiTable, String> {
			if module == VirtualModule::Sumi {
				let resolver = self.resolver.get().and_then(std::sync::Weak::upgrade).ok_or("resolver gone")?;
				resolver
					.table_for(extension, VirtualModule::Vscode)
					.ok_or("vscode table missing")?;
			}
			Ok(ApiTable::new(&extension.id, module))
		}
	}

	#[test]
	fn factory_may_resolve_other_modules() {
		let factory = Arc::new(LayeredFactory {
			resolver: std::sync::OnceLock::new(),
		});
		let resolver = Arc::new(ModuleResolver::new(factory.clone()));
		let _ = factory.resolver.set(Arc::downgrade(&resolver));
		resolver.register(extension("a", "/ext/a"));

		let sumi = resolver.resolve("sumi", Path::new("/ext/a/main.js")).unwrap();
		assert_eq!(sumi.extension_id, "a");
		let vscode = resolver.resolve("vscode", Path::new("/ext/a/main.js")).unwrap();
		assert!(Arc::ptr_eq(&vscode, &resolver.resolve("vscode", Path::new("/ext/a/x.js")).unwrap()));
	}

	#[test]
	fn ordinary_modules_are_not_intercepted() {
		let factory = Arc::new(CountingFactory::default());
		let resolver = ModuleResolver::new(factory.clone());
		resolver.register(extension("a", "/ext/a"));

		assert!(resolver.resolve("path", Path::new("/ext/a/main.js")).is_none());
		assert_eq!(factory.builds.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn factory_failure_yields_nothing() {
		let factory = Arc::new(CountingFactory {
			fail_for: Some("bad".to_string()),
			..Default::default()
		});
		let resolver = ModuleResolver::new(factory);
		resolver.register(extension("bad", "/ext/bad"));
		resolver.register(extension("good", "/ext/good"));

		assert!(resolver.resolve("vscode", Path::new("/ext/bad/main.js")).is_none());
		assert!(resolver.resolve("vscode", Path::new("/ext/good/main.js")).is_some());
	}

	#[test]
	fn sumi_table_adds_extend_surface() {
		let mut manifest: PackageManifest =
			serde_json::from_str(r#"{"name":"x","extendConfig":{"browser":{"componentId":["Panel"]}}}"#).unwrap();
		manifest.version = Some("0.1.0".to_string());
		let ext = ExtensionDescription {
			id: "x".to_string(),
			path: PathBuf::from("/ext/x"),
			manifest,
		};

		let vscode = DefaultApiFactory.build(&ext, VirtualModule::Vscode).unwrap();
		let sumi = DefaultApiFactory.build(&ext, VirtualModule::Sumi).unwrap();
		assert!(vscode.get("componentProxy").is_none());
		assert!(vscode.get("layout").is_none());
		assert_eq!(sumi.get("componentProxy"), Some(&json!({ "componentIds": ["Panel"] })));
		assert!(sumi.names().any(|name| name == "commands"));
		assert_eq!(sumi.get("version"), Some(&json!(API_VERSION)));
	}
}
