//! Extension discovery.
//!
//! An extension is a directory with a `package.json`. Only the fields the host
//! needs are parsed; everything else is kept verbatim in
//! [`PackageManifest::extra`] for the API factory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const MANIFEST_FILE: &str = "package.json";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub publisher: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub display_name: Option<String>,
	/// Primary entry point, relative to the extension root.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub main: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub activation_events: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub extend_config: Option<ExtendConfig>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

/// Secondary entry points contributed beyond `main`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendConfig {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub node: Option<ExtendEntry>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub browser: Option<BrowserExtend>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendEntry {
	pub main: String,
}

/// Browser-side contribution; its components are reachable through the
/// context's component proxy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserExtend {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub main: Option<String>,
	#[serde(default, rename = "componentId", skip_serializing_if = "Vec::is_empty")]
	pub component_ids: Vec<String>,
}

impl PackageManifest {
	/// `publisher.name`, or just `name` for unpublished extensions.
	pub fn extension_id(&self) -> String {
		match &self.publisher {
			Some(publisher) if !publisher.is_empty() => format!("{publisher}.{}", self.name),
			_ => self.name.clone(),
		}
	}

	/// Entry point of the node-side extend contribution.
	pub fn extend_main(&self) -> Option<&str> {
		self.extend_config
			.as_ref()
			.and_then(|config| config.node.as_ref())
			.map(|node| node.main.as_str())
	}

	pub fn component_ids(&self) -> &[String] {
		self.extend_config
			.as_ref()
			.and_then(|config| config.browser.as_ref())
			.map(|browser| browser.component_ids.as_slice())
			.unwrap_or_default()
	}
}

/// A discovered extension.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionDescription {
	pub id: String,
	/// Extension root directory.
	pub path: PathBuf,
	pub manifest: PackageManifest,
}

impl ExtensionDescription {
	/// Reads `<dir>/package.json`.
	pub fn from_dir(dir: &Path) -> Result<Self> {
		let manifest_path = dir.join(MANIFEST_FILE);
		let raw = std::fs::read_to_string(&manifest_path).map_err(|err| Error::Manifest {
			path: manifest_path.clone(),
			message: err.to_string(),
		})?;
		let manifest: PackageManifest = serde_json::from_str(&raw).map_err(|err| Error::Manifest {
			path: manifest_path.clone(),
			message: err.to_string(),
		})?;
		if manifest.name.trim().is_empty() {
			return Err(Error::Manifest {
				path: manifest_path,
				message: "`name` must not be empty".to_string(),
			});
		}
		Ok(Self {
			id: manifest.extension_id(),
			path: dir.to_path_buf(),
			manifest,
		})
	}

	/// Resolves an entry path declared in the manifest against the root.
	pub fn entry_path(&self, entry: &str) -> PathBuf {
		self.path.join(entry.trim_start_matches("./"))
	}
}

/// Finds extensions in each directory, one level deep.
///
/// A directory that is itself an extension is taken as-is. Unreadable
/// directories and broken manifests are logged and skipped; the first
/// extension with a given id wins.
pub fn scan_extension_dirs(dirs: &[PathBuf]) -> Vec<ExtensionDescription> {
	let mut found: Vec<ExtensionDescription> = Vec::new();
	let mut push = |extension: ExtensionDescription| {
		if found.iter().any(|existing| existing.id == extension.id) {
			warn!(target = "exthost.host", id = %extension.id, path = %extension.path.display(), "duplicate extension id; keeping the first");
		} else {
			debug!(target = "exthost.host", id = %extension.id, path = %extension.path.display(), "found extension");
			found.push(extension);
		}
	};

	for dir in dirs {
		if dir.join(MANIFEST_FILE).is_file() {
			match ExtensionDescription::from_dir(dir) {
				Ok(extension) => push(extension),
				Err(err) => warn!(target = "exthost.host", error = %err, "skipping extension"),
			}
			continue;
		}

		let entries = match std::fs::read_dir(dir) {
			Ok(entries) => entries,
			Err(err) => {
				warn!(target = "exthost.host", dir = %dir.display(), error = %err, "cannot read extension directory");
				continue;
			}
		};
		let mut children: Vec<PathBuf> = entries
			.filter_map(|entry| entry.ok().map(|entry| entry.path()))
			.filter(|path| path.join(MANIFEST_FILE).is_file())
			.collect();
		children.sort();

		for child in children {
			match ExtensionDescription::from_dir(&child) {
				Ok(extension) => push(extension),
				Err(err) => warn!(target = "exthost.host", error = %err, "skipping extension"),
			}
		}
	}
	found
}

#[cfg(test)]
mod tests {
	use super::*;

	fn write_manifest(dir: &Path, json: &str) {
		std::fs::create_dir_all(dir).unwrap();
		std::fs::write(dir.join(MANIFEST_FILE), json).unwrap();
	}

	#[test]
	fn parses_extend_config() {
		let manifest: PackageManifest = serde_json::from_str(
			r#"{
				"name": "todo",
				"publisher": "acme",
				"version": "1.2.0",
				"main": "./out/extension.js",
				"activationEvents": ["*"],
				"extendConfig": {
					"node": { "main": "./out/node/index.js" },
					"browser": { "main": "./out/browser/index.js", "componentId": ["TodoView"] }
				},
				"contributes": { "commands": [] }
			}"#,
		)
		.unwrap();

		assert_eq!(manifest.extension_id(), "acme.todo");
		assert_eq!(manifest.extend_main(), Some("./out/node/index.js"));
		assert_eq!(manifest.component_ids(), ["TodoView"]);
		assert!(manifest.extra.contains_key("contributes"));
	}

	#[test]
	fn unpublished_extension_uses_name() {
		let manifest: PackageManifest = serde_json::from_str(r#"{"name": "local"}"#).unwrap();
		assert_eq!(manifest.extension_id(), "local");
		assert!(manifest.component_ids().is_empty());
		assert_eq!(manifest.extend_main(), None);
	}

	#[test]
	fn scans_children_and_skips_broken_manifests() {
		let root = tempfile::tempdir().unwrap();
		write_manifest(&root.path().join("b-ext"), r#"{"name": "b", "publisher": "p"}"#);
		write_manifest(&root.path().join("a-ext"), r#"{"name": "a", "publisher": "p"}"#);
		write_manifest(&root.path().join("broken"), "{ not json");
		write_manifest(&root.path().join("dup"), r#"{"name": "a", "publisher": "p"}"#);
		std::fs::create_dir_all(root.path().join("no-manifest")).unwrap();

		let found = scan_extension_dirs(&[root.path().to_path_buf()]);
		let ids: Vec<_> = found.iter().map(|e| e.id.as_str()).collect();
		assert_eq!(ids, ["p.a", "p.b"]);
		assert_eq!(found[0].path, root.path().join("a-ext"));
	}

	#[test]
	fn entry_paths_are_relative_to_the_root() {
		let root = tempfile::tempdir().unwrap();
		write_manifest(root.path(), r#"{"name": "x", "main": "./out/main.js"}"#);
		let extension = ExtensionDescription::from_dir(root.path()).unwrap();
		assert_eq!(extension.entry_path("./out/main.js"), root.path().join("out/main.js"));
	}
}
