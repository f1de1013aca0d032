use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::CompileOptions;
use crate::DEFAULT_TOKEN_LIMIT;
use crate::WeftError;
use crate::WeftResult;

/// Supported config file locations in discovery order (highest precedence
/// first).
pub const CONFIG_FILE_CANDIDATES: [&str; 3] = ["weft.toml", ".weft.toml", ".config/weft.toml"];

/// Data source entry for a `[data]` namespace.
///
/// ```toml
/// [data]
/// site = "site.json"
/// release = { path = "release-info", format = "yaml" }
/// ```
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
#[non_exhaustive]
pub enum DataSource {
	Path(PathBuf),
	Typed { path: PathBuf, format: String },
}

impl DataSource {
	pub fn path(&self) -> &Path {
		match self {
			Self::Path(path) | Self::Typed { path, .. } => path,
		}
	}

	/// The explicit format, or the lowercased file extension.
	pub fn format(&self) -> String {
		match self {
			Self::Path(path) => {
				path.extension()
					.and_then(|extension| extension.to_str())
					.unwrap_or_default()
					.to_ascii_lowercase()
			}
			Self::Typed { format, .. } => format.trim().to_ascii_lowercase(),
		}
	}
}

/// Configuration loaded from a `weft.toml` file.
///
/// ```toml
/// source = "pages/index.weft"
/// base_dir = "."
/// includes_dir = "_includes"
/// inline_runtime = true
///
/// [data]
/// site = "site.json"
/// ```
#[derive(Debug, Deserialize)]
pub struct WeftConfig {
	/// Template compiled by default, relative to the project root.
	#[serde(default)]
	pub source: Option<PathBuf>,
	#[serde(default)]
	pub base_dir: Option<PathBuf>,
	#[serde(default)]
	pub includes_dir: Option<PathBuf>,
	#[serde(default = "default_true")]
	pub debug_positions: bool,
	#[serde(default)]
	pub inline_runtime: bool,
	#[serde(default = "default_token_limit")]
	pub token_limit: usize,
	/// Bindings namespaces read from data files.
	#[serde(default)]
	pub data: HashMap<String, DataSource>,
}

fn default_true() -> bool {
	true
}

fn default_token_limit() -> usize {
	DEFAULT_TOKEN_LIMIT
}

impl WeftConfig {
	/// Resolve the config path from known discovery candidates.
	#[must_use]
	pub fn resolve_path(root: &Path) -> Option<PathBuf> {
		CONFIG_FILE_CANDIDATES
			.iter()
			.map(|candidate| root.join(candidate))
			.find(|path| path.is_file())
	}

	/// Load the config from the first discovered config file at `root`.
	/// Returns `None` if no config file exists.
	pub fn load(root: &Path) -> WeftResult<Option<Self>> {
		let Some(config_path) = Self::resolve_path(root) else {
			return Ok(None);
		};

		let content = std::fs::read_to_string(&config_path)?;
		let config: Self = toml::from_str(&content).map_err(|e| WeftError::ConfigParse(e.to_string()))?;
		tracing::debug!(path = %config_path.display(), "loaded config");

		Ok(Some(config))
	}

	/// Compile options with every path joined to `root`. The includes
	/// directory defaults to the base directory.
	pub fn to_options(&self, root: &Path) -> CompileOptions {
		let mut options = CompileOptions::new()
			.with_debug_positions(self.debug_positions)
			.with_inline_runtime(self.inline_runtime)
			.with_token_limit(self.token_limit);

		if let Some(source) = &self.source {
			let base_dir = root.join(self.base_dir.as_deref().unwrap_or(Path::new(".")));
			let includes_dir = self
				.includes_dir
				.as_deref()
				.map_or_else(|| base_dir.clone(), |dir| root.join(dir));
			options = options.with_files(root.join(source), base_dir, includes_dir);
		}

		options
	}

	/// Read each data file into a JSON value keyed by namespace, ready to be
	/// used as render bindings.
	pub fn load_data(&self, root: &Path) -> WeftResult<BTreeMap<String, serde_json::Value>> {
		let mut data = BTreeMap::new();

		for (namespace, source) in &self.data {
			let path = source.path();
			let file = path.display().to_string();
			let content = std::fs::read_to_string(root.join(path)).map_err(|e| WeftError::DataFile {
				path: file.clone(),
				reason: e.to_string(),
			})?;

			tracing::trace!(namespace, path = %file, "loading data file");
			let value = parse_data_file(&content, &source.format(), &file)?;
			data.insert(namespace.clone(), value);
		}

		Ok(data)
	}
}

/// Parse a data file's content based on its format.
fn parse_data_file(content: &str, format: &str, path: &str) -> WeftResult<serde_json::Value> {
	let failed = |reason: String| WeftError::DataFile {
		path: path.to_string(),
		reason,
	};

	match format {
		"text" | "txt" => Ok(serde_json::Value::String(content.to_string())),
		"json" => serde_json::from_str(content).map_err(|e| failed(e.to_string())),
		"toml" => {
			let value: toml::Table = toml::from_str(content).map_err(|e| failed(e.to_string()))?;
			serde_json::to_value(value).map_err(|e| failed(e.to_string()))
		}
		"yaml" | "yml" => serde_yaml_ng::from_str(content).map_err(|e| failed(e.to_string())),
		other => Err(WeftError::UnsupportedDataFormat(other.to_string())),
	}
}
