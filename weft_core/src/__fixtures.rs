use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use tempfile::TempDir;

use crate::CompileOptions;
use crate::CompiledOutput;
use crate::Loader;
use crate::WeftResult;
use crate::compile;
use crate::render;

/// A temporary directory populated with template files.
pub struct TemplateDir {
	dir: TempDir,
}

impl TemplateDir {
	pub fn new(files: &[(&str, &str)]) -> Self {
		let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
		for (name, content) in files {
			let path = dir.path().join(name);
			if let Some(parent) = path.parent() {
				std::fs::create_dir_all(parent).unwrap_or_else(|e| panic!("create dir: {e}"));
			}
			std::fs::write(&path, content).unwrap_or_else(|e| panic!("write {name}: {e}"));
		}

		Self { dir }
	}

	pub fn path(&self) -> &Path {
		self.dir.path()
	}

	/// Options compiling `source` with includes resolved from the root.
	pub fn options(&self, source: &str) -> CompileOptions {
		CompileOptions::new().with_files(self.path().join(source), self.path(), self.path())
	}
}

/// Reads from the filesystem and counts reads per path.
#[derive(Debug, Default)]
pub struct CountingLoader {
	reads: Mutex<BTreeMap<PathBuf, usize>>,
}

impl CountingLoader {
	pub fn reads(&self, path: &Path) -> usize {
		let reads = self.reads.lock().unwrap_or_else(|e| panic!("lock: {e}"));
		reads.get(path).copied().unwrap_or_default()
	}
}

impl Loader for CountingLoader {
	fn load(&self, path: &Path) -> io::Result<String> {
		let mut reads = self.reads.lock().unwrap_or_else(|e| panic!("lock: {e}"));
		*reads.entry(path.to_path_buf()).or_default() += 1;
		std::fs::read_to_string(path)
	}
}

/// Options without file resolution or position tracking, for listings.
pub fn listing_options() -> CompileOptions {
	CompileOptions::new().with_debug_positions(false)
}

pub fn compile_str(input: &str) -> WeftResult<CompiledOutput> {
	compile(input, &CompileOptions::new())
}

pub fn render_str(input: &str, bindings: serde_json::Value) -> WeftResult<String> {
	render(input, bindings, &CompileOptions::new())
}

pub fn counting_options(dir: &TemplateDir, source: &str) -> (CompileOptions, Arc<CountingLoader>) {
	let loader = Arc::new(CountingLoader::default());
	let options = dir.options(source).with_loader(Arc::clone(&loader) as Arc<dyn Loader>);
	(options, loader)
}
