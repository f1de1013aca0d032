use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use minijinja::Value;
use serde::Serialize;

use crate::DEFAULT_CONTEXT_RADIUS;
use crate::DEFAULT_TOKEN_LIMIT;
use crate::DependencyTree;
use crate::FileMap;
use crate::FilterRegistry;
use crate::FsLoader;
use crate::Loader;
use crate::Program;
use crate::ResolveOptions;
use crate::Runtime;
use crate::SourceContext;
use crate::TagRegistry;
use crate::Template;
use crate::Warning;
use crate::WeftError;
use crate::WeftResult;
use crate::compiler::CompileState;
use crate::generate;
use crate::preprocess;
use crate::tokenize;
use crate::tokens::TagToken;

/// Options for a single compile.
#[derive(Clone)]
pub struct CompileOptions {
	/// The file the template text belongs to. Required, together with
	/// `base_dir` and `includes_dir`, to resolve `include` and `extends`.
	pub source_file: Option<PathBuf>,
	/// File ids in positions and errors are relative to this directory.
	pub base_dir: Option<PathBuf>,
	/// Directory `include` paths are resolved against.
	pub includes_dir: Option<PathBuf>,
	/// Emit a position before the output of every token so runtime errors
	/// point at the template line.
	pub debug_positions: bool,
	/// Bundle the filters used by the template with the executable.
	pub inline_runtime: bool,
	/// Stop after generating the program.
	pub intermediate_only: bool,
	/// Filters added to the built-in ones.
	pub filters: FilterRegistry,
	/// Tags added to the built-in ones.
	pub tags: TagRegistry,
	pub token_limit: usize,
	pub loader: Arc<dyn Loader>,
}

impl Default for CompileOptions {
	fn default() -> Self {
		Self {
			source_file: None,
			base_dir: None,
			includes_dir: None,
			debug_positions: true,
			inline_runtime: false,
			intermediate_only: false,
			filters: FilterRegistry::new(),
			tags: TagRegistry::new(),
			token_limit: DEFAULT_TOKEN_LIMIT,
			loader: Arc::new(FsLoader),
		}
	}
}

impl fmt::Debug for CompileOptions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CompileOptions")
			.field("source_file", &self.source_file)
			.field("base_dir", &self.base_dir)
			.field("includes_dir", &self.includes_dir)
			.field("debug_positions", &self.debug_positions)
			.field("inline_runtime", &self.inline_runtime)
			.field("intermediate_only", &self.intermediate_only)
			.field("filters", &self.filters)
			.field("tags", &self.tags)
			.field("token_limit", &self.token_limit)
			.finish_non_exhaustive()
	}
}

impl CompileOptions {
	pub fn new() -> Self {
		Self::default()
	}

	/// Set `source_file`, `base_dir` and `includes_dir` at once.
	pub fn with_files(
		mut self,
		source_file: impl Into<PathBuf>,
		base_dir: impl Into<PathBuf>,
		includes_dir: impl Into<PathBuf>,
	) -> Self {
		self.source_file = Some(source_file.into());
		self.base_dir = Some(base_dir.into());
		self.includes_dir = Some(includes_dir.into());
		self
	}

	pub fn with_debug_positions(mut self, debug_positions: bool) -> Self {
		self.debug_positions = debug_positions;
		self
	}

	pub fn with_inline_runtime(mut self, inline_runtime: bool) -> Self {
		self.inline_runtime = inline_runtime;
		self
	}

	pub fn with_intermediate_only(mut self, intermediate_only: bool) -> Self {
		self.intermediate_only = intermediate_only;
		self
	}

	pub fn with_token_limit(mut self, token_limit: usize) -> Self {
		self.token_limit = token_limit;
		self
	}

	pub fn with_loader(mut self, loader: Arc<dyn Loader>) -> Self {
		self.loader = loader;
		self
	}

	pub fn with_filter<F>(mut self, name: impl Into<String>, filter: F) -> Self
	where
		F: Fn(Value, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
	{
		self.filters.insert(name, filter);
		self
	}

	pub fn with_tag<F>(mut self, name: impl Into<String>, handler: F) -> Self
	where
		F: Fn(&mut CompileState<'_>, &TagToken) -> WeftResult<()> + Send + Sync + 'static,
	{
		self.tags.insert(name, handler);
		self
	}

	/// The file options, validated. `None` when none of them is set.
	fn resolve_paths(&self) -> WeftResult<Option<ResolveOptions<'_>>> {
		let options = [
			("source_file", self.source_file.as_deref()),
			("base_dir", self.base_dir.as_deref()),
			("includes_dir", self.includes_dir.as_deref()),
		];

		if options.iter().all(|(_, path)| path.is_none()) {
			return Ok(None);
		}

		if let Some((option, _)) = options.iter().find(|(_, path)| path.is_none()) {
			return Err(WeftError::InvalidOption {
				option: option.to_string(),
				reason: "`source_file`, `base_dir` and `includes_dir` are required together".to_string(),
			});
		}

		for (option, path) in options {
			if let Some(path) = path.filter(|path| !self.loader.exists(path)) {
				return Err(WeftError::InvalidOption {
					option: option.to_string(),
					reason: format!("`{}` does not exist", path.display()),
				});
			}
		}

		match options {
			[(_, Some(source_file)), (_, Some(base_dir)), (_, Some(includes_dir))] => {
				Ok(Some(ResolveOptions {
					source_file,
					base_dir,
					includes_dir,
				}))
			}
			_ => Ok(None),
		}
	}

	/// The runtime used by [`render`] when nothing was inlined.
	pub fn runtime(&self) -> Runtime {
		Runtime::with_filters(&self.filters)
	}
}

/// Everything a compile produces.
#[derive(Debug, Clone)]
pub struct CompiledOutput {
	/// Text listing of the program.
	pub code: String,
	pub program: Arc<Program>,
	/// The executable, absent with `intermediate_only`.
	pub template: Option<Template>,
	/// Base names of the variables the template reads from its bindings.
	pub locals: BTreeSet<String>,
	/// Full access paths of those variables, such as `user.name`.
	pub locals_full: BTreeSet<String>,
	pub warnings: Vec<Warning>,
	/// Every file the template pulls in.
	pub dependencies: BTreeSet<String>,
	pub dependency_tree: DependencyTree,
	pub file_map: Arc<FileMap>,
}

impl CompiledOutput {
	pub fn has_warnings(&self) -> bool {
		!self.warnings.is_empty()
	}
}

/// Compile template text.
#[tracing::instrument(level = "debug", skip_all, fields(source_file = ?options.source_file))]
pub fn compile(input: &str, options: &CompileOptions) -> WeftResult<CompiledOutput> {
	let resolve = options.resolve_paths()?;
	let preprocessed = preprocess(input, resolve.as_ref(), options.loader.as_ref())?;
	let dependencies = preprocessed.dependencies();

	let tokens = tokenize(
		&preprocessed.text,
		Arc::clone(&preprocessed.root),
		&preprocessed.file_map,
		options.token_limit,
	)?;

	let registry = TagRegistry::builtin().merged(&options.tags);
	let generated = generate(tokens, &preprocessed.file_map, &registry, options.debug_positions)?;
	let mut program = generated.program;
	let mut warnings = generated.warnings;
	let file_map = Arc::new(preprocessed.file_map);

	let runtime = if options.inline_runtime {
		let available = FilterRegistry::builtin().merged(&options.filters);
		for (name, pos) in &generated.filters {
			if !available.contains(name) {
				warnings.push(Warning {
					message: format!("filter \"{name}\" was not provided during compile"),
					context: SourceContext::at(pos, &file_map, DEFAULT_CONTEXT_RADIUS),
				});
			}
		}

		let filters = available.select(generated.filters.keys().map(String::as_str));
		program.inlined_filters = Some(filters.names().map(ToString::to_string).collect());

		Some(Runtime {
			filters,
			..Runtime::default()
		})
	} else {
		None
	};

	let program = Arc::new(program);
	let code = program.to_string();

	let template = if options.intermediate_only {
		None
	} else {
		Some(Template::produce(Arc::clone(&program), Arc::clone(&file_map), runtime)?)
	};

	tracing::debug!(
		locals = generated.locals.len(),
		warnings = warnings.len(),
		dependencies = dependencies.len(),
		"compiled template"
	);

	Ok(CompiledOutput {
		code,
		program,
		template,
		locals: generated.locals,
		locals_full: generated.locals_full,
		warnings,
		dependencies,
		dependency_tree: preprocessed.dependency_tree,
		file_map,
	})
}

fn read_source(options: &CompileOptions) -> WeftResult<String> {
	let Some(source_file) = options.source_file.as_deref() else {
		return Err(WeftError::InvalidOption {
			option: "source_file".to_string(),
			reason: "required to compile from a file".to_string(),
		});
	};

	Ok(options.loader.load(source_file)?)
}

/// Compile the template stored in `options.source_file`.
pub fn compile_from_file(options: &CompileOptions) -> WeftResult<CompiledOutput> {
	let input = read_source(options)?;
	compile(&input, options)
}

fn execute<S: Serialize>(output: &CompiledOutput, bindings: S, options: &CompileOptions) -> WeftResult<String> {
	let produced;
	let template = match &output.template {
		Some(template) => template,
		None => {
			produced = Template::produce(Arc::clone(&output.program), Arc::clone(&output.file_map), None)?;
			&produced
		}
	};

	// Reuses the expressions compiled while producing.
	if template.is_inlined() || options.filters.is_empty() {
		template.render(bindings)
	} else {
		template.render_with(bindings, &options.runtime())
	}
}

/// Compile and render template text in one step.
pub fn render<S: Serialize>(input: &str, bindings: S, options: &CompileOptions) -> WeftResult<String> {
	let output = compile(input, options)?;
	execute(&output, bindings, options)
}

/// Compile and render the template stored in `options.source_file`.
pub fn render_from_file<S: Serialize>(bindings: S, options: &CompileOptions) -> WeftResult<String> {
	let output = compile_from_file(options)?;
	execute(&output, bindings, options)
}
