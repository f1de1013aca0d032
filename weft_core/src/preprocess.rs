use std::collections::BTreeSet;
use std::io;
use std::ops::Range;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;

use derive_more::Deref;
use indexmap::IndexMap;
use rayon::prelude::*;
use regex::Regex;

use crate::DEFAULT_CONTEXT_RADIUS;
use crate::FileId;
use crate::FileMap;
use crate::STRING_FILE_ID;
use crate::SourceContext;
use crate::SourcePos;
use crate::WeftError;
use crate::WeftResult;

/// `{% include "file" %}` or `{% extends "file" %}` with double, single or no
/// quotes around the file name.
static DIRECTIVE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(
		r#"\{%-?\s*(include|extends)\s+(?:"([^"]+)"|'([^']+)'|([A-Za-z0-9_\-./]+))\s*-?%\}"#,
	)
	.expect("invalid directive pattern")
});

/// Source of template text. The preprocessor only talks to files through
/// this trait.
pub trait Loader: Send + Sync {
	fn load(&self, path: &Path) -> io::Result<String>;

	fn exists(&self, path: &Path) -> bool {
		path.exists()
	}
}

/// Reads templates from the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsLoader;

impl Loader for FsLoader {
	fn load(&self, path: &Path) -> io::Result<String> {
		std::fs::read_to_string(path)
	}
}

/// Where the template being compiled lives and where its includes are found.
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions<'a> {
	pub source_file: &'a Path,
	pub base_dir: &'a Path,
	pub includes_dir: &'a Path,
}

/// Direct inclusions of every expanded file, in first-reference order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref)]
pub struct DependencyTree(IndexMap<FileId, Vec<FileId>>);

#[derive(Debug, Clone)]
pub struct Preprocessed {
	/// Flattened text with `{# beg #}` / `{# end #}` boundary markers.
	pub text: String,
	/// The file the flattened text starts in.
	pub root: FileId,
	pub file_map: FileMap,
	pub dependency_tree: DependencyTree,
}

impl Preprocessed {
	/// Every file pulled in by the root file, directly or transitively.
	pub fn dependencies(&self) -> BTreeSet<String> {
		self.dependency_tree
			.values()
			.flatten()
			.map(ToString::to_string)
			.collect()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectiveKind {
	Include,
	Extends,
}

impl DirectiveKind {
	fn describe(self) -> &'static str {
		match self {
			Self::Include => "include",
			Self::Extends => "parent template",
		}
	}
}

#[derive(Debug)]
struct Directive {
	kind: DirectiveKind,
	/// Span of the whole statement in the including file.
	span: Range<usize>,
	name: String,
	path: PathBuf,
	id: FileId,
	/// Leading whitespace of the line holding the statement.
	indent: String,
}

struct Resolver<'a> {
	loader: &'a dyn Loader,
	base_dir: PathBuf,
	includes_dir: PathBuf,
	file_map: FileMap,
	tree: IndexMap<FileId, Vec<FileId>>,
	/// Files currently being expanded, outermost first.
	active: Vec<FileId>,
}

impl Resolver<'_> {
	fn file_id(&self, path: &Path) -> FileId {
		let relative = path.strip_prefix(&self.base_dir).unwrap_or(path);
		Arc::from(relative.to_string_lossy().replace('\\', "/"))
	}

	fn directives(&self, text: &str, path: &Path) -> Vec<Directive> {
		let first_tag = [text.find("{%"), text.find("{{")].into_iter().flatten().min();
		let directory = path.parent().unwrap_or(self.base_dir.as_path());

		DIRECTIVE_PATTERN
			.captures_iter(text)
			.filter_map(|captures| {
				let whole = captures.get(0)?;
				let name = captures
					.get(2)
					.or_else(|| captures.get(3))
					.or_else(|| captures.get(4))?
					.as_str()
					.trim();

				let (kind, target) = if &captures[1] == "extends" {
					// Only a leading `extends` is a directive, the generator
					// rejects any other.
					if first_tag != Some(whole.start()) {
						return None;
					}
					(DirectiveKind::Extends, normalize(&directory.join(name)))
				} else {
					(DirectiveKind::Include, normalize(&self.includes_dir.join(name)))
				};

				let line_start = text[..whole.start()].rfind('\n').map_or(0, |index| index + 1);
				let indent = text[line_start..whole.start()]
					.chars()
					.take_while(|ch| *ch == ' ' || *ch == '\t')
					.collect();

				Some(Directive {
					kind,
					span: whole.range(),
					name: name.to_string(),
					id: self.file_id(&target),
					path: target,
					indent,
				})
			})
			.collect()
	}

	/// Read every target of `directives` that is not cached yet. Distinct
	/// files are read concurrently.
	fn fetch(&mut self, directives: &[Directive], file: &FileId) -> WeftResult<()> {
		let mut seen = BTreeSet::new();
		let missing: Vec<&Directive> = directives
			.iter()
			.filter(|directive| !self.file_map.contains_key(&directive.id))
			.filter(|directive| seen.insert(Arc::clone(&directive.id)))
			.collect();

		let loader = self.loader;
		let loaded: Vec<(&Directive, io::Result<String>)> = missing
			.par_iter()
			.map(|directive| {
				tracing::trace!(file = %directive.id, "reading template");
				(*directive, loader.load(&directive.path))
			})
			.collect();

		for (directive, result) in loaded {
			match result {
				Ok(text) => {
					self.file_map.insert(Arc::clone(&directive.id), text);
				}
				Err(error) => {
					return Err(WeftError::FailedResolve {
						kind: directive.kind.describe().to_string(),
						target: directive.name.clone(),
						reason: error.to_string(),
						context: self.context(file, directive.span.start),
					});
				}
			}
		}

		Ok(())
	}

	fn context(&self, file: &FileId, offset: usize) -> SourceContext {
		SourceContext::at(
			&SourcePos::new(Arc::clone(file), offset),
			&self.file_map,
			DEFAULT_CONTEXT_RADIUS,
		)
	}

	/// Expand every directive of `file`, recursively.
	fn expand(&mut self, file: &FileId, path: &Path) -> WeftResult<String> {
		let text = self.file_map.text(file).unwrap_or_default().to_string();
		let directives = self.directives(&text, path);
		self.fetch(&directives, file)?;

		let mut dependencies: Vec<FileId> = vec![];
		for directive in &directives {
			if !dependencies.contains(&directive.id) {
				dependencies.push(Arc::clone(&directive.id));
			}
		}
		self.tree.entry(Arc::clone(file)).or_insert(dependencies);

		let mut expanded = String::with_capacity(text.len());
		let mut last = 0;

		for directive in &directives {
			if self.active.contains(&directive.id) {
				let mut chain: Vec<&str> = self.active.iter().map(AsRef::as_ref).collect();
				chain.push(&directive.id);
				return Err(WeftError::CyclicDependency {
					chain: chain.join(" -> "),
					context: self.context(file, directive.span.start),
				});
			}

			self.active.push(Arc::clone(&directive.id));
			let body = self.expand(&directive.id, &directive.path)?;
			self.active.pop();

			expanded.push_str(&text[last..directive.span.start]);
			expanded.push_str(&wrap(&body, directive, file));
			last = directive.span.end;
		}

		expanded.push_str(&text[last..]);
		Ok(expanded)
	}
}

/// Surround the expanded body with boundary markers. Continuation lines get
/// the indentation of the directive line.
fn wrap(body: &str, directive: &Directive, parent: &FileId) -> String {
	let indent = &directive.indent;
	let body = body.trim_end().replace('\n', &format!("\n{indent}"));

	format!(
		"{{# beg {} {} {} #}}{body}{{# end 0 {parent} #}}",
		directive.span.len(),
		indent.len(),
		directive.id,
	)
}

/// Lexically resolve `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
	let mut normalized = PathBuf::new();
	for component in path.components() {
		match component {
			Component::CurDir => {}
			Component::ParentDir => {
				if !normalized.pop() {
					normalized.push(component);
				}
			}
			other => normalized.push(other),
		}
	}
	normalized
}

/// Resolve `include` and `extends` directives into a single text.
///
/// Without `options` the input is returned unchanged under the
/// [`STRING_FILE_ID`] file id.
#[tracing::instrument(level = "debug", skip_all)]
pub fn preprocess(
	input: &str,
	options: Option<&ResolveOptions<'_>>,
	loader: &dyn Loader,
) -> WeftResult<Preprocessed> {
	let Some(options) = options else {
		let root: FileId = Arc::from(STRING_FILE_ID);
		let mut file_map = FileMap::new();
		file_map.insert(Arc::clone(&root), input.to_string());

		return Ok(Preprocessed {
			text: input.to_string(),
			root,
			file_map,
			dependency_tree: DependencyTree::default(),
		});
	};

	let source_file = normalize(options.source_file);
	let mut resolver = Resolver {
		loader,
		base_dir: normalize(options.base_dir),
		includes_dir: normalize(options.includes_dir),
		file_map: FileMap::new(),
		tree: IndexMap::new(),
		active: vec![],
	};

	let root = resolver.file_id(&source_file);
	resolver.file_map.insert(Arc::clone(&root), input.to_string());
	resolver.active.push(Arc::clone(&root));
	let text = resolver.expand(&root, &source_file)?;

	tracing::debug!(
		root = %root,
		files = resolver.file_map.len(),
		"preprocessed template"
	);

	Ok(Preprocessed {
		text,
		root,
		file_map: resolver.file_map,
		dependency_tree: DependencyTree(resolver.tree),
	})
}
