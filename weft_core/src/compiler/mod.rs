//! Turns tokens into a [`Program`].
//!
//! Generation runs in two passes. The first pass walks every token, handing
//! tags to their [`Tag`] handler and recording mixin and block bodies as token
//! ranges. The second pass emits those ranges with their own scope frames, so
//! a mixin may be called before it is defined.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::LazyLock;

use indexmap::IndexMap;

pub use self::state::*;
use crate::FileMap;
use crate::SourcePos;
use crate::WeftError;
use crate::WeftResult;
use crate::ir::Instruction;
use crate::ir::Mixin;
use crate::ir::Program;
use crate::tokens::TagToken;
use crate::tokens::Token;

mod state;
mod tags;

/// Handler for one tag name. A handler must consume at least its own token.
pub trait Tag: Send + Sync {
	fn handle(&self, state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()>;
}

impl<F> Tag for F
where
	F: Fn(&mut CompileState<'_>, &TagToken) -> WeftResult<()> + Send + Sync,
{
	fn handle(&self, state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
		self(state, tag)
	}
}

static BUILTIN_TAGS: LazyLock<TagRegistry> = LazyLock::new(tags::builtin_registry);

/// Tag handlers by name, together with the names that open blocks.
#[derive(Clone, Default)]
pub struct TagRegistry {
	tags: BTreeMap<String, Arc<dyn Tag>>,
	/// Tags closed by a matching `end<name>` tag.
	block_tags: BTreeSet<String>,
	/// Block tags whose content is taken verbatim.
	verbatim_tags: BTreeSet<String>,
}

impl fmt::Debug for TagRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TagRegistry")
			.field("tags", &self.tags.keys().collect::<Vec<_>>())
			.field("block_tags", &self.block_tags)
			.field("verbatim_tags", &self.verbatim_tags)
			.finish()
	}
}

impl TagRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Handlers for every built-in tag.
	pub fn builtin() -> &'static Self {
		&BUILTIN_TAGS
	}

	pub fn insert<F>(&mut self, name: impl Into<String>, handler: F)
	where
		F: Fn(&mut CompileState<'_>, &TagToken) -> WeftResult<()> + Send + Sync + 'static,
	{
		self.tags.insert(name.into(), Arc::new(handler));
	}

	pub fn with<F>(mut self, name: impl Into<String>, handler: F) -> Self
	where
		F: Fn(&mut CompileState<'_>, &TagToken) -> WeftResult<()> + Send + Sync + 'static,
	{
		self.insert(name, handler);
		self
	}

	/// Register a handler implemented as its own type.
	pub fn insert_tag(&mut self, name: impl Into<String>, handler: Arc<dyn Tag>) {
		self.tags.insert(name.into(), handler);
	}

	/// Register `name` as a block tag closed by `end<name>`. Nesting
	/// validation treats it like `if` or `for`.
	pub fn insert_block<F, G>(&mut self, name: impl Into<String>, open: F, close: G)
	where
		F: Fn(&mut CompileState<'_>, &TagToken) -> WeftResult<()> + Send + Sync + 'static,
		G: Fn(&mut CompileState<'_>, &TagToken) -> WeftResult<()> + Send + Sync + 'static,
	{
		let name = name.into();
		self.insert(format!("end{name}"), close);
		self.insert(name.clone(), open);
		self.block_tags.insert(name);
	}

	pub(crate) fn mark_block(&mut self, name: &str) {
		self.block_tags.insert(name.to_string());
	}

	pub(crate) fn mark_verbatim(&mut self, name: &str) {
		self.block_tags.insert(name.to_string());
		self.verbatim_tags.insert(name.to_string());
	}

	/// The handler for `name`. Mixin calls (`+name`) share one handler.
	pub fn get(&self, name: &str) -> Option<&Arc<dyn Tag>> {
		if name.len() > 1 && name.starts_with('+') {
			return self.tags.get("+");
		}
		self.tags.get(name)
	}

	pub fn contains(&self, name: &str) -> bool {
		self.get(name).is_some()
	}

	pub fn is_block(&self, name: &str) -> bool {
		self.block_tags.contains(name)
	}

	pub fn is_verbatim(&self, name: &str) -> bool {
		self.verbatim_tags.contains(name)
	}

	/// `self` overlaid with `extra`. Handlers of `extra` win.
	pub fn merged(&self, extra: &Self) -> Self {
		let mut merged = self.clone();
		for (name, handler) in &extra.tags {
			merged.tags.insert(name.clone(), Arc::clone(handler));
		}
		merged.block_tags.extend(extra.block_tags.iter().cloned());
		merged.verbatim_tags.extend(extra.verbatim_tags.iter().cloned());
		merged
	}
}

/// The result of code generation.
#[derive(Debug, Clone)]
pub struct Generated {
	pub program: Program,
	pub locals: BTreeSet<String>,
	pub locals_full: BTreeSet<String>,
	/// First use of every filter referenced by the template.
	pub filters: IndexMap<String, SourcePos>,
	pub warnings: Vec<Warning>,
}

/// Generate instructions for the tokens in `state.idx..end`.
fn generate_range(state: &mut CompileState<'_>, end: usize) -> WeftResult<()> {
	let registry = state.registry;

	while state.idx < end {
		let idx = state.idx;
		let tokens = Arc::clone(&state.tokens);
		let token = &tokens[idx];
		let trim = std::mem::take(&mut state.trim_next);
		state.mark_position(token.pos());

		match token {
			Token::Raw(raw) => {
				let text = if trim { raw.text.trim_start() } else { raw.text.as_str() };
				if !text.is_empty() {
					state.emit(Instruction::Text(text.to_string()));
				}
				state.advance();
			}
			Token::Object(object) => {
				let expr = state.expr(&object.expression, &object.filters);
				state.emit(Instruction::Emit(expr));
				state.advance();
			}
			Token::Tag(tag) => {
				let Some(handler) = registry.get(&tag.name) else {
					return Err(WeftError::UnknownTag {
						name: tag.name.clone(),
						context: state.context(&tag.pos),
					});
				};

				handler.handle(state, tag)?;

				if state.idx == idx {
					return Err(WeftError::EngineStateUnchanged {
						name: tag.name.clone(),
						context: state.context(&tag.pos),
					});
				}
			}
		}
	}

	Ok(())
}

/// Generate a deferred body in a fresh frame with `params` bound.
fn generate_deferred(state: &mut CompileState<'_>, deferred: &Deferred) -> WeftResult<Vec<Instruction>> {
	let depth = state.frames.len();
	state.open(OpenKind::Root);
	state.scope.create();
	for param in &deferred.params {
		state.scope.add(param.clone());
	}

	state.skip_to(deferred.start);
	generate_range(state, deferred.end)?;
	state.scope.destroy();

	let frame = state.close("end")?;
	if state.frames.len() != depth || !matches!(frame.kind, OpenKind::Root) {
		return Err(state.nesting_error(format!("`{}` is not closed", frame.kind.describe())));
	}

	Ok(frame.body)
}

/// Turn tokens into a program.
#[tracing::instrument(level = "debug", skip_all, fields(tokens = tokens.len()))]
pub fn generate(
	tokens: Vec<Token>,
	file_map: &FileMap,
	registry: &TagRegistry,
	debug_positions: bool,
) -> WeftResult<Generated> {
	let mut state = CompileState::new(tokens, file_map, registry, debug_positions);
	state.scan_block_sites()?;
	let end = state.tokens.len();
	generate_range(&mut state, end)?;

	if state.frames.len() > 1 {
		let kind = state.frames[state.frames.len() - 1].kind.describe();
		return Err(state.nesting_error(format!("`{kind}` is not closed")));
	}

	let mut program = Program::default();

	// Deferred bodies may define further mixins and blocks, so both tables can
	// grow while they are emitted.
	let (mut mixins_done, mut blocks_done) = (0, 0);
	loop {
		if let Some((name, deferred)) = state.mixins.get_index(mixins_done) {
			let (name, deferred) = (name.clone(), deferred.clone());
			let body = generate_deferred(&mut state, &deferred)?;
			program.mixins.insert(name, Mixin {
				params: deferred.params,
				body,
			});
			mixins_done += 1;
		} else if let Some((name, deferred)) = state.blocks.get_index(blocks_done) {
			let (name, deferred) = (name.clone(), deferred.clone());
			let body = generate_deferred(&mut state, &deferred)?;
			program.blocks.insert(name, body);
			blocks_done += 1;
		} else {
			break;
		}
	}

	for (name, pos) in std::mem::take(&mut state.mixin_calls) {
		if !program.mixins.contains_key(&name) {
			state.warn(format!("mixin \"{name}\" is called but never defined"), &pos);
		}
	}

	program.body = state.frames.pop().map(|frame| frame.body).unwrap_or_default();

	tracing::debug!(
		mixins = program.mixins.len(),
		blocks = program.blocks.len(),
		locals = state.locals.len(),
		"generated program"
	);

	Ok(Generated {
		program,
		locals: state.locals,
		locals_full: state.locals_full,
		filters: state.filters,
		warnings: state.warnings,
	})
}
