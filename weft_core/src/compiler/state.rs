use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use super::TagRegistry;
use crate::DEFAULT_CONTEXT_RADIUS;
use crate::FileMap;
use crate::NESTING_CONTEXT_RADIUS;
use crate::SourceContext;
use crate::SourcePos;
use crate::VariableContext;
use crate::WeftError;
use crate::WeftResult;
use crate::ir::Arm;
use crate::ir::ArmLabel;
use crate::ir::Branch;
use crate::ir::Expr;
use crate::ir::Instruction;
use crate::ir::Iterable;
use crate::ir::LoopBinding;
use crate::scope::extract_local;
use crate::tokens::FilterCall;
use crate::tokens::Token;

/// A non-fatal diagnostic collected while compiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
	pub message: String,
	pub context: SourceContext,
}

impl fmt::Display for Warning {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}{}", self.message, self.context)
	}
}

/// Token range of a mixin or block body, emitted after the main body.
#[derive(Debug, Clone)]
pub(crate) struct Deferred {
	pub start: usize,
	pub end: usize,
	pub params: Vec<String>,
}

/// Header of a block whose body is still being generated.
#[derive(Debug)]
pub(crate) enum OpenKind {
	Root,
	If {
		closer: &'static str,
		branches: Vec<Branch>,
		/// The branch being filled, `None` once `else` was seen.
		current: Option<(Expr, bool)>,
	},
	Case {
		subject: Expr,
		arms: Vec<Arm>,
		current: Option<ArmLabel>,
	},
	For {
		binding: LoopBinding,
		iterable: Iterable,
		offset: Option<i64>,
		limit: Option<i64>,
	},
}

impl OpenKind {
	pub(crate) fn describe(&self) -> &'static str {
		match self {
			Self::Root => "template",
			Self::If { closer, .. } => {
				if *closer == "endif" {
					"if"
				} else {
					"unless"
				}
			}
			Self::Case { .. } => "case",
			Self::For { .. } => "for",
		}
	}
}

#[derive(Debug)]
pub(crate) struct OpenBlock {
	pub kind: OpenKind,
	pub body: Vec<Instruction>,
}

/// Everything a tag handler can see and change while the token stream is
/// turned into a program. One state exists per compile.
pub struct CompileState<'a> {
	pub(crate) tokens: Arc<[Token]>,
	pub(crate) idx: usize,
	pub(crate) file_map: &'a FileMap,
	pub(crate) registry: &'a TagRegistry,
	pub(crate) debug_positions: bool,
	pub(crate) frames: Vec<OpenBlock>,
	pub(crate) locals: BTreeSet<String>,
	pub(crate) locals_full: BTreeSet<String>,
	/// First use of every filter name.
	pub(crate) filters: IndexMap<String, SourcePos>,
	pub(crate) mixins: IndexMap<String, Deferred>,
	pub(crate) blocks: IndexMap<String, Deferred>,
	/// First and last token index of every block name.
	pub(crate) block_sites: HashMap<String, (usize, usize)>,
	pub(crate) mixin_calls: Vec<(String, SourcePos)>,
	pub(crate) warnings: Vec<Warning>,
	pub(crate) scope: VariableContext,
	pub(crate) trim_next: bool,
}

impl<'a> CompileState<'a> {
	pub(crate) fn new(
		tokens: Vec<Token>,
		file_map: &'a FileMap,
		registry: &'a TagRegistry,
		debug_positions: bool,
	) -> Self {
		Self {
			tokens: tokens.into(),
			idx: 0,
			file_map,
			registry,
			debug_positions,
			frames: vec![OpenBlock {
				kind: OpenKind::Root,
				body: vec![],
			}],
			locals: BTreeSet::new(),
			locals_full: BTreeSet::new(),
			filters: IndexMap::new(),
			mixins: IndexMap::new(),
			blocks: IndexMap::new(),
			block_sites: HashMap::new(),
			mixin_calls: vec![],
			warnings: vec![],
			scope: VariableContext::new(),
			trim_next: false,
		}
	}

	/// Index of the token being handled.
	pub fn idx(&self) -> usize {
		self.idx
	}

	pub fn token(&self, idx: usize) -> Option<&Token> {
		self.tokens.get(idx)
	}

	/// Move past the current token.
	pub fn advance(&mut self) {
		self.idx += 1;
	}

	/// Continue with the token at `idx`.
	pub fn skip_to(&mut self, idx: usize) {
		self.idx = idx;
	}

	/// Position of the token being handled.
	pub fn pos(&self) -> SourcePos {
		self.tokens
			.get(self.idx)
			.or_else(|| self.tokens.last())
			.map_or_else(|| SourcePos::new(crate::STRING_FILE_ID, 0), |token| token.pos().clone())
	}

	pub fn scope(&self) -> &VariableContext {
		&self.scope
	}

	pub fn scope_mut(&mut self) -> &mut VariableContext {
		&mut self.scope
	}

	pub fn context(&self, pos: &SourcePos) -> SourceContext {
		SourceContext::at(pos, self.file_map, DEFAULT_CONTEXT_RADIUS)
	}

	pub fn warn(&mut self, message: impl Into<String>, pos: &SourcePos) {
		let context = self.context(pos);
		self.warnings.push(Warning {
			message: message.into(),
			context,
		});
	}

	/// Append an instruction to the innermost open block.
	pub fn emit(&mut self, instruction: Instruction) {
		if let Some(frame) = self.frames.last_mut() {
			frame.body.push(instruction);
		}
	}

	/// Record where the following output comes from. Consecutive positions
	/// collapse into the latest.
	pub(crate) fn mark_position(&mut self, pos: &SourcePos) {
		if !self.debug_positions {
			return;
		}

		if let Some(frame) = self.frames.last_mut() {
			match frame.body.last_mut() {
				Some(Instruction::Position(last)) => last.clone_from(pos),
				_ => frame.body.push(Instruction::Position(pos.clone())),
			}
		}
	}

	/// Register the variable read by `expression` as a local unless it is
	/// bound in the template. Returns the registered base name.
	pub fn add_local(&mut self, expression: &str) -> Option<String> {
		let (full, base) = extract_local(expression)?;
		if self.scope.has(&base) {
			return None;
		}

		self.locals_full.insert(full);
		self.locals.insert(base.clone());
		Some(base)
	}

	/// Build an expression for the current token, recording filter usage and
	/// the local it reads.
	pub fn expr(&mut self, base: &str, filters: &[FilterCall]) -> Expr {
		let pos = self.pos();
		for filter in filters {
			self.filters
				.entry(filter.name.clone())
				.or_insert_with(|| pos.clone());
		}

		let local = self.add_local(base);
		Expr::new(base.trim())
			.with_filters(filters.to_vec())
			.with_local(local)
	}

	pub(crate) fn open(&mut self, kind: OpenKind) {
		self.frames.push(OpenBlock { kind, body: vec![] });
	}

	pub(crate) fn top_mut(&mut self) -> Option<&mut OpenBlock> {
		if self.frames.len() > 1 {
			self.frames.last_mut()
		} else {
			None
		}
	}

	/// Close the innermost open block.
	pub(crate) fn close(&mut self, closer: &str) -> WeftResult<OpenBlock> {
		if self.frames.len() < 2 {
			return Err(self.nesting_error(format!("`{closer}` has no open block to close")));
		}

		self.frames
			.pop()
			.ok_or_else(|| self.nesting_error(format!("`{closer}` has no open block to close")))
	}

	/// Whether any enclosing open block matches `predicate`.
	pub(crate) fn inside(&self, predicate: impl Fn(&OpenKind) -> bool) -> bool {
		self.frames.iter().any(|frame| predicate(&frame.kind))
	}

	pub(crate) fn nesting_error(&self, reason: String) -> WeftError {
		WeftError::InvalidNesting {
			reason,
			context: SourceContext::at(&self.pos(), self.file_map, NESTING_CONTEXT_RADIUS),
		}
	}

	/// Find the index of the `name` tag closing the current tag. Blocks opened
	/// in between must be closed in order; verbatim blocks are skipped.
	pub fn find_tag(&self, name: &str) -> WeftResult<usize> {
		let mut stack: Vec<String> = vec![];
		let mut idx = self.idx + 1;

		while idx < self.tokens.len() {
			if let Token::Tag(tag) = &self.tokens[idx] {
				if tag.name == name && stack.is_empty() {
					return Ok(idx);
				}

				if self.registry.is_verbatim(&tag.name) {
					idx = self.verbatim_end(idx)? + 1;
					continue;
				}

				if self.registry.is_block(&tag.name) {
					stack.push(format!("end{}", tag.name));
				} else if tag.name.starts_with("end") {
					if stack.last() == Some(&tag.name) {
						stack.pop();
					} else {
						let expected = stack.last().map_or(name, String::as_str);
						return Err(WeftError::InvalidNesting {
							reason: format!("expected `{expected}` but found `{}`", tag.source),
							context: SourceContext::at(&tag.pos, self.file_map, NESTING_CONTEXT_RADIUS),
						});
					}
				}
			}

			idx += 1;
		}

		let pos = self.pos();
		Err(WeftError::TagNotClosed {
			tag: self.tokens.get(self.idx).map(Token::source).unwrap_or(name).to_string(),
			context: self.context(&pos),
		})
	}

	/// Index of the first `end<name>` after the verbatim opener at `idx`.
	pub(crate) fn verbatim_end(&self, idx: usize) -> WeftResult<usize> {
		let opener = &self.tokens[idx];
		let Some(tag) = opener.as_tag() else {
			return Ok(idx);
		};

		let closer = format!("end{}", tag.name);
		self.tokens[idx + 1..]
			.iter()
			.position(|token| token.is_tag(&closer))
			.map(|offset| idx + 1 + offset)
			.ok_or_else(|| WeftError::TagNotClosed {
				tag: tag.source.clone(),
				context: self.context(&tag.pos),
			})
	}

	/// The verbatim source of the tokens in `start..end`.
	pub fn source_between(&self, start: usize, end: usize) -> String {
		self.tokens[start..end].iter().map(Token::source).collect()
	}

	/// Record the first and last occurrence of every block name, ignoring
	/// verbatim regions.
	pub(crate) fn scan_block_sites(&mut self) -> WeftResult<()> {
		let mut idx = 0;
		while idx < self.tokens.len() {
			if let Token::Tag(tag) = &self.tokens[idx] {
				if self.registry.is_verbatim(&tag.name) {
					idx = self.verbatim_end(idx)? + 1;
					continue;
				}

				if tag.name == "block" {
					let name = tag.head.split_whitespace().next().unwrap_or_default().to_string();
					self.block_sites
						.entry(name)
						.and_modify(|site| site.1 = idx)
						.or_insert((idx, idx));
				}
			}
			idx += 1;
		}

		Ok(())
	}
}
