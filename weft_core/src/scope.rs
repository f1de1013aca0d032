use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

/// A call wrapping the rest of an expression, e.g. `Object.keys(user)`.
static CALL_PATTERN: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"\b[^()]+\((.*)\)$").expect("invalid call pattern"));

/// Words that look like identifiers but never refer to a binding.
const RESERVED_WORDS: &[&str] = &[
	"true",
	"false",
	"null",
	"undefined",
	"none",
	"None",
	"True",
	"False",
	"and",
	"or",
	"not",
	"in",
	"is",
];

/// Stack of frames of names bound inside the template. The bottom frame is
/// the template's top level and is never popped.
#[derive(Debug, Clone)]
pub struct VariableContext {
	frames: Vec<BTreeSet<String>>,
}

impl Default for VariableContext {
	fn default() -> Self {
		Self {
			frames: vec![BTreeSet::new()],
		}
	}
}

impl VariableContext {
	pub fn new() -> Self {
		Self::default()
	}

	/// Open a new innermost frame.
	pub fn create(&mut self) {
		self.frames.push(BTreeSet::new());
	}

	/// Drop the innermost frame and the names bound in it.
	pub fn destroy(&mut self) {
		if self.frames.len() > 1 {
			self.frames.pop();
		}
	}

	/// Bind `name` in the innermost frame.
	pub fn add(&mut self, name: impl Into<String>) {
		if let Some(frame) = self.frames.last_mut() {
			frame.insert(name.into());
		}
	}

	/// Whether `name` is bound in any frame.
	pub fn has(&self, name: &str) -> bool {
		self.frames.iter().any(|frame| frame.contains(name))
	}

	pub fn depth(&self) -> usize {
		self.frames.len()
	}
}

/// Peel call wrappers: `f(g(x))` becomes `x`.
pub fn strip_calls(expression: &str) -> &str {
	let mut current = expression.trim();
	while let Some(inner) = CALL_PATTERN.captures(current).and_then(|captures| captures.get(1)) {
		let next = inner.as_str().trim();
		if next == current {
			break;
		}
		current = next;
	}
	current
}

/// The part of an access path before the first `.` or `[`.
pub fn identifier_base(expression: &str) -> &str {
	let end = expression.find(['.', '[']).unwrap_or(expression.len());
	expression[..end].trim()
}

/// Starts like an identifier: `$`, `_` or an ASCII letter.
pub fn is_identifier_like(name: &str) -> bool {
	name.starts_with(|ch: char| ch == '$' || ch == '_' || ch.is_ascii_alphabetic())
}

/// A plain variable name, not a literal or reserved word.
pub fn is_variable_name(name: &str) -> bool {
	is_identifier_like(name)
		&& name
			.chars()
			.all(|ch| ch == '$' || ch == '_' || ch.is_ascii_alphanumeric())
		&& !RESERVED_WORDS.contains(&name)
}

/// The full stripped access path and its base name, when the expression
/// refers to a variable at all.
pub fn extract_local(expression: &str) -> Option<(String, String)> {
	let stripped = strip_calls(expression);
	let base = identifier_base(stripped);

	is_variable_name(base).then(|| (stripped.to_string(), base.to_string()))
}
