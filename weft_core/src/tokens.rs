use crate::SourcePos;

/// A single filter clause from a chain such as `| truncate: 10, "..."`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCall {
	pub name: String,
	/// Argument expressions, still unevaluated.
	pub args: Vec<String>,
}

impl FilterCall {
	pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
		Self {
			name: name.into(),
			args,
		}
	}
}

/// Literal text between tags and objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawToken {
	pub text: String,
	pub pos: SourcePos,
}

/// A `{% name args | filters %}` control tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagToken {
	pub name: String,
	/// Everything after the tag name, trimmed.
	pub args: String,
	/// `args` up to the first unescaped `|`, trimmed.
	pub head: String,
	pub filters: Vec<FilterCall>,
	/// The verbatim `{% ... %}` text.
	pub source: String,
	pub pos: SourcePos,
}

impl TagToken {
	/// Find the argument of a `| name N` or `| name: N` clause.
	pub fn filter_arg(&self, name: &str) -> Option<&str> {
		self.filters.iter().find_map(|filter| {
			if filter.name == name {
				return filter.args.first().map(String::as_str);
			}

			let rest = filter.name.strip_prefix(name)?;
			rest.starts_with(char::is_whitespace).then(|| rest.trim())
		})
	}
}

/// A `{{ expression | filters }}` interpolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectToken {
	pub expression: String,
	pub filters: Vec<FilterCall>,
	pub source: String,
	pub pos: SourcePos,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
	Raw(RawToken),
	Tag(TagToken),
	Object(ObjectToken),
}

impl Token {
	pub fn pos(&self) -> &SourcePos {
		match self {
			Token::Raw(raw) => &raw.pos,
			Token::Tag(tag) => &tag.pos,
			Token::Object(object) => &object.pos,
		}
	}

	/// The verbatim text this token was read from.
	pub fn source(&self) -> &str {
		match self {
			Token::Raw(raw) => &raw.text,
			Token::Tag(tag) => &tag.source,
			Token::Object(object) => &object.source,
		}
	}

	pub fn as_tag(&self) -> Option<&TagToken> {
		match self {
			Token::Tag(tag) => Some(tag),
			_ => None,
		}
	}

	pub fn is_tag(&self, name: &str) -> bool {
		self.as_tag().is_some_and(|tag| tag.name == name)
	}
}
