use std::ops::Range;
use std::sync::Arc;

use logos::Logos;

use crate::DEFAULT_CONTEXT_RADIUS;
use crate::FileId;
use crate::FileMap;
use crate::SourceContext;
use crate::SourcePos;
use crate::WeftError;
use crate::WeftResult;
use crate::tokens::FilterCall;
use crate::tokens::ObjectToken;
use crate::tokens::RawToken;
use crate::tokens::TagToken;
use crate::tokens::Token;

/// Upper bound on the number of tokens produced by a single compile.
pub const DEFAULT_TOKEN_LIMIT: usize = 10_000;

/// Delimiters and the text between them. Only the delimiters matter to the
/// walker, everything else is carried as spans.
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
enum Delimiter {
	#[token("{{")]
	ObjectOpen,
	#[token("}}")]
	ObjectClose,
	#[token("{%")]
	TagOpen,
	#[token("%}")]
	TagClose,
	#[token("{#")]
	MarkerOpen,
	#[token("#}")]
	MarkerClose,
	#[regex(r"[^{}%#]+")]
	Text,
	#[regex(r"[{}%#]")]
	Lone,
}

impl Delimiter {
	fn closer(self) -> Option<Self> {
		match self {
			Self::ObjectOpen => Some(Self::ObjectClose),
			Self::TagOpen => Some(Self::TagClose),
			Self::MarkerOpen => Some(Self::MarkerClose),
			_ => None,
		}
	}

	fn as_str(self) -> &'static str {
		match self {
			Self::ObjectOpen => "{{",
			Self::ObjectClose => "}}",
			Self::TagOpen => "{%",
			Self::TagClose => "%}",
			Self::MarkerOpen => "{#",
			Self::MarkerClose => "#}",
			Self::Text | Self::Lone => "",
		}
	}
}

/// Position bookkeeping for one file inside the flattened text.
#[derive(Debug)]
struct Frame {
	file: FileId,
	/// Offset into the original text of `file`.
	offset: usize,
	/// Bytes of indentation the preprocessor inserted after every newline.
	indent: usize,
	/// Inserted bytes still to be skipped on the current line.
	pending_skip: usize,
	/// Length of the directive this file replaced in its parent.
	resume: usize,
}

/// Walks the delimiter stream and builds positioned tokens, translating
/// flattened offsets back into the files they came from.
struct TokenWalker<'a> {
	source: &'a str,
	raw_tokens: Vec<(Result<Delimiter, ()>, Range<usize>)>,
	cursor: usize,
	/// Byte index in `source` up to which the frame offsets are current.
	synced: usize,
	frames: Vec<Frame>,
	file_map: &'a FileMap,
	tokens: Vec<Token>,
	limit: usize,
	/// Start of the raw text that has not been emitted yet.
	raw_start: usize,
}

impl<'a> TokenWalker<'a> {
	fn new(source: &'a str, root: FileId, file_map: &'a FileMap, limit: usize) -> Self {
		let raw_tokens: Vec<_> = Delimiter::lexer(source).spanned().collect();

		Self {
			source,
			raw_tokens,
			cursor: 0,
			synced: 0,
			frames: vec![Frame {
				file: root,
				offset: 0,
				indent: 0,
				pending_skip: 0,
				resume: 0,
			}],
			file_map,
			tokens: vec![],
			limit,
			raw_start: 0,
		}
	}

	fn frame(&mut self) -> &mut Frame {
		let last = self.frames.len() - 1;
		&mut self.frames[last]
	}

	/// The original position of the byte at `self.synced`.
	fn pos(&self) -> SourcePos {
		let frame = &self.frames[self.frames.len() - 1];
		SourcePos {
			file: Arc::clone(&frame.file),
			offset: frame.offset,
		}
	}

	/// Advance the current frame over `source[synced..upto]`.
	fn sync(&mut self, upto: usize) {
		let source = self.source;
		let pending = &source[self.synced..upto];
		let frame = self.frame();
		for byte in pending.bytes() {
			if frame.pending_skip > 0 {
				frame.pending_skip -= 1;
				continue;
			}

			frame.offset += 1;
			if byte == b'\n' {
				frame.pending_skip = frame.indent;
			}
		}
		self.synced = upto;
	}

	fn context(&self, pos: &SourcePos) -> SourceContext {
		SourceContext::at(pos, self.file_map, DEFAULT_CONTEXT_RADIUS)
	}

	fn push(&mut self, token: Token) -> WeftResult<()> {
		if self.tokens.len() >= self.limit {
			return Err(WeftError::TokenLimitExceeded {
				limit: self.limit,
				context: self.context(token.pos()),
			});
		}

		self.tokens.push(token);
		Ok(())
	}

	/// Emit the raw text between the last token and `end`.
	fn flush_raw(&mut self, end: usize) -> WeftResult<()> {
		if end > self.raw_start {
			let pos = self.pos();
			let text = self.source[self.raw_start..end].to_string();
			self.sync(end);
			self.push(Token::Raw(RawToken { text, pos }))?;
		}

		Ok(())
	}

	fn walk(mut self) -> WeftResult<Vec<Token>> {
		while self.cursor < self.raw_tokens.len() {
			let (kind, span) = self.raw_tokens[self.cursor].clone();

			match kind {
				Ok(
					opener @ (Delimiter::ObjectOpen | Delimiter::TagOpen | Delimiter::MarkerOpen),
				) => {
					self.flush_raw(span.start)?;
					self.read_token(opener, span)?;
				}
				_ => self.cursor += 1,
			}
		}

		self.flush_raw(self.source.len())?;

		if self.frames.len() > 1 {
			let pos = self.pos();
			return Err(WeftError::MalformedToken {
				reason: format!("file marker for `{}` was never closed", pos.file),
				context: self.context(&pos),
			});
		}

		Ok(self.tokens)
	}

	/// Read from an opener to its closer and emit the resulting token.
	fn read_token(&mut self, opener: Delimiter, span: Range<usize>) -> WeftResult<()> {
		let pos = self.pos();
		let Some(closer) = opener.closer() else {
			return Ok(());
		};

		let mut index = self.cursor + 1;
		let close = loop {
			let Some((kind, close_span)) = self.raw_tokens.get(index) else {
				return Err(WeftError::MalformedToken {
					reason: format!("`{}` is never closed with `{}`", opener.as_str(), closer.as_str()),
					context: self.context(&pos),
				});
			};

			match kind {
				Ok(kind) if *kind == closer => break close_span.clone(),
				Ok(
					other @ (Delimiter::ObjectOpen | Delimiter::TagOpen | Delimiter::MarkerOpen),
				) => {
					return Err(WeftError::MalformedToken {
						reason: format!(
							"found `{}` before `{}` closed the `{}`",
							other.as_str(),
							closer.as_str(),
							opener.as_str()
						),
						context: self.context(&pos),
					});
				}
				_ => index += 1,
			}
		};

		self.cursor = index + 1;
		self.raw_start = close.end;
		let source = self.source;
		let content = &source[span.end..close.start];
		let text = &source[span.start..close.end];

		match opener {
			Delimiter::MarkerOpen => {
				// Marker bytes are not part of any original file.
				self.synced = close.end;
				self.enter_marker(content, &pos)
			}
			Delimiter::TagOpen => {
				let token = parse_tag(content, text, pos);
				self.sync(close.end);
				self.push(Token::Tag(token))
			}
			_ => {
				let token = parse_object(content, text, pos);
				self.sync(close.end);
				self.push(Token::Object(token))
			}
		}
	}

	/// Apply a `{# beg ... #}` / `{# end ... #}` boundary marker. Any other
	/// `{# ... #}` content is discarded.
	fn enter_marker(&mut self, content: &str, pos: &SourcePos) -> WeftResult<()> {
		let content = content.trim();
		let mut parts = content.splitn(4, ' ');

		match parts.next() {
			Some("beg") => {
				let resume = parts.next().and_then(|value| value.parse::<usize>().ok());
				let indent = parts.next().and_then(|value| value.parse::<usize>().ok());
				let (Some(resume), Some(indent), Some(file)) = (resume, indent, parts.next()) else {
					return Err(WeftError::MalformedToken {
						reason: format!("invalid file marker `{content}`"),
						context: self.context(pos),
					});
				};

				let file = self.file_map.id(file).unwrap_or_else(|| Arc::from(file));
				let indent = self.frame().indent + indent;
				self.frames.push(Frame {
					file,
					offset: 0,
					indent,
					pending_skip: 0,
					resume,
				});
			}
			Some("end") => {
				if self.frames.len() < 2 {
					return Err(WeftError::MalformedToken {
						reason: "file end marker without a matching begin marker".to_string(),
						context: self.context(pos),
					});
				}

				if let Some(frame) = self.frames.pop() {
					self.frame().offset += frame.resume;
				}
			}
			_ => {}
		}

		Ok(())
	}
}

fn parse_tag(content: &str, text: &str, pos: SourcePos) -> TagToken {
	let content = content.trim();
	let (name, args) = content
		.split_once(char::is_whitespace)
		.map_or((content, ""), |(name, args)| (name, args.trim()));
	let mut clauses = split_unescaped(args, '|').into_iter();
	let head = clauses.next().unwrap_or_default().trim().to_string();

	TagToken {
		name: name.to_string(),
		args: args.to_string(),
		head,
		filters: clauses.map(parse_filter).collect(),
		source: text.to_string(),
		pos,
	}
}

fn parse_object(content: &str, text: &str, pos: SourcePos) -> ObjectToken {
	let mut clauses = split_unescaped(content.trim(), '|').into_iter();
	let expression = clauses.next().unwrap_or_default().trim().to_string();

	ObjectToken {
		expression,
		filters: clauses.map(parse_filter).collect(),
		source: text.to_string(),
		pos,
	}
}

/// Parse `name: arg, arg` into a [`FilterCall`].
pub fn parse_filter(clause: &str) -> FilterCall {
	let clause = clause.trim();

	match find_unescaped(clause, ':') {
		Some(index) => {
			let args = split_unescaped(&clause[index + 1..], ',')
				.into_iter()
				.map(str::trim)
				.filter(|arg| !arg.is_empty())
				.map(ToString::to_string)
				.collect();
			FilterCall::new(clause[..index].trim(), args)
		}
		None => FilterCall::new(clause, vec![]),
	}
}

/// Byte index of the first `separator` outside quotes and brackets.
pub fn find_unescaped(text: &str, separator: char) -> Option<usize> {
	separator_indices(text, separator).next()
}

/// Split on `separator` wherever it appears outside quotes and brackets.
pub fn split_unescaped(text: &str, separator: char) -> Vec<&str> {
	let mut pieces = vec![];
	let mut start = 0;

	for index in separator_indices(text, separator) {
		pieces.push(&text[start..index]);
		start = index + separator.len_utf8();
	}

	pieces.push(&text[start..]);
	pieces
}

fn separator_indices(text: &str, separator: char) -> impl Iterator<Item = usize> + '_ {
	let mut quote: Option<char> = None;
	let mut escaped = false;
	let mut depth = 0usize;

	text.char_indices().filter_map(move |(index, ch)| {
		if let Some(open) = quote {
			if escaped {
				escaped = false;
			} else if ch == '\\' {
				escaped = true;
			} else if ch == open {
				quote = None;
			}
			return None;
		}

		match ch {
			'"' | '\'' | '`' => quote = Some(ch),
			'(' | '[' | '{' => depth += 1,
			')' | ']' | '}' => depth = depth.saturating_sub(1),
			_ if ch == separator && depth == 0 => return Some(index),
			_ => {}
		}

		None
	})
}

/// Turn flattened template text into tokens positioned in their original
/// files. `root` names the file the text starts in.
#[tracing::instrument(level = "debug", skip_all, fields(root = %root))]
pub fn tokenize(
	text: &str,
	root: FileId,
	file_map: &FileMap,
	limit: usize,
) -> WeftResult<Vec<Token>> {
	let tokens = TokenWalker::new(text, root, file_map, limit).walk()?;
	tracing::debug!(count = tokens.len(), "tokenized template");

	Ok(tokens)
}
