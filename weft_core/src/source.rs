use std::fmt;
use std::fmt::Write;
use std::sync::Arc;

use derive_more::Deref;
use derive_more::DerefMut;
use indexmap::IndexMap;

/// Identifier of a template file: its path relative to the base directory
/// with `/` separators.
pub type FileId = Arc<str>;

/// File id used for templates compiled from a string without file options.
pub const STRING_FILE_ID: &str = "<string>";
/// Lines shown above and below the offending line in most diagnostics.
pub const DEFAULT_CONTEXT_RADIUS: usize = 2;
/// Nesting errors show a wider excerpt since the mismatch is often far away.
pub const NESTING_CONTEXT_RADIUS: usize = 4;

/// A byte offset into the original content of `file`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourcePos {
	pub file: FileId,
	pub offset: usize,
}

impl SourcePos {
	pub fn new(file: impl Into<FileId>, offset: usize) -> Self {
		Self {
			file: file.into(),
			offset,
		}
	}
}

impl fmt::Display for SourcePos {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}@{}", self.file, self.offset)
	}
}

/// Original text of every file that took part in a compile, in the order the
/// files were first read. Filled by the preprocessor, read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref, DerefMut)]
pub struct FileMap(IndexMap<FileId, String>);

impl FileMap {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn text(&self, file: &str) -> Option<&str> {
		self.0.get(file).map(String::as_str)
	}

	/// Return the shared id stored for `file`, so tokens referencing the same
	/// file share one allocation.
	pub fn id(&self, file: &str) -> Option<FileId> {
		self.0.get_key_value(file).map(|(id, _)| Arc::clone(id))
	}
}

/// Pre-computed line starts for offset to line/column conversion.
#[derive(Debug, Clone)]
pub struct LineTable {
	/// Byte offsets of the start of each line. `line_starts[0]` is always 0.
	line_starts: Vec<usize>,
}

impl LineTable {
	pub fn new(content: &str) -> Self {
		let mut line_starts = vec![0];
		for (i, byte) in content.bytes().enumerate() {
			if byte == b'\n' {
				line_starts.push(i + 1);
			}
		}
		Self { line_starts }
	}

	/// Convert a byte offset to a 1-indexed `(line, column)` pair.
	pub fn locate(&self, offset: usize) -> (usize, usize) {
		let line_idx = match self.line_starts.binary_search(&offset) {
			Ok(exact) => exact,
			Err(insert) => insert.saturating_sub(1),
		};

		(line_idx + 1, offset - self.line_starts[line_idx] + 1)
	}

	pub fn line_count(&self) -> usize {
		self.line_starts.len()
	}
}

/// Render the lines around `pos` in the original text of its file.
///
/// ```text
///     1| {% if user %}
///  >> 2|   {{ user.name | nope }}
///     3| {% endif %}
///  File| page.weft:2:3
/// ```
pub fn error_context(pos: &SourcePos, file_map: &FileMap, radius: usize) -> String {
	let Some(text) = file_map.text(&pos.file) else {
		return format!(" File| {}", pos.file);
	};

	let offset = pos.offset.min(text.len());
	let (line, byte_column) = LineTable::new(text).locate(offset);
	let line_start = offset + 1 - byte_column;
	let column = text
		.get(line_start..offset)
		.map_or(byte_column, |prefix| prefix.chars().count() + 1);
	let lines: Vec<&str> = text.split('\n').collect();
	let first = line.saturating_sub(radius).max(1);
	let last = (line + radius).min(lines.len());
	let mut rendered = String::new();

	for number in first..=last {
		let marker = if number == line {
			format!(">> {number}")
		} else {
			number.to_string()
		};
		let content = lines[number - 1].trim_end_matches('\r');
		let _ = writeln!(rendered, "{marker:>5}| {content}");
	}

	let _ = write!(rendered, " File| {}:{line}:{column}", pos.file);
	rendered
}

/// An optional rendered excerpt attached to diagnostics. Displays as
/// `"\n<excerpt>"` so that messages read `message\n<excerpt>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref)]
pub struct SourceContext(Option<String>);

impl SourceContext {
	pub fn none() -> Self {
		Self(None)
	}

	pub fn at(pos: &SourcePos, file_map: &FileMap, radius: usize) -> Self {
		Self(Some(error_context(pos, file_map, radius)))
	}
}

impl From<String> for SourceContext {
	fn from(value: String) -> Self {
		Self(Some(value))
	}
}

impl fmt::Display for SourceContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.0 {
			Some(context) => write!(f, "\n{context}"),
			None => Ok(()),
		}
	}
}
