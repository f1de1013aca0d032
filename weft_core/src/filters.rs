use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::LazyLock;

use minijinja::Value;
use regex::Regex;

use crate::value::from_number;
use crate::value::is_blank;
use crate::value::render_value;
use crate::value::to_integer;
use crate::value::to_number;
use crate::value::to_text;

/// A named transformation applied by `{{ value | name: args }}`.
pub trait Filter: Send + Sync {
	fn apply(&self, value: Value, args: &[Value]) -> Result<Value, String>;
}

impl<F> Filter for F
where
	F: Fn(Value, &[Value]) -> Result<Value, String> + Send + Sync,
{
	fn apply(&self, value: Value, args: &[Value]) -> Result<Value, String> {
		self(value, args)
	}
}

static BUILTIN_FILTERS: LazyLock<FilterRegistry> = LazyLock::new(builtin_registry);

/// An HTML entity produced by `escape`.
static ENTITY_PATTERN: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"&(?:amp|lt|gt|#34|#39);").expect("invalid entity pattern"));

/// Filters available to a compile or a render, keyed by name.
#[derive(Clone, Default)]
pub struct FilterRegistry {
	filters: BTreeMap<String, Arc<dyn Filter>>,
}

impl fmt::Debug for FilterRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_set().entries(self.filters.keys()).finish()
	}
}

impl FilterRegistry {
	/// An empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// The shared registry of built-in filters. It is never mutated, compiles
	/// extend a copy through [`FilterRegistry::merged`].
	pub fn builtin() -> &'static Self {
		&BUILTIN_FILTERS
	}

	pub fn insert<F>(&mut self, name: impl Into<String>, filter: F)
	where
		F: Fn(Value, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
	{
		self.filters.insert(name.into(), Arc::new(filter));
	}

	pub fn with<F>(mut self, name: impl Into<String>, filter: F) -> Self
	where
		F: Fn(Value, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
	{
		self.insert(name, filter);
		self
	}

	/// Register a filter implemented as its own type.
	pub fn insert_filter(&mut self, name: impl Into<String>, filter: Arc<dyn Filter>) {
		self.filters.insert(name.into(), filter);
	}

	pub fn get(&self, name: &str) -> Option<&Arc<dyn Filter>> {
		self.filters.get(name)
	}

	pub fn contains(&self, name: &str) -> bool {
		self.filters.contains_key(name)
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.filters.keys().map(String::as_str)
	}

	pub fn len(&self) -> usize {
		self.filters.len()
	}

	pub fn is_empty(&self) -> bool {
		self.filters.is_empty()
	}

	/// A new registry holding `self` overlaid with `extra`. Entries of
	/// `extra` win.
	pub fn merged(&self, extra: &Self) -> Self {
		let mut filters = self.filters.clone();
		for (name, filter) in &extra.filters {
			filters.insert(name.clone(), Arc::clone(filter));
		}
		Self { filters }
	}

	/// The subset of this registry named by `names`. Unknown names are
	/// skipped.
	pub fn select<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Self {
		let filters = names
			.into_iter()
			.filter_map(|name| {
				self.filters
					.get(name)
					.map(|filter| (name.to_string(), Arc::clone(filter)))
			})
			.collect();
		Self { filters }
	}
}

fn arg<'a>(args: &'a [Value], index: usize, filter: &str) -> Result<&'a Value, String> {
	args.get(index)
		.ok_or_else(|| format!("`{filter}` expects at least {} argument(s)", index + 1))
}

fn text_arg(args: &[Value], index: usize, filter: &str) -> Result<String, String> {
	arg(args, index, filter).map(to_text)
}

fn number_arg(args: &[Value], index: usize, filter: &str) -> Result<f64, String> {
	arg(args, index, filter).and_then(to_number)
}

fn items(value: &Value) -> Result<Vec<Value>, String> {
	value
		.try_iter()
		.map(Iterator::collect)
		.map_err(|_| format!("`{}` is not a sequence", render_value(value)))
}

fn arithmetic(value: &Value, args: &[Value], filter: &str, op: fn(f64, f64) -> f64) -> Result<Value, String> {
	let left = to_number(value)?;
	let right = number_arg(args, 0, filter)?;
	Ok(from_number(op(left, right)))
}

fn escape_html(text: &str) -> String {
	let mut escaped = String::with_capacity(text.len());
	for ch in text.chars() {
		match ch {
			'&' => escaped.push_str("&amp;"),
			'<' => escaped.push_str("&lt;"),
			'>' => escaped.push_str("&gt;"),
			'"' => escaped.push_str("&#34;"),
			'\'' => escaped.push_str("&#39;"),
			other => escaped.push(other),
		}
	}
	escaped
}

fn unescape_html(text: &str) -> String {
	ENTITY_PATTERN
		.replace_all(text, |captures: &regex::Captures<'_>| {
			match &captures[0] {
				"&amp;" => "&",
				"&lt;" => "<",
				"&gt;" => ">",
				"&#34;" => "\"",
				_ => "'",
			}
		})
		.into_owned()
}

fn capitalize(text: &str) -> String {
	let mut chars = text.chars();
	match chars.next() {
		Some(first) => first.to_uppercase().chain(chars).collect(),
		None => String::new(),
	}
}

fn truncate(value: Value, args: &[Value]) -> Result<Value, String> {
	let text = to_text(&value);
	let length = args.first().map(to_integer).transpose()?.unwrap_or(50).max(0) as usize;
	let ellipsis = args.get(1).map_or_else(|| "...".to_string(), to_text);

	if text.chars().count() <= length {
		return Ok(Value::from(text));
	}

	let keep = length.saturating_sub(ellipsis.chars().count());
	let truncated: String = text.chars().take(keep).collect();
	Ok(Value::from(truncated + &ellipsis))
}

fn round(value: Value, args: &[Value]) -> Result<Value, String> {
	let number = to_number(&value)?;
	let digits = args.first().map(to_integer).transpose()?.unwrap_or(0);
	let factor = 10f64.powi(digits as i32);
	Ok(from_number((number * factor).round() / factor))
}

fn size(value: Value, _: &[Value]) -> Result<Value, String> {
	let size = match value.as_str() {
		Some(text) => text.chars().count(),
		None => value.len().unwrap_or(0),
	};
	Ok(Value::from(size))
}

fn first(value: Value, _: &[Value]) -> Result<Value, String> {
	if let Some(text) = value.as_str() {
		return Ok(text.chars().next().map_or(Value::UNDEFINED, |ch| Value::from(ch.to_string())));
	}
	Ok(items(&value)?.into_iter().next().unwrap_or(Value::UNDEFINED))
}

fn last(value: Value, _: &[Value]) -> Result<Value, String> {
	if let Some(text) = value.as_str() {
		return Ok(text.chars().last().map_or(Value::UNDEFINED, |ch| Value::from(ch.to_string())));
	}
	Ok(items(&value)?.into_iter().last().unwrap_or(Value::UNDEFINED))
}

fn reverse(value: Value, _: &[Value]) -> Result<Value, String> {
	if let Some(text) = value.as_str() {
		return Ok(Value::from(text.chars().rev().collect::<String>()));
	}
	let mut values = items(&value)?;
	values.reverse();
	Ok(Value::from(values))
}

fn join(value: Value, args: &[Value]) -> Result<Value, String> {
	let separator = args.first().map_or_else(|| " ".to_string(), to_text);
	let parts: Vec<String> = items(&value)?.iter().map(to_text).collect();
	Ok(Value::from(parts.join(&separator)))
}

fn split(value: Value, args: &[Value]) -> Result<Value, String> {
	let text = to_text(&value);
	let separator = text_arg(args, 0, "split")?;
	let parts: Vec<Value> = if separator.is_empty() {
		text.chars().map(|ch| Value::from(ch.to_string())).collect()
	} else {
		text.split(separator.as_str()).map(Value::from).collect()
	};
	Ok(Value::from(parts))
}

fn default(value: Value, args: &[Value]) -> Result<Value, String> {
	if is_blank(&value) {
		Ok(arg(args, 0, "default")?.clone())
	} else {
		Ok(value)
	}
}

fn abs(value: Value, _: &[Value]) -> Result<Value, String> {
	Ok(from_number(to_number(&value)?.abs()))
}

fn ceil(value: Value, _: &[Value]) -> Result<Value, String> {
	Ok(from_number(to_number(&value)?.ceil()))
}

fn floor(value: Value, _: &[Value]) -> Result<Value, String> {
	Ok(from_number(to_number(&value)?.floor()))
}

fn builtin_registry() -> FilterRegistry {
	let mut registry = FilterRegistry::new();

	registry.insert("abs", abs);
	registry.insert("append", |value: Value, args: &[Value]| {
		Ok(Value::from(to_text(&value) + &text_arg(args, 0, "append")?))
	});
	registry.insert("capitalize", |value: Value, _: &[Value]| Ok(Value::from(capitalize(&to_text(&value)))));
	registry.insert("ceil", ceil);
	registry.insert("default", default);
	registry.insert("divided_by", |value: Value, args: &[Value]| {
		let divisor = number_arg(args, 0, "divided_by")?;
		if divisor == 0.0 {
			return Err("division by zero".to_string());
		}
		Ok(from_number(to_number(&value)? / divisor))
	});
	registry.insert("downcase", |value: Value, _: &[Value]| Ok(Value::from(to_text(&value).to_lowercase())));
	registry.insert("escape", |value: Value, _: &[Value]| Ok(Value::from(escape_html(&to_text(&value)))));
	registry.insert("escape_once", |value: Value, _: &[Value]| {
		Ok(Value::from(escape_html(&unescape_html(&to_text(&value)))))
	});
	registry.insert("first", first);
	registry.insert("floor", floor);
	registry.insert("ifnot", default);
	registry.insert("join", join);
	registry.insert("last", last);
	registry.insert("lstrip", |value: Value, _: &[Value]| Ok(Value::from(to_text(&value).trim_start())));
	registry.insert("minus", |value: Value, args: &[Value]| arithmetic(&value, args, "minus", |a, b| a - b));
	registry.insert("modulo", |value: Value, args: &[Value]| arithmetic(&value, args, "modulo", |a, b| a % b));
	registry.insert("plus", |value: Value, args: &[Value]| arithmetic(&value, args, "plus", |a, b| a + b));
	registry.insert("prepend", |value: Value, args: &[Value]| {
		Ok(Value::from(text_arg(args, 0, "prepend")? + &to_text(&value)))
	});
	registry.insert("remove", |value: Value, args: &[Value]| {
		Ok(Value::from(to_text(&value).replace(&text_arg(args, 0, "remove")?, "")))
	});
	registry.insert("replace", |value: Value, args: &[Value]| {
		let from = text_arg(args, 0, "replace")?;
		let to = args.get(1).map(to_text).unwrap_or_default();
		Ok(Value::from(to_text(&value).replace(&from, &to)))
	});
	registry.insert("reverse", reverse);
	registry.insert("round", round);
	registry.insert("rstrip", |value: Value, _: &[Value]| Ok(Value::from(to_text(&value).trim_end())));
	registry.insert("size", size);
	registry.insert("split", split);
	registry.insert("strip", |value: Value, _: &[Value]| Ok(Value::from(to_text(&value).trim())));
	registry.insert("times", |value: Value, args: &[Value]| arithmetic(&value, args, "times", |a, b| a * b));
	registry.insert("truncate", truncate);
	registry.insert("unescape", |value: Value, _: &[Value]| Ok(Value::from(unescape_html(&to_text(&value)))));
	registry.insert("upcase", |value: Value, _: &[Value]| Ok(Value::from(to_text(&value).to_uppercase())));

	registry
}
