use std::borrow::Cow;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::PoisonError;

use minijinja::Environment;
use minijinja::Expression;
use minijinja::Value;

/// Identifiers may start with `$` in templates but not in expressions.
const DOLLAR_PREFIX: &str = "__dollar_";

static ENVIRONMENT: LazyLock<Environment<'static>> = LazyLock::new(Environment::new);

/// Resolves a variable name to its current value.
pub type Lookup<'a> = dyn Fn(&str) -> Option<Value> + 'a;

/// Evaluates the host expressions embedded in a template.
pub trait Evaluator: Send + Sync {
	/// Validate the syntax of `expression` without evaluating it.
	fn check(&self, expression: &str) -> Result<(), String>;

	/// Evaluate `expression`, resolving the variables it reads through
	/// `lookup`.
	fn evaluate(&self, expression: &str, lookup: &Lookup<'_>) -> Result<Value, String>;
}

/// A compiled expression and the variables it reads, as `(name in the
/// expression, name in the template)` pairs.
struct Compiled {
	expression: Expression<'static, 'static>,
	names: Vec<(String, String)>,
}

/// The default evaluator, backed by minijinja expressions. Each distinct
/// expression is compiled once and reused.
#[derive(Default)]
pub struct JinjaEvaluator {
	cache: Mutex<HashMap<String, Arc<Compiled>>>,
}

impl fmt::Debug for JinjaEvaluator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let cached = self.cache.lock().unwrap_or_else(PoisonError::into_inner).len();
		f.debug_struct("JinjaEvaluator").field("cached", &cached).finish()
	}
}

impl JinjaEvaluator {
	pub fn new() -> Self {
		Self::default()
	}

	fn compiled(&self, expression: &str) -> Result<Arc<Compiled>, String> {
		if let Some(compiled) = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(expression) {
			return Ok(Arc::clone(compiled));
		}

		let source = translate(expression).into_owned();
		let compiled = ENVIRONMENT
			.compile_expression_owned(source)
			.map_err(|error| error.to_string())?;

		let mut names: Vec<(String, String)> = compiled
			.undeclared_variables(false)
			.into_iter()
			.map(|name| {
				let original = match name.strip_prefix(DOLLAR_PREFIX) {
					Some(rest) => format!("${rest}"),
					None => name.clone(),
				};
				(name, original)
			})
			.collect();
		names.sort();

		let compiled = Arc::new(Compiled {
			expression: compiled,
			names,
		});
		self.cache
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(expression.to_string(), Arc::clone(&compiled));

		Ok(compiled)
	}
}

impl Evaluator for JinjaEvaluator {
	fn check(&self, expression: &str) -> Result<(), String> {
		self.compiled(expression).map(|_| ())
	}

	fn evaluate(&self, expression: &str, lookup: &Lookup<'_>) -> Result<Value, String> {
		let compiled = self.compiled(expression)?;
		let context: BTreeMap<&str, Value> = compiled
			.names
			.iter()
			.filter_map(|(name, original)| lookup(original).map(|value| (name.as_str(), value)))
			.collect();

		compiled.expression.eval(context).map_err(|error| error.to_string())
	}
}

/// Rewrite `$name` identifiers outside string literals so the expression
/// language accepts them.
fn translate(expression: &str) -> Cow<'_, str> {
	if !expression.contains('$') {
		return Cow::Borrowed(expression);
	}

	let mut translated = String::with_capacity(expression.len() + DOLLAR_PREFIX.len());
	let mut quote: Option<char> = None;
	let mut escaped = false;
	let mut previous: Option<char> = None;

	for ch in expression.chars() {
		if let Some(open) = quote {
			if escaped {
				escaped = false;
			} else if ch == '\\' {
				escaped = true;
			} else if ch == open {
				quote = None;
			}
			translated.push(ch);
		} else if ch == '"' || ch == '\'' {
			quote = Some(ch);
			translated.push(ch);
		} else if ch == '$' && !previous.is_some_and(|prev| prev.is_alphanumeric() || prev == '_') {
			translated.push_str(DOLLAR_PREFIX);
		} else {
			translated.push(ch);
		}
		previous = Some(ch);
	}

	Cow::Owned(translated)
}
