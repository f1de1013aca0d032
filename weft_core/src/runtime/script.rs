use crate::lexer::split_unescaped;
use crate::scope::is_variable_name;

/// Keywords that declare a new binding in the current scope.
const DECLARATIONS: [&str; 3] = ["let ", "const ", "var "];

/// One `name = value` statement of a script block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
	pub name: String,
	pub value: String,
	/// Declared with `let`, `const` or `var` rather than reassigned.
	pub declare: bool,
}

/// Parse the body of a `{% js %}` block into assignment statements.
/// Statements end with `;` or a newline. Blank lines and `//` comments are
/// ignored.
pub fn parse_script(script: &str) -> Result<Vec<Statement>, String> {
	let mut statements = vec![];

	for piece in split_unescaped(script, ';') {
		for line in piece.lines() {
			let line = line.trim();
			if line.is_empty() || line.starts_with("//") {
				continue;
			}

			let (declare, rest) = match DECLARATIONS.iter().find_map(|keyword| line.strip_prefix(keyword)) {
				Some(rest) => (true, rest),
				None => (false, line),
			};

			let Some((name, value)) = rest.split_once('=') else {
				return Err(format!("expected an assignment, found `{line}`"));
			};

			if value.starts_with('=') {
				return Err(format!("expected an assignment, found a comparison in `{line}`"));
			}

			let (name, value) = (name.trim(), value.trim());
			if !is_variable_name(name) {
				return Err(format!("`{name}` cannot be assigned to"));
			}

			if value.is_empty() {
				return Err(format!("`{name}` is assigned nothing"));
			}

			statements.push(Statement {
				name: name.to_string(),
				value: value.to_string(),
				declare,
			});
		}
	}

	Ok(statements)
}
