use std::fmt;
use std::fmt::Display;

use indexmap::IndexMap;

use crate::SourcePos;
use crate::tokens::FilterCall;

/// A host expression with its filter chain. `{{ x | f: 1 | g }}` holds `x`
/// as the base and applies `f` then `g`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expr {
	pub base: String,
	pub filters: Vec<FilterCall>,
	/// Free variable read by the expression, checked to exist at runtime.
	pub local: Option<String>,
}

impl Expr {
	pub fn new(base: impl Into<String>) -> Self {
		Self {
			base: base.into(),
			filters: vec![],
			local: None,
		}
	}

	pub fn with_filters(mut self, filters: Vec<FilterCall>) -> Self {
		self.filters = filters;
		self
	}

	pub fn with_local(mut self, local: Option<String>) -> Self {
		self.local = local;
		self
	}
}

impl Display for Expr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut rendered = self.base.clone();
		for filter in &self.filters {
			let mut call = format!("{}({rendered}", filter.name);
			for arg in &filter.args {
				call.push_str(", ");
				call.push_str(arg);
			}
			call.push(')');
			rendered = call;
		}
		f.write_str(&rendered)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
	Set,
	Add,
	Subtract,
	Multiply,
	Divide,
}

impl AssignOp {
	pub fn parse(op: &str) -> Option<Self> {
		match op {
			"=" => Some(Self::Set),
			"+=" => Some(Self::Add),
			"-=" => Some(Self::Subtract),
			"*=" => Some(Self::Multiply),
			"/=" => Some(Self::Divide),
			_ => None,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Set => "=",
			Self::Add => "+=",
			Self::Subtract => "-=",
			Self::Multiply => "*=",
			Self::Divide => "/=",
		}
	}
}

/// One `if` / `elseif` branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
	pub condition: Expr,
	pub negate: bool,
	pub body: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArmLabel {
	When(Vec<Expr>),
	Default,
}

/// A `when` or `default` arm of a `case`. Arms fall through into the next
/// one unless they end with `break`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arm {
	pub label: ArmLabel,
	pub body: Vec<Instruction>,
}

/// Names bound by each iteration of a `for` loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopBinding {
	/// `for item in items`
	Value(String),
	/// `for key, value in items`
	KeyValue(String, String),
	/// `for [first, , third] in rows`
	Array(Vec<Option<String>>),
	/// `for {name, age} in people`
	Object(Vec<String>),
}

impl Display for LoopBinding {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Value(name) => f.write_str(name),
			Self::KeyValue(key, value) => write!(f, "{key}, {value}"),
			Self::Array(names) => {
				let names: Vec<&str> = names.iter().map(|name| name.as_deref().unwrap_or("")).collect();
				write!(f, "[{}]", names.join(", "))
			}
			Self::Object(names) => write!(f, "{{{}}}", names.join(", ")),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iterable {
	Expr(Expr),
	/// Inclusive integer range `start..end`.
	Range { start: Expr, end: Expr },
}

impl Display for Iterable {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Expr(expr) => write!(f, "{expr}"),
			Self::Range { start, end } => write!(f, "{start}..{end}"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForLoop {
	pub binding: LoopBinding,
	pub iterable: Iterable,
	/// Iterations with an index below `offset` are skipped.
	pub offset: Option<i64>,
	/// Iterations with an index above `limit` are skipped.
	pub limit: Option<i64>,
	pub body: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
	/// Source position of the output that follows.
	Position(SourcePos),
	Text(String),
	Emit(Expr),
	Assign {
		name: String,
		op: AssignOp,
		value: Expr,
		declare: bool,
	},
	Capture {
		name: String,
		text: String,
		declare: bool,
	},
	If {
		branches: Vec<Branch>,
		otherwise: Option<Vec<Instruction>>,
	},
	Switch {
		subject: Expr,
		arms: Vec<Arm>,
	},
	For(Box<ForLoop>),
	Break,
	Continue,
	CallMixin {
		name: String,
		args: Vec<Expr>,
	},
	CallBlock(String),
	/// A host script snippet from a `js` block.
	Script(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mixin {
	pub params: Vec<String>,
	pub body: Vec<Instruction>,
}

/// The compiled form of a template: the main body plus the deferred mixin
/// and block definitions it refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
	pub body: Vec<Instruction>,
	pub mixins: IndexMap<String, Mixin>,
	pub blocks: IndexMap<String, Vec<Instruction>>,
	/// Filters bundled with the program when the runtime was inlined.
	pub inlined_filters: Option<Vec<String>>,
}

fn indent(f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
	for _ in 0..depth {
		f.write_str("  ")?;
	}
	Ok(())
}

fn write_body(f: &mut fmt::Formatter<'_>, body: &[Instruction], depth: usize) -> fmt::Result {
	for instruction in body {
		write_instruction(f, instruction, depth)?;
	}
	Ok(())
}

fn write_block(
	f: &mut fmt::Formatter<'_>,
	header: impl Display,
	body: &[Instruction],
	depth: usize,
) -> fmt::Result {
	indent(f, depth)?;
	writeln!(f, "{header} {{")?;
	write_body(f, body, depth + 1)?;
	indent(f, depth)?;
	writeln!(f, "}}")
}

fn write_instruction(f: &mut fmt::Formatter<'_>, instruction: &Instruction, depth: usize) -> fmt::Result {
	match instruction {
		Instruction::If { branches, otherwise } => {
			for (index, branch) in branches.iter().enumerate() {
				let keyword = if index == 0 { "if" } else { "else if" };
				let condition = if branch.negate {
					format!("not ({})", branch.condition)
				} else {
					branch.condition.to_string()
				};
				write_block(f, format_args!("{keyword} {condition}"), &branch.body, depth)?;
			}
			if let Some(otherwise) = otherwise {
				write_block(f, "else", otherwise, depth)?;
			}
			Ok(())
		}
		Instruction::Switch { subject, arms } => {
			indent(f, depth)?;
			writeln!(f, "switch {subject} {{")?;
			for arm in arms {
				match &arm.label {
					ArmLabel::When(values) => {
						let values: Vec<String> = values.iter().map(ToString::to_string).collect();
						write_block(f, format_args!("when {}", values.join(", ")), &arm.body, depth + 1)?;
					}
					ArmLabel::Default => write_block(f, "default", &arm.body, depth + 1)?,
				}
			}
			indent(f, depth)?;
			writeln!(f, "}}")
		}
		Instruction::For(for_loop) => {
			let mut header = format!("for {} in {}", for_loop.binding, for_loop.iterable);
			if let Some(offset) = for_loop.offset {
				header.push_str(&format!(" | offset {offset}"));
			}
			if let Some(limit) = for_loop.limit {
				header.push_str(&format!(" | limit {limit}"));
			}
			write_block(f, header, &for_loop.body, depth)
		}
		other => {
			indent(f, depth)?;
			match other {
				Instruction::Position(pos) => writeln!(f, "@ {pos}"),
				Instruction::Text(text) => writeln!(f, "text {text:?}"),
				Instruction::Emit(expr) => writeln!(f, "emit {expr}"),
				Instruction::Assign {
					name,
					op,
					value,
					declare,
				} => {
					let keyword = if *declare { "let" } else { "set" };
					writeln!(f, "{keyword} {name} {} {value}", op.as_str())
				}
				Instruction::Capture {
					name,
					text,
					declare,
				} => {
					let keyword = if *declare { "let" } else { "set" };
					writeln!(f, "{keyword} {name} = {text:?}")
				}
				Instruction::Break => writeln!(f, "break"),
				Instruction::Continue => writeln!(f, "continue"),
				Instruction::CallMixin { name, args } => {
					let args: Vec<String> = args.iter().map(ToString::to_string).collect();
					writeln!(f, "call {name}({})", args.join(", "))
				}
				Instruction::CallBlock(name) => writeln!(f, "block {name}"),
				Instruction::Script(script) => writeln!(f, "script {script:?}"),
				Instruction::If { .. } | Instruction::Switch { .. } | Instruction::For(_) => Ok(()),
			}
		}
	}
}

impl Display for Program {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write_body(f, &self.body, 0)?;

		for (name, mixin) in &self.mixins {
			write_block(
				f,
				format_args!("mixin {name}({})", mixin.params.join(", ")),
				&mixin.body,
				0,
			)?;
		}

		for (name, body) in &self.blocks {
			write_block(f, format_args!("define block {name}"), body, 0)?;
		}

		if let Some(filters) = &self.inlined_filters {
			writeln!(f, "runtime filters({})", filters.join(", "))?;
		}

		Ok(())
	}
}
