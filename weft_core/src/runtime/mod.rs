//! Executes a compiled [`Program`].
//!
//! A [`Template`] pairs a program with the sources it was compiled from, so
//! runtime errors can point back at the template line that raised them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use minijinja::Value;
use minijinja::value::ValueKind;
use serde::Serialize;

pub use self::evaluator::*;
pub use self::script::*;
use crate::DEFAULT_CONTEXT_RADIUS;
use crate::FileMap;
use crate::FilterRegistry;
use crate::SourceContext;
use crate::SourcePos;
use crate::WeftError;
use crate::WeftResult;
use crate::ir::Arm;
use crate::ir::ArmLabel;
use crate::ir::AssignOp;
use crate::ir::Expr;
use crate::ir::ForLoop;
use crate::ir::Instruction;
use crate::ir::Iterable;
use crate::ir::LoopBinding;
use crate::ir::Program;
use crate::value::from_number;
use crate::value::render_value;
use crate::value::to_integer;
use crate::value::to_number;
use crate::value::to_text;

mod evaluator;
mod script;

/// Mixins may call each other, including themselves, up to this depth.
pub const MAX_MIXIN_DEPTH: usize = 64;

/// The filters and expression evaluator a template renders with.
#[derive(Clone)]
pub struct Runtime {
	pub filters: FilterRegistry,
	pub evaluator: Arc<dyn Evaluator>,
}

impl fmt::Debug for Runtime {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Runtime")
			.field("filters", &self.filters)
			.finish_non_exhaustive()
	}
}

impl Default for Runtime {
	fn default() -> Self {
		Self {
			filters: FilterRegistry::builtin().clone(),
			evaluator: Arc::new(JinjaEvaluator::new()),
		}
	}
}

impl Runtime {
	/// The built-in filters overlaid with `extra`.
	pub fn with_filters(extra: &FilterRegistry) -> Self {
		Self {
			filters: FilterRegistry::builtin().merged(extra),
			..Self::default()
		}
	}

	pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
		self.evaluator = evaluator;
		self
	}
}

/// An executable template.
#[derive(Debug, Clone)]
pub struct Template {
	program: Arc<Program>,
	file_map: Arc<FileMap>,
	/// The bundled runtime when it was inlined at compile time, the built-in
	/// one otherwise. Its evaluator keeps the expressions compiled while
	/// producing.
	runtime: Runtime,
	inlined: bool,
}

impl Template {
	/// Validate every expression and script in `program` and wrap it for
	/// execution.
	#[tracing::instrument(level = "debug", skip_all)]
	pub fn produce(program: Arc<Program>, file_map: Arc<FileMap>, runtime: Option<Runtime>) -> WeftResult<Self> {
		let inlined = runtime.is_some();
		let runtime = runtime.unwrap_or_default();

		let mut checker = Checker {
			evaluator: runtime.evaluator.as_ref(),
			file_map: &file_map,
			position: None,
		};
		checker.body(&program.body)?;
		for mixin in program.mixins.values() {
			checker.body(&mixin.body)?;
		}
		for body in program.blocks.values() {
			checker.body(body)?;
		}

		Ok(Self {
			program,
			file_map,
			runtime,
			inlined,
		})
	}

	pub fn program(&self) -> &Program {
		&self.program
	}

	/// Whether the template carries its own runtime.
	pub fn is_inlined(&self) -> bool {
		self.inlined
	}

	/// Render with the bundled runtime, or the built-in one when nothing was
	/// inlined.
	pub fn render<S: Serialize>(&self, bindings: S) -> WeftResult<String> {
		self.render_with(bindings, &self.runtime)
	}

	/// Render with an explicit runtime. Bindings must serialize to a map;
	/// `()` and `None` stand for no bindings.
	#[tracing::instrument(level = "debug", skip_all)]
	pub fn render_with<S: Serialize>(&self, bindings: S, runtime: &Runtime) -> WeftResult<String> {
		let globals = bindings_map(&Value::from_serialize(bindings))?;
		let mut machine = Machine {
			program: &self.program,
			file_map: &self.file_map,
			runtime,
			globals,
			frames: vec![],
			position: None,
			depth: 0,
			out: String::new(),
		};

		machine.run(&self.program.body)?;
		tracing::debug!(bytes = machine.out.len(), "rendered template");

		Ok(machine.out)
	}
}

fn bindings_map(bindings: &Value) -> WeftResult<BTreeMap<String, Value>> {
	let invalid = || WeftError::InvalidBindings {
		kind: bindings.kind().to_string(),
	};

	match bindings.kind() {
		ValueKind::Undefined | ValueKind::None => Ok(BTreeMap::new()),
		ValueKind::Map => {
			let keys = bindings.try_iter().map_err(|_| invalid())?;
			Ok(keys
				.map(|key| {
					let value = bindings.get_item(&key).unwrap_or_default();
					(to_text(&key), value)
				})
				.collect())
		}
		_ => Err(invalid()),
	}
}

/// Validates expressions ahead of execution.
struct Checker<'a> {
	evaluator: &'a dyn Evaluator,
	file_map: &'a FileMap,
	position: Option<SourcePos>,
}

impl Checker<'_> {
	fn error(&self, expression: &str, reason: String) -> WeftError {
		WeftError::CompileEval {
			reason: format!("`{expression}`: {reason}"),
			context: self
				.position
				.as_ref()
				.map_or_else(SourceContext::none, |pos| {
					SourceContext::at(pos, self.file_map, DEFAULT_CONTEXT_RADIUS)
				}),
		}
	}

	fn source(&self, expression: &str) -> WeftResult<()> {
		self.evaluator
			.check(expression)
			.map_err(|reason| self.error(expression, reason))
	}

	fn expr(&self, expr: &Expr) -> WeftResult<()> {
		self.source(&expr.base)?;
		for filter in &expr.filters {
			for arg in &filter.args {
				self.source(arg)?;
			}
		}
		Ok(())
	}

	fn body(&mut self, body: &[Instruction]) -> WeftResult<()> {
		for instruction in body {
			match instruction {
				Instruction::Position(pos) => self.position = Some(pos.clone()),
				Instruction::Text(_)
				| Instruction::Capture { .. }
				| Instruction::Break
				| Instruction::Continue
				| Instruction::CallBlock(_) => {}
				Instruction::Emit(expr) | Instruction::Assign { value: expr, .. } => self.expr(expr)?,
				Instruction::If { branches, otherwise } => {
					for branch in branches {
						self.expr(&branch.condition)?;
						self.body(&branch.body)?;
					}
					if let Some(otherwise) = otherwise {
						self.body(otherwise)?;
					}
				}
				Instruction::Switch { subject, arms } => {
					self.expr(subject)?;
					for arm in arms {
						if let ArmLabel::When(values) = &arm.label {
							for value in values {
								self.expr(value)?;
							}
						}
						self.body(&arm.body)?;
					}
				}
				Instruction::For(for_loop) => {
					match &for_loop.iterable {
						Iterable::Expr(expr) => self.expr(expr)?,
						Iterable::Range { start, end } => {
							self.expr(start)?;
							self.expr(end)?;
						}
					}
					self.body(&for_loop.body)?;
				}
				Instruction::CallMixin { args, .. } => {
					for arg in args {
						self.expr(arg)?;
					}
				}
				Instruction::Script(script) => {
					let statements = parse_script(script).map_err(|reason| self.error(script.trim(), reason))?;
					for statement in &statements {
						self.source(&statement.value)?;
					}
				}
			}
		}

		Ok(())
	}
}

/// How a body finished executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
	Normal,
	Break,
	Continue,
}

/// Execution state of a single render.
struct Machine<'a> {
	program: &'a Program,
	file_map: &'a FileMap,
	runtime: &'a Runtime,
	globals: BTreeMap<String, Value>,
	/// Template scopes, innermost last.
	frames: Vec<BTreeMap<String, Value>>,
	position: Option<SourcePos>,
	depth: usize,
	out: String,
}

impl Machine<'_> {
	fn context(&self) -> SourceContext {
		self.position.as_ref().map_or_else(SourceContext::none, |pos| {
			SourceContext::at(pos, self.file_map, DEFAULT_CONTEXT_RADIUS)
		})
	}

	fn lookup(&self, name: &str) -> Option<&Value> {
		self.frames
			.iter()
			.rev()
			.find_map(|frame| frame.get(name))
			.or_else(|| self.globals.get(name))
	}

	/// Bind `name` in the innermost scope.
	fn declare(&mut self, name: &str, value: Value) {
		match self.frames.last_mut() {
			Some(frame) => frame.insert(name.to_string(), value),
			None => self.globals.insert(name.to_string(), value),
		};
	}

	/// Reassign the nearest visible `name`, declaring it when nothing is.
	fn reassign(&mut self, name: &str, value: Value) {
		if let Some(frame) = self.frames.iter_mut().rev().find(|frame| frame.contains_key(name)) {
			frame.insert(name.to_string(), value);
		} else if let Some(global) = self.globals.get_mut(name) {
			*global = value;
		} else {
			self.declare(name, value);
		}
	}

	fn store(&mut self, name: &str, value: Value, declare: bool) {
		if declare {
			self.declare(name, value);
		} else {
			self.reassign(name, value);
		}
	}

	fn evaluate(&self, expression: &str) -> WeftResult<Value> {
		self.runtime
			.evaluator
			.evaluate(expression, &|name: &str| self.lookup(name).cloned())
			.map_err(|reason| WeftError::Evaluation {
				expression: expression.to_string(),
				reason,
				context: self.context(),
			})
	}

	/// Evaluate an expression and pipe it through its filters in order.
	fn eval(&self, expr: &Expr) -> WeftResult<Value> {
		if let Some(local) = &expr.local {
			if self.lookup(local).is_none() {
				return Err(WeftError::UndefinedVariable {
					name: local.clone(),
					context: self.context(),
				});
			}
		}

		let mut value = self.evaluate(&expr.base)?;
		for call in &expr.filters {
			let Some(filter) = self.runtime.filters.get(&call.name) else {
				return Err(WeftError::UnknownFilter {
					name: call.name.clone(),
					context: self.context(),
				});
			};

			let args = call
				.args
				.iter()
				.map(|arg| self.evaluate(arg))
				.collect::<WeftResult<Vec<_>>>()?;

			value = filter.apply(value, &args).map_err(|reason| WeftError::FilterFailed {
				name: call.name.clone(),
				reason,
				context: self.context(),
			})?;
		}

		Ok(value)
	}

	/// Run `body` inside a fresh scope.
	fn scoped(&mut self, body: &[Instruction]) -> WeftResult<Flow> {
		self.frames.push(BTreeMap::new());
		let flow = self.run(body);
		self.frames.pop();
		flow
	}

	fn run(&mut self, body: &[Instruction]) -> WeftResult<Flow> {
		for instruction in body {
			match instruction {
				Instruction::Position(pos) => self.position = Some(pos.clone()),
				Instruction::Text(text) => self.out.push_str(text),
				Instruction::Emit(expr) => {
					let value = self.eval(expr)?;
					self.out.push_str(&render_value(&value));
				}
				Instruction::Assign {
					name,
					op,
					value,
					declare,
				} => {
					let value = self.eval(value)?;
					let value = match op {
						AssignOp::Set => value,
						op => {
							let current = self.lookup(name).cloned().unwrap_or(Value::UNDEFINED);
							self.combine(*op, &current, &value)?
						}
					};
					self.store(name, value, *declare);
				}
				Instruction::Capture { name, text, declare } => {
					self.store(name, Value::from(text.as_str()), *declare);
				}
				Instruction::If { branches, otherwise } => {
					let mut chosen = otherwise.as_deref();
					for branch in branches {
						if self.eval(&branch.condition)?.is_true() != branch.negate {
							chosen = Some(branch.body.as_slice());
							break;
						}
					}

					if let Some(body) = chosen {
						let flow = self.scoped(body)?;
						if flow != Flow::Normal {
							return Ok(flow);
						}
					}
				}
				Instruction::Switch { subject, arms } => {
					if self.switch(subject, arms)? == Flow::Continue {
						return Ok(Flow::Continue);
					}
				}
				Instruction::For(for_loop) => self.for_loop(for_loop)?,
				Instruction::Break => return Ok(Flow::Break),
				Instruction::Continue => return Ok(Flow::Continue),
				Instruction::CallMixin { name, args } => self.call_mixin(name, args)?,
				Instruction::CallBlock(name) => {
					let program = self.program;
					if let Some(body) = program.blocks.get(name) {
						self.scoped(body)?;
					}
				}
				Instruction::Script(script) => self.script(script)?,
			}
		}

		Ok(Flow::Normal)
	}

	fn combine(&self, op: AssignOp, current: &Value, value: &Value) -> WeftResult<Value> {
		let concat = op == AssignOp::Add
			&& (current.kind() == ValueKind::String || value.kind() == ValueKind::String);
		if concat {
			return Ok(Value::from(to_text(current) + &to_text(value)));
		}

		let failed = |reason: String| WeftError::Evaluation {
			expression: format!("{} {} {}", render_value(current), op.as_str(), render_value(value)),
			reason,
			context: self.context(),
		};

		let (left, right) = (to_number(current).map_err(failed)?, to_number(value).map_err(failed)?);
		let number = match op {
			AssignOp::Set => right,
			AssignOp::Add => left + right,
			AssignOp::Subtract => left - right,
			AssignOp::Multiply => left * right,
			AssignOp::Divide => left / right,
		};

		Ok(from_number(number))
	}

	/// Run the arms from the first match onward until one breaks.
	fn switch(&mut self, subject: &Expr, arms: &[Arm]) -> WeftResult<Flow> {
		let subject = self.eval(subject)?;

		let mut start = None;
		'arms: for (index, arm) in arms.iter().enumerate() {
			if let ArmLabel::When(values) = &arm.label {
				for value in values {
					if self.eval(value)? == subject {
						start = Some(index);
						break 'arms;
					}
				}
			}
		}

		let start = start.or_else(|| arms.iter().position(|arm| arm.label == ArmLabel::Default));
		let Some(start) = start else {
			return Ok(Flow::Normal);
		};

		self.frames.push(BTreeMap::new());
		let mut result = Ok(Flow::Normal);
		for arm in &arms[start..] {
			match self.run(&arm.body) {
				Ok(Flow::Normal) => {}
				Ok(Flow::Break) => break,
				other => {
					result = other;
					break;
				}
			}
		}
		self.frames.pop();

		result
	}

	/// Key and item of every element, plus whether the value was a map.
	fn entries(&self, value: &Value, expr: &Expr) -> WeftResult<(Vec<(Value, Value)>, bool)> {
		let not_iterable = || WeftError::NotIterable {
			expression: expr.to_string(),
			context: self.context(),
		};

		match value.kind() {
			ValueKind::String => {
				let text = value.as_str().unwrap_or_default();
				let entries = text
					.chars()
					.enumerate()
					.map(|(index, ch)| (Value::from(index), Value::from(ch.to_string())))
					.collect();
				Ok((entries, false))
			}
			ValueKind::Map => {
				let keys = value.try_iter().map_err(|_| not_iterable())?;
				let entries = keys
					.map(|key| {
						let item = value.get_item(&key).unwrap_or_default();
						(key, item)
					})
					.collect();
				Ok((entries, true))
			}
			ValueKind::Seq | ValueKind::Iterable => {
				let items = value.try_iter().map_err(|_| not_iterable())?;
				let entries = items.enumerate().map(|(index, item)| (Value::from(index), item)).collect();
				Ok((entries, false))
			}
			_ => Err(not_iterable()),
		}
	}

	fn range_bound(&self, expr: &Expr) -> WeftResult<i64> {
		let value = self.eval(expr)?;
		to_integer(&value).map_err(|reason| WeftError::Evaluation {
			expression: expr.to_string(),
			reason,
			context: self.context(),
		})
	}

	fn for_loop(&mut self, for_loop: &ForLoop) -> WeftResult<()> {
		let (entries, is_map) = match &for_loop.iterable {
			Iterable::Range { start, end } => {
				let (start, end) = (self.range_bound(start)?, self.range_bound(end)?);
				let entries = (start..=end)
					.enumerate()
					.map(|(index, number)| (Value::from(index), Value::from(number)))
					.collect();
				(entries, false)
			}
			Iterable::Expr(expr) => {
				let value = self.eval(expr)?;
				self.entries(&value, expr)?
			}
		};

		for (index, (key, item)) in entries.into_iter().enumerate() {
			let index = index as i64;
			let skipped = for_loop.offset.is_some_and(|offset| index < offset)
				|| for_loop.limit.is_some_and(|limit| index > limit);
			if skipped {
				continue;
			}

			let frame = bind(&for_loop.binding, key, item, is_map);
			self.frames.push(frame);
			let flow = self.run(&for_loop.body);
			self.frames.pop();

			if flow? == Flow::Break {
				break;
			}
		}

		Ok(())
	}

	fn call_mixin(&mut self, name: &str, args: &[Expr]) -> WeftResult<()> {
		let program = self.program;
		let Some(mixin) = program.mixins.get(name) else {
			return Err(WeftError::UnknownMixin {
				name: name.to_string(),
				context: self.context(),
			});
		};

		if self.depth >= MAX_MIXIN_DEPTH {
			return Err(WeftError::RecursionLimit {
				limit: MAX_MIXIN_DEPTH,
				context: self.context(),
			});
		}

		let values = args.iter().map(|arg| self.eval(arg)).collect::<WeftResult<Vec<_>>>()?;
		let frame = mixin
			.params
			.iter()
			.enumerate()
			.map(|(index, param)| (param.clone(), values.get(index).cloned().unwrap_or(Value::UNDEFINED)))
			.collect();

		let position = self.position.clone();
		self.depth += 1;
		self.frames.push(frame);
		let flow = self.run(&mixin.body);
		self.frames.pop();
		self.depth -= 1;
		self.position = position;

		flow.map(|_| ())
	}

	fn script(&mut self, script: &str) -> WeftResult<()> {
		let statements = parse_script(script).map_err(|reason| WeftError::Evaluation {
			expression: script.trim().to_string(),
			reason,
			context: self.context(),
		})?;

		for statement in statements {
			let value = self.evaluate(&statement.value)?;
			self.store(&statement.name, value, statement.declare);
		}

		Ok(())
	}
}

/// The scope for one loop iteration.
fn bind(binding: &LoopBinding, key: Value, item: Value, is_map: bool) -> BTreeMap<String, Value> {
	let mut frame = BTreeMap::new();

	match binding {
		LoopBinding::Value(name) => {
			frame.insert(name.clone(), if is_map { key } else { item });
		}
		LoopBinding::KeyValue(key_name, value_name) => {
			frame.insert(key_name.clone(), key);
			frame.insert(value_name.clone(), item);
		}
		LoopBinding::Array(slots) => {
			for (index, slot) in slots.iter().enumerate() {
				if let Some(name) = slot {
					frame.insert(name.clone(), item.get_item_by_index(index).unwrap_or_default());
				}
			}
		}
		LoopBinding::Object(fields) => {
			for field in fields {
				frame.insert(field.clone(), item.get_attr(field).unwrap_or_default());
			}
		}
	}

	frame
}
