use std::sync::LazyLock;

use regex::Regex;

use super::CompileState;
use super::Deferred;
use super::OpenKind;
use super::TagRegistry;
use crate::WeftError;
use crate::WeftResult;
use crate::ir::Arm;
use crate::ir::ArmLabel;
use crate::ir::AssignOp;
use crate::ir::Branch;
use crate::ir::Expr;
use crate::ir::ForLoop;
use crate::ir::Instruction;
use crate::ir::Iterable;
use crate::ir::LoopBinding;
use crate::lexer::split_unescaped;
use crate::runtime::parse_script;
use crate::scope::is_variable_name;
use crate::tokens::FilterCall;
use crate::tokens::TagToken;

/// `name = value`, `name += value` and friends.
static ASSIGN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^(\S+?)\s*([-+*/]?=)\s*(.+)$").expect("invalid assign pattern")
});

/// `binding in iterable` or `binding of iterable`.
static FOR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^(.+?)\s+(?:in|of)\s+(.+)$").expect("invalid for pattern")
});

/// An inclusive range such as `1..5` or `start..end`.
static RANGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^\(?\s*(-?[$\w.]+)\s*\.\.\s*(-?[$\w.]+)\s*\)?$").expect("invalid range pattern")
});

pub(crate) fn builtin_registry() -> TagRegistry {
	let mut registry = TagRegistry::new();

	registry.insert("assign", assign);
	registry.insert("capture", capture);
	registry.insert("raw", raw);
	registry.insert("comment", comment);
	registry.insert("js", script);
	registry.insert("if", if_tag);
	registry.insert("unless", unless);
	registry.insert("elseif", elseif);
	registry.insert("elsif", elseif);
	registry.insert("else", else_tag);
	registry.insert("endif", end_conditional);
	registry.insert("endunless", end_conditional);
	registry.insert("case", case);
	registry.insert("when", when);
	registry.insert("default", default);
	registry.insert("endcase", endcase);
	registry.insert("for", for_tag);
	registry.insert("endfor", endfor);
	registry.insert("break", break_tag);
	registry.insert("continue", continue_tag);
	registry.insert("mixin", mixin);
	registry.insert("+", call_mixin);
	registry.insert("block", block);
	registry.insert("trim", trim);
	registry.insert("extends", extends);
	registry.insert("include", include);

	for name in ["if", "unless", "for", "case", "js", "mixin", "block"] {
		registry.mark_block(name);
	}
	for name in ["raw", "comment", "capture"] {
		registry.mark_verbatim(name);
	}

	registry
}

fn invalid_use(state: &CompileState<'_>, tag: &TagToken, reason: impl Into<String>) -> WeftError {
	WeftError::InvalidUse {
		tag: tag.name.clone(),
		reason: reason.into(),
		context: state.context(&tag.pos),
	}
}

fn invalid_identifier(state: &CompileState<'_>, tag: &TagToken, name: &str) -> WeftError {
	WeftError::InvalidIdentifier {
		name: name.to_string(),
		context: state.context(&tag.pos),
	}
}

fn invalid_for(state: &CompileState<'_>, tag: &TagToken, reason: impl Into<String>) -> WeftError {
	WeftError::InvalidForLoop {
		reason: reason.into(),
		context: state.context(&tag.pos),
	}
}

/// Bind `name` in the innermost frame. Returns whether this is its first
/// binding in scope.
fn declare(state: &mut CompileState<'_>, name: &str) -> bool {
	let declare = !state.scope().has(name);
	state.scope_mut().add(name);
	declare
}

fn assign(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	let Some(captures) = ASSIGN_PATTERN.captures(&tag.head) else {
		return Err(invalid_use(state, tag, "expected `name = value`"));
	};

	let name = &captures[1];
	if !is_variable_name(name) {
		return Err(invalid_identifier(state, tag, name));
	}

	let op = AssignOp::parse(&captures[2]).unwrap_or(AssignOp::Set);
	let value = state.expr(&captures[3], &tag.filters);
	let declare = declare(state, name) && op == AssignOp::Set;

	state.emit(Instruction::Assign {
		name: name.to_string(),
		op,
		value,
		declare,
	});
	state.advance();
	Ok(())
}

fn capture(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	let name = tag.head.as_str();
	if !is_variable_name(name) {
		return Err(invalid_identifier(state, tag, name));
	}

	let end = state.verbatim_end(state.idx())?;
	let text = state.source_between(state.idx() + 1, end);
	let declare = declare(state, name);

	state.emit(Instruction::Capture {
		name: name.to_string(),
		text,
		declare,
	});
	state.skip_to(end + 1);
	Ok(())
}

fn raw(state: &mut CompileState<'_>, _: &TagToken) -> WeftResult<()> {
	let end = state.verbatim_end(state.idx())?;
	let text = state.source_between(state.idx() + 1, end);
	if !text.is_empty() {
		state.emit(Instruction::Text(text));
	}
	state.skip_to(end + 1);
	Ok(())
}

fn comment(state: &mut CompileState<'_>, _: &TagToken) -> WeftResult<()> {
	let end = state.verbatim_end(state.idx())?;
	state.skip_to(end + 1);
	Ok(())
}

fn script(state: &mut CompileState<'_>, _: &TagToken) -> WeftResult<()> {
	let end = state.find_tag("endjs")?;
	let script = state.source_between(state.idx() + 1, end);

	// Syntax errors are reported when the executable is produced.
	if let Ok(statements) = parse_script(&script) {
		for statement in statements.iter().filter(|statement| statement.declare) {
			state.scope_mut().add(statement.name.clone());
		}
	}

	state.emit(Instruction::Script(script));
	state.skip_to(end + 1);
	Ok(())
}

fn open_conditional(
	state: &mut CompileState<'_>,
	tag: &TagToken,
	closer: &'static str,
	negate: bool,
) -> WeftResult<()> {
	state.find_tag(closer)?;
	if tag.head.is_empty() {
		return Err(invalid_use(state, tag, "a condition is required"));
	}

	let condition = state.expr(&tag.head, &tag.filters);
	state.open(OpenKind::If {
		closer,
		branches: vec![],
		current: Some((condition, negate)),
	});
	state.scope_mut().create();
	state.advance();
	Ok(())
}

fn if_tag(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	open_conditional(state, tag, "endif", false)
}

fn unless(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	open_conditional(state, tag, "endunless", true)
}

/// Finish the branch being filled and start the next one.
fn next_branch(
	state: &mut CompileState<'_>,
	tag: &TagToken,
	next: Option<(Expr, bool)>,
	allowed: &[&str],
) -> WeftResult<()> {
	let reason = format!("`{}` outside of an open `if`", tag.source);
	let Some(frame) = state.top_mut() else {
		return Err(state.nesting_error(reason));
	};

	let OpenKind::If {
		closer,
		branches,
		current,
	} = &mut frame.kind
	else {
		return Err(state.nesting_error(reason));
	};

	if !allowed.contains(closer) {
		return Err(state.nesting_error(reason));
	}

	let Some((condition, negate)) = current.take() else {
		return Err(state.nesting_error(format!("`{}` after `else`", tag.source)));
	};

	branches.push(Branch {
		condition,
		negate,
		body: std::mem::take(&mut frame.body),
	});
	*current = next;

	let scope = state.scope_mut();
	scope.destroy();
	scope.create();
	state.advance();
	Ok(())
}

fn elseif(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	if tag.head.is_empty() {
		return Err(invalid_use(state, tag, "a condition is required"));
	}

	let condition = state.expr(&tag.head, &tag.filters);
	next_branch(state, tag, Some((condition, false)), &["endif"])
}

fn else_tag(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	next_branch(state, tag, None, &["endif", "endunless"])
}

fn end_conditional(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	let frame = state.close(&tag.name)?;
	let closed = frame.kind.describe();
	let OpenKind::If {
		closer,
		mut branches,
		current,
	} = frame.kind
	else {
		return Err(state.nesting_error(format!("`{}` closes a `{closed}`", tag.source)));
	};

	if closer != tag.name {
		return Err(state.nesting_error(format!("`{}` closes a `{closer}` block", tag.source)));
	}

	let otherwise = match current {
		Some((condition, negate)) => {
			branches.push(Branch {
				condition,
				negate,
				body: frame.body,
			});
			None
		}
		None => Some(frame.body),
	};

	state.scope_mut().destroy();
	state.emit(Instruction::If { branches, otherwise });
	state.advance();
	Ok(())
}

/// Whether a body holds nothing but whitespace and positions.
fn is_blank(body: &[Instruction]) -> bool {
	body.iter().all(|instruction| match instruction {
		Instruction::Position(_) => true,
		Instruction::Text(text) => text.trim().is_empty(),
		_ => false,
	})
}

fn case(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	state.find_tag("endcase")?;
	if tag.head.is_empty() {
		return Err(invalid_use(state, tag, "a subject is required"));
	}

	let subject = state.expr(&tag.head, &tag.filters);
	state.open(OpenKind::Case {
		subject,
		arms: vec![],
		current: None,
	});
	state.scope_mut().create();
	state.advance();
	Ok(())
}

/// Finish the arm being filled and start the next one.
fn next_arm(state: &mut CompileState<'_>, tag: &TagToken, next: Option<ArmLabel>) -> WeftResult<()> {
	let reason = format!("`{}` outside of an open `case`", tag.source);
	let Some(frame) = state.top_mut() else {
		return Err(state.nesting_error(reason));
	};

	let OpenKind::Case { arms, current, .. } = &mut frame.kind else {
		return Err(state.nesting_error(reason));
	};

	let body = std::mem::take(&mut frame.body);
	match current.take() {
		Some(label) => arms.push(Arm { label, body }),
		None => {
			if !is_blank(&body) {
				return Err(state.nesting_error("content before the first `when`".to_string()));
			}
			if !matches!(next, Some(ArmLabel::When(_))) {
				return Err(state.nesting_error(format!("`{}` before the first `when`", tag.source)));
			}
		}
	}

	*current = next;
	Ok(())
}

fn when(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	let values: Vec<Expr> = split_unescaped(&tag.head, ',')
		.into_iter()
		.map(str::trim)
		.filter(|value| !value.is_empty())
		.map(|value| state.expr(value, &[]))
		.collect();

	if values.is_empty() {
		return Err(invalid_use(state, tag, "a value is required"));
	}

	next_arm(state, tag, Some(ArmLabel::When(values)))?;
	state.advance();
	Ok(())
}

fn default(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	next_arm(state, tag, Some(ArmLabel::Default))?;
	state.advance();
	Ok(())
}

fn endcase(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	let frame = state.close(&tag.name)?;
	let closed = frame.kind.describe();
	let OpenKind::Case {
		subject,
		mut arms,
		current,
	} = frame.kind
	else {
		return Err(state.nesting_error(format!("`{}` closes a `{closed}`", tag.source)));
	};

	let Some(label) = current else {
		return Err(state.nesting_error("`case` without any `when`".to_string()));
	};
	arms.push(Arm {
		label,
		body: frame.body,
	});

	state.scope_mut().destroy();
	state.emit(Instruction::Switch { subject, arms });
	state.advance();
	Ok(())
}

fn parse_binding(state: &CompileState<'_>, tag: &TagToken, binding: &str) -> WeftResult<LoopBinding> {
	let binding = binding.trim();
	let names = |inner: &str| -> Vec<String> { inner.split(',').map(|name| name.trim().to_string()).collect() };
	let check = |name: &str| -> WeftResult<()> {
		if is_variable_name(name) {
			Ok(())
		} else {
			Err(invalid_identifier(state, tag, name))
		}
	};

	if let Some(inner) = binding.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
		let mut slots = vec![];
		for name in names(inner) {
			if name.is_empty() {
				slots.push(None);
			} else {
				check(&name)?;
				slots.push(Some(name));
			}
		}
		return Ok(LoopBinding::Array(slots));
	}

	if let Some(inner) = binding.strip_prefix('{').and_then(|rest| rest.strip_suffix('}')) {
		let fields: Vec<String> = names(inner).into_iter().filter(|name| !name.is_empty()).collect();
		for name in &fields {
			check(name)?;
		}
		return Ok(LoopBinding::Object(fields));
	}

	let parts = names(binding);
	match parts.as_slice() {
		[value] => {
			check(value)?;
			Ok(LoopBinding::Value(value.clone()))
		}
		[key, value] => {
			check(key)?;
			check(value)?;
			Ok(LoopBinding::KeyValue(key.clone(), value.clone()))
		}
		_ => Err(invalid_for(state, tag, "invalid identifiers in for loop")),
	}
}

fn is_loop_modifier(filter: &FilterCall) -> bool {
	["offset", "limit"].iter().any(|modifier| {
		filter.name == *modifier
			|| filter
				.name
				.strip_prefix(modifier)
				.is_some_and(|rest| rest.starts_with(char::is_whitespace))
	})
}

fn loop_bound(state: &CompileState<'_>, tag: &TagToken, name: &str) -> WeftResult<Option<i64>> {
	tag.filter_arg(name)
		.map(|value| {
			value
				.parse::<i64>()
				.map_err(|_| invalid_for(state, tag, format!("`{name}` must be an integer, found `{value}`")))
		})
		.transpose()
}

fn for_tag(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	state.find_tag("endfor")?;
	let Some(captures) = FOR_PATTERN.captures(&tag.head) else {
		return Err(invalid_for(state, tag, format!("expected `in` or `of` in `{}`", tag.head)));
	};

	let iterable = captures[2].trim();
	if iterable.is_empty() {
		return Err(invalid_for(state, tag, "missing iterable"));
	}

	let binding = parse_binding(state, tag, &captures[1])?;
	let offset = loop_bound(state, tag, "offset")?;
	let limit = loop_bound(state, tag, "limit")?;

	let filters: Vec<FilterCall> = tag.filters.iter().filter(|filter| !is_loop_modifier(filter)).cloned().collect();
	let iterable = match RANGE_PATTERN.captures(iterable) {
		Some(range) if filters.is_empty() => Iterable::Range {
			start: state.expr(&range[1], &[]),
			end: state.expr(&range[2], &[]),
		},
		_ => Iterable::Expr(state.expr(iterable, &filters)),
	};

	state.open(OpenKind::For {
		binding: binding.clone(),
		iterable,
		offset,
		limit,
	});

	let scope = state.scope_mut();
	scope.create();
	match &binding {
		LoopBinding::Value(name) => scope.add(name.clone()),
		LoopBinding::KeyValue(key, value) => {
			scope.add(key.clone());
			scope.add(value.clone());
		}
		LoopBinding::Array(names) => {
			for name in names.iter().flatten() {
				scope.add(name.clone());
			}
		}
		LoopBinding::Object(names) => {
			for name in names {
				scope.add(name.clone());
			}
		}
	}

	state.advance();
	Ok(())
}

fn endfor(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	let frame = state.close(&tag.name)?;
	let closed = frame.kind.describe();
	let OpenKind::For {
		binding,
		iterable,
		offset,
		limit,
	} = frame.kind
	else {
		return Err(state.nesting_error(format!("`{}` closes a `{closed}`", tag.source)));
	};

	state.scope_mut().destroy();
	state.emit(Instruction::For(Box::new(ForLoop {
		binding,
		iterable,
		offset,
		limit,
		body: frame.body,
	})));
	state.advance();
	Ok(())
}

fn break_tag(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	if !state.inside(|kind| matches!(kind, OpenKind::For { .. } | OpenKind::Case { .. })) {
		return Err(invalid_use(state, tag, "only allowed inside `for` or `case`"));
	}

	state.emit(Instruction::Break);
	state.advance();
	Ok(())
}

fn continue_tag(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	if !state.inside(|kind| matches!(kind, OpenKind::For { .. })) {
		return Err(invalid_use(state, tag, "only allowed inside `for`"));
	}

	state.emit(Instruction::Continue);
	state.advance();
	Ok(())
}

fn mixin(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	let mut words = tag.head.split_whitespace();
	let Some(name) = words.next() else {
		return Err(invalid_use(state, tag, "a mixin name is required"));
	};
	if !is_variable_name(name) {
		return Err(invalid_identifier(state, tag, name));
	}

	let mut params = vec![];
	for param in words.flat_map(|word| word.split(',')).filter(|param| !param.is_empty()) {
		if !is_variable_name(param) {
			return Err(invalid_identifier(state, tag, param));
		}
		params.push(param.to_string());
	}

	let end = state.find_tag("endmixin")?;
	state.mixins.insert(name.to_string(), Deferred {
		start: state.idx() + 1,
		end,
		params,
	});
	state.skip_to(end + 1);
	Ok(())
}

fn call_mixin(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	let name = &tag.name[1..];
	let args = split_unescaped(&tag.head, ' ')
		.into_iter()
		.map(str::trim)
		.filter(|arg| !arg.is_empty())
		.map(|arg| state.expr(arg, &[]))
		.collect();

	state.mixin_calls.push((name.to_string(), tag.pos.clone()));
	state.emit(Instruction::CallMixin {
		name: name.to_string(),
		args,
	});
	state.advance();
	Ok(())
}

fn block(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	let Some(name) = tag.head.split_whitespace().next() else {
		return Err(invalid_use(state, tag, "a block name is required"));
	};

	let end = state.find_tag("endblock")?;
	let idx = state.idx();
	let (first, last) = state.block_sites.get(name).copied().unwrap_or((idx, idx));

	if idx == first {
		state.emit(Instruction::CallBlock(name.to_string()));
	}
	if idx == last {
		state.blocks.insert(name.to_string(), Deferred {
			start: idx + 1,
			end,
			params: vec![],
		});
	}

	state.skip_to(end + 1);
	Ok(())
}

fn trim(state: &mut CompileState<'_>, _: &TagToken) -> WeftResult<()> {
	state.trim_next = true;
	state.advance();
	Ok(())
}

fn extends(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	Err(invalid_use(
		state,
		tag,
		"`extends` must be the first tag of a template compiled from a file",
	))
}

fn include(state: &mut CompileState<'_>, tag: &TagToken) -> WeftResult<()> {
	Err(invalid_use(
		state,
		tag,
		"`include` needs `source_file`, `base_dir` and `includes_dir`",
	))
}
