use std::collections::BTreeSet;

use rstest::rstest;
use serde_json::json;
use similar_asserts::assert_eq;
use tracing_test::traced_test;

use super::__fixtures::*;
use super::*;
use crate::tokens::FilterCall;
use crate::tokens::TagToken;
use crate::value::to_text;

fn names(items: &[&str]) -> BTreeSet<String> {
	items.iter().map(ToString::to_string).collect()
}

#[rstest]
#[case::plain("plain text only")]
#[case::lone_delimiters("100% of {braces} and # marks }")]
#[case::multiline("line one\n  line two\n\tline three\n")]
fn text_without_tags_renders_unchanged(#[case] input: &str) -> WeftResult<()> {
	let output = render_str(input, json!({}))?;
	assert_eq!(output, input);

	Ok(())
}

#[rstest]
#[case::member_access("{{ a.b.c }}", &["a"], &["a.b.c"])]
#[case::dollar_prefix("{{ $x.y }}", &["$x"], &["$x.y"])]
#[case::literals("{{ 'text' }}{{ 1 }}{{ true }}{{ none }}", &[], &[])]
#[case::array_literal("{{ [1,2] }}{{ [a, 2] }}", &[], &[])]
#[case::object_literal("{{ {a:1} }}{{ {\"b\": c} }}", &[], &[])]
#[case::double_quoted("{{ \"s\" }}", &[], &[])]
#[case::call_wrapper("{{ upper(name) }}", &["name"], &["name"])]
#[case::index_access("{{ rows[0] }}", &["rows"], &["rows[0]"])]
#[case::assigned("{% assign a = 1 %}{{ a }}", &[], &[])]
#[case::assigned_from_local("{% assign a = b %}{{ a }}", &["b"], &["b"])]
#[case::loop_binding("{% for item in items %}{{ item }}{% endfor %}", &["items"], &["items"])]
#[case::loop_binding_after_loop(
	"{% for item in items %}{% endfor %}{{ item }}",
	&["item", "items"],
	&["item", "items"]
)]
#[case::if_scoped_assign(
	"{% if x %}{% assign y = 1 %}{{ y }}{% endif %}{{ y }}",
	&["x", "y"],
	&["x", "y"]
)]
#[case::capture("{% capture c %}text{% endcapture %}{{ c }}", &[], &[])]
#[case::mixin_param("{% mixin m name %}{{ name }}{% endmixin %}{{ name }}", &["name"], &["name"])]
#[case::filter_args("{{ a | append: b.c }}", &["a"], &["a"])]
fn collects_locals(#[case] input: &str, #[case] locals: &[&str], #[case] full: &[&str]) -> WeftResult<()> {
	let output = compile(input, &CompileOptions::new().with_intermediate_only(true))?;
	assert_eq!(output.locals, names(locals));
	assert_eq!(output.locals_full, names(full));

	Ok(())
}

#[test]
fn compile_is_deterministic() -> WeftResult<()> {
	let input = "{% mixin card title %}<h1>{{ title | upcase }}</h1>{% endmixin %}{% for item in items %}{% \
	             +card item.name %}{% +missing %}{% endfor %}{{ user.name | default: 'anon' }}";
	let options = CompileOptions::new().with_inline_runtime(true);
	let first = compile(input, &options)?;
	let second = compile(input, &options)?;

	assert_eq!(first.code, second.code);
	assert_eq!(first.locals, second.locals);
	assert_eq!(first.locals_full, second.locals_full);
	assert_eq!(first.warnings, second.warnings);

	Ok(())
}

#[test]
fn code_listing_for_loops_and_assignments() -> WeftResult<()> {
	let input = "{% assign total = 0 %}{% for n in 1..3 %}{% assign total += n %}{% endfor %}{{ total }}";
	let output = compile(input, &listing_options())?;

	insta::assert_snapshot!(output.code, @r"
	let total = 0
	for n in 1..3 {
	  set total += n
	}
	emit total
	");

	let rendered = render(input, (), &listing_options())?;
	assert_eq!(rendered, "6");

	Ok(())
}

#[test]
fn code_listing_records_positions() -> WeftResult<()> {
	let output = compile_str("a{{ x }}")?;
	assert_eq!(output.code, "@ <string>@0\ntext \"a\"\n@ <string>@1\nemit x\n");

	Ok(())
}

#[test]
fn code_listing_folds_filters_left_to_right() -> WeftResult<()> {
	let output = compile("{{ x | f | g: 1, 'two' }}", &listing_options().with_intermediate_only(true))?;
	assert_eq!(output.code, "emit g(f(x), 1, 'two')\n");

	Ok(())
}

#[test]
fn filters_apply_in_order() -> WeftResult<()> {
	let options = CompileOptions::new()
		.with_filter("f", |value: Value, _: &[Value]| Ok(Value::from(format!("f({})", to_text(&value)))))
		.with_filter("g", |value: Value, _: &[Value]| Ok(Value::from(format!("g({})", to_text(&value)))));

	let output = render("{{ 'x' | f | g }}", (), &options)?;
	assert_eq!(output, "g(f(x))");

	Ok(())
}

#[rstest]
#[case::upcase("{{ 'hello' | upcase }}", "HELLO")]
#[case::downcase("{{ 'HeLLo' | downcase }}", "hello")]
#[case::capitalize("{{ 'hello world' | capitalize }}", "Hello world")]
#[case::split_join("{{ 'a,b,c' | split: ',' | join: '-' }}", "a-b-c")]
#[case::join_default("{{ ['a', 'b'] | join }}", "a b")]
#[case::arithmetic("{{ 5 | plus: 3 | times: 2 }}", "16")]
#[case::minus("{{ 5 | minus: 7 }}", "-2")]
#[case::divided_by("{{ 10 | divided_by: 4 }}", "2.5")]
#[case::modulo("{{ 7 | modulo: 3 }}", "1")]
#[case::abs("{{ -4 | abs }}", "4")]
#[case::round("{{ 3.14159 | round: 2 }}", "3.14")]
#[case::ceil_floor("{{ 1.2 | ceil }}{{ 1.8 | floor }}", "21")]
#[case::default_on_none("{{ none | default: 'fallback' }}", "fallback")]
#[case::default_keeps_value("{{ 'set' | default: 'fallback' }}", "set")]
#[case::truncate("{{ 'abcdefghij' | truncate: 5 }}", "ab...")]
#[case::truncate_short("{{ 'abc' | truncate: 5 }}", "abc")]
#[case::escape("{{ '<b>' | escape }}", "&lt;b&gt;")]
#[case::reverse_list("{{ [3, 1, 2] | reverse }}", "2,1,3")]
#[case::reverse_text("{{ 'abc' | reverse }}", "cba")]
#[case::size("{{ 'abc' | size }}{{ [1, 2] | size }}", "32")]
#[case::first_last("{{ [1, 2, 3] | first }}{{ [1, 2, 3] | last }}", "13")]
#[case::strip("[{{ '  hi  ' | strip }}]", "[hi]")]
#[case::lstrip_rstrip("[{{ '  hi  ' | lstrip }}|{{ '  hi  ' | rstrip }}]", "[hi  |  hi]")]
#[case::prepend_append("{{ 'hi' | prepend: '>' | append: '<' }}", ">hi<")]
#[case::remove("{{ 'aXbX' | remove: 'X' }}", "ab")]
#[case::replace("{{ 'a-b' | replace: '-', '+' }}", "a+b")]
fn builtin_filters(#[case] input: &str, #[case] expected: &str) -> WeftResult<()> {
	let output = render_str(input, json!({}))?;
	assert_eq!(output, expected);

	Ok(())
}

#[rstest]
#[case::escape("{{ text | escape }}", "<a href=\"x\">'&'</a>", "&lt;a href=&#34;x&#34;&gt;&#39;&amp;&#39;&lt;/a&gt;")]
#[case::unescape("{{ text | unescape }}", "&lt;b&gt; &#34;q&#34; &#39;s&#39; &amp;amp;", "<b> \"q\" 's' &amp;")]
#[case::escape_once("{{ text | escape_once }}", "&lt;b&gt; & \"", "&lt;b&gt; &amp; &#34;")]
fn html_entity_filters(#[case] input: &str, #[case] text: &str, #[case] expected: &str) -> WeftResult<()> {
	assert_eq!(render_str(input, json!({ "text": text }))?, expected);

	Ok(())
}

#[test]
fn filter_failure_is_reported() {
	let result = render_str("{{ 1 | divided_by: 0 }}", json!({}));
	let Err(WeftError::FilterFailed { name, reason, .. }) = result else {
		panic!("expected a filter failure, got {result:?}");
	};

	assert_eq!(name, "divided_by");
	assert_eq!(reason, "division by zero");
}

#[rstest]
#[case::range("{% for n in 2..5 %}{{ n }}{% endfor %}", json!({}), "2345")]
#[case::empty_range("{% for n in 5..2 %}{{ n }}{% endfor %}", json!({}), "")]
#[case::range_from_bindings("{% for n in start..end %}{{ n }}{% endfor %}", json!({"start": 1, "end": 3}), "123")]
#[case::values("{% for v in items %}{{ v }};{% endfor %}", json!({"items": [1, 2]}), "1;2;")]
#[case::of_keyword("{% for v of items %}{{ v }};{% endfor %}", json!({"items": [1, 2]}), "1;2;")]
#[case::offset_limit(
	"{% for i, v in items | offset: 1 | limit: 3 %}{{ i }}:{{ v }},{% endfor %}",
	json!({"items": [10, 20, 30, 40, 50]}),
	"1:20,2:30,3:40,"
)]
#[case::offset_without_colon(
	"{% for v in items | offset 3 %}{{ v }}{% endfor %}",
	json!({"items": [10, 20, 30, 40, 50]}),
	"4050"
)]
#[case::negative_limit("{% for v in items | limit: -1 %}{{ v }}{% endfor %}", json!({"items": [1, 2]}), "")]
#[case::map_keys("{% for k in obj %}{{ k }}{% endfor %}", json!({"obj": {"a": 1, "b": 2}}), "ab")]
#[case::map_entries(
	"{% for k, v in obj %}{{ k }}={{ v }};{% endfor %}",
	json!({"obj": {"a": 1, "b": 2}}),
	"a=1;b=2;"
)]
#[case::array_pattern(
	"{% for [a, , c] in rows %}{{ a }}{{ c }};{% endfor %}",
	json!({"rows": [[1, 2, 3], [4, 5, 6]]}),
	"13;46;"
)]
#[case::object_pattern(
	"{% for {name} in people %}{{ name }} {% endfor %}",
	json!({"people": [{"name": "Ada"}, {"name": "Sid"}]}),
	"Ada Sid "
)]
#[case::characters("{% for ch in word %}[{{ ch }}]{% endfor %}", json!({"word": "ab"}), "[a][b]")]
#[case::break_continue(
	"{% for n in 1..5 %}{% if n == 2 %}{% continue %}{% endif %}{% if n == 4 %}{% break %}{% endif %}{{ n }}{% \
	 endfor %}",
	json!({}),
	"13"
)]
#[case::nested(
	"{% for a in 1..2 %}{% for b in 1..2 %}{{ a }}{{ b }} {% endfor %}{% endfor %}",
	json!({}),
	"11 12 21 22 "
)]
fn loops(#[case] input: &str, #[case] bindings: serde_json::Value, #[case] expected: &str) -> WeftResult<()> {
	let output = render_str(input, bindings)?;
	assert_eq!(output, expected);

	Ok(())
}

#[rstest]
#[case::first_branch(json!({"x": 2}), "big")]
#[case::second_branch(json!({"x": 1}), "one")]
#[case::otherwise(json!({"x": 0}), "small")]
fn if_elseif_else(#[case] bindings: serde_json::Value, #[case] expected: &str) -> WeftResult<()> {
	let input = "{% if x > 1 %}big{% elseif x == 1 %}one{% else %}small{% endif %}";
	assert_eq!(render_str(input, bindings)?, expected);

	Ok(())
}

#[rstest]
#[case::falsy(json!({"x": false}), "no")]
#[case::truthy(json!({"x": true}), "yes")]
fn unless_else(#[case] bindings: serde_json::Value, #[case] expected: &str) -> WeftResult<()> {
	let input = "{% unless x %}no{% else %}yes{% endunless %}";
	assert_eq!(render_str(input, bindings)?, expected);

	Ok(())
}

#[rstest]
#[case::falls_through(json!({"x": 1}), "onetwo")]
#[case::breaks(json!({"x": 2}), "two")]
#[case::several_values(json!({"x": 3}), "threeother")]
#[case::default_arm(json!({"x": 9}), "other")]
fn case_falls_through_until_break(#[case] bindings: serde_json::Value, #[case] expected: &str) -> WeftResult<()> {
	let input = "{% case x %}{% when 1 %}one{% when 2 %}two{% break %}{% when 3, 4 %}three{% default %}other{% \
	             endcase %}";
	assert_eq!(render_str(input, bindings)?, expected);

	Ok(())
}

#[rstest]
#[case::with_argument("{% mixin greet name %}Hi {{ name }}{% endmixin %}{% +greet 'Sid' %}", "Hi Sid")]
#[case::missing_argument("{% mixin greet name %}Hi {{ name }}{% endmixin %}{% +greet %}", "Hi undefined")]
#[case::called_before_definition("{% +greet 'Sid' %}{% mixin greet name %}Hi {{ name }}{% endmixin %}", "Hi Sid")]
#[case::several_params(
	"{% mixin pair a, b %}{{ a }}+{{ b }}{% endmixin %}{% +pair 1 2 %}",
	"1+2"
)]
#[case::nested_call(
	"{% mixin inner v %}<{{ v }}>{% endmixin %}{% mixin outer v %}[{% +inner v %}]{% endmixin %}{% +outer 'x' %}",
	"[<x>]"
)]
fn mixins(#[case] input: &str, #[case] expected: &str) -> WeftResult<()> {
	assert_eq!(render_str(input, json!({}))?, expected);

	Ok(())
}

#[test]
fn undefined_mixin_warns_and_fails_at_runtime() -> WeftResult<()> {
	let output = compile_str("{% +missing %}")?;
	assert_eq!(output.warnings.len(), 1);
	assert_eq!(output.warnings[0].message, "mixin \"missing\" is called but never defined");

	let result = render_str("{% +missing %}", json!({}));
	assert!(matches!(result, Err(WeftError::UnknownMixin { ref name, .. }) if name == "missing"));

	Ok(())
}

#[test]
fn recursive_mixin_hits_the_limit() {
	let result = render_str("{% mixin spin %}{% +spin %}{% endmixin %}{% +spin %}", json!({}));
	assert!(matches!(result, Err(WeftError::RecursionLimit { limit: MAX_MIXIN_DEPTH, .. })));
}

#[rstest]
#[case::single("{% block title %}Default{% endblock %}", "Default")]
#[case::last_body_first_place(
	"{% block a %}first{% endblock %}-{% block a %}second{% endblock %}",
	"second-"
)]
fn blocks(#[case] input: &str, #[case] expected: &str) -> WeftResult<()> {
	assert_eq!(render_str(input, json!({}))?, expected);

	Ok(())
}

#[rstest]
#[case::assign_ops(
	"{% assign x = 5 %}{{ x }},{% assign x += 10 %}{{ x }},{% assign x += 10 %}{{ x }}",
	"5,15,25"
)]
#[case::assign_other_ops("{% assign x = 10 %}{% assign x -= 4 %}{% assign x *= 3 %}{% assign x /= 2 %}{{ x }}", "9")]
#[case::assign_concat("{% assign s = 'a' %}{% assign s += 'b' %}{{ s }}", "ab")]
#[case::assign_with_filter("{% assign s = 'abc' | upcase %}{{ s }}", "ABC")]
#[case::raw("{% raw %}{{ x }} {% if %}{% endraw %}", "{{ x }} {% if %}")]
#[case::comment("a{% comment %}hidden {{ y }}{% endcomment %}b", "ab")]
#[case::marker_comment("a{# note #}b", "ab")]
#[case::reserved_marker_syntax("a {# b #} c", "a  c")]
#[case::capture("{% capture c %}Hi {{ name }}{% endcapture %}{{ c }}", "Hi {{ name }}")]
#[case::trim("{% trim %}   hello", "hello")]
#[case::script("{% js %}let greeting = 'hi'; let loud = greeting | upper{% endjs %}{{ greeting }} {{ loud }}", "hi HI")]
#[case::script_reassign("{% assign count = 1 %}{% js %}count = count + 1{% endjs %}{{ count }}", "2")]
#[case::dollar_identifier("{% assign $x = 3 %}{{ $x }}", "3")]
fn tags(#[case] input: &str, #[case] expected: &str) -> WeftResult<()> {
	assert_eq!(render_str(input, json!({}))?, expected);

	Ok(())
}

#[rstest]
#[case::if_not_closed("{% if x %}")]
#[case::nested_if_head("{% if if endif %}")]
#[case::empty_if_around_closed_if("{% if %}{% if %}{% endif %}")]
#[case::empty_case("{% case %}{% when 1 %}")]
#[case::for_not_closed("{% for a in b %}{{ a }}")]
#[case::for_without_in_not_closed("{% for x %}")]
#[case::raw_not_closed("{% raw %}text")]
fn unclosed_tags(#[case] input: &str) {
	let result = compile_str(input);
	assert!(matches!(result, Err(WeftError::TagNotClosed { .. })), "{result:?}");
}

#[rstest]
#[case::crossed("{% for a in b %}{% if x %}{% endfor %}{% endif %}")]
#[case::stray_end("{% endif %}")]
#[case::stray_else("{% else %}")]
#[case::stray_when("{% when 1 %}")]
#[case::wrong_closer("{% if x %}{% endunless %}{% endif %}")]
#[case::elseif_after_else("{% if x %}{% else %}{% elseif y %}{% endif %}")]
#[case::empty_if_closed_by_endfor("{% if %}text{% endfor %}")]
#[case::for_header_closed_by_endif("{% for x %}text{% endif %}")]
#[case::case_content_before_when("{% case x %}text{% when 1 %}{% endcase %}")]
fn invalid_nesting(#[case] input: &str) {
	let result = compile_str(input);
	assert!(matches!(result, Err(WeftError::InvalidNesting { .. })), "{result:?}");
}

#[rstest]
#[case::unterminated_object("{{ x")]
#[case::unterminated_tag("text {% if x")]
#[case::nested_opener("{{ {% }}")]
fn malformed_tokens(#[case] input: &str) {
	let result = compile_str(input);
	assert!(matches!(result, Err(WeftError::MalformedToken { .. })), "{result:?}");
}

#[test]
fn token_limit_is_enforced() {
	let options = CompileOptions::new().with_token_limit(2);
	let result = compile("a{{ x }}b{{ y }}", &options);
	assert!(matches!(result, Err(WeftError::TokenLimitExceeded { limit: 2, .. })), "{result:?}");
}

#[test]
fn unknown_tag_error_shows_context() {
	let result = compile_str("line one\n{% nope %}\nline three");
	let Err(error) = result else {
		panic!("expected an error");
	};

	assert!(matches!(error, WeftError::UnknownTag { .. }));
	assert_eq!(
		error.to_string(),
		"tag \"nope\" not found\n    1| line one\n >> 2| {% nope %}\n    3| line three\n File| <string>:2:1"
	);
}

#[test]
fn error_columns_count_characters() {
	let result = render_str("héllo {{ missing }}", json!({}));
	let Err(error) = result else {
		panic!("expected an error");
	};

	assert_eq!(error.context(), Some(" >> 1| héllo {{ missing }}\n File| <string>:1:7"));
}

#[test]
fn custom_tags() -> WeftResult<()> {
	let options = CompileOptions::new().with_tag("shout", |state: &mut CompileState<'_>, tag: &TagToken| {
		state.emit(Instruction::Text(tag.head.to_uppercase()));
		state.advance();
		Ok(())
	});

	assert_eq!(render("say {% shout hello %}!", (), &options)?, "say HELLO!");

	Ok(())
}

#[test]
fn tag_that_does_not_advance_fails() {
	let options = CompileOptions::new().with_tag("stuck", |_: &mut CompileState<'_>, _: &TagToken| Ok(()));
	let result = compile("{% stuck %}", &options);
	assert!(matches!(result, Err(WeftError::EngineStateUnchanged { ref name, .. }) if name == "stuck"));
}

#[rstest]
#[case::for_without_in("{% for x %}{% endfor %}")]
#[case::bad_offset("{% for x in items | offset: a %}{% endfor %}")]
#[case::too_many_bindings("{% for a, b, c in items %}{% endfor %}")]
fn invalid_for_loops(#[case] input: &str) {
	let result = compile_str(input);
	assert!(matches!(result, Err(WeftError::InvalidForLoop { .. })), "{result:?}");
}

#[rstest]
#[case::assign("{% assign 1x = 2 %}")]
#[case::capture("{% capture a-b %}x{% endcapture %}")]
#[case::loop_binding("{% for 1a in items %}{% endfor %}")]
#[case::mixin("{% mixin 9lives %}{% endmixin %}")]
fn invalid_identifiers(#[case] input: &str) {
	let result = compile_str(input);
	assert!(matches!(result, Err(WeftError::InvalidIdentifier { .. })), "{result:?}");
}

#[rstest]
#[case::break_outside_loop("{% break %}")]
#[case::continue_outside_loop("{% continue %}")]
#[case::if_without_condition("{% if %}{% endif %}")]
#[case::include_without_files("{% include 'part.weft' %}")]
#[case::late_extends("text {% extends 'layout.weft' %}")]
fn invalid_uses(#[case] input: &str) {
	let result = compile_str(input);
	assert!(matches!(result, Err(WeftError::InvalidUse { .. })), "{result:?}");
}

#[rstest]
#[case::expression("{{ 1 + }}")]
#[case::condition("{% if x ==== 1 %}{% endif %}")]
#[case::filter_argument("{{ x | append: ( }}")]
#[case::script("{% js %}let eww() = await;{% endjs %}")]
fn invalid_expressions_fail_when_producing(#[case] input: &str) -> WeftResult<()> {
	let result = compile_str(input);
	assert!(matches!(result, Err(WeftError::CompileEval { .. })), "{result:?}");

	let output = compile(input, &CompileOptions::new().with_intermediate_only(true))?;
	assert!(output.template.is_none());

	Ok(())
}

#[test]
fn missing_local_is_a_runtime_error() {
	let result = render_str("{{ missing }}", json!({}));
	let Err(error) = result else {
		panic!("expected an error");
	};

	assert!(error.is_runtime());
	assert!(matches!(error, WeftError::UndefinedVariable { ref name, .. } if name == "missing"));
	assert_eq!(
		error.to_string(),
		"`missing` is not defined\n >> 1| {{ missing }}\n File| <string>:1:1"
	);
}

#[test]
fn iterating_a_number_fails() {
	let result = render_str("{% for x in n %}{% endfor %}", json!({"n": 5}));
	assert!(matches!(result, Err(WeftError::NotIterable { ref expression, .. }) if expression == "n"));
}

#[test]
fn bindings_must_be_a_map() -> WeftResult<()> {
	let result = render("hi", vec![1, 2], &CompileOptions::new());
	assert!(matches!(result, Err(WeftError::InvalidBindings { .. })), "{result:?}");

	assert_eq!(render("hi", (), &CompileOptions::new())?, "hi");
	assert_eq!(render("hi", None::<serde_json::Value>, &CompileOptions::new())?, "hi");

	Ok(())
}

#[test]
fn template_renders_many_times() -> WeftResult<()> {
	let output = compile_str("Hello {{ name }}!")?;
	let Some(template) = output.template else {
		panic!("expected a template");
	};

	assert!(!template.is_inlined());
	assert_eq!(template.render(json!({"name": "Ada"}))?, "Hello Ada!");
	assert_eq!(template.render(json!({"name": "Sid"}))?, "Hello Sid!");

	let runtime = Runtime::default().with_evaluator(std::sync::Arc::new(JinjaEvaluator::new()));
	assert_eq!(template.render_with(json!({"name": "Bo"}), &runtime)?, "Hello Bo!");

	Ok(())
}

#[test]
fn evaluator_compiles_once_and_reads_only_used_names() -> Result<(), String> {
	let evaluator = JinjaEvaluator::new();
	let requested = std::cell::RefCell::new(vec![]);
	let lookup = |name: &str| {
		requested.borrow_mut().push(name.to_string());
		match name {
			"a" => Some(Value::from(2)),
			"$b" => Some(Value::from(3)),
			_ => Some(Value::from("unused")),
		}
	};

	assert_eq!(evaluator.evaluate("a + $b", &lookup)?, Value::from(5));
	assert_eq!(evaluator.evaluate("a + $b", &lookup)?, Value::from(5));
	assert_eq!(format!("{evaluator:?}"), "JinjaEvaluator { cached: 1 }");

	let mut requested = requested.into_inner();
	requested.sort();
	assert_eq!(requested, vec!["$b", "$b", "a", "a"]);

	Ok(())
}

#[test]
fn inline_runtime_bundles_used_filters() -> WeftResult<()> {
	let options = CompileOptions::new()
		.with_inline_runtime(true)
		.with_debug_positions(false)
		.with_filter("shout", |value: Value, _: &[Value]| Ok(Value::from(format!("{}!", to_text(&value)))));
	let output = compile("{{ name | upcase | shout }}{{ name | nope }}", &options)?;

	assert_eq!(
		output.code,
		"emit shout(upcase(name))\nemit nope(name)\nruntime filters(shout, upcase)\n"
	);
	assert_eq!(output.warnings.len(), 1);
	assert_eq!(output.warnings[0].message, "filter \"nope\" was not provided during compile");

	let Some(template) = output.template else {
		panic!("expected a template");
	};
	assert!(template.is_inlined());

	let result = template.render(json!({"name": "ada"}));
	assert!(matches!(result, Err(WeftError::UnknownFilter { ref name, .. }) if name == "nope"));

	Ok(())
}

#[test]
fn include_inlines_files_with_indentation() -> WeftResult<()> {
	let dir = TemplateDir::new(&[
		("page.weft", "<ul>\n  {% include \"items.weft\" %}\n</ul>"),
		("items.weft", "<li>{{ first }}</li>\n<li>b</li>\n"),
	]);

	let output = render_from_file(json!({"first": "a"}), &dir.options("page.weft"))?;
	assert_eq!(output, "<ul>\n  <li>a</li>\n  <li>b</li>\n</ul>");

	Ok(())
}

#[test]
fn includes_resolve_from_the_includes_dir() -> WeftResult<()> {
	let dir = TemplateDir::new(&[
		("pages/index.weft", "[{% include 'nav.weft' %}]"),
		("partials/nav.weft", "nav"),
	]);

	let options = CompileOptions::new().with_files(
		dir.path().join("pages/index.weft"),
		dir.path(),
		dir.path().join("partials"),
	);
	let output = compile_from_file(&options)?;

	assert_eq!(output.dependencies, names(&["partials/nav.weft"]));
	assert_eq!(output.template.map(|template| template.render(())).transpose()?, Some("[nav]".to_string()));

	Ok(())
}

#[test]
fn runtime_errors_point_into_included_files() {
	let dir = TemplateDir::new(&[
		("page.weft", "Hello\n  {% include \"items.weft\" %}\n"),
		("items.weft", "ok\n{{ 1 | nope }}"),
	]);

	let result = render_from_file((), &dir.options("page.weft"));
	let Err(error) = result else {
		panic!("expected an error");
	};

	assert!(matches!(error, WeftError::UnknownFilter { .. }));
	assert_eq!(error.context(), Some("    1| ok\n >> 2| {{ 1 | nope }}\n File| items.weft:2:1"));
}

#[test]
fn extends_fills_parent_blocks() -> WeftResult<()> {
	let dir = TemplateDir::new(&[
		("layout.weft", "<title>{% block title %}Default{% endblock %}</title>"),
		("page.weft", "{% extends \"layout.weft\" %}{% block title %}Page{% endblock %}"),
	]);

	let output = render_from_file((), &dir.options("page.weft"))?;
	assert_eq!(output, "<title>Page</title>");

	Ok(())
}

#[test]
fn duplicate_includes_are_read_once() -> WeftResult<()> {
	let dir = TemplateDir::new(&[
		("page.weft", "{% include \"a.weft\" %}{% include \"a.weft\" %}"),
		("a.weft", "A"),
	]);

	let (options, loader) = counting_options(&dir, "page.weft");
	let output = compile_from_file(&options)?;

	assert_eq!(loader.reads(&dir.path().join("a.weft")), 1);
	assert_eq!(loader.reads(&dir.path().join("page.weft")), 1);
	assert_eq!(output.dependencies, names(&["a.weft"]));
	assert_eq!(output.template.map(|template| template.render(())).transpose()?, Some("AA".to_string()));

	Ok(())
}

#[test]
fn cyclic_includes_fail() {
	let dir = TemplateDir::new(&[
		("page.weft", "{% include \"a.weft\" %}"),
		("a.weft", "{% include \"b.weft\" %}"),
		("b.weft", "{% include \"a.weft\" %}"),
	]);

	let result = compile_from_file(&dir.options("page.weft"));
	let Err(WeftError::CyclicDependency { chain, .. }) = result else {
		panic!("expected a cycle, got {result:?}");
	};

	assert_eq!(chain, "page.weft -> a.weft -> b.weft -> a.weft");
}

#[test]
fn missing_include_fails_to_resolve() {
	let dir = TemplateDir::new(&[("page.weft", "{% include \"gone.weft\" %}")]);

	let result = compile_from_file(&dir.options("page.weft"));
	assert!(
		matches!(result, Err(WeftError::FailedResolve { ref target, .. }) if target == "gone.weft"),
		"{result:?}"
	);
}

#[test]
fn file_options_are_required_together() {
	let options = CompileOptions {
		source_file: Some("page.weft".into()),
		..CompileOptions::default()
	};
	let result = compile("x", &options);
	assert!(matches!(result, Err(WeftError::InvalidOption { ref option, .. }) if option == "base_dir"));
}

#[test]
fn file_options_must_exist() {
	let dir = TemplateDir::new(&[]);
	let options = dir.options("missing.weft");
	let result = compile("x", &options);
	assert!(matches!(result, Err(WeftError::InvalidOption { ref option, .. }) if option == "source_file"));
}

#[test]
fn config_drives_compile_and_data() -> WeftResult<()> {
	let dir = TemplateDir::new(&[
		(
			"weft.toml",
			"source = \"page.weft\"\nincludes_dir = \"partials\"\n\n[data]\nsite = \"site.json\"\nmeta = { path = \
			 \"meta.conf\", format = \"yaml\" }\n",
		),
		("page.weft", "{% include 'head.weft' %} {{ site.name }} v{{ meta.version }}"),
		("partials/head.weft", "Hello"),
		("site.json", "{\"name\": \"Weft\"}"),
		("meta.conf", "version: 2\n"),
	]);

	let Some(config) = WeftConfig::load(dir.path())? else {
		panic!("expected a config");
	};
	assert!(config.debug_positions);
	assert_eq!(config.token_limit, DEFAULT_TOKEN_LIMIT);

	let data = config.load_data(dir.path())?;
	let output = render_from_file(&data, &config.to_options(dir.path()))?;
	assert_eq!(output, "Hello Weft v2");

	Ok(())
}

#[test]
fn config_is_optional() -> WeftResult<()> {
	let dir = TemplateDir::new(&[]);
	assert!(WeftConfig::load(dir.path())?.is_none());

	Ok(())
}

#[test]
fn config_rejects_unknown_data_formats() -> WeftResult<()> {
	let dir = TemplateDir::new(&[
		(".config/weft.toml", "[data]\nsettings = \"settings.ini\"\n"),
		("settings.ini", "a = 1"),
	]);

	let Some(config) = WeftConfig::load(dir.path())? else {
		panic!("expected a config");
	};
	let result = config.load_data(dir.path());
	assert!(matches!(result, Err(WeftError::UnsupportedDataFormat(ref format)) if format == "ini"));

	Ok(())
}

#[test]
fn invalid_config_is_a_parse_error() {
	let dir = TemplateDir::new(&[("weft.toml", "token_limit = \"many\"")]);
	let result = WeftConfig::load(dir.path());
	assert!(matches!(result, Err(WeftError::ConfigParse(_))));
}

#[rstest]
#[case::plain("a = 1", &[("a", "1", false)])]
#[case::declared("let a = 1; const b = a", &[("a", "1", true), ("b", "a", true)])]
#[case::newlines("var a = 'x;y'\nb = a // comment", &[("a", "'x;y'", true), ("b", "a // comment", false)])]
#[case::comment_lines("// note\na = 1", &[("a", "1", false)])]
fn parses_scripts(#[case] script: &str, #[case] expected: &[(&str, &str, bool)]) -> Result<(), String> {
	let statements = parse_script(script)?;
	let expected: Vec<Statement> = expected
		.iter()
		.map(|(name, value, declare)| {
			Statement {
				name: name.to_string(),
				value: value.to_string(),
				declare: *declare,
			}
		})
		.collect();
	assert_eq!(statements, expected);

	Ok(())
}

#[rstest]
#[case::call_target("let eww() = await;")]
#[case::comparison("a == 1")]
#[case::bare_expression("doSomething")]
#[case::empty_value("let a =")]
fn rejects_invalid_scripts(#[case] script: &str) {
	assert!(parse_script(script).is_err());
}

#[test]
fn line_table_locates_offsets() {
	let table = LineTable::new("ab\ncd\n\nef");
	assert_eq!(table.line_count(), 4);
	assert_eq!(table.locate(0), (1, 1));
	assert_eq!(table.locate(4), (2, 2));
	assert_eq!(table.locate(6), (3, 1));
	assert_eq!(table.locate(8), (4, 2));
}

#[test]
fn variable_context_never_drops_the_root_frame() {
	let mut context = VariableContext::new();
	context.add("root");
	context.create();
	context.add("inner");
	assert!(context.has("inner"));

	context.destroy();
	context.destroy();
	assert_eq!(context.depth(), 1);
	assert!(context.has("root"));
	assert!(!context.has("inner"));
}

#[test]
fn split_respects_quotes_and_brackets() {
	assert_eq!(split_unescaped("a | 'b|c' | f(x|y) | [1|2]", '|'), vec![
		"a ",
		" 'b|c' ",
		" f(x|y) ",
		" [1|2]"
	]);
	assert_eq!(parse_filter("replace: 'a,b', ','"), FilterCall::new("replace", vec![
		"'a,b'".to_string(),
		"','".to_string()
	]));
}

#[traced_test]
#[test]
fn pipeline_stages_are_logged() -> WeftResult<()> {
	render_str("{% for n in 1..2 %}{{ n }}{% endfor %}", json!({}))?;

	assert!(logs_contain("tokenized template"));
	assert!(logs_contain("generated program"));
	assert!(logs_contain("compiled template"));
	assert!(logs_contain("rendered template"));

	Ok(())
}

#[traced_test]
#[test]
fn data_file_loads_are_traced() -> WeftResult<()> {
	let dir = TemplateDir::new(&[
		("weft.toml", "[data]\nnotes = \"notes.txt\"\n"),
		("notes.txt", "plain"),
	]);

	let Some(config) = WeftConfig::load(dir.path())? else {
		panic!("expected a config");
	};
	let data = config.load_data(dir.path())?;

	assert_eq!(data.get("notes"), Some(&serde_json::Value::from("plain")));
	assert!(logs_contain("loaded config"));
	assert!(logs_contain("loading data file"));
	assert!(logs_contain("notes.txt"));

	Ok(())
}

#[traced_test]
#[test]
fn include_reads_are_traced() -> WeftResult<()> {
	let dir = TemplateDir::new(&[("page.weft", "{% include 'a.weft' %}"), ("a.weft", "A")]);
	compile_from_file(&dir.options("page.weft"))?;

	assert!(logs_contain("reading template"));

	Ok(())
}
