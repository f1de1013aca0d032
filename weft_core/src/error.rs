use miette::Diagnostic;
use thiserror::Error;

use crate::SourceContext;

#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum WeftError {
	#[error(transparent)]
	#[diagnostic(code(weft::io_error))]
	Io(#[from] std::io::Error),

	#[error("malformed token: {reason}{context}")]
	#[diagnostic(
		code(weft::malformed_token),
		help("every `{{{{`, `{{%` and `{{#` needs its matching `}}}}`, `%}}` or `#}}`")
	)]
	MalformedToken {
		reason: String,
		context: SourceContext,
	},

	#[error("token limit of {limit} exceeded while tokenizing{context}")]
	#[diagnostic(
		code(weft::token_limit),
		help("raise `token_limit` in the compile options or split the template")
	)]
	TokenLimitExceeded { limit: usize, context: SourceContext },

	#[error("invalid nesting: {reason}{context}")]
	#[diagnostic(
		code(weft::invalid_nesting),
		help("close inner blocks before closing the block that contains them")
	)]
	InvalidNesting {
		reason: String,
		context: SourceContext,
	},

	#[error("tag `{tag}` not closed{context}")]
	#[diagnostic(code(weft::tag_not_closed))]
	TagNotClosed { tag: String, context: SourceContext },

	#[error("tag \"{name}\" not found{context}")]
	#[diagnostic(
		code(weft::unknown_tag),
		help("register a handler for this tag in `CompileOptions::tags`")
	)]
	UnknownTag { name: String, context: SourceContext },

	#[error("tag \"{name}\" didn't change the engine state{context}")]
	#[diagnostic(
		code(weft::engine_state_unchanged),
		help("a tag handler must consume at least its own token")
	)]
	EngineStateUnchanged { name: String, context: SourceContext },

	#[error("invalid for loop: {reason}{context}")]
	#[diagnostic(
		code(weft::invalid_for_loop),
		help("use `{{% for item in items %}}` or `{{% for key, value in map %}}`")
	)]
	InvalidForLoop {
		reason: String,
		context: SourceContext,
	},

	#[error("invalid identifier `{name}`{context}")]
	#[diagnostic(code(weft::invalid_identifier))]
	InvalidIdentifier { name: String, context: SourceContext },

	#[error("failed to resolve {kind} `{target}`: {reason}{context}")]
	#[diagnostic(code(weft::failed_resolve))]
	FailedResolve {
		kind: String,
		target: String,
		reason: String,
		context: SourceContext,
	},

	#[error("cyclic dependencies found: {chain}{context}")]
	#[diagnostic(
		code(weft::cyclic_dependency),
		help("a file cannot include or extend itself, directly or indirectly")
	)]
	CyclicDependency {
		chain: String,
		context: SourceContext,
	},

	#[error("invalid use of `{tag}`: {reason}{context}")]
	#[diagnostic(code(weft::invalid_use))]
	InvalidUse {
		tag: String,
		reason: String,
		context: SourceContext,
	},

	#[error("invalid option `{option}`: {reason}")]
	#[diagnostic(
		code(weft::invalid_option),
		help("`source_file`, `base_dir` and `includes_dir` must be provided together")
	)]
	InvalidOption { option: String, reason: String },

	#[error("failed to compile template: {reason}{context}")]
	#[diagnostic(code(weft::compile_eval))]
	CompileEval {
		reason: String,
		context: SourceContext,
	},

	#[error("`{name}` is not defined{context}")]
	#[diagnostic(
		code(weft::undefined_variable),
		help("pass `{name}` in the bindings or assign it before use")
	)]
	UndefinedVariable { name: String, context: SourceContext },

	#[error("`{expression}` is not iterable{context}")]
	#[diagnostic(code(weft::not_iterable))]
	NotIterable {
		expression: String,
		context: SourceContext,
	},

	#[error("filter \"{name}\" is not available{context}")]
	#[diagnostic(
		code(weft::unknown_filter),
		help("provide the filter through `CompileOptions::filters` or the runtime")
	)]
	UnknownFilter { name: String, context: SourceContext },

	#[error("filter \"{name}\" failed: {reason}{context}")]
	#[diagnostic(code(weft::filter_failed))]
	FilterFailed {
		name: String,
		reason: String,
		context: SourceContext,
	},

	#[error("failed to evaluate `{expression}`: {reason}{context}")]
	#[diagnostic(code(weft::evaluation))]
	Evaluation {
		expression: String,
		reason: String,
		context: SourceContext,
	},

	#[error("mixin \"{name}\" is not defined{context}")]
	#[diagnostic(code(weft::unknown_mixin))]
	UnknownMixin { name: String, context: SourceContext },

	#[error("mixin calls nested deeper than {limit}{context}")]
	#[diagnostic(code(weft::recursion_limit))]
	RecursionLimit { limit: usize, context: SourceContext },

	#[error("bindings must be a map, received {kind}")]
	#[diagnostic(code(weft::invalid_bindings))]
	InvalidBindings { kind: String },

	#[error("failed to parse config file: {0}")]
	#[diagnostic(
		code(weft::config_parse),
		help("check that weft.toml is valid TOML with an optional [data] section")
	)]
	ConfigParse(String),

	#[error("failed to load data file `{path}`: {reason}")]
	#[diagnostic(code(weft::data_file))]
	DataFile { path: String, reason: String },

	#[error("unsupported data file format: `{0}`")]
	#[diagnostic(
		code(weft::unsupported_format),
		help("supported formats: text, json, toml, yaml, yml")
	)]
	UnsupportedDataFormat(String),
}

impl WeftError {
	/// Whether the error was raised while rendering an already produced
	/// template rather than while compiling it.
	pub fn is_runtime(&self) -> bool {
		matches!(
			self,
			Self::UndefinedVariable { .. }
				| Self::NotIterable { .. }
				| Self::UnknownFilter { .. }
				| Self::FilterFailed { .. }
				| Self::Evaluation { .. }
				| Self::UnknownMixin { .. }
				| Self::RecursionLimit { .. }
				| Self::InvalidBindings { .. }
		)
	}

	/// The rendered source excerpt attached to this error, if any.
	pub fn context(&self) -> Option<&str> {
		let context = match self {
			Self::MalformedToken { context, .. }
			| Self::TokenLimitExceeded { context, .. }
			| Self::InvalidNesting { context, .. }
			| Self::TagNotClosed { context, .. }
			| Self::UnknownTag { context, .. }
			| Self::EngineStateUnchanged { context, .. }
			| Self::InvalidForLoop { context, .. }
			| Self::InvalidIdentifier { context, .. }
			| Self::FailedResolve { context, .. }
			| Self::CyclicDependency { context, .. }
			| Self::InvalidUse { context, .. }
			| Self::CompileEval { context, .. }
			| Self::UndefinedVariable { context, .. }
			| Self::NotIterable { context, .. }
			| Self::UnknownFilter { context, .. }
			| Self::FilterFailed { context, .. }
			| Self::Evaluation { context, .. }
			| Self::UnknownMixin { context, .. }
			| Self::RecursionLimit { context, .. } => context,
			_ => return None,
		};

		context.as_deref()
	}
}

pub type WeftResult<T> = Result<T, WeftError>;
