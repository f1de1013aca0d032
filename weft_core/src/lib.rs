//! `weft_core` compiles text templates into an executable program.
//!
//! ## Processing Pipeline
//!
//! ```text
//! Template text
//!   -> Preprocessor (inlines `include` and `extends` files between boundary markers)
//!   -> Lexer (splits text into raw, tag and object tokens positioned in their own files)
//!   -> Code generator (runs tag handlers, emits a Program with mixins and blocks)
//!   -> Producer (validates every expression and wraps the program as a Template)
//!   -> Runtime (executes the program against bindings)
//! ```
//!
//! ## Template Syntax
//!
//! - `{{ user.name | upcase | truncate: 10 }}` writes an expression. Filters
//!   apply left to right, so `{{ x | f | g }}` is `g(f(x))`.
//! - `{% tag ... %}` runs a tag: `assign`, `capture`, `if`/`unless`, `case`,
//!   `for`, `mixin` and `+name`, `block`, `raw`, `comment`, `js`, `trim`.
//! - `{% include "file" %}` and `{% extends "layout" %}` pull in other files.
//! - `{# ... #}` is reserved for file boundary markers. Anything else written
//!   between `{#` and `#}` is dropped from the output, so `a {# b #} c`
//!   renders as `a  c`.
//!
//! ## Key Types
//!
//! - [`CompileOptions`] configures a compile: file locations, filters, tags.
//! - [`CompiledOutput`] holds the program listing, locals, warnings and the
//!   executable [`Template`].
//! - [`FilterRegistry`] and [`TagRegistry`] extend the language.
//! - [`WeftError`] carries a rendered excerpt of the template source.
//!
//! ## Quick Start
//!
//! ```rust
//! use weft_core::CompileOptions;
//! use weft_core::render;
//!
//! let options = CompileOptions::new();
//! let bindings = serde_json::json!({ "name": "Sid" });
//! let output = render("Hi {{ name | upcase }}", bindings, &options).unwrap();
//! assert_eq!(output, "Hi SID");
//! ```

pub use compiler::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use filters::*;
pub use ir::*;
pub use lexer::*;
pub use minijinja::Value;
pub use preprocess::*;
pub use runtime::*;
pub use scope::*;
pub use source::*;

pub mod compiler;
pub mod config;
mod engine;
#[allow(unused_assignments)]
mod error;
mod filters;
pub mod ir;
pub mod lexer;
mod preprocess;
pub mod runtime;
pub mod scope;
mod source;
pub mod tokens;
pub mod value;

#[cfg(test)]
mod __fixtures;
#[cfg(test)]
mod __tests;
