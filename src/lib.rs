//! chatjinja: Jinja-like engine for HF-style `chat_template` strings.
//!
//! The crate evaluates a decoded Hugging Face `chat_template` against a
//! JSON input document and returns the rendered prompt as a [`JinjaString`]:
//! the text plus, for every span, whether it was copied from the input
//! document or produced by the template itself.
//!
//! Pipeline:
//! - [`lexer`]: preprocessing (`-` trim markers, `trim_blocks`,
//!   `{% generation %}` removal) and tokenization.
//! - [`parser`]: recursive descent into an [`ast::Program`].
//! - [`eval`]: tree-walking execution against a [`Context`].
//! - [`caps`]: static capability analysis of a program.
//! - [`chat`]: message-list convenience entry points.
//!
//! Supported language:
//! - `{{ }}` output, `{# #}` comments, `-` whitespace control.
//! - `if`/`elif`/`else`, `for` with `loop`, inline `if` filters, `else`,
//!   `break` and `continue`.
//! - `set` (plain, tuple, attribute, subscript and block forms),
//!   `macro`, `call` blocks and `filter` blocks.
//! - Python-style literals, operators, slices, filters, tests and the
//!   usual string, list and dict methods.
//!
//! Not supported:
//! - `lstrip_blocks` (rejected with [`Error::UnsupportedOption`]).
//! - Template inheritance, `include` and `import`.
//! - Autoescaping and sandboxing.

pub mod ast;
pub mod builtins;
pub mod caps;
pub mod chat;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod string;
pub mod value;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use caps::Capabilities;
pub use chat::{
    apply_workarounds, render_chat_template, render_chat_template_with_context, ChatMessage,
    RenderContext,
};
pub use error::{Error, Result};
pub use eval::{Context, Evaluator, Flow};
pub use lexer::PreprocessOptions;
pub use string::{JinjaString, StringPart};
pub use value::{ObjectMap, Value};

/// Template compilation and render settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    #[serde(flatten)]
    pub preprocess: PreprocessOptions,
    /// Maximum nesting of macro and `caller` invocations.
    pub max_call_depth: usize,
    /// Fixed clock for `strftime_now`.
    #[serde(skip)]
    pub now: Option<NaiveDateTime>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            preprocess: PreprocessOptions::default(),
            max_call_depth: 64,
            now: None,
        }
    }
}

/// A parsed template, ready to render any number of times.
#[derive(Debug, Clone)]
pub struct Template {
    program: ast::Program,
    source: String,
    options: Options,
}

impl Template {
    pub fn new(source: &str) -> Result<Self> {
        Self::with_options(source, Options::default())
    }

    pub fn with_options(source: &str, options: Options) -> Result<Self> {
        let lexed = lexer::tokenize(source, &options.preprocess)?;
        let program = parser::parse(&lexed.tokens)?;
        debug!(statements = program.body.len(), "compiled template");
        Ok(Self {
            program,
            source: lexed.source,
            options,
        })
    }

    /// Render against a snapshot of `ctx`; the caller's values are never
    /// mutated.
    pub fn render(&self, ctx: &Context) -> Result<JinjaString> {
        let mut ctx = ctx.deep_copy();
        Evaluator::new(&self.options).render(&self.program, &mut ctx)
    }

    /// Render against a JSON object document.
    pub fn render_json(&self, doc: &serde_json::Value, mark_input: bool) -> Result<JinjaString> {
        let mut ctx = Context::from_json(doc, mark_input)?;
        Evaluator::new(&self.options).render(&self.program, &mut ctx)
    }

    pub fn capabilities(&self) -> Capabilities {
        caps::analyze(&self.program)
    }

    pub fn program(&self) -> &ast::Program {
        &self.program
    }

    /// The preprocessed source that error offsets point into.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn options(&self) -> &Options {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn render_does_not_touch_caller_context() {
        let tpl = Template::new("{{ xs.append(4) }}{{ xs | length }}").unwrap();
        let ctx = Context::from_json(&json!({"xs": [1, 2, 3]}), false).unwrap();
        assert_eq!(tpl.render(&ctx).unwrap().to_string(), "4");
        assert_eq!(tpl.render(&ctx).unwrap().to_string(), "4");
        assert_eq!(ctx.get("xs").and_then(Value::to_items).map(|v| v.len()), Some(3));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: Options = serde_json::from_value(json!({"trim_blocks": true})).unwrap();
        assert!(options.preprocess.trim_blocks);
        assert!(!options.preprocess.lstrip_blocks);
        assert_eq!(options.max_call_depth, 64);
    }

    #[test]
    fn lstrip_blocks_is_rejected() {
        let options = Options {
            preprocess: PreprocessOptions {
                trim_blocks: false,
                lstrip_blocks: true,
            },
            ..Options::default()
        };
        assert_eq!(
            Template::with_options("x", options).err(),
            Some(Error::UnsupportedOption("lstrip_blocks"))
        );
    }

    #[test]
    fn template_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Template>();
    }
}
