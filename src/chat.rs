//! Message-list entry points for HF-style chat templates.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::caps::Capabilities;
use crate::error::{Error, Result};
use crate::eval::Context;
use crate::lexer::PreprocessOptions;
use crate::string::JinjaString;
use crate::value::{ObjectMap, Value};
use crate::{Options, Template};

/// A single chat message in HF-style templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Template-side variables bound next to `messages`.
///
/// Values set here count as template text, not input.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    vars: serde_json::Map<String, serde_json::Value>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// `bos_token="<s>"`, `eos_token="</s>"`, `add_generation_prompt=true`.
    pub fn with_defaults() -> Self {
        let mut ctx = Self::new();
        ctx.set_var("bos_token", "<s>");
        ctx.set_var("eos_token", "</s>");
        ctx.set_flag("add_generation_prompt", true);
        ctx
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars
            .insert(name.into(), serde_json::Value::String(value.into()));
    }

    pub fn set_flag(&mut self, name: impl Into<String>, value: bool) {
        self.vars.insert(name.into(), serde_json::Value::Bool(value));
    }

    /// Bind an arbitrary JSON value, e.g. a `tools` list.
    pub fn set_json(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.vars.insert(name.into(), value);
    }

    fn to_context(&self, messages: &[ChatMessage]) -> Context {
        let mut ctx = Context::new();
        for (name, value) in &self.vars {
            ctx.set(name.as_str(), Value::from_json(value, false));
        }
        let messages: Vec<Value> = messages
            .iter()
            .map(|msg| {
                let mut map = ObjectMap::new();
                map.insert("role", Value::from(JinjaString::input(msg.role.as_str())));
                map.insert("content", Value::from(JinjaString::input(msg.content.as_str())));
                Value::from(map)
            })
            .collect();
        ctx.set("messages", Value::from(messages));
        ctx
    }
}

/// Settings chat templates are written against.
pub fn chat_options() -> Options {
    Options {
        preprocess: PreprocessOptions {
            trim_blocks: true,
            lstrip_blocks: false,
        },
        ..Options::default()
    }
}

/// Render a chat template with [`RenderContext::with_defaults`].
pub fn render_chat_template(template: &str, messages: &[ChatMessage]) -> Result<String> {
    render_chat_template_with_context(template, messages, &RenderContext::with_defaults())
}

/// Render a chat template with caller-provided variables. Missing variables
/// are undefined, so an unset flag is falsy.
pub fn render_chat_template_with_context(
    template: &str,
    messages: &[ChatMessage],
    ctx: &RenderContext,
) -> Result<String> {
    let template = Template::with_options(template, chat_options())?;
    Ok(render_messages(&template, messages, ctx)?.to_string())
}

/// Render `messages` with an already compiled template, keeping provenance.
pub fn render_messages(
    template: &Template,
    messages: &[ChatMessage],
    ctx: &RenderContext,
) -> Result<JinjaString> {
    let mut context = ctx.to_context(messages);
    apply_workarounds(&mut context, &template.capabilities())?;
    template.render(&context)
}

const DEFAULT_EMPTY: &[&str] = &["guideline", "functions", "datetime", "system_message"];

/// Adjust `ctx` for quirks of common templates: string `content` becomes
/// `[{"type": "text", "text": ...}]` when the template reads typed content,
/// and a few optional variables default to `""`.
pub fn apply_workarounds(ctx: &mut Context, caps: &Capabilities) -> Result<()> {
    if caps.requires_typed_content {
        match ctx.get("messages") {
            None | Some(Value::Undefined) => {}
            Some(Value::Array(messages)) => {
                for msg in messages.borrow().iter() {
                    let Value::Object(map) = msg else {
                        return Err(Error::Input(format!(
                            "expected each message to be an object, got {}",
                            msg.type_name()
                        )));
                    };
                    let mut map = map.borrow_mut();
                    let Some(Value::String(text)) = map.get("content").cloned() else {
                        continue;
                    };
                    let mut part = ObjectMap::new();
                    part.insert("type", Value::from("text"));
                    part.insert("text", Value::String(text));
                    map.insert("content", Value::from(vec![Value::from(part)]));
                }
                debug!("converted message content to typed parts");
            }
            Some(other) => {
                return Err(Error::Input(format!(
                    "expected messages to be an array, got {}",
                    other.type_name()
                )))
            }
        }
    }
    for name in DEFAULT_EMPTY {
        if !ctx.contains(name) {
            ctx.set(*name, Value::from(""));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn messages() -> Vec<ChatMessage> {
        vec![
            ChatMessage::new("system", "You are a helpful assistant."),
            ChatMessage::new("user", "Hello"),
        ]
    }

    #[test]
    fn simple_for_loop_over_messages() {
        let template = "{% for message in messages %}{{ message.role }}: {{ message.content }}\n{% endfor %}";
        let rendered = render_chat_template(template, &messages()).unwrap();
        assert_eq!(rendered, "system: You are a helpful assistant.\nuser: Hello\n");
    }

    #[test]
    fn multiple_sequential_loops_and_literals() {
        let template = "prefix-\n\
{% for message in messages %}A: {{ message.role }}\n{% endfor %}\
middle-\n\
{% for message in messages %}B: {{ message.content }}\n{% endfor %}suffix";
        let rendered = render_chat_template(template, &messages()).unwrap();
        let expected = concat!(
            "prefix-\n",
            "A: system\n",
            "A: user\n",
            "middle-\n",
            "B: You are a helpful assistant.\n",
            "B: Hello\n",
            "suffix",
        );
        assert_eq!(rendered, expected);
    }

    #[test]
    fn malformed_for_is_a_parse_error() {
        let err = render_chat_template("before {% for message in messages %}broken", &messages())
            .unwrap_err();
        assert!(err.is_syntax(), "{err}");
    }

    #[test]
    fn message_text_is_input() {
        let template = Template::with_options(
            "{% for m in messages %}[{{ m.content }}]{% endfor %}",
            chat_options(),
        )
        .unwrap();
        let out = render_messages(&template, &messages()[1..], &RenderContext::new()).unwrap();
        let parts: Vec<(String, bool)> = out
            .merged_parts()
            .into_iter()
            .map(|p| (p.text, p.is_input))
            .collect();
        assert_eq!(
            parts,
            vec![
                ("[".to_string(), false),
                ("Hello".to_string(), true),
                ("]".to_string(), false),
            ]
        );
    }

    #[test]
    fn typed_content_workaround() {
        let template = "{% for m in messages %}{% for part in m.content %}{{ part.type }}={{ part.text }}{% endfor %}{% endfor %}";
        let rendered = render_chat_template(template, &messages()[1..]).unwrap();
        assert_eq!(rendered, "text=Hello");
    }

    #[test]
    fn optional_variables_default_to_empty() {
        let mut ctx = Context::new();
        ctx.set("datetime", Value::from("today"));
        apply_workarounds(&mut ctx, &Capabilities::default()).unwrap();
        assert_eq!(ctx.get("guideline"), Some(&Value::from("")));
        assert_eq!(ctx.get("datetime"), Some(&Value::from("today")));
    }

    #[test]
    fn workaround_rejects_non_array_messages() {
        let mut ctx = Context::new();
        ctx.set("messages", Value::from("oops"));
        let caps = Capabilities {
            requires_typed_content: true,
            ..Capabilities::default()
        };
        assert!(matches!(
            apply_workarounds(&mut ctx, &caps),
            Err(Error::Input(_))
        ));
    }
}
