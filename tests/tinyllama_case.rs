use chatjinja::{render_chat_template, render_chat_template_with_context, ChatMessage, RenderContext};

const TINYLLAMA: &str = r#"
{% for message in messages %}
{% if message['role'] == 'user' %}
{{ '<|user|>\n' + message['content'] + eos_token }}
{% elif message['role'] == 'system' %}
{{ '<|system|>\n' + message['content'] + eos_token }}
{% elif message['role'] == 'assistant' %}
{{ '<|assistant|>\n'  + message['content'] + eos_token }}
{% endif %}
{% if loop.last and add_generation_prompt %}
{{ '<|assistant|>' }}
{% endif %}
{% endfor %}
"#;

fn conversation() -> Vec<ChatMessage> {
    vec![
        ChatMessage::new("system", "You are a friendly AI."),
        ChatMessage::new("user", "Hello!"),
    ]
}

#[test]
fn test_tinyllama_template_full_features() {
    // Uses default context: eos_token="</s>", add_generation_prompt=true
    let rendered = render_chat_template(TINYLLAMA.trim(), &conversation()).unwrap();
    let expected = "<|system|>\nYou are a friendly AI.</s>\n<|user|>\nHello!</s>\n<|assistant|>\n";
    assert_eq!(rendered, expected);
}

#[test]
fn test_tinyllama_with_explicit_context() {
    let mut ctx = RenderContext::new();
    ctx.set_var("eos_token", "</s>");
    ctx.set_flag("add_generation_prompt", true);

    let rendered = render_chat_template_with_context(TINYLLAMA.trim(), &conversation(), &ctx).unwrap();
    let expected = "<|system|>\nYou are a friendly AI.</s>\n<|user|>\nHello!</s>\n<|assistant|>";
    assert_eq!(rendered.trim(), expected);
}

#[test]
fn test_untrimmed_source_keeps_outer_newlines() {
    let rendered = render_chat_template(TINYLLAMA, &conversation()).unwrap();
    assert!(rendered.starts_with("\n<|system|>"), "{rendered:?}");
    assert!(rendered.ends_with("<|assistant|>\n"), "{rendered:?}");
}

#[test]
fn test_add_generation_prompt_false() {
    let mut ctx = RenderContext::new();
    ctx.set_var("eos_token", "</s>");
    ctx.set_flag("add_generation_prompt", false);

    let messages = vec![ChatMessage::new("user", "Hi")];
    let rendered = render_chat_template_with_context(TINYLLAMA.trim(), &messages, &ctx).unwrap();
    assert_eq!(rendered, "<|user|>\nHi</s>\n");
}

#[test]
fn test_custom_eos_token() {
    let template = "{% for message in messages %}\n{{ message['content'] + eos_token }}\n{% endfor %}";

    let mut ctx = RenderContext::new();
    ctx.set_var("eos_token", "<|endoftext|>");

    let messages = vec![ChatMessage::new("user", "Hello")];
    let rendered = render_chat_template_with_context(template, &messages, &ctx).unwrap();
    assert_eq!(rendered, "Hello<|endoftext|>\n");
}

#[test]
fn test_missing_eos_token_renders_empty() {
    let messages = vec![ChatMessage::new("user", "Hi")];
    let rendered =
        render_chat_template_with_context(TINYLLAMA.trim(), &messages, &RenderContext::new()).unwrap();
    assert_eq!(rendered, "<|user|>\nHi\n");
}

#[test]
fn test_multi_turn_conversation() {
    let messages = vec![
        ChatMessage::new("system", "You help."),
        ChatMessage::new("user", "What is 2+2?"),
        ChatMessage::new("assistant", "4"),
        ChatMessage::new("user", "Thanks!"),
    ];

    let mut ctx = RenderContext::new();
    ctx.set_var("eos_token", "</s>");
    ctx.set_flag("add_generation_prompt", true);

    let rendered = render_chat_template_with_context(TINYLLAMA.trim(), &messages, &ctx).unwrap();
    let expected = concat!(
        "<|system|>\nYou help.</s>\n",
        "<|user|>\nWhat is 2+2?</s>\n",
        "<|assistant|>\n4</s>\n",
        "<|user|>\nThanks!</s>\n",
        "<|assistant|>\n",
    );
    assert_eq!(rendered, expected);
}
