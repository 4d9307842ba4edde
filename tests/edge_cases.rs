use chatjinja::{render_chat_template_with_context, ChatMessage, Error, RenderContext};

fn render(template: &str, messages: &[ChatMessage], ctx: &RenderContext) -> String {
    render_chat_template_with_context(template, messages, ctx).unwrap()
}

fn roles(roles: &[&str]) -> Vec<ChatMessage> {
    roles.iter().map(|role| ChatMessage::new(*role, "")).collect()
}

// ── Edge cases over the message front end ──

#[test]
fn empty_messages_produces_empty_output() {
    let template = "{% for message in messages %}{{ message.content }}{% endfor %}";
    assert_eq!(render(template, &[], &RenderContext::new()), "");
}

#[test]
fn plain_text_template_no_tags() {
    assert_eq!(render("Hello, world!", &[], &RenderContext::new()), "Hello, world!");
}

#[test]
fn context_var_outside_loop() {
    let mut ctx = RenderContext::new();
    ctx.set_var("bos_token", "<s>");
    ctx.set_var("eos_token", "</s>");
    assert_eq!(
        render("{{ bos_token }}PROMPT{{ eos_token }}", &[], &ctx),
        "<s>PROMPT</s>"
    );
}

#[test]
fn dot_access_and_bracket_access_equivalent() {
    let messages = vec![ChatMessage::new("user", "hi")];
    let ctx = RenderContext::new();
    let a = render("{% for message in messages %}{{ message.role }}{% endfor %}", &messages, &ctx);
    let b = render("{% for message in messages %}{{ message['role'] }}{% endfor %}", &messages, &ctx);
    assert_eq!(a, b);
    assert_eq!(a, "user");
}

#[test]
fn loop_first_and_last() {
    let template = "{% for message in messages %}{% if loop.first %}[{% endif %}{{ message.role }}{% if loop.last %}]{% endif %}{% endfor %}";
    let ctx = RenderContext::new();
    assert_eq!(render(template, &roles(&["a"]), &ctx), "[a]");
    assert_eq!(render(template, &roles(&["a", "b", "c"]), &ctx), "[abc]");
}

#[test]
fn or_operator_in_condition() {
    let template = "{% for message in messages %}{% if message.role == 'user' or message.role == 'assistant' %}Y{% else %}N{% endif %}{% endfor %}";
    let rendered = render(template, &roles(&["system", "user", "assistant"]), &RenderContext::new());
    assert_eq!(rendered, "NYY");
}

#[test]
fn elif_chain_inside_for() {
    let template = "{% for message in messages %}{% if message.role == 'user' %}U{% elif message.role == 'system' %}S{% else %}O{% endif %}{% endfor %}";
    let rendered = render(template, &roles(&["user", "system", "tool"]), &RenderContext::new());
    assert_eq!(rendered, "USO");
}

#[test]
fn special_characters_are_not_escaped() {
    let template = "{% for message in messages %}{{ message.content }}{% endfor %}";
    let messages = vec![ChatMessage::new("user", "Hello <world> & \"friends\"")];
    assert_eq!(
        render(template, &messages, &RenderContext::new()),
        "Hello <world> & \"friends\""
    );
}

#[test]
fn unicode_content() {
    let template = "{% for message in messages %}{{ message.content | upper }}|{{ message.content[0] }}{% endfor %}";
    let messages = vec![ChatMessage::new("user", "ćao 🌍")];
    assert_eq!(render(template, &messages, &RenderContext::new()), "ĆAO 🌍|ć");
}

#[test]
fn flag_default_false_when_missing() {
    let template = "{% for message in messages %}{{ message.role }}{% if loop.last and add_generation_prompt %}PROMPT{% endif %}{% endfor %}";
    let rendered = render(template, &roles(&["user"]), &RenderContext::new());
    assert_eq!(rendered, "user");
}

#[test]
fn tools_bound_as_json() {
    let template = "{% if tools %}{% for t in tools %}{{ t.name }}({{ t.parameters | tojson }});{% endfor %}{% endif %}";
    let mut ctx = RenderContext::new();
    ctx.set_json(
        "tools",
        serde_json::json!([{"name": "get_time", "parameters": {"tz": "string"}}]),
    );
    assert_eq!(render(template, &[], &ctx), "get_time({\"tz\": \"string\"});");
}

#[test]
fn raise_exception_aborts_render() {
    let template = "{% for message in messages %}{% if message.role == 'system' %}{{ raise_exception('System role not supported') }}{% endif %}{% endfor %}";
    let err = render_chat_template_with_context(template, &roles(&["system"]), &RenderContext::new())
        .unwrap_err();
    assert_eq!(err, Error::Raised("System role not supported".to_string()));
}

#[test]
fn unknown_filter_is_runtime_error() {
    let err = render_chat_template_with_context("{{ 'x' | frobnicate }}", &[], &RenderContext::new())
        .unwrap_err();
    assert!(matches!(err, Error::Runtime { offset: Some(3), .. }), "{err:?}");
}

// ── Nesting limits ──

#[test]
fn long_operator_chain_is_parse_error() {
    let ctx = RenderContext::new();
    let long = format!("{{{{ 1{} }}}}", "+1".repeat(10_000));
    let err = render_chat_template_with_context(&long, &[], &ctx).unwrap_err();
    assert!(matches!(err, Error::Parse { .. }), "{err:?}");

    let filters = format!("{{{{ 'x'{} }}}}", " | upper".repeat(10_000));
    let err = render_chat_template_with_context(&filters, &[], &ctx).unwrap_err();
    assert!(matches!(err, Error::Parse { .. }), "{err:?}");

    let members = format!("{{{{ messages{} }}}}", ".role".repeat(10_000));
    let err = render_chat_template_with_context(&members, &[], &ctx).unwrap_err();
    assert!(matches!(err, Error::Parse { .. }), "{err:?}");

    let short = format!("{{{{ 1{} }}}}", "+1".repeat(100));
    assert_eq!(render(&short, &[], &ctx), "101");
}

#[test]
fn deeply_nested_blocks_are_parse_error() {
    let ctx = RenderContext::new();
    let nest = |depth: usize| {
        format!(
            "{}x{}",
            "{% if true %}".repeat(depth),
            "{% endif %}".repeat(depth)
        )
    };
    let err = render_chat_template_with_context(&nest(50_000), &[], &ctx).unwrap_err();
    assert!(matches!(err, Error::Parse { .. }), "{err:?}");
    assert_eq!(render(&nest(30), &[], &ctx), "x");
}
