use chatjinja::{Context, Error, Options, PreprocessOptions, Template};
use pretty_assertions::assert_eq;
use serde_json::json;

fn render(src: &str, doc: serde_json::Value) -> String {
    Template::new(src)
        .unwrap()
        .render_json(&doc, false)
        .unwrap()
        .to_string()
}

#[test]
fn if_else() {
    assert_eq!(
        render("{% if cond %}yes{% else %}no{% endif %}", json!({"cond": false})),
        "no"
    );
}

#[test]
fn for_over_items() {
    assert_eq!(
        render("{% for i in items %}{{ i }}{% endfor %}", json!({"items": [1, 2, 3]})),
        "123"
    );
}

#[test]
fn replace_filter() {
    assert_eq!(
        render("{{ 'hello world'|replace('world','jinja') }}", json!({})),
        "hello jinja"
    );
}

#[test]
fn namespace_escapes_loop_scope() {
    let ns = "{% set ns = namespace(count=0) %}{% for i in [1, 2, 3] %}{% set ns.count = ns.count + 1 %}{% endfor %}{{ ns.count }}";
    assert_eq!(render(ns, json!({})), "3");

    let scalar = "{% set count = 0 %}{% for i in [1, 2, 3] %}{% set count = count + 1 %}{% endfor %}{{ count }}";
    assert_eq!(render(scalar, json!({})), "0");
}

#[test]
fn tojson_indent_matches_python() {
    let out = render(
        "{{ data|tojson(indent=2) }}",
        json!({"data": {"a": [1, 2], "b": "x", "c": {}}}),
    );
    assert_eq!(
        out,
        "{\n  \"a\": [\n    1,\n    2\n  ],\n  \"b\": \"x\",\n  \"c\": {}\n}"
    );
}

#[test]
fn macros_see_their_defining_scope() {
    let shadowed = "{% set x = 'outer' %}{% macro m() %}{{ x }}{% endmacro %}{% for x in ['loop'] %}{{ m() }}{% endfor %}";
    assert_eq!(render(shadowed, json!({})), "outer");

    let later = "{% macro a() %}{{ b() }}{% endmacro %}{% macro b() %}B{% endmacro %}{{ a() }}";
    assert_eq!(render(later, json!({})), "B");

    let countdown = "{% macro c(n) %}{{ n }}{% if n > 0 %}{{ c(n - 1) }}{% endif %}{% endmacro %}{{ c(3) }}";
    assert_eq!(render(countdown, json!({})), "3210");
}

#[test]
fn missing_end_tags_are_parse_errors() {
    for src in [
        "{% if x %}a",
        "{% if x %}a{% else %}b",
        "{% for x in y %}a",
        "{% macro m() %}a",
        "{% set x %}a",
        "{% call m() %}a",
        "{% filter upper %}a",
    ] {
        let err = Template::new(src).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }), "{src}: {err:?}");
    }
}

#[test]
fn trim_markers_around_loops() {
    let out = render(
        "  {%- if kvs %}   {%- for k, v in kvs %}{{ k }}={{ v }} {% endfor -%}  {%- endif %}",
        json!({"kvs": {"a": 1, "b": 2}}),
    );
    assert_eq!(out, "a=1 b=2 ");
}

#[test]
fn whitespace_kept_without_markers() {
    assert_eq!(render("    {% if true %}\n    {% endif %}", json!({})), "    \n    ");
}

#[test]
fn trim_marker_swallows_blank_lines() {
    let out = render(
        "{{- ']~b[ai' ~ '\\n' }}\n\n{%- set reasoning_content = ''%}",
        json!({}),
    );
    assert_eq!(out, "]~b[ai\n");
}

#[test]
fn trim_blocks_option() {
    let options = Options {
        preprocess: PreprocessOptions {
            trim_blocks: true,
            lstrip_blocks: false,
        },
        ..Options::default()
    };
    let tpl = Template::with_options("{% for x in xs %}\n{{ x }}\n{% endfor %}\n", options).unwrap();
    let out = tpl.render_json(&json!({"xs": [1, 2]}), false).unwrap();
    assert_eq!(out.to_string(), "1\n2\n");
}

#[test]
fn generation_tags_are_transparent() {
    assert_eq!(
        render("A{% generation %}B{% endgeneration %}C", json!({})),
        "ABC"
    );
}

#[test]
fn strftime_now_uses_fixed_clock() {
    let now = chrono::NaiveDate::from_ymd_opt(2024, 7, 4)
        .and_then(|d| d.and_hms_opt(9, 30, 0))
        .unwrap();
    let options = Options {
        now: Some(now),
        ..Options::default()
    };
    let tpl = Template::with_options("{{ strftime_now('%d %b %Y') }}", options).unwrap();
    assert_eq!(tpl.render(&Context::new()).unwrap().to_string(), "04 Jul 2024");
}

#[test]
fn dictsort_and_items() {
    let out = render(
        "{% for k, v in d | dictsort %}{{ k }}{{ v }}{% endfor %}|{% for k, v in d.items() %}{{ k }}{% endfor %}",
        json!({"d": {"b": 2, "a": 1}}),
    );
    assert_eq!(out, "a1b2|ba");
}

#[test]
fn tests_and_filters_chain() {
    let out = render(
        "{{ xs | select('odd') | map('string') | join('-') }} {{ xs | length is even }} {{ none is none }} {{ 'x' is string }}",
        json!({"xs": [1, 2, 3, 4, 5]}),
    );
    assert_eq!(out, "1-3-5 False True True");
}

#[test]
fn runtime_error_kinds() {
    let err = Template::new("{{ 1 / 0 }}")
        .unwrap()
        .render(&Context::new())
        .unwrap_err();
    assert!(matches!(err, Error::Runtime { .. }), "{err:?}");

    let err = Template::new("{{ 'abc' | wordwrap(2) }}")
        .unwrap()
        .render(&Context::new())
        .unwrap_err();
    assert!(matches!(err, Error::NotImplemented(_)), "{err:?}");

    let err = Template::new("{% continue %}")
        .unwrap()
        .render(&Context::new())
        .unwrap_err();
    assert_eq!(err, Error::LoopControl("continue"));
}

#[test]
fn lex_errors_report_offset() {
    let err = Template::new("ab{{ 'oops }}").unwrap_err();
    let Error::Lex { offset, .. } = err else {
        panic!("expected lex error, got {err:?}");
    };
    assert_eq!(offset, 5);
}

#[test]
fn input_must_be_an_object() {
    let tpl = Template::new("x").unwrap();
    assert!(matches!(
        tpl.render_json(&json!([1, 2]), false),
        Err(Error::Input(_))
    ));
}
