use crate::error::Error;
use handlebars::Handlebars;
use serde_json::Value;

/// Converts a JSON byte slice to Markdown.
///
/// A non-empty `template` is rendered against the parsed value with a
/// Mustache-compatible engine. An empty `template` triggers auto-generation
/// from the JSON shape; see [`generate_template`] for the template such a
/// document produces.
pub fn json_to_markdown(json: &[u8], template: &str) -> Result<String, Error> {
    let value: Value = serde_json::from_slice(json)?;

    if template.is_empty() {
        return Ok(render_auto(&value));
    }

    let mut registry = Handlebars::new();
    registry
        .register_template_string("response", template)
        .map_err(|err| Error::Template(err.to_string()))?;
    let rendered = registry
        .render("response", &value)
        .map_err(|err| Error::Template(err.to_string()))?;

    Ok(rendered.trim().to_string())
}

/// Produces the Mustache template that auto-generation uses for a value.
///
/// Objects render their keys alphabetically as headings (depth 2 at the top
/// level, one deeper per nesting level) with triple-brace references to the
/// dotted path; arrays of same-shaped objects render as tables, arrays of
/// primitives as bullet lists; a top-level primitive renders bare. Users can
/// start from this output when writing a template of their own.
pub fn generate_template(value: &Value) -> String {
    let mut out = String::new();
    template_for_value(&mut out, value, "", 2);
    out
}

fn template_for_value(out: &mut String, value: &Value, prefix: &str, heading_level: usize) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                let child = &map[key.as_str()];
                let reference = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                out.push_str(&format!("{} {}\n\n", "#".repeat(heading_level), key));

                match child {
                    Value::Object(_) => {
                        template_for_value(out, child, &reference, heading_level + 1)
                    }
                    Value::Array(items) => template_for_array(out, items, key),
                    _ => out.push_str(&format!("{{{{{{{reference}}}}}}}\n\n")),
                }
            }
        }
        Value::Array(items) => template_for_array(out, items, "."),
        _ => out.push_str("{{{.}}}\n"),
    }
}

fn template_for_array(out: &mut String, items: &[Value], section_key: &str) {
    if items.is_empty() {
        out.push_str(&format!("{{{{#{section_key}}}}}\n{{{{/{section_key}}}}}\n\n"));
        return;
    }

    if let Some(columns) = consistent_object_keys(items) {
        out.push_str(&format!("| {} |\n", columns.join(" | ")));
        out.push_str(&format!("|{}\n", "---|".repeat(columns.len())));
        out.push_str(&format!("{{{{#{section_key}}}}}\n"));
        let cells: Vec<String> = columns
            .iter()
            .map(|col| format!("{{{{{{{col}}}}}}}"))
            .collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
        out.push_str(&format!("{{{{/{section_key}}}}}\n\n"));
        return;
    }

    // Primitive or mixed arrays both fall back to a bulleted section.
    out.push_str(&format!(
        "{{{{#{section_key}}}}}\n- {{{{{{.}}}}}}\n{{{{/{section_key}}}}}\n\n"
    ));
}

/// Renders the auto-generated structure directly against the value. The
/// output matches what a Mustache engine produces for the template from
/// [`generate_template`], and is byte-stable across runs.
fn render_auto(value: &Value) -> String {
    let mut out = String::new();
    render_value(&mut out, value, 2);
    out.trim().to_string()
}

fn render_value(out: &mut String, value: &Value, heading_level: usize) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                let child = &map[key.as_str()];
                out.push_str(&format!("{} {}\n\n", "#".repeat(heading_level), key));
                match child {
                    Value::Object(_) => render_value(out, child, heading_level + 1),
                    Value::Array(items) => render_array(out, items),
                    primitive => out.push_str(&format!("{}\n\n", render_primitive(primitive))),
                }
            }
        }
        Value::Array(items) => render_array(out, items),
        primitive => out.push_str(&format!("{}\n", render_primitive(primitive))),
    }
}

fn render_array(out: &mut String, items: &[Value]) {
    if items.is_empty() {
        out.push('\n');
        return;
    }

    if let Some(columns) = consistent_object_keys(items) {
        out.push_str(&format!("| {} |\n", columns.join(" | ")));
        out.push_str(&format!("|{}\n", "---|".repeat(columns.len())));
        for item in items {
            let cells: Vec<String> = columns
                .iter()
                .map(|col| render_primitive(&item[col.as_str()]))
                .collect();
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        out.push('\n');
        return;
    }

    for item in items {
        out.push_str(&format!("- {}\n", render_primitive(item)));
    }
    out.push('\n');
}

fn render_primitive(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn consistent_object_keys(items: &[Value]) -> Option<Vec<String>> {
    let first = items.first()?.as_object()?;
    let mut keys: Vec<String> = first.keys().cloned().collect();
    keys.sort();

    for item in &items[1..] {
        let map = item.as_object()?;
        let mut item_keys: Vec<&String> = map.keys().collect();
        item_keys.sort();
        if item_keys.len() != keys.len() || !item_keys.iter().zip(&keys).all(|(a, b)| **a == *b) {
            return None;
        }
    }
    Some(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auto_generates_object_headings() {
        let md = json_to_markdown(br#"{"title":"My API","version":"1.0"}"#, "").unwrap();
        assert!(md.contains("## title"), "got {md:?}");
        assert!(md.contains("My API"), "got {md:?}");
        assert!(md.contains("## version"), "got {md:?}");
    }

    #[test]
    fn auto_generates_table_for_uniform_object_array() {
        let md = json_to_markdown(
            br#"{"users":[{"name":"Alice","role":"admin"},{"name":"Bob","role":"user"}]}"#,
            "",
        )
        .unwrap();
        assert!(md.contains("| name | role |"), "got {md:?}");
        assert!(md.contains("| Alice | admin |"), "got {md:?}");
        assert!(md.contains("| Bob | user |"), "got {md:?}");
    }

    #[test]
    fn auto_generates_bullets_for_primitive_array() {
        let md = json_to_markdown(br#"{"tags":["rust","proxy","markdown"]}"#, "").unwrap();
        assert!(md.contains("- rust"), "got {md:?}");
        assert!(md.contains("- proxy"), "got {md:?}");
        assert!(md.contains("- markdown"), "got {md:?}");
    }

    #[test]
    fn auto_generates_table_for_top_level_array() {
        let md = json_to_markdown(br#"[{"id":1,"name":"Alice"},{"id":2,"name":"Bob"}]"#, "")
            .unwrap();
        assert!(md.contains("| id | name |"), "got {md:?}");
        assert!(md.contains("| 1 | Alice |"), "got {md:?}");
    }

    #[test]
    fn auto_generates_nested_headings() {
        let md = json_to_markdown(br#"{"server":{"host":"localhost","port":8080}}"#, "").unwrap();
        assert!(md.contains("## server"), "got {md:?}");
        assert!(md.contains("### host"), "got {md:?}");
        assert!(md.contains("localhost"), "got {md:?}");
    }

    #[test]
    fn empty_object_renders_empty() {
        assert_eq!(json_to_markdown(b"{}", "").unwrap(), "");
    }

    #[test]
    fn empty_array_keeps_its_heading() {
        let md = json_to_markdown(br#"{"items":[]}"#, "").unwrap();
        assert!(md.contains("## items"), "got {md:?}");
    }

    #[test]
    fn auto_generation_is_byte_stable() {
        let input = br#"{"b":[1,2],"a":{"x":"y"},"c":"v"}"#;
        let first = json_to_markdown(input, "").unwrap();
        let second = json_to_markdown(input, "").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn user_template_renders_verbatim() {
        let md = json_to_markdown(
            br#"{"name":"Alice","greeting":"Hello"}"#,
            "# {{{greeting}}}, {{{name}}}!",
        )
        .unwrap();
        assert_eq!(md, "# Hello, Alice!");
    }

    #[test]
    fn user_template_sections_iterate_arrays() {
        let md = json_to_markdown(
            br#"{"items":[{"name":"one"},{"name":"two"}]}"#,
            "{{#items}}\n- {{{name}}}\n{{/items}}",
        )
        .unwrap();
        assert!(md.contains("- one"), "got {md:?}");
        assert!(md.contains("- two"), "got {md:?}");
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(matches!(
            json_to_markdown(b"not json", ""),
            Err(Error::InvalidJson(_))
        ));
    }

    #[test]
    fn unbalanced_template_is_rejected() {
        assert!(matches!(
            json_to_markdown(br#"{"key":"value"}"#, "{{#unclosed}}"),
            Err(Error::Template(_))
        ));
    }

    #[test]
    fn template_for_primitive_is_bare_reference() {
        let tpl = generate_template(&json!("hello"));
        assert!(tpl.contains("{{{.}}}"), "got {tpl:?}");
    }

    #[test]
    fn template_for_uniform_array_contains_section_and_cells() {
        let tpl = generate_template(&json!({"users":[{"name":"a","role":"b"}]}));
        assert!(tpl.contains("| name | role |"), "got {tpl:?}");
        assert!(tpl.contains("{{#users}}"), "got {tpl:?}");
        assert!(tpl.contains("| {{{name}}} | {{{role}}} |"), "got {tpl:?}");
        assert!(tpl.contains("{{/users}}"), "got {tpl:?}");
    }

    #[test]
    fn template_for_mixed_array_is_a_bullet_section() {
        let tpl = generate_template(&json!([{"a": 1}, {"b": 2}]));
        assert!(tpl.contains("- {{{.}}}"), "got {tpl:?}");
    }

    #[test]
    fn template_references_nested_paths_with_dots() {
        let tpl = generate_template(&json!({"server":{"host":"localhost"}}));
        assert!(tpl.contains("{{{server.host}}}"), "got {tpl:?}");
    }
}
