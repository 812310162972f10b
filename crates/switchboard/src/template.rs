//! Template variable interpolation for webhook mappings and agent prompts.
//!
//! Replaces `{{Var}}` placeholders with runtime values from a
//! [`TemplateContext`]. Dotted paths like `{{messages[0].subject}}` read
//! into the JSON payload. Unknown variables are left as-is.
//!
//! The dispatching component decides which named variables exist. The
//! well-known set: `Body`, `BodyStripped`, `From`, `To`, `MessageId`,
//! `SessionId`, `IsNewSession`, `MediaUrl`, `MediaPath`, `MediaType`,
//! `Transcript`, `ChatType`, `GroupSubject`, `SenderName`, `Surface`.

use std::collections::HashMap;

use serde_json::Value;

/// Values available to template expansion.
#[derive(Debug, Default)]
pub struct TemplateContext {
    /// Named variables (Body, From, SessionId, ...).
    pub vars: HashMap<&'static str, String>,
    /// JSON payload for dotted-path lookups.
    pub payload: Option<Value>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(payload: Value) -> Self {
        Self {
            vars: HashMap::new(),
            payload: Some(payload),
        }
    }

    pub fn set(&mut self, name: &'static str, value: impl Into<String>) -> &mut Self {
        self.vars.insert(name, value.into());
        self
    }

    /// Resolve a variable: named vars first, then a dotted path into the payload.
    fn resolve(&self, name: &str) -> Option<String> {
        if let Some(v) = self.vars.get(name) {
            return Some(v.clone());
        }
        let payload = self.payload.as_ref()?;
        lookup_path(payload, name).map(render_value)
    }
}

/// Replace `{{Var}}` placeholders with values from the context.
///
/// Unknown variables like `{{Foo}}` are left unchanged, and an unclosed
/// `{{` is emitted literally.
pub fn expand(input: &str, ctx: &TemplateContext) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];

        if let Some(end) = after_open.find("}}") {
            let var_name = after_open[..end].trim();
            match ctx.resolve(var_name) {
                Some(value) => result.push_str(&value),
                None => {
                    // Unknown variable — leave as-is
                    result.push_str("{{");
                    result.push_str(&after_open[..end]);
                    result.push_str("}}");
                }
            }
            rest = &after_open[end + 2..];
        } else {
            // No closing `}}` — emit the `{{` literally and move on
            result.push_str("{{");
            rest = after_open;
        }
    }

    result.push_str(rest);
    result
}

/// Walk a dotted path with optional `[n]` indexing into a JSON value.
fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        let (field, indices) = parse_segment(segment)?;
        if !field.is_empty() {
            current = current.get(field)?;
        }
        for idx in indices {
            current = current.get(idx)?;
        }
    }
    Some(current)
}

/// Split `field[0][1]` into the field name and its index chain.
fn parse_segment(segment: &str) -> Option<(&str, Vec<usize>)> {
    let bracket = match segment.find('[') {
        Some(pos) => pos,
        None => return Some((segment, Vec::new())),
    };
    let field = &segment[..bracket];
    let mut indices = Vec::new();
    let mut rest = &segment[bracket..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let close = stripped.find(']')?;
        indices.push(stripped[..close].parse().ok()?);
        rest = &stripped[close + 1..];
    }
    if !rest.is_empty() {
        return None;
    }
    Some((field, indices))
}

/// Render a JSON value as substitution text.
///
/// Strings substitute without quotes; everything else uses its compact
/// JSON form.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expands_named_vars() {
        let mut ctx = TemplateContext::new();
        ctx.set("Body", "hello").set("From", "+1555");
        assert_eq!(expand("{{From}}: {{Body}}", &ctx), "+1555: hello");
    }

    #[test]
    fn unknown_vars_left_as_is() {
        let ctx = TemplateContext::new();
        assert_eq!(expand("Hello {{Unknown}}!", &ctx), "Hello {{Unknown}}!");
    }

    #[test]
    fn empty_payload_leaves_placeholders_untouched() {
        let ctx = TemplateContext::with_payload(json!({}));
        assert_eq!(expand("{{X}} and {{y.z}}", &ctx), "{{X}} and {{y.z}}");
    }

    #[test]
    fn unclosed_braces_emitted_literally() {
        let ctx = TemplateContext::new();
        assert_eq!(expand("tail {{oops", &ctx), "tail {{oops");
    }

    #[test]
    fn dotted_path_into_payload() {
        let ctx = TemplateContext::with_payload(json!({
            "repository": { "name": "switchboard" }
        }));
        assert_eq!(expand("repo={{repository.name}}", &ctx), "repo=switchboard");
    }

    #[test]
    fn indexed_path_into_payload() {
        let ctx = TemplateContext::with_payload(json!({
            "messages": [ { "subject": "first" }, { "subject": "second" } ]
        }));
        assert_eq!(expand("{{messages[0].subject}}", &ctx), "first");
        assert_eq!(expand("{{messages[1].subject}}", &ctx), "second");
        assert_eq!(expand("{{messages[2].subject}}", &ctx), "{{messages[2].subject}}");
    }

    #[test]
    fn named_vars_shadow_payload() {
        let mut ctx = TemplateContext::with_payload(json!({ "Body": "payload" }));
        ctx.set("Body", "named");
        assert_eq!(expand("{{Body}}", &ctx), "named");
    }

    #[test]
    fn non_string_values_render_as_json() {
        let ctx = TemplateContext::with_payload(json!({ "count": 3, "ok": true }));
        assert_eq!(expand("{{count}}/{{ok}}", &ctx), "3/true");
    }

    #[test]
    fn whitespace_inside_braces_tolerated() {
        let mut ctx = TemplateContext::new();
        ctx.set("Body", "hi");
        assert_eq!(expand("{{ Body }}", &ctx), "hi");
    }
}
