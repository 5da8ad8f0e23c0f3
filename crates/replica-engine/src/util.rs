use std::env;
use std::time::Instant;

use serde_json::{Map, Value};

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u64::MAX as u128) as u64
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

/// Model replies often wrap JSON in a Markdown fence; returns the inner text.
pub(crate) fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parses the first JSON object in a model reply, tolerating fences and
/// leading or trailing prose.
pub(crate) fn parse_json_object(raw: &str) -> Option<Value> {
    let body = strip_code_fences(raw);
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(body) {
        return Some(value);
    }
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&body[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

pub(crate) fn value_as_f64(value: Option<&str>, default: f64, min: f64, max: f64) -> f64 {
    value
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|raw| raw.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}

pub(crate) fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "asset".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        error_chain_text, parse_json_object, push_unique_warning, sanitize_key,
        strip_code_fences, truncate_text, value_as_f64,
    };

    #[test]
    fn strips_markdown_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn parses_json_wrapped_in_prose() {
        let parsed = parse_json_object("Here you go:\n{\"mode\": \"GENERATE\"}\nThanks!");
        assert_eq!(parsed, Some(json!({"mode": "GENERATE"})));
        assert_eq!(parse_json_object("not json at all"), None);
        assert_eq!(parse_json_object("[1, 2]"), None);
    }

    #[test]
    fn error_chain_is_deduplicated_and_truncated() {
        let err = anyhow::anyhow!("socket closed")
            .context("render failed")
            .context("render failed");
        assert_eq!(
            error_chain_text(&err, 200),
            "render failed | caused by: socket closed"
        );
        assert_eq!(truncate_text("abcdef", 3), "abc…");
    }

    #[test]
    fn warnings_are_unique() {
        let mut warnings = Vec::new();
        push_unique_warning(&mut warnings, "a".to_string());
        push_unique_warning(&mut warnings, "a".to_string());
        push_unique_warning(&mut warnings, " ".to_string());
        assert_eq!(warnings, vec!["a"]);
    }

    #[test]
    fn numeric_env_values_are_clamped() {
        assert_eq!(value_as_f64(Some("7"), 2.0, 0.0, 5.0), 5.0);
        assert_eq!(value_as_f64(Some("nope"), 2.0, 0.0, 5.0), 2.0);
        assert_eq!(value_as_f64(None, 2.0, 0.0, 5.0), 2.0);
        assert_eq!(sanitize_key("hero img/1"), "hero_img_1");
    }
}
