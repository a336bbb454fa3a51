//! Pull a JSON object out of free-form model output.

use regex::Regex;
use std::sync::LazyLock;

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*\n?(\{.*?\})\s*```").unwrap());

/// The JSON object in `content`: the body of the first fenced block holding
/// an object, else the span from the first `{` to the last `}`, else the
/// input unchanged.
pub fn extract_json(content: &str) -> &str {
    if let Some(body) = FENCED_JSON.captures(content).and_then(|c| c.get(1)) {
        return body.as_str();
    }
    match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_block() {
        let content = "Here you go:\n```json\n{\"fixes\": {}}\n```\nDone.";
        assert_eq!(extract_json(content), "{\"fixes\": {}}");

        let content = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json(content), "{\"a\": 1}");
    }

    #[test]
    fn test_raw_object_with_prose() {
        let content = "Sure. {\"fixes\": {\"a.tex\": \"x\"}, \"description\": \"y\"} Hope it helps";
        assert_eq!(
            extract_json(content),
            "{\"fixes\": {\"a.tex\": \"x\"}, \"description\": \"y\"}"
        );
    }

    #[test]
    fn test_no_object() {
        assert_eq!(extract_json("no json here"), "no json here");
        assert_eq!(extract_json("} backwards {"), "} backwards {");
    }
}
