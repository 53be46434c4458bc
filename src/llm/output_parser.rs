//! JSON extraction from model text
//!
//! Models wrap structured replies in markdown fences or prose; this finds
//! the first parseable JSON document.

use serde_json::Value;

/// Extract JSON from text, handling fenced blocks and embedded documents
pub fn extract_json(text: &str) -> Option<Value> {
    extract_from_code_block(text, "json")
        .or_else(|| extract_from_code_block(text, ""))
        .or_else(|| serde_json::from_str(text.trim()).ok())
        .or_else(|| find_json_in_text(text))
}

/// Extract JSON from a markdown code block
fn extract_from_code_block(text: &str, lang: &str) -> Option<Value> {
    let start_patterns: Vec<String> = if lang.is_empty() {
        vec!["```\n".into(), "```".into()]
    } else {
        vec![
            format!("```{}\n", lang),
            format!("```{}\r\n", lang),
            // some models add a space after the language tag
            format!("```{} ", lang),
        ]
    };

    start_patterns.iter().find_map(|pattern| {
        let start = text.find(pattern.as_str())? + pattern.len();
        let remaining = &text[start..];
        let end = remaining.find("```")?;
        serde_json::from_str(remaining[..end].trim()).ok()
    })
}

/// Find a JSON object or array embedded in prose
fn find_json_in_text(text: &str) -> Option<Value> {
    [('{', '}'), ('[', ']')].iter().find_map(|&(open, close)| {
        let start = text.find(open)?;
        balanced_from(&text[start..], open, close)
    })
}

/// Parse the balanced `open ... close` span at the start of `text`
fn balanced_from(text: &str, open: char, close: char) -> Option<Value> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            c if c == open => depth += 1,
            c if c == close => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return serde_json::from_str(&text[..i + c.len_utf8()]).ok();
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_code_block() {
        let text = r#"
Here is the JSON:

```json
{"summary": "short", "score": 42}
```

That's all.
"#;

        let json = extract_json(text).unwrap();
        assert_eq!(json["summary"], "short");
        assert_eq!(json["score"], 42);
    }

    #[test]
    fn test_extract_json_from_generic_block() {
        let text = "```\n{\"key\": \"value\"}\n```";
        assert_eq!(extract_json(text).unwrap()["key"], "value");
    }

    #[test]
    fn test_extract_json_direct() {
        assert_eq!(extract_json("  [1, 2, 3]\n").unwrap()[2], 3);
        assert_eq!(extract_json("7").unwrap(), 7);
    }

    #[test]
    fn test_extract_json_embedded() {
        let text = r#"The result is: {"action": "fix", "files": ["main.rs"]} and that's it."#;
        assert_eq!(extract_json(text).unwrap()["action"], "fix");
    }

    #[test]
    fn test_braces_inside_strings_are_ignored() {
        let text = r#"Result: {"text": "a } inside", "n": 1} trailing"#;
        let json = extract_json(text).unwrap();
        assert_eq!(json["text"], "a } inside");
        assert_eq!(json["n"], 1);
    }

    #[test]
    fn test_extract_json_none() {
        assert!(extract_json("This is just plain text with no JSON").is_none());
    }
}
