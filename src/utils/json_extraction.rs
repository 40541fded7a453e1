//! JSON extraction from model replies.
//!
//! Models asked for a JSON object do not always reply with bare JSON: the
//! object may sit in a markdown code block or follow some reasoning text.
//! Strategies, in order:
//!
//! 1. The whole reply parses as an object
//! 2. A ```json code block
//! 3. Any fenced code block containing an object
//! 4. The largest valid object anywhere, preferring later ones
//!
//! # Example
//!
//! ```
//! use analysis_forge::utils::json_extraction::extract_json_object;
//!
//! let reply = "Here you go:\n```json\n{\"clarity\": 0.8}\n```";
//! let object = extract_json_object(reply).unwrap();
//! assert_eq!(object["clarity"], 0.8);
//! ```

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

/// Error type for JSON extraction failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed_braces} unclosed braces. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed_braces: usize,
    },
    #[error("No JSON object found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
}

fn preview(content: &str, len: usize) -> String {
    content.chars().take(len).collect()
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Extracts the JSON object a model reply carries.
pub fn extract_json_object(content: &str) -> Result<Map<String, Value>, JsonExtractionError> {
    let trimmed = content.trim();

    if let Some(map) = parse_object(trimmed) {
        return Ok(map);
    }

    if let Some(map) = extract_from_json_code_block(trimmed).as_deref().and_then(parse_object) {
        return Ok(map);
    }

    if let Some(map) = extract_from_generic_code_block(trimmed).as_deref().and_then(parse_object) {
        return Ok(map);
    }

    if let Some(map) = extract_last_valid_json_object(trimmed).as_deref().and_then(parse_object) {
        return Ok(map);
    }

    if let Some(start) = trimmed.find('{') {
        let unclosed = count_unclosed_braces(&trimmed[start..]);
        if unclosed > 0 {
            return Err(JsonExtractionError::Truncated {
                partial_preview: preview(&trimmed[start..], 100),
                unclosed_braces: unclosed,
            });
        }
    }

    Err(JsonExtractionError::NotFound {
        content_preview: preview(trimmed, 100),
    })
}

fn count_unclosed_braces(s: &str) -> usize {
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for c in s.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }

    depth.max(0) as usize
}

/// Finds the index of the `}` closing the object `s` starts with.
///
/// Braces inside string literals, including escaped quotes, are ignored.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => {
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
            }
            '{' if !in_string => {
                depth += 1;
            }
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Extract JSON from a ```json ... ``` code block.
pub fn extract_from_json_code_block(content: &str) -> Option<String> {
    let re = Regex::new(r"```json\s*\n?([\s\S]*?)\n?```").ok()?;
    let caps = re.captures(content)?;
    let json_content = caps.get(1)?.as_str().trim();
    if json_content.starts_with('{') {
        if let Some(end) = find_matching_brace(json_content) {
            return Some(json_content[..=end].to_string());
        }
        return Some(json_content.to_string());
    }
    None
}

/// Extract the first object inside a generic ``` ... ``` code block.
pub fn extract_from_generic_code_block(content: &str) -> Option<String> {
    let re = Regex::new(r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```").ok()?;
    let caps = re.captures(content)?;
    let block_content = caps.get(1)?.as_str().trim();
    let start = block_content.find('{')?;
    let end = find_matching_brace(&block_content[start..])?;
    Some(block_content[start..=start + end].to_string())
}

/// Extract the largest valid JSON object, preferring later occurrences.
///
/// Reasoning models may emit JSON-like fragments before the actual answer;
/// the answer is usually the biggest object and comes last.
pub fn extract_last_valid_json_object(content: &str) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;

    for (start, _) in content.char_indices().filter(|(_, c)| *c == '{') {
        let rest = &content[start..];
        let Some(end) = find_matching_brace(rest) else {
            continue;
        };
        let candidate = &rest[..=end];
        if parse_object(candidate).is_none() {
            continue;
        }
        // `>=` so that a later object of equal size wins.
        if best.map_or(true, |(len, _)| candidate.len() >= len) {
            best = Some((candidate.len(), candidate));
        }
    }

    best.map(|(_, s)| s.to_string())
}
