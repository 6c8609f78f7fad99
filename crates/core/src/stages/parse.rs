//! # Output Parsing
//!
//! Helpers for turning free-form generator text into structured payloads,
//! plus the ambiguity pre-check run on the raw request.

use serde_json::Value;

use super::payloads::AmbiguityReport;

/// Vague qualifiers that suggest an underspecified request
const VAGUE_PATTERNS: &[&str] = &[
    r"(?i)\b(user-friendly|user friendly)\b",
    r"(?i)\b(fast|quick|quickly)\b",
    r"(?i)\b(good|better|best)\b",
    r"(?i)\b(easy|simple|easily)\b",
    r"(?i)\b(nice|nice-looking|pretty)\b",
    r"(?i)\b(some|various|multiple|several)\b",
    r"(?i)\b(should|could|might|may)\b",
];

/// Specification areas a complete request usually mentions
const COVERAGE_PATTERNS: &[&str] = &[
    r"(?i)\b(input|output)\b",
    r"(?i)\b(error|exception|handle)\b",
    r"(?i)\b(platform|os|operating system)\b",
    r"(?i)\b(performance|speed|time)\b",
];

const MIN_REQUEST_LEN: usize = 50;

/// Flag requests that are short, vague or silent on common concerns
pub fn detect_ambiguity(request: &str) -> AmbiguityReport {
    let count = |patterns: &[&str], want_match: bool| {
        patterns
            .iter()
            .filter_map(|pattern| regex::Regex::new(pattern).ok())
            .filter(|re| re.is_match(request) == want_match)
            .count()
    };

    let vague_terms_found = count(VAGUE_PATTERNS, true);
    let missing_specifications = count(COVERAGE_PATTERNS, false);
    let is_ambiguous = vague_terms_found > 2
        || missing_specifications > 2
        || request.trim().chars().count() < MIN_REQUEST_LEN;

    AmbiguityReport {
        is_ambiguous,
        vague_terms_found,
        missing_specifications,
        input_length: request.chars().count(),
    }
}

/// Extract the outermost JSON object from text that may contain prose or
/// Markdown fences around it
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Return the body of the first fenced code block, or the trimmed text when
/// there is none
pub fn strip_code_fences(text: &str) -> String {
    let Some(open) = text.find("```") else {
        return text.trim().to_string();
    };
    // Skip the info string ("python", "rust", ...) on the opening fence line
    let body_start = match text[open + 3..].find('\n') {
        Some(offset) => open + 3 + offset + 1,
        None => return text.trim().to_string(),
    };
    match text[body_start..].find("```") {
        Some(close) => text[body_start..body_start + close].trim().to_string(),
        None => text[body_start..].trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_request_is_ambiguous() {
        let report = detect_ambiguity("make a calculator");
        assert!(report.is_ambiguous);
        assert_eq!(report.input_length, 17);
    }

    #[test]
    fn test_detailed_request_is_not_ambiguous() {
        let request = "Build a command-line calculator that reads two numbers as input, \
                       prints the sum as output, and must handle division by zero with an \
                       error message on every platform within 10ms response time.";
        let report = detect_ambiguity(request);
        assert_eq!(report.missing_specifications, 0);
        assert!(!report.is_ambiguous);
    }

    #[test]
    fn test_vague_terms_counted() {
        let request = "A fast, simple and user-friendly tool that should be pretty and good \
                       at handling input and output on any platform with error handling.";
        let report = detect_ambiguity(request);
        assert!(report.vague_terms_found > 2);
        assert!(report.is_ambiguous);
    }

    #[test]
    fn test_extract_json_with_prose() {
        let text = "Here is the result:\n```json\n{\"approved\": true, \"feedback\": []}\n```\nThanks";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["approved"], true);
    }

    #[test]
    fn test_extract_json_rejects_non_object() {
        assert!(extract_json_object("[1, 2, 3]").is_none());
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("} backwards {").is_none());
    }

    #[test]
    fn test_strip_code_fences() {
        let text = "Sure:\n```python\ndef add(a, b):\n    return a + b\n```\n";
        assert_eq!(strip_code_fences(text), "def add(a, b):\n    return a + b");
        assert_eq!(strip_code_fences("  plain code  "), "plain code");
    }
}
