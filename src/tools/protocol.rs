//! Prompt-based tool-call protocol.
//!
//! Capability descriptions go into the instructions and the model answers
//! with a single JSON block in free text:
//!
//! ```json
//! {"tool": "search", "arguments": {"query": "rust"}}
//! ```
//!
//! Parsing is defensive. A malformed block never reaches a capability; it
//! yields a [`ProtocolDiagnostic`] the turn loop feeds back to the model.

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::{ToolCall, ToolSchema};

static JSON_FENCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json[ \t]*\r?\n(.*?)```").unwrap());

static TOOL_KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""tool"\s*:"#).unwrap());

/// Classification of one model response under the prompt protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    /// No tool call; the response is plain output.
    Text,
    Call(ToolCall),
    Malformed(ProtocolDiagnostic),
}

/// Why a tool-call block could not be used.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProtocolDiagnostic {
    /// Primary parse or structure error.
    pub error: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
    /// Opening minus closing braces outside string literals.
    pub brace_balance: i64,
    /// Unescaped double quotes in the block.
    pub quote_count: usize,
    /// Additional structural findings.
    pub problems: Vec<String>,
}

impl ProtocolDiagnostic {
    fn for_block(block: &str, error: impl Into<String>) -> Self {
        let (brace_balance, quote_count) = scan_block(block);
        let mut diag = Self {
            error: error.into(),
            brace_balance,
            quote_count,
            ..Default::default()
        };
        if let Some(imbalance) = diag.brace_summary() {
            diag.problems.push(imbalance);
        }
        if quote_count % 2 == 1 {
            diag.problems.push(format!(
                "unbalanced quotes: {} double quotes found, one string is never closed",
                quote_count
            ));
        }
        diag
    }

    /// "N extra closing braces" / "N unclosed braces", if imbalanced.
    pub fn brace_summary(&self) -> Option<String> {
        match self.brace_balance {
            0 => None,
            n if n < 0 => Some(format!("{} extra closing brace{}", -n, plural(-n))),
            n => Some(format!("{} unclosed brace{}", n, plural(n))),
        }
    }

    /// Text appended as the next turn's input.
    pub fn render(&self) -> String {
        let mut out = String::from("Your tool call could not be parsed, so no tool was run.\n");
        let _ = write!(out, "Error: {}", self.error);
        if let (Some(line), Some(column)) = (self.line, self.column) {
            let _ = write!(out, " (line {}, column {})", line, column);
        }
        out.push('\n');
        for problem in &self.problems {
            let _ = writeln!(out, "- {}", problem);
        }
        out.push_str(
            "Reply with exactly one JSON object of the form \
             {\"tool\": \"<name>\", \"arguments\": {...}}, or answer without a tool call when you are done.",
        );
        out
    }
}

fn plural(n: i64) -> &'static str {
    if n == 1 { "" } else { "s" }
}

/// Count brace balance outside string literals and unescaped quotes.
fn scan_block(block: &str) -> (i64, usize) {
    let mut balance = 0i64;
    let mut quotes = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for ch in block.chars() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => {
                    in_string = false;
                    quotes += 1;
                }
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                quotes += 1;
            }
            '{' => balance += 1,
            '}' => balance -= 1,
            _ => {}
        }
    }
    (balance, quotes)
}

/// Locate the candidate block: a ```json fence, else first `{` to last `}`.
fn candidate_block(content: &str) -> Option<&str> {
    if let Some(caps) = JSON_FENCE_REGEX.captures(content) {
        return caps.get(1).map(|m| m.as_str().trim());
    }
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return Some(&content[start..]);
    }
    Some(&content[start..=end])
}

/// Classify a model response.
///
/// A response is a tool-call attempt iff it contains a quoted `"tool"` key.
pub fn parse_tool_call(content: &str) -> ParsedResponse {
    if !TOOL_KEY_REGEX.is_match(content) {
        return ParsedResponse::Text;
    }

    let Some(block) = candidate_block(content) else {
        let mut diag = ProtocolDiagnostic::for_block(content, "no JSON object found");
        diag.problems
            .push("the tool call must be a JSON object starting with '{'".into());
        return ParsedResponse::Malformed(diag);
    };

    let value: Value = match serde_json::from_str(block) {
        Ok(v) => v,
        Err(e) => {
            let mut diag = ProtocolDiagnostic::for_block(block, e.to_string());
            diag.line = Some(e.line());
            diag.column = Some(e.column());
            return ParsedResponse::Malformed(diag);
        }
    };

    match structure(value) {
        Ok(call) => ParsedResponse::Call(call),
        Err(problem) => ParsedResponse::Malformed(ProtocolDiagnostic::for_block(block, problem)),
    }
}

fn structure(value: Value) -> Result<ToolCall, String> {
    let Value::Object(mut root) = value else {
        return Err("root must be an object".into());
    };
    let name = match root.remove("tool") {
        Some(Value::String(name)) if !name.trim().is_empty() => name,
        Some(Value::String(_)) => return Err("\"tool\" must not be empty".into()),
        Some(_) => return Err("\"tool\" must be a string".into()),
        None => return Err("missing \"tool\" key at the top level".into()),
    };
    let arguments = match root.remove("arguments") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(args @ Value::Object(_)) => args,
        Some(_) => return Err("\"arguments\" must be an object".into()),
    };
    Ok(ToolCall {
        id: None,
        name,
        arguments,
    })
}

/// Tool section appended to a phase's instructions.
pub fn describe_tools(schemas: &[ToolSchema]) -> String {
    if schemas.is_empty() {
        return String::new();
    }
    let mut out = String::from(
        "## Tools\n\
         To use a tool, reply with one JSON block and nothing else:\n\
         ```json\n{\"tool\": \"<name>\", \"arguments\": {...}}\n```\n\
         One tool call per reply. When the task is complete, reply with your final answer and no tool call.\n\n\
         Available tools:\n",
    );
    for schema in schemas {
        let _ = writeln!(out, "- {}: {}", schema.name, schema.description);
        let _ = writeln!(out, "  arguments schema: {}", schema.parameters);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn malformed(content: &str) -> ProtocolDiagnostic {
        match parse_tool_call(content) {
            ParsedResponse::Malformed(diag) => diag,
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_text_is_not_a_call() {
        assert_eq!(parse_tool_call("Here is the final essay."), ParsedResponse::Text);
        assert_eq!(
            parse_tool_call(r#"A JSON answer: {"score": 3}"#),
            ParsedResponse::Text
        );
    }

    #[test]
    fn test_bare_object_call() {
        let parsed = parse_tool_call(
            r#"I'll search. {"tool": "search", "arguments": {"query": "rust"}} Thanks."#,
        );
        assert_eq!(
            parsed,
            ParsedResponse::Call(ToolCall::new("search", json!({"query": "rust"})))
        );
    }

    #[test]
    fn test_fenced_block_preferred() {
        let content = "Plan {draft}\n```json\n{\"tool\": \"chart\", \"arguments\": {\"kind\": \"bar\"}}\n```\n";
        assert_eq!(
            parse_tool_call(content),
            ParsedResponse::Call(ToolCall::new("chart", json!({"kind": "bar"})))
        );
    }

    #[test]
    fn test_missing_arguments_defaults_to_empty_object() {
        assert_eq!(
            parse_tool_call(r#"{"tool": "now"}"#),
            ParsedResponse::Call(ToolCall::new("now", json!({})))
        );
    }

    #[test]
    fn test_two_extra_closing_braces() {
        let diag = malformed(r#"{"tool": "search", "arguments": {"query": "x"}}}}"#);
        assert_eq!(diag.brace_balance, -2);
        assert!(diag.line.is_some());
        let rendered = diag.render();
        assert!(rendered.contains("2 extra closing braces"), "{}", rendered);
        assert!(rendered.contains("no tool was run"));
    }

    #[test]
    fn test_unclosed_brace() {
        let diag = malformed(r#"{"tool": "search", "arguments": {"query": "x"}"#);
        assert_eq!(diag.brace_summary().as_deref(), Some("1 unclosed brace"));
    }

    #[test]
    fn test_unbalanced_quotes() {
        let diag = malformed(r#"{"tool": "search, "arguments": {}}"#);
        assert!(diag.quote_count % 2 == 1);
        assert!(diag.problems.iter().any(|p| p.contains("unbalanced quotes")));
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let diag = malformed(r#"{"tool": "write", "arguments": {"text": "a } b"}, }"#);
        assert_eq!(diag.brace_balance, 0);
    }

    #[test]
    fn test_structural_checks() {
        assert_eq!(
            malformed(r#"{"tool": "x", "arguments": [1]}"#).error,
            "\"arguments\" must be an object"
        );
        assert_eq!(
            malformed(r#"{"tool": 7, "arguments": {}}"#).error,
            "\"tool\" must be a string"
        );
        assert_eq!(
            malformed(r#"{"wrapper": {"tool": "x"}}"#).error,
            "missing \"tool\" key at the top level"
        );
    }

    #[test]
    fn test_describe_tools_lists_each_schema() {
        let schemas = vec![ToolSchema {
            name: "search".into(),
            description: "Search the web".into(),
            parameters: json!({"type": "object"}),
        }];
        let text = describe_tools(&schemas);
        assert!(text.contains("- search: Search the web"));
        assert!(text.contains("\"tool\""));
        assert!(describe_tools(&[]).is_empty());
    }
}
