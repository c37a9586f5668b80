//! Recovery of malformed tool-call arguments.
//!
//! A streamed call moves through a small state machine:
//!
//! ```text
//! Received ──valid object──────────────▶ Parsed
//!    │
//!    ├──unknown tool──▶ Dropped
//!    │
//!    └──invalid input──▶ Repairing ──ok──▶ Repaired
//!                            │
//!                            └──failed──▶ Placeholder (display/edit)
//!                                     └─▶ Dropped    (other tools)
//! ```
//!
//! Repairing runs [`NORMALIZATION_PASSES`] in order, then [`repair_json`].

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::tools::{placeholder_input, DiagramTool};

/// Error classes a streamed tool call can hit before it is usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolCallError {
    #[error("Model tried to call unavailable tool '{0}'")]
    NoSuchTool(String),
    #[error("Invalid input for tool {tool}: {message}")]
    InvalidToolInput { tool: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    /// The input was already a non-empty JSON object and is returned as is.
    Parsed(Value),
    Repaired(Value),
    /// Repair failed; the value carries an `_error` marker.
    Placeholder(Value),
    Dropped(ToolCallError),
}

impl RepairOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Parsed(_) => "parsed",
            Self::Repaired(_) => "repaired",
            Self::Placeholder(_) => "placeholder",
            Self::Dropped(_) => "dropped",
        }
    }
}

/// One textual rewrite applied before structural repair.
#[derive(Debug, Clone, Copy)]
pub struct NormalizationPass {
    pub name: &'static str,
    pub apply: fn(&str) -> String,
}

pub const NORMALIZATION_PASSES: [NormalizationPass; 2] = [
    NormalizationPass {
        name: "colon-equals",
        apply: replace_colon_equals,
    },
    NormalizationPass {
        name: "equals-quote",
        apply: replace_equals_quote,
    },
];

/// `"key":= value` becomes `"key": value`.
pub fn replace_colon_equals(text: &str) -> String {
    text.replace(":=", ": ")
}

/// `"key"= "value"` becomes `"key": "value"`.
pub fn replace_equals_quote(text: &str) -> String {
    equals_quote_regex().replace_all(text, ": \"").into_owned()
}

fn equals_quote_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| Regex::new(r#"=\s*""#).expect("equals-quote regex must compile"))
}

/// Turns raw streamed argument text for `tool_name` into a usable input.
#[must_use]
pub fn recover_tool_input(tool_name: &str, raw: &str) -> RepairOutcome {
    if DiagramTool::from_name(tool_name).is_none() {
        return RepairOutcome::Dropped(ToolCallError::NoSuchTool(tool_name.to_string()));
    }

    let reason = match parse_object(raw) {
        Ok(value) => return RepairOutcome::Parsed(value),
        Err(reason) => reason,
    };
    tracing::debug!(tool = tool_name, %reason, "tool input needs repair");

    let normalized = NORMALIZATION_PASSES
        .iter()
        .fold(raw.to_string(), |text, pass| (pass.apply)(&text));

    let repaired = repair_json(&normalized)
        .map_err(|error| error.to_string())
        .and_then(|text| parse_object(&text));
    match repaired {
        Ok(value) => {
            tracing::info!(tool = tool_name, "repaired malformed tool input");
            RepairOutcome::Repaired(value)
        }
        Err(error) => {
            tracing::warn!(tool = tool_name, %error, "tool input repair failed");
            match placeholder_input(tool_name, repair_failure_message(tool_name)) {
                Some(placeholder) => RepairOutcome::Placeholder(placeholder),
                None => RepairOutcome::Dropped(ToolCallError::InvalidToolInput {
                    tool: tool_name.to_string(),
                    message: reason,
                }),
            }
        }
    }
}

fn repair_failure_message(tool_name: &str) -> &'static str {
    match DiagramTool::from_name(tool_name) {
        Some(DiagramTool::Edit) => "JSON repair failed - no operations to apply",
        _ => "JSON repair failed - empty diagram",
    }
}

/// Parses `text` and requires a non-empty JSON object.
fn parse_object(text: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) if !object.is_empty() => Ok(Value::Object(object)),
        Ok(Value::Object(_)) => Err("input is an empty object".to_string()),
        Ok(other) => Err(format!("input is not an object: {}", kind_of(&other))),
        Err(error) => Err(error.to_string()),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepairError {
    #[error("no JSON object or array found")]
    NoJsonValue,
    #[error("repaired text is still not valid JSON: {0}")]
    StillInvalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Object,
    Array,
}

impl Container {
    fn closer(self) -> char {
        match self {
            Self::Object => '}',
            Self::Array => ']',
        }
    }
}

/// Open container plus, for objects, where the current member stands.
#[derive(Debug, Clone, Copy)]
struct Frame {
    kind: Container,
    key_start: Option<usize>,
    colon_seen: bool,
    value_started: bool,
}

impl Frame {
    fn new(kind: Container) -> Self {
        Self {
            kind,
            key_start: None,
            colon_seen: false,
            value_started: false,
        }
    }

    fn reset_member(&mut self) {
        self.key_start = None;
        self.colon_seen = false;
        self.value_started = false;
    }
}

/// Structural repair for truncated or sloppy JSON.
///
/// Strips code fences and leading prose, escapes raw control characters in
/// strings, closes an unterminated string, completes or drops a truncated
/// literal, drops a dangling key, removes trailing commas, and balances
/// brackets. Text after the root value closes is ignored.
pub fn repair_json(input: &str) -> Result<String, RepairError> {
    let text = strip_code_fence(input.trim());
    let start = text.find(['{', '[']).ok_or(RepairError::NoJsonValue)?;

    let mut out = String::with_capacity(text.len() + 8);
    let mut stack: Vec<Frame> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in text[start..].chars() {
        if in_string {
            if escaped {
                out.push(ch);
                escaped = false;
                continue;
            }
            match ch {
                '\\' => {
                    out.push(ch);
                    escaped = true;
                }
                '"' => {
                    out.push(ch);
                    in_string = false;
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                control if u32::from(control) < 0x20 => {
                    out.push_str(&format!("\\u{:04x}", u32::from(control)));
                }
                other => out.push(other),
            }
            continue;
        }

        match ch {
            '"' => {
                note_string_start(&mut stack, out.len());
                out.push('"');
                in_string = true;
            }
            '{' | '[' => {
                note_value_start(&mut stack);
                out.push(ch);
                stack.push(Frame::new(if ch == '{' {
                    Container::Object
                } else {
                    Container::Array
                }));
            }
            '}' | ']' => {
                let kind = if ch == '}' {
                    Container::Object
                } else {
                    Container::Array
                };
                if !stack.iter().any(|frame| frame.kind == kind) {
                    continue;
                }
                while let Some(frame) = stack.pop() {
                    close_frame(&mut out, &frame);
                    if frame.kind == kind {
                        break;
                    }
                }
                if stack.is_empty() {
                    break;
                }
            }
            ':' => {
                if let Some(frame) = stack.last_mut() {
                    frame.colon_seen = true;
                }
                out.push(':');
            }
            ',' => {
                if let Some(frame) = stack.last_mut() {
                    frame.reset_member();
                }
                out.push(',');
            }
            space if space.is_whitespace() => out.push(space),
            other => {
                note_value_start(&mut stack);
                out.push(other);
            }
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        strip_partial_unicode_escape(&mut out);
        out.push('"');
    } else if complete_trailing_literal(&mut out) {
        if let Some(frame) = stack.last_mut() {
            frame.value_started = false;
        }
    }

    while let Some(frame) = stack.pop() {
        close_frame(&mut out, &frame);
    }

    serde_json::from_str::<Value>(&out)
        .map_err(|error| RepairError::StillInvalid(error.to_string()))?;
    Ok(out)
}

fn note_string_start(stack: &mut [Frame], position: usize) {
    let Some(frame) = stack.last_mut() else {
        return;
    };
    if frame.kind != Container::Object {
        return;
    }
    if frame.key_start.is_none() {
        frame.key_start = Some(position);
    } else if frame.colon_seen {
        frame.value_started = true;
    }
}

fn note_value_start(stack: &mut [Frame]) {
    if let Some(frame) = stack.last_mut() {
        if frame.kind == Container::Object && frame.colon_seen {
            frame.value_started = true;
        }
    }
}

/// Drops a dangling key and trailing comma, then appends the closer.
fn close_frame(out: &mut String, frame: &Frame) {
    if frame.kind == Container::Object && !frame.value_started {
        if let Some(key_start) = frame.key_start {
            out.truncate(key_start);
        }
    }
    trim_trailing_separators(out);
    out.push(frame.kind.closer());
}

fn trim_trailing_separators(out: &mut String) {
    loop {
        let trimmed_len = out.trim_end().len();
        out.truncate(trimmed_len);
        if out.ends_with(',') {
            out.pop();
        } else {
            break;
        }
    }
}

/// Completes `tru`/`fals`/`nul` and trims a half-written number. Returns true
/// when the trailing value disappeared entirely.
fn complete_trailing_literal(out: &mut String) -> bool {
    let token_start = out
        .char_indices()
        .rev()
        .take_while(|(_, ch)| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '+'))
        .last()
        .map_or(out.len(), |(index, _)| index);
    let token = out[token_start..].to_string();
    if token.is_empty() {
        return false;
    }

    if let Some(literal) = ["true", "false", "null"]
        .into_iter()
        .find(|literal| literal.starts_with(token.as_str()))
    {
        out.truncate(token_start);
        out.push_str(literal);
        return false;
    }

    let kept = token
        .trim_end_matches(['.', '-', '+', 'e', 'E'])
        .len();
    out.truncate(token_start + kept);
    kept == 0
}

/// Removes an unfinished `\uXXXX` escape at the end of a cut-off string.
fn strip_partial_unicode_escape(out: &mut String) {
    let bytes = out.as_bytes();
    let hex_len = bytes
        .iter()
        .rev()
        .take_while(|byte| byte.is_ascii_hexdigit())
        .count()
        .min(4);
    let marker = bytes.len().checked_sub(hex_len + 2);
    if let Some(marker) = marker {
        if hex_len < 4 && &bytes[marker..marker + 2] == b"\\u" {
            out.truncate(marker);
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}
