//! Dual-channel response parsing.
//!
//! The model emits one JSON control envelope, optionally followed by
//! out-of-band file/patch blocks that carry payloads JSON escaping would
//! mangle. The JSON side is parsed through layered strategies: direct parse,
//! wrapper stripping, candidate scanning with string-aware brace matching,
//! mechanical repair, and a field-by-field fallback. Whenever anything past
//! the direct parse succeeds, the result is flagged repaired so the loop can
//! tell the model to clean up its output.

use serde_json::{json, Map, Value};

use crate::tools::args::promote_flattened_keys;

pub const FILE_START: &str = "===SKIPPY_FILE_START:";
pub const FILE_END: &str = "===SKIPPY_FILE_END===";
pub const PATCH_START: &str = "===SKIPPY_PATCH_START:";
pub const PATCH_END: &str = "===SKIPPY_PATCH_END===";
pub const FIND_MARK: &str = "===FIND===";
pub const REPLACE_MARK: &str = "===REPLACE===";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub reasoning: String,
    pub actions: Vec<Action>,
    pub final_answer: String,
    pub continue_: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub tool: String,
    pub arguments: Value,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileBlock {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchChange {
    pub find: String,
    pub replace: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchBlock {
    pub path: String,
    pub changes: Vec<PatchChange>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutOfBand {
    pub file_blocks: Vec<FileBlock>,
    pub patch_blocks: Vec<PatchBlock>,
}

impl OutOfBand {
    pub fn is_empty(&self) -> bool {
        self.file_blocks.is_empty() && self.patch_blocks.is_empty()
    }
}

#[derive(Debug)]
pub struct ParsedResponse {
    /// None when no strategy produced an envelope-shaped object.
    pub envelope: Option<Envelope>,
    pub blocks: OutOfBand,
    /// True when anything past the direct JSON parse was needed.
    pub repaired: bool,
    /// Some JSON value was extracted, even if it wasn't envelope-shaped.
    /// Distinguishes "retry with a format reminder" from "give up".
    pub had_json: bool,
}

pub fn parse_response(raw: &str) -> ParsedResponse {
    let (json_part, block_part) = split_at_first_block(raw);
    let blocks = parse_blocks(block_part);

    let (value, repaired) = extract_json(json_part);
    let had_json = value.is_some();
    let envelope = value.and_then(normalize_envelope);

    ParsedResponse {
        envelope,
        blocks,
        repaired,
        had_json,
    }
}

/// Inject out-of-band payloads into the actions that reference them.
/// When an action carries neither a filepath nor a payload and exactly one
/// block exists, that block is assumed to be the payload.
pub fn inject_blocks(actions: &mut [Action], blocks: &OutOfBand) {
    for action in actions.iter_mut() {
        if !action.arguments.is_object() {
            action.arguments = Value::Object(Map::new());
        }
        let path = action_path(&action.arguments);

        let file_block = match &path {
            Some(p) => blocks.file_blocks.iter().find(|b| &b.path == p),
            None if blocks.file_blocks.len() == 1 => blocks.file_blocks.first(),
            None => None,
        };
        if let Some(block) = file_block {
            let args = action.arguments.as_object_mut().unwrap();
            if !args.contains_key("content") {
                args.insert("content".to_string(), json!(block.content));
            }
            if path.is_none() {
                args.entry("filepath".to_string())
                    .or_insert_with(|| json!(block.path));
            }
        }

        let patch_block = match &path {
            Some(p) => blocks.patch_blocks.iter().find(|b| &b.path == p),
            None if blocks.patch_blocks.len() == 1 => blocks.patch_blocks.first(),
            None => None,
        };
        if let Some(block) = patch_block {
            let args = action.arguments.as_object_mut().unwrap();
            if !args.contains_key("changes") {
                let changes: Vec<Value> = block
                    .changes
                    .iter()
                    .map(|c| json!({ "find": c.find, "replace": c.replace }))
                    .collect();
                args.insert("changes".to_string(), Value::Array(changes));
            }
            if path.is_none() {
                args.entry("filepath".to_string())
                    .or_insert_with(|| json!(block.path));
            }
        }
    }
}

fn action_path(arguments: &Value) -> Option<String> {
    for key in ["filepath", "path", "file"] {
        if let Some(p) = arguments.get(key).and_then(Value::as_str) {
            return Some(p.to_string());
        }
    }
    None
}

// ----------------------------------------------------------------------
// Out-of-band blocks
// ----------------------------------------------------------------------

fn split_at_first_block(raw: &str) -> (&str, &str) {
    let first = [FILE_START, PATCH_START]
        .iter()
        .filter_map(|marker| raw.find(marker))
        .min();
    match first {
        Some(idx) => (&raw[..idx], &raw[idx..]),
        None => (raw, ""),
    }
}

fn parse_blocks(raw: &str) -> OutOfBand {
    let mut blocks = OutOfBand::default();
    let mut rest = raw;

    loop {
        let file_at = rest.find(FILE_START);
        let patch_at = rest.find(PATCH_START);
        match (file_at, patch_at) {
            (Some(f), Some(p)) if f < p => rest = parse_file_block(rest, f, &mut blocks),
            (Some(_), Some(p)) => rest = parse_patch_block(rest, p, &mut blocks),
            (Some(f), None) => rest = parse_file_block(rest, f, &mut blocks),
            (None, Some(p)) => rest = parse_patch_block(rest, p, &mut blocks),
            (None, None) => break,
        }
    }
    blocks
}

/// Read the `<path>===` header tail, returning the path and the offset just
/// past the header line's newline.
fn parse_block_header(raw: &str, header_start: usize) -> Option<(String, usize)> {
    let after = &raw[header_start..];
    let line_end = after.find('\n').unwrap_or(after.len());
    let header = after[..line_end].trim_end_matches('\r');
    let path = header.trim_end_matches("===").trim().to_string();
    let body_start = header_start + line_end + 1;
    if path.is_empty() || body_start > raw.len() {
        return None;
    }
    Some((path, body_start))
}

fn parse_file_block<'a>(raw: &'a str, start: usize, blocks: &mut OutOfBand) -> &'a str {
    let header_start = start + FILE_START.len();
    let Some((path, body_start)) = parse_block_header(raw, header_start) else {
        return "";
    };
    let body = &raw[body_start..];
    let Some(end) = body.find(FILE_END) else {
        return "";
    };
    // Verbatim: everything between the header newline and the end marker,
    // trailing newline included.
    blocks.file_blocks.push(FileBlock {
        path,
        content: body[..end].to_string(),
    });
    &body[end + FILE_END.len()..]
}

fn parse_patch_block<'a>(raw: &'a str, start: usize, blocks: &mut OutOfBand) -> &'a str {
    let header_start = start + PATCH_START.len();
    let Some((path, body_start)) = parse_block_header(raw, header_start) else {
        return "";
    };
    let body = &raw[body_start..];
    let Some(end) = body.find(PATCH_END) else {
        return "";
    };
    let inner = &body[..end];

    let mut changes = Vec::new();
    let mut cursor = inner;
    while let Some(find_at) = cursor.find(FIND_MARK) {
        let after_find = &cursor[find_at + FIND_MARK.len()..];
        let after_find = after_find.strip_prefix('\n').unwrap_or(after_find);
        let Some(replace_at) = after_find.find(REPLACE_MARK) else {
            break;
        };
        let find_text = trim_one_newline(&after_find[..replace_at]);
        let after_replace = &after_find[replace_at + REPLACE_MARK.len()..];
        let after_replace = after_replace.strip_prefix('\n').unwrap_or(after_replace);
        let replace_end = after_replace.find(FIND_MARK).unwrap_or(after_replace.len());
        let replace_text = trim_one_newline(&after_replace[..replace_end]);
        changes.push(PatchChange {
            find: find_text.to_string(),
            replace: replace_text.to_string(),
        });
        cursor = &after_replace[replace_end..];
    }

    if !changes.is_empty() {
        blocks.patch_blocks.push(PatchBlock { path, changes });
    }
    &body[end + PATCH_END.len()..]
}

/// Markers sit on their own lines, so the text before one carries a
/// structural trailing newline that is not part of the payload.
fn trim_one_newline(text: &str) -> &str {
    text.strip_suffix('\n').unwrap_or(text)
}

// ----------------------------------------------------------------------
// JSON extraction ladder
// ----------------------------------------------------------------------

fn extract_json(raw: &str) -> (Option<Value>, bool) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (None, false);
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return (Some(value), false);
    }

    let stripped = strip_wrappers(trimmed);
    if stripped != trimmed {
        if let Ok(value) = serde_json::from_str::<Value>(stripped) {
            return (Some(value), true);
        }
    }

    if let Some(value) = scan_candidates(stripped) {
        return (Some(value), true);
    }

    if let Some(value) = repair_candidate(stripped) {
        return (Some(value), true);
    }

    if let Some(value) = field_fallback(stripped) {
        return (Some(value), true);
    }

    (None, false)
}

/// Strip markdown code fences and a single XML-style wrapper element.
fn strip_wrappers(text: &str) -> &str {
    let mut out = text.trim();

    if out.starts_with("```") {
        let after = &out[3..];
        let after = match after.find('\n') {
            Some(nl) => &after[nl + 1..],
            None => after,
        };
        out = match after.rfind("```") {
            Some(end) => &after[..end],
            None => after,
        };
        out = out.trim();
    }

    if out.starts_with('<') {
        if let Some(tag_end) = out.find('>') {
            let tag = &out[1..tag_end];
            if !tag.is_empty() && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                let close = format!("</{}>", tag);
                if let Some(close_at) = out.rfind(&close) {
                    out = out[tag_end + 1..close_at].trim();
                }
            }
        }
    }

    out
}

/// Try every `{` / `[` start position, extracting a balanced slice with a
/// string-aware matcher and parsing it.
fn scan_candidates(text: &str) -> Option<Value> {
    for (idx, ch) in text.char_indices() {
        if ch != '{' && ch != '[' {
            continue;
        }
        if let Some(slice) = balanced_slice(text, idx) {
            if let Ok(value) = serde_json::from_str::<Value>(slice) {
                if value.is_object() || value.is_array() {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Walk from `start` tracking strings, escapes, and a bracket stack; return
/// the slice up to the matching close bracket.
fn balanced_slice(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' | b'[' if !in_string => stack.push(b),
            b'}' if !in_string => {
                if stack.pop() != Some(b'{') {
                    return None;
                }
                if stack.is_empty() {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            b']' if !in_string => {
                if stack.pop() != Some(b'[') {
                    return None;
                }
                if stack.is_empty() {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Mechanical repair: drop trailing commas, quote bare keys, close whatever
/// is still open at the end.
fn repair_candidate(text: &str) -> Option<Value> {
    let start = text.find(['{', '['])?;
    let candidate = &text[start..];

    let repaired = close_unmatched(&quote_bare_keys(&drop_trailing_commas(candidate)));
    serde_json::from_str::<Value>(&repaired).ok()
}

fn drop_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = text.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' if in_string => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            ',' if !in_string => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next, Some('}') | Some(']')) {
                    continue;
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn quote_bare_keys(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut in_string = false;
    let mut escaped = false;
    let mut expect_key = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if escaped {
            escaped = false;
            out.push(c);
            i += 1;
            continue;
        }
        match c {
            '\\' if in_string => {
                escaped = true;
                out.push(c);
                i += 1;
            }
            '"' => {
                in_string = !in_string;
                expect_key = false;
                out.push(c);
                i += 1;
            }
            '{' if !in_string => {
                expect_key = true;
                out.push(c);
                i += 1;
            }
            ',' if !in_string => {
                expect_key = true;
                out.push(c);
                i += 1;
            }
            c if !in_string && expect_key && (c.is_ascii_alphabetic() || c == '_') => {
                let mut key = String::new();
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    key.push(chars[i]);
                    i += 1;
                }
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if chars.get(j) == Some(&':') {
                    out.push('"');
                    out.push_str(&key);
                    out.push('"');
                    expect_key = false;
                } else {
                    out.push_str(&key);
                }
            }
            c => {
                if !c.is_whitespace() && !in_string {
                    expect_key = false;
                }
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn close_unmatched(text: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = text.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    // Close from the innermost scope out; a dangling comma before a closer
    // would re-break the parse.
    let out = drop_trailing_commas(&out);
    let mut out = out;
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Last resort: pull individual envelope fields out of the wreckage.
/// Actions cannot be reliably recovered here.
fn field_fallback(text: &str) -> Option<Value> {
    let reasoning = extract_string_field(text, "reasoning");
    let final_answer = extract_string_field(text, "final_answer");
    let continue_ = extract_bool_field(text, "continue");

    if reasoning.is_none() && final_answer.is_none() && continue_.is_none() {
        return None;
    }
    Some(json!({
        "reasoning": reasoning.unwrap_or_default(),
        "actions": [],
        "final_answer": final_answer.unwrap_or_default(),
        "continue": continue_.unwrap_or(false),
    }))
}

fn extract_string_field(text: &str, field: &str) -> Option<String> {
    let marker = format!("\"{}\"", field);
    let at = text.find(&marker)?;
    let rest = &text[at + marker.len()..];
    let colon = rest.find(':')?;
    let rest = rest[colon + 1..].trim_start();
    let mut chars = rest.chars();
    if chars.next() != Some('"') {
        return None;
    }

    let mut out = String::new();
    let mut escaped = false;
    for c in chars {
        if escaped {
            match c {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                other => out.push(other),
            }
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => return Some(out),
            other => out.push(other),
        }
    }
    // Unterminated string: keep what we got.
    Some(out)
}

fn extract_bool_field(text: &str, field: &str) -> Option<bool> {
    let marker = format!("\"{}\"", field);
    let at = text.find(&marker)?;
    let rest = &text[at + marker.len()..];
    let colon = rest.find(':')?;
    let rest = rest[colon + 1..].trim_start();
    if rest.starts_with("true") {
        Some(true)
    } else if rest.starts_with("false") {
        Some(false)
    } else {
        None
    }
}

// ----------------------------------------------------------------------
// Envelope normalization
// ----------------------------------------------------------------------

fn normalize_envelope(value: Value) -> Option<Envelope> {
    let object = match value {
        // A bare action array is an envelope with implied continue.
        Value::Array(items) => json!({ "actions": items, "continue": true }),
        Value::Object(map) => {
            let has_envelope_field = map.contains_key("actions")
                || map.contains_key("final_answer")
                || map.contains_key("continue");
            if !has_envelope_field {
                if map.contains_key("tool") {
                    // A single flat action.
                    json!({ "actions": [Value::Object(map)], "continue": true })
                } else {
                    return None;
                }
            } else {
                Value::Object(map)
            }
        }
        _ => return None,
    };

    let reasoning = object["reasoning"].as_str().unwrap_or("").to_string();
    let final_answer = object["final_answer"].as_str().unwrap_or("").to_string();
    let mut continue_ = parse_bool(&object["continue"]);

    let mut actions = Vec::new();
    if let Some(raw_actions) = object["actions"].as_array() {
        for raw in raw_actions {
            let mut action = raw.clone();
            if action.as_str().is_some() {
                // A bare string is an action naming a tool with no args.
                action = json!({ "tool": action });
            }
            if !action.is_object() {
                continue;
            }
            if action.get("type").is_none() {
                action["type"] = json!("tool_call");
            }
            if action["type"].as_str() != Some("tool_call") {
                continue;
            }
            promote_flattened_keys(&mut action);
            let Some(tool) = action["tool"].as_str() else {
                continue;
            };
            actions.push(Action {
                tool: tool.to_string(),
                arguments: action
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new())),
                reasoning: action["reasoning"].as_str().unwrap_or("").to_string(),
            });
        }
    }

    // Actions with no answer and no continue would dead-end the loop.
    if !actions.is_empty() && !continue_ && final_answer.is_empty() {
        continue_ = true;
    }

    Some(Envelope {
        reasoning,
        actions,
        final_answer,
        continue_,
    })
}

fn parse_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}
