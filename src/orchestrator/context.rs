//! Per-request context assembly: one ordered pass over everything the model
//! needs to know before it sees the prompt.

use chrono::{Local, Utc};

use crate::context_items::ContextItems;
use crate::memory::MemoryStore;

/// Fixed rules block teaching the response contract. The envelope shape and
/// the file/patch block grammar are external contracts; models are prompted
/// with them verbatim.
pub const SYSTEM_RULES: &str = r#"You are Skippy, a personal assistant daemon with tools.

Respond with exactly one JSON object of this shape:
{ "reasoning": "<your thinking>", "actions": [ { "type": "tool_call", "tool": "<tool name>", "arguments": { ... }, "reasoning": "<why>" } ], "final_answer": "<answer for the user, empty while work remains>", "continue": <true to keep working after these actions, false when done> }

Rules:
- Emit raw JSON only. No markdown fences, no prose before or after the object.
- Set "continue": false only when you are finished and "final_answer" holds the answer.
- Tool results arrive on your next turn; react to failures instead of repeating them.

For any tool argument that would contain a multi-line code or text payload
(file writes, file patches), OMIT that argument from the JSON and put the
payload after the closing brace as a delimited block:

===SKIPPY_FILE_START:<path>===
<verbatim file content>
===SKIPPY_FILE_END===

===SKIPPY_PATCH_START:<path>===
===FIND===
<verbatim text to find>
===REPLACE===
<verbatim replacement>
===SKIPPY_PATCH_END===

A patch block may hold several FIND/REPLACE pairs. Never place multi-line
payloads inside JSON strings."#;

pub struct ContextInputs<'a> {
    pub user: &'a str,
    pub channel: Option<&'a str>,
    pub condensed_tools: &'a str,
    pub known_channels: &'a [String],
    pub categories: &'a [String],
    pub working_dir: &'a str,
}

/// Assemble the system block. Section order is part of the contract:
/// rules, clock, identity, tools, channels, memories, skills, working
/// directory, pinned files.
pub fn assemble_context(
    inputs: &ContextInputs<'_>,
    memory: &MemoryStore,
    items: &ContextItems,
) -> anyhow::Result<String> {
    let mut out = String::new();

    out.push_str(SYSTEM_RULES);
    out.push_str("\n\n");

    let now_utc = Utc::now();
    let now_local = Local::now();
    out.push_str(&format!(
        "Current time: {} UTC ({} local, {})\n",
        now_utc.format("%A %Y-%m-%d %H:%M:%S"),
        now_local.format("%H:%M:%S"),
        now_local.format("%Z")
    ));

    out.push_str(&format!("Current user: {}\n", inputs.user));
    if let Some(channel) = inputs.channel {
        out.push_str(&format!("Current channel: {}\n", channel));
    }
    out.push('\n');

    out.push_str("# Tools\n");
    out.push_str(inputs.condensed_tools.trim_end());
    out.push_str("\n\n");

    if !inputs.known_channels.is_empty() {
        out.push_str(&format!(
            "Known channels: {}\n\n",
            inputs.known_channels.join(", ")
        ));
    }

    let memories = memory.get_context_memories(inputs.categories)?;
    if !memories.is_empty() {
        out.push_str("# Memory\n");
        for (category, records) in memories {
            out.push_str(&format!("## {}\n", category));
            for (key, value) in records {
                out.push_str(&format!("{}: {}\n", key, value));
            }
        }
        out.push('\n');
    }

    let skills = memory.get_context_skills(inputs.user)?;
    if !skills.is_empty() {
        out.push_str("# Skills\n");
        for skill in skills {
            out.push_str(&format!(
                "{} [{}]: {}\n",
                skill.name, skill.owner, skill.description
            ));
            if !skill.instructions.trim().is_empty() {
                out.push_str(&format!("Instructions: {}\n", skill.instructions));
            }
        }
        out.push('\n');
    }

    out.push_str(&format!("Working directory: {}\n", inputs.working_dir));
    if let Ok(entries) = std::fs::read_dir(inputs.working_dir) {
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        if !names.is_empty() {
            out.push_str(&format!("Contents: {}\n", names.join(", ")));
        }
    }
    out.push('\n');

    let files = items.render_files();
    if !files.is_empty() {
        out.push_str("# Pinned files\n");
        out.push_str(&files);
    }

    Ok(out)
}

/// Wrap the prompt for the LLM user message. Extra context rides inside
/// `<context>` tags ahead of the prompt itself.
pub fn build_user_message(prompt: &str, extra_context: Option<&str>) -> String {
    match extra_context {
        Some(extra) if !extra.trim().is_empty() => {
            format!("<context>\n{}\n</context>\n\n{}", extra, prompt)
        }
        _ => prompt.to_string(),
    }
}

/// chars/4, the loop's observational token estimate.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64) / 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_items::ContextItemKind;
    use crate::db::Database;
    use serde_json::json;

    fn fixtures(dir: &std::path::Path) -> (MemoryStore, ContextItems) {
        let store = MemoryStore::new(Database::open_in_memory().unwrap()).unwrap();
        let items = ContextItems::load(dir.join("context.json")).unwrap();
        (store, items)
    }

    #[test]
    fn test_section_order() {
        let dir = tempfile::tempdir().unwrap();
        let (store, items) = fixtures(dir.path());
        store
            .set_global("likes", &json!("rust"), Some("general"), &[])
            .unwrap();
        store
            .create_skill("mining", "dig better", "use the drill", "global")
            .unwrap();

        let pinned = dir.path().join("pin.txt");
        std::fs::write(&pinned, "pinned content").unwrap();
        items
            .add(ContextItemKind::File, pinned.to_str().unwrap(), "alice")
            .unwrap();

        let inputs = ContextInputs {
            user: "alice",
            channel: Some("general"),
            condensed_tools: "bash(command)",
            known_channels: &["general".to_string(), "lab".to_string()],
            categories: &["general".to_string()],
            working_dir: dir.path().to_str().unwrap(),
        };
        let context = assemble_context(&inputs, &store, &items).unwrap();

        let positions: Vec<usize> = [
            "Respond with exactly one JSON object",
            "Current time:",
            "Current user: alice",
            "# Tools",
            "Known channels: general, lab",
            "# Memory",
            "likes: \"rust\"",
            "# Skills",
            "mining [global]: dig better",
            "Instructions: use the drill",
            "Working directory:",
            "# Pinned files",
            "pinned content",
        ]
        .iter()
        .map(|needle| context.find(needle).unwrap_or_else(|| panic!("missing {needle}")))
        .collect();

        for pair in positions.windows(2) {
            assert!(pair[0] < pair[1], "sections out of order");
        }
    }

    #[test]
    fn test_empty_sections_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let (store, items) = fixtures(dir.path());
        let inputs = ContextInputs {
            user: "alice",
            channel: None,
            condensed_tools: "t",
            known_channels: &[],
            categories: &["general".to_string()],
            working_dir: "/nonexistent-dir",
        };
        let context = assemble_context(&inputs, &store, &items).unwrap();
        assert!(!context.contains("# Memory"));
        assert!(!context.contains("# Skills"));
        assert!(!context.contains("Known channels:"));
        assert!(!context.contains("Current channel:"));
    }

    #[test]
    fn test_user_message_wrapping() {
        assert_eq!(build_user_message("hi", None), "hi");
        assert_eq!(
            build_user_message("hi", Some("history")),
            "<context>\nhistory\n</context>\n\nhi"
        );
        assert_eq!(build_user_message("hi", Some("  ")), "hi");
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }
}
