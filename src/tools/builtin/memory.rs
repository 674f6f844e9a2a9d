//! Memory tool: global, channel and skill scopes plus cross-scope search,
//! backed by the SQLite memory store.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::memory::{MemoryRecord, MemoryStore, GLOBAL_OWNER};
use crate::tools::{tool_err, tool_ok, Tool};

pub struct MemoryTool {
    store: MemoryStore,
}

impl MemoryTool {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }
}

fn record_json(record: &MemoryRecord) -> Value {
    json!({
        "key": record.key,
        "value": record.value,
        "category": record.category,
        "tags": record.tags,
        "updated_at": record.updated_at,
    })
}

fn require_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, Value> {
    args[field]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| tool_err(format!("Missing required '{field}'")))
}

fn opt_tags(args: &Value) -> Vec<String> {
    match &args["tags"] {
        Value::Array(items) => items
            .iter()
            .filter_map(|t| t.as_str())
            .map(String::from)
            .collect(),
        Value::String(s) => s
            .split(|c| c == ',' || c == ' ')
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl Tool for MemoryTool {
    fn name(&self) -> &str {
        "memory"
    }

    fn capability(&self) -> String {
        "memory(op, ...) -> {success, ...}. Operations:\n\
         set(key, value, category?, tags?) / get(key) / delete(key) / list(category?)\n\
         channel_set(channel, key, value, category?, tags?) / channel_get(channel, key)\n\
         channel_delete(channel, key) / channel_list(channel) / purge_channel(channel)\n\
         skill_create(name, description, instructions?, owner?)\n\
         skill_get(name, user?) / skill_update(name, ...fields or {skill_data}) \n\
         skill_delete(name) / skill_list(user?)\n\
         search(query)\n\
         Values are arbitrary JSON. Skill updates deep-merge: nested objects \
         merge, arrays replace, null deletes a field, {\"skill_data\": null} \
         clears all data. Tags are short strings without commas."
            .to_string()
    }

    fn positional_keys(&self) -> &[&str] {
        &["op", "key", "value"]
    }

    async fn run(&self, args: Value) -> anyhow::Result<Value> {
        let Some(op) = args["op"].as_str() else {
            return Ok(tool_err("Missing required 'op'"));
        };
        let op = op.to_string();
        let store = self.store.clone();

        let result = store
            .run(move |s| Ok(dispatch(s, &op, &args)))
            .await?;
        Ok(result)
    }
}

fn dispatch(store: &MemoryStore, op: &str, args: &Value) -> Value {
    match op {
        "set" => {
            let key = match require_str(args, "key") {
                Ok(k) => k,
                Err(e) => return e,
            };
            if args.get("value").is_none() {
                return tool_err("Missing required 'value'");
            }
            let category = args["category"].as_str();
            match store.set_global(key, &args["value"], category, &opt_tags(args)) {
                Ok(()) => tool_ok(json!({ "key": key })),
                Err(e) => tool_err(e.to_string()),
            }
        }
        "get" => {
            let key = match require_str(args, "key") {
                Ok(k) => k,
                Err(e) => return e,
            };
            match store.get_global(key) {
                Ok(Some(record)) => tool_ok(record_json(&record)),
                Ok(None) => tool_err(format!("No memory with key '{key}'")),
                Err(e) => tool_err(e.to_string()),
            }
        }
        "delete" => {
            let key = match require_str(args, "key") {
                Ok(k) => k,
                Err(e) => return e,
            };
            match store.delete_global(key) {
                Ok(true) => tool_ok(json!({ "deleted": key })),
                Ok(false) => tool_err(format!("No memory with key '{key}'")),
                Err(e) => tool_err(e.to_string()),
            }
        }
        "list" => match store.list_global(args["category"].as_str()) {
            Ok(records) => tool_ok(json!({
                "memories": records.iter().map(record_json).collect::<Vec<_>>()
            })),
            Err(e) => tool_err(e.to_string()),
        },
        "channel_set" => {
            let (channel, key) = match (require_str(args, "channel"), require_str(args, "key")) {
                (Ok(c), Ok(k)) => (c, k),
                (Err(e), _) | (_, Err(e)) => return e,
            };
            if args.get("value").is_none() {
                return tool_err("Missing required 'value'");
            }
            match store.set_channel(channel, key, &args["value"], args["category"].as_str(), &opt_tags(args))
            {
                Ok(()) => tool_ok(json!({ "channel": channel, "key": key })),
                Err(e) => tool_err(e.to_string()),
            }
        }
        "channel_get" => {
            let (channel, key) = match (require_str(args, "channel"), require_str(args, "key")) {
                (Ok(c), Ok(k)) => (c, k),
                (Err(e), _) | (_, Err(e)) => return e,
            };
            match store.get_channel(channel, key) {
                Ok(Some(record)) => tool_ok(record_json(&record)),
                Ok(None) => tool_err(format!("No memory '{key}' in channel '{channel}'")),
                Err(e) => tool_err(e.to_string()),
            }
        }
        "channel_delete" => {
            let (channel, key) = match (require_str(args, "channel"), require_str(args, "key")) {
                (Ok(c), Ok(k)) => (c, k),
                (Err(e), _) | (_, Err(e)) => return e,
            };
            match store.delete_channel_key(channel, key) {
                Ok(true) => tool_ok(json!({ "deleted": key })),
                Ok(false) => tool_err(format!("No memory '{key}' in channel '{channel}'")),
                Err(e) => tool_err(e.to_string()),
            }
        }
        "channel_list" => {
            let channel = match require_str(args, "channel") {
                Ok(c) => c,
                Err(e) => return e,
            };
            match store.list_channel(channel) {
                Ok(records) => tool_ok(json!({
                    "channel": channel,
                    "memories": records.iter().map(record_json).collect::<Vec<_>>()
                })),
                Err(e) => tool_err(e.to_string()),
            }
        }
        "purge_channel" => {
            let channel = match require_str(args, "channel") {
                Ok(c) => c,
                Err(e) => return e,
            };
            match store.purge_channel(channel) {
                Ok(n) => tool_ok(json!({ "purged": n })),
                Err(e) => tool_err(e.to_string()),
            }
        }
        "skill_create" => {
            let (name, description) =
                match (require_str(args, "name"), require_str(args, "description")) {
                    (Ok(n), Ok(d)) => (n, d),
                    (Err(e), _) | (_, Err(e)) => return e,
                };
            let instructions = args["instructions"].as_str().unwrap_or("");
            let owner = args["owner"].as_str().unwrap_or(GLOBAL_OWNER);
            match store.create_skill(name, description, instructions, owner) {
                Ok(()) => tool_ok(json!({ "name": name })),
                Err(e) => tool_err(e.to_string()),
            }
        }
        "skill_get" => {
            let name = match require_str(args, "name") {
                Ok(n) => n,
                Err(e) => return e,
            };
            let user = args["user"].as_str().unwrap_or(GLOBAL_OWNER);
            match store.get_skill(name, user) {
                Ok(Some(skill)) => tool_ok(json!({
                    "name": skill.name,
                    "description": skill.description,
                    "instructions": skill.instructions,
                    "owner": skill.owner,
                    "skill_data": skill.skill_data,
                    "training_progress": skill.training_progress,
                })),
                Ok(None) => tool_err(format!("No visible skill '{name}'")),
                Err(e) => tool_err(e.to_string()),
            }
        }
        "skill_update" => {
            let name = match require_str(args, "name") {
                Ok(n) => n,
                Err(e) => return e,
            };
            // Everything except the op/name routing keys is the patch.
            let mut patch = args.clone();
            if let Some(map) = patch.as_object_mut() {
                map.remove("op");
                map.remove("name");
                map.remove("user");
            }
            match store.update_skill(name, &patch) {
                Ok(()) => tool_ok(json!({ "name": name })),
                Err(e) => tool_err(e.to_string()),
            }
        }
        "skill_delete" => {
            let name = match require_str(args, "name") {
                Ok(n) => n,
                Err(e) => return e,
            };
            match store.delete_skill(name) {
                Ok(true) => tool_ok(json!({ "deleted": name })),
                Ok(false) => tool_err(format!("No skill '{name}'")),
                Err(e) => tool_err(e.to_string()),
            }
        }
        "skill_list" => {
            let user = args["user"].as_str().unwrap_or(GLOBAL_OWNER);
            match store.list_skills(user) {
                Ok(skills) => tool_ok(json!({
                    "skills": skills
                        .iter()
                        .map(|s| json!({
                            "name": s.name,
                            "description": s.description,
                            "owner": s.owner,
                        }))
                        .collect::<Vec<_>>()
                })),
                Err(e) => tool_err(e.to_string()),
            }
        }
        "search" => {
            let query = match require_str(args, "query") {
                Ok(q) => q,
                Err(e) => return e,
            };
            match store.search(query) {
                Ok(hits) => tool_ok(json!({
                    "hits": hits
                        .iter()
                        .map(|h| json!({
                            "scope": h.scope,
                            "key": h.key,
                            "value": h.value,
                            "category": h.category,
                        }))
                        .collect::<Vec<_>>()
                })),
                Err(e) => tool_err(e.to_string()),
            }
        }
        other => tool_err(format!("Unknown memory op '{other}'")),
    }
}
