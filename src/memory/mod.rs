//! SQLite-backed memory: global and per-channel key/value records plus skills.
//!
//! Channel scopes live in one compound-key table keyed by an irreversibly
//! sanitized channel name. Skill updates deep-merge (see [`merge`]).

pub mod merge;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::db::Database;

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecord {
    pub key: String,
    pub value: Value,
    pub category: String,
    pub tags: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct SkillRecord {
    pub name: String,
    pub description: String,
    pub instructions: String,
    pub owner: String,
    pub skill_data: Value,
    pub training_progress: Value,
    pub created_at: String,
    pub updated_at: String,
}

/// Lightweight row for context injection; `skill_data` stays on demand.
#[derive(Debug, Clone)]
pub struct SkillContextRow {
    pub name: String,
    pub description: String,
    pub instructions: String,
    pub owner: String,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub scope: String,
    pub key: String,
    pub value: Value,
    pub category: String,
}

/// Sentinel owner making a skill visible to every user.
pub const GLOBAL_OWNER: &str = "global";

/// Irreversibly sanitize a channel name into a scope identifier:
/// lowercased, every non-alphanumeric rune mapped to `_`.
pub fn sanitize_channel(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn join_tags(tags: &[String]) -> String {
    tags.join(",")
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

type RawMemoryRow = (String, String, String, String, String, String);

#[derive(Clone)]
pub struct MemoryStore {
    db: Database,
}

impl MemoryStore {
    pub fn new(db: Database) -> anyhow::Result<Self> {
        let store = Self { db };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> anyhow::Result<()> {
        let conn = self.db.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS global_memories (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'general',
                tags TEXT NOT NULL DEFAULT '',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS channel_memories (
                channel TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'general',
                tags TEXT NOT NULL DEFAULT '',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (channel, key)
            );
            CREATE INDEX IF NOT EXISTS idx_channel_memories_channel
                ON channel_memories (channel);

            CREATE TABLE IF NOT EXISTS skills (
                name TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                instructions TEXT NOT NULL DEFAULT '',
                owner TEXT NOT NULL DEFAULT 'global',
                skill_data TEXT NOT NULL DEFAULT '{}',
                training_progress TEXT NOT NULL DEFAULT '{}',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );",
        )?;
        Ok(())
    }

    /// Run a store closure on the blocking pool.
    pub async fn run<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&MemoryStore) -> anyhow::Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    // ------------------------------------------------------------------
    // Global scope
    // ------------------------------------------------------------------

    pub fn set_global(
        &self,
        key: &str,
        value: &Value,
        category: Option<&str>,
        tags: &[String],
    ) -> anyhow::Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO global_memories (key, value, category, tags)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                 value = ?2, category = ?3, tags = ?4,
                 updated_at = CURRENT_TIMESTAMP",
            params![
                key,
                serde_json::to_string(value)?,
                category.unwrap_or("general"),
                join_tags(tags)
            ],
        )?;
        Ok(())
    }

    pub fn get_global(&self, key: &str) -> anyhow::Result<Option<MemoryRecord>> {
        let conn = self.db.lock();
        Self::get_memory_row(
            &conn,
            "SELECT key, value, category, tags, created_at, updated_at
             FROM global_memories WHERE key = ?1",
            key,
        )
    }

    pub fn delete_global(&self, key: &str) -> anyhow::Result<bool> {
        let conn = self.db.lock();
        let n = conn.execute("DELETE FROM global_memories WHERE key = ?1", [key])?;
        Ok(n > 0)
    }

    pub fn list_global(&self, category: Option<&str>) -> anyhow::Result<Vec<MemoryRecord>> {
        let conn = self.db.lock();
        match category {
            Some(cat) => Self::collect_memories(
                &conn,
                "SELECT key, value, category, tags, created_at, updated_at
                 FROM global_memories WHERE category = ?1 ORDER BY key",
                params![cat],
            ),
            None => Self::collect_memories(
                &conn,
                "SELECT key, value, category, tags, created_at, updated_at
                 FROM global_memories ORDER BY category, key",
                params![],
            ),
        }
    }

    /// Bulk import, used to restore an export produced by [`list_global`].
    pub fn set_all_global(&self, records: &[MemoryRecord]) -> anyhow::Result<()> {
        for record in records {
            self.set_global(
                &record.key,
                &record.value,
                Some(&record.category),
                &record.tags,
            )?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Channel scope
    // ------------------------------------------------------------------

    pub fn set_channel(
        &self,
        channel: &str,
        key: &str,
        value: &Value,
        category: Option<&str>,
        tags: &[String],
    ) -> anyhow::Result<()> {
        let scope = sanitize_channel(channel);
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO channel_memories (channel, key, value, category, tags)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(channel, key) DO UPDATE SET
                 value = ?3, category = ?4, tags = ?5,
                 updated_at = CURRENT_TIMESTAMP",
            params![
                scope,
                key,
                serde_json::to_string(value)?,
                category.unwrap_or("general"),
                join_tags(tags)
            ],
        )?;
        Ok(())
    }

    pub fn get_channel(&self, channel: &str, key: &str) -> anyhow::Result<Option<MemoryRecord>> {
        let scope = sanitize_channel(channel);
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT key, value, category, tags, created_at, updated_at
             FROM channel_memories WHERE channel = ?1 AND key = ?2",
        )?;
        let record = stmt
            .query_row(params![scope, key], Self::map_memory_row)
            .optional()?;
        record.map(Self::decode_memory).transpose()
    }

    pub fn delete_channel_key(&self, channel: &str, key: &str) -> anyhow::Result<bool> {
        let scope = sanitize_channel(channel);
        let conn = self.db.lock();
        let n = conn.execute(
            "DELETE FROM channel_memories WHERE channel = ?1 AND key = ?2",
            params![scope, key],
        )?;
        Ok(n > 0)
    }

    pub fn list_channel(&self, channel: &str) -> anyhow::Result<Vec<MemoryRecord>> {
        let scope = sanitize_channel(channel);
        let conn = self.db.lock();
        Self::collect_memories(
            &conn,
            "SELECT key, value, category, tags, created_at, updated_at
             FROM channel_memories WHERE channel = ?1 ORDER BY key",
            params![scope],
        )
    }

    /// Drop an entire channel scope. Returns the number of records removed.
    pub fn purge_channel(&self, channel: &str) -> anyhow::Result<usize> {
        let scope = sanitize_channel(channel);
        let conn = self.db.lock();
        let n = conn.execute("DELETE FROM channel_memories WHERE channel = ?1", [scope])?;
        Ok(n)
    }

    /// Channel scopes that have ever been written to.
    pub fn known_channels(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare("SELECT DISTINCT channel FROM channel_memories ORDER BY channel")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut channels = Vec::new();
        for row in rows {
            channels.push(row?);
        }
        Ok(channels)
    }

    // ------------------------------------------------------------------
    // Skills
    // ------------------------------------------------------------------

    pub fn create_skill(
        &self,
        name: &str,
        description: &str,
        instructions: &str,
        owner: &str,
    ) -> anyhow::Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO skills (name, description, instructions, owner)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                 description = ?2, instructions = ?3, owner = ?4,
                 updated_at = CURRENT_TIMESTAMP",
            params![name, description, instructions, owner],
        )?;
        Ok(())
    }

    pub fn get_skill(&self, name: &str, user: &str) -> anyhow::Result<Option<SkillRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT name, description, instructions, owner, skill_data,
                    training_progress, created_at, updated_at
             FROM skills WHERE name = ?1",
        )?;
        let row = stmt
            .query_row([name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record = SkillRecord {
            name: row.0,
            description: row.1,
            instructions: row.2,
            owner: row.3,
            skill_data: serde_json::from_str(&row.4).unwrap_or(Value::Null),
            training_progress: serde_json::from_str(&row.5).unwrap_or(Value::Null),
            created_at: row.6,
            updated_at: row.7,
        };
        if record.owner != GLOBAL_OWNER && record.owner != user {
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Deep-merging update. Accepts three shapes:
    /// direct fields, `{skill_data: <obj>}`, and `{skill_data: null}` (clear).
    /// `description`, `instructions`, `owner` and `training_progress` are
    /// columns and never land inside `skill_data`; every other key merges
    /// into the data blob.
    pub fn update_skill(&self, name: &str, patch: &Value) -> anyhow::Result<()> {
        let Some(fields) = patch.as_object() else {
            anyhow::bail!("Skill update must be an object");
        };

        let existing = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare("SELECT skill_data FROM skills WHERE name = ?1")?;
            stmt.query_row([name], |row| row.get::<_, String>(0))
                .optional()?
        };
        let Some(existing) = existing else {
            anyhow::bail!("Skill '{}' not found", name);
        };

        let mut data: Value = serde_json::from_str(&existing)
            .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
        let mut column_sets: Vec<(&str, String)> = Vec::new();

        for (key, value) in fields {
            match key.as_str() {
                "description" | "instructions" | "owner" => {
                    if let Some(text) = value.as_str() {
                        column_sets.push((
                            match key.as_str() {
                                "description" => "description",
                                "instructions" => "instructions",
                                _ => "owner",
                            },
                            text.to_string(),
                        ));
                    }
                }
                "training_progress" => {
                    column_sets.push(("training_progress", serde_json::to_string(value)?));
                }
                "skill_data" => match value {
                    // `{skill_data: null}` clears the container entirely.
                    Value::Null => data = Value::Object(serde_json::Map::new()),
                    other => merge::deep_merge(&mut data, other.clone()),
                },
                _ => {
                    let mut wrapper = serde_json::Map::new();
                    wrapper.insert(key.clone(), value.clone());
                    merge::deep_merge(&mut data, Value::Object(wrapper));
                }
            }
        }

        let conn = self.db.lock();
        for (column, value) in &column_sets {
            conn.execute(
                &format!(
                    "UPDATE skills SET {column} = ?1, updated_at = CURRENT_TIMESTAMP
                     WHERE name = ?2"
                ),
                params![value, name],
            )?;
        }
        conn.execute(
            "UPDATE skills SET skill_data = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE name = ?2",
            params![serde_json::to_string(&data)?, name],
        )?;
        Ok(())
    }

    pub fn delete_skill(&self, name: &str) -> anyhow::Result<bool> {
        let conn = self.db.lock();
        let n = conn.execute("DELETE FROM skills WHERE name = ?1", [name])?;
        Ok(n > 0)
    }

    pub fn list_skills(&self, user: &str) -> anyhow::Result<Vec<SkillContextRow>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT name, description, instructions, owner FROM skills
             WHERE owner = ?1 OR owner = ?2 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![GLOBAL_OWNER, user], |row| {
            Ok(SkillContextRow {
                name: row.get(0)?,
                description: row.get(1)?,
                instructions: row.get(2)?,
                owner: row.get(3)?,
            })
        })?;
        let mut skills = Vec::new();
        for row in rows {
            skills.push(row?);
        }
        Ok(skills)
    }

    // ------------------------------------------------------------------
    // Search and context injection
    // ------------------------------------------------------------------

    /// Tokenized cross-scope search. The query is lowercased, underscores
    /// become spaces, whitespace splits into tokens; a record matches when
    /// any searched column contains any token.
    pub fn search(&self, query: &str) -> anyhow::Result<Vec<SearchHit>> {
        let tokens: Vec<String> = query
            .to_lowercase()
            .replace('_', " ")
            .split_whitespace()
            .map(|t| format!("%{}%", t))
            .collect();
        if tokens.is_empty() {
            anyhow::bail!("Search query is empty");
        }

        let conn = self.db.lock();
        let mut hits = Vec::new();

        let memory_cols = ["key", "value", "category", "tags"];
        let clause = Self::like_clause(&memory_cols, tokens.len());
        let bound: Vec<&dyn rusqlite::ToSql> =
            tokens.iter().map(|t| t as &dyn rusqlite::ToSql).collect();

        let mut stmt = conn.prepare(&format!(
            "SELECT key, value, category FROM global_memories WHERE {clause} ORDER BY key"
        ))?;
        let rows = stmt.query_map(&bound[..], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (key, value, category) = row?;
            hits.push(SearchHit {
                scope: "global".to_string(),
                key,
                value: serde_json::from_str(&value).unwrap_or(Value::Null),
                category,
            });
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT channel, key, value, category FROM channel_memories
             WHERE {clause} ORDER BY channel, key"
        ))?;
        let rows = stmt.query_map(&bound[..], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        for row in rows {
            let (channel, key, value, category) = row?;
            hits.push(SearchHit {
                scope: format!("channel:{channel}"),
                key,
                value: serde_json::from_str(&value).unwrap_or(Value::Null),
                category,
            });
        }

        let skill_cols = ["name", "description", "instructions"];
        let skill_clause = Self::like_clause(&skill_cols, tokens.len());
        let mut stmt = conn.prepare(&format!(
            "SELECT name, description FROM skills WHERE {skill_clause} ORDER BY name"
        ))?;
        let rows = stmt.query_map(&bound[..], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (name, description) = row?;
            hits.push(SearchHit {
                scope: "skill".to_string(),
                key: name,
                value: Value::String(description),
                category: "skill".to_string(),
            });
        }

        Ok(hits)
    }

    fn like_clause(columns: &[&str], token_count: usize) -> String {
        let mut parts = Vec::new();
        for i in 1..=token_count {
            for col in columns {
                parts.push(format!("LOWER(REPLACE({col}, '_', ' ')) LIKE ?{i}"));
            }
        }
        parts.join(" OR ")
    }

    /// Global memories grouped by category, for prompt auto-injection.
    /// Output preserves the caller's category order; keys sort within.
    pub fn get_context_memories(
        &self,
        categories: &[String],
    ) -> anyhow::Result<Vec<(String, Vec<(String, Value)>)>> {
        let mut out = Vec::new();
        for category in categories {
            let records = self.list_global(Some(category))?;
            if records.is_empty() {
                continue;
            }
            out.push((
                category.clone(),
                records.into_iter().map(|r| (r.key, r.value)).collect(),
            ));
        }
        Ok(out)
    }

    /// Skills visible to `user`, for prompt auto-injection.
    pub fn get_context_skills(&self, user: &str) -> anyhow::Result<Vec<SkillContextRow>> {
        self.list_skills(user)
    }

    // ------------------------------------------------------------------
    // Row helpers
    // ------------------------------------------------------------------

    fn map_memory_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMemoryRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    }

    fn decode_memory(raw: RawMemoryRow) -> anyhow::Result<MemoryRecord> {
        Ok(MemoryRecord {
            key: raw.0,
            value: serde_json::from_str(&raw.1)?,
            category: raw.2,
            tags: split_tags(&raw.3),
            created_at: raw.4,
            updated_at: raw.5,
        })
    }

    fn get_memory_row(
        conn: &Connection,
        sql: &str,
        key: &str,
    ) -> anyhow::Result<Option<MemoryRecord>> {
        let mut stmt = conn.prepare(sql)?;
        let raw = stmt.query_row([key], Self::map_memory_row).optional()?;
        raw.map(Self::decode_memory).transpose()
    }

    fn collect_memories(
        conn: &Connection,
        sql: &str,
        bind: impl rusqlite::Params,
    ) -> anyhow::Result<Vec<MemoryRecord>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(bind, Self::map_memory_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(Self::decode_memory(row?)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_store() -> MemoryStore {
        MemoryStore::new(Database::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn test_set_get_round_trip() {
        let store = test_store();
        let value = json!({"nested": {"list": [1, 2, 3]}, "n": 4.5, "s": "text"});
        store
            .set_global("project", &value, Some("work"), &["rust".to_string()])
            .unwrap();

        let record = store.get_global("project").unwrap().unwrap();
        assert_eq!(record.value, value);
        assert_eq!(record.category, "work");
        assert_eq!(record.tags, vec!["rust"]);
    }

    #[test]
    fn test_set_upserts() {
        let store = test_store();
        store.set_global("k", &json!(1), None, &[]).unwrap();
        store.set_global("k", &json!(2), Some("new"), &[]).unwrap();

        let record = store.get_global("k").unwrap().unwrap();
        assert_eq!(record.value, json!(2));
        assert_eq!(record.category, "new");
        assert_eq!(store.list_global(None).unwrap().len(), 1);
    }

    #[test]
    fn test_channel_scope_sanitized() {
        let store = test_store();
        store
            .set_channel("My Channel!", "k", &json!("v"), None, &[])
            .unwrap();

        // The sanitized scope is the only identity the record has.
        assert_eq!(store.known_channels().unwrap(), vec!["my_channel_"]);
        let record = store.get_channel("my channel?", "k").unwrap().unwrap();
        assert_eq!(record.value, json!("v"));
    }

    #[test]
    fn test_purge_channel() {
        let store = test_store();
        store.set_channel("a", "k1", &json!(1), None, &[]).unwrap();
        store.set_channel("a", "k2", &json!(2), None, &[]).unwrap();
        store.set_channel("b", "k", &json!(3), None, &[]).unwrap();

        assert_eq!(store.purge_channel("a").unwrap(), 2);
        assert!(store.list_channel("a").unwrap().is_empty());
        assert_eq!(store.list_channel("b").unwrap().len(), 1);
    }

    #[test]
    fn test_search_tokenized() {
        let store = test_store();
        store
            .set_global("factory", &json!("mega furnace"), None, &[])
            .unwrap();

        for query in ["mega", "furnace", "mega_furnace", "FURNACE mega"] {
            let hits = store.search(query).unwrap();
            assert_eq!(hits.len(), 1, "query {query:?} should match");
            assert_eq!(hits[0].key, "factory");
        }

        assert!(store.search("zeppelin").unwrap().is_empty());
        assert!(store.search("   ").is_err());
    }

    #[test]
    fn test_search_spans_scopes() {
        let store = test_store();
        store.set_global("alpha", &json!("shared topic"), None, &[]).unwrap();
        store
            .set_channel("lab", "beta", &json!("shared topic"), None, &[])
            .unwrap();
        store
            .create_skill("gamma", "shared topic handling", "", GLOBAL_OWNER)
            .unwrap();

        let hits = store.search("shared").unwrap();
        let scopes: Vec<&str> = hits.iter().map(|h| h.scope.as_str()).collect();
        assert!(scopes.contains(&"global"));
        assert!(scopes.contains(&"channel:lab"));
        assert!(scopes.contains(&"skill"));
    }

    #[test]
    fn test_skill_update_merges() {
        let store = test_store();
        store
            .create_skill("mining", "dig better", "use the drill", GLOBAL_OWNER)
            .unwrap();

        store
            .update_skill("mining", &json!({"skill_data": {"a": {"b": 1}}}))
            .unwrap();
        store
            .update_skill("mining", &json!({"skill_data": {"a": {"c": 2}}}))
            .unwrap();
        let skill = store.get_skill("mining", "anyone").unwrap().unwrap();
        assert_eq!(skill.skill_data, json!({"a": {"b": 1, "c": 2}}));

        store
            .update_skill("mining", &json!({"skill_data": {"a": {"b": null}}}))
            .unwrap();
        let skill = store.get_skill("mining", "anyone").unwrap().unwrap();
        assert_eq!(skill.skill_data, json!({"a": {"c": 2}}));
    }

    #[test]
    fn test_skill_clear_preserves_text_fields() {
        let store = test_store();
        store
            .create_skill("mining", "dig better", "use the drill", GLOBAL_OWNER)
            .unwrap();
        store
            .update_skill("mining", &json!({"skill_data": {"a": 1}}))
            .unwrap();

        store.update_skill("mining", &json!({"skill_data": null})).unwrap();

        let skill = store.get_skill("mining", "anyone").unwrap().unwrap();
        assert_eq!(skill.description, "dig better");
        assert_eq!(skill.instructions, "use the drill");
        assert_eq!(skill.skill_data, json!({}));
    }

    #[test]
    fn test_skill_direct_fields_shape() {
        let store = test_store();
        store.create_skill("s", "d", "", GLOBAL_OWNER).unwrap();

        // Direct fields: instructions goes to its column, stray keys merge
        // into skill_data.
        store
            .update_skill("s", &json!({"instructions": "new text", "recipe": {"ore": 3}}))
            .unwrap();

        let skill = store.get_skill("s", "anyone").unwrap().unwrap();
        assert_eq!(skill.instructions, "new text");
        assert_eq!(skill.skill_data, json!({"recipe": {"ore": 3}}));
        assert!(skill.skill_data.get("instructions").is_none());
    }

    #[test]
    fn test_skill_visibility() {
        let store = test_store();
        store.create_skill("mine", "d", "", "alice").unwrap();
        store.create_skill("ours", "d", "", GLOBAL_OWNER).unwrap();

        assert!(store.get_skill("mine", "alice").unwrap().is_some());
        assert!(store.get_skill("mine", "bob").unwrap().is_none());
        assert!(store.get_skill("ours", "bob").unwrap().is_some());

        let visible: Vec<String> = store
            .list_skills("bob")
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(visible, vec!["ours"]);
    }

    #[test]
    fn test_context_memories_ordering() {
        let store = test_store();
        store.set_global("z", &json!(1), Some("beta"), &[]).unwrap();
        store.set_global("a", &json!(2), Some("beta"), &[]).unwrap();
        store.set_global("m", &json!(3), Some("alpha"), &[]).unwrap();
        store.set_global("x", &json!(4), Some("unlisted"), &[]).unwrap();

        let categories = vec!["beta".to_string(), "alpha".to_string()];
        let context = store.get_context_memories(&categories).unwrap();

        assert_eq!(context.len(), 2);
        assert_eq!(context[0].0, "beta");
        let beta_keys: Vec<&str> = context[0].1.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(beta_keys, vec!["a", "z"]);
        assert_eq!(context[1].0, "alpha");
    }

    #[test]
    fn test_export_import_equal_state() {
        let store = test_store();
        store
            .set_global("a", &json!({"x": 1}), Some("c1"), &["t1".to_string()])
            .unwrap();
        store.set_global("b", &json!([1, 2]), Some("c2"), &[]).unwrap();

        let export = store.list_global(None).unwrap();

        let restored = test_store();
        restored.set_all_global(&export).unwrap();
        let reexport = restored.list_global(None).unwrap();

        let strip = |records: Vec<MemoryRecord>| {
            records
                .into_iter()
                .map(|r| (r.key, r.value, r.category, r.tags))
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(export), strip(reexport));
    }

    #[tokio::test]
    async fn test_run_wrapper() {
        let store = test_store();
        store
            .run(|s| s.set_global("k", &json!(1), None, &[]))
            .await
            .unwrap();
        let record = store
            .run(|s| s.get_global("k"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.value, json!(1));
    }
}
