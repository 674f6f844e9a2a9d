//! Thin Trello REST tool: boards, lists, cards, card creation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::TrelloConfig;
use crate::tools::{tool_err, tool_ok, Tool};

const API: &str = "https://api.trello.com/1";

pub struct TrelloTool {
    key: Option<String>,
    token: Option<String>,
    http: reqwest::Client,
}

impl TrelloTool {
    pub fn new(config: &TrelloConfig) -> Self {
        Self {
            key: config.key.clone(),
            token: config.token.clone(),
            http: reqwest::Client::new(),
        }
    }

    fn credentials(&self) -> Result<(&str, &str), Value> {
        match (self.key.as_deref(), self.token.as_deref()) {
            (Some(key), Some(token)) => Ok((key, token)),
            _ => Err(tool_err(
                "Trello is not configured (tools.trello.key / tools.trello.token)",
            )),
        }
    }

    async fn get_json(&self, path: &str, extra: &[(&str, &str)]) -> Result<Value, Value> {
        let (key, token) = self.credentials()?;
        let mut query = vec![("key", key), ("token", token)];
        query.extend_from_slice(extra);

        let response = self
            .http
            .get(format!("{API}{path}"))
            .query(&query)
            .send()
            .await
            .map_err(|e| tool_err(format!("Trello request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(tool_err(format!(
                "Trello returned status {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| tool_err(format!("Bad Trello response: {e}")))
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TrelloArgs {
    op: String,
    #[serde(default)]
    board_id: Option<String>,
    #[serde(default)]
    list_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[async_trait]
impl Tool for TrelloTool {
    fn name(&self) -> &str {
        "trello"
    }

    fn capability(&self) -> String {
        "trello(op: \"boards\") -> {success, boards: [{id, name}]}\n\
         trello(op: \"lists\", board_id) -> {success, lists: [{id, name}]}\n\
         trello(op: \"cards\", list_id) -> {success, cards: [{id, name}]}\n\
         trello(op: \"add_card\", list_id, name, description?) -> {success, id}"
            .to_string()
    }

    fn positional_keys(&self) -> &[&str] {
        &["op"]
    }

    async fn run(&self, args: Value) -> anyhow::Result<Value> {
        let args: TrelloArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return Ok(tool_err(format!("Invalid arguments: {e}"))),
        };

        let result = match args.op.as_str() {
            "boards" => match self.get_json("/members/me/boards", &[("fields", "name")]).await {
                Ok(data) => tool_ok(json!({ "boards": slim(&data) })),
                Err(e) => e,
            },
            "lists" => {
                let Some(board_id) = args.board_id.as_deref() else {
                    return Ok(tool_err("Missing required 'board_id'"));
                };
                match self
                    .get_json(&format!("/boards/{board_id}/lists"), &[("fields", "name")])
                    .await
                {
                    Ok(data) => tool_ok(json!({ "lists": slim(&data) })),
                    Err(e) => e,
                }
            }
            "cards" => {
                let Some(list_id) = args.list_id.as_deref() else {
                    return Ok(tool_err("Missing required 'list_id'"));
                };
                match self
                    .get_json(&format!("/lists/{list_id}/cards"), &[("fields", "name")])
                    .await
                {
                    Ok(data) => tool_ok(json!({ "cards": slim(&data) })),
                    Err(e) => e,
                }
            }
            "add_card" => {
                let (Some(list_id), Some(name)) = (args.list_id.as_deref(), args.name.as_deref())
                else {
                    return Ok(tool_err("Missing required 'list_id' and 'name'"));
                };
                let (key, token) = match self.credentials() {
                    Ok(c) => c,
                    Err(e) => return Ok(e),
                };
                let mut query = vec![
                    ("key", key),
                    ("token", token),
                    ("idList", list_id),
                    ("name", name),
                ];
                if let Some(description) = args.description.as_deref() {
                    query.push(("desc", description));
                }
                match self
                    .http
                    .post(format!("{API}/cards"))
                    .query(&query)
                    .send()
                    .await
                {
                    Ok(response) if response.status().is_success() => {
                        let data: Value = response.json().await.unwrap_or(json!({}));
                        tool_ok(json!({ "id": data["id"] }))
                    }
                    Ok(response) => {
                        tool_err(format!("Trello returned status {}", response.status()))
                    }
                    Err(e) => tool_err(format!("Trello request failed: {e}")),
                }
            }
            other => tool_err(format!(
                "Unknown op '{other}'; expected boards, lists, cards, or add_card"
            )),
        };
        Ok(result)
    }
}

fn slim(data: &Value) -> Vec<Value> {
    data.as_array()
        .map(|items| {
            items
                .iter()
                .map(|i| json!({ "id": i["id"], "name": i["name"] }))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::is_failure;

    #[tokio::test]
    async fn test_unconfigured() {
        let tool = TrelloTool::new(&TrelloConfig::default());
        let result = tool.run(json!({"op": "boards"})).await.unwrap();
        assert!(is_failure(&result));
        assert!(result["error"].as_str().unwrap().contains("not configured"));
    }

    #[tokio::test]
    async fn test_missing_required_param() {
        let tool = TrelloTool::new(&TrelloConfig {
            key: Some("k".into()),
            token: Some("t".into()),
        });
        let result = tool.run(json!({"op": "lists"})).await.unwrap();
        assert!(is_failure(&result));
        assert!(result["error"].as_str().unwrap().contains("board_id"));
    }

    #[tokio::test]
    async fn test_unknown_op() {
        let tool = TrelloTool::new(&TrelloConfig::default());
        let result = tool.run(json!({"op": "explode"})).await.unwrap();
        assert!(is_failure(&result));
    }
}
