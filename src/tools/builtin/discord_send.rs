//! Chat egress tool: lets the loop post to channels directly.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::gateway::ChatEgress;
use crate::tools::{tool_err, tool_ok, Tool};

pub struct DiscordSendTool {
    egress: Arc<ChatEgress>,
}

impl DiscordSendTool {
    pub fn new(egress: Arc<ChatEgress>) -> Self {
        Self { egress }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SendArgs {
    channel: String,
    message: String,
}

#[async_trait]
impl Tool for DiscordSendTool {
    fn name(&self) -> &str {
        "discord_send"
    }

    fn capability(&self) -> String {
        "discord_send(channel, message) -> {success, chunks_sent}\n\
         Posts a message to a Discord channel by name or numeric id. Long \
         messages are split automatically."
            .to_string()
    }

    fn positional_keys(&self) -> &[&str] {
        &["channel", "message"]
    }

    async fn run(&self, args: Value) -> anyhow::Result<Value> {
        let args: SendArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return Ok(tool_err(format!("Invalid arguments: {e}"))),
        };
        if args.message.trim().is_empty() {
            return Ok(tool_err("Refusing to send an empty message"));
        }

        match self.egress.send(&args.channel, &args.message).await {
            Ok(chunks) => Ok(tool_ok(json!({
                "channel": args.channel,
                "chunks_sent": chunks,
            }))),
            Err(e) => Ok(tool_err(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::is_failure;

    #[tokio::test]
    async fn test_not_connected_is_soft_failure() {
        let tool = DiscordSendTool::new(Arc::new(ChatEgress::new()));
        let result = tool
            .run(json!({"channel": "general", "message": "hi"}))
            .await
            .unwrap();
        assert!(is_failure(&result));
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let tool = DiscordSendTool::new(Arc::new(ChatEgress::new()));
        let result = tool
            .run(json!({"channel": "general", "message": "  "}))
            .await
            .unwrap();
        assert!(is_failure(&result));
        assert!(result["error"].as_str().unwrap().contains("empty"));
    }
}
