//! Slash commands: stop, clear, model, loop_limit, context.

use chrono::{Duration, Utc};
use poise::serenity_prelude as serenity;
use serenity::all::GetMessages;
use tracing::{error, info};

use crate::context_items::ContextItemKind;
use crate::{Context, Error};

/// Ask the in-flight prompt chain on this channel to stop
#[poise::command(slash_command)]
pub async fn stop(ctx: Context<'_>) -> Result<(), Error> {
    let app = &ctx.data().app;
    let channel = app
        .egress
        .name_of(ctx.channel_id().get())
        .unwrap_or_else(|| ctx.channel_id().to_string());

    app.orchestrator.aborts.request(&channel);
    info!("Abort requested for channel '{}'", channel);
    ctx.say("⏹ Stopping after the current step.").await?;
    Ok(())
}

/// Delete recent bot conversation in this channel
#[poise::command(slash_command)]
pub async fn clear(ctx: Context<'_>) -> Result<(), Error> {
    ctx.defer_ephemeral().await?;
    let channel_id = ctx.channel_id();
    // Bulk deletion stops working past 14 days; stay inside the window.
    let cutoff = Utc::now() - Duration::days(14);
    let mut deleted = 0usize;

    loop {
        let batch = channel_id
            .messages(ctx.http(), GetMessages::new().limit(100))
            .await?;
        let deletable: Vec<_> = batch
            .iter()
            .filter(|m| {
                let ts = m.timestamp.unix_timestamp();
                ts > cutoff.timestamp()
            })
            .map(|m| m.id)
            .collect();
        if deletable.is_empty() {
            break;
        }

        if deletable.len() == 1 {
            channel_id.delete_message(ctx.http(), deletable[0]).await?;
        } else {
            channel_id
                .delete_messages(ctx.http(), deletable.iter().copied())
                .await?;
        }
        deleted += deletable.len();
        if batch.len() < 100 {
            break;
        }
    }

    ctx.say(format!("🧹 Deleted {deleted} messages.")).await?;
    Ok(())
}

/// Inspect or switch the active model
#[poise::command(slash_command, subcommands("model_list", "model_set"))]
pub async fn model(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// List available models
#[poise::command(slash_command, rename = "list")]
pub async fn model_list(ctx: Context<'_>) -> Result<(), Error> {
    ctx.defer().await?;
    let app = &ctx.data().app;
    let models = app.llm.list_models().await.map_err(|e| {
        error!("Model listing failed: {e}");
        e
    })?;

    let current = app.config.read().unwrap().ollama.model.clone();
    let mut lines = Vec::new();
    for model in models {
        let marker = if model.name == current { " (active)" } else { "" };
        lines.push(format!(
            "• {}: {} {} ctx={}{}",
            model.name,
            model.param_size,
            model.quantization,
            model
                .context_length
                .map(|n| n.to_string())
                .unwrap_or_else(|| "?".to_string()),
            marker
        ));
    }
    if lines.is_empty() {
        lines.push("No models available.".to_string());
    }
    ctx.say(lines.join("\n")).await?;
    Ok(())
}

/// Switch the default model and persist the change
#[poise::command(slash_command, rename = "set")]
pub async fn model_set(
    ctx: Context<'_>,
    #[description = "Model name as known to Ollama"] name: String,
) -> Result<(), Error> {
    ctx.defer().await?;
    let app = &ctx.data().app;

    // Introspection doubles as validation: unknown models error here.
    let info = app.llm.introspect(&name).await?;

    {
        let mut config = app.config.write().unwrap();
        config.ollama.model = name.clone();
        config.save(&app.paths.config_file())?;
    }
    info!("Default model set to {}", name);
    ctx.say(format!(
        "✅ Model set to {} ({}, {}, ctx={})",
        name,
        info.param_size,
        info.quantization,
        info.context_length
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string())
    ))
    .await?;
    Ok(())
}

/// Inspect or change the loop step limit
#[poise::command(slash_command, subcommands("loop_limit_get", "loop_limit_set"))]
pub async fn loop_limit(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Show the current step limit
#[poise::command(slash_command, rename = "get")]
pub async fn loop_limit_get(ctx: Context<'_>) -> Result<(), Error> {
    let limit = ctx.data().app.config.read().unwrap().prompt.loop_limit;
    ctx.say(format!("Loop limit is {limit} steps.")).await?;
    Ok(())
}

/// Change the step limit (1..200) and persist it
#[poise::command(slash_command, rename = "set")]
pub async fn loop_limit_set(
    ctx: Context<'_>,
    #[description = "Steps per prompt chain (1-200)"]
    #[min = 1]
    #[max = 200]
    value: u32,
) -> Result<(), Error> {
    if !(1..=200).contains(&value) {
        ctx.say("Loop limit must be between 1 and 200.").await?;
        return Ok(());
    }
    let app = &ctx.data().app;
    {
        let mut config = app.config.write().unwrap();
        config.prompt.loop_limit = value as usize;
        config.save(&app.paths.config_file())?;
    }
    ctx.say(format!("✅ Loop limit set to {value}.")).await?;
    Ok(())
}

#[derive(Debug, poise::ChoiceParameter)]
pub enum ContextKindChoice {
    #[name = "file"]
    File,
    #[name = "image"]
    Image,
}

/// Manage the persistent prompt context
#[poise::command(
    slash_command,
    subcommands(
        "context_add",
        "context_remove",
        "context_list",
        "context_status",
        "context_clear"
    )
)]
pub async fn context(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Pin a file or image into every prompt
#[poise::command(slash_command, rename = "add")]
pub async fn context_add(
    ctx: Context<'_>,
    #[description = "file or image"] kind: ContextKindChoice,
    #[description = "Path on the daemon host"] path: String,
) -> Result<(), Error> {
    let kind = match kind {
        ContextKindChoice::File => ContextItemKind::File,
        ContextKindChoice::Image => ContextItemKind::Image,
    };
    ctx.data()
        .app
        .items
        .add(kind, &path, &ctx.author().name)?;
    ctx.say(format!("📌 Added {path} to the persistent context."))
        .await?;
    Ok(())
}

/// Unpin a context item by its list index
#[poise::command(slash_command, rename = "remove")]
pub async fn context_remove(
    ctx: Context<'_>,
    #[description = "1-based index from /context list"]
    #[min = 1]
    index: u32,
) -> Result<(), Error> {
    let removed = ctx.data().app.items.remove(index as usize)?;
    ctx.say(format!("🗑 Removed {}.", removed.path)).await?;
    Ok(())
}

/// List pinned context items
#[poise::command(slash_command, rename = "list")]
pub async fn context_list(ctx: Context<'_>) -> Result<(), Error> {
    let items = ctx.data().app.items.list();
    if items.is_empty() {
        ctx.say("The persistent context is empty.").await?;
        return Ok(());
    }
    let lines: Vec<String> = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            format!(
                "{}. [{}] {} (added by {})",
                i + 1,
                match item.kind {
                    ContextItemKind::File => "file",
                    ContextItemKind::Image => "image",
                },
                item.path,
                item.added_by
            )
        })
        .collect();
    ctx.say(lines.join("\n")).await?;
    Ok(())
}

/// Show the context token estimate against the model window
#[poise::command(slash_command, rename = "status")]
pub async fn context_status(ctx: Context<'_>) -> Result<(), Error> {
    let app = &ctx.data().app;
    let estimated = app.items.estimate_tokens();
    let window = app.effective_context_window();
    let percent = estimated.saturating_mul(100) / window.max(1);
    ctx.say(format!(
        "Pinned context: ~{estimated} tokens of a {window}-token window ({percent}%)."
    ))
    .await?;
    Ok(())
}

/// Unpin everything
#[poise::command(slash_command, rename = "clear")]
pub async fn context_clear(ctx: Context<'_>) -> Result<(), Error> {
    let n = ctx.data().app.items.clear()?;
    ctx.say(format!("🧹 Cleared {n} context items.")).await?;
    Ok(())
}
