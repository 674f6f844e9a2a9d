//! Discord gateway: ingress gating, platform-side history retrieval, status
//! bubbles, and chunked egress. The platform is the conversation store;
//! nothing is cached locally.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use poise::serenity_prelude as serenity;
use serenity::all::{ChannelId, CreateMessage, GetMessages, MessageId};
use serenity::http::Http;
use tracing::{debug, error, info, warn};

use crate::commands;
use crate::config::DISCORD_MESSAGE_LIMIT;
use crate::orchestrator::{ImageSource, PromptRequest, StatusSink};
use crate::{App, Data, Error};

/// Prefixes identifying our own transient status bubbles, so history
/// retrieval can drop them.
pub const STATUS_PREFIXES: [&str; 4] = ["💭", "⚙️", "🔧", "✅"];

pub fn is_status_bubble(content: &str) -> bool {
    let trimmed = content.trim_start();
    STATUS_PREFIXES.iter().any(|p| trimmed.starts_with(p))
}

/// Chat egress handle: message sends and channel-name resolution for the
/// discord_send tool, IPC `message` requests, and context assembly. Attached
/// once the gateway connects.
pub struct ChatEgress {
    http: OnceLock<Arc<Http>>,
    channels: RwLock<HashMap<String, u64>>,
}

impl ChatEgress {
    pub fn new() -> Self {
        Self {
            http: OnceLock::new(),
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn attach(&self, http: Arc<Http>) {
        let _ = self.http.set(http);
    }

    pub fn register_channel(&self, name: &str, id: u64) {
        self.channels.write().unwrap().insert(name.to_string(), id);
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn name_of(&self, id: u64) -> Option<String> {
        self.channels
            .read()
            .unwrap()
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.clone())
    }

    /// Resolve a channel by name or numeric id string.
    pub fn resolve(&self, channel: &str) -> Option<ChannelId> {
        if let Ok(id) = channel.parse::<u64>() {
            return Some(ChannelId::new(id));
        }
        self.channels
            .read()
            .unwrap()
            .get(channel)
            .map(|id| ChannelId::new(*id))
    }

    /// Send `content` to a channel, chunked to the platform limit.
    pub async fn send(&self, channel: &str, content: &str) -> anyhow::Result<usize> {
        let Some(http) = self.http.get() else {
            anyhow::bail!("Chat gateway is not connected yet");
        };
        let Some(channel_id) = self.resolve(channel) else {
            anyhow::bail!("Unknown channel '{channel}'");
        };

        let chunks = chunk_message(content, DISCORD_MESSAGE_LIMIT);
        let count = chunks.len();
        for chunk in chunks {
            channel_id
                .send_message(http, CreateMessage::new().content(chunk))
                .await?;
        }
        Ok(count)
    }
}

impl Default for ChatEgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a message at the platform's character limit, preferring newline
/// boundaries.
pub fn chunk_message(content: &str, limit: usize) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in content.split_inclusive('\n') {
        if current.len() + line.len() > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if line.len() > limit {
            // A single oversized line gets hard-split on char boundaries.
            let mut rest = line;
            while !rest.is_empty() {
                let mut cut = rest.len().min(limit);
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                chunks.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
        } else {
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Pure core of the ingress gate: DMs always respond, mentions always
/// respond, otherwise only when exactly one visible human shares the channel.
pub fn gate_decision(is_dm: bool, mentions_bot: bool, human_count: Option<usize>) -> bool {
    if is_dm || mentions_bot {
        return true;
    }
    human_count == Some(1)
}

/// Count non-bot members who can see the channel. `message.channel` hits the
/// cache first and fetches when missing, which covers uncached threads.
async fn visible_human_count(
    ctx: &serenity::Context,
    message: &serenity::Message,
) -> Option<usize> {
    message.guild_id?;

    let channel = match message.channel(&ctx).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Could not resolve channel {}: {}", message.channel_id, e);
            return None;
        }
    };
    let guild_channel = channel.guild()?;

    if guild_channel.thread_metadata.is_some() {
        // member_count includes this bot.
        return guild_channel
            .member_count
            .map(|count| (count as usize).saturating_sub(1));
    }

    let members = guild_channel.members(&ctx.cache).ok()?;
    Some(members.iter().filter(|m| !m.user.bot).count())
}

/// Fetch the last N messages from the platform, drop our status bubbles,
/// and format them oldest-first as `author: content` lines.
async fn recent_history(
    http: &Http,
    channel_id: ChannelId,
    bot_id: u64,
    limit: usize,
    before: MessageId,
) -> Vec<String> {
    let builder = GetMessages::new().before(before).limit(limit.min(100) as u8);
    let messages = match channel_id.messages(http, builder).await {
        Ok(m) => m,
        Err(e) => {
            warn!("History fetch failed for {}: {}", channel_id, e);
            return Vec::new();
        }
    };

    messages
        .iter()
        .rev()
        .filter(|m| !(m.author.id.get() == bot_id && is_status_bubble(&m.content)))
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| format!("{}: {}", m.author.name, m.content))
        .collect()
}

/// Status bubbles for one prompt chain: posted as messages, recorded, and
/// deleted after the final answer lands.
pub struct DiscordStatusSink {
    http: Arc<Http>,
    channel_id: ChannelId,
    sent: tokio::sync::Mutex<Vec<MessageId>>,
}

impl DiscordStatusSink {
    pub fn new(http: Arc<Http>, channel_id: ChannelId) -> Self {
        Self {
            http,
            channel_id,
            sent: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Delete every recorded bubble. Skipped when the final answer was empty
    /// so the trace of what happened stays visible.
    pub async fn cleanup(&self) {
        let ids: Vec<MessageId> = self.sent.lock().await.drain(..).collect();
        for id in ids {
            if let Err(e) = self.channel_id.delete_message(&self.http, id).await {
                debug!("Could not delete status bubble {}: {}", id, e);
            }
        }
    }
}

#[async_trait]
impl StatusSink for DiscordStatusSink {
    async fn status(&self, text: &str) {
        match self
            .channel_id
            .send_message(&self.http, CreateMessage::new().content(text))
            .await
        {
            Ok(message) => self.sent.lock().await.push(message.id),
            Err(e) => debug!("Could not send status bubble: {}", e),
        }
    }
}

/// Handle one gated inbound message end to end.
async fn handle_inbound(
    ctx: &serenity::Context,
    message: &serenity::Message,
    data: &Data,
) -> Result<(), Error> {
    let app = &data.app;
    let channel_id = message.channel_id;
    let channel_name = app
        .egress
        .name_of(channel_id.get())
        .unwrap_or_else(|| channel_id.to_string());

    info!(
        "Handling message from {} in #{}: {}",
        message.author.name, channel_name, message.content
    );

    let history_limit = app.config.read().unwrap().discord.message_history_limit;
    let history =
        recent_history(&ctx.http, channel_id, data.bot_id, history_limit, message.id).await;

    let content = strip_bot_mentions(&message.content, data.bot_id);
    let prompt = if history.is_empty() {
        content.clone()
    } else {
        format!(
            "Recent conversation:\n{}\n\nCurrent request: {}",
            history.join("\n"),
            content
        )
    };

    let images: Vec<ImageSource> = message
        .attachments
        .iter()
        .filter(|a| {
            a.content_type
                .as_deref()
                .is_some_and(|t| t.starts_with("image/"))
        })
        .map(|a| ImageSource::Url(a.url.clone()))
        .collect();

    let typing = channel_id.start_typing(&ctx.http);
    let sink = DiscordStatusSink::new(ctx.http.clone(), channel_id);

    let request = PromptRequest {
        prompt,
        channel: channel_name,
        user: message.author.name.clone(),
        model: None,
        extra_context: None,
        images,
    };
    let outcome = app.orchestrator.run_prompt(request, &sink).await;
    drop(typing);

    match outcome {
        Ok(outcome) => {
            if outcome.aborted {
                info!("Chain aborted after {} steps", outcome.loop_count);
                app.egress
                    .send(&channel_id.get().to_string(), "⏹ Stopped.")
                    .await?;
                sink.cleanup().await;
            } else if outcome.final_answer.trim().is_empty() {
                // No answer: leave the bubbles so the user sees what ran.
                warn!("Prompt chain produced an empty final answer");
            } else {
                app.egress
                    .send(&channel_id.get().to_string(), &outcome.final_answer)
                    .await?;
                sink.cleanup().await;
            }
        }
        Err(e) => {
            error!("Prompt chain failed: {e:#}");
            app.egress
                .send(&channel_id.get().to_string(), &format!("❌ {}", e))
                .await?;
            sink.cleanup().await;
        }
    }
    Ok(())
}

pub fn strip_bot_mentions(input: &str, bot_id: u64) -> String {
    input
        .replace(&format!("<@{}>", bot_id), "")
        .replace(&format!("<@!{}>", bot_id), "")
        .trim()
        .to_string()
}

/// Connect to Discord and serve until shutdown.
pub async fn run(app: Arc<App>) -> anyhow::Result<()> {
    let (token, guild_id) = {
        let config = app.config.read().unwrap();
        (config.discord.token.clone(), config.discord.guild_id)
    };

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                commands::stop(),
                commands::clear(),
                commands::model(),
                commands::loop_limit(),
                commands::context(),
            ],
            event_handler: |ctx, event, _framework, data| {
                Box::pin(async move {
                    match event {
                        serenity::FullEvent::Message { new_message } => {
                            if new_message.author.bot {
                                return Ok(());
                            }
                            let is_dm = new_message.guild_id.is_none();
                            let mentions_bot = new_message
                                .mentions
                                .iter()
                                .any(|u| u.id.get() == data.bot_id);
                            let humans = if is_dm || mentions_bot {
                                None
                            } else {
                                visible_human_count(ctx, new_message).await
                            };
                            if !gate_decision(is_dm, mentions_bot, humans) {
                                return Ok(());
                            }
                            if let Err(e) = handle_inbound(ctx, new_message, data).await {
                                error!("Error handling message: {e}");
                            }
                        }
                        serenity::FullEvent::Ready { data_about_bot } => {
                            info!("Connected as {}", data_about_bot.user.name);
                        }
                        _ => {}
                    }
                    Ok(())
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    if let poise::FrameworkError::Command { error, ctx, .. } = error {
                        error!("Command error in {}: {}", ctx.command().qualified_name, error);
                        let _ = ctx
                            .send(
                                poise::CreateReply::default()
                                    .content(format!("❌ {}", error))
                                    .ephemeral(true),
                            )
                            .await;
                    } else {
                        let _ = poise::builtins::on_error(error).await;
                    }
                })
            },
            ..Default::default()
        })
        .setup({
            let app = app.clone();
            move |ctx, ready, framework| {
                Box::pin(async move {
                    if let Some(guild_id) = guild_id {
                        info!("Registering commands in guild {}", guild_id);
                        poise::builtins::register_in_guild(
                            ctx,
                            &framework.options().commands,
                            serenity::GuildId::new(guild_id),
                        )
                        .await?;
                    } else {
                        info!("Registering commands globally");
                        poise::builtins::register_globally(ctx, &framework.options().commands)
                            .await?;
                    }

                    ctx.set_activity(Some(serenity::ActivityData::custom("Ready to assist")));

                    app.egress.attach(ctx.http.clone());
                    for guild in &ready.guilds {
                        if let Ok(channels) = ctx.http.get_channels(guild.id).await {
                            for channel in channels {
                                app.egress.register_channel(&channel.name, channel.id.get());
                            }
                        }
                    }
                    *app.known_channels.write().unwrap() = app.egress.channel_names();
                    info!(
                        "Channel directory: {} channels",
                        app.known_channels.read().unwrap().len()
                    );

                    Ok(Data {
                        app: app.clone(),
                        bot_id: ready.user.id.get(),
                    })
                })
            }
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged()
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::DIRECT_MESSAGES;

    let mut client = serenity::ClientBuilder::new(&token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Discord client: {e}"))?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Could not register ctrl+c handler: {}", e);
            return;
        }
        info!("Received shutdown signal, closing shards...");
        shard_manager.shutdown_all().await;
    });

    info!("Connecting to Discord...");
    client
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("Discord client error: {e}"))
}
