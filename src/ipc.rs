//! IPC server: newline-delimited JSON over a Unix socket at
//! `~/.Skippy/skippy.sock`. Two request kinds: `prompt` drives the
//! orchestrator, `message` goes straight to the chat platform.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::orchestrator::{PromptRequest, StatusSink};
use crate::App;

/// One request, one connection: the socket closes after `done` or `error`.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Request {
    Prompt {
        prompt: String,
        #[serde(default)]
        output: Option<String>,
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        context: Option<String>,
    },
    Message {
        message: String,
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        user: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Status { message: String },
    Chunk { content: String },
    Done { content: String },
    Error { message: String },
}

/// Forwards loop status and (optionally) raw chunks to the client as frames.
/// Writes go through a channel so the sync chunk callback never blocks.
struct IpcStatusSink {
    tx: mpsc::UnboundedSender<Frame>,
    stream_chunks: bool,
}

#[async_trait]
impl StatusSink for IpcStatusSink {
    async fn status(&self, text: &str) {
        let _ = self.tx.send(Frame::Status {
            message: text.to_string(),
        });
    }

    fn on_chunk(&self, chunk: &str) {
        if self.stream_chunks {
            let _ = self.tx.send(Frame::Chunk {
                content: chunk.to_string(),
            });
        }
    }
}

/// Bind the socket (replacing a stale one), restrict it to the owner, and
/// serve until the task is dropped.
pub async fn run(app: Arc<App>, socket_path: PathBuf) -> anyhow::Result<()> {
    if socket_path.exists() {
        warn!("Removing stale socket {}", socket_path.display());
        std::fs::remove_file(&socket_path)?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
    info!("IPC listening on {}", socket_path.display());

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let app = app.clone();
                tokio::spawn(async move {
                    let result =
                        tokio::time::timeout(SOCKET_TIMEOUT, handle_connection(app, stream)).await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("IPC connection error: {e:#}"),
                        Err(_) => warn!("IPC connection timed out"),
                    }
                });
            }
            Err(e) => {
                error!("IPC accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(app: Arc<App>, stream: UnixStream) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let request: Request = match serde_json::from_str(line.trim()) {
        Ok(r) => r,
        Err(e) => {
            write_frame(
                &mut write_half,
                &Frame::Error {
                    message: format!("Invalid request: {e}"),
                },
            )
            .await?;
            return Ok(());
        }
    };

    let final_frame = match request {
        Request::Prompt {
            prompt,
            output,
            channel,
            user,
            model,
            context,
        } => {
            let (default_user, ipc_channel) = {
                let config = app.config.read().unwrap();
                (config.discord.default_user.clone(), "ipc".to_string())
            };
            let output = output.unwrap_or_else(|| "stdout".to_string());
            let channel_name = channel.clone().unwrap_or(ipc_channel);

            let (tx, mut rx) = mpsc::unbounded_channel();
            let sink = IpcStatusSink {
                tx,
                stream_chunks: output == "stdout",
            };

            let request = PromptRequest {
                prompt,
                channel: channel_name.clone(),
                user: user.unwrap_or(default_user),
                model,
                extra_context: context,
                images: Vec::new(),
            };

            let orchestrator = app.orchestrator.clone();
            let mut chain = Box::pin(orchestrator.run_prompt(request, &sink));

            // Drain frames while the chain runs so the client sees progress.
            let outcome = loop {
                tokio::select! {
                    frame = rx.recv() => {
                        if let Some(frame) = frame {
                            write_frame(&mut write_half, &frame).await?;
                        }
                    }
                    outcome = &mut chain => break outcome,
                }
            };
            while let Ok(frame) = rx.try_recv() {
                write_frame(&mut write_half, &frame).await?;
            }

            match outcome {
                Ok(outcome) => {
                    if output == "chat" {
                        if let Some(target) = channel.as_deref() {
                            if let Err(e) = app.egress.send(target, &outcome.final_answer).await {
                                warn!("IPC chat delivery failed: {e}");
                            }
                        } else {
                            warn!("IPC prompt requested chat output without a channel");
                        }
                    }
                    Frame::Done {
                        content: outcome.final_answer,
                    }
                }
                Err(e) => Frame::Error {
                    message: e.to_string(),
                },
            }
        }
        Request::Message {
            message, channel, ..
        } => {
            let Some(channel) = channel else {
                write_frame(
                    &mut write_half,
                    &Frame::Error {
                        message: "message requests need a channel".to_string(),
                    },
                )
                .await?;
                return Ok(());
            };
            match app.egress.send(&channel, &message).await {
                Ok(_) => Frame::Done {
                    content: String::new(),
                },
                Err(e) => Frame::Error {
                    message: e.to_string(),
                },
            }
        }
    };

    write_frame(&mut write_half, &final_frame).await?;
    Ok(())
}

async fn write_frame(
    writer: &mut (impl AsyncWriteExt + Unpin),
    frame: &Frame,
) -> anyhow::Result<()> {
    let mut raw = serde_json::to_string(frame)?;
    raw.push('\n');
    writer.write_all(raw.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parsing() {
        let prompt: Request =
            serde_json::from_str(r#"{"type": "prompt", "prompt": "hi", "output": "chat"}"#)
                .unwrap();
        match prompt {
            Request::Prompt { prompt, output, .. } => {
                assert_eq!(prompt, "hi");
                assert_eq!(output.as_deref(), Some("chat"));
            }
            _ => panic!("expected prompt request"),
        }

        let message: Request =
            serde_json::from_str(r#"{"type": "message", "message": "hello", "channel": "general"}"#)
                .unwrap();
        assert!(matches!(message, Request::Message { .. }));

        assert!(serde_json::from_str::<Request>(r#"{"type": "dance"}"#).is_err());
    }

    #[test]
    fn test_frame_wire_format() {
        let done = serde_json::to_value(Frame::Done {
            content: "4".to_string(),
        })
        .unwrap();
        assert_eq!(done["type"], "done");
        assert_eq!(done["content"], "4");

        let error = serde_json::to_value(Frame::Error {
            message: "nope".to_string(),
        })
        .unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["message"], "nope");

        let status = serde_json::to_value(Frame::Status {
            message: "💭 Thinking...".to_string(),
        })
        .unwrap();
        assert_eq!(status["type"], "status");

        let chunk = serde_json::to_value(Frame::Chunk {
            content: "par".to_string(),
        })
        .unwrap();
        assert_eq!(chunk["type"], "chunk");
    }

    #[tokio::test]
    async fn test_write_frame_newline_delimited() {
        let mut buffer = Vec::new();
        write_frame(
            &mut buffer,
            &Frame::Status {
                message: "ok".to_string(),
            },
        )
        .await
        .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
    }
}
