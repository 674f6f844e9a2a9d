//! Persistent context: files and images pinned into every prompt.
//!
//! Backed by `~/.Skippy/context.json`. Files are read fresh on each prompt;
//! images are base64-loaded once per prompt chain.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context as AnyhowContext;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextItemKind {
    File,
    Image,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    #[serde(rename = "type")]
    pub kind: ContextItemKind,
    pub path: String,
    pub added_at: String,
    pub added_by: String,
}

/// Shared, file-backed list of pinned context items.
pub struct ContextItems {
    file: PathBuf,
    items: Mutex<Vec<ContextItem>>,
}

impl ContextItems {
    /// Load the list; a missing file is an empty list.
    pub fn load(file: PathBuf) -> anyhow::Result<Self> {
        let items = match std::fs::read_to_string(&file) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Invalid context file {}", file.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).context("Failed to read context file"),
        };
        Ok(Self {
            file,
            items: Mutex::new(items),
        })
    }

    fn persist(&self, items: &[ContextItem]) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(items)?;
        std::fs::write(&self.file, raw)
            .with_context(|| format!("Failed to write {}", self.file.display()))?;
        Ok(())
    }

    pub fn add(&self, kind: ContextItemKind, path: &str, added_by: &str) -> anyhow::Result<()> {
        let mut items = self.items.lock().unwrap();
        if items.iter().any(|i| i.path == path) {
            anyhow::bail!("'{}' is already in the persistent context", path);
        }
        items.push(ContextItem {
            kind,
            path: path.to_string(),
            added_at: Utc::now().to_rfc3339(),
            added_by: added_by.to_string(),
        });
        self.persist(&items)
    }

    /// Remove by 1-based index, mirroring what `context list` shows.
    pub fn remove(&self, index: usize) -> anyhow::Result<ContextItem> {
        let mut items = self.items.lock().unwrap();
        if index == 0 || index > items.len() {
            anyhow::bail!("No context item at index {}", index);
        }
        let removed = items.remove(index - 1);
        self.persist(&items)?;
        Ok(removed)
    }

    pub fn clear(&self) -> anyhow::Result<usize> {
        let mut items = self.items.lock().unwrap();
        let n = items.len();
        items.clear();
        self.persist(&items)?;
        Ok(n)
    }

    pub fn list(&self) -> Vec<ContextItem> {
        self.items.lock().unwrap().clone()
    }

    /// Read every file item fresh and wrap it for context injection.
    /// Unreadable files degrade to an inline note rather than failing the
    /// prompt.
    pub fn render_files(&self) -> String {
        let items = self.list();
        let mut out = String::new();
        for item in items.iter().filter(|i| i.kind == ContextItemKind::File) {
            match std::fs::read_to_string(&item.path) {
                Ok(content) => {
                    out.push_str(&format!("<file path=\"{}\">\n{}\n</file>\n", item.path, content));
                }
                Err(e) => {
                    warn!("Context file {} unreadable: {}", item.path, e);
                    out.push_str(&format!(
                        "<file path=\"{}\" error=\"{}\"/>\n",
                        item.path, e
                    ));
                }
            }
        }
        out
    }

    /// Base64-encode every image item. Called once per prompt chain.
    pub fn load_images(&self) -> Vec<String> {
        let items = self.list();
        let mut images = Vec::new();
        for item in items.iter().filter(|i| i.kind == ContextItemKind::Image) {
            match std::fs::read(&item.path) {
                Ok(bytes) => {
                    images.push(base64::engine::general_purpose::STANDARD.encode(bytes));
                }
                Err(e) => warn!("Context image {} unreadable: {}", item.path, e),
            }
        }
        images
    }

    /// chars/4 estimate over all file contents, for `context status`.
    pub fn estimate_tokens(&self) -> u64 {
        let mut chars = 0u64;
        for item in self.list() {
            if item.kind == ContextItemKind::File {
                if let Ok(content) = std::fs::read_to_string(Path::new(&item.path)) {
                    chars += content.chars().count() as u64;
                }
            }
        }
        chars / 4
    }
}
