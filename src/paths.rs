use std::path::{Path, PathBuf};

use anyhow::Context as AnyhowContext;

/// Per-user data layout under `~/.Skippy`.
///
/// Everything the daemon persists lives below one root: config, log, socket,
/// persistent context items, and the two SQLite databases.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    /// Resolve the data root from the current user's home directory.
    ///
    /// The directory must already exist; creating it is an installation step,
    /// not something the daemon does silently at startup.
    pub fn resolve() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        let root = home.join(".Skippy");
        if !root.is_dir() {
            anyhow::bail!("Data directory {} does not exist", root.display());
        }
        Ok(Self { root })
    }

    /// Build a layout rooted at an arbitrary directory (tests).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("Skippy.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("Skippy.log")
    }

    pub fn socket_file(&self) -> PathBuf {
        self.root.join("skippy.sock")
    }

    pub fn context_file(&self) -> PathBuf {
        self.root.join("context.json")
    }

    pub fn memory_db(&self) -> PathBuf {
        self.root.join("memory").join("memory.db")
    }

    pub fn cron_db(&self) -> PathBuf {
        self.root.join("memory").join("cron.db")
    }

    /// Ensure the `memory/` subdirectory exists before opening databases.
    pub fn ensure_memory_dir(&self) -> anyhow::Result<()> {
        let dir = self.root.join("memory");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(())
    }
}
