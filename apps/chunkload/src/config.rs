//! Command line and configuration file.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/chunkload/config.toml`
//! - Windows: `%APPDATA%/chunkload/config.toml`
//!
//! Flags given on the command line override the file.

use std::path::{Path, PathBuf};

use chunkload_transfer::UploadOptions;
use clap::Parser;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Args
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "chunkload", version, about = "Upload files in chunks over HTTP")]
pub struct Args {
    // ---
    /// Configuration file (defaults to the per-user config path).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Upload URL.
    #[arg(long)]
    pub url: Option<String>,

    /// Chunk size in bytes; 0 sends each file in one request.
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Concurrent uploads.
    #[arg(long)]
    pub slots: Option<usize>,

    /// Retries per chunk.
    #[arg(long)]
    pub retries: Option<u32>,

    /// Files to upload.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

impl Args {
    /// Overrides the loaded configuration with the flags that were given.
    pub fn apply(&self, config: &mut Config) {
        if let Some(url) = &self.url {
            config.upload.url = url.clone();
        }
        if let Some(chunk_size) = self.chunk_size {
            config.upload.chunk_size = chunk_size;
        }
        if let Some(slots) = self.slots {
            config.upload.max_slots = slots;
        }
        if let Some(retries) = self.retries {
            config.upload.max_retries = retries;
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Persistent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub upload: UploadOptions,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            upload: UploadOptions::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or writes a default there if absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Headers may carry credentials.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the platform-specific configuration file path.
pub fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("chunkload").join("config.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("chunkload")
            .join("config.toml"))
    }
}
