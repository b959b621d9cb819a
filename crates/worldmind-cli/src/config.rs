//! Configuration file management for worldmind.
//!
//! TOML config at `~/.config/worldmind/config.toml` with the resolution
//! chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use worldmind_core::config::{SandboxProvider, WorldmindConfig};
use worldmind_core::token::TokenConfig;
use worldmind_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub auth: AuthSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded token secret (64 hex chars = 32 bytes).
    pub token_secret: String,
}

/// Pipeline options; every field falls back to the core default.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PipelineSection {
    pub max_parallel: Option<usize>,
    pub wave_cooldown_secs: Option<u64>,
    pub worktrees_enabled: Option<bool>,
    pub provider: Option<String>,
    pub review_score_threshold: Option<u8>,
    pub task_timeout_secs: Option<u64>,
    pub recursion_limit: Option<u32>,
    pub workdir: Option<PathBuf>,
    pub base_branch: Option<String>,
    pub runtime: Option<String>,
}

impl PipelineSection {
    /// Overlay this section onto the core defaults.
    pub fn resolve(&self) -> Result<WorldmindConfig> {
        let mut config = WorldmindConfig::default();
        if let Some(v) = self.max_parallel {
            config.max_parallel = v;
        }
        if let Some(v) = self.wave_cooldown_secs {
            config.wave_cooldown = Duration::from_secs(v);
        }
        if let Some(v) = self.worktrees_enabled {
            config.worktrees_enabled = v;
        }
        if let Some(v) = &self.provider {
            config.provider = v
                .parse::<SandboxProvider>()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        if let Some(v) = self.review_score_threshold {
            config.review_score_threshold = v;
        }
        if let Some(v) = self.task_timeout_secs {
            config.task_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.recursion_limit {
            config.recursion_limit = v;
        }
        if let Some(v) = &self.workdir {
            config.workdir = v.clone();
        }
        if let Some(v) = &self.base_branch {
            config.base_branch = v.clone();
        }
        if let Some(v) = &self.runtime {
            config.runtime = Some(v.clone());
        }
        Ok(config)
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// The worldmind config directory: `$XDG_CONFIG_HOME/worldmind` or
/// `~/.config/worldmind`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("worldmind");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("worldmind")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Errors if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix (the token secret lives here).
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Generate a random token secret: 32 random bytes, hex-encoded.
pub fn generate_token_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub db_config: DbConfig,
    pub token_config: TokenConfig,
    pub pipeline: WorldmindConfig,
}

impl ResolvedConfig {
    /// Resolve using the chain: CLI flag > env var > config file > default.
    pub fn resolve(database_url_flag: Option<&str>) -> Result<Self> {
        let file = load_config().ok();

        let db_url = database_url_flag
            .map(str::to_owned)
            .or_else(|| std::env::var("WORLDMIND_DATABASE_URL").ok())
            .or_else(|| file.as_ref().map(|f| f.database.url.clone()))
            .unwrap_or_else(|| DbConfig::DEFAULT_URL.to_owned());

        let secret_hex = std::env::var("WORLDMIND_TOKEN_SECRET")
            .ok()
            .or_else(|| file.as_ref().map(|f| f.auth.token_secret.clone()));
        let Some(secret_hex) = secret_hex else {
            bail!(
                "no token secret configured; run `worldmind init` or set WORLDMIND_TOKEN_SECRET"
            );
        };
        let secret =
            hex::decode(&secret_hex).context("token secret is not valid hex")?;

        let pipeline = file
            .as_ref()
            .map(|f| f.pipeline.resolve())
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            db_config: DbConfig::new(db_url),
            token_config: TokenConfig::new(secret),
            pipeline,
        })
    }
}
