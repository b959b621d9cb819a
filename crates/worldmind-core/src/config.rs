//! Runtime configuration for the mission pipeline.
//!
//! The CLI resolves a config file and flags into this struct; everything in
//! core reads options from here rather than the environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which sandbox backend runs dispatched tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxProvider {
    Container,
    TaskRunner,
}

impl fmt::Display for SandboxProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Container => "container",
            Self::TaskRunner => "task_runner",
        };
        f.write_str(s)
    }
}

impl FromStr for SandboxProvider {
    type Err = crate::mission::ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(Self::Container),
            "task_runner" => Ok(Self::TaskRunner),
            other => Err(crate::mission::ParseEnumError::new("sandbox provider", other)),
        }
    }
}

/// All recognized pipeline options with their defaults.
#[derive(Debug, Clone)]
pub struct WorldmindConfig {
    /// Wave cap under the PARALLEL strategy.
    pub max_parallel: usize,
    /// Settle delay after each wave, giving pushes time to propagate.
    pub wave_cooldown: Duration,
    /// Shared-FS worktrees vs per-task clones.
    pub worktrees_enabled: bool,
    pub provider: SandboxProvider,
    /// Minimum review score the quality gate accepts.
    pub review_score_threshold: u8,
    /// Per-dispatch wall-clock cap.
    pub task_timeout: Duration,
    /// Graph node invocation budget per mission run.
    pub recursion_limit: u32,
    /// Root under which mission workspaces are created.
    pub workdir: PathBuf,
    /// Branch task branches fork from and merge back into.
    pub base_branch: String,
    /// Sandbox image runtime tag override; detected from the repository
    /// when `None`.
    pub runtime: Option<String>,
    /// External tool endpoints exposed to every agent.
    pub mcp_endpoints: Vec<crate::sandbox::McpEndpoint>,
}

impl Default for WorldmindConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            wave_cooldown: Duration::from_secs(5),
            worktrees_enabled: true,
            provider: SandboxProvider::Container,
            review_score_threshold: 7,
            task_timeout: Duration::from_secs(1800),
            recursion_limit: 100,
            workdir: std::env::temp_dir().join("worldmind"),
            base_branch: "main".to_string(),
            runtime: None,
            mcp_endpoints: Vec::new(),
        }
    }
}

/// Detect the sandbox runtime tag from the repository's build system.
///
/// Falls back to `"base"` when nothing is recognized.
pub fn detect_runtime(repo: &Path) -> String {
    let markers: &[(&str, &str)] = &[
        ("pom.xml", "maven"),
        ("build.gradle", "gradle"),
        ("build.gradle.kts", "gradle"),
        ("package.json", "node"),
        ("Cargo.toml", "rust"),
        ("go.mod", "go"),
        ("pyproject.toml", "python"),
    ];
    for (file, runtime) in markers {
        if repo.join(file).exists() {
            return (*runtime).to_string();
        }
    }
    "base".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = WorldmindConfig::default();
        assert_eq!(cfg.max_parallel, 4);
        assert_eq!(cfg.wave_cooldown, Duration::from_secs(5));
        assert!(cfg.worktrees_enabled);
        assert_eq!(cfg.provider, SandboxProvider::Container);
        assert_eq!(cfg.review_score_threshold, 7);
        assert_eq!(cfg.recursion_limit, 100);
        assert_eq!(cfg.base_branch, "main");
    }

    #[test]
    fn provider_roundtrip() {
        for p in [SandboxProvider::Container, SandboxProvider::TaskRunner] {
            let parsed: SandboxProvider = p.to_string().parse().unwrap();
            assert_eq!(p, parsed);
        }
        assert!("vm".parse::<SandboxProvider>().is_err());
    }

    #[test]
    fn runtime_detection_by_marker_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_runtime(dir.path()), "base");

        std::fs::write(dir.path().join("pom.xml"), "<project/>").unwrap();
        assert_eq!(detect_runtime(dir.path()), "maven");
    }

    #[test]
    fn maven_wins_over_later_markers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pom.xml"), "").unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(detect_runtime(dir.path()), "maven");
    }
}
