use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub query: QueryConfig,
    pub excluded_reviewers: ExcludedReviewers,
}

/// Change cache location and freshness window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Snapshots older than this are ignored and force a full resync.
    pub max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".gerrit-stats/cache"),
            max_age_secs: 3600,
        }
    }
}

/// Pagination and retry tuning for the query client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Page size used while the working set is still empty. Kept small so
    /// the first merge check happens quickly.
    pub initial_page_size: u32,
    pub page_size: u32,
    /// Total connect+query attempts before a project's sync fails.
    pub connect_attempts: u32,
    pub retry_backoff_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            initial_page_size: 5,
            page_size: 500,
            connect_attempts: 3,
            retry_backoff_secs: 5,
        }
    }
}

/// Automated accounts dropped from the reviewer ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExcludedReviewers(pub Vec<String>);

impl Default for ExcludedReviewers {
    fn default() -> Self {
        Self(vec!["jenkins".to_string(), "smokestack".to_string()])
    }
}

impl ExcludedReviewers {
    pub fn contains(&self, username: &str) -> bool {
        self.0.iter().any(|e| e.eq_ignore_ascii_case(username))
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        info!(path = %path.display(), "Loaded configuration");

        Ok(config)
    }

    /// Load configuration from the default location (.gerrit-stats/config.yml)
    pub fn load_default() -> Result<Self> {
        Self::load(".gerrit-stats/config.yml")
    }
}

/// A project descriptor: one report unit, possibly spanning several
/// server-side projects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub subprojects: Vec<String>,
    /// Explicit core reviewer usernames. When absent, membership is
    /// resolved from the server group named by `core_team_group`.
    #[serde(default, rename = "core-team")]
    pub core_team: Option<Vec<String>>,
    #[serde(default, rename = "core-team-group")]
    pub core_team_group: Option<String>,
    /// Unofficial projects are skipped when reporting across all projects.
    #[serde(default)]
    pub unofficial: bool,
}

impl Project {
    /// Disjunctive query filter over the subprojects:
    /// `(project:a OR project:b)`.
    pub fn query_expression(&self) -> String {
        let terms: Vec<String> = self
            .subprojects
            .iter()
            .map(|p| format!("project:{}", p))
            .collect();
        format!("({})", terms.join(" OR "))
    }

    /// Server group holding the core team, defaulting to `{name}-core`.
    pub fn core_group_name(&self) -> String {
        self.core_team_group
            .clone()
            .unwrap_or_else(|| format!("{}-core", self.name))
    }
}

/// Load a single project descriptor. An unparseable descriptor is fatal:
/// without it we do not know what to query.
pub fn load_project(path: impl AsRef<Path>) -> Result<Project> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read project descriptor: {}", path.display()))?;
    let project: Project = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse project descriptor: {}", path.display()))?;
    Ok(project)
}

/// Load every `*.json` descriptor under `dir`, skipping unofficial projects.
pub fn load_all_projects(dir: impl AsRef<Path>) -> Result<Vec<Project>> {
    let pattern = format!("{}/*.json", dir.as_ref().display());
    let mut projects = Vec::new();

    for entry in glob::glob(&pattern).context("Invalid projects directory pattern")? {
        let path = entry.context("Failed to read projects directory")?;
        let project = load_project(&path)?;
        if project.unofficial {
            warn!(name = %project.name, "Skipping unofficial project");
            continue;
        }
        projects.push(project);
    }

    Ok(projects)
}
