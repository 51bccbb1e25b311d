use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILENAME: &str = "wikimigrate.toml";
pub const DEFAULT_ENGINE_BINARY: &str = "pandoc";
pub const DEFAULT_LOCALE: &str = "en";
pub const DEFAULT_EXPORT_DIR: &str = "wiki-md";
pub const DEFAULT_LEDGER_FILENAME: &str = "wikimigrate.db";
pub const DEFAULT_USER_AGENT: &str = "wikimigrate/0.1";

/// Engine arguments for the production setup: wiki markup in,
/// GitHub-flavored markdown out, no line rewrapping.
pub fn default_engine_args() -> Vec<String> {
    ["-f", "mediawiki", "-t", "gfm", "--wrap=none"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrationConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub destination: DestinationSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub paths: PathsSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SourceSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DestinationSection {
    pub host: Option<String>,
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct EngineSection {
    pub binary: Option<String>,
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PathsSection {
    pub export_dir: Option<String>,
    pub ledger: Option<String>,
}

impl MigrationConfig {
    /// Resolve the MediaWiki API endpoint: env MEDIAWIKI_API_URL > config > None.
    pub fn source_api_url(&self) -> Option<String> {
        env_value("MEDIAWIKI_API_URL").or_else(|| self.source.api_url.clone())
    }

    /// Resolve MediaWiki credentials, environment only. Both halves must be set.
    pub fn source_credentials(&self) -> Option<(String, String)> {
        let user = env_value("MEDIAWIKI_USER")?;
        let password = env_value("MEDIAWIKI_PASSWORD")?;
        Some((user, password))
    }

    /// Resolve user agent: env WIKIMIGRATE_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn source_user_agent(&self) -> String {
        env_value("WIKIMIGRATE_USER_AGENT")
            .or_else(|| self.source.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Resolve the Wiki.js base URL: env WIKIJS_HOST > config > None.
    pub fn destination_host(&self) -> Option<String> {
        env_value("WIKIJS_HOST").or_else(|| self.destination.host.clone())
    }

    /// Resolve the Wiki.js API token, environment only.
    pub fn destination_token(&self) -> Option<String> {
        env_value("WIKIJS_TOKEN")
    }

    /// Resolve the destination locale: env WIKIJS_LOCALE > config > DEFAULT_LOCALE.
    pub fn locale(&self) -> String {
        env_value("WIKIJS_LOCALE")
            .or_else(|| self.destination.locale.clone())
            .unwrap_or_else(|| DEFAULT_LOCALE.to_string())
    }

    pub fn engine_binary(&self) -> String {
        self.engine
            .binary
            .clone()
            .unwrap_or_else(|| DEFAULT_ENGINE_BINARY.to_string())
    }

    pub fn engine_args(&self) -> Vec<String> {
        self.engine.args.clone().unwrap_or_else(default_engine_args)
    }

    pub fn export_dir(&self) -> PathBuf {
        PathBuf::from(
            self.paths
                .export_dir
                .clone()
                .unwrap_or_else(|| DEFAULT_EXPORT_DIR.to_string()),
        )
    }

    pub fn ledger_path(&self) -> PathBuf {
        PathBuf::from(
            self.paths
                .ledger
                .clone()
                .unwrap_or_else(|| DEFAULT_LEDGER_FILENAME.to_string()),
        )
    }
}

/// Load and parse a MigrationConfig from a TOML file. Returns default if the
/// file doesn't exist; credentials and tokens are resolved from the
/// environment at use time, never stored here.
pub fn load_config(config_path: &Path) -> Result<MigrationConfig> {
    if !config_path.exists() {
        return Ok(MigrationConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrationConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub(crate) fn env_value(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

pub(crate) fn env_value_u64(name: &str) -> Option<u64> {
    env_value(name).and_then(|value| value.parse::<u64>().ok())
}

pub(crate) fn env_value_usize(name: &str) -> Option<usize> {
    env_value(name).and_then(|value| value.parse::<usize>().ok())
}
