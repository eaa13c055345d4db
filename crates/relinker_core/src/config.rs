use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer, Serialize};
use toml::Value;

use crate::rewrite::TitleMatching;

pub const DEFAULT_USER_AGENT: &str = "relinker/0.1";
pub const DEFAULT_CONFIG_FILENAME: &str = "relinker.toml";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_EDIT_DELAY_MS: u64 = 1_000;
pub const DEFAULT_WATCH_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_PERMISSION_DENIED_PHRASE: &str = "때문에 편집 권한이 부족합니다.";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RelinkerConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub rename: RenameSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub domain: Option<String>,
    pub token: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub permission_denied_phrase: Option<String>,
    pub detect_permission_denied: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RenameSection {
    #[serde(default, deserialize_with = "deserialize_namespaces")]
    pub namespaces: Vec<String>,
    pub log_template: Option<String>,
    pub watch_document: Option<String>,
    pub title_matching: Option<TitleMatching>,
    pub edit_delay_ms: Option<u64>,
    pub watch_interval_secs: Option<u64>,
}

impl RelinkerConfig {
    /// Wiki domain: env RELINKER_DOMAIN > config.
    pub fn domain(&self) -> Option<String> {
        env_override("RELINKER_DOMAIN").or_else(|| non_empty(self.wiki.domain.as_deref()))
    }

    /// API token: env RELINKER_TOKEN > config.
    pub fn token(&self) -> Option<String> {
        env_override("RELINKER_TOKEN").or_else(|| non_empty(self.wiki.token.as_deref()))
    }

    /// Base URL for API calls. A bare host is served over https.
    pub fn base_url(&self) -> Option<String> {
        self.domain().map(|domain| base_url_for_domain(&domain))
    }

    pub fn user_agent(&self) -> String {
        env_override("RELINKER_USER_AGENT")
            .or_else(|| non_empty(self.wiki.user_agent.as_deref()))
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.wiki.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    /// Phrase that marks an edit-page response as an access-control denial,
    /// or `None` when detection is switched off.
    pub fn permission_denied_phrase(&self) -> Option<String> {
        if self.wiki.detect_permission_denied == Some(false) {
            return None;
        }
        Some(
            non_empty(self.wiki.permission_denied_phrase.as_deref())
                .unwrap_or_else(|| DEFAULT_PERMISSION_DENIED_PHRASE.to_string()),
        )
    }

    /// Namespaces: env RELINKER_NAMESPACES (comma separated) > config.
    pub fn namespaces(&self) -> Vec<String> {
        if let Some(value) = env_override("RELINKER_NAMESPACES") {
            return parse_list(&value);
        }
        self.rename.namespaces.clone()
    }

    pub fn log_template(&self) -> Option<String> {
        non_empty(self.rename.log_template.as_deref())
    }

    pub fn watch_document(&self) -> Option<String> {
        non_empty(self.rename.watch_document.as_deref())
    }

    pub fn title_matching(&self) -> TitleMatching {
        self.rename.title_matching.unwrap_or_default()
    }

    pub fn edit_delay(&self) -> Duration {
        Duration::from_millis(self.rename.edit_delay_ms.unwrap_or(DEFAULT_EDIT_DELAY_MS))
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(
            self.rename
                .watch_interval_secs
                .unwrap_or(DEFAULT_WATCH_INTERVAL_SECS),
        )
    }

    /// Names of required keys that are neither configured nor overridden.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.domain().is_none() {
            missing.push("wiki.domain");
        }
        if self.token().is_none() {
            missing.push("wiki.token");
        }
        if self.namespaces().is_empty() {
            missing.push("rename.namespaces");
        }
        if self.log_template().is_none() {
            missing.push("rename.log_template");
        }
        missing
    }
}

/// Load and parse a RelinkerConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<RelinkerConfig> {
    if !config_path.exists() {
        return Ok(RelinkerConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: RelinkerConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub set_domain: Option<String>,
    pub set_token: Option<String>,
    pub set_namespaces: Option<Vec<String>>,
    pub set_log_template: Option<String>,
    pub set_watch_document: Option<String>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.set_domain.is_none()
            && self.set_token.is_none()
            && self.set_namespaces.is_none()
            && self.set_log_template.is_none()
            && self.set_watch_document.is_none()
    }
}

/// Update selected keys under `[wiki]` and `[rename]` while preserving everything else.
/// Returns `true` when a write occurred.
pub fn patch_config(config_path: &Path, patch: &ConfigPatch) -> Result<bool> {
    if patch.is_empty() {
        return Ok(false);
    }

    let mut root = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str::<Value>(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        Value::Table(Default::default())
    };
    let original = root.clone();

    let root_table = root.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!(
            "top-level TOML must be a table in {}",
            config_path.display()
        )
    })?;

    {
        let wiki_table = section_table(root_table, "wiki", config_path)?;
        if let Some(domain) = &patch.set_domain {
            wiki_table.insert("domain".to_string(), Value::String(domain.clone()));
        }
        if let Some(token) = &patch.set_token {
            wiki_table.insert("token".to_string(), Value::String(token.clone()));
        }
    }

    let rename_table = section_table(root_table, "rename", config_path)?;
    if let Some(namespaces) = &patch.set_namespaces {
        if namespaces.iter().any(|ns| ns.trim().is_empty()) {
            bail!("namespace names cannot be empty");
        }
        let array = namespaces
            .iter()
            .map(|ns| Value::String(ns.clone()))
            .collect::<Vec<_>>();
        rename_table.insert("namespaces".to_string(), Value::Array(array));
    }
    if let Some(template) = &patch.set_log_template {
        rename_table.insert("log_template".to_string(), Value::String(template.clone()));
    }
    if let Some(watch) = &patch.set_watch_document {
        if watch.trim().is_empty() {
            rename_table.remove("watch_document");
        } else {
            rename_table.insert("watch_document".to_string(), Value::String(watch.clone()));
        }
    }

    if root == original {
        return Ok(false);
    }

    if let Some(parent) = config_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let rendered = toml::to_string_pretty(&root).context("failed to serialize config TOML")?;
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

fn section_table<'a>(
    root: &'a mut toml::map::Map<String, Value>,
    name: &str,
    config_path: &Path,
) -> Result<&'a mut toml::map::Map<String, Value>> {
    root.entry(name.to_string())
        .or_insert_with(|| Value::Table(Default::default()))
        .as_table_mut()
        .ok_or_else(|| anyhow::anyhow!("[{name}] must be a table in {}", config_path.display()))
}

/// Split a comma-separated list, dropping blank entries.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn base_url_for_domain(domain: &str) -> String {
    let trimmed = domain.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

fn deserialize_namespaces<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Namespaces {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match Namespaces::deserialize(deserializer)? {
        Namespaces::List(items) => items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        Namespaces::Joined(value) => parse_list(&value),
    })
}

fn env_override(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| non_empty(Some(&value)))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
