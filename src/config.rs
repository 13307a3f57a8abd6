use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GmailError, Result};
use crate::rules::{Rule, RuleSet};

pub const CONFIG_DIR_ENV: &str = "GMAIL_MANAGER_CONFIG_DIR";
pub const DATA_DIR_ENV: &str = "GMAIL_MANAGER_DATA_DIR";
pub const CONFIG_FILE_ENV: &str = "GMAIL_MANAGER_CONFIG";

const APP_DIR: &str = "gmail-manager";

/// Gmail's upper bound for messages.list maxResults
pub const MAX_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Messages fetched per rule query; further pages are reported, not fetched
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Most distinct emails one run acts on; 0 lifts the cap
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub dry_run: bool,
    /// Applied to messages matched by rules with a positive inbox_days
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_archive_label: Option<String>,
    /// Applied once a message has been archived
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_archive_label: Option<String>,
    /// Transport retries for transient Gmail errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            limit: default_limit(),
            dry_run: false,
            auto_archive_label: None,
            final_archive_label: None,
            max_retries: default_max_retries(),
        }
    }
}

fn default_page_size() -> u32 {
    20
}

fn default_limit() -> u32 {
    50
}

fn default_max_retries() -> u32 {
    3
}

impl Config {
    /// Load and validate; a missing file is an error since rules are required
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(GmailError::ConfigError(format!(
                "Config file not found at {:?} (create one with `gmail-manager init-config`)",
                path
            )));
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GmailError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| GmailError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!(
            "Loaded configuration from {:?} ({} rules)",
            path,
            config.rules.len()
        );
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                GmailError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| GmailError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| GmailError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate settings and compile every rule
    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;

        if self.rules.is_empty() {
            return Err(GmailError::ConfigError(
                "no rules configured; add at least one [[rules]] entry".to_string(),
            ));
        }
        RuleSet::compile(&self.rules)?;

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Compiled rules in configuration order
    pub fn rule_set(&self) -> Result<RuleSet> {
        RuleSet::compile(&self.rules)
    }

    pub fn example() -> Self {
        let rule = |name: &str, filter: &str, label: Option<&str>, important: bool, days: i64| Rule {
            name: name.to_string(),
            filter: filter.to_string(),
            label: label.map(str::to_string),
            mark_important: important,
            inbox_days: days,
            enabled: true,
        };

        Self {
            settings: Settings {
                auto_archive_label: Some("Auto Archive".to_string()),
                final_archive_label: Some("Archived".to_string()),
                ..Settings::default()
            },
            rules: vec![
                rule("Bills", "label:Bills", Some("Finance"), true, 30),
                rule(
                    "Newsletters",
                    "from:newsletter -is:important",
                    Some("Newsletters"),
                    false,
                    3,
                ),
                rule(
                    "CI notifications",
                    r"subject:/^\[(ci|build)\]/ -body:failed",
                    None,
                    false,
                    0,
                ),
                rule("Family", "from:family.example.com", Some("Family"), false, -1),
            ],
        }
    }

    /// Write an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        Self::example().save(path).await
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(GmailError::ConfigError(
                "settings.page_size must be at least 1".to_string(),
            ));
        }
        if self.page_size > MAX_PAGE_SIZE {
            return Err(GmailError::ConfigError(format!(
                "settings.page_size cannot exceed {} (Gmail API limit)",
                MAX_PAGE_SIZE
            )));
        }
        if self.max_retries > 10 {
            return Err(GmailError::ConfigError(
                "settings.max_retries cannot exceed 10".to_string(),
            ));
        }
        for (key, label) in [
            ("auto_archive_label", &self.auto_archive_label),
            ("final_archive_label", &self.final_archive_label),
        ] {
            if matches!(label, Some(l) if l.trim().is_empty()) {
                return Err(GmailError::ConfigError(format!(
                    "settings.{} must not be empty when set",
                    key
                )));
            }
        }
        Ok(())
    }
}

/// Where configuration, credentials and run reports live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    config_file: Option<PathBuf>,
}

impl AppPaths {
    pub fn new(config_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            data_dir: data_dir.into(),
            config_file: None,
        }
    }

    /// Environment overrides first, then the platform config/data directories
    pub fn from_env() -> Result<Self> {
        let config_dir = match std::env::var_os(CONFIG_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::config_dir()
                .map(|d| d.join(APP_DIR))
                .ok_or_else(|| {
                    GmailError::ConfigError(format!(
                        "Cannot determine config directory; set {}",
                        CONFIG_DIR_ENV
                    ))
                })?,
        };
        let data_dir = match std::env::var_os(DATA_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_local_dir()
                .map(|d| d.join(APP_DIR))
                .ok_or_else(|| {
                    GmailError::ConfigError(format!(
                        "Cannot determine data directory; set {}",
                        DATA_DIR_ENV
                    ))
                })?,
        };

        let mut paths = Self::new(config_dir, data_dir);
        paths.config_file = std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from);
        Ok(paths)
    }

    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_file
            .clone()
            .unwrap_or_else(|| self.config_dir.join("config.toml"))
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.config_dir.join("credentials.json")
    }

    pub fn token_cache(&self) -> PathBuf {
        self.config_dir.join("token.json")
    }

    pub fn rules_usage_file(&self) -> PathBuf {
        self.data_dir.join("rules_usage.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.page_size, 20);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.limit, 50);
        assert!(!settings.dry_run);
        assert!(settings.auto_archive_label.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();
        settings.page_size = 0;
        assert!(settings.validate().is_err());

        settings.page_size = MAX_PAGE_SIZE;
        assert!(settings.validate().is_ok());

        settings.page_size = MAX_PAGE_SIZE + 1;
        assert!(settings
            .validate()
            .unwrap_err()
            .to_string()
            .contains("cannot exceed 500"));

        let mut settings = Settings::default();
        settings.final_archive_label = Some(" ".to_string());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_requires_rules() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no rules configured"));
        assert!(Config::example().validate().is_ok());
    }

    #[test]
    fn test_validation_reports_bad_rule() {
        let mut config = Config::example();
        config.rules[1].filter = "subject:\"open".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, GmailError::RuleConfigError { ref rule, .. } if rule == "Newsletters"));
    }

    #[tokio::test]
    async fn test_config_load_save_roundtrip() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        Config::create_example(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();

        let example = Config::example();
        assert_eq!(loaded.rules, example.rules);
        assert_eq!(loaded.settings.page_size, example.settings.page_size);
        assert_eq!(
            loaded.settings.auto_archive_label.as_deref(),
            Some("Auto Archive")
        );
        assert_eq!(loaded.rule_set().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_config_load_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("missing.toml")).await;
        assert!(result.unwrap_err().to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_config_load_invalid_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), "this is not valid toml {[}]")
            .await
            .unwrap();

        let result = Config::load(temp_file.path()).await;
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to parse config file"));
    }

    #[tokio::test]
    async fn test_config_partial_with_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        let partial = r#"
[settings]
dry_run = true

[[rules]]
name = "Receipts"
filter = "subject:receipt"
label = "Receipts"
inbox_days = 7
"#;
        tokio::fs::write(temp_file.path(), partial).await.unwrap();

        let config = Config::load(temp_file.path()).await.unwrap();
        assert!(config.settings.dry_run);
        assert_eq!(config.settings.page_size, 20);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].inbox_days, 7);
        assert!(config.rules[0].enabled);
    }

    #[test]
    #[serial]
    fn test_app_paths_env_overrides() {
        std::env::set_var(CONFIG_DIR_ENV, "/tmp/gm-config");
        std::env::set_var(DATA_DIR_ENV, "/tmp/gm-data");
        std::env::remove_var(CONFIG_FILE_ENV);

        let paths = AppPaths::from_env().unwrap();
        assert_eq!(paths.config_dir, PathBuf::from("/tmp/gm-config"));
        assert_eq!(paths.data_dir, PathBuf::from("/tmp/gm-data"));
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/gm-config/config.toml"));
        assert_eq!(
            paths.rules_usage_file(),
            PathBuf::from("/tmp/gm-data/rules_usage.json")
        );

        std::env::set_var(CONFIG_FILE_ENV, "/etc/gm.toml");
        let paths = AppPaths::from_env().unwrap();
        assert_eq!(paths.config_file(), PathBuf::from("/etc/gm.toml"));

        std::env::remove_var(CONFIG_DIR_ENV);
        std::env::remove_var(DATA_DIR_ENV);
        std::env::remove_var(CONFIG_FILE_ENV);
    }

    #[test]
    fn test_app_paths_builders() {
        let paths = AppPaths::new("/c", "/d")
            .with_data_dir("/other")
            .with_config_file("/x.toml");
        assert_eq!(paths.data_dir, PathBuf::from("/other"));
        assert_eq!(paths.config_file(), PathBuf::from("/x.toml"));
        assert_eq!(paths.token_cache(), PathBuf::from("/c/token.json"));
        assert_eq!(paths.credentials_file(), PathBuf::from("/c/credentials.json"));
    }
}
