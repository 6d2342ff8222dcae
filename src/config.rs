use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::signature::verifier::{DEFAULT_CERTIFICATION_STATEMENT, DEFAULT_DOD_ISSUER_PATTERN};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AftConfig {
    pub database: Option<DatabaseConfig>,
    pub observability: ObservabilityConfig,
    pub signatures: SignatureConfig,
    pub sessions: SessionConfig,
    pub sla: SlaConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://.aft/aft.db".to_string(),
            max_connections: 5,
            auto_migrate: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// JSON lines when true, human-readable otherwise.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SignatureConfig {
    /// Regexes matched against a CAC certificate's issuer.
    pub trusted_issuer_patterns: Vec<String>,
    pub certification_statement: String,
    /// Refuse CAC signatures, which are only checked structurally.
    pub reject_structural_only: bool,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            trusted_issuer_patterns: vec![DEFAULT_DOD_ISSUER_PATTERN.to_string()],
            certification_statement: DEFAULT_CERTIFICATION_STATEMENT.to_string(),
            reject_structural_only: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_minutes: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_minutes: 480 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SlaConfig {
    pub at_risk_after_days: u32,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            at_risk_after_days: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
    /// Role name to the addresses notified when that role has work waiting.
    pub role_recipients: HashMap<String, Vec<String>>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 5000,
            role_recipients: HashMap::new(),
        }
    }
}

impl AftConfig {
    /// Defaults, then `aft.toml`, then `.aft-rc`, then `AFT_*` environment variables.
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&AftConfig::default())?);

        if Path::new("aft.toml").exists() {
            builder = builder.add_source(File::with_name("aft"));
        }

        if Path::new(".aft-rc").exists() {
            builder = builder
                .add_source(File::with_name(".aft-rc").format(config::FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("AFT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Defaults overlaid with a single TOML file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&AftConfig::default())?)
            .add_source(File::from(path.as_ref()).format(config::FileFormat::Toml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    pub fn database(&self) -> DatabaseConfig {
        self.database.clone().unwrap_or_default()
    }
}

static CONFIG: std::sync::LazyLock<Result<AftConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = AftConfig::load_env_file();
        AftConfig::load()
    });

/// The process-wide configuration, loaded from `.env`, files and environment on first use.
pub fn config() -> Result<&'static AftConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = AftConfig::default();
        assert_eq!(config.sessions.ttl_minutes, 480);
        assert_eq!(config.sla.at_risk_after_days, 5);
        assert_eq!(config.notifications.timeout_ms, 5000);
        assert!(!config.signatures.reject_structural_only);
        assert_eq!(config.database().max_connections, 5);
    }

    #[test]
    fn test_file_overrides_only_named_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aft.toml");
        std::fs::write(
            &path,
            r#"
[sla]
at_risk_after_days = 3

[signatures]
reject_structural_only = true

[notifications.role_recipients]
cpso = ["cpso@example.mil"]
"#,
        )
        .unwrap();

        let config = AftConfig::load_from(&path).unwrap();
        assert_eq!(config.sla.at_risk_after_days, 3);
        assert!(config.signatures.reject_structural_only);
        assert_eq!(config.signatures.trusted_issuer_patterns.len(), 1);
        assert_eq!(config.sessions.ttl_minutes, 480);
        assert_eq!(
            config.notifications.role_recipients.get("cpso"),
            Some(&vec!["cpso@example.mil".to_string()])
        );
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = AftConfig::default();
        config.database = Some(DatabaseConfig {
            url: "sqlite://saved.db".to_string(),
            max_connections: 2,
            auto_migrate: false,
        });
        config.save_to_file(&path).unwrap();

        let reloaded = AftConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.database().url, "sqlite://saved.db");
        assert!(!reloaded.database().auto_migrate);
    }
}
