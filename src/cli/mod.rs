pub mod commands;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::Args;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use aft_tracker::{
    AftConfig, AftService, LogNotifier, Role, Session, SqliteStorage, UserId, UserIdentity,
};

/// Who is acting. The CLI trusts these flags; authentication happens upstream.
#[derive(Debug, Clone, Args)]
pub struct Identity {
    /// Acting user's id
    #[arg(long = "user-id")]
    pub user_id: String,
    /// Acting user's email, recorded in history
    #[arg(long)]
    pub email: String,
    /// Display name, used as the attested signer name
    #[arg(long)]
    pub name: String,
    /// Role to act as (requestor, dao, issm, cpso, dta, sme, media-custodian, admin)
    #[arg(long)]
    pub role: Role,
}

impl Identity {
    pub fn session(&self, config: &AftConfig) -> Session {
        let now = chrono::Utc::now();
        Session::acting(
            UserIdentity {
                user_id: UserId::new(self.user_id.clone()),
                email: self.email.clone(),
                display_name: self.name.clone(),
                primary_role: self.role,
                available_roles: vec![self.role],
            },
            self.role,
            now,
            Duration::minutes(i64::from(config.sessions.ttl_minutes)),
        )
    }
}

/// Everything a command needs: configuration, the database and the service over it.
pub struct CliContext {
    pub config: AftConfig,
    pub storage: Arc<SqliteStorage>,
    pub service: AftService,
}

impl CliContext {
    pub async fn open(config: AftConfig, database_url: Option<String>) -> Result<Self> {
        let mut database = config.database();
        if let Some(url) = database_url {
            database.url = url;
        }
        ensure_parent_dir(&database.url)?;

        let storage = Arc::new(
            SqliteStorage::connect(&database.url, database.max_connections, database.auto_migrate)
                .await
                .with_context(|| format!("Failed to open database at {}", database.url))?,
        );
        info!(url = %database.url, "Database opened");

        let service = AftService::from_config(storage.clone(), Arc::new(LogNotifier), &config)
            .context("Invalid trusted issuer pattern in [signatures] configuration")?;
        Ok(Self {
            config,
            storage,
            service,
        })
    }

    pub async fn close(self) {
        self.storage.shutdown().await;
    }
}

fn ensure_parent_dir(url: &str) -> Result<()> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.contains(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}
