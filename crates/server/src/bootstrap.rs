use std::sync::Arc;

use kuria_core::config::{AppConfig, ConfigError, LoadOptions};
use kuria_db::repositories::Store;
use kuria_db::{connect_with_settings, migrations, DbPool};
use kuria_runtime::Runtime;
use thiserror::Error;
use tracing::info;

use crate::dispatch::HttpDispatcher;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Runtime,
    pub dispatcher_configured: bool,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("dispatch client could not be built: {0}")]
    Dispatcher(#[source] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let dispatcher = HttpDispatcher::from_config(&config.dispatch).map_err(BootstrapError::Dispatcher)?;
    let dispatcher_configured = dispatcher.is_configured();
    info!(
        event_name = "system.bootstrap.dispatcher",
        correlation_id = "bootstrap",
        configured = dispatcher_configured,
        "action dispatcher initialized"
    );

    let runtime = Runtime::new(Store::sqlite(db_pool.clone()), &config, Arc::new(dispatcher));
    Ok(Application { config, db_pool, runtime, dispatcher_configured })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use kuria_core::config::{ConfigOverrides, LoadOptions};
    use kuria_core::domain::company::{Company, CompanyId};

    use crate::bootstrap::bootstrap;

    fn overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_wires_the_store() {
        let app = bootstrap(overrides("sqlite::memory:")).await.expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('companies', 'events', 'pending_actions', 'action_logs')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("tables");
        assert_eq!(table_count, 4);
        assert!(!app.dispatcher_configured);

        let acme = CompanyId("acme".to_string());
        app.runtime.store.companies.create(&Company::new(acme.clone(), "Acme", Utc::now())).await.expect("create");
        assert!(app.runtime.store.companies.find(&acme).await.expect("find").is_some());

        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn bootstrap_rejects_an_empty_database_url() {
        let result = bootstrap(overrides("   ")).await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("database.url"), "{message}");
    }
}
