pub mod actions;
pub mod config;
pub mod doctor;
pub mod migrate;
pub mod tenants;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use kuria_core::config::{AppConfig, LoadOptions};
use kuria_core::domain::action::{ActionResult, PendingAction};
use kuria_core::domain::company::CompanyId;
use kuria_core::errors::{ApplicationError, InterfaceError};
use kuria_db::repositories::Store;
use kuria_db::{connect_with_settings, migrations};
use kuria_runtime::{ActionDispatcher, DispatchError, Runtime};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with(command, message, None)
    }

    pub fn success_with(command: &str, message: impl Into<String>, data: Option<Value>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Why a command stopped, with the process exit code to report.
#[derive(Debug)]
pub struct CommandFailure {
    pub error_class: String,
    pub message: String,
    pub exit_code: u8,
}

impl CommandFailure {
    pub fn new(error_class: &str, message: impl Into<String>, exit_code: u8) -> Self {
        Self { error_class: error_class.to_string(), message: message.into(), exit_code }
    }

    /// Service errors exit with 6; the class comes from the interface mapping.
    pub fn from_service(error: impl Into<ApplicationError>) -> Self {
        let application: ApplicationError = error.into();
        let interface = InterfaceError::from(application);
        Self::new(interface.error_class(), interface.message(), 6)
    }

    pub fn from_repository(error: kuria_db::repositories::RepositoryError) -> Self {
        Self::from_service(ApplicationError::Persistence(error.to_string()))
    }

    fn into_result(self, command: &str) -> CommandResult {
        CommandResult::failure(command, &self.error_class, self.message, self.exit_code)
    }
}

/// Which tenants an operator command applies to.
#[derive(Debug, Clone)]
pub enum Target {
    Company(CompanyId),
    All,
}

impl Target {
    pub fn from_args(company: Option<String>) -> Self {
        match company {
            Some(company) => Self::Company(CompanyId(company)),
            None => Self::All,
        }
    }

    pub(crate) async fn resolve(&self, runtime: &Runtime) -> Result<Vec<CompanyId>, CommandFailure> {
        match self {
            Self::Company(company_id) => {
                if runtime
                    .store
                    .companies
                    .find(company_id)
                    .await
                    .map_err(CommandFailure::from_repository)?
                    .is_none()
                {
                    return Err(CommandFailure::from_service(ApplicationError::NotFound(format!(
                        "company `{company_id}`"
                    ))));
                }
                Ok(vec![company_id.clone()])
            }
            Self::All => {
                runtime.store.companies.list_ids().await.map_err(CommandFailure::from_repository)
            }
        }
    }
}

/// The CLI never executes actions; approvals go through the server.
struct OfflineDispatcher;

#[async_trait]
impl ActionDispatcher for OfflineDispatcher {
    async fn dispatch(
        &self,
        _company_id: &CompanyId,
        _action: &PendingAction,
    ) -> Result<ActionResult, DispatchError> {
        Err(DispatchError::NotConfigured)
    }
}

pub(crate) fn load_config(command: &str) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(command, "config_validation", format!("configuration issue: {error}"), 2)
    })
}

pub(crate) fn block_on<F: Future>(command: &str, future: F) -> Result<F::Output, CommandResult> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        )
    })?;
    Ok(runtime.block_on(future))
}

/// Connects, applies pending migrations and runs `body` against a wired
/// runtime. `body` returns the message and the `data` payload.
pub(crate) fn with_runtime<F, Fut>(command: &str, body: F) -> CommandResult
where
    F: FnOnce(Runtime) -> Fut,
    Fut: Future<Output = Result<(String, Value), CommandFailure>>,
{
    let config = match load_config(command) {
        Ok(config) => config,
        Err(result) => return result,
    };

    let outcome = block_on(command, async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| CommandFailure::new("db_connectivity", error.to_string(), 4))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| CommandFailure::new("migration", error.to_string(), 5))?;

        let runtime = Runtime::new(Store::sqlite(pool.clone()), &config, Arc::new(OfflineDispatcher));
        let outcome = body(runtime).await;
        pool.close().await;
        outcome
    });

    match outcome {
        Ok(Ok((message, data))) => CommandResult::success_with(command, message, Some(data)),
        Ok(Err(failure)) => failure.into_result(command),
        Err(result) => result,
    }
}
