use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sync: SyncConfig,
    pub router: RouterConfig,
    pub governance: GovernanceConfig,
    pub scheduler: SchedulerConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub max_conflict_retries: u32,
}

#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub batch_size: u32,
    pub lease_secs: u64,
    pub worker_id: String,
}

#[derive(Clone, Debug)]
pub struct GovernanceConfig {
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_backoff_multiplier: u32,
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub route_interval_secs: u64,
    pub analytics_interval_secs: u64,
    pub max_concurrent_tenants: u32,
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub endpoint: Option<String>,
    pub api_token: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub scheduler_enabled: Option<bool>,
    pub dispatch_endpoint: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Every environment variable `AppConfig::load` reads.
pub const ENV_KEYS: &[&str] = &[
    "KURIA_DATABASE_URL",
    "KURIA_DATABASE_MAX_CONNECTIONS",
    "KURIA_DATABASE_TIMEOUT_SECS",
    "KURIA_SERVER_BIND_ADDRESS",
    "KURIA_SERVER_PORT",
    "KURIA_SERVER_GRACEFUL_SHUTDOWN_SECS",
    "KURIA_LOGGING_LEVEL",
    "KURIA_LOG_LEVEL",
    "KURIA_LOGGING_FORMAT",
    "KURIA_LOG_FORMAT",
    "KURIA_SYNC_MAX_CONFLICT_RETRIES",
    "KURIA_ROUTER_BATCH_SIZE",
    "KURIA_ROUTER_LEASE_SECS",
    "KURIA_ROUTER_WORKER_ID",
    "KURIA_GOVERNANCE_MAX_ATTEMPTS",
    "KURIA_GOVERNANCE_RETRY_BASE_DELAY_MS",
    "KURIA_GOVERNANCE_RETRY_BACKOFF_MULTIPLIER",
    "KURIA_SCHEDULER_ENABLED",
    "KURIA_SCHEDULER_ROUTE_INTERVAL_SECS",
    "KURIA_SCHEDULER_ANALYTICS_INTERVAL_SECS",
    "KURIA_SCHEDULER_MAX_CONCURRENT_TENANTS",
    "KURIA_DISPATCH_ENDPOINT",
    "KURIA_DISPATCH_API_TOKEN",
    "KURIA_DISPATCH_TIMEOUT_SECS",
];

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://kuria.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            sync: SyncConfig { max_conflict_retries: 5 },
            router: RouterConfig {
                batch_size: 100,
                lease_secs: 60,
                worker_id: "kuria-router".to_string(),
            },
            governance: GovernanceConfig {
                max_attempts: 3,
                retry_base_delay_ms: 1_000,
                retry_backoff_multiplier: 3,
            },
            scheduler: SchedulerConfig {
                enabled: true,
                route_interval_secs: 30,
                analytics_interval_secs: 3_600,
                max_concurrent_tenants: 4,
            },
            dispatch: DispatchConfig { endpoint: None, api_token: None, timeout_secs: 15 },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("kuria.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(sync) = patch.sync {
            if let Some(max_conflict_retries) = sync.max_conflict_retries {
                self.sync.max_conflict_retries = max_conflict_retries;
            }
        }

        if let Some(router) = patch.router {
            if let Some(batch_size) = router.batch_size {
                self.router.batch_size = batch_size;
            }
            if let Some(lease_secs) = router.lease_secs {
                self.router.lease_secs = lease_secs;
            }
            if let Some(worker_id) = router.worker_id {
                self.router.worker_id = worker_id;
            }
        }

        if let Some(governance) = patch.governance {
            if let Some(max_attempts) = governance.max_attempts {
                self.governance.max_attempts = max_attempts;
            }
            if let Some(retry_base_delay_ms) = governance.retry_base_delay_ms {
                self.governance.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(multiplier) = governance.retry_backoff_multiplier {
                self.governance.retry_backoff_multiplier = multiplier;
            }
        }

        if let Some(scheduler) = patch.scheduler {
            if let Some(enabled) = scheduler.enabled {
                self.scheduler.enabled = enabled;
            }
            if let Some(route_interval_secs) = scheduler.route_interval_secs {
                self.scheduler.route_interval_secs = route_interval_secs;
            }
            if let Some(analytics_interval_secs) = scheduler.analytics_interval_secs {
                self.scheduler.analytics_interval_secs = analytics_interval_secs;
            }
            if let Some(max_concurrent_tenants) = scheduler.max_concurrent_tenants {
                self.scheduler.max_concurrent_tenants = max_concurrent_tenants;
            }
        }

        if let Some(dispatch) = patch.dispatch {
            if let Some(endpoint) = dispatch.endpoint {
                self.dispatch.endpoint = Some(endpoint);
            }
            if let Some(api_token_value) = dispatch.api_token {
                self.dispatch.api_token = Some(secret_value(api_token_value));
            }
            if let Some(timeout_secs) = dispatch.timeout_secs {
                self.dispatch.timeout_secs = timeout_secs;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("KURIA_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("KURIA_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("KURIA_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("KURIA_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("KURIA_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("KURIA_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("KURIA_SERVER_PORT") {
            self.server.port = parse_u16("KURIA_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("KURIA_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("KURIA_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("KURIA_LOGGING_LEVEL").or_else(|| read_env("KURIA_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format = read_env("KURIA_LOGGING_FORMAT").or_else(|| read_env("KURIA_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        if let Some(value) = read_env("KURIA_SYNC_MAX_CONFLICT_RETRIES") {
            self.sync.max_conflict_retries = parse_u32("KURIA_SYNC_MAX_CONFLICT_RETRIES", &value)?;
        }

        if let Some(value) = read_env("KURIA_ROUTER_BATCH_SIZE") {
            self.router.batch_size = parse_u32("KURIA_ROUTER_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("KURIA_ROUTER_LEASE_SECS") {
            self.router.lease_secs = parse_u64("KURIA_ROUTER_LEASE_SECS", &value)?;
        }
        if let Some(value) = read_env("KURIA_ROUTER_WORKER_ID") {
            self.router.worker_id = value;
        }

        if let Some(value) = read_env("KURIA_GOVERNANCE_MAX_ATTEMPTS") {
            self.governance.max_attempts = parse_u32("KURIA_GOVERNANCE_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("KURIA_GOVERNANCE_RETRY_BASE_DELAY_MS") {
            self.governance.retry_base_delay_ms =
                parse_u64("KURIA_GOVERNANCE_RETRY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("KURIA_GOVERNANCE_RETRY_BACKOFF_MULTIPLIER") {
            self.governance.retry_backoff_multiplier =
                parse_u32("KURIA_GOVERNANCE_RETRY_BACKOFF_MULTIPLIER", &value)?;
        }

        if let Some(value) = read_env("KURIA_SCHEDULER_ENABLED") {
            self.scheduler.enabled = parse_bool("KURIA_SCHEDULER_ENABLED", &value)?;
        }
        if let Some(value) = read_env("KURIA_SCHEDULER_ROUTE_INTERVAL_SECS") {
            self.scheduler.route_interval_secs =
                parse_u64("KURIA_SCHEDULER_ROUTE_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("KURIA_SCHEDULER_ANALYTICS_INTERVAL_SECS") {
            self.scheduler.analytics_interval_secs =
                parse_u64("KURIA_SCHEDULER_ANALYTICS_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("KURIA_SCHEDULER_MAX_CONCURRENT_TENANTS") {
            self.scheduler.max_concurrent_tenants =
                parse_u32("KURIA_SCHEDULER_MAX_CONCURRENT_TENANTS", &value)?;
        }

        if let Some(value) = read_env("KURIA_DISPATCH_ENDPOINT") {
            self.dispatch.endpoint = Some(value);
        }
        if let Some(value) = read_env("KURIA_DISPATCH_API_TOKEN") {
            self.dispatch.api_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("KURIA_DISPATCH_TIMEOUT_SECS") {
            self.dispatch.timeout_secs = parse_u64("KURIA_DISPATCH_TIMEOUT_SECS", &value)?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(enabled) = overrides.scheduler_enabled {
            self.scheduler.enabled = enabled;
        }
        if let Some(endpoint) = overrides.dispatch_endpoint {
            self.dispatch.endpoint = Some(endpoint);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        validate_sync(&self.sync)?;
        validate_router(&self.router)?;
        validate_governance(&self.governance)?;
        validate_scheduler(&self.scheduler)?;
        validate_dispatch(&self.dispatch)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("kuria.toml"), PathBuf::from("config/kuria.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_sync(sync: &SyncConfig) -> Result<(), ConfigError> {
    if sync.max_conflict_retries == 0 || sync.max_conflict_retries > 50 {
        return Err(ConfigError::Validation(
            "sync.max_conflict_retries must be in range 1..=50".to_string(),
        ));
    }
    Ok(())
}

fn validate_router(router: &RouterConfig) -> Result<(), ConfigError> {
    if router.batch_size == 0 || router.batch_size > 10_000 {
        return Err(ConfigError::Validation(
            "router.batch_size must be in range 1..=10000".to_string(),
        ));
    }
    if router.lease_secs == 0 {
        return Err(ConfigError::Validation(
            "router.lease_secs must be greater than zero".to_string(),
        ));
    }
    if router.worker_id.trim().is_empty() {
        return Err(ConfigError::Validation("router.worker_id must not be empty".to_string()));
    }
    Ok(())
}

fn validate_governance(governance: &GovernanceConfig) -> Result<(), ConfigError> {
    if governance.max_attempts == 0 || governance.max_attempts > 10 {
        return Err(ConfigError::Validation(
            "governance.max_attempts must be in range 1..=10".to_string(),
        ));
    }
    if governance.retry_backoff_multiplier == 0 {
        return Err(ConfigError::Validation(
            "governance.retry_backoff_multiplier must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_scheduler(scheduler: &SchedulerConfig) -> Result<(), ConfigError> {
    if scheduler.route_interval_secs == 0 || scheduler.analytics_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "scheduler intervals must be greater than zero".to_string(),
        ));
    }
    if scheduler.max_concurrent_tenants == 0 {
        return Err(ConfigError::Validation(
            "scheduler.max_concurrent_tenants must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_dispatch(dispatch: &DispatchConfig) -> Result<(), ConfigError> {
    if let Some(endpoint) = &dispatch.endpoint {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ConfigError::Validation(
                "dispatch.endpoint must start with http:// or https://".to_string(),
            ));
        }
    }
    if dispatch.timeout_secs == 0 || dispatch.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "dispatch.timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
    sync: Option<SyncPatch>,
    router: Option<RouterPatch>,
    governance: Option<GovernancePatch>,
    scheduler: Option<SchedulerPatch>,
    dispatch: Option<DispatchPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct SyncPatch {
    max_conflict_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RouterPatch {
    batch_size: Option<u32>,
    lease_secs: Option<u64>,
    worker_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GovernancePatch {
    max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_backoff_multiplier: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct SchedulerPatch {
    enabled: Option<bool>,
    route_interval_secs: Option<u64>,
    analytics_interval_secs: Option<u64>,
    max_concurrent_tenants: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DispatchPatch {
    endpoint: Option<String>,
    api_token: Option<String>,
    timeout_secs: Option<u64>,
}
