use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use kuria_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

/// One rendered key: dotted path, effective value and the env vars that can
/// set it, first match wins.
struct Field {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

fn field(key: &'static str, value: impl ToString, env_keys: &'static [&'static str]) -> Field {
    Field { key, value: value.to_string(), env_keys }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let endpoint = config.dispatch.endpoint.as_deref().unwrap_or("<unset>");
    let api_token = config
        .dispatch
        .api_token
        .as_ref()
        .map(|token| redact_token(token.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());

    vec![
        field("database.url", &config.database.url, &["KURIA_DATABASE_URL"]),
        field(
            "database.max_connections",
            config.database.max_connections,
            &["KURIA_DATABASE_MAX_CONNECTIONS"],
        ),
        field("database.timeout_secs", config.database.timeout_secs, &["KURIA_DATABASE_TIMEOUT_SECS"]),
        field("server.bind_address", &config.server.bind_address, &["KURIA_SERVER_BIND_ADDRESS"]),
        field("server.port", config.server.port, &["KURIA_SERVER_PORT"]),
        field(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs,
            &["KURIA_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        ),
        field("logging.level", &config.logging.level, &["KURIA_LOGGING_LEVEL", "KURIA_LOG_LEVEL"]),
        field(
            "logging.format",
            config.logging.format.as_str(),
            &["KURIA_LOGGING_FORMAT", "KURIA_LOG_FORMAT"],
        ),
        field(
            "sync.max_conflict_retries",
            config.sync.max_conflict_retries,
            &["KURIA_SYNC_MAX_CONFLICT_RETRIES"],
        ),
        field("router.batch_size", config.router.batch_size, &["KURIA_ROUTER_BATCH_SIZE"]),
        field("router.lease_secs", config.router.lease_secs, &["KURIA_ROUTER_LEASE_SECS"]),
        field("router.worker_id", &config.router.worker_id, &["KURIA_ROUTER_WORKER_ID"]),
        field(
            "governance.max_attempts",
            config.governance.max_attempts,
            &["KURIA_GOVERNANCE_MAX_ATTEMPTS"],
        ),
        field(
            "governance.retry_base_delay_ms",
            config.governance.retry_base_delay_ms,
            &["KURIA_GOVERNANCE_RETRY_BASE_DELAY_MS"],
        ),
        field(
            "governance.retry_backoff_multiplier",
            config.governance.retry_backoff_multiplier,
            &["KURIA_GOVERNANCE_RETRY_BACKOFF_MULTIPLIER"],
        ),
        field("scheduler.enabled", config.scheduler.enabled, &["KURIA_SCHEDULER_ENABLED"]),
        field(
            "scheduler.route_interval_secs",
            config.scheduler.route_interval_secs,
            &["KURIA_SCHEDULER_ROUTE_INTERVAL_SECS"],
        ),
        field(
            "scheduler.analytics_interval_secs",
            config.scheduler.analytics_interval_secs,
            &["KURIA_SCHEDULER_ANALYTICS_INTERVAL_SECS"],
        ),
        field(
            "scheduler.max_concurrent_tenants",
            config.scheduler.max_concurrent_tenants,
            &["KURIA_SCHEDULER_MAX_CONCURRENT_TENANTS"],
        ),
        field("dispatch.endpoint", endpoint, &["KURIA_DISPATCH_ENDPOINT"]),
        field("dispatch.api_token", api_token, &["KURIA_DISPATCH_API_TOKEN"]),
        field("dispatch.timeout_secs", config.dispatch.timeout_secs, &["KURIA_DISPATCH_TIMEOUT_SECS"]),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("kuria.toml"), PathBuf::from("config/kuria.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|env_key| env::var_os(env_key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a short prefix so operators can tell tokens apart.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }
    "<redacted>".to_string()
}
