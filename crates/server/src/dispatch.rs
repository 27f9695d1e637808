//! Forwards approved actions to the connector gateway over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use kuria_core::config::DispatchConfig;
use kuria_core::domain::action::{ActionResult, PendingAction};
use kuria_core::domain::company::CompanyId;
use kuria_runtime::{ActionDispatcher, DispatchError};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Body posted to the gateway for one attempt.
#[derive(Debug, Serialize)]
struct DispatchRequest<'a> {
    company_id: &'a str,
    action_id: &'a str,
    action_type: String,
    level: &'static str,
    agent: &'a str,
    payload: Value,
    idempotency_key: Option<&'a str>,
}

pub struct HttpDispatcher {
    client: Client,
    endpoint: Option<String>,
    api_token: Option<SecretString>,
}

impl HttpDispatcher {
    pub fn from_config(config: &DispatchConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(config.timeout_secs.max(1))).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone().filter(|endpoint| !endpoint.trim().is_empty()),
            api_token: config.api_token.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }
}

#[async_trait]
impl ActionDispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        company_id: &CompanyId,
        action: &PendingAction,
    ) -> Result<ActionResult, DispatchError> {
        let endpoint = self.endpoint.as_deref().ok_or(DispatchError::NotConfigured)?;
        let (action_type, payload) = action
            .payload
            .to_parts()
            .map_err(|error| DispatchError::Failed(format!("payload could not be encoded: {error}")))?;
        let body = DispatchRequest {
            company_id: &company_id.0,
            action_id: &action.id.0,
            action_type,
            level: action.level.as_str(),
            agent: &action.agent,
            payload,
            idempotency_key: action.idempotency_key.as_deref(),
        };

        let mut request = self.client.post(endpoint).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token.expose_secret());
        }
        let response =
            request.send().await.map_err(|error| DispatchError::Failed(error.to_string()))?;

        let status = response.status();
        let text = response.text().await.map_err(|error| DispatchError::Failed(error.to_string()))?;
        debug!(
            event_name = "dispatch.response",
            company_id = %company_id,
            action_id = %action.id,
            status = status.as_u16(),
            "gateway responded"
        );
        if !status.is_success() {
            return Err(DispatchError::Failed(format!("gateway returned {status}: {}", text.trim())));
        }

        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(ActionResult::from_value(value))
    }
}
