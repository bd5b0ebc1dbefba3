//! `call_api`: outbound HTTP calls to services declared in the tenant config.
//!
//! ```yaml
//! config:
//!   services:
//!     weather:
//!       base_url: https://api.example.com/v1
//!       auth: { type: bearer, token: "..." }
//! ```

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::registry::{Capability, InvocationContext, required_str};
use super::schema::{ParameterSchema, PropertySchema};
use super::value::{ToolArguments, ToolValue};
use crate::error::{CoreError, CoreResult};

pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("assistant-orchestrator/", env!("CARGO_PKG_VERSION"));
const METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceAuth {
    Bearer {
        token: String,
    },
    ApiKey {
        api_key: String,
        #[serde(default)]
        header: Option<String>,
    },
    Basic {
        username: String,
        password: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceConfig {
    pub base_url: String,
    #[serde(default)]
    pub auth: Option<ServiceAuth>,
}

impl ServiceConfig {
    /// Join `path` onto the base URL with exactly one slash between them.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone)]
pub struct CallApi {
    http: reqwest::Client,
    services: BTreeMap<String, ServiceConfig>,
}

/// Scalar query values as they appear in a URL.
fn query_value(value: &ToolValue) -> String {
    match value {
        ToolValue::String(s) => s.clone(),
        other => other.to_json().to_string(),
    }
}

impl CallApi {
    pub fn new(services: BTreeMap<String, ServiceConfig>) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CoreError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, services })
    }

    /// Read `services` from a tenant's config map. A missing section means no
    /// services; a malformed one is a configuration error.
    pub fn from_tenant_config(config: &serde_json::Map<String, serde_json::Value>) -> CoreResult<Self> {
        let services = match config.get("services") {
            Some(raw) => serde_json::from_value(raw.clone())
                .map_err(|e| CoreError::Config(format!("invalid services configuration: {e}")))?,
            None => BTreeMap::new(),
        };
        Self::new(services)
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }
}

#[async_trait]
impl Capability for CallApi {
    fn name(&self) -> &str {
        "call_api"
    }

    fn description(&self) -> &str {
        "Call an external HTTP API that is configured for this account."
    }

    fn schema(&self) -> ParameterSchema {
        ParameterSchema::new()
            .required(
                "service_name",
                PropertySchema::string().describe("Name of the external service configured for this tenant"),
            )
            .required(
                "method",
                PropertySchema::string().describe("HTTP method to use").one_of(&METHODS),
            )
            .required(
                "path",
                PropertySchema::string().describe("API endpoint path (relative to service base URL)"),
            )
            .optional("headers", PropertySchema::object().describe("Additional headers to send (optional)"))
            .optional("query", PropertySchema::object().describe("Query parameters (optional)"))
            .optional("body", PropertySchema::object().describe("Request body for POST/PUT/PATCH (optional)"))
    }

    async fn invoke(&self, ctx: &InvocationContext, args: ToolArguments) -> CoreResult<serde_json::Value> {
        let start = Instant::now();
        let service_name = required_str(&args, "service_name")?;
        let method = required_str(&args, "method")?;
        let path = required_str(&args, "path")?;

        let service = self.services.get(service_name).ok_or_else(|| {
            CoreError::not_found("service", format!("{service_name} (not configured for tenant {})", ctx.tenant_id))
        })?;

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| CoreError::Config(format!("invalid HTTP method: {e}")))?;

        let mut url = url::Url::parse(&service.endpoint(path))
            .map_err(|e| CoreError::Config(format!("invalid URL for service {service_name}: {e}")))?;
        if let Some(query) = args.get_object("query") {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, &query_value(value));
            }
        }

        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .header(reqwest::header::ACCEPT, "application/json");

        let sends_body = matches!(method, reqwest::Method::POST | reqwest::Method::PUT | reqwest::Method::PATCH);
        if let Some(body) = args.get("body").filter(|_| sends_body) {
            request = request.json(&body.to_json());
        }

        if let Some(headers) = args.get_object("headers") {
            for (key, value) in headers {
                request = request.header(key.as_str(), query_value(value));
            }
        }

        request = match &service.auth {
            Some(ServiceAuth::Bearer { token }) => request.bearer_auth(token),
            Some(ServiceAuth::ApiKey { api_key, header }) => {
                request.header(header.as_deref().unwrap_or("X-API-Key"), api_key)
            }
            Some(ServiceAuth::Basic { username, password }) => request.basic_auth(username, Some(password)),
            None => request,
        };

        debug!(service = %service_name, method = %method, url = %url, "making HTTP API call");

        let response = request.send().await.map_err(|e| {
            warn!(service = %service_name, error = %e, "HTTP API call failed");
            CoreError::StorageUnavailable(format!("HTTP request to {service_name} failed: {e}"))
        })?;

        let status = response.status();
        let headers: serde_json::Map<String, serde_json::Value> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), json!(v))))
            .collect();
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));

        let raw = response
            .text()
            .await
            .map_err(|e| CoreError::StorageUnavailable(format!("failed to read response body: {e}")))?;
        let body = if raw.is_empty() {
            serde_json::Value::Null
        } else if is_json {
            serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
        } else {
            serde_json::Value::String(raw)
        };

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;
        if status.is_success() {
            debug!(service = %service_name, status = status.as_u16(), duration_ms, "HTTP API call successful");
        } else {
            warn!(service = %service_name, status = status.as_u16(), duration_ms, "HTTP API call returned error status");
        }

        Ok(json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
            "duration": duration_ms,
            "request": {
                "method": method.as_str(),
                "url": url.as_str(),
                "service": service_name,
            },
        }))
    }
}
