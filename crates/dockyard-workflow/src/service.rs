//! Service-step dispatch: health gating, `secret.<name>` header expansion,
//! and the HTTP request itself. Grounded in
//! `everruns-core::capabilities::web_fetch`'s `reqwest::Client` usage
//! (builder with default headers/timeout, error classified into
//! timeout/connect/other) generalized from a single fetch tool call to a
//! configurable per-service-slug endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dockyard_types::error::{DockyardError, ErrorKind};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static SECRET_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*secret\.(?P<name>[A-Za-z0-9_.\-]+)\s*\}\}").unwrap());

/// Three-state health for a registered endpoint: a `Degraded` endpoint is
/// up but flagged as shaky, and only dispatches to steps that opt in via
/// `allowDegraded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointHealth {
    Healthy,
    Degraded,
    Down,
}

impl EndpointHealth {
    fn to_code(self) -> u8 {
        match self {
            EndpointHealth::Healthy => 0,
            EndpointHealth::Degraded => 1,
            EndpointHealth::Down => 2,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => EndpointHealth::Healthy,
            1 => EndpointHealth::Degraded,
            _ => EndpointHealth::Down,
        }
    }
}

/// A configured downstream collaborator a service step can target.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub base_url: String,
    health: Arc<AtomicU8>,
}

impl ServiceEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            health: Arc::new(AtomicU8::new(EndpointHealth::Healthy.to_code())),
        }
    }

    pub fn health(&self) -> EndpointHealth {
        EndpointHealth::from_code(self.health.load(Ordering::SeqCst))
    }

    pub fn set_health(&self, health: EndpointHealth) {
        self.health.store(health.to_code(), Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == EndpointHealth::Healthy
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.set_health(if healthy {
            EndpointHealth::Healthy
        } else {
            EndpointHealth::Down
        });
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Secrets available for `{{ secret.<name> }}` substitution in header
/// templates. A real deployment would back this with a vault client; this
/// is an in-memory store, sufficient for the contract the orchestrator
/// depends on.
#[derive(Debug, Clone, Default)]
pub struct SecretStore {
    values: HashMap<String, String>,
}

impl SecretStore {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn resolve(&self, name: &str) -> Result<&str, DockyardError> {
        self.values
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| DockyardError::validation(format!("unknown secret: {name}")))
    }

    /// Expand every `{{ secret.<name> }}` occurrence in `value`.
    pub fn expand(&self, value: &str) -> Result<String, DockyardError> {
        let mut err = None;
        let expanded = SECRET_PATTERN.replace_all(value, |captures: &regex::Captures| {
            match self.resolve(&captures["name"]) {
                Ok(v) => v.to_string(),
                Err(e) => {
                    err = Some(e);
                    String::new()
                }
            }
        });
        if let Some(e) = err {
            return Err(e);
        }
        Ok(expanded.into_owned())
    }
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    endpoints: DashMap<String, ServiceEndpoint>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, slug: impl Into<String>, endpoint: ServiceEndpoint) {
        self.endpoints.insert(slug.into(), endpoint);
    }

    pub fn get(&self, slug: &str) -> Option<ServiceEndpoint> {
        self.endpoints.get(slug).map(|e| e.clone())
    }
}

pub struct ServiceResponse {
    pub status: u16,
    pub headers: Value,
    pub body: Value,
}

/// Issue the HTTP request for a service step. `require_healthy` gates on
/// the registered endpoint's health flag before dispatch; a downed
/// endpoint fails fast with a `Precondition` error rather than attempting
/// the call. `allow_degraded` widens that gate: a `Degraded` endpoint
/// still dispatches, only `Down` fails fast.
pub async fn dispatch(
    client: &reqwest::Client,
    endpoint: &ServiceEndpoint,
    require_healthy: bool,
    allow_degraded: bool,
    method: &str,
    path: &str,
    query: &HashMap<String, String>,
    headers: &HashMap<String, String>,
    body: Option<&Value>,
    timeout: Duration,
    capture_response: bool,
) -> Result<ServiceResponse, DockyardError> {
    if require_healthy {
        let blocked = match endpoint.health() {
            EndpointHealth::Healthy => false,
            EndpointHealth::Degraded => !allow_degraded,
            EndpointHealth::Down => true,
        };
        if blocked {
            return Err(DockyardError::precondition(format!(
                "service endpoint unhealthy: {}",
                endpoint.base_url
            )));
        }
    }

    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| DockyardError::validation(format!("invalid HTTP method: {method}")))?;
    let mut url = format!("{}{}", endpoint.base_url.trim_end_matches('/'), path);
    if !query.is_empty() {
        let pairs: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
            .collect();
        url = format!("{url}?{}", pairs.join("&"));
    }

    let mut request = client.request(method, &url).timeout(timeout);
    for (name, value) in headers {
        request = request.header(name, value);
    }
    if let Some(body) = body {
        request = request.json(body);
    }

    let response = request.send().await.map_err(classify_reqwest_error)?;
    let status = response.status().as_u16();
    let header_map: HashMap<String, String> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    let body = if capture_response {
        response
            .json::<Value>()
            .await
            .unwrap_or(Value::Null)
    } else {
        Value::Null
    };

    Ok(ServiceResponse {
        status,
        headers: serde_json::to_value(header_map).unwrap_or(Value::Null),
        body,
    })
}

fn classify_reqwest_error(err: reqwest::Error) -> DockyardError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::RetriableIo
    };
    DockyardError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_store_expands_known_name() {
        let mut values = HashMap::new();
        values.insert("apiKey".to_string(), "sekrit".to_string());
        let store = SecretStore::new(values);
        let expanded = store.expand("Bearer {{ secret.apiKey }}").unwrap();
        assert_eq!(expanded, "Bearer sekrit");
    }

    #[test]
    fn secret_store_errors_on_unknown_name() {
        let store = SecretStore::default();
        let err = store.expand("{{ secret.missing }}").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn endpoint_health_flag_round_trips() {
        let endpoint = ServiceEndpoint::new("https://svc.internal");
        assert!(endpoint.is_healthy());
        endpoint.set_healthy(false);
        assert!(!endpoint.is_healthy());
        assert_eq!(endpoint.health(), EndpointHealth::Down);
    }

    #[test]
    fn degraded_endpoint_round_trips_independently_of_down() {
        let endpoint = ServiceEndpoint::new("https://svc.internal");
        endpoint.set_health(EndpointHealth::Degraded);
        assert!(!endpoint.is_healthy());
        assert_eq!(endpoint.health(), EndpointHealth::Degraded);
    }

    #[test]
    fn urlencode_escapes_reserved_bytes() {
        assert_eq!(urlencode("a b&c"), "a%20b%26c");
        assert_eq!(urlencode("plain-_.~value"), "plain-_.~value");
    }
}
