// src/registry_client.rs
use crate::config::RegistryConfig;
use crate::error::{Result, WatchError};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// A key-value entry together with the registry's per-key version counter.
#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    pub value: ConfigMap,
    pub modify_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceDefinition {
    pub key: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: BTreeSet<String>,
    pub meta: BTreeMap<String, String>,
}

impl ServiceDefinition {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            key,
            ..Default::default()
        }
    }

    /// True when address, port, tags or meta differ. The registry keeps no
    /// modify index for service entries, so this is the change detector.
    pub fn content_differs(&self, other: &ServiceDefinition) -> bool {
        self.address != other.address
            || self.port != other.port
            || self.tags != other.tags
            || self.meta != other.meta
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
    Maintenance,
    Unknown(String),
}

impl HealthStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "passing" => HealthStatus::Passing,
            "warning" => HealthStatus::Warning,
            "critical" => HealthStatus::Critical,
            "maintenance" => HealthStatus::Maintenance,
            other => HealthStatus::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Passing => write!(f, "passing"),
            HealthStatus::Warning => write!(f, "warning"),
            HealthStatus::Critical => write!(f, "critical"),
            HealthStatus::Maintenance => write!(f, "maintenance"),
            HealthStatus::Unknown(raw) => write!(f, "unknown({})", raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub check_id: String,
    pub name: String,
    pub status: HealthStatus,
    pub output: String,
}

/// What a service fetch returns: the registered definition and its health.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceState {
    pub definition: ServiceDefinition,
    pub health: HealthStatus,
    pub checks: Vec<HealthCheck>,
}

impl ServiceState {
    pub fn passing(definition: ServiceDefinition) -> Self {
        Self {
            definition,
            health: HealthStatus::Passing,
            checks: Vec::new(),
        }
    }
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Reads the value stored at `path`. `last_index` is the modify index the
    /// caller already holds; clients may use it for a blocking read.
    async fn fetch_kv(&self, path: &str, last_index: Option<u64>) -> Result<Option<KvEntry>>;

    async fn fetch_service(&self, service_key: &str) -> Result<Option<ServiceState>>;

    /// Writes `value` at `path`. With `cas` set the write only succeeds if the
    /// key is still at that modify index (0 = key must not exist).
    async fn put_kv(&self, path: &str, value: &ConfigMap, cas: Option<u64>) -> Result<bool>;

    /// Removes the value at `path`, or every key under it with `recurse`.
    /// Deleting a missing key succeeds.
    async fn delete_kv(&self, path: &str, recurse: bool) -> Result<bool>;

    /// Registers `definition` with the local agent, replacing any entry with
    /// the same key.
    async fn register_service(&self, definition: &ServiceDefinition) -> Result<()>;

    /// Re-registers an existing service. The agent treats registration as an
    /// upsert, so this is a plain register by default.
    async fn update_service(&self, definition: &ServiceDefinition) -> Result<()> {
        self.register_service(definition).await
    }

    /// Returns false if no service with `service_key` was registered.
    async fn deregister_service(&self, service_key: &str) -> Result<bool>;

    /// Overlays the top-level keys of `partial` onto the stored value.
    async fn merge_kv(&self, path: &str, partial: &ConfigMap) -> Result<bool> {
        let current = self.fetch_kv(path, None).await?;
        let (mut merged, cas) = match current {
            Some(entry) => (entry.value, entry.modify_index),
            None => (ConfigMap::new(), 0),
        };
        merge_config(&mut merged, partial);
        self.put_kv(path, &merged, Some(cas)).await
    }
}

pub fn merge_config(base: &mut ConfigMap, partial: &ConfigMap) {
    for (key, value) in partial {
        base.insert(key.clone(), value.clone());
    }
}

pub fn parse_kv_value(payload: &[u8]) -> Result<ConfigMap> {
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| WatchError::Decode(format!("KV value is not valid JSON: {}", e)))?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(WatchError::Decode(format!(
            "KV value must be a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentHealthResponse {
    aggregated_status: String,
    service: AgentService,
    #[serde(default)]
    checks: Option<Vec<AgentCheck>>,
}

#[derive(Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service", default)]
    service: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<String>>,
    #[serde(rename = "Meta", default)]
    meta: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
struct AgentCheck {
    #[serde(rename = "CheckID", default)]
    check_id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Output", default)]
    output: String,
}

/// Body of an agent service registration.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    tags: Vec<&'a str>,
    meta: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a ServiceDefinition> for ServiceRegistration<'a> {
    fn from(definition: &'a ServiceDefinition) -> Self {
        let name = if definition.name.is_empty() {
            definition.key.as_str()
        } else {
            definition.name.as_str()
        };
        Self {
            id: &definition.key,
            name,
            address: Some(definition.address.as_str()).filter(|a| !a.is_empty()),
            port: (definition.port != 0).then_some(definition.port),
            tags: definition.tags.iter().map(String::as_str).collect(),
            meta: &definition.meta,
        }
    }
}

pub fn parse_service_health(payload: &[u8]) -> Result<ServiceState> {
    let response: AgentHealthResponse = serde_json::from_slice(payload)
        .map_err(|e| WatchError::Decode(format!("Invalid service health payload: {}", e)))?;
    let service = response.service;
    let definition = ServiceDefinition {
        key: service.id,
        name: service.service,
        address: service.address,
        port: service.port,
        tags: service.tags.unwrap_or_default().into_iter().collect(),
        meta: service.meta.unwrap_or_default(),
    };
    let checks = response
        .checks
        .unwrap_or_default()
        .into_iter()
        .map(|c| HealthCheck {
            check_id: c.check_id,
            name: c.name,
            status: HealthStatus::parse(&c.status),
            output: c.output,
        })
        .collect();
    Ok(ServiceState {
        definition,
        health: HealthStatus::parse(&response.aggregated_status),
        checks,
    })
}

/// HTTP client for a Consul-compatible registry.
pub struct ConsulClient {
    http_client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
    blocking_wait: Option<Duration>,
}

impl ConsulClient {
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        let base_url = config.base_url();
        info!("Using registry endpoint: {}", base_url);
        let http_client = reqwest::Client::builder()
            .user_agent("registry-watcher/0.1.0")
            .build()
            .map_err(|e| WatchError::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            base_url,
            token: config.token.clone().filter(|t| !t.is_empty()),
            request_timeout: config.request_timeout(),
            blocking_wait: config.blocking_wait(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http_client
            .request(method, url)
            .timeout(self.request_timeout);
        match &self.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response> {
        builder
            .send()
            .await
            .map_err(|e| WatchError::Http(format!("HTTP request to {} failed: {}", url, e)))
    }

    /// Reads the `true`/`false` body the KV endpoints answer writes with.
    async fn bool_body(resp: reqwest::Response, url: &str) -> Result<bool> {
        let body = resp
            .text()
            .await
            .map_err(|e| WatchError::Http(format!("Failed to read body from {}: {}", url, e)))?;
        match body.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(WatchError::Decode(format!(
                "Unexpected KV write response from {}: {}",
                url, other
            ))),
        }
    }

    async fn unexpected_status(resp: reqwest::Response, url: &str) -> WatchError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        WatchError::Http(format!("HTTP {} returned status {}: {}", url, status, body))
    }
}

#[async_trait]
impl RegistryClient for ConsulClient {
    async fn fetch_kv(&self, path: &str, last_index: Option<u64>) -> Result<Option<KvEntry>> {
        let url = self.url(&format!("kv/{}", path));
        let mut builder = self.request(reqwest::Method::GET, &url).query(&[("raw", "")]);
        if let (Some(wait), Some(index)) = (self.blocking_wait, last_index) {
            debug!("Blocking read of {} from index {} for {:?}", path, index, wait);
            builder = builder
                .query(&[("index", index.to_string()), ("wait", format!("{}s", wait.as_secs()))])
                .timeout(self.request_timeout + wait);
        }

        let resp = self.send(builder, &url).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::unexpected_status(resp, &url).await);
        }

        let modify_index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                WatchError::Decode(format!("Response from {} carries no {} header", url, INDEX_HEADER))
            })?;
        let payload = resp
            .bytes()
            .await
            .map_err(|e| WatchError::Http(format!("Failed to read body from {}: {}", url, e)))?;
        let value = parse_kv_value(&payload)?;
        Ok(Some(KvEntry {
            value,
            modify_index,
        }))
    }

    async fn fetch_service(&self, service_key: &str) -> Result<Option<ServiceState>> {
        let url = self.url(&format!("agent/health/service/id/{}", service_key));
        let resp = self.send(self.request(reqwest::Method::GET, &url), &url).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            // Warning and critical health are reported through 429 and 503.
            StatusCode::OK | StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                let payload = resp.bytes().await.map_err(|e| {
                    WatchError::Http(format!("Failed to read body from {}: {}", url, e))
                })?;
                parse_service_health(&payload).map(Some)
            }
            _ => Err(Self::unexpected_status(resp, &url).await),
        }
    }

    async fn put_kv(&self, path: &str, value: &ConfigMap, cas: Option<u64>) -> Result<bool> {
        let url = self.url(&format!("kv/{}", path));
        let mut builder = self.request(reqwest::Method::PUT, &url).json(value);
        if let Some(index) = cas {
            builder = builder.query(&[("cas", index.to_string())]);
        }
        let resp = self.send(builder, &url).await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected_status(resp, &url).await);
        }
        Self::bool_body(resp, &url).await
    }

    async fn delete_kv(&self, path: &str, recurse: bool) -> Result<bool> {
        let url = self.url(&format!("kv/{}", path));
        let mut builder = self.request(reqwest::Method::DELETE, &url);
        if recurse {
            builder = builder.query(&[("recurse", "")]);
        }
        let resp = self.send(builder, &url).await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected_status(resp, &url).await);
        }
        Self::bool_body(resp, &url).await
    }

    async fn register_service(&self, definition: &ServiceDefinition) -> Result<()> {
        let url = self.url("agent/service/register");
        let payload = ServiceRegistration::from(definition);
        let builder = self.request(reqwest::Method::PUT, &url).json(&payload);
        let resp = self.send(builder, &url).await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected_status(resp, &url).await);
        }
        debug!("Registered service '{}'", definition.key);
        Ok(())
    }

    async fn deregister_service(&self, service_key: &str) -> Result<bool> {
        let url = self.url(&format!("agent/service/deregister/{}", service_key));
        let resp = self.send(self.request(reqwest::Method::PUT, &url), &url).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => {
                debug!("Deregistered service '{}'", service_key);
                Ok(true)
            }
            _ => Err(Self::unexpected_status(resp, &url).await),
        }
    }
}
