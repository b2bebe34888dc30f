//! Simulator client interface and its BOPTEST-style HTTP implementation

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use errors::{SyncError, SyncResult};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::settings::SimulatorSettings;

/// Unit and range of one simulator signal
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SignalMetadata {
    #[serde(rename = "Unit", alias = "unit", default)]
    pub unit: Option<String>,
    #[serde(rename = "Minimum", alias = "min", default)]
    pub min: Option<f64>,
    #[serde(rename = "Maximum", alias = "max", default)]
    pub max: Option<f64>,
}

pub type MetadataMap = HashMap<String, SignalMetadata>;
pub type SignalMap = HashMap<String, f64>;

/// Black-box simulation engine
#[async_trait]
pub trait SimulatorClient: Send + Sync {
    /// Metadata for every input and measurement signal
    async fn get_metadata(&self) -> SyncResult<MetadataMap>;

    /// Start the simulation at `start_time` (Unix seconds) after a warmup
    async fn initialize(&self, start_time: f64, warmup_period: f64) -> SyncResult<SignalMap>;

    async fn set_step_time(&self, seconds: f64) -> SyncResult<()>;

    /// Advance one step with the given control inputs; returns the outputs
    async fn advance(&self, control_inputs: &SignalMap) -> SyncResult<SignalMap>;

    async fn get_kpis(&self) -> SyncResult<SignalMap>;
}

/// HTTP client for a BOPTEST-compatible simulator
#[derive(Debug, Clone)]
pub struct BoptestClient {
    base_url: String,
    http: reqwest::Client,
    /// Test id returned by test-case selection; scopes every later call
    test_id: Option<String>,
}

impl BoptestClient {
    pub fn new(settings: &SimulatorSettings) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build simulator HTTP client: {}", e)))?;
        Ok(Self {
            base_url: settings.url.trim_end_matches('/').to_string(),
            http,
            test_id: None,
        })
    }

    /// Select a test case; all further requests go to the returned test id
    pub async fn select_test_case(&mut self, name: &str) -> SyncResult<String> {
        let url = format!("{}/testcases/{}/select", self.base_url, name);
        let reply = self.send(reqwest::Method::POST, &url, None).await?;
        let test_id = reply
            .get("testid")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Simulator(format!("no testid in selection reply for {}", name)))?
            .to_string();
        info!("Selected test case {} (test id {})", name, test_id);
        self.test_id = Some(test_id.clone());
        Ok(test_id)
    }

    fn endpoint(&self, name: &str) -> String {
        match &self.test_id {
            Some(id) => format!("{}/{}/{}", self.base_url, name, id),
            None => format!("{}/{}", self.base_url, name),
        }
    }

    async fn send(&self, method: reqwest::Method, url: &str, body: Option<Value>) -> SyncResult<Value> {
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Simulator(format!("{}: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::Simulator(format!("{}: HTTP {}: {}", url, status.as_u16(), text)));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| SyncError::Simulator(format!("{}: invalid JSON: {}", url, e)))
    }

    async fn payload(&self, method: reqwest::Method, name: &str, body: Option<Value>) -> SyncResult<Value> {
        let url = self.endpoint(name);
        let reply = self.send(method, &url, body).await?;
        Ok(reply.get("payload").cloned().unwrap_or(Value::Null))
    }
}

/// Keep the numeric entries of a payload object
pub fn numeric_signals(payload: &Value) -> SignalMap {
    payload
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                .collect()
        })
        .unwrap_or_default()
}

fn metadata_map(payload: &Value) -> MetadataMap {
    payload
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| {
                    serde_json::from_value::<SignalMetadata>(v.clone())
                        .ok()
                        .map(|m| (k.clone(), m))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl SimulatorClient for BoptestClient {
    async fn get_metadata(&self) -> SyncResult<MetadataMap> {
        let inputs = self.payload(reqwest::Method::GET, "inputs", None).await?;
        let measurements = self.payload(reqwest::Method::GET, "measurements", None).await?;
        let mut metadata = metadata_map(&inputs);
        metadata.extend(metadata_map(&measurements));
        debug!("Simulator exposes {} signals", metadata.len());
        Ok(metadata)
    }

    async fn initialize(&self, start_time: f64, warmup_period: f64) -> SyncResult<SignalMap> {
        let body = json!({ "start_time": start_time, "warmup_period": warmup_period });
        let payload = self.payload(reqwest::Method::PUT, "initialize", Some(body)).await?;
        info!("Simulator initialized at {} (warmup {} s)", start_time, warmup_period);
        Ok(numeric_signals(&payload))
    }

    async fn set_step_time(&self, seconds: f64) -> SyncResult<()> {
        self.payload(reqwest::Method::PUT, "step", Some(json!({ "step": seconds })))
            .await?;
        info!("Simulator step set to {} s", seconds);
        Ok(())
    }

    async fn advance(&self, control_inputs: &SignalMap) -> SyncResult<SignalMap> {
        let body = serde_json::to_value(control_inputs)?;
        let payload = self.payload(reqwest::Method::POST, "advance", Some(body)).await?;
        Ok(numeric_signals(&payload))
    }

    async fn get_kpis(&self) -> SyncResult<SignalMap> {
        let payload = self.payload(reqwest::Method::GET, "kpi", None).await?;
        Ok(numeric_signals(&payload))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_numeric_signals_skip_non_numbers() {
        let payload = json!({"TZon": 294.1, "name": "ahu", "ok": true, "q": null, "n": 3});
        let signals = numeric_signals(&payload);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals["TZon"], 294.1);
        assert_eq!(signals["n"], 3.0);
    }

    #[test]
    fn test_metadata_parsing() {
        let payload = json!({
            "hvac_reaAhu_TSup_y": {"Unit": "K", "Minimum": null, "Maximum": null, "Description": "supply"},
            "oveDamper_u": {"Unit": "1", "Minimum": 0.0, "Maximum": 1.0}
        });
        let metadata = metadata_map(&payload);
        assert_eq!(metadata["hvac_reaAhu_TSup_y"].unit.as_deref(), Some("K"));
        assert_eq!(metadata["oveDamper_u"].max, Some(1.0));
    }

    #[test]
    fn test_endpoint_scoped_by_test_id() {
        let mut client = BoptestClient::new(&SimulatorSettings::default()).unwrap();
        assert_eq!(client.endpoint("advance"), "http://127.0.0.1:5000/advance");
        client.test_id = Some("abc".to_string());
        assert_eq!(client.endpoint("advance"), "http://127.0.0.1:5000/advance/abc");
    }
}
