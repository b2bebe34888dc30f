//! Shared fixtures for the device protocol tests

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::{json, Value};
use syncsrv::config::{EquipmentConfig, PointConfig};
use syncsrv::device::{DeviceClientOptions, RetryPolicy};
use syncsrv::point::ObjectType;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const TIME_PATH: &str = "/api/rest/v2/services/platform/time";
pub const NTP_PATH: &str = "/api/rest/v2/services/platform/time/ntp";
pub const OBJECTS_PATH: &str = "/api/rest/v2/services/bacnet/local/objects";
pub const BATCH_PATH: &str = "/api/rest/v2/batch";

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

pub fn options() -> DeviceClientOptions {
    DeviceClientOptions {
        username: "admin".to_string(),
        password: "secret".to_string(),
        scheme: "http".to_string(),
        accept_invalid_certs: false,
        request_timeout: Duration::from_secs(2),
        retry: fast_retry(3),
        auth_retry: fast_retry(2),
    }
}

pub fn host(server: &MockServer) -> String {
    server.address().to_string()
}

pub fn point(sim: &str, dev: &str, object_type: ObjectType) -> PointConfig {
    PointConfig {
        simulator_name: sim.to_string(),
        device_name: dev.to_string(),
        object_type,
        unit: None,
        si_unit: None,
        us_unit: None,
        convert_to_us: false,
        priority: None,
        threshold: None,
        override_point: None,
        activate: false,
    }
}

pub fn equipment(name: &str, server: &MockServer, points: Vec<PointConfig>) -> EquipmentConfig {
    EquipmentConfig {
        equipment_name: name.to_string(),
        device_ip: host(server),
        points,
    }
}

/// Enumeration reply exposing `objects` as (type, name, instance)
pub fn enumeration(objects: &[(ObjectType, &str, u32)]) -> Value {
    let mut groups = serde_json::Map::new();
    for (object_type, name, instance) in objects {
        let group = groups
            .entry(object_type.url_segment().to_string())
            .or_insert_with(|| json!({}));
        group[instance.to_string()] = json!({
            "object-name": name,
            "object-identifier": {
                "object-type": object_type.url_segment().trim_end_matches('s'),
                "object-instance": instance
            }
        });
    }
    Value::Object(groups)
}

pub async fn mount_login(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(TIME_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Set-Cookie", "session=abc123; Path=/; HttpOnly")
                .set_body_json(json!({"date-time": "2024-01-15T07:00:00"})),
        )
        .mount(server)
        .await;
}

pub async fn mount_enumeration(server: &MockServer, objects: &[(ObjectType, &str, u32)]) {
    Mock::given(method("GET"))
        .and(path(OBJECTS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(enumeration(objects)))
        .mount(server)
        .await;
}

pub async fn mount_out_of_service(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path_regex(r"/out-of-service$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": true})))
        .mount(server)
        .await;
}

/// Answers every batch entry by id: 200 unless listed in `fail`, reads
/// return the configured value
#[derive(Default, Clone)]
pub struct BatchResponder {
    pub fail: HashMap<String, u16>,
    pub values: HashMap<String, Value>,
}

impl BatchResponder {
    pub fn failing(mut self, id: &str, status: u16) -> Self {
        self.fail.insert(id.to_string(), status);
        self
    }

    pub fn value(mut self, id: &str, value: Value) -> Self {
        self.values.insert(id.to_string(), value);
        self
    }
}

impl Respond for BatchResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let responses: Vec<Value> = body["requests"]
            .as_array()
            .map(|requests| {
                requests
                    .iter()
                    .map(|entry| {
                        let id = entry["id"].as_str().unwrap_or_default();
                        match self.fail.get(id) {
                            Some(status) => json!({"id": id, "status": status, "body": {"error": "rejected"}}),
                            None => match self.values.get(id) {
                                Some(value) => json!({"id": id, "status": 200, "body": {"value": value}}),
                                None => json!({"id": id, "status": 200}),
                            },
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(json!({ "responses": responses }))
    }
}

pub async fn mount_batch(server: &MockServer, responder: BatchResponder) {
    Mock::given(method("POST"))
        .and(path(BATCH_PATH))
        .respond_with(responder)
        .mount(server)
        .await;
}

/// Bodies of every batch request the server received, in order
pub async fn batch_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == BATCH_PATH)
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

pub async fn count_requests(server: &MockServer, method_name: &str, path_suffix: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.to_string() == method_name && r.url.path().ends_with(path_suffix))
        .count()
}

pub fn ids(body: &Value) -> HashSet<String> {
    body["requests"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e["id"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
