//! BOPTEST client against a mocked simulator

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use serde_json::json;
use syncsrv::settings::SimulatorSettings;
use syncsrv::simulator::{BoptestClient, SignalMap, SimulatorClient};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> BoptestClient {
    BoptestClient::new(&SimulatorSettings {
        url: format!("{}/", server.uri()),
        request_timeout_ms: 2_000,
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn metadata_merges_inputs_and_measurements() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/inputs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 200,
            "payload": {"oveDamper_u": {"Unit": "1", "Minimum": 0.0, "Maximum": 1.0, "Description": "damper"}}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/measurements"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 200,
            "payload": {"hvac_reaAhu_TSup_y": {"Unit": "K", "Minimum": null, "Maximum": null}}
        })))
        .mount(&server)
        .await;

    let metadata = client(&server).get_metadata().await.unwrap();
    assert_eq!(metadata.len(), 2);
    assert_eq!(metadata["oveDamper_u"].max, Some(1.0));
    assert_eq!(metadata["hvac_reaAhu_TSup_y"].unit.as_deref(), Some("K"));
}

#[tokio::test]
async fn selected_test_case_scopes_every_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/testcases/bestest_air/select"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"testid": "t-42"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/initialize/t-42"))
        .and(body_json(json!({"start_time": 86400.0, "warmup_period": 0.0})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"payload": {"TZon": 293.0}})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/step/t-42"))
        .and(body_json(json!({"step": 60.0})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"payload": {"step": 60}})))
        .expect(1)
        .mount(&server)
        .await;

    let mut client = client(&server);
    assert_eq!(client.select_test_case("bestest_air").await.unwrap(), "t-42");
    let initial = client.initialize(86_400.0, 0.0).await.unwrap();
    assert_eq!(initial["TZon"], 293.0);
    client.set_step_time(60.0).await.unwrap();
}

#[tokio::test]
async fn advance_posts_control_inputs_and_keeps_numeric_outputs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/advance"))
        .and(body_json(json!({"oveDamper_u": 0.4, "oveDamper_activate": 1.0})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "payload": {"time": 3600, "TZon": 294.2, "label": "n/a", "missing": null}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/kpi"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "payload": {"ener_tot": 1.25, "tdis_tot": null}
        })))
        .mount(&server)
        .await;

    let client = client(&server);
    let inputs: SignalMap = [("oveDamper_u".to_string(), 0.4), ("oveDamper_activate".to_string(), 1.0)]
        .into_iter()
        .collect();
    let outputs = client.advance(&inputs).await.unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs["TZon"], 294.2);

    let kpis = client.get_kpis().await.unwrap();
    assert_eq!(kpis.len(), 1);
    assert_eq!(kpis["ener_tot"], 1.25);
}

#[tokio::test]
async fn simulator_errors_are_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/advance"))
        .respond_with(ResponseTemplate::new(500).set_body_string("solver diverged"))
        .mount(&server)
        .await;

    let err = client(&server).advance(&SignalMap::new()).await.unwrap_err();
    assert!(matches!(err, errors::SyncError::Simulator(_)));
    assert!(err.to_string().contains("solver diverged"));
}
