//! API integration tests
//!
//! Drives the HTTP API against a pool of simulated modems.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use smsgated::api::{hash_token, ApiServer, ApiState};
use smsgated::config::{ApiConfig, ModemSlot, PoolConfig, SelfTestCadence, ServerConfig, TokenConfig};
use smsgated::health::period_key;
use smsgated::modem::mock::{SimulatedModem, SimulatedPorts};
use smsgated::pool::ModemPool;

const SMS_TOKEN: &str = "sms-token";
const USSD_TOKEN: &str = "ussd-token";
const MONITOR_TOKEN: &str = "monitor-token";
const FETCH_TOKEN: &str = "fetch-00";

const SLOTS: &str = r#"
- id: "00"
  port: /dev/ttyUSB*
  imei: "351111111111111"
  phone_number: "+4917000000"
  prefixes: "+49"
  cost_per_sms: 0.05
  ussd_balance_code: "*100#"
  ussd_balance_pattern: "Balance: ([0-9,]+)"
"#;

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

struct Gateway {
    base: String,
    client: reqwest::Client,
    pool: Arc<ModemPool>,
    modem: SimulatedModem,
    shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

impl Gateway {
    async fn start(enable_send: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();

        // This period's self-test counts as done
        let period = period_key(SelfTestCadence::Monthly, Local::now().date_naive());
        std::fs::write(dir.path().join("selftest.state"), format!("00 {period}\n")).unwrap();

        let ports = SimulatedPorts::new();
        let modem = SimulatedModem::new("351111111111111").with_ussd("*100#", "Balance: 12,50 EUR");
        ports.plug("/dev/ttyUSB0", modem.clone());

        let pool_config = PoolConfig {
            hint_file: dir.path().join("ports.hint"),
            self_test_file: dir.path().join("selftest.state"),
            discovery_interval: Duration::from_millis(50),
            command_timeout: Duration::from_millis(500),
            registration_timeout: Duration::from_secs(2),
            ..PoolConfig::default()
        };
        let slots: Vec<ModemSlot> = serde_yaml::from_str(SLOTS).unwrap();
        let pool = Arc::new(ModemPool::new(slots, pool_config, Arc::new(ports)).await.unwrap());

        let api_config = ApiConfig {
            enable_send_sms: enable_send,
            enable_send_ussd: enable_send,
            tokens: TokenConfig {
                send_sms: vec![hash_token(SMS_TOKEN).unwrap()],
                send_ussd: vec![hash_token(USSD_TOKEN).unwrap()],
                get_health_state: vec![hash_token(MONITOR_TOKEN).unwrap()],
                get_stats: vec![hash_token(MONITOR_TOKEN).unwrap()],
                fetch_sms: HashMap::from([("00".to_string(), vec![hash_token(FETCH_TOKEN).unwrap()])]),
            },
        };

        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&pool).run(rx.clone()));

        let server_config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        };
        let state = Arc::new(ApiState::new(Arc::clone(&pool), api_config, None));
        let server = ApiServer::new(&server_config, state).unwrap();
        let listener = server.bind().await.unwrap();
        let address: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener, rx));

        let gateway = Self {
            base: format!("http://{address}/api/v1"),
            client: reqwest::Client::new(),
            pool,
            modem,
            shutdown,
            _dir: dir,
        };
        gateway.ready().await;
        gateway
    }

    async fn ready(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.pool.session("00").is_some_and(|s| s.is_ready()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("modem did not become ready");
    }

    async fn get(&self, path: &str, token: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{path}", self.base))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, path: &str, token: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{path}", self.base))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn sms_status(&self, id: &str) -> String {
        let response = self.get(&format!("/sms/{id}"), SMS_TOKEN).await;
        assert_eq!(response.status(), StatusCode::OK);
        let message: Value = response.json().await.unwrap();
        message["status"].as_str().unwrap().to_string()
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[tokio::test]
async fn test_ping_needs_no_token() {
    let gw = Gateway::start(true).await;

    let response = gw.client.get(format!("{}/ping", gw.base)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_send_sms_and_status() {
    let gw = Gateway::start(true).await;

    let response = gw
        .post("/sms", SMS_TOKEN, json!({"recipient": "+49 30 0000000", "message": "hello"}))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let sent: SendResponse = response.json().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while gw.sms_status(&sent.id).await == "pending" {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("SMS stayed pending");

    assert_eq!(gw.sms_status(&sent.id).await, "sent");
    let submitted = gw.modem.sent();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].recipient, "+49300000000");
    assert_eq!(submitted[0].body, "hello");
}

#[tokio::test]
async fn test_bad_token_has_no_side_effect() {
    let gw = Gateway::start(true).await;

    let response = gw
        .post("/sms", "wrong", json!({"recipient": "+4930000000", "message": "hello"}))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: ErrorResponse = response.json().await.unwrap();
    assert!(!body.error.contains("wrong"));

    // A token for another capability is not enough either
    let response = gw
        .post("/sms", USSD_TOKEN, json!({"recipient": "+4930000000", "message": "hello"}))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = gw
        .client
        .post(format!("{}/sms", gw.base))
        .json(&json!({"recipient": "+4930000000", "message": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gw.modem.sent().is_empty());
    assert_eq!(gw.pool.stats().store.outbound, 0);
}

#[tokio::test]
async fn test_send_sms_errors() {
    let gw = Gateway::start(true).await;

    let cases = [
        (json!({"recipient": "+4312345678", "message": "x"}), StatusCode::UNPROCESSABLE_ENTITY),
        (json!({"recipient": "not a number", "message": "x"}), StatusCode::BAD_REQUEST),
        (json!({"recipient": "+4930000000", "message": "x".repeat(161)}), StatusCode::BAD_REQUEST),
        (
            json!({"recipient": "+4930000000", "message": "x", "sender": "+4911111111"}),
            StatusCode::NOT_FOUND,
        ),
    ];
    for (body, status) in cases {
        let response = gw.post("/sms", SMS_TOKEN, body.clone()).await;
        assert_eq!(response.status(), status, "request {body}");
    }

    assert_eq!(gw.get("/sms/not-an-id", SMS_TOKEN).await.status(), StatusCode::NOT_FOUND);
    assert!(gw.modem.sent().is_empty());
}

#[tokio::test]
async fn test_disabled_capabilities() {
    let gw = Gateway::start(false).await;

    let response = gw
        .post("/sms", SMS_TOKEN, json!({"recipient": "+4930000000", "message": "hello"}))
        .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = gw
        .post("/ussd", USSD_TOKEN, json!({"sender": "+4917000000", "code": "*100#"}))
        .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_ussd() {
    let gw = Gateway::start(true).await;

    let response = gw
        .post("/ussd", USSD_TOKEN, json!({"sender": "+4917000000", "code": "*100#"}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let answer: Value = response.json().await.unwrap();
    assert_eq!(answer["status"], "OK");
    assert_eq!(answer["response"], "Balance: 12,50 EUR");

    let response = gw
        .post("/ussd", USSD_TOKEN, json!({"sender": "+4917000000", "code": "*100#;AT+CFUN=0"}))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = gw
        .post("/ussd", USSD_TOKEN, json!({"sender": "+4999999999", "code": "*100#"}))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_fetch_inbound() {
    let gw = Gateway::start(true).await;

    gw.modem.deliver_sms("+4915199999999", "first");
    gw.modem.deliver_sms("+4915199999999", "second");

    let batch: Value = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let batch: Value = gw.get("/inbound/00?cursor=0", FETCH_TOKEN).await.json().await.unwrap();
            if batch["messages"].as_array().unwrap().len() == 2 {
                return batch;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("messages not received");

    let messages = batch["messages"].as_array().unwrap();
    assert_eq!(messages[0]["body"], "first");
    assert_eq!(messages[1]["body"], "second");
    assert_eq!(messages[0]["peer"], "+4915199999999");

    // Nothing newer than the returned cursor
    let cursor = batch["cursor"].as_u64().unwrap();
    let newer: Value = gw
        .get(&format!("/inbound/00?cursor={cursor}"), FETCH_TOKEN)
        .await
        .json()
        .await
        .unwrap();
    assert!(newer["messages"].as_array().unwrap().is_empty());

    // Received messages are not readable with a send token
    let id = messages[0]["id"].as_str().unwrap();
    assert_eq!(gw.get(&format!("/sms/{id}"), SMS_TOKEN).await.status(), StatusCode::NOT_FOUND);

    assert_eq!(gw.get("/inbound/00", SMS_TOKEN).await.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(gw.get("/inbound/07", FETCH_TOKEN).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_and_stats() {
    let gw = Gateway::start(true).await;

    let response = gw.get("/health", MONITOR_TOKEN).await;
    assert_eq!(response.status(), StatusCode::OK);
    let health: Value = response.json().await.unwrap();
    assert!(["OK", "WARNING", "CRITICAL"].contains(&health["level"].as_str().unwrap()));
    assert!(health["slots"]["00"].is_object());
    assert_eq!(health["slots"]["00"]["phone_number"], "+4917000000");

    assert_eq!(gw.get("/health", SMS_TOKEN).await.status(), StatusCode::UNAUTHORIZED);

    let response = gw.get("/stats", MONITOR_TOKEN).await;
    assert_eq!(response.status(), StatusCode::OK);
    let stats: Value = response.json().await.unwrap();
    assert_eq!(stats["slots"]["00"]["connects"], 1);
    assert_eq!(stats["store"]["outbound"], 0);
}
