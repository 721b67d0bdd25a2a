//! Device lifecycle scenarios
//!
//! Drives a device task with a scripted southbound driver and a mock
//! Sparkplug node: birth/data/death ordering, change filtering, watchdog
//! expiry, command handling and polling-interval persistence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use edgesrv::core::config::{load_local_config, ConfigPersister};
use edgesrv::core::connection::{ConnectionEvent, DeviceConnection, EventBus};
use edgesrv::core::device::{self, default_metrics, DeviceSpec};
use edgesrv::core::metrics::Metric;
use edgesrv::core::sparkplug::{AliasAssignment, PayloadMetric, SparkplugEvent, SparkplugNode};
use edgesrv::core::types::{MetricType, MetricValue, PayloadFormat, RawValue};
use edgesrv::utils::Result;

// ============================================================================
// Mocks
// ============================================================================

#[derive(Debug, Default)]
struct DriverLog {
    reads: Vec<Vec<String>>,
    writes: Vec<Vec<Metric>>,
    subscriptions: Vec<(String, u64)>,
    stops: Vec<String>,
}

struct MockDriver {
    bus: EventBus,
    log: Mutex<DriverLog>,
}

impl MockDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bus: EventBus::new(),
            log: Mutex::new(DriverLog::default()),
        })
    }

    fn emit_open(&self) {
        self.bus.emit(ConnectionEvent::Open);
    }

    fn emit_close(&self) {
        self.bus.emit(ConnectionEvent::Close);
    }

    fn emit_json(&self, address: &str, body: &str) {
        let mut payload = HashMap::new();
        payload.insert(address.to_string(), RawValue::Text(body.to_string()));
        self.bus.emit_data(payload, true);
    }

    fn log(&self) -> std::sync::MutexGuard<'_, DriverLog> {
        self.log.lock().expect("driver log lock")
    }
}

#[async_trait]
impl DeviceConnection for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.bus.subscribe()
    }

    async fn open(&self) -> Result<()> {
        self.emit_open();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.emit_close();
        Ok(())
    }

    async fn read_metrics(&self, addresses: &[String]) -> Result<()> {
        self.log().reads.push(addresses.to_vec());
        Ok(())
    }

    async fn write_metrics(
        &self,
        metrics: Vec<Metric>,
        _format: PayloadFormat,
        _delimiter: &str,
    ) -> Result<()> {
        self.log().writes.push(metrics);
        Ok(())
    }

    async fn start_subscription(
        &self,
        _addresses: Vec<String>,
        _format: PayloadFormat,
        _delimiter: String,
        interval: Duration,
        device_id: &str,
    ) -> Result<()> {
        self.log()
            .subscriptions
            .push((device_id.to_string(), interval.as_millis() as u64));
        Ok(())
    }

    async fn stop_subscription(&self, device_id: &str) -> Result<()> {
        self.log().stops.push(device_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Frame {
    Birth(Vec<PayloadMetric>),
    Data(Vec<PayloadMetric>),
    Death,
}

struct MockNode {
    events: broadcast::Sender<SparkplugEvent>,
    frames: Mutex<Vec<Frame>>,
    next_alias: AtomicU64,
}

impl MockNode {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            frames: Mutex::new(Vec::new()),
            next_alias: AtomicU64::new(0),
        })
    }

    fn frames(&self) -> Vec<Frame> {
        self.frames.lock().expect("frame lock").clone()
    }

    fn births(&self) -> usize {
        self.frames()
            .iter()
            .filter(|f| matches!(f, Frame::Birth(_)))
            .count()
    }

    fn deaths(&self) -> usize {
        self.frames()
            .iter()
            .filter(|f| matches!(f, Frame::Death))
            .count()
    }

    fn data_frames(&self) -> Vec<Vec<PayloadMetric>> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Data(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn alias_of(&self, name: &str) -> Option<u64> {
        self.frames().iter().rev().find_map(|f| match f {
            Frame::Birth(metrics) => metrics
                .iter()
                .find(|m| m.name.as_deref() == Some(name))
                .and_then(|m| m.alias),
            _ => None,
        })
    }
}

#[async_trait]
impl SparkplugNode for MockNode {
    fn subscribe_events(&self) -> broadcast::Receiver<SparkplugEvent> {
        self.events.subscribe()
    }

    async fn publish_dbirth(
        &self,
        _device_id: &str,
        mut metrics: Vec<PayloadMetric>,
    ) -> Result<Vec<AliasAssignment>> {
        let mut assignments = Vec::new();
        for m in &mut metrics {
            let alias = self.next_alias.fetch_add(1, Ordering::SeqCst) + 1;
            m.alias = Some(alias);
            if let Some(name) = &m.name {
                assignments.push((name.clone(), alias));
            }
        }
        self.frames.lock().expect("frame lock").push(Frame::Birth(metrics));
        Ok(assignments)
    }

    async fn publish_ddata(&self, _device_id: &str, metrics: Vec<PayloadMetric>) -> Result<()> {
        self.frames.lock().expect("frame lock").push(Frame::Data(metrics));
        Ok(())
    }

    async fn publish_ddeath(&self, _device_id: &str) -> Result<()> {
        self.frames.lock().expect("frame lock").push(Frame::Death);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn temp_metric() -> Metric {
    let mut m = Metric::new("Line/Temp", MetricType::Float);
    m.properties.method = "GET".into();
    m.properties.address = "sensors".into();
    m.properties.path = "$.sensor.temp".into();
    m
}

fn setpoint_metric() -> Metric {
    let mut m = Metric::new("Line/Setpoint", MetricType::Int32);
    m.properties.method = "PUT".into();
    m.properties.address = "setpoint".into();
    m
}

fn press_spec() -> DeviceSpec {
    let mut metrics = default_metrics(1000);
    metrics.push(temp_metric());
    metrics.push(setpoint_metric());
    DeviceSpec {
        device_id: "Press".to_string(),
        poll_interval_ms: 1000,
        payload_format: PayloadFormat::Json,
        delimiter: String::new(),
        metrics,
    }
}

fn write_conf(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("conf.json");
    let doc = serde_json::json!({
        "sparkplug": {
            "serverHost": "localhost",
            "groupId": "Plant1",
            "nodeId": "Edge1"
        },
        "deviceConnections": [{
            "connType": "REST",
            "pollInt": 1000,
            "payloadFormat": "JSON",
            "RESTConnDetails": {"baseUrl": "http://plc.local"},
            "devices": [{"deviceId": "Press", "tags": []}]
        }]
    });
    std::fs::write(&path, serde_json::to_string_pretty(&doc).expect("encode conf"))
        .expect("write conf");
    path
}

struct Rig {
    driver: Arc<MockDriver>,
    node: Arc<MockNode>,
    handle: device::DeviceHandle,
    conf_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

async fn start_rig() -> Rig {
    let dir = tempfile::tempdir().expect("tempdir");
    let conf_path = write_conf(&dir);
    let driver = MockDriver::new();
    let node = MockNode::new();
    let driver_dyn: Arc<dyn DeviceConnection> = driver.clone();
    let node_dyn: Arc<dyn SparkplugNode> = node.clone();
    let handle = device::spawn(
        press_spec(),
        driver_dyn,
        node_dyn,
        Arc::new(ConfigPersister::new(&conf_path)),
    );

    // let the task come up, then bring the driver online
    tokio::time::sleep(Duration::from_millis(20)).await;
    driver.emit_open();
    tokio::time::sleep(Duration::from_millis(250)).await;

    Rig {
        driver,
        node,
        handle,
        conf_path,
        _dir: dir,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

const TEMP_PAYLOAD: &str = r#"{"sensor":{"temp":"23.5"}}"#;

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn birth_precedes_data_and_identical_values_dedup() {
    let rig = start_rig().await;

    // driver came up: subscription armed once at the configured interval
    assert_eq!(rig.driver.log().subscriptions, vec![("Press".to_string(), 1000)]);

    rig.driver.emit_json("sensors", TEMP_PAYLOAD);
    settle().await;

    let frames = rig.node.frames();
    assert!(
        matches!(frames.as_slice(), [Frame::Birth(_), Frame::Data(_)]),
        "expected BIRTH then DATA, got {frames:?}"
    );
    let data = rig.node.data_frames();
    assert_eq!(data[0].len(), 1);
    assert_eq!(data[0][0].value, serde_json::json!(23.5));

    // identical payload: change filter suppresses the frame
    rig.driver.emit_json("sensors", TEMP_PAYLOAD);
    settle().await;
    assert_eq!(rig.node.data_frames().len(), 1, "no DATA for unchanged value");

    // a changed value passes again
    rig.driver.emit_json("sensors", r#"{"sensor":{"temp":"24.0"}}"#);
    settle().await;
    assert_eq!(rig.node.data_frames().len(), 2);

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn watchdog_publishes_death_and_next_data_rebirths() {
    let rig = start_rig().await;

    rig.driver.emit_json("sensors", TEMP_PAYLOAD);
    settle().await;
    assert_eq!(rig.node.births(), 1);
    assert_eq!(rig.node.deaths(), 0);

    // refreshed under the 10 s period: no DEATH
    for temp in ["24.0", "24.5", "25.5"] {
        tokio::time::sleep(Duration::from_secs(6)).await;
        rig.driver
            .emit_json("sensors", &format!(r#"{{"sensor":{{"temp":"{temp}"}}}}"#));
        settle().await;
    }
    assert_eq!(rig.node.deaths(), 0, "regular data keeps the device alive");

    // silence past the 10 s watchdog
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(rig.node.deaths(), 1, "exactly one DEATH after silence");

    // stays dead while silent
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(rig.node.deaths(), 1);

    // recovery: fresh BIRTH before the DATA
    rig.driver.emit_json("sensors", r#"{"sensor":{"temp":"25.0"}}"#);
    settle().await;
    assert_eq!(rig.node.births(), 2);
    let frames = rig.node.frames();
    assert!(
        matches!(frames.last(), Some(Frame::Data(_))),
        "DATA follows the rebirth, got {frames:?}"
    );

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn driver_close_publishes_death() {
    let rig = start_rig().await;
    rig.driver.emit_json("sensors", TEMP_PAYLOAD);
    settle().await;

    rig.driver.emit_close();
    settle().await;
    assert_eq!(rig.node.deaths(), 1);

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn rebirth_command_republishes_birth() {
    let rig = start_rig().await;
    rig.driver.emit_json("sensors", TEMP_PAYLOAD);
    settle().await;
    assert_eq!(rig.node.births(), 1);

    rig.handle
        .send_dcmd(vec![PayloadMetric {
            name: Some("Device Control/Rebirth".to_string()),
            alias: None,
            metric_type: Some("Boolean".to_string()),
            value: serde_json::json!(true),
            timestamp: None,
            is_null: false,
            is_transient: true,
            properties: None,
        }])
        .await;
    settle().await;

    assert_eq!(rig.node.births(), 2);
    // still alive: a new value publishes DATA without another birth
    rig.driver.emit_json("sensors", r#"{"sensor":{"temp":"26.0"}}"#);
    settle().await;
    assert_eq!(rig.node.births(), 2);

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn polling_interval_command_restarts_subscription_and_persists() {
    let rig = start_rig().await;
    rig.driver.emit_json("sensors", TEMP_PAYLOAD);
    settle().await;

    rig.handle
        .send_dcmd(vec![PayloadMetric {
            name: Some("Device Control/Polling Interval".to_string()),
            alias: None,
            metric_type: Some("UInt16".to_string()),
            value: serde_json::json!(2500),
            timestamp: None,
            is_null: false,
            is_transient: true,
            properties: None,
        }])
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    {
        let log = rig.driver.log();
        assert_eq!(log.stops, vec!["Press".to_string()]);
        assert_eq!(
            log.subscriptions.last(),
            Some(&("Press".to_string(), 2500)),
            "subscription restarted at the new interval"
        );
    }

    // one DATA frame for the polling-interval metric
    let published = rig
        .node
        .data_frames()
        .into_iter()
        .flatten()
        .any(|m| m.value == serde_json::json!(2500));
    assert!(published, "polling interval change published as DATA");

    // the matching device entry was rewritten
    let doc = load_local_config(&rig.conf_path).expect("conf reloads");
    assert_eq!(doc.device_connections[0].devices[0].poll_int, Some(2500));

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn write_to_read_only_metric_is_rejected() {
    let rig = start_rig().await;
    rig.driver.emit_json("sensors", TEMP_PAYLOAD);
    settle().await;
    let data_before = rig.node.data_frames().len();

    rig.handle
        .send_dcmd(vec![PayloadMetric {
            name: Some("Line/Temp".to_string()),
            alias: None,
            metric_type: Some("Float".to_string()),
            value: serde_json::json!(99.0),
            timestamp: None,
            is_null: false,
            is_transient: false,
            properties: None,
        }])
        .await;
    settle().await;

    assert!(rig.driver.log().writes.is_empty(), "no driver write");
    assert_eq!(rig.node.data_frames().len(), data_before, "no DATA frame");

    rig.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn alias_only_command_resolves_and_writes() {
    let rig = start_rig().await;
    rig.driver.emit_json("sensors", TEMP_PAYLOAD);
    settle().await;

    let alias = rig
        .node
        .alias_of("Line/Setpoint")
        .expect("setpoint got an alias at birth");

    rig.handle
        .send_dcmd(vec![PayloadMetric {
            name: None,
            alias: Some(alias),
            metric_type: Some("Int32".to_string()),
            value: serde_json::json!(5),
            timestamp: None,
            is_null: false,
            is_transient: false,
            properties: None,
        }])
        .await;
    settle().await;

    let log = rig.driver.log();
    assert_eq!(log.writes.len(), 1, "one batched driver write");
    assert_eq!(log.writes[0][0].name, "Line/Setpoint");
    assert_eq!(log.writes[0][0].value, MetricValue::Int(5));
    drop(log);

    // the write was mirrored and published
    let mirrored = rig
        .node
        .data_frames()
        .into_iter()
        .flatten()
        .any(|m| m.value == serde_json::json!(5));
    assert!(mirrored, "mirrored write published as DATA");

    rig.handle.stop().await;
}
