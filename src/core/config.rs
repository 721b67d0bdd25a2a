//! Edge-agent configuration
//!
//! The external document (remote config service, mirrored to
//! `./config/conf.json`) declares connections, devices and tags. The
//! rehasher normalises it into the internal connection/device/metric
//! shape: connection-level poll interval, payload format and delimiter
//! are copied down to each device, and every tag becomes a metric with
//! its properties populated from the tag fields.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::device::{default_metrics, DeviceSpec};
use super::metrics::{Metric, MetricProperties};
use super::sparkplug::SparkplugConfig;
use super::types::{Endianness, MetricType, PayloadFormat};
use crate::utils::{EdgeSrvError, ErrorExt, Result};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Top-level local configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub sparkplug: SparkplugConfig,
    #[serde(rename = "deviceConnections", default)]
    pub device_connections: Vec<ConnectionConfig>,
}

/// One declared southbound connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(rename = "connType")]
    pub conn_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "pollInt", default)]
    pub poll_int: Option<u64>,
    #[serde(rename = "payloadFormat", default)]
    pub payload_format: Option<String>,
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    /// Driver-specific details under their registry key
    /// (`RESTConnDetails`, `MQTTConnDetails`, ...).
    #[serde(flatten)]
    pub details: HashMap<String, serde_json::Value>,
}

/// One logical device on a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "pollInt", default)]
    pub poll_int: Option<u64>,
    #[serde(rename = "payloadFormat", default)]
    pub payload_format: Option<String>,
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub tags: Vec<TagConfig>,
}

/// One declared tag, converted to a metric by the rehasher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagConfig {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(rename = "type")]
    pub tag_type: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub eng_unit: Option<String>,
    #[serde(default)]
    pub eng_low: Option<f64>,
    #[serde(default)]
    pub eng_high: Option<f64>,
    #[serde(default)]
    pub dead_band: Option<f64>,
    #[serde(default)]
    pub tooltip: Option<String>,
    #[serde(default)]
    pub docs: Option<String>,
    #[serde(default = "default_record", rename = "recordToDB")]
    pub record_to_db: bool,
}

fn default_record() -> bool {
    true
}

/// Internal shape the translator builds connections from.
#[derive(Debug, Clone)]
pub struct ConnectionPlan {
    pub name: String,
    pub conn_type: String,
    pub details: HashMap<String, serde_json::Value>,
    pub devices: Vec<DeviceSpec>,
}

/// Strip a trailing `BE`/`LE` endianness suffix off a declared type.
fn split_type_suffix(declared: &str) -> (&str, Endianness) {
    if let Some(base) = declared.strip_suffix("BE") {
        if MetricType::parse(base).is_some() {
            return (base, Endianness::Big);
        }
    }
    if let Some(base) = declared.strip_suffix("LE") {
        if MetricType::parse(base).is_some() {
            return (base, Endianness::Little);
        }
    }
    (declared, Endianness::Big)
}

/// Convert one declared tag into a metric.
fn tag_to_metric(tag: &TagConfig) -> Result<Metric> {
    let (base_type, endianness) = split_type_suffix(&tag.tag_type);
    let metric_type = MetricType::parse(base_type).ok_or_else(|| {
        EdgeSrvError::config(format!("tag {}: unknown type {:?}", tag.name, tag.tag_type))
    })?;

    let mut metric = Metric::new(tag.name.clone(), metric_type);
    metric.transient = !tag.record_to_db;
    metric.properties = MetricProperties {
        method: tag.method.clone().unwrap_or_else(|| "GET".to_string()),
        address: tag.address.clone().unwrap_or_default(),
        path: tag.path.clone().unwrap_or_default(),
        friendly_name: None,
        tooltip: tag.tooltip.clone(),
        documentation: tag.docs.clone(),
        eng_unit: tag.eng_unit.clone(),
        eng_low: tag.eng_low,
        eng_high: tag.eng_high,
        deadband: tag.dead_band,
        endianness,
        extra: HashMap::new(),
    };
    Ok(metric)
}

/// Normalise the external document into connection plans, copying
/// connection-level settings down into each device.
pub fn rehash(doc: &LocalConfig) -> Result<Vec<ConnectionPlan>> {
    let mut plans = Vec::with_capacity(doc.device_connections.len());

    for (i, conn) in doc.device_connections.iter().enumerate() {
        let conn_name = conn
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", conn.conn_type, i));
        let conn_format = conn
            .payload_format
            .as_deref()
            .and_then(PayloadFormat::parse)
            .unwrap_or_default();
        let conn_delimiter = conn.delimiter.clone().unwrap_or_default();
        let conn_poll = conn.poll_int.unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        let mut devices = Vec::with_capacity(conn.devices.len());
        for dev in &conn.devices {
            let poll_interval_ms = dev.poll_int.unwrap_or(conn_poll);
            let payload_format = dev
                .payload_format
                .as_deref()
                .and_then(PayloadFormat::parse)
                .unwrap_or(conn_format);
            let delimiter = dev.delimiter.clone().unwrap_or_else(|| conn_delimiter.clone());

            let mut metrics = default_metrics(poll_interval_ms);
            for tag in &dev.tags {
                metrics.push(tag_to_metric(tag)?);
            }

            devices.push(DeviceSpec {
                device_id: dev.device_id.clone(),
                poll_interval_ms,
                payload_format,
                delimiter,
                metrics,
            });
        }

        plans.push(ConnectionPlan {
            name: conn_name,
            conn_type: conn.conn_type.clone(),
            details: conn.details.clone(),
            devices,
        });
    }

    debug!(connections = plans.len(), "configuration rehashed");
    Ok(plans)
}

/// Load and validate the local configuration file.
pub fn load_local_config(path: &Path) -> Result<LocalConfig> {
    let raw = std::fs::read_to_string(path)
        .config_error(&format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).config_error(&format!("parsing {}", path.display()))
}

/// Serialised writer for the local configuration file. The only field the
/// core rewrites is `pollInt` under a matching device entry.
#[derive(Debug)]
pub struct ConfigPersister {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConfigPersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite `pollInt` for the device entry with the given id.
    pub async fn set_poll_interval(&self, device_id: &str, poll_interval_ms: u64) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut doc = load_local_config(&self.path)?;
        let mut found = false;
        for conn in &mut doc.device_connections {
            for dev in &mut conn.devices {
                if dev.device_id == device_id {
                    dev.poll_int = Some(poll_interval_ms);
                    found = true;
                }
            }
        }
        if !found {
            return Err(EdgeSrvError::config(format!(
                "device {device_id} not present in {}",
                self.path.display()
            )));
        }

        let raw = serde_json::to_string_pretty(&doc)?;
        std::fs::write(&self.path, raw)
            .config_error(&format!("writing {}", self.path.display()))?;
        info!(device_id, poll_interval_ms, "polling interval persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> LocalConfig {
        serde_json::from_value(serde_json::json!({
            "sparkplug": {
                "serverHost": "localhost",
                "groupId": "Plant1",
                "nodeId": "Edge1"
            },
            "deviceConnections": [{
                "connType": "REST",
                "pollInt": 2000,
                "payloadFormat": "JSON",
                "RESTConnDetails": {"baseUrl": "http://plc.local"},
                "devices": [{
                    "deviceId": "Press",
                    "tags": [
                        {
                            "Name": "Line/Temp",
                            "type": "float",
                            "method": "GET",
                            "address": "status",
                            "path": "$.temp",
                            "engUnit": "degC",
                            "recordToDB": true
                        },
                        {
                            "Name": "Line/Count",
                            "type": "uInt32BE",
                            "method": "GET",
                            "address": "status",
                            "path": "$.count",
                            "recordToDB": false
                        }
                    ]
                }]
            }]
        }))
        .expect("sample config is valid")
    }

    #[test]
    fn test_rehash_copies_connection_settings_down() {
        let plans = rehash(&sample_doc()).unwrap();
        assert_eq!(plans.len(), 1);
        let device = &plans[0].devices[0];
        assert_eq!(device.poll_interval_ms, 2000);
        assert_eq!(device.payload_format, PayloadFormat::Json);
        assert!(plans[0].details.contains_key("RESTConnDetails"));
    }

    #[test]
    fn test_rehash_prepends_default_metrics() {
        let plans = rehash(&sample_doc()).unwrap();
        let metrics = &plans[0].devices[0].metrics;
        assert_eq!(metrics[0].name, "Device Control/Polling Interval");
        assert_eq!(metrics[1].name, "Device Control/Reboot");
        assert_eq!(metrics[2].name, "Device Control/Rebirth");
        assert!(metrics[0].transient);
    }

    #[test]
    fn test_tag_conversion_strips_suffix_and_negates_record() {
        let plans = rehash(&sample_doc()).unwrap();
        let metrics = &plans[0].devices[0].metrics;
        let count = metrics.iter().find(|m| m.name == "Line/Count").unwrap();
        assert_eq!(count.metric_type, MetricType::UInt32);
        assert_eq!(count.properties.endianness, Endianness::Big);
        assert!(count.transient, "recordToDB=false means transient");

        let temp = metrics.iter().find(|m| m.name == "Line/Temp").unwrap();
        assert!(!temp.transient);
        assert_eq!(temp.properties.eng_unit.as_deref(), Some("degC"));
    }

    #[test]
    fn test_unknown_tag_type_is_config_error() {
        let mut doc = sample_doc();
        doc.device_connections[0].devices[0].tags[0].tag_type = "register".into();
        assert!(matches!(rehash(&doc), Err(EdgeSrvError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_persister_rewrites_poll_int_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.json");
        let doc = sample_doc();
        std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();

        let persister = ConfigPersister::new(&path);
        persister.set_poll_interval("Press", 2500).await.unwrap();

        let reloaded = load_local_config(&path).unwrap();
        assert_eq!(reloaded.device_connections[0].devices[0].poll_int, Some(2500));
        // the rest of the document survives
        assert_eq!(reloaded.device_connections[0].conn_type, "REST");
        assert_eq!(reloaded.device_connections[0].devices[0].tags.len(), 2);

        let missing = persister.set_poll_interval("Ghost", 100).await;
        assert!(missing.is_err());
    }
}
