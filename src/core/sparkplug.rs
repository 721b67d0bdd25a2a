//! Sparkplug node interface
//!
//! The translator consumes the Sparkplug layer through [`SparkplugNode`]:
//! publish BIRTH/DATA/DEATH frames for a device, receive DCMD and rebirth
//! events. [`MqttSparkplugNode`] is the in-tree adapter: an MQTT client
//! that lays payload DTOs out on spBv1.0-shaped topics and allocates
//! metric aliases at DBIRTH.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::metrics::{now_ms, Metric};
use crate::utils::{EdgeSrvError, Result};

/// Wire shape of one metric inside a Sparkplug payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadMetric {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<u64>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<String>,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub is_null: bool,
    #[serde(default)]
    pub is_transient: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Value>,
}

impl PayloadMetric {
    /// Full rendering for BIRTH frames: name, type and properties.
    pub fn birth(m: &Metric) -> Self {
        let p = &m.properties;
        let mut props = serde_json::Map::new();
        let mut put = |k: &str, v: serde_json::Value| {
            if !v.is_null() {
                props.insert(k.to_string(), v);
            }
        };
        if !p.method.is_empty() {
            put("method", json!(p.method));
        }
        if !p.address.is_empty() {
            put("address", json!(p.address));
        }
        if !p.path.is_empty() {
            put("path", json!(p.path));
        }
        put("friendlyName", json!(p.friendly_name));
        put("tooltip", json!(p.tooltip));
        put("documentation", json!(p.documentation));
        put("engUnit", json!(p.eng_unit));
        put("engLow", json!(p.eng_low));
        put("engHigh", json!(p.eng_high));
        put("deadband", json!(p.deadband));

        Self {
            name: Some(m.name.clone()),
            alias: m.alias,
            metric_type: Some(m.metric_type.as_str().to_string()),
            value: m.value.to_json(),
            timestamp: Some(m.timestamp_ms),
            is_null: m.is_null(),
            is_transient: m.transient,
            properties: if props.is_empty() {
                None
            } else {
                Some(serde_json::Value::Object(props))
            },
        }
    }

    /// Compact rendering for DATA frames: alias when one was assigned.
    pub fn data(m: &Metric) -> Self {
        Self {
            name: if m.alias.is_some() {
                None
            } else {
                Some(m.name.clone())
            },
            alias: m.alias,
            metric_type: Some(m.metric_type.as_str().to_string()),
            value: m.value.to_json(),
            timestamp: Some(m.timestamp_ms),
            is_null: m.is_null(),
            is_transient: m.transient,
            properties: None,
        }
    }
}

/// Events the Sparkplug layer delivers to the translator.
#[derive(Debug, Clone)]
pub enum SparkplugEvent {
    /// The primary host requested a birth for one device.
    Dbirth(String),
    /// The primary host requested births for every device.
    DbirthAll,
    /// Device command payload.
    Dcmd(String, Vec<PayloadMetric>),
    /// The Sparkplug layer is stopping.
    Stop,
}

/// Alias assignment returned by a DBIRTH publish.
pub type AliasAssignment = (String, u64);

/// The Sparkplug node the translator publishes through. Publishes are
/// serialised internally; the node is shared by every device.
#[async_trait]
pub trait SparkplugNode: Send + Sync {
    fn subscribe_events(&self) -> broadcast::Receiver<SparkplugEvent>;

    /// Publish a device BIRTH; returns the metric aliases the Sparkplug
    /// layer assigned.
    async fn publish_dbirth(
        &self,
        device_id: &str,
        metrics: Vec<PayloadMetric>,
    ) -> Result<Vec<AliasAssignment>>;

    async fn publish_ddata(&self, device_id: &str, metrics: Vec<PayloadMetric>) -> Result<()>;

    async fn publish_ddeath(&self, device_id: &str) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

// ============================================================================
// MQTT adapter
// ============================================================================

/// Connection settings for the MQTT-backed node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SparkplugConfig {
    pub server_host: String,
    #[serde(default = "default_port")]
    pub server_port: u16,
    pub group_id: String,
    pub node_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_port() -> u16 {
    1883
}

pub struct MqttSparkplugNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    cfg: SparkplugConfig,
    client: AsyncClient,
    events: broadcast::Sender<SparkplugEvent>,
    seq: Mutex<u8>,
    next_alias: AtomicU64,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSparkplugNode {
    /// Connect to the broker, arm the DCMD/NCMD subscriptions and publish
    /// the node birth.
    pub async fn connect(cfg: SparkplugConfig) -> Result<Self> {
        let client_id = format!("edgesrv-{}-{}", cfg.group_id, cfg.node_id);
        let mut options = MqttOptions::new(client_id, &cfg.server_host, cfg.server_port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            options.set_credentials(user, pass);
        }
        let death_topic = format!("spBv1.0/{}/NDEATH/{}", cfg.group_id, cfg.node_id);
        options.set_last_will(LastWill::new(
            death_topic,
            serde_json::to_vec(&json!({"timestamp": now_ms(), "metrics": []}))?,
            QoS::AtLeastOnce,
            false,
        ));

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let (events, _) = broadcast::channel(64);

        let inner = Arc::new(NodeInner {
            cfg,
            client,
            events,
            seq: Mutex::new(0),
            next_alias: AtomicU64::new(0),
            loop_task: Mutex::new(None),
        });

        let looped = inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(
                            group = %looped.cfg.group_id,
                            node = %looped.cfg.node_id,
                            "sparkplug broker connected"
                        );
                        let cmd_filters = [
                            format!(
                                "spBv1.0/{}/DCMD/{}/+",
                                looped.cfg.group_id, looped.cfg.node_id
                            ),
                            format!(
                                "spBv1.0/{}/NCMD/{}",
                                looped.cfg.group_id, looped.cfg.node_id
                            ),
                        ];
                        for filter in cmd_filters {
                            if let Err(e) = looped
                                .client
                                .subscribe(filter.as_str(), QoS::AtLeastOnce)
                                .await
                            {
                                warn!(%filter, "command subscribe failed: {e}");
                            }
                        }
                        if let Err(e) = looped.publish_nbirth().await {
                            warn!("node birth failed: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        looped.handle_command(&publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("sparkplug broker connection error: {e}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
        *inner.loop_task.lock().await = Some(task);

        Ok(Self { inner })
    }
}

impl NodeInner {
    fn topic(&self, kind: &str, device_id: Option<&str>) -> String {
        match device_id {
            Some(device) => format!(
                "spBv1.0/{}/{kind}/{}/{device}",
                self.cfg.group_id, self.cfg.node_id
            ),
            None => format!("spBv1.0/{}/{kind}/{}", self.cfg.group_id, self.cfg.node_id),
        }
    }

    async fn publish_payload(
        &self,
        kind: &str,
        device_id: Option<&str>,
        metrics: &[PayloadMetric],
    ) -> Result<()> {
        // holding the sequence lock across the publish serialises frames
        let mut seq = self.seq.lock().await;
        let payload = json!({
            "timestamp": now_ms(),
            "metrics": metrics,
            "seq": *seq,
        });
        *seq = seq.wrapping_add(1);
        self.client
            .publish(
                self.topic(kind, device_id),
                QoS::AtLeastOnce,
                false,
                serde_json::to_vec(&payload)?,
            )
            .await?;
        Ok(())
    }

    async fn publish_nbirth(&self) -> Result<()> {
        let rebirth = PayloadMetric {
            name: Some("Node Control/Rebirth".to_string()),
            alias: None,
            metric_type: Some("Boolean".to_string()),
            value: json!(false),
            timestamp: Some(now_ms()),
            is_null: false,
            is_transient: false,
            properties: None,
        };
        self.publish_payload("NBIRTH", None, &[rebirth]).await
    }

    fn handle_command(&self, topic: &str, payload: &[u8]) {
        let segments: Vec<&str> = topic.split('/').collect();
        let kind = segments.get(2).copied().unwrap_or_default();

        #[derive(Deserialize)]
        struct CmdPayload {
            #[serde(default)]
            metrics: Vec<PayloadMetric>,
        }
        let decoded: CmdPayload = match serde_json::from_slice(payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(%topic, "undecodable command payload: {e}");
                return;
            }
        };

        match kind {
            "DCMD" => {
                let Some(device) = segments.get(4) else {
                    warn!(%topic, "DCMD without device id");
                    return;
                };
                let _ = self
                    .events
                    .send(SparkplugEvent::Dcmd(device.to_string(), decoded.metrics));
            }
            "NCMD" => {
                let rebirth = decoded.metrics.iter().any(|m| {
                    m.name.as_deref() == Some("Node Control/Rebirth")
                        && m.value.as_bool().unwrap_or(false)
                });
                if rebirth {
                    debug!("primary host requested node rebirth");
                    let _ = self.events.send(SparkplugEvent::DbirthAll);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl SparkplugNode for MqttSparkplugNode {
    fn subscribe_events(&self) -> broadcast::Receiver<SparkplugEvent> {
        self.inner.events.subscribe()
    }

    async fn publish_dbirth(
        &self,
        device_id: &str,
        mut metrics: Vec<PayloadMetric>,
    ) -> Result<Vec<AliasAssignment>> {
        let mut assignments = Vec::with_capacity(metrics.len());
        for m in &mut metrics {
            let alias = self.inner.next_alias.fetch_add(1, Ordering::SeqCst) + 1;
            m.alias = Some(alias);
            if let Some(name) = &m.name {
                assignments.push((name.clone(), alias));
            }
        }
        self.inner
            .publish_payload("DBIRTH", Some(device_id), &metrics)
            .await?;
        Ok(assignments)
    }

    async fn publish_ddata(&self, device_id: &str, metrics: Vec<PayloadMetric>) -> Result<()> {
        self.inner
            .publish_payload("DDATA", Some(device_id), &metrics)
            .await
    }

    async fn publish_ddeath(&self, device_id: &str) -> Result<()> {
        self.inner
            .publish_payload("DDEATH", Some(device_id), &[])
            .await
    }

    async fn stop(&self) -> Result<()> {
        let _ = self.inner.events.send(SparkplugEvent::Stop);
        self.inner
            .publish_payload("NDEATH", None, &[])
            .await
            .unwrap_or_else(|e| warn!("node death publish failed: {e}"));
        if let Err(e) = self.inner.client.disconnect().await {
            return Err(EdgeSrvError::MqttError(e.to_string()));
        }
        if let Some(task) = self.inner.loop_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MetricType, MetricValue};

    #[test]
    fn test_birth_metric_carries_properties() {
        let mut m = Metric::new("Line/Temp", MetricType::Double);
        m.properties.method = "GET".into();
        m.properties.address = "sensors".into();
        m.properties.path = "$.temp".into();
        m.properties.eng_unit = Some("degC".into());
        m.properties.deadband = Some(0.5);
        m.value = MetricValue::Float(20.0);

        let dto = PayloadMetric::birth(&m);
        assert_eq!(dto.name.as_deref(), Some("Line/Temp"));
        let props = dto.properties.expect("birth carries properties");
        assert_eq!(props["address"], json!("sensors"));
        assert_eq!(props["engUnit"], json!("degC"));
        assert_eq!(props["deadband"], json!(0.5));
    }

    #[test]
    fn test_data_metric_prefers_alias() {
        let mut m = Metric::new("Line/Temp", MetricType::Double);
        m.value = MetricValue::Float(21.5);

        let by_name = PayloadMetric::data(&m);
        assert_eq!(by_name.name.as_deref(), Some("Line/Temp"));
        assert_eq!(by_name.alias, None);

        m.alias = Some(3);
        let by_alias = PayloadMetric::data(&m);
        assert_eq!(by_alias.name, None);
        assert_eq!(by_alias.alias, Some(3));
    }
}
