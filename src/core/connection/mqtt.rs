//! MQTT southbound driver
//!
//! Metric `address` is a topic. Subscriptions are push-based: starting a
//! subscription subscribes the topics and the broker delivers data as it
//! is published; `read_metrics` is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::codec;
use crate::core::connection::{ConnectionEvent, DeviceConnection, EventBus};
use crate::core::metrics::Metric;
use crate::core::types::{PayloadFormat, RawValue};
use crate::utils::{EdgeSrvError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttConnDetails {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_qos")]
    pub qos: u8,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

fn default_qos() -> u8 {
    0
}

pub fn build(name: String, details: serde_json::Value) -> Result<Arc<dyn DeviceConnection>> {
    let details: MqttConnDetails = serde_json::from_value(details)?;
    Ok(Arc::new(MqttConnection::new(name, details)))
}

pub struct MqttConnection {
    inner: Arc<MqttInner>,
}

struct MqttInner {
    name: String,
    details: MqttConnDetails,
    bus: EventBus,
    client: Mutex<Option<AsyncClient>>,
    topics: Mutex<Vec<String>>,
    opened: AtomicBool,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttConnection {
    pub fn new(name: String, details: MqttConnDetails) -> Self {
        Self {
            inner: Arc::new(MqttInner {
                name,
                details,
                bus: EventBus::new(),
                client: Mutex::new(None),
                topics: Mutex::new(Vec::new()),
                opened: AtomicBool::new(false),
                loop_task: Mutex::new(None),
            }),
        }
    }
}

impl MqttInner {
    fn qos(&self) -> QoS {
        match self.details.qos {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }
}

#[async_trait]
impl DeviceConnection for MqttConnection {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.bus.subscribe()
    }

    async fn open(&self) -> Result<()> {
        if self.inner.opened.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let client_id = self
            .inner
            .details
            .client_id
            .clone()
            .unwrap_or_else(|| format!("edgesrv-{}", self.inner.name));
        let mut options =
            MqttOptions::new(client_id, &self.inner.details.host, self.inner.details.port);
        options.set_keep_alive(Duration::from_secs(self.inner.details.keep_alive_secs));
        if let (Some(user), Some(pass)) =
            (&self.inner.details.username, &self.inner.details.password)
        {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        *self.inner.client.lock().await = Some(client);

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let mut connected = false;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(connection = %inner.name, "MQTT broker connected");
                        connected = true;
                        inner.bus.emit(ConnectionEvent::Open);
                        // re-arm topic subscriptions after every reconnect
                        let topics = inner.topics.lock().await.clone();
                        if let Some(client) = inner.client.lock().await.as_ref() {
                            for topic in topics {
                                if let Err(e) = client.subscribe(topic.as_str(), inner.qos()).await
                                {
                                    warn!(connection = %inner.name, %topic, "subscribe failed: {e}");
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let mut payload = HashMap::new();
                        payload.insert(
                            publish.topic.clone(),
                            RawValue::Bytes(publish.payload.to_vec()),
                        );
                        inner.bus.emit_data(payload, true);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if connected {
                            error!(connection = %inner.name, "MQTT connection lost: {e}");
                            connected = false;
                            inner.bus.emit(ConnectionEvent::Close);
                        }
                        // the event loop reconnects on the next poll
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
        *self.inner.loop_task.lock().await = Some(task);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.opened.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(client) = self.inner.client.lock().await.take() {
            if let Err(e) = client.disconnect().await {
                debug!(connection = %self.inner.name, "disconnect: {e}");
            }
        }
        if let Some(task) = self.inner.loop_task.lock().await.take() {
            task.abort();
        }
        self.inner.bus.emit(ConnectionEvent::Close);
        Ok(())
    }

    async fn read_metrics(&self, _addresses: &[String]) -> Result<()> {
        // broker pushes retained/live values; nothing to poll
        debug!(connection = %self.inner.name, "read_metrics is a no-op for MQTT");
        Ok(())
    }

    async fn write_metrics(
        &self,
        metrics: Vec<Metric>,
        format: PayloadFormat,
        delimiter: &str,
    ) -> Result<()> {
        let guard = self.inner.client.lock().await;
        let client = guard.as_ref().ok_or(EdgeSrvError::NotConnected)?;

        let mut by_topic: HashMap<String, Vec<Metric>> = HashMap::new();
        for m in metrics {
            by_topic.entry(m.properties.address.clone()).or_default().push(m);
        }
        for (topic, group) in by_topic {
            let body = codec::encode(&group, format, delimiter)?;
            client.publish(topic, self.inner.qos(), false, body).await?;
        }
        Ok(())
    }

    async fn start_subscription(
        &self,
        addresses: Vec<String>,
        _format: PayloadFormat,
        _delimiter: String,
        _interval: Duration,
        device_id: &str,
    ) -> Result<()> {
        debug!(connection = %self.inner.name, device_id, "arming MQTT topic subscriptions");
        {
            let mut topics = self.inner.topics.lock().await;
            for addr in &addresses {
                if !topics.contains(addr) {
                    topics.push(addr.clone());
                }
            }
        }
        if let Some(client) = self.inner.client.lock().await.as_ref() {
            for topic in &addresses {
                client.subscribe(topic.as_str(), self.inner.qos()).await?;
            }
        }
        Ok(())
    }

    async fn stop_subscription(&self, _device_id: &str) -> Result<()> {
        // topics are shared across sibling devices; leave them subscribed
        Ok(())
    }
}
