//! MTConnect southbound driver
//!
//! Read-only flavour of the REST driver: metric `address` names an agent
//! document (`current`, `probe`, `sample`), the payload is the agent's
//! XML response, and metric `path`s select data items out of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::core::connection::{ConnectionEvent, DeviceConnection, EventBus, PollTasks};
use crate::core::metrics::Metric;
use crate::core::types::{PayloadFormat, RawValue};
use crate::utils::{EdgeSrvError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtConnectConnDetails {
    #[serde(alias = "baseURL")]
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5000
}

pub fn build(name: String, details: serde_json::Value) -> Result<Arc<dyn DeviceConnection>> {
    let details: MtConnectConnDetails = serde_json::from_value(details)?;
    Ok(Arc::new(MtConnectConnection::new(name, details)?))
}

pub struct MtConnectConnection {
    inner: Arc<MtConnectInner>,
}

struct MtConnectInner {
    name: String,
    details: MtConnectConnDetails,
    client: reqwest::Client,
    bus: EventBus,
    polls: PollTasks,
    opened: AtomicBool,
}

impl MtConnectConnection {
    pub fn new(name: String, details: MtConnectConnDetails) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(details.timeout_ms))
            .build()?;
        Ok(Self {
            inner: Arc::new(MtConnectInner {
                name,
                details,
                client,
                bus: EventBus::new(),
                polls: PollTasks::new(),
                opened: AtomicBool::new(false),
            }),
        })
    }
}

impl MtConnectInner {
    async fn read_once(&self, addresses: &[String]) {
        for addr in addresses {
            let url = format!(
                "{}/{}",
                self.details.base_url.trim_end_matches('/'),
                addr.trim_start_matches('/')
            );
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.text().await {
                    Ok(body) => {
                        let mut payload = HashMap::new();
                        payload.insert(addr.clone(), RawValue::Text(body));
                        self.bus.emit_data(payload, true);
                    }
                    Err(e) => self.bus.emit(ConnectionEvent::Error(e.to_string())),
                },
                Ok(resp) => self.bus.emit(ConnectionEvent::Error(format!(
                    "GET {addr}: HTTP {}",
                    resp.status()
                ))),
                Err(e) => self.bus.emit(ConnectionEvent::Error(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl DeviceConnection for MtConnectConnection {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.bus.subscribe()
    }

    async fn open(&self) -> Result<()> {
        if !self.inner.opened.swap(true, Ordering::SeqCst) {
            self.inner.bus.emit(ConnectionEvent::Open);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.polls.stop_all().await;
        if self.inner.opened.swap(false, Ordering::SeqCst) {
            self.inner.bus.emit(ConnectionEvent::Close);
        }
        Ok(())
    }

    async fn read_metrics(&self, addresses: &[String]) -> Result<()> {
        self.inner.read_once(addresses).await;
        Ok(())
    }

    async fn write_metrics(
        &self,
        _metrics: Vec<Metric>,
        _format: PayloadFormat,
        _delimiter: &str,
    ) -> Result<()> {
        Err(EdgeSrvError::NotSupported(
            "MTConnect agents are read-only".to_string(),
        ))
    }

    async fn start_subscription(
        &self,
        addresses: Vec<String>,
        _format: PayloadFormat,
        _delimiter: String,
        interval: Duration,
        device_id: &str,
    ) -> Result<()> {
        debug!(connection = %self.inner.name, device_id, ?interval, "starting MTConnect poll");
        let inner = self.inner.clone();
        let addresses = Arc::new(addresses);
        self.inner
            .polls
            .start(device_id, interval, move || {
                let inner = inner.clone();
                let addresses = addresses.clone();
                async move {
                    inner.read_once(&addresses).await;
                }
            })
            .await;
        Ok(())
    }

    async fn stop_subscription(&self, device_id: &str) -> Result<()> {
        self.inner.polls.stop(device_id).await;
        Ok(())
    }
}
