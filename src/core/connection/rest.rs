//! REST southbound driver
//!
//! Metric `address` is a path under the connection's base URL; reads are
//! periodic GETs, writes use the metric's declared method verb.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::core::codec;
use crate::core::connection::{ConnectionEvent, DeviceConnection, EventBus, PollTasks};
use crate::core::metrics::Metric;
use crate::core::types::{PayloadFormat, RawValue};
use crate::utils::Result;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestConnDetails {
    #[serde(alias = "baseURL")]
    pub base_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5000
}

pub fn build(name: String, details: serde_json::Value) -> Result<Arc<dyn DeviceConnection>> {
    let details: RestConnDetails = serde_json::from_value(details)?;
    Ok(Arc::new(RestConnection::new(name, details)?))
}

pub struct RestConnection {
    inner: Arc<RestInner>,
}

struct RestInner {
    name: String,
    details: RestConnDetails,
    client: reqwest::Client,
    bus: EventBus,
    polls: PollTasks,
    opened: AtomicBool,
}

impl RestConnection {
    pub fn new(name: String, details: RestConnDetails) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(details.timeout_ms))
            .build()?;
        Ok(Self {
            inner: Arc::new(RestInner {
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

impl RestInner {
    fn url_for(&self, address: &str) -> String {
        format!(
            "{}/{}",
            self.details.base_url.trim_end_matches('/'),
            address.trim_start_matches('/')
        )
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.details.username {
            Some(user) => req.basic_auth(user, self.details.password.as_deref()),
            None => req,
        }
    }

    /// GET each address once and emit a data event per response.
    async fn read_once(&self, addresses: &[String]) {
        for addr in addresses {
            let req = self.with_auth(self.client.get(self.url_for(addr)));
            match req.send().await {
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
impl DeviceConnection for RestConnection {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.bus.subscribe()
    }

    async fn open(&self) -> Result<()> {
        // connectionless transport: open just marks the driver usable
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
        metrics: Vec<Metric>,
        format: PayloadFormat,
        delimiter: &str,
    ) -> Result<()> {
        let mut by_addr: HashMap<String, Vec<Metric>> = HashMap::new();
        for m in metrics {
            by_addr.entry(m.properties.address.clone()).or_default().push(m);
        }

        for (addr, group) in by_addr {
            let body = codec::encode(&group, format, delimiter)?;
            let url = self.inner.url_for(&addr);
            let verb = group[0].properties.method.clone();
            let req = if verb.eq_ignore_ascii_case("PUT") {
                self.inner.client.put(&url)
            } else {
                self.inner.client.post(&url)
            };
            let resp = self.inner.with_auth(req).body(body).send().await?;
            if !resp.status().is_success() {
                warn!(connection = %self.inner.name, %addr, status = %resp.status(), "write rejected");
            }
        }
        Ok(())
    }

    async fn start_subscription(
        &self,
        addresses: Vec<String>,
        _format: PayloadFormat,
        _delimiter: String,
        interval: Duration,
        device_id: &str,
    ) -> Result<()> {
        debug!(connection = %self.inner.name, device_id, ?interval, "starting REST poll");
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
