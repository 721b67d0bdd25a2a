//! UDP southbound driver
//!
//! Receive-only: binds a local port and emits every datagram as a data
//! event keyed by the port. Metrics on a UDP connection address the port
//! and select within the datagram via their `path`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::connection::{ConnectionEvent, DeviceConnection, EventBus};
use crate::core::metrics::Metric;
use crate::core::types::{PayloadFormat, RawValue};
use crate::utils::{EdgeSrvError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UdpConnDetails {
    #[serde(default = "default_bind")]
    pub bind: String,
    pub port: u16,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

pub fn build(name: String, details: serde_json::Value) -> Result<Arc<dyn DeviceConnection>> {
    let details: UdpConnDetails = serde_json::from_value(details)?;
    Ok(Arc::new(UdpConnection::new(name, details)))
}

pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    name: String,
    details: UdpConnDetails,
    bus: EventBus,
    opened: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpConnection {
    pub fn new(name: String, details: UdpConnDetails) -> Self {
        Self {
            inner: Arc::new(UdpInner {
                name,
                details,
                bus: EventBus::new(),
                opened: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl DeviceConnection for UdpConnection {
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
        let addr = format!("{}:{}", self.inner.details.bind, self.inner.details.port);
        let socket = UdpSocket::bind(&addr).await?;
        info!(connection = %self.inner.name, %addr, "UDP listener bound");

        let inner = self.inner.clone();
        let address_key = self.inner.details.port.to_string();
        let task = tokio::spawn(async move {
            inner.bus.emit(ConnectionEvent::Open);
            let mut buf = vec![0u8; 2048];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, peer)) => {
                        debug!(connection = %inner.name, %peer, len, "datagram received");
                        let mut payload = HashMap::new();
                        payload.insert(address_key.clone(), RawValue::Bytes(buf[..len].to_vec()));
                        inner.bus.emit_data(payload, true);
                    }
                    Err(e) => {
                        warn!(connection = %inner.name, "UDP receive failed: {e}");
                        inner.bus.emit(ConnectionEvent::Error(e.to_string()));
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        *self.inner.task.lock().await = Some(task);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.opened.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.inner.task.lock().await.take() {
            task.abort();
        }
        self.inner.bus.emit(ConnectionEvent::Close);
        Ok(())
    }

    async fn read_metrics(&self, _addresses: &[String]) -> Result<()> {
        // datagrams arrive unsolicited
        Ok(())
    }

    async fn write_metrics(
        &self,
        _metrics: Vec<Metric>,
        _format: PayloadFormat,
        _delimiter: &str,
    ) -> Result<()> {
        Err(EdgeSrvError::NotSupported(
            "UDP connections are receive-only".to_string(),
        ))
    }

    async fn start_subscription(
        &self,
        _addresses: Vec<String>,
        _format: PayloadFormat,
        _delimiter: String,
        _interval: Duration,
        device_id: &str,
    ) -> Result<()> {
        debug!(connection = %self.inner.name, device_id, "UDP subscription armed");
        Ok(())
    }

    async fn stop_subscription(&self, _device_id: &str) -> Result<()> {
        Ok(())
    }
}
