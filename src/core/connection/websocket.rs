//! WebSocket southbound driver
//!
//! Push-based: the peer streams payloads and every message is emitted as
//! a data event keyed by the connection URL. The read loop reconnects
//! with exponential backoff and jitter when the stream drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::core::codec;
use crate::core::connection::{ConnectionEvent, DeviceConnection, EventBus};
use crate::core::metrics::Metric;
use crate::core::types::{PayloadFormat, RawValue};
use crate::utils::{EdgeSrvError, Result};

type WsSink =
    futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsocketConnDetails {
    pub url: String,
}

pub fn build(name: String, details: serde_json::Value) -> Result<Arc<dyn DeviceConnection>> {
    let details: WebsocketConnDetails = serde_json::from_value(details)?;
    Ok(Arc::new(WebsocketConnection::new(name, details)))
}

pub struct WebsocketConnection {
    inner: Arc<WsInner>,
}

struct WsInner {
    name: String,
    details: WebsocketConnDetails,
    bus: EventBus,
    sink: Mutex<Option<WsSink>>,
    opened: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebsocketConnection {
    pub fn new(name: String, details: WebsocketConnDetails) -> Self {
        Self {
            inner: Arc::new(WsInner {
                name,
                details,
                bus: EventBus::new(),
                sink: Mutex::new(None),
                opened: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1 << attempt.min(5));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    base + jitter
}

impl WsInner {
    async fn run(self: Arc<Self>) {
        let mut attempt = 0u32;
        loop {
            match connect_async(&self.details.url).await {
                Ok((stream, _)) => {
                    info!(connection = %self.name, url = %self.details.url, "websocket connected");
                    attempt = 0;
                    let (sink, mut source) = stream.split();
                    *self.sink.lock().await = Some(sink);
                    self.bus.emit(ConnectionEvent::Open);

                    while let Some(msg) = source.next().await {
                        match msg {
                            Ok(Message::Text(text)) => {
                                let mut payload = HashMap::new();
                                payload.insert(self.details.url.clone(), RawValue::Text(text));
                                self.bus.emit_data(payload, true);
                            }
                            Ok(Message::Binary(data)) => {
                                let mut payload = HashMap::new();
                                payload.insert(self.details.url.clone(), RawValue::Bytes(data));
                                self.bus.emit_data(payload, true);
                            }
                            Ok(Message::Close(_)) => break,
                            Ok(_) => {}
                            Err(e) => {
                                self.bus.emit(ConnectionEvent::Error(e.to_string()));
                                break;
                            }
                        }
                    }

                    *self.sink.lock().await = None;
                    self.bus.emit(ConnectionEvent::Close);
                }
                Err(e) => {
                    warn!(connection = %self.name, "websocket connect failed: {e}");
                }
            }

            let delay = backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(connection = %self.name, ?delay, "websocket reconnect scheduled");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl DeviceConnection for WebsocketConnection {
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
        let inner = self.inner.clone();
        *self.inner.task.lock().await = Some(tokio::spawn(inner.run()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.opened.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.inner.task.lock().await.take() {
            task.abort();
        }
        if let Some(mut sink) = self.inner.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        self.inner.bus.emit(ConnectionEvent::Close);
        Ok(())
    }

    async fn read_metrics(&self, _addresses: &[String]) -> Result<()> {
        // the peer pushes; there is nothing to poll
        Ok(())
    }

    async fn write_metrics(
        &self,
        metrics: Vec<Metric>,
        format: PayloadFormat,
        delimiter: &str,
    ) -> Result<()> {
        let body = codec::encode(&metrics, format, delimiter)?;
        let mut guard = self.inner.sink.lock().await;
        let sink = guard.as_mut().ok_or(EdgeSrvError::NotConnected)?;
        sink.send(Message::Binary(body))
            .await
            .map_err(|e| EdgeSrvError::connection(e.to_string()))
    }

    async fn start_subscription(
        &self,
        _addresses: Vec<String>,
        _format: PayloadFormat,
        _delimiter: String,
        _interval: Duration,
        device_id: &str,
    ) -> Result<()> {
        // push pipeline is armed by open()
        debug!(connection = %self.inner.name, device_id, "websocket subscription armed");
        Ok(())
    }

    async fn stop_subscription(&self, _device_id: &str) -> Result<()> {
        Ok(())
    }
}
