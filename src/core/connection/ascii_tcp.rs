//! ASCII-over-TCP southbound driver
//!
//! Terminator-framed text over a client TCP socket. Each inbound frame is
//! emitted as a data event keyed by `host:port`; writes append the
//! terminator. The read loop reconnects with backoff when the peer drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::codec;
use crate::core::connection::{ConnectionEvent, DeviceConnection, EventBus};
use crate::core::metrics::Metric;
use crate::core::types::{PayloadFormat, RawValue};
use crate::utils::{EdgeSrvError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsciiTcpConnDetails {
    pub host: String,
    pub port: u16,
    /// Frame terminator; defaults to a newline.
    #[serde(default = "default_terminator")]
    pub terminator: String,
}

fn default_terminator() -> String {
    "\n".to_string()
}

pub fn build(name: String, details: serde_json::Value) -> Result<Arc<dyn DeviceConnection>> {
    let details: AsciiTcpConnDetails = serde_json::from_value(details)?;
    Ok(Arc::new(AsciiTcpConnection::new(name, details)))
}

pub struct AsciiTcpConnection {
    inner: Arc<AsciiTcpInner>,
}

struct AsciiTcpInner {
    name: String,
    details: AsciiTcpConnDetails,
    bus: EventBus,
    writer: Mutex<Option<OwnedWriteHalf>>,
    opened: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AsciiTcpConnection {
    pub fn new(name: String, details: AsciiTcpConnDetails) -> Self {
        Self {
            inner: Arc::new(AsciiTcpInner {
                name,
                details,
                bus: EventBus::new(),
                writer: Mutex::new(None),
                opened: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }
}

impl AsciiTcpInner {
    fn address_key(&self) -> String {
        format!("{}:{}", self.details.host, self.details.port)
    }

    async fn run(self: Arc<Self>) {
        let endpoint = self.address_key();
        let terminator = self.details.terminator.clone().into_bytes();
        let mut attempt = 0u32;

        loop {
            match TcpStream::connect(&endpoint).await {
                Ok(stream) => {
                    info!(connection = %self.name, %endpoint, "TCP connected");
                    attempt = 0;
                    let (mut reader, writer) = stream.into_split();
                    *self.writer.lock().await = Some(writer);
                    self.bus.emit(ConnectionEvent::Open);

                    let mut pending: Vec<u8> = Vec::new();
                    let mut chunk = vec![0u8; 1024];
                    loop {
                        match reader.read(&mut chunk).await {
                            Ok(0) => break,
                            Ok(n) => {
                                pending.extend_from_slice(&chunk[..n]);
                                while let Some(pos) = find_terminator(&pending, &terminator) {
                                    let frame: Vec<u8> = pending.drain(..pos + terminator.len()).collect();
                                    let text = String::from_utf8_lossy(&frame[..pos]).into_owned();
                                    let mut payload = HashMap::new();
                                    payload.insert(endpoint.clone(), RawValue::Text(text));
                                    self.bus.emit_data(payload, true);
                                }
                            }
                            Err(e) => {
                                self.bus.emit(ConnectionEvent::Error(e.to_string()));
                                break;
                            }
                        }
                    }

                    *self.writer.lock().await = None;
                    self.bus.emit(ConnectionEvent::Close);
                }
                Err(e) => {
                    warn!(connection = %self.name, %endpoint, "connect failed: {e}");
                }
            }

            let base = Duration::from_secs(1 << attempt.min(5));
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(base + jitter).await;
        }
    }
}

fn find_terminator(buf: &[u8], terminator: &[u8]) -> Option<usize> {
    if terminator.is_empty() || buf.len() < terminator.len() {
        return None;
    }
    buf.windows(terminator.len()).position(|w| w == terminator)
}

#[async_trait]
impl DeviceConnection for AsciiTcpConnection {
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
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.inner.bus.emit(ConnectionEvent::Close);
        Ok(())
    }

    async fn read_metrics(&self, _addresses: &[String]) -> Result<()> {
        // the device streams frames on its own cadence
        Ok(())
    }

    async fn write_metrics(
        &self,
        metrics: Vec<Metric>,
        format: PayloadFormat,
        delimiter: &str,
    ) -> Result<()> {
        let mut body = codec::encode(&metrics, format, delimiter)?;
        body.extend_from_slice(self.inner.details.terminator.as_bytes());

        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(EdgeSrvError::NotConnected)?;
        writer
            .write_all(&body)
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
        debug!(connection = %self.inner.name, device_id, "ASCII TCP subscription armed");
        Ok(())
    }

    async fn stop_subscription(&self, _device_id: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_terminator() {
        assert_eq!(find_terminator(b"abc\ndef", b"\n"), Some(3));
        assert_eq!(find_terminator(b"abcdef", b"\n"), None);
        assert_eq!(find_terminator(b"ab\r\ncd", b"\r\n"), Some(2));
    }
}
