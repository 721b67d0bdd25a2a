//! Open Protocol southbound driver
//!
//! Torque-controller protocol: NUL-terminated ASCII frames with a 20-byte
//! header (length, MID, revision, flags). The driver performs the
//! communication-start handshake, arms the configured subscription MIDs,
//! keeps the link alive with MID 9999 and emits incoming data frames
//! keyed by their MID.

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

const HEADER_LEN: usize = 20;
const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenProtocolConnDetails {
    pub host: String,
    pub port: u16,
    /// Subscription MIDs sent after the communication-start accept
    /// (e.g. `"0060"` for tightening results).
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

pub fn build(name: String, details: serde_json::Value) -> Result<Arc<dyn DeviceConnection>> {
    let details: OpenProtocolConnDetails = serde_json::from_value(details)?;
    Ok(Arc::new(OpenProtocolConnection::new(name, details)))
}

/// Render one frame: zero-padded length and MID, fixed revision, NUL
/// terminator.
fn build_frame(mid: &str, data: &str) -> Vec<u8> {
    let len = HEADER_LEN + data.len();
    let mut frame = format!("{len:04}{mid:0>4}001 0000    {data}").into_bytes();
    frame.push(0);
    frame
}

/// Split a received frame (without its NUL) into MID and data.
fn parse_frame(frame: &[u8]) -> Option<(String, String)> {
    if frame.len() < HEADER_LEN {
        return None;
    }
    let text = String::from_utf8_lossy(frame);
    Some((
        text[4..8].to_string(),
        text[HEADER_LEN.min(text.len())..].to_string(),
    ))
}

pub struct OpenProtocolConnection {
    inner: Arc<OpInner>,
}

struct OpInner {
    name: String,
    details: OpenProtocolConnDetails,
    bus: EventBus,
    writer: Mutex<Option<OwnedWriteHalf>>,
    opened: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OpenProtocolConnection {
    pub fn new(name: String, details: OpenProtocolConnDetails) -> Self {
        Self {
            inner: Arc::new(OpInner {
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

impl OpInner {
    async fn send_mid(&self, mid: &str, data: &str) -> Result<()> {
        let frame = build_frame(mid, data);
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(EdgeSrvError::NotConnected)?;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| EdgeSrvError::connection(e.to_string()))
    }

    async fn handle_frame(&self, frame: &[u8]) {
        let Some((mid, data)) = parse_frame(frame) else {
            warn!(connection = %self.name, "short Open Protocol frame");
            return;
        };
        match mid.as_str() {
            // communication start accepted
            "0002" => {
                info!(connection = %self.name, "communication start accepted");
                self.bus.emit(ConnectionEvent::Open);
                for sub in &self.details.subscriptions {
                    if let Err(e) = self.send_mid(sub, "").await {
                        warn!(connection = %self.name, mid = %sub, "subscribe failed: {e}");
                    }
                }
            }
            // command error
            "0004" => self
                .bus
                .emit(ConnectionEvent::Error(format!("controller error: {data}"))),
            // command accepted / keep-alive echo
            "0005" | "9999" => {}
            // tightening result: emit and acknowledge
            "0061" => {
                let mut payload = HashMap::new();
                payload.insert(mid, RawValue::Text(data));
                self.bus.emit_data(payload, true);
                if let Err(e) = self.send_mid("0062", "").await {
                    warn!(connection = %self.name, "result ack failed: {e}");
                }
            }
            _ => {
                let mut payload = HashMap::new();
                payload.insert(mid, RawValue::Text(data));
                self.bus.emit_data(payload, true);
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let endpoint = format!("{}:{}", self.details.host, self.details.port);
        let mut attempt = 0u32;

        loop {
            match TcpStream::connect(&endpoint).await {
                Ok(stream) => {
                    info!(connection = %self.name, %endpoint, "controller connected");
                    attempt = 0;
                    let (mut reader, writer) = stream.into_split();
                    *self.writer.lock().await = Some(writer);

                    if let Err(e) = self.send_mid("0001", "").await {
                        warn!(connection = %self.name, "communication start failed: {e}");
                    }

                    let mut pending: Vec<u8> = Vec::new();
                    let mut chunk = vec![0u8; 1024];
                    let mut keep_alive = tokio::time::interval(KEEP_ALIVE_PERIOD);
                    keep_alive.reset();

                    loop {
                        tokio::select! {
                            _ = keep_alive.tick() => {
                                if let Err(e) = self.send_mid("9999", "").await {
                                    warn!(connection = %self.name, "keep-alive failed: {e}");
                                    break;
                                }
                            }
                            read = reader.read(&mut chunk) => match read {
                                Ok(0) => break,
                                Ok(n) => {
                                    pending.extend_from_slice(&chunk[..n]);
                                    while let Some(pos) = pending.iter().position(|&b| b == 0) {
                                        let frame: Vec<u8> = pending.drain(..=pos).collect();
                                        self.handle_frame(&frame[..pos]).await;
                                    }
                                }
                                Err(e) => {
                                    self.bus.emit(ConnectionEvent::Error(e.to_string()));
                                    break;
                                }
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

#[async_trait]
impl DeviceConnection for OpenProtocolConnection {
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
        // best-effort communication stop
        let _ = self.inner.send_mid("0003", "").await;
        if let Some(task) = self.inner.task.lock().await.take() {
            task.abort();
        }
        *self.inner.writer.lock().await = None;
        self.inner.bus.emit(ConnectionEvent::Close);
        Ok(())
    }

    async fn read_metrics(&self, _addresses: &[String]) -> Result<()> {
        // the controller pushes subscribed MIDs
        Ok(())
    }

    async fn write_metrics(
        &self,
        metrics: Vec<Metric>,
        format: PayloadFormat,
        delimiter: &str,
    ) -> Result<()> {
        let mut by_mid: HashMap<String, Vec<Metric>> = HashMap::new();
        for m in metrics {
            by_mid.entry(m.properties.address.clone()).or_default().push(m);
        }
        for (mid, group) in by_mid {
            let body = codec::encode(&group, format, delimiter)?;
            let data = String::from_utf8_lossy(&body).into_owned();
            self.inner.send_mid(&mid, &data).await?;
        }
        Ok(())
    }

    async fn start_subscription(
        &self,
        _addresses: Vec<String>,
        _format: PayloadFormat,
        _delimiter: String,
        _interval: Duration,
        device_id: &str,
    ) -> Result<()> {
        debug!(connection = %self.inner.name, device_id, "Open Protocol subscription armed");
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
    fn test_frame_round_trip() {
        let frame = build_frame("60", "data");
        assert_eq!(frame.len(), HEADER_LEN + 4 + 1);
        assert_eq!(&frame[..4], b"0024");
        assert_eq!(frame.last(), Some(&0u8));

        let (mid, data) = parse_frame(&frame[..frame.len() - 1]).unwrap();
        assert_eq!(mid, "0060");
        assert_eq!(data, "data");
    }

    #[test]
    fn test_parse_frame_too_short() {
        assert!(parse_frame(b"0004").is_none());
    }
}
