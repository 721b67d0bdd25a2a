//! Device-connection contract and southbound drivers
//!
//! A connection owns one southbound transport shared by every device
//! declared on it. Drivers emit [`ConnectionEvent`]s on a broadcast
//! stream; devices consume them under their own task.

pub mod ascii_tcp;
pub mod mqtt;
pub mod mtconnect;
pub mod open_protocol;
pub mod registry;
pub mod rest;
pub mod udp;
pub mod websocket;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::trace;

use super::metrics::Metric;
use super::types::{DataPayload, PayloadFormat};
use crate::utils::Result;

/// Default capacity of a connection's event stream. A device that falls
/// behind loses the oldest events and is told how many (broadcast lag).
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Asynchronous, fire-and-forget driver events.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Driver is usable.
    Open,
    /// Driver lost its transport; devices treat this as disconnect.
    Close,
    /// Non-fatal driver error.
    Error(String),
    /// Inbound data: native address to raw payload. `parse_vals == false`
    /// signals the raw values are already final and the codec layer is
    /// bypassed.
    Data {
        payload: Arc<DataPayload>,
        parse_vals: bool,
    },
}

/// Broadcast event stream shared by a driver and its devices.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; a send with no live receivers is not an error.
    pub fn emit(&self, event: ConnectionEvent) {
        if self.tx.send(event).is_err() {
            trace!("connection event dropped: no receivers");
        }
    }

    pub fn emit_data(&self, payload: DataPayload, parse_vals: bool) {
        self.emit(ConnectionEvent::Data {
            payload: Arc::new(payload),
            parse_vals,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Polymorphic southbound driver contract.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    /// Connection name for logging.
    fn name(&self) -> &str;

    /// Subscribe to the driver's event stream.
    fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Open the transport. Idempotent.
    async fn open(&self) -> Result<()>;

    /// Close the transport. Idempotent; emits `Close`.
    async fn close(&self) -> Result<()>;

    /// One-shot read of the given addresses; results arrive as `Data`
    /// events.
    async fn read_metrics(&self, addresses: &[String]) -> Result<()>;

    /// Write the metrics to the device, encoding per the payload format.
    async fn write_metrics(
        &self,
        metrics: Vec<Metric>,
        format: PayloadFormat,
        delimiter: &str,
    ) -> Result<()>;

    /// Begin a periodic read for a device. Push drivers arm their
    /// pipeline instead and return immediately.
    async fn start_subscription(
        &self,
        addresses: Vec<String>,
        format: PayloadFormat,
        delimiter: String,
        interval: Duration,
        device_id: &str,
    ) -> Result<()>;

    /// Cancel the periodic read for a device.
    async fn stop_subscription(&self, device_id: &str) -> Result<()>;
}

/// Periodic-read tasks keyed by device id, for drivers whose
/// subscription is a plain timer over `read_metrics`.
#[derive(Debug, Default)]
pub struct PollTasks {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PollTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or replace) the poll task for a device.
    pub async fn start<F, Fut>(&self, device_id: &str, interval: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                tick().await;
            }
        });
        if let Some(old) = self
            .tasks
            .lock()
            .await
            .insert(device_id.to_string(), handle)
        {
            old.abort();
        }
    }

    pub async fn stop(&self, device_id: &str) {
        if let Some(handle) = self.tasks.lock().await.remove(device_id) {
            handle.abort();
        }
    }

    pub async fn stop_all(&self) {
        for (_, handle) in self.tasks.lock().await.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_event_bus_fan_out() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(ConnectionEvent::Open);
        assert!(matches!(rx1.recv().await, Ok(ConnectionEvent::Open)));
        assert!(matches!(rx2.recv().await, Ok(ConnectionEvent::Open)));
    }

    #[tokio::test]
    async fn test_poll_tasks_tick_and_stop() {
        let polls = PollTasks::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        polls
            .start("dev1", Duration::from_millis(10), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        tokio::time::sleep(Duration::from_millis(55)).await;
        polls.stop("dev1").await;
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least 2 ticks, saw {seen}");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen, "ticks after stop");
    }
}
