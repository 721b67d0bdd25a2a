//! Device lifecycle engine
//!
//! One task per device consumes a fan-in of driver events, Sparkplug
//! commands, a watchdog ticker and a connection-readiness interval. All
//! state transitions happen inside that task: BIRTH strictly precedes the
//! first DATA of an epoch, a DEATH invalidates the epoch, and the next
//! DATA triggers a fresh BIRTH.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec;
use super::config::ConfigPersister;
use super::connection::{ConnectionEvent, DeviceConnection};
use super::metrics::{Metric, MetricStore};
use super::sparkplug::{PayloadMetric, SparkplugNode};
use super::types::{DataPayload, MetricType, MetricValue, PayloadFormat};

/// Dead-man's-handle period: a device silent for this long is reported
/// dead northbound.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the connection-readiness poll between construction and the
/// first subscription start.
const READINESS_POLL: Duration = Duration::from_millis(100);

const POLLING_INTERVAL_METRIC: &str = "Device Control/Polling Interval";
const REBOOT_METRIC: &str = "Device Control/Reboot";
const REBIRTH_METRIC: &str = "Device Control/Rebirth";

/// Internal device description produced by the config rehasher.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub device_id: String,
    pub poll_interval_ms: u64,
    pub payload_format: PayloadFormat,
    pub delimiter: String,
    pub metrics: Vec<Metric>,
}

/// The three control metrics prepended before user metrics on every
/// device; they are the device's northbound control surface.
pub fn default_metrics(poll_interval_ms: u64) -> Vec<Metric> {
    let mut poll = Metric::new(POLLING_INTERVAL_METRIC, MetricType::UInt16);
    poll.value = MetricValue::UInt(poll_interval_ms);
    poll.transient = true;
    poll.properties.eng_unit = Some("ms".to_string());

    let mut reboot = Metric::new(REBOOT_METRIC, MetricType::Boolean);
    reboot.value = MetricValue::Bool(false);
    reboot.transient = true;

    let mut rebirth = Metric::new(REBIRTH_METRIC, MetricType::Boolean);
    rebirth.value = MetricValue::Bool(false);
    rebirth.transient = true;

    vec![poll, reboot, rebirth]
}

/// Commands routed to a device by the translator.
#[derive(Debug)]
pub enum DeviceCommand {
    Dcmd(Vec<PayloadMetric>),
    Rebirth,
}

/// Owning handle to a running device task.
pub struct DeviceHandle {
    pub device_id: String,
    cmd_tx: mpsc::Sender<DeviceCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DeviceHandle {
    pub fn command_sender(&self) -> mpsc::Sender<DeviceCommand> {
        self.cmd_tx.clone()
    }

    pub async fn send_dcmd(&self, metrics: Vec<PayloadMetric>) {
        if self.cmd_tx.send(DeviceCommand::Dcmd(metrics)).await.is_err() {
            warn!(device_id = %self.device_id, "device task gone, command dropped");
        }
    }

    pub async fn request_rebirth(&self) {
        let _ = self.cmd_tx.send(DeviceCommand::Rebirth).await;
    }

    /// Cancel the device task and wait for it to wind down.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Spawn the device task.
pub fn spawn(
    spec: DeviceSpec,
    conn: Arc<dyn DeviceConnection>,
    node: Arc<dyn SparkplugNode>,
    persister: Arc<ConfigPersister>,
) -> DeviceHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();

    let actor = DeviceActor {
        device_id: spec.device_id.clone(),
        store: MetricStore::with_metrics(spec.metrics.clone()),
        conn,
        node,
        persister,
        payload_format: spec.payload_format,
        delimiter: spec.delimiter.clone(),
        poll_interval_ms: spec.poll_interval_ms,
        is_connected: false,
        is_alive: false,
        subscribed: false,
        watchdog_deadline: Instant::now() + WATCHDOG_TIMEOUT,
    };

    // subscribe before the task runs so an immediate driver open is not missed
    let events = actor.conn.subscribe_events();
    let task = tokio::spawn(actor.run(events, cmd_rx, cancel.clone()));
    DeviceHandle {
        device_id: spec.device_id,
        cmd_tx,
        cancel,
        task,
    }
}

struct DeviceActor {
    device_id: String,
    store: MetricStore,
    conn: Arc<dyn DeviceConnection>,
    node: Arc<dyn SparkplugNode>,
    persister: Arc<ConfigPersister>,
    payload_format: PayloadFormat,
    delimiter: String,
    poll_interval_ms: u64,
    is_connected: bool,
    is_alive: bool,
    subscribed: bool,
    watchdog_deadline: Instant,
}

impl DeviceActor {
    async fn run(
        mut self,
        mut events: broadcast::Receiver<ConnectionEvent>,
        mut cmd_rx: mpsc::Receiver<DeviceCommand>,
        cancel: CancellationToken,
    ) {
        let mut readiness = tokio::time::interval(READINESS_POLL);
        let mut watchdog = tokio::time::interval(Duration::from_secs(1));
        let mut commands_open = true;

        info!(device_id = %self.device_id, metrics = self.store.len(), "device constructed");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.shutdown().await;
                    return;
                }
                event = events.recv() => match event {
                    Ok(ConnectionEvent::Open) => self.on_connected(),
                    Ok(ConnectionEvent::Close) => self.on_disconnected().await,
                    Ok(ConnectionEvent::Error(e)) => {
                        warn!(device_id = %self.device_id, "driver error: {e}");
                    }
                    Ok(ConnectionEvent::Data { payload, parse_vals }) => {
                        self.handle_data(&payload, parse_vals).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(device_id = %self.device_id, dropped = n, "event queue overflowed, oldest events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.on_disconnected().await;
                        return;
                    }
                },
                cmd = cmd_rx.recv(), if commands_open => match cmd {
                    Some(DeviceCommand::Dcmd(metrics)) => self.handle_dcmd(metrics).await,
                    Some(DeviceCommand::Rebirth) => self.publish_birth(false).await,
                    None => commands_open = false,
                },
                _ = readiness.tick(), if !self.subscribed => {
                    if self.is_connected {
                        self.start_subscription().await;
                    }
                }
                _ = watchdog.tick(), if self.is_alive => {
                    if Instant::now() >= self.watchdog_deadline {
                        self.watchdog_expired().await;
                    }
                }
            }
        }
    }

    fn refresh_watchdog(&mut self) {
        self.watchdog_deadline = Instant::now() + WATCHDOG_TIMEOUT;
    }

    fn on_connected(&mut self) {
        debug!(device_id = %self.device_id, "driver open");
        self.is_connected = true;
    }

    async fn on_disconnected(&mut self) {
        debug!(device_id = %self.device_id, "driver closed");
        self.is_connected = false;
        if self.is_alive {
            self.publish_death().await;
        }
    }

    async fn watchdog_expired(&mut self) {
        warn!(device_id = %self.device_id, "watchdog expired, device presumed dead");
        self.publish_death().await;
    }

    async fn start_subscription(&mut self) {
        let addresses = self.store.addresses();
        match self
            .conn
            .start_subscription(
                addresses,
                self.payload_format,
                self.delimiter.clone(),
                Duration::from_millis(self.poll_interval_ms),
                &self.device_id,
            )
            .await
        {
            Ok(()) => {
                info!(device_id = %self.device_id, interval_ms = self.poll_interval_ms, "subscription started");
                self.subscribed = true;
            }
            Err(e) => warn!(device_id = %self.device_id, "subscription start failed: {e}"),
        }
    }

    /// Publish BIRTH and apply the alias assignments. `read_required`
    /// forces a one-shot read first so the schema carries fresh values.
    async fn publish_birth(&mut self, read_required: bool) {
        if read_required && self.is_connected {
            let addresses = self.store.addresses();
            if !addresses.is_empty() {
                if let Err(e) = self.conn.read_metrics(&addresses).await {
                    warn!(device_id = %self.device_id, "pre-birth read failed: {e}");
                }
            }
        }

        let metrics: Vec<PayloadMetric> =
            self.store.array().iter().map(PayloadMetric::birth).collect();
        match self.node.publish_dbirth(&self.device_id, metrics).await {
            Ok(assignments) => {
                for (name, alias) in assignments {
                    self.store.set_alias_by_name(&name, alias);
                }
                self.is_alive = true;
                info!(device_id = %self.device_id, "BIRTH published");
            }
            Err(e) => warn!(device_id = %self.device_id, "BIRTH failed: {e}"),
        }
    }

    async fn publish_death(&mut self) {
        match self.node.publish_ddeath(&self.device_id).await {
            Ok(()) => info!(device_id = %self.device_id, "DEATH published"),
            Err(e) => warn!(device_id = %self.device_id, "DEATH failed: {e}"),
        }
        self.is_alive = false;
    }

    /// Publish DATA for the changed metrics, opening a birth epoch first
    /// when none is active.
    async fn publish_data(&mut self, changed: Vec<Metric>) {
        if changed.is_empty() {
            return;
        }
        if !self.is_alive {
            self.publish_birth(true).await;
            if !self.is_alive {
                return;
            }
        }

        let metrics: Vec<PayloadMetric> = changed
            .iter()
            .filter_map(|m| self.store.get_by_name(&m.name))
            .map(PayloadMetric::data)
            .collect();
        if let Err(e) = self.node.publish_ddata(&self.device_id, metrics).await {
            warn!(device_id = %self.device_id, "DATA failed: {e}");
        }
    }

    /// Inbound driver data: decode, change-filter, store, publish.
    async fn handle_data(&mut self, payload: &DataPayload, parse_vals: bool) {
        let single_address = payload.len() == 1;
        let mut changed: Vec<Metric> = Vec::new();

        for (address, raw) in payload {
            for path in self.store.paths_for_addr(address) {
                let Some(metric) = self.store.get_by_addr_path(address, &path).cloned() else {
                    continue;
                };
                if !metric.is_readable() {
                    continue;
                }
                // a structured payload with no selector for this metric is
                // ambiguous; skip it
                let selectable = !parse_vals || single_address || !metric.properties.path.is_empty();
                if !selectable {
                    debug!(device_id = %self.device_id, metric = %metric.name, "no payload selector, update ignored");
                    continue;
                }

                let new_value = if parse_vals {
                    match codec::parse_value(raw, &metric, self.payload_format, &self.delimiter) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(device_id = %self.device_id, metric = %metric.name, "decode failed: {e}");
                            continue;
                        }
                    }
                } else {
                    raw.clone().into_value()
                };

                // change filter: null never wins, zero is a valid value
                if new_value.is_null() {
                    debug!(device_id = %self.device_id, metric = %metric.name, "null update ignored");
                    continue;
                }
                if new_value == metric.value {
                    continue;
                }

                let ts = if parse_vals {
                    codec::parse_timestamp(raw, self.payload_format)
                } else {
                    None
                };
                if let Some(snapshot) =
                    self.store
                        .set_value_by_addr_path(address, &path, new_value, ts)
                {
                    changed.push(snapshot);
                }
            }
        }

        if !changed.is_empty() {
            self.publish_data(changed).await;
        }
        self.refresh_watchdog();
    }

    /// Write metrics through the driver and mirror them locally.
    async fn write_metrics(&mut self, metrics: Vec<Metric>) {
        match self
            .conn
            .write_metrics(metrics.clone(), self.payload_format, &self.delimiter)
            .await
        {
            Ok(()) => {
                let mut mirrored = Vec::with_capacity(metrics.len());
                for m in &metrics {
                    if let Some(snapshot) =
                        self.store.set_value_by_name(&m.name, m.value.clone(), None)
                    {
                        mirrored.push(snapshot);
                    }
                }
                self.publish_data(mirrored).await;
                self.refresh_watchdog();
            }
            Err(e) => warn!(device_id = %self.device_id, "write failed: {e}"),
        }
    }

    /// Sparkplug command payload: control metrics first, everything else
    /// becomes a queued device write.
    async fn handle_dcmd(&mut self, metrics: Vec<PayloadMetric>) {
        let mut queued: Vec<Metric> = Vec::new();

        for pm in metrics {
            let name = match (&pm.name, pm.alias) {
                (Some(name), _) => Some(name.clone()),
                (None, Some(alias)) => self.store.get_by_alias(alias).map(|m| m.name.clone()),
                (None, None) => None,
            };
            let Some(name) = name else {
                warn!(device_id = %self.device_id, "command metric has neither name nor resolvable alias");
                continue;
            };

            let truthy = codec::coerce_json(&pm.value, MetricType::Boolean)
                .as_bool()
                .unwrap_or(false);

            match name.as_str() {
                REBOOT_METRIC => {
                    if truthy {
                        warn!(device_id = %self.device_id, "device reboot not yet implemented");
                    }
                }
                REBIRTH_METRIC => {
                    if truthy {
                        self.publish_birth(false).await;
                    }
                }
                POLLING_INTERVAL_METRIC => self.apply_polling_interval(&pm.value).await,
                _ => match self.store.get_by_name(&name) {
                    None => {
                        warn!(device_id = %self.device_id, metric = %name, "command for unknown metric");
                    }
                    Some(target) if target.is_readable() => {
                        info!(device_id = %self.device_id, metric = %name, "read only, write ignored");
                    }
                    Some(target) => {
                        let mut write = target.clone();
                        write.value = codec::coerce_json(&pm.value, write.metric_type);
                        queued.push(write);
                    }
                },
            }
        }

        if !queued.is_empty() {
            self.write_metrics(queued).await;
        }
    }

    /// Polling-interval command: restart the subscription at the new
    /// cadence and persist it to the local config file.
    async fn apply_polling_interval(&mut self, value: &serde_json::Value) {
        let Some(new_ms) = codec::coerce_json(value, MetricType::UInt16).as_u64() else {
            warn!(device_id = %self.device_id, "polling interval command with no usable value");
            return;
        };

        if let Err(e) = self.conn.stop_subscription(&self.device_id).await {
            warn!(device_id = %self.device_id, "subscription stop failed: {e}");
        }

        if let Some(snapshot) = self.store.set_value_by_name(
            POLLING_INTERVAL_METRIC,
            MetricValue::UInt(new_ms),
            None,
        ) {
            self.publish_data(vec![snapshot]).await;
        }

        self.poll_interval_ms = new_ms;
        self.subscribed = false;
        self.start_subscription().await;

        let persister = self.persister.clone();
        let device_id = self.device_id.clone();
        tokio::spawn(async move {
            if let Err(e) = persister.set_poll_interval(&device_id, new_ms).await {
                warn!(%device_id, "polling interval not persisted: {e}");
            }
        });
    }

    async fn shutdown(&mut self) {
        debug!(device_id = %self.device_id, "device stopping");
        if let Err(e) = self.conn.stop_subscription(&self.device_id).await {
            debug!(device_id = %self.device_id, "subscription stop on shutdown: {e}");
        }
        if self.is_alive {
            self.publish_death().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_metrics_shape() {
        let defaults = default_metrics(1000);
        assert_eq!(defaults.len(), 3);
        assert_eq!(defaults[0].name, POLLING_INTERVAL_METRIC);
        assert_eq!(defaults[0].metric_type, MetricType::UInt16);
        assert_eq!(defaults[0].value, MetricValue::UInt(1000));
        assert!(defaults.iter().all(|m| m.transient));
        // control metrics are write targets, not read participants
        assert!(defaults.iter().all(|m| !m.is_readable()));
    }
}
