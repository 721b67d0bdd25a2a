//! Translator supervisor
//!
//! Owns every connection and device: fetches identity and config,
//! constructs one driver per declared connection and one device per
//! declared device, wires driver events to devices, routes Sparkplug
//! commands, and orchestrates graceful shutdown.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::config::{self, ConfigPersister, LocalConfig};
use super::connection::registry::{self, DriverLookup};
use super::connection::DeviceConnection;
use super::device::{self, DeviceCommand, DeviceHandle};
use super::services::{retry_until, ConfigService, IdentityService, EDGE_AGENT_APP_UUID};
use super::sparkplug::{MqttSparkplugNode, SparkplugEvent, SparkplugNode};
use crate::utils::{ErrorExt, Result};

/// Bootstrap settings: where the config and identity services live and
/// where the local config mirror is kept.
#[derive(Debug, Clone, Deserialize)]
pub struct TranslatorSettings {
    pub config_url: String,
    pub identity_url: String,
    #[serde(default = "default_retry_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_local_config")]
    pub local_config: String,
}

fn default_retry_secs() -> u64 {
    10
}

fn default_local_config() -> String {
    "./config/conf.json".to_string()
}

/// The running translator. Exclusively owns all connections and devices.
pub struct Translator {
    node: Arc<dyn SparkplugNode>,
    connections: Vec<Arc<dyn DeviceConnection>>,
    devices: Vec<DeviceHandle>,
    router: JoinHandle<()>,
    stop_requested: CancellationToken,
}

impl Translator {
    /// Build connections and devices from a validated config document and
    /// an already-constructed Sparkplug node, wire events, and open every
    /// connection.
    pub async fn start(
        doc: &LocalConfig,
        node: Arc<dyn SparkplugNode>,
        persister: Arc<ConfigPersister>,
    ) -> Result<Self> {
        let plans = config::rehash(doc)?;

        let mut connections: Vec<Arc<dyn DeviceConnection>> = Vec::new();
        let mut devices: Vec<DeviceHandle> = Vec::new();

        for plan in plans {
            match registry::lookup(&plan.conn_type) {
                DriverLookup::Available { details_key, build } => {
                    let details = plan
                        .details
                        .get(details_key)
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({}));
                    // a driver constructor failure aborts startup
                    let conn = match build(plan.name.clone(), details) {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(connection = %plan.name, "driver construction failed: {e}");
                            for device in devices {
                                device.stop().await;
                            }
                            for conn in &connections {
                                let _ = conn.close().await;
                            }
                            let _ = node.stop().await;
                            return Err(e);
                        }
                    };
                    for spec in plan.devices {
                        devices.push(device::spawn(
                            spec,
                            conn.clone(),
                            node.clone(),
                            persister.clone(),
                        ));
                    }
                    connections.push(conn);
                }
                DriverLookup::External { details_key } => {
                    warn!(
                        connection = %plan.name,
                        conn_type = %plan.conn_type,
                        details_key,
                        "connection type requires external protocol bindings, skipped"
                    );
                }
                DriverLookup::Unknown => {
                    warn!(
                        connection = %plan.name,
                        conn_type = %plan.conn_type,
                        "unknown connection type, skipped"
                    );
                }
            }
        }

        let stop_requested = CancellationToken::new();
        let router = spawn_router(
            node.clone(),
            devices
                .iter()
                .map(|d| (d.device_id.clone(), d.command_sender()))
                .collect(),
            stop_requested.clone(),
        );

        for conn in &connections {
            if let Err(e) = conn.open().await {
                // transient I/O: drivers reconnect on their own
                warn!(connection = conn.name(), "open failed: {e}");
            }
        }

        info!(
            connections = connections.len(),
            devices = devices.len(),
            "translator started"
        );
        Ok(Self {
            node,
            connections,
            devices,
            router,
            stop_requested,
        })
    }

    /// Fetch identity and config (retrying indefinitely), mirror the
    /// config locally, construct the Sparkplug node, and start.
    pub async fn bootstrap(settings: &TranslatorSettings) -> Result<Self> {
        let interval = Duration::from_secs(settings.retry_interval_secs);

        let identity = IdentityService::new(&settings.identity_url);
        let principal = retry_until("identity", interval, || identity.find_principal()).await;
        info!(uuid = %principal.uuid, "principal resolved");

        let config_service = ConfigService::new(&settings.config_url);
        let doc = retry_until("config", interval, || {
            config_service.get_config(EDGE_AGENT_APP_UUID, &principal.uuid)
        })
        .await;

        // keep the local mirror current; polling-interval commands rewrite it
        let local_path = Path::new(&settings.local_config);
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)
                .config_error("creating local config directory")?;
        }
        std::fs::write(local_path, serde_json::to_string_pretty(&doc)?)
            .config_error("writing local config mirror")?;
        let persister = Arc::new(ConfigPersister::new(local_path));

        let mut sparkplug = doc.sparkplug.clone();
        sparkplug.group_id = principal.sparkplug.group_id.clone();
        sparkplug.node_id = principal.sparkplug.node_id.clone();
        let node = Arc::new(MqttSparkplugNode::connect(sparkplug).await?);

        Self::start(&doc, node, persister).await
    }

    /// Resolved when the Sparkplug layer asked the translator to stop.
    pub fn stop_requested(&self) -> CancellationToken {
        self.stop_requested.clone()
    }

    /// Stop every device, close every connection, stop the node.
    pub async fn stop(self) {
        info!("translator stopping");
        self.router.abort();
        for device in self.devices {
            device.stop().await;
        }
        for conn in &self.connections {
            if let Err(e) = conn.close().await {
                warn!(connection = conn.name(), "close failed: {e}");
            }
        }
        if let Err(e) = self.node.stop().await {
            warn!("sparkplug node stop failed: {e}");
        }
        info!("translator stopped");
    }
}

/// Route Sparkplug events to the owning devices.
fn spawn_router(
    node: Arc<dyn SparkplugNode>,
    senders: HashMap<String, mpsc::Sender<DeviceCommand>>,
    stop_requested: CancellationToken,
) -> JoinHandle<()> {
    let mut events = node.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SparkplugEvent::Dcmd(device_id, metrics)) => {
                    match senders.get(&device_id) {
                        Some(tx) => {
                            if tx.send(DeviceCommand::Dcmd(metrics)).await.is_err() {
                                warn!(%device_id, "device task gone, DCMD dropped");
                            }
                        }
                        None => warn!(%device_id, "DCMD for unknown device"),
                    }
                }
                Ok(SparkplugEvent::Dbirth(device_id)) => match senders.get(&device_id) {
                    Some(tx) => {
                        let _ = tx.send(DeviceCommand::Rebirth).await;
                    }
                    None => warn!(%device_id, "birth request for unknown device"),
                },
                Ok(SparkplugEvent::DbirthAll) => {
                    for tx in senders.values() {
                        let _ = tx.send(DeviceCommand::Rebirth).await;
                    }
                }
                Ok(SparkplugEvent::Stop) => {
                    info!("stop requested by the sparkplug layer");
                    stop_requested.cancel();
                    return;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(dropped = n, "sparkplug event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}
