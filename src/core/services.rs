//! Config and identity service clients
//!
//! Both are polled with the same fixed-interval retry until they produce
//! a usable answer; an unreachable or invalid response is logged and
//! retried indefinitely.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::config::LocalConfig;

/// The edge-agent application UUID in the config service.
pub const EDGE_AGENT_APP_UUID: &str = "aac6f843-cfee-4683-b121-6943bfdf9173";

/// Sparkplug address assigned to this node by the identity service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SparkplugAddress {
    pub group_id: String,
    pub node_id: String,
}

/// This node's identity.
#[derive(Debug, Clone, Deserialize)]
pub struct Principal {
    pub uuid: Uuid,
    pub sparkplug: SparkplugAddress,
}

/// Loop a probe at a fixed interval until it yields a value, logging
/// every attempt.
pub async fn retry_until<T, F, Fut>(name: &str, interval: Duration, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let mut attempt = 0u64;
    loop {
        attempt += 1;
        if let Some(value) = probe().await {
            info!(name, attempt, "probe succeeded");
            return value;
        }
        warn!(name, attempt, retry_in = ?interval, "probe failed, retrying");
        tokio::time::sleep(interval).await;
    }
}

/// Identity service client.
pub struct IdentityService {
    base_url: String,
    client: reqwest::Client,
}

impl IdentityService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Look up this node's principal; `None` until the service answers
    /// with a complete identity.
    pub async fn find_principal(&self) -> Option<Principal> {
        let url = format!("{}/v1/principal", self.base_url.trim_end_matches('/'));
        let resp = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(%url, status = %resp.status(), "identity lookup rejected");
                return None;
            }
            Err(e) => {
                warn!(%url, "identity lookup failed: {e}");
                return None;
            }
        };
        match resp.json::<Principal>().await {
            Ok(p) if !p.uuid.is_nil() => Some(p),
            Ok(_) => {
                warn!("identity lookup returned an empty principal");
                None
            }
            Err(e) => {
                warn!("identity payload undecodable: {e}");
                None
            }
        }
    }
}

/// Config service client.
pub struct ConfigService {
    base_url: String,
    client: reqwest::Client,
}

impl ConfigService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Fetch this node's edge-agent config; `None` until it validates.
    pub async fn get_config(&self, app_uuid: &str, node_uuid: &Uuid) -> Option<LocalConfig> {
        let url = format!(
            "{}/v1/app/{app_uuid}/object/{node_uuid}",
            self.base_url.trim_end_matches('/')
        );
        let resp = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(%url, status = %resp.status(), "config fetch rejected");
                return None;
            }
            Err(e) => {
                warn!(%url, "config fetch failed: {e}");
                return None;
            }
        };
        match resp.json::<LocalConfig>().await {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!("config document invalid: {e}");
                None
            }
        }
    }
}
