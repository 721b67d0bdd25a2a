//! Metric model and the per-device metric store
//!
//! A device owns one [`MetricStore`]: an ordered metric sequence plus four
//! indices (name, alias, address, (address, path)). Indices are rebuilt on
//! every add; setters write value, timestamp and null-state together and
//! return the updated snapshot.

use std::collections::HashMap;

use chrono::Utc;

use super::types::{Endianness, MetricType, MetricValue};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Recognised metric properties, plus an escape hatch for anything a
/// driver wants to carry along.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricProperties {
    /// Access method; only metrics whose method starts with `GET`
    /// participate in reads.
    pub method: String,
    /// Native device address (PLC register, node id, HTTP path, topic).
    pub address: String,
    /// Sub-selector within the payload returned for `address` (JSONPath,
    /// XPath, byte offset, delimited field index).
    pub path: String,
    pub friendly_name: Option<String>,
    pub tooltip: Option<String>,
    pub documentation: Option<String>,
    pub eng_unit: Option<String>,
    pub eng_low: Option<f64>,
    pub eng_high: Option<f64>,
    /// Change-suppression threshold. Preserved and surfaced northbound,
    /// not enforced numerically.
    pub deadband: Option<f64>,
    pub endianness: Endianness,
    pub extra: HashMap<String, serde_json::Value>,
}

/// The atomic unit of translation: one named, typed, addressable value.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Unique per device, hierarchical with `/` separators.
    pub name: String,
    /// Assigned by the Sparkplug layer after BIRTH.
    pub alias: Option<u64>,
    pub metric_type: MetricType,
    pub value: MetricValue,
    /// Milliseconds since epoch of the last value change.
    pub timestamp_ms: i64,
    /// Transient metrics are not persisted by downstream historians.
    pub transient: bool,
    pub properties: MetricProperties,
}

impl Metric {
    pub fn new(name: impl Into<String>, metric_type: MetricType) -> Self {
        Self {
            name: name.into(),
            alias: None,
            metric_type,
            value: MetricValue::Null,
            timestamp_ms: now_ms(),
            transient: false,
            properties: MetricProperties::default(),
        }
    }

    /// True when the metric participates in reads.
    pub fn is_readable(&self) -> bool {
        self.properties.method.starts_with("GET")
    }

    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }
}

/// Ordered metric sequence with name, alias, address and (address, path)
/// indices. The (address, path) index covers readable metrics only; it is
/// what subscriptions and inbound data routing enumerate.
#[derive(Debug, Default)]
pub struct MetricStore {
    metrics: Vec<Metric>,
    by_name: HashMap<String, usize>,
    by_alias: HashMap<u64, usize>,
    by_addr: HashMap<String, Vec<usize>>,
    by_addr_path: HashMap<(String, String), usize>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Vec<Metric>) -> Self {
        let mut store = Self::default();
        store.add(metrics);
        store
    }

    /// Append metrics and rebuild every index.
    pub fn add(&mut self, metrics: Vec<Metric>) {
        self.metrics.extend(metrics);
        self.rebuild_indices();
    }

    fn rebuild_indices(&mut self) {
        self.by_name.clear();
        self.by_alias.clear();
        self.by_addr.clear();
        self.by_addr_path.clear();
        for (i, m) in self.metrics.iter().enumerate() {
            self.by_name.insert(m.name.clone(), i);
            if let Some(alias) = m.alias {
                self.by_alias.insert(alias, i);
            }
            if !m.properties.address.is_empty() {
                self.by_addr
                    .entry(m.properties.address.clone())
                    .or_default()
                    .push(i);
            }
            if m.is_readable() && !m.properties.address.is_empty() {
                self.by_addr_path.insert(
                    (m.properties.address.clone(), m.properties.path.clone()),
                    i,
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Ordered view of all metrics.
    pub fn array(&self) -> &[Metric] {
        &self.metrics
    }

    /// Distinct addresses of readable metrics, taken from the
    /// (address, path) index.
    pub fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .by_addr_path
            .keys()
            .map(|(addr, _)| addr.clone())
            .collect();
        addrs.sort();
        addrs.dedup();
        addrs
    }

    /// Record the alias the Sparkplug layer assigned to the metric at
    /// position `index`.
    pub fn set_alias(&mut self, index: usize, alias: u64) {
        if let Some(m) = self.metrics.get_mut(index) {
            if let Some(old) = m.alias.take() {
                self.by_alias.remove(&old);
            }
            m.alias = Some(alias);
            self.by_alias.insert(alias, index);
        }
    }

    pub fn set_alias_by_name(&mut self, name: &str, alias: u64) -> bool {
        match self.by_name.get(name).copied() {
            Some(i) => {
                self.set_alias(i, alias);
                true
            }
            None => false,
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Metric> {
        self.by_name.get(name).map(|&i| &self.metrics[i])
    }

    pub fn get_by_alias(&self, alias: u64) -> Option<&Metric> {
        self.by_alias.get(&alias).map(|&i| &self.metrics[i])
    }

    pub fn get_by_address(&self, address: &str) -> Vec<&Metric> {
        self.by_addr
            .get(address)
            .map(|idx| idx.iter().map(|&i| &self.metrics[i]).collect())
            .unwrap_or_default()
    }

    /// Paths registered under an address in the (address, path) index.
    pub fn paths_for_addr(&self, address: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .by_addr_path
            .keys()
            .filter(|(addr, _)| addr == address)
            .map(|(_, path)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn get_by_addr_path(&self, address: &str, path: &str) -> Option<&Metric> {
        self.by_addr_path
            .get(&(address.to_string(), path.to_string()))
            .map(|&i| &self.metrics[i])
    }

    fn set_value_at(&mut self, index: usize, value: MetricValue, ts: Option<i64>) -> Metric {
        let m = &mut self.metrics[index];
        m.value = value;
        m.timestamp_ms = ts.unwrap_or_else(now_ms);
        m.clone()
    }

    /// Update value + timestamp atomically; returns the updated snapshot.
    pub fn set_value_by_name(
        &mut self,
        name: &str,
        value: MetricValue,
        ts: Option<i64>,
    ) -> Option<Metric> {
        self.by_name
            .get(name)
            .copied()
            .map(|i| self.set_value_at(i, value, ts))
    }

    pub fn set_value_by_alias(
        &mut self,
        alias: u64,
        value: MetricValue,
        ts: Option<i64>,
    ) -> Option<Metric> {
        self.by_alias
            .get(&alias)
            .copied()
            .map(|i| self.set_value_at(i, value, ts))
    }

    pub fn set_value_by_addr_path(
        &mut self,
        address: &str,
        path: &str,
        value: MetricValue,
        ts: Option<i64>,
    ) -> Option<Metric> {
        self.by_addr_path
            .get(&(address.to_string(), path.to_string()))
            .copied()
            .map(|i| self.set_value_at(i, value, ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gauge(name: &str, addr: &str, path: &str) -> Metric {
        let mut m = Metric::new(name, MetricType::Double);
        m.properties.method = "GET".into();
        m.properties.address = addr.into();
        m.properties.path = path.into();
        m
    }

    #[test]
    fn test_indices_and_lookup() {
        let mut store = MetricStore::with_metrics(vec![
            gauge("Line/Temp", "sensors", "$.temp"),
            gauge("Line/Pressure", "sensors", "$.pressure"),
            gauge("Line/Speed", "axis1", ""),
        ]);

        assert_eq!(store.len(), 3);
        assert_eq!(store.addresses(), vec!["axis1".to_string(), "sensors".to_string()]);
        assert_eq!(store.get_by_address("sensors").len(), 2);
        assert_eq!(
            store.paths_for_addr("sensors"),
            vec!["$.pressure".to_string(), "$.temp".to_string()]
        );
        assert!(store.get_by_addr_path("sensors", "$.temp").is_some());
        assert!(store.get_by_addr_path("sensors", "$.missing").is_none());

        store.set_alias_by_name("Line/Temp", 7);
        assert_eq!(store.get_by_alias(7).map(|m| m.name.as_str()), Some("Line/Temp"));
    }

    #[test]
    fn test_addr_path_unique_per_pair() {
        let store = MetricStore::with_metrics(vec![
            gauge("A", "dev", "$.x"),
            gauge("B", "dev", "$.y"),
        ]);
        // exactly one metric per (address, path) pair
        assert_eq!(store.get_by_addr_path("dev", "$.x").map(|m| m.name.as_str()), Some("A"));
        assert_eq!(store.get_by_addr_path("dev", "$.y").map(|m| m.name.as_str()), Some("B"));
    }

    #[test]
    fn test_setter_updates_value_and_timestamp() {
        let mut store = MetricStore::with_metrics(vec![gauge("A", "dev", "$.x")]);
        let before = store.get_by_name("A").map(|m| m.timestamp_ms).unwrap_or(0);

        let snap = store
            .set_value_by_name("A", MetricValue::Float(1.5), Some(before + 10))
            .expect("metric exists");
        assert_eq!(snap.value, MetricValue::Float(1.5));
        assert_eq!(snap.timestamp_ms, before + 10);
        assert!(!snap.is_null());

        // monotonic across successive authoritative updates
        let snap2 = store
            .set_value_by_name("A", MetricValue::Float(2.5), None)
            .expect("metric exists");
        assert!(snap2.timestamp_ms >= snap.timestamp_ms);
    }

    #[test]
    fn test_non_get_metric_excluded_from_addr_path() {
        let mut writable = Metric::new("Setpoint", MetricType::Int32);
        writable.properties.method = "PUT".into();
        writable.properties.address = "dev".into();
        let mut store = MetricStore::with_metrics(vec![writable, gauge("A", "dev", "$.x")]);

        assert_eq!(store.paths_for_addr("dev"), vec!["$.x".to_string()]);
        // setters still work for non-GET metrics (command handling uses them)
        assert!(store
            .set_value_by_name("Setpoint", MetricValue::Int(4), None)
            .is_some());
        // but the plain address index sees both
        assert_eq!(store.get_by_address("dev").len(), 2);
    }
}
