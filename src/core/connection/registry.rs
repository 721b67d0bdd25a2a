//! Southbound driver registry
//!
//! Maps the declared connection type to its driver factory and the config
//! key its details live under. Connection types that need external
//! protocol bindings are recognised but not constructible here; unknown
//! types are the caller's to log and skip.

use std::sync::Arc;

use super::{ascii_tcp, mqtt, mtconnect, open_protocol, rest, udp, websocket, DeviceConnection};
use crate::utils::Result;

/// Driver factory: connection name + details document.
pub type BuildFn = fn(String, serde_json::Value) -> Result<Arc<dyn DeviceConnection>>;

/// Outcome of a registry lookup.
pub enum DriverLookup {
    /// An in-tree driver exists.
    Available {
        details_key: &'static str,
        build: BuildFn,
    },
    /// The type is recognised but requires external protocol bindings.
    External { details_key: &'static str },
    /// Not a known connection type.
    Unknown,
}

/// Fixed registry of connection types.
pub fn lookup(conn_type: &str) -> DriverLookup {
    match conn_type {
        "REST" => DriverLookup::Available {
            details_key: "RESTConnDetails",
            build: rest::build,
        },
        "MTConnect" => DriverLookup::Available {
            details_key: "MTConnectConnDetails",
            build: mtconnect::build,
        },
        "MQTT" => DriverLookup::Available {
            details_key: "MQTTConnDetails",
            build: mqtt::build,
        },
        "Websocket" => DriverLookup::Available {
            details_key: "WebsocketConnDetails",
            build: websocket::build,
        },
        "UDP" => DriverLookup::Available {
            details_key: "UDPConnDetails",
            build: udp::build,
        },
        "ASCIITCP" => DriverLookup::Available {
            details_key: "ASCIITCPConnDetails",
            build: ascii_tcp::build,
        },
        "OpenProtocol" => DriverLookup::Available {
            details_key: "OpenProtocolConnDetails",
            build: open_protocol::build,
        },
        "S7" => DriverLookup::External {
            details_key: "s7ConnDetails",
        },
        "OPC UA" => DriverLookup::External {
            details_key: "OPCUAConnDetails",
        },
        _ => DriverLookup::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_classes() {
        assert!(matches!(lookup("REST"), DriverLookup::Available { .. }));
        assert!(matches!(lookup("MQTT"), DriverLookup::Available { .. }));
        assert!(matches!(lookup("S7"), DriverLookup::External { .. }));
        assert!(matches!(lookup("OPC UA"), DriverLookup::External { .. }));
        assert!(matches!(lookup("Fieldbus"), DriverLookup::Unknown));
    }

    #[test]
    fn test_details_keys() {
        if let DriverLookup::Available { details_key, .. } = lookup("REST") {
            assert_eq!(details_key, "RESTConnDetails");
        } else {
            panic!("REST should be available");
        }
        if let DriverLookup::External { details_key } = lookup("S7") {
            assert_eq!(details_key, "s7ConnDetails");
        } else {
            panic!("S7 should be external");
        }
    }
}
