//! Device-translation engine
//!
//! Southbound driver contract and drivers, the metric model and codec
//! layer, the per-device lifecycle engine, and the supervisor that wires
//! them to the Sparkplug layer.

pub mod codec;
pub mod config;
pub mod connection;
pub mod device;
pub mod metrics;
pub mod services;
pub mod sparkplug;
pub mod translator;
pub mod types;
