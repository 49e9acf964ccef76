//! Bridge between the serial link of a power-monitoring controller and a realtime database.
//!
//! Telemetry frames received from the serial link are published to the `monitoring` node.
//! Commands written to `monitoring/command` are forwarded to the serial link and the node is
//! deleted once consumed.

pub mod libs;
