//! MQTT bridge for a BH1750 light sensor
//!
//! Publishes sensor readings under `<topic_root>/<device_name>/<entity>` and
//! accepts commands on `<topic_root>/<device_name>/<entity>/set`.
//!
//! ```text
//! config ──► mqtt::config ──► RumqttTransport
//!                                   │
//!            registry ◄── sensor    ▼
//!               │            session (statum state machine, I/O task)
//!               │                   │  dispatch      ▲ SharedState
//!               ▼                   ▼                │
//!          publish_loop ──► SessionHandle ──► broker
//! ```

pub mod config;
pub mod mqtt;
pub mod publish_loop;
pub mod registry;
pub mod sensor;
pub mod session;
