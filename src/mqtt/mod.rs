//! # MQTT plumbing
//!
//! ```text
//! mqtt/
//! ├── config.rs           - broker settings to rumqttc options
//! ├── discovery.rs        - retained Home Assistant discovery topics
//! ├── message_manager.rs  - inbound messages and command routing
//! └── mqtt_handler.rs     - transport traits and the rumqttc adapter
//! ```
//!
//! The connection lifecycle itself lives in [`crate::session`]; this module
//! only knows how to talk to a broker, not when.

pub mod config;
pub mod discovery;
pub mod message_manager;
pub mod mqtt_handler;
