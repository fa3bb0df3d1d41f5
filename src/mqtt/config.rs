use crate::config::GlobalConfig;
use rumqttc::{LastWill, MqttOptions, QoS};
use std::time::Duration;

/// Payload the broker publishes on the status topic when the agent vanishes
pub const OFFLINE_PAYLOAD: &str = "offline";

/// Everything needed to open a broker connection
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    /// Topic that receives [`OFFLINE_PAYLOAD`] as last will
    pub last_will_topic: Option<String>,
}

impl MqttConfig {
    pub fn from_global(global: &GlobalConfig, last_will_topic: Option<String>) -> Self {
        Self {
            host: global.broker.clone(),
            port: global.port,
            client_id: global.client_id(),
            credentials: global.credentials(),
            keep_alive: Duration::from_secs(global.keep_alive.max(1)),
            last_will_topic,
        }
    }

    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        if let Some((user, password)) = &self.credentials {
            options.set_credentials(user.clone(), password.clone());
        }
        if let Some(topic) = &self.last_will_topic {
            options.set_last_will(LastWill::new(
                topic.clone(),
                OFFLINE_PAYLOAD,
                QoS::AtMostOnce,
                false,
            ));
        }
        options
    }
}
