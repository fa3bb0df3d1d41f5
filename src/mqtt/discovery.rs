//! Home Assistant MQTT discovery
//!
//! After every successful handshake each discoverable entity gets a retained
//! config message on `<base>/<component>/<node_id>/<object_id>/config`. The
//! payload comes from a formatter supplied with the entity. With discovery
//! disabled the same topics receive an empty retained payload, which removes
//! the entity from Home Assistant again.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::mqtt::mqtt_handler::Publisher;

/// Everything a formatter may put into a discovery payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiscoveryTarget<'a> {
    /// Human readable device name
    pub device_name: &'a str,
    pub node_id: &'a str,
    pub object_id: &'a str,
    /// Topic the entity publishes its value on
    pub state_topic: &'a str,
}

type Formatter = Arc<dyn Fn(&DiscoveryTarget<'_>) -> String + Send + Sync>;

#[derive(Clone)]
struct Discoverable {
    component: String,
    object_id: String,
    state_topic: String,
    formatter: Formatter,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub published: usize,
    pub failed: usize,
}

/// Discovery announcements for one device
#[derive(Clone, Default)]
pub struct Discovery {
    enabled: bool,
    base: String,
    node_id: String,
    device_name: String,
    entities: Vec<Discoverable>,
}

impl Discovery {
    pub fn new(
        enabled: bool,
        base: impl Into<String>,
        node_id: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            enabled,
            base: base.into(),
            node_id: node_id.into(),
            device_name: device_name.into(),
            entities: Vec::new(),
        }
    }

    /// Add an entity, e.g. component `sensor` with object id `lux`.
    pub fn with_entity(
        mut self,
        component: impl Into<String>,
        object_id: impl Into<String>,
        state_topic: impl Into<String>,
        formatter: impl Fn(&DiscoveryTarget<'_>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.entities.push(Discoverable {
            component: component.into(),
            object_id: object_id.into(),
            state_topic: state_topic.into(),
            formatter: Arc::new(formatter),
        });
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn topics(&self) -> Vec<String> {
        self.entities.iter().map(|e| self.topic(e)).collect()
    }

    fn topic(&self, entity: &Discoverable) -> String {
        format!(
            "{}/{}/{}/{}/config",
            self.base, entity.component, self.node_id, entity.object_id
        )
    }

    /// Publish (or clear) every discovery topic, retained.
    pub fn announce(&self, publisher: &dyn Publisher) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        if self.entities.is_empty() {
            return report;
        }
        if self.enabled {
            info!("Publishing discovery for {} entities", self.entities.len());
        } else {
            info!("Discovery disabled, removing {} entities", self.entities.len());
        }

        for entity in &self.entities {
            let topic = self.topic(entity);
            let payload = if self.enabled {
                (entity.formatter)(&DiscoveryTarget {
                    device_name: &self.device_name,
                    node_id: &self.node_id,
                    object_id: &entity.object_id,
                    state_topic: &entity.state_topic,
                })
            } else {
                String::new()
            };

            match publisher.publish(&topic, &payload, true) {
                Ok(()) => {
                    debug!("Send '{}' to topic {}", payload, topic);
                    report.published += 1;
                }
                Err(e) => {
                    error!("Failed to send message to topic {}: {}", topic, e);
                    report.failed += 1;
                }
            }
        }
        report
    }
}

impl fmt::Debug for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discovery")
            .field("enabled", &self.enabled)
            .field("base", &self.base)
            .field("node_id", &self.node_id)
            .field("entities", &self.entities.len())
            .finish()
    }
}
