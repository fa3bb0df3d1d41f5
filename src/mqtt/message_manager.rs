//! Inbound command routing
//!
//! Commands arrive on `<root>/<topic_suffix>/set`. Anything else that reaches
//! the client is logged and dropped; nothing in here can fail in a way that
//! reaches the broker connection.

use bytes::Bytes;
use chrono::{DateTime, Local};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::registry::{CommandContext, Commandable, TopicRegistry};

/// Verb of the only inbound topic shape the agent understands
pub const SET_VERB: &str = "set";

/// A PUBLISH received from the broker
#[derive(Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} `{}` from `{}`",
            self.received_at.format("%H:%M:%S%.3f"),
            String::from_utf8_lossy(&self.payload).trim(),
            self.topic
        )
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InboundMessage({self})")
    }
}

/// Why a message was not handed to a command handler
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Topic is not below the device root
    OutsideRoot,
    /// Topic is not `<root>/<name>/<verb>`
    Malformed,
    WrongVerb(String),
    UnknownTopic(String),
    /// Entity exists but takes no commands
    NoCommand(String),
    InvalidPayload,
    HandlerFailed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Handled { key: String },
    Dropped(DropReason),
}

struct Route {
    key: String,
    topic_suffix: String,
    handler: Option<Arc<dyn Commandable>>,
}

/// Command side of the topic registry, owned by the I/O task
pub struct CommandRouter {
    root: String,
    routes: Vec<Route>,
    context: CommandContext,
}

impl CommandRouter {
    pub fn new(root: impl Into<String>, registry: &TopicRegistry, context: CommandContext) -> Self {
        let routes = registry
            .all_entries()
            .map(|entry| Route {
                key: entry.key().to_string(),
                topic_suffix: entry.topic_suffix().to_string(),
                handler: entry.commander(),
            })
            .collect();
        Self {
            root: root.into(),
            routes,
            context,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// `<root>/<suffix>/set` for every entity with a command handler
    pub fn subscriptions(&self) -> Vec<String> {
        self.routes
            .iter()
            .filter(|route| route.handler.is_some())
            .map(|route| format!("{}/{}/{}", self.root, route.topic_suffix, SET_VERB))
            .collect()
    }

    pub fn dispatch(&self, message: &InboundMessage) -> Dispatch {
        debug!("Received {}", message);

        let outcome = self.route(message);
        match &outcome {
            Dispatch::Handled { key } => debug!("Command for '{}' handled", key),
            Dispatch::Dropped(DropReason::HandlerFailed(reason)) => {
                warn!("Command on {} failed: {}", message.topic, reason)
            }
            Dispatch::Dropped(DropReason::NoCommand(_)) => info!(
                "Command for topic without command received from broker {}",
                message.topic
            ),
            Dispatch::Dropped(DropReason::UnknownTopic(_)) => info!(
                "Command for unknown topic received from broker {}",
                message.topic
            ),
            Dispatch::Dropped(DropReason::InvalidPayload) => {
                info!("Payload on {} is not valid UTF-8", message.topic)
            }
            Dispatch::Dropped(_) => {
                info!("Wrong topic syntax received from broker {}", message.topic)
            }
        }
        outcome
    }

    fn route(&self, message: &InboundMessage) -> Dispatch {
        let Some(rest) = message.topic.strip_prefix(self.root.as_str()) else {
            return Dispatch::Dropped(DropReason::OutsideRoot);
        };

        // rest is "/<name>/<verb>", which splits into exactly three parts
        let parts: Vec<&str> = rest.split('/').collect();
        let [lead, name, verb] = parts.as_slice() else {
            return Dispatch::Dropped(DropReason::Malformed);
        };
        if !lead.is_empty() {
            return Dispatch::Dropped(DropReason::OutsideRoot);
        }
        if *verb != SET_VERB {
            return Dispatch::Dropped(DropReason::WrongVerb(verb.to_string()));
        }

        let Some(route) = self.routes.iter().find(|r| r.topic_suffix == *name) else {
            return Dispatch::Dropped(DropReason::UnknownTopic(name.to_string()));
        };
        let Some(handler) = &route.handler else {
            return Dispatch::Dropped(DropReason::NoCommand(route.key.clone()));
        };

        let Ok(payload) = std::str::from_utf8(&message.payload) else {
            return Dispatch::Dropped(DropReason::InvalidPayload);
        };

        // A panicking handler must not take the I/O task down with it.
        match catch_unwind(AssertUnwindSafe(|| handler.command(payload, &self.context))) {
            Ok(Ok(())) => Dispatch::Handled {
                key: route.key.clone(),
            },
            Ok(Err(e)) => Dispatch::Dropped(DropReason::HandlerFailed(e.to_string())),
            Err(_) => Dispatch::Dropped(DropReason::HandlerFailed(format!(
                "handler for '{}' panicked",
                route.key
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Capabilities, EntityError};
    use crate::session::state::SharedState;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::MakeWriter;

    fn router_with_recorder() -> (CommandRouter, Arc<Mutex<Vec<String>>>, SharedState) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let mut registry = TopicRegistry::new();
        registry
            .register(
                "bh1750",
                "lux",
                Capabilities::both(
                    || Ok::<_, EntityError>("1.00".to_string()),
                    move |payload: &str, _: &CommandContext| -> Result<(), EntityError> {
                        recorder.lock().unwrap().push(payload.to_string());
                        Ok(())
                    },
                ),
            )
            .unwrap();
        registry
            .register(
                "uptime",
                "uptime",
                Capabilities::publish(|| Ok::<_, EntityError>("1".to_string())),
            )
            .unwrap();
        let refresh = |payload: &str, ctx: &CommandContext| -> Result<(), EntityError> {
            if payload == "refresh" {
                ctx.request_refresh();
                Ok(())
            } else {
                Err(EntityError::InvalidCommand(payload.to_string()))
            }
        };
        registry
            .register("status", "status", Capabilities::command(refresh))
            .unwrap();

        let state = SharedState::new();
        let router = CommandRouter::new(
            "devices/kitchen",
            &registry,
            CommandContext::new(state.clone()),
        );
        (router, seen, state)
    }

    #[test]
    fn routes_set_command_to_handler_once() {
        let (router, seen, _) = router_with_recorder();
        let outcome = router.dispatch(&InboundMessage::new("devices/kitchen/lux/set", "0x21"));
        assert_eq!(outcome, Dispatch::Handled { key: "bh1750".into() });
        assert_eq!(*seen.lock().unwrap(), vec!["0x21".to_string()]);
    }

    #[test]
    fn payload_is_passed_verbatim() {
        let (router, seen, _) = router_with_recorder();
        router.dispatch(&InboundMessage::new("devices/kitchen/lux/set", "  16 \n"));
        assert_eq!(*seen.lock().unwrap(), vec!["  16 \n".to_string()]);
    }

    /// Collects formatted log output of a scoped subscriber
    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl LogCapture {
        fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock().unwrap())
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for LogCapture {
        type Writer = LogCapture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn unknown_topic_is_dropped() {
        let (router, seen, _) = router_with_recorder();
        let capture = LogCapture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .finish();

        let message = InboundMessage::new("devices/kitchen/unknown/set", "1");
        let outcome = tracing::subscriber::with_default(subscriber, || router.dispatch(&message));

        assert_eq!(outcome, Dispatch::Dropped(DropReason::UnknownTopic("unknown".into())));
        assert!(seen.lock().unwrap().is_empty());
        let lines = capture.lines();
        assert_eq!(lines.len(), 1, "{lines:?}");
        assert!(lines[0].contains("unknown topic"));
        assert!(lines[0].contains("devices/kitchen/unknown/set"));
    }

    #[test]
    fn wrong_verb_is_dropped() {
        let (router, seen, _) = router_with_recorder();
        let outcome =
            router.dispatch(&InboundMessage::new("devices/kitchen/lux/commandtypo", "1"));
        assert_eq!(
            outcome,
            Dispatch::Dropped(DropReason::WrongVerb("commandtypo".into()))
        );
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn malformed_topics_are_dropped() {
        let (router, seen, _) = router_with_recorder();
        for topic in [
            "devices/kitchen",
            "devices/kitchen/lux",
            "devices/kitchen/lux/set/extra",
        ] {
            assert_eq!(
                router.dispatch(&InboundMessage::new(topic, "1")),
                Dispatch::Dropped(DropReason::Malformed),
                "{topic}"
            );
        }
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn foreign_roots_are_dropped() {
        let (router, _, _) = router_with_recorder();
        assert_eq!(
            router.dispatch(&InboundMessage::new("devices/garage/lux/set", "1")),
            Dispatch::Dropped(DropReason::OutsideRoot)
        );
        // Shares the prefix but not the topic level
        assert_eq!(
            router.dispatch(&InboundMessage::new("devices/kitchenette/lux/set", "1")),
            Dispatch::Dropped(DropReason::OutsideRoot)
        );
    }

    #[test]
    fn entity_without_command_is_dropped() {
        let (router, _, _) = router_with_recorder();
        assert_eq!(
            router.dispatch(&InboundMessage::new("devices/kitchen/uptime/set", "1")),
            Dispatch::Dropped(DropReason::NoCommand("uptime".into()))
        );
    }

    #[test]
    fn handler_error_is_swallowed() {
        let (router, _, _) = router_with_recorder();
        let outcome = router.dispatch(&InboundMessage::new("devices/kitchen/status/set", "nope"));
        assert!(matches!(
            outcome,
            Dispatch::Dropped(DropReason::HandlerFailed(_))
        ));
    }

    #[test]
    fn handler_can_request_refresh() {
        let (router, _, state) = router_with_recorder();
        state.with(|s| s.dirty = false);
        router.dispatch(&InboundMessage::new("devices/kitchen/status/set", "refresh"));
        assert!(state.is_dirty());
    }

    #[test]
    fn invalid_utf8_is_dropped() {
        let (router, seen, _) = router_with_recorder();
        let outcome = router.dispatch(&InboundMessage::new(
            "devices/kitchen/lux/set",
            Bytes::from_static(&[0xff, 0xfe]),
        ));
        assert_eq!(outcome, Dispatch::Dropped(DropReason::InvalidPayload));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_handler_is_contained() {
        let mut registry = TopicRegistry::new();
        registry
            .register(
                "boom",
                "boom",
                Capabilities::command(|_: &str, _: &CommandContext| -> Result<(), EntityError> {
                    panic!("handler bug")
                }),
            )
            .unwrap();
        let router = CommandRouter::new(
            "devices/kitchen",
            &registry,
            CommandContext::new(SharedState::new()),
        );
        assert!(matches!(
            router.dispatch(&InboundMessage::new("devices/kitchen/boom/set", "x")),
            Dispatch::Dropped(DropReason::HandlerFailed(_))
        ));
    }

    #[test]
    fn subscribes_only_commandable_entities() {
        let (router, _, _) = router_with_recorder();
        assert_eq!(
            router.subscriptions(),
            vec![
                "devices/kitchen/lux/set".to_string(),
                "devices/kitchen/status/set".to_string(),
            ]
        );
    }
}
