//! Topic registry
//!
//! One [`TopicEntry`] per logical entity. An entity can publish a value, accept
//! commands on `<root>/<suffix>/set`, or both; which of these it does is fixed
//! at registration through [`Capabilities`].
//!
//! ```text
//! TopicRegistry
//!   ├── bh1750 ── "lux"    ── Publish + Command
//!   └── status ── "status" ── Publish + Command
//! ```
//!
//! The registry itself has no locking. After `connect()` the command side is
//! copied out into a [`crate::mqtt::message_manager::CommandRouter`] for the I/O
//! task and the registry is handed to the publish loop, which is then the only
//! writer of `last_value`.

use crate::session::state::SharedState;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by entity implementations
#[derive(Debug, Error)]
pub enum EntityError {
    /// The hardware bus could not be read
    #[error("Bus error: {0}")]
    Bus(String),

    /// A command payload was not understood
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate entity key: {0}")]
    DuplicateKey(String),

    #[error("Topic suffix already claimed: {0}")]
    DuplicateSuffix(String),

    #[error("Invalid topic suffix '{0}': must be a single non-empty topic level")]
    InvalidSuffix(String),
}

/// How a publishing entity decides whether a fresh sample goes out
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PublishPolicy {
    /// Publish when the session is dirty or the value changed
    #[default]
    OnChange,
    /// Publish only when the session is dirty (beacons)
    RefreshOnly,
}

/// Entity that produces a payload every sweep
pub trait Publishable: Send {
    /// Read the current value, already formatted as the wire payload
    fn sample(&mut self) -> Result<String, EntityError>;

    fn policy(&self) -> PublishPolicy {
        PublishPolicy::OnChange
    }
}

impl<F> Publishable for F
where
    F: FnMut() -> Result<String, EntityError> + Send,
{
    fn sample(&mut self) -> Result<String, EntityError> {
        self()
    }
}

/// Entity that accepts commands on its `set` topic.
///
/// Runs on the broker I/O task. Implementations must not touch publish state;
/// to force a republish they go through [`CommandContext::request_refresh`].
pub trait Commandable: Send + Sync {
    fn command(&self, payload: &str, ctx: &CommandContext) -> Result<(), EntityError>;
}

impl<F> Commandable for F
where
    F: Fn(&str, &CommandContext) -> Result<(), EntityError> + Send + Sync,
{
    fn command(&self, payload: &str, ctx: &CommandContext) -> Result<(), EntityError> {
        self(payload, ctx)
    }
}

/// What a command handler may do to the session
#[derive(Clone, Debug)]
pub struct CommandContext {
    state: SharedState,
}

impl CommandContext {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Make the next sweep republish every entry
    pub fn request_refresh(&self) {
        self.state.request_refresh();
    }
}

/// Capability set of an entity
pub enum Capabilities {
    Publish(Box<dyn Publishable>),
    Command(Arc<dyn Commandable>),
    PublishAndCommand(Box<dyn Publishable>, Arc<dyn Commandable>),
}

impl Capabilities {
    pub fn publish(publisher: impl Publishable + 'static) -> Self {
        Self::Publish(Box::new(publisher))
    }

    pub fn command(commander: impl Commandable + 'static) -> Self {
        Self::Command(Arc::new(commander))
    }

    pub fn both(
        publisher: impl Publishable + 'static,
        commander: impl Commandable + 'static,
    ) -> Self {
        Self::PublishAndCommand(Box::new(publisher), Arc::new(commander))
    }

    fn split(self) -> (Option<Box<dyn Publishable>>, Option<Arc<dyn Commandable>>) {
        match self {
            Self::Publish(p) => (Some(p), None),
            Self::Command(c) => (None, Some(c)),
            Self::PublishAndCommand(p, c) => (Some(p), Some(c)),
        }
    }
}

pub struct TopicEntry {
    key: String,
    topic_suffix: String,
    publisher: Option<Box<dyn Publishable>>,
    commander: Option<Arc<dyn Commandable>>,
    /// Last payload the broker accepted
    pub(crate) last_value: Option<String>,
}

impl TopicEntry {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn topic_suffix(&self) -> &str {
        &self.topic_suffix
    }

    pub fn last_value(&self) -> Option<&str> {
        self.last_value.as_deref()
    }

    pub fn is_publishable(&self) -> bool {
        self.publisher.is_some()
    }

    pub fn is_commandable(&self) -> bool {
        self.commander.is_some()
    }

    pub fn commander(&self) -> Option<Arc<dyn Commandable>> {
        self.commander.clone()
    }

    pub(crate) fn publisher_mut(&mut self) -> Option<&mut (dyn Publishable + 'static)> {
        self.publisher.as_deref_mut()
    }
}

impl fmt::Debug for TopicEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicEntry")
            .field("key", &self.key)
            .field("topic_suffix", &self.topic_suffix)
            .field("publishable", &self.is_publishable())
            .field("commandable", &self.is_commandable())
            .field("last_value", &self.last_value)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct TopicRegistry {
    entries: Vec<TopicEntry>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity. Keys and suffixes must be unique.
    pub fn register(
        &mut self,
        key: impl Into<String>,
        topic_suffix: impl Into<String>,
        capabilities: Capabilities,
    ) -> Result<(), RegistryError> {
        let key = key.into();
        let topic_suffix = topic_suffix.into();

        if topic_suffix.is_empty() || topic_suffix.contains(['/', '+', '#']) {
            return Err(RegistryError::InvalidSuffix(topic_suffix));
        }
        if self.entries.iter().any(|e| e.key == key) {
            return Err(RegistryError::DuplicateKey(key));
        }
        if self.find_by_suffix(&topic_suffix).is_some() {
            return Err(RegistryError::DuplicateSuffix(topic_suffix));
        }

        let (publisher, commander) = capabilities.split();
        self.entries.push(TopicEntry {
            key,
            topic_suffix,
            publisher,
            commander,
            last_value: None,
        });
        Ok(())
    }

    pub fn find_by_suffix(&self, name: &str) -> Option<&TopicEntry> {
        self.entries.iter().find(|e| e.topic_suffix == name)
    }

    /// Entries in registration order
    pub fn all_entries(&self) -> impl Iterator<Item = &TopicEntry> {
        self.entries.iter()
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut TopicEntry> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
