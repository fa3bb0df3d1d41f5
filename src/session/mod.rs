//! Broker session lifecycle
//!
//! [`connect`] blocks until the broker accepted the first connection, then
//! hands the connection to a supervising tokio task:
//!
//! ```text
//! connect() ──► Session<Connected> ──serve()──► Session<Disconnected>
//!                       ▲                               │
//!                       └────────── reconnect() ────────┘
//! ```
//!
//! The returned [`SessionHandle`] is what the publish loop talks to. It shares
//! the [`state::SharedState`] with the supervisor and refuses to publish while
//! the connection is down, so a sweep never waits for the broker.

pub mod controller;
pub mod state;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::mqtt::message_manager::CommandRouter;
use crate::mqtt::mqtt_handler::{Publisher, Transport, TransportError};
use controller::{Connected, Disconnected, Session, SessionSettings};
use state::SharedState;

/// Publishing side of a running session
#[derive(Clone)]
pub struct SessionHandle {
    state: SharedState,
    publisher: Arc<dyn Publisher>,
}

impl SessionHandle {
    pub fn new(state: SharedState, publisher: Arc<dyn Publisher>) -> Self {
        Self { state, publisher }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Fire-and-forget publish; fails immediately while disconnected.
    pub fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), TransportError> {
        if !self.state.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.publisher.publish(topic, payload, retain)
    }
}

/// Connect to the broker, retrying forever, and start the I/O supervisor.
pub async fn connect(
    transport: Box<dyn Transport>,
    router: CommandRouter,
    state: SharedState,
    settings: SessionSettings,
    shutdown: CancellationToken,
) -> (SessionHandle, JoinHandle<()>) {
    let publisher = transport.publisher();
    let session = Session::<Disconnected>::create(transport, router, state.clone(), settings);

    let connected = session.connect().await;
    let supervisor = tokio::spawn(supervise(connected, shutdown));

    (SessionHandle::new(state, publisher), supervisor)
}

/// Keeps the session connected until shutdown.
async fn supervise(mut session: Session<Connected>, shutdown: CancellationToken) {
    loop {
        let disconnected = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, stopping MQTT session");
                return;
            }
            disconnected = session.serve() => disconnected,
        };

        session = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested while reconnecting");
                return;
            }
            connected = disconnected.reconnect() => connected,
        };
        info!("Reconnected successfully after {} attempt(s)", session.attempts());
    }
}
