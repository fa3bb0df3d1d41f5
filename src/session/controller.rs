//! Session controller with statum state machine for the broker connection
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──CONNACK ok──► Connected
//!      ▲                                                     │
//!      └──────────────── poll error (disconnect) ────────────┘
//!                         reconnect() retries forever
//! ```
//!
//! There is no terminal state. Every transition back to `Disconnected` is
//! followed by an unbounded retry loop driven by the supervising task in
//! [`crate::session`], so the event handlers themselves never block.

use std::time::Duration;

use statum::{machine, state};
use tracing::{debug, error, info, warn};

use crate::mqtt::discovery::Discovery;
use crate::mqtt::message_manager::{CommandRouter, InboundMessage};
use crate::mqtt::mqtt_handler::{ConnectCode, Transport, TransportEvent};
use crate::session::state::{ConnectionStatus, SharedState};

/// Connection lifecycle states
#[state]
#[derive(Debug, Clone)]
pub enum SessionPhase {
    Disconnected, // No broker connection, retry pending
    Connecting,   // Attempting the TCP + MQTT handshake
    Connected,    // Subscribed and dispatching commands
}

/// Static session parameters
#[derive(Clone, Debug)]
pub struct SessionSettings {
    /// Device scoped topic root, `<topic_root>/<device_name>`
    pub topic_root: String,
    pub reconnect_delay: Duration,
    /// Announced (or cleared) after every successful handshake
    pub discovery: Discovery,
}

#[machine]
pub struct Session<S: SessionPhase> {
    transport: Box<dyn Transport>,
    router: CommandRouter,
    state: SharedState,
    settings: SessionSettings,
    /// Connection attempts since the last successful handshake
    attempts: u32,
}

impl<S: SessionPhase> Session<S> {
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }
}

impl Session<Disconnected> {
    pub fn create(
        transport: Box<dyn Transport>,
        router: CommandRouter,
        state: SharedState,
        settings: SessionSettings,
    ) -> Self {
        info!(
            "Creating MQTT session for topic root '{}'",
            settings.topic_root
        );
        Self::new(transport, router, state, settings, 0)
    }

    /// First connection: try immediately, wait `reconnect_delay` after each
    /// failure. Returns only once the broker accepted us.
    pub async fn connect(self) -> Session<Connected> {
        let connecting: Session<Connecting> = self.transition();
        connecting.establish(false).await
    }

    /// Recovery after a disconnect: wait first, then try, forever.
    pub async fn reconnect(self) -> Session<Connected> {
        let connecting: Session<Connecting> = self.transition();
        connecting.establish(true).await
    }
}

impl Session<Connecting> {
    async fn establish(mut self, delay_first: bool) -> Session<Connected> {
        self.state.set_status(ConnectionStatus::Connecting);
        self.attempts = 0;
        let delay = self.settings.reconnect_delay;

        if delay_first {
            info!("Reconnecting in {} seconds...", delay.as_secs());
            tokio::time::sleep(delay).await;
        }

        loop {
            self.attempts += 1;
            match self.transport.connect().await {
                Ok(code) if code.is_success() => {
                    info!(
                        "Connected to MQTT Broker after {} attempt(s)",
                        self.attempts
                    );
                    return self.on_connect().await;
                }
                Ok(code) => {
                    warn!("Failed to connect, return code {}", code.0);
                }
                Err(e) => {
                    warn!("{}. Connect attempt {} failed. Retrying...", e, self.attempts);
                }
            }
            debug!("Next connect attempt in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    async fn on_connect(mut self) -> Session<Connected> {
        subscribe_all(self.transport.as_mut(), &self.router).await;
        announce(self.transport.as_ref(), &self.settings.discovery);
        self.state.set_status(ConnectionStatus::Connected);
        self.transition()
    }
}

impl Session<Connected> {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Drive the connection until the broker goes away.
    ///
    /// Inbound commands are dispatched in place. Errors from the transport end
    /// the connected phase; the caller is expected to `reconnect()`.
    pub async fn serve(mut self) -> Session<Disconnected> {
        loop {
            match self.transport.poll().await {
                Ok(TransportEvent::Message { topic, payload }) => {
                    self.router.dispatch(&InboundMessage::new(topic, payload));
                }
                Ok(TransportEvent::Connected(code)) => self.on_reconnected(code).await,
                Ok(TransportEvent::Idle) => {}
                Err(e) => return self.on_disconnect(&e.to_string()),
            }
        }
    }

    /// The library re-ran the handshake on its own
    async fn on_reconnected(&mut self, code: ConnectCode) {
        if code.is_success() {
            info!("Connected to MQTT Broker!");
            subscribe_all(self.transport.as_mut(), &self.router).await;
            announce(self.transport.as_ref(), &self.settings.discovery);
            self.state.set_status(ConnectionStatus::Connected);
        } else {
            warn!("Failed to connect, return code {}", code.0);
        }
    }

    fn on_disconnect(self, reason: &str) -> Session<Disconnected> {
        info!("Disconnected: {}", reason);
        self.state.mark_disconnected();
        self.transition()
    }
}

async fn subscribe_all(transport: &mut dyn Transport, router: &CommandRouter) {
    for topic in router.subscriptions() {
        match transport.subscribe(&topic).await {
            Ok(()) => debug!("Subscribe to: {}", topic),
            Err(e) => error!("Failed to subscribe to {}: {}", topic, e),
        }
    }
}

fn announce(transport: &dyn Transport, discovery: &Discovery) {
    let report = discovery.announce(transport.publisher().as_ref());
    if report.failed > 0 {
        warn!("{} discovery topic(s) could not be published", report.failed);
    }
}
