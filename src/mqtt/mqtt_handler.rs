use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::{debug, trace};

/// Capacity of the rumqttc request queue between the client handles and the
/// event loop.
const REQUEST_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("Client request rejected: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Transport closed: {0}")]
    Closed(String),
}

/// CONNACK return code, 0 is success
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectCode(pub u8);

impl ConnectCode {
    pub const SUCCESS: ConnectCode = ConnectCode(0);

    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl From<ConnectReturnCode> for ConnectCode {
    fn from(code: ConnectReturnCode) -> Self {
        let raw = match code {
            ConnectReturnCode::Success => 0,
            ConnectReturnCode::RefusedProtocolVersion => 1,
            ConnectReturnCode::BadClientId => 2,
            ConnectReturnCode::ServiceUnavailable => 3,
            ConnectReturnCode::BadUserNamePassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
        };
        ConnectCode(raw)
    }
}

/// Something the broker connection produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A (re)connect handshake finished inside the library
    Connected(ConnectCode),
    /// Inbound PUBLISH
    Message { topic: String, payload: Bytes },
    /// Keep-alives, acks and outgoing traffic
    Idle,
}

/// Outbound half of a broker connection.
///
/// Publishing never waits for the broker: a full request queue or a closed
/// connection is reported as an error and the caller moves on.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), TransportError>;
}

/// Connection half of a broker connection, owned by the session controller.
///
/// `connect` makes exactly one attempt; retrying is the caller's business.
/// `poll` drives the background I/O and returns an error when the connection
/// drops.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<ConnectCode, TransportError>;

    async fn poll(&mut self) -> Result<TransportEvent, TransportError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    fn publisher(&self) -> Arc<dyn Publisher>;
}

/// rumqttc backed transport
pub struct RumqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl RumqttTransport {
    pub fn new(options: MqttOptions) -> Self {
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self { client, eventloop }
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(&mut self) -> Result<ConnectCode, TransportError> {
        // The event loop dials the broker on the first poll after a failure,
        // so one attempt is "poll until CONNACK or error".
        loop {
            match self.eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => return Ok(ack.code.into()),
                other => trace!("Event before CONNACK: {:?}", other),
            }
        }
    }

    async fn poll(&mut self) -> Result<TransportEvent, TransportError> {
        let event = match self.eventloop.poll().await? {
            Event::Incoming(Packet::Publish(publish)) => TransportEvent::Message {
                topic: publish.topic,
                payload: publish.payload,
            },
            Event::Incoming(Packet::ConnAck(ack)) => TransportEvent::Connected(ack.code.into()),
            other => {
                trace!("MQTT event: {:?}", other);
                TransportEvent::Idle
            }
        };
        Ok(event)
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        // try_subscribe: this runs on the task that drains the queue, waiting
        // for space here would never finish.
        self.client.try_subscribe(topic, QoS::AtMostOnce)?;
        Ok(())
    }

    fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::new(RumqttPublisher {
            client: self.client.clone(),
        })
    }
}

#[derive(Clone)]
pub struct RumqttPublisher {
    client: AsyncClient,
}

impl Publisher for RumqttPublisher {
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, retain, payload.as_bytes().to_vec())?;
        debug!("Queued '{}' for topic {}", payload, topic);
        Ok(())
    }
}
