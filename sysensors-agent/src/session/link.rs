//! Broker link seams
//!
//! [`MqttLink`] is the outbound half (publish/subscribe requests) and
//! [`EventSource`] the inbound half (connection events and messages). The
//! production implementations wrap `rumqttc`'s `AsyncClient` and `EventLoop`;
//! tests substitute in-memory fakes.

use crate::config::{MqttSettings, TlsSettings};
use crate::topics::Topics;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill,
    MqttOptions, Outgoing, Packet, QoS, TlsConfiguration, Transport,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Pending requests the client can queue before `try_*` calls are rejected
pub const REQUEST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// Credentials rejected; retrying cannot help
    #[error("broker refused credentials: {0}")]
    Unauthorized(String),

    #[error("broker connection error: {0}")]
    Transient(String),

    #[error("request rejected by client: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Message { topic: String, payload: Vec<u8> },
    /// Outgoing disconnect flushed, the link is done
    Closed,
    /// Anything the session does not act on (acks, pings)
    Idle,
}

/// Outbound requests; must never block the caller
pub trait MqttLink: Clone + Send + Sync + 'static {
    fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), LinkError>;
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), LinkError>;
    fn disconnect(&self) -> Result<(), LinkError>;
}

#[async_trait]
pub trait EventSource: Send + 'static {
    async fn poll(&mut self) -> Result<LinkEvent, LinkError>;
}

impl MqttLink for AsyncClient {
    fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), LinkError> {
        self.try_publish(topic, qos, retain, payload).map_err(rejected)
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        self.try_subscribe(topic, qos).map_err(rejected)
    }

    fn disconnect(&self) -> Result<(), LinkError> {
        self.try_disconnect().map_err(rejected)
    }
}

#[async_trait]
impl EventSource for EventLoop {
    async fn poll(&mut self) -> Result<LinkEvent, LinkError> {
        match EventLoop::poll(self).await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                Ok(LinkEvent::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => Ok(LinkEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => Ok(LinkEvent::Closed),
            Ok(_) => Ok(LinkEvent::Idle),
            Err(e) => Err(classify(e)),
        }
    }
}

fn rejected(e: ClientError) -> LinkError {
    LinkError::Rejected(e.to_string())
}

/// Bad credentials are fatal, everything else is worth another attempt
fn classify(e: ConnectionError) -> LinkError {
    match e {
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
        ) => LinkError::Unauthorized(format!("{:?}", code)),
        other => LinkError::Transient(other.to_string()),
    }
}

#[derive(Debug, Error)]
#[error("failed to read TLS file {}: {source}", .path.display())]
pub struct TlsFileError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Client options: identity, keep-alive, last will, credentials and TLS
pub fn mqtt_options(
    client_id: &str,
    mqtt: &MqttSettings,
    topics: &Topics,
) -> Result<MqttOptions, TlsFileError> {
    let mut options = MqttOptions::new(client_id, &mqtt.hostname, mqtt.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);
    options.set_last_will(LastWill::new(
        &topics.availability,
        "offline",
        QoS::AtLeastOnce,
        true,
    ));

    if let (Some(user), Some(password)) = (&mqtt.user, &mqtt.password) {
        options.set_credentials(user, password);
    }

    if let Some(tls) = &mqtt.tls {
        options.set_transport(tls_transport(tls)?);
    }

    Ok(options)
}

/// Client and event loop for the configured broker
pub fn connect(
    client_id: &str,
    mqtt: &MqttSettings,
    topics: &Topics,
) -> Result<(AsyncClient, EventLoop), TlsFileError> {
    let options = mqtt_options(client_id, mqtt, topics)?;
    Ok(AsyncClient::new(options, REQUEST_CAPACITY))
}

fn tls_transport(tls: &TlsSettings) -> Result<Transport, TlsFileError> {
    let ca = match &tls.ca_certs {
        Some(path) => read_tls_file(path)?,
        None => Vec::new(),
    };

    let client_auth = match (&tls.certfile, &tls.keyfile) {
        (Some(cert), Some(key)) => Some((read_tls_file(cert)?, read_tls_file(key)?)),
        _ => None,
    };

    Ok(Transport::Tls(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}

fn read_tls_file(path: &Path) -> Result<Vec<u8>, TlsFileError> {
    std::fs::read(path).map_err(|source| TlsFileError {
        path: path.to_path_buf(),
        source,
    })
}
