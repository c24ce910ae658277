use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::models::{DeviceIdentity, Reading};
use crate::provisioning::{CredentialStore, Credentials};

const PLAIN_PORT: u16 = 1883;
const TLS_PORT: u16 = 8883;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 10;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Device is not provisioned")]
    Missing,
    #[error("Unable to read credentials: {0}")]
    Read(#[from] std::io::Error),
    #[error("Malformed PEM: {0}")]
    Pem(#[from] rustls::pki_types::pem::Error),
    #[error("TLS setup failed: {0}")]
    Tls(#[from] rustls::Error),
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Not connected to broker")]
    NotConnected,
    #[error("Unable to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Client rejected publish: {0}")]
    Client(#[from] rumqttc::ClientError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PublisherState {
    CredentialsNotLoaded,
    Disconnected,
    Connected,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct ChannelValues {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub total_kwh: f64,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct TelemetryPayload {
    pub device_id: String,
    pub channels: BTreeMap<String, ChannelValues>,
}

pub fn build_topic(identity: &DeviceIdentity) -> String {
    return format!("energymeter/{identity}/data");
}

pub fn build_payload(identity: &DeviceIdentity, reading: &Reading) -> TelemetryPayload {
    let mut channels = BTreeMap::new();
    channels.insert(reading.channel.to_string(), ChannelValues {
        voltage: reading.voltage,
        current: reading.current,
        power: reading.power,
        total_kwh: reading.total_kwh,
    });
    return TelemetryPayload { device_id: identity.to_string(), channels };
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BrokerTarget {
    host: String,
    port: u16,
}

impl BrokerTarget {
    /* the plain text port is never used, a configured 1883 means the TLS listener */
    fn from_config(config: &Config) -> Option<Self> {
        if config.mqtt.server.is_empty() {
            return None;
        }
        let port = if config.mqtt.port == PLAIN_PORT { TLS_PORT } else { config.mqtt.port };
        return Some(BrokerTarget { host: config.mqtt.server.clone(), port });
    }
}

struct Session {
    client: AsyncClient,
    driver: JoinHandle<()>,
    permit: Arc<Notify>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Mutually authenticated MQTT session towards the broker.
///
/// The rumqttc event loop runs on its own task. After a failure it parks until
/// [`SecureTelemetryPublisher::tick`] hands out a permit, so every tick allows
/// exactly one reconnect attempt.
pub struct SecureTelemetryPublisher {
    store: CredentialStore,
    identity: DeviceIdentity,
    credentials: Option<Credentials>,
    target: Option<BrokerTarget>,
    session: Option<Session>,
    state: Arc<watch::Sender<PublisherState>>,
}

impl SecureTelemetryPublisher {
    pub fn new(store: CredentialStore, identity: DeviceIdentity) -> Self {
        let (state, _) = watch::channel(PublisherState::CredentialsNotLoaded);
        return SecureTelemetryPublisher {
            store,
            identity,
            credentials: None,
            target: None,
            session: None,
            state: Arc::new(state),
        };
    }

    pub fn state(&self) -> PublisherState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PublisherState> {
        self.state.subscribe()
    }

    /// Reads the trust material once, later calls keep what is loaded
    pub fn load_credentials(&mut self) -> Result<(), CredentialError> {
        if self.credentials.is_some() {
            return Ok(());
        }
        if !self.store.is_complete() {
            return Err(CredentialError::Missing);
        }

        self.credentials = Some(self.store.load()?);
        info!("TLS credentials loaded");
        self.state.send_replace(PublisherState::Disconnected);
        return Ok(());
    }

    fn reconfigure(&mut self, target: Option<BrokerTarget>) {
        match &target {
            Some(t) => info!("MQTT broker set to {}:{}", t.host, t.port),
            None => warn!("No MQTT broker configured"),
        }
        self.session = None;
        self.target = target;
        self.state.send_replace(PublisherState::Disconnected);
    }

    pub async fn tick(&mut self, config: &Config, link_up: bool) {
        if self.credentials.is_none() {
            return;
        }

        let target = BrokerTarget::from_config(config);
        if target != self.target {
            self.reconfigure(target);
        }
        if !link_up {
            return;
        }

        if let Some(session) = self.session.as_ref().filter(|s| !s.driver.is_finished()) {
            if self.state() == PublisherState::Disconnected {
                session.permit.notify_one();
            }
            return;
        }
        if self.session.take().is_some() {
            warn!("MQTT driver stopped, opening a new session");
            self.state.send_replace(PublisherState::Disconnected);
        }

        let opened = match (&self.target, &self.credentials) {
            (Some(target), Some(credentials)) => self.open(target, credentials),
            _ => return,
        };
        match opened {
            Ok(session) => self.session = Some(session),
            Err(e) => error!("Unable to set up MQTT session: {e}"),
        }
    }

    fn open(&self, target: &BrokerTarget, credentials: &Credentials) -> Result<Session, CredentialError> {
        let tls = client_config(credentials)?;

        info!("Connecting to MQTT broker {}:{} as {}", target.host, target.port, self.identity);
        let mut options = MqttOptions::new(self.identity.as_str(), target.host.as_str(), target.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(tls))));

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let permit = Arc::new(Notify::new());
        let driver = tokio::spawn(drive(eventloop, self.state.clone(), permit.clone()));
        return Ok(Session { client, driver, permit });
    }

    fn try_publish(&self, identity: &DeviceIdentity, reading: &Reading) -> Result<(), PublishError> {
        let session = match &self.session {
            Some(s) if self.state() == PublisherState::Connected => s,
            _ => return Err(PublishError::NotConnected),
        };

        let payload = serde_json::to_vec(&build_payload(identity, reading))?;
        session.client.try_publish(build_topic(identity), QoS::AtMostOnce, false, payload)?;
        return Ok(());
    }

    /// At most once, a failed publish is reported and forgotten
    pub fn publish(&self, identity: &DeviceIdentity, reading: &Reading) -> bool {
        match self.try_publish(identity, reading) {
            Ok(()) => {
                debug!("Published channel {} of {identity}", reading.channel);
                true
            }
            Err(e) => {
                warn!("Dropping reading of channel {}: {e}", reading.channel);
                false
            }
        }
    }
}

/* several rustls providers get linked in, so the ring one is named explicitly */
fn client_config(credentials: &Credentials) -> Result<ClientConfig, CredentialError> {
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(credentials.ca_certificate.as_bytes()) {
        roots.add(cert?)?;
    }
    let chain = CertificateDer::pem_slice_iter(credentials.certificate.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    let key = PrivateKeyDer::from_pem_slice(credentials.private_key.as_bytes())?;

    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)?;
    return Ok(config);
}

async fn drive(mut eventloop: EventLoop, state: Arc<watch::Sender<PublisherState>>, permit: Arc<Notify>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected");
                state.send_replace(PublisherState::Connected);
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT connection failed: {e}");
                state.send_replace(PublisherState::Disconnected);
                permit.notified().await;
                debug!("Retrying MQTT connection");
            }
        }
    }
}
