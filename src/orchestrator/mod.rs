//! Startup ordering and the three long running contexts.
//!
//! The link comes up first, then the provisioning gate runs, then the
//! publisher loads its credentials. Polling and publishing only start once
//! the gate was passed.

use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{Config, ConfigHandle};
use crate::metering_modbus::bus::BusPort;
use crate::metering_modbus::{TelemetryPoller, TelemetryReader};
use crate::models::DeviceIdentity;
use crate::mqtt::{PublisherState, SecureTelemetryPublisher};
use crate::network::{ConnectivityHandle, ConnectivityManager, LinkDriver, LinkError};
use crate::pipeline::{self, ReadingConsumer};
use crate::provisioning::{CertificateIssuer, CredentialStore, CsrFactory, ProvisioningError, ProvisioningManager};
use crate::system::{RestartHandle, RestartReason};

pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);
pub const PUBLISH_TICK: Duration = Duration::from_secs(1);
/// Time for logs and the API to settle before a provisioned device restarts
pub const PROVISIONED_RESTART_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum GateOutcome {
    AlreadyProvisioned,
    Provisioned,
    Failed(ProvisioningError),
}

/// Provisioning only ever runs for a device without credentials
pub async fn provisioning_gate<F, I>(manager: &mut ProvisioningManager<F, I>, config: &Config, identity: &DeviceIdentity) -> GateOutcome
where
    F: CsrFactory + Clone + 'static,
    I: CertificateIssuer,
{
    if manager.is_provisioned() {
        info!("Device already provisioned");
        return GateOutcome::AlreadyProvisioned;
    }

    match manager.perform_provisioning(&config.issuer_url(), identity).await {
        Ok(()) => GateOutcome::Provisioned,
        Err(e) => {
            error!("Provisioning failed, retrying on next boot: {e}");
            GateOutcome::Failed(e)
        }
    }
}

pub struct Orchestrator<D, F, I, B>
where
    D: LinkDriver + 'static,
    F: CsrFactory + Clone + 'static,
    I: CertificateIssuer + 'static,
    B: BusPort + 'static,
{
    pub config: ConfigHandle,
    pub connectivity: ConnectivityManager<D>,
    pub provisioning: ProvisioningManager<F, I>,
    /// `None` when the meter bus could not be opened, polling then stays idle
    pub reader: Option<TelemetryReader<B>>,
    pub credentials: CredentialStore,
    pub restart: RestartHandle,
}

/// What the rest of the application can observe of the running contexts
pub struct Running {
    pub identity: DeviceIdentity,
    pub link: ConnectivityHandle,
    pub publisher: watch::Receiver<PublisherState>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl<D, F, I, B> Orchestrator<D, F, I, B>
where
    D: LinkDriver + 'static,
    F: CsrFactory + Clone + 'static,
    I: CertificateIssuer + 'static,
    B: BusPort + 'static,
{
    pub async fn start(self) -> Result<Running, LinkError> {
        let Orchestrator { config, mut connectivity, provisioning, reader, credentials, restart } = self;

        let identity = connectivity.begin(&config.snapshot()).await?;
        let link = connectivity.handle();
        let (ready_tx, ready_rx) = watch::channel(false);

        let publisher = SecureTelemetryPublisher::new(credentials, identity.clone());
        let publisher_state = publisher.subscribe_state();
        let (producer, consumer) = pipeline::channel();

        let mut tasks = Vec::new();

        let c = config.clone();
        let id = identity.clone();
        tasks.push(tokio::spawn(async move {
            network_context(connectivity, provisioning, c, id, restart, ready_tx).await;
        }));

        let updates = config.subscribe();
        let mut ready = ready_rx.clone();
        tasks.push(tokio::spawn(async move {
            let _ = ready.wait_for(|r| *r).await;
            let reader = match reader {
                Some(r) => r,
                None => {
                    /* the producer stays alive so the publisher keeps running */
                    warn!("Meter bus unavailable, polling stays idle");
                    let _producer = producer;
                    std::future::pending::<()>().await;
                    return;
                }
            };
            if let Err(e) = TelemetryPoller::new(reader, updates, producer).start_thread().await {
                error!("Polling stopped: {e}");
            }
        }));

        let l = link.clone();
        let id = identity.clone();
        tasks.push(tokio::spawn(async move {
            publish_context(publisher, consumer, l, config, id, ready_rx).await;
        }));

        return Ok(Running { identity, link, publisher: publisher_state, tasks });
    }
}

async fn network_context<D, F, I>(
    mut connectivity: ConnectivityManager<D>,
    mut provisioning: ProvisioningManager<F, I>,
    config: ConfigHandle,
    identity: DeviceIdentity,
    restart: RestartHandle,
    ready: watch::Sender<bool>,
) where
    D: LinkDriver,
    F: CsrFactory + Clone + 'static,
    I: CertificateIssuer,
{
    let mut provisioned = false;
    if connectivity.is_link_up() {
        let outcome = provisioning_gate(&mut provisioning, &config.snapshot(), &identity).await;
        provisioned = matches!(outcome, GateOutcome::Provisioned);
    } else if !provisioning.is_provisioned() {
        warn!("No network, provisioning deferred to the next boot");
    }

    /* new credentials are only picked up by a fresh process, the other contexts stay parked */
    if provisioned {
        info!("Restarting to load the new credentials");
        tokio::time::sleep(PROVISIONED_RESTART_DELAY).await;
        restart.request(RestartReason::Provisioned);
    } else {
        ready.send_replace(true);
    }

    let mut ticker = tokio::time::interval(WATCHDOG_PERIOD);
    loop {
        tokio::select! {
            _ = ticker.tick() => connectivity.tick().await,
            Some(reply) = connectivity.next_scan_request() => connectivity.answer_scan(reply).await,
        }
    }
}

async fn publish_context(
    mut publisher: SecureTelemetryPublisher,
    mut consumer: ReadingConsumer,
    link: ConnectivityHandle,
    config: ConfigHandle,
    identity: DeviceIdentity,
    mut ready: watch::Receiver<bool>,
) {
    let _ = ready.wait_for(|r| *r).await;
    if let Err(e) = publisher.load_credentials() {
        warn!("Publisher stays idle: {e}");
    }

    let mut ticker = tokio::time::interval(PUBLISH_TICK);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                publisher.tick(&config.snapshot(), link.is_link_up()).await;
            }
            next = consumer.dequeue() => {
                let reading = match next {
                    Some(r) => r,
                    None => {
                        info!("Reading queue closed, publisher stops");
                        return;
                    }
                };
                if !link.is_link_up() {
                    warn!("Link down, dropping reading of channel {}", reading.channel);
                    continue;
                }
                if publisher.publish(&identity, &reading) {
                    debug!("Reading of channel {} sent", reading.channel);
                }
            }
        }
    }
}
