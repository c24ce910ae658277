//! Wireless link supervision.
//!
//! The gateway either joins the configured network as a client or opens its own
//! hotspot. A failed join is never fatal: the hotspot keeps the device
//! reachable for reconfiguration.

use log::{error, info, warn};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::config::Config;
use crate::models::DeviceIdentity;

pub mod nmcli;

pub const CONNECT_ATTEMPTS: u32 = 20;
pub const CONNECT_POLL: Duration = Duration::from_millis(500);
pub const RECONNECT_WINDOW: Duration = Duration::from_secs(60);

pub const HOTSPOT_PREFIX: &str = "Energy_";
pub const HOTSPOT_PASS: &str = "12345678";
const SCAN_QUEUE: usize = 4;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Network tool failed: {0}")]
    Command(String),
    #[error("Unable to run network tool: {0}")]
    Io(#[from] std::io::Error),
    #[error("Hardware address unavailable: {0}")]
    HardwareAddress(String),
    #[error("Network context is not running")]
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectivityState {
    Unconfigured,
    HotspotFallback,
    Connecting,
    Connected,
    Reconnecting,
}

/// Access to the wireless hardware
pub trait LinkDriver: Send {
    /// Starts joining the network and returns without waiting for the result
    fn connect(&mut self, ssid: &str, pass: &str) -> impl Future<Output = Result<(), LinkError>> + Send;
    fn is_connected(&mut self) -> impl Future<Output = bool> + Send;
    fn reconnect(&mut self) -> impl Future<Output = Result<(), LinkError>> + Send;
    fn start_hotspot(&mut self, ssid: &str, pass: &str) -> impl Future<Output = Result<(), LinkError>> + Send;
    fn hardware_address(&self) -> Result<[u8; 6], LinkError>;
    fn scan(&mut self) -> impl Future<Output = Result<Vec<WifiNetwork>, LinkError>> + Send;
}

/// One access point seen by a scan, strongest first when listed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WifiNetwork {
    pub ssid: String,
    /// Estimated dBm, between -100 and -50
    pub rssi: i32,
    pub secure: bool,
}

type ScanReply = oneshot::Sender<Result<Vec<WifiNetwork>, LinkError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: ConnectivityState,
    pub link_up: bool,
    pub identity: Option<DeviceIdentity>,
}

impl LinkStatus {
    pub fn is_hotspot_mode(&self) -> bool {
        matches!(self.state, ConnectivityState::Unconfigured | ConnectivityState::HotspotFallback)
    }
}

/// Read side of the connectivity state for the other execution contexts
#[derive(Clone)]
pub struct ConnectivityHandle {
    status: watch::Receiver<LinkStatus>,
    scans: mpsc::Sender<ScanReply>,
}

impl ConnectivityHandle {
    pub fn is_link_up(&self) -> bool {
        self.status.borrow().link_up
    }

    pub fn is_hotspot_mode(&self) -> bool {
        self.status.borrow().is_hotspot_mode()
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    /// Asks the network context, which owns the radio, for a scan
    pub async fn scan(&self) -> Result<Vec<WifiNetwork>, LinkError> {
        let (reply, result) = oneshot::channel();
        self.scans.send(reply).await.map_err(|_| LinkError::Unavailable)?;
        return result.await.map_err(|_| LinkError::Unavailable)?;
    }
}

pub struct ConnectivityManager<D: LinkDriver> {
    driver: D,
    state: ConnectivityState,
    link_up: bool,
    forced_hotspot: bool,
    identity: Option<DeviceIdentity>,
    last_attempt: Option<Instant>,
    status: Arc<watch::Sender<LinkStatus>>,
    scan_requests: mpsc::Receiver<ScanReply>,
    scans: mpsc::Sender<ScanReply>,
}

impl<D: LinkDriver> ConnectivityManager<D> {
    pub fn new(driver: D) -> Self {
        let (status, _) = watch::channel(LinkStatus {
            state: ConnectivityState::Unconfigured,
            link_up: false,
            identity: None,
        });
        let (scans, scan_requests) = mpsc::channel(SCAN_QUEUE);
        return ConnectivityManager {
            driver,
            state: ConnectivityState::Unconfigured,
            link_up: false,
            forced_hotspot: false,
            identity: None,
            last_attempt: None,
            status: Arc::new(status),
            scan_requests,
            scans,
        };
    }

    pub fn handle(&self) -> ConnectivityHandle {
        ConnectivityHandle { status: self.status.subscribe(), scans: self.scans.clone() }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    pub fn is_hotspot_mode(&self) -> bool {
        matches!(self.state, ConnectivityState::Unconfigured | ConnectivityState::HotspotFallback)
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    /// Identity is derived on the first call only
    pub async fn begin(&mut self, config: &Config) -> Result<DeviceIdentity, LinkError> {
        let identity = match &self.identity {
            Some(id) => id.clone(),
            None => {
                let id = DeviceIdentity::from_hardware_address(self.driver.hardware_address()?);
                info!("Device ID (MAC): {id}");
                self.identity = Some(id.clone());
                id
            }
        };
        self.publish();

        self.forced_hotspot = config.wifi.ap_mode;
        if config.wifi.ap_mode || config.wifi.ssid.is_empty() {
            warn!("Hotspot forced or no WiFi configured");
            let state = if config.wifi.ssid.is_empty() {
                ConnectivityState::Unconfigured
            } else {
                ConnectivityState::HotspotFallback
            };
            self.start_hotspot(state).await;
            return Ok(identity);
        }

        self.connect(&config.wifi.ssid, &config.wifi.pass).await;
        return Ok(identity);
    }

    async fn connect(&mut self, ssid: &str, pass: &str) {
        info!("Connecting to WiFi {ssid}");
        self.set_state(ConnectivityState::Connecting, false);
        self.last_attempt = Some(Instant::now());

        if let Err(e) = self.driver.connect(ssid, pass).await {
            error!("Unable to start WiFi connection: {e}");
        } else {
            for _ in 0..CONNECT_ATTEMPTS {
                if self.driver.is_connected().await {
                    info!("WiFi connected");
                    self.set_state(ConnectivityState::Connected, true);
                    return;
                }
                tokio::time::sleep(CONNECT_POLL).await;
            }
        }

        warn!("Failed to connect to {ssid}, starting emergency hotspot");
        self.start_hotspot(ConnectivityState::HotspotFallback).await;
    }

    async fn start_hotspot(&mut self, state: ConnectivityState) {
        let ssid = match &self.identity {
            Some(id) => format!("{HOTSPOT_PREFIX}{id}"),
            None => HOTSPOT_PREFIX.trim_end_matches('_').to_string(),
        };
        info!("Starting hotspot {ssid}");
        if let Err(e) = self.driver.start_hotspot(&ssid, HOTSPOT_PASS).await {
            error!("Unable to start hotspot {ssid}: {e}");
        }
        self.set_state(state, false);
    }

    /// Watchdog, call periodically. At most one reconnect per [`RECONNECT_WINDOW`]
    pub async fn tick(&mut self) {
        if self.forced_hotspot || self.is_hotspot_mode() || self.state == ConnectivityState::Connecting {
            return;
        }

        if self.driver.is_connected().await {
            if self.state != ConnectivityState::Connected {
                info!("WiFi link restored");
            }
            self.set_state(ConnectivityState::Connected, true);
            return;
        }

        if self.state == ConnectivityState::Connected {
            warn!("WiFi link lost");
        }
        self.set_state(ConnectivityState::Reconnecting, false);

        let now = Instant::now();
        let due = match self.last_attempt {
            Some(last) => now.duration_since(last) >= RECONNECT_WINDOW,
            None => true,
        };
        if due {
            self.last_attempt = Some(now);
            info!("Trying to reconnect WiFi");
            if let Err(e) = self.driver.reconnect().await {
                warn!("WiFi reconnect failed: {e}");
            }
        }
    }

    /// Waits for the next scan asked for through a [`ConnectivityHandle`]
    pub async fn next_scan_request(&mut self) -> Option<ScanReply> {
        self.scan_requests.recv().await
    }

    pub async fn answer_scan(&mut self, reply: ScanReply) {
        let result = self.driver.scan().await;
        match &result {
            Ok(networks) => info!("WiFi scan found {} networks", networks.len()),
            Err(e) => warn!("WiFi scan failed: {e}"),
        }
        let _ = reply.send(result);
    }

    fn set_state(&mut self, state: ConnectivityState, link_up: bool) {
        self.state = state;
        self.link_up = link_up;
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(LinkStatus {
            state: self.state,
            link_up: self.link_up,
            identity: self.identity.clone(),
        });
    }
}
