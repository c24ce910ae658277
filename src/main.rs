use energymeter_gateway::metering_modbus::bus::SerialBus;
use energymeter_gateway::network::nmcli::NmcliDriver;
use energymeter_gateway::provisioning::{CredentialStore, HttpIssuer, RsaCsrFactory};
use energymeter_gateway::system::restart_process;
#[cfg(feature = "api")]
use energymeter_gateway::{orchestrator::Running, Config};
use energymeter_gateway::{ConfigHandle, ConfigStore, ConnectivityManager, Orchestrator, ProvisioningManager, RestartHandle, TelemetryReader};
use log::{error, info};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/* actix runs its own single threaded system next to the tokio runtime */
#[cfg(feature = "api")]
fn start_api(snapshot: &Config, config: ConfigHandle, store: ConfigStore, restart: RestartHandle, running: &Running) {
    use energymeter_gateway::api::{ApiManager, ConfigService};

    if !snapshot.api.enabled {
        info!("Configuration API disabled");
        return;
    }

    let service = ConfigService::new(
        config,
        std::sync::Arc::new(store),
        restart,
        running.identity.clone(),
        running.link.clone(),
        running.publisher.clone(),
    );
    let port = snapshot.api.port;
    std::thread::spawn(move || {
        let result = actix_web::rt::System::new().block_on(ApiManager::new(service).start_thread(port));
        if let Err(e) = result {
            error!("Configuration API stopped: {e}");
        }
    });
}

/// Lets the API answer the request that triggered the restart
const RESTART_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> io::Result<()> {
    // Initialize logging
    let default_filter = std::env::var("EMG_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let data_dir = PathBuf::from(std::env::var("EMG_DATA_DIR").unwrap_or("config".to_string()));
    let interface = std::env::var("EMG_WIFI_INTERFACE").unwrap_or("wlan0".to_string());

    /* without storage the gateway still runs, on defaults */
    let store = match ConfigStore::open(&data_dir) {
        Ok(s) => s,
        Err(e) => {
            error!("Storage mount failed, continuing with defaults: {e}");
            ConfigStore::unmounted()
        }
    };
    let config = ConfigHandle::new(store.load());
    let snapshot = config.snapshot();
    let restart = RestartHandle::new();

    let credentials = CredentialStore::new(&data_dir);
    let issuer = HttpIssuer::new().map_err(|e| io::Error::other(e.to_string()))?;
    let provisioning = ProvisioningManager::new(credentials.clone(), RsaCsrFactory, issuer);

    /* a missing UART must not take the hotspot and the API down with it */
    let reader = match SerialBus::open(&snapshot.bus) {
        Ok((bus, direction)) => Some(TelemetryReader::new(bus, direction)),
        Err(e) => {
            error!("Meter bus {} unavailable, polling disabled until restart: {e}", snapshot.bus.port);
            None
        }
    };

    let orchestrator = Orchestrator {
        config: config.clone(),
        connectivity: ConnectivityManager::new(NmcliDriver::new(&interface)),
        provisioning,
        reader,
        credentials,
        restart: restart.clone(),
    };
    let running = orchestrator.start().await.map_err(|e| {
        error!("Unable to bring up the network: {e}");
        io::Error::other(e.to_string())
    })?;

    #[cfg(feature = "api")]
    start_api(&snapshot, config.clone(), store, restart.clone(), &running);

    info!("All contexts started for {}, now waiting for a restart", running.identity);
    let tasks = running.tasks;
    loop {
        tokio::select! {
            reason = restart.wait() => {
                info!("Restarting: {reason:?}");
                tokio::time::sleep(RESTART_GRACE).await;
                for task in tasks.iter() {
                    task.abort();
                }
                let e = restart_process();
                error!("Restart failed: {e}");
                return Err(e);
            }
            _ = tokio::time::sleep(Duration::from_secs(10)) => {
                if tasks.iter().any(|t| t.is_finished()) {
                    error!("A context stopped, shutting down");
                    for task in tasks.iter() {
                        task.abort();
                    }
                    return Err(io::Error::other("context stopped"));
                }
            }
        }
    }
}
