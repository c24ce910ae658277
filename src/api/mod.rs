use actix_web::error::InternalError;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::{ConfigHandle, ConfigStore};
use crate::models::{DeviceIdentity, MeterEndpoint};
use crate::mqtt::PublisherState;
use crate::network::{ConnectivityHandle, ConnectivityState, WifiNetwork};
use crate::system::{RestartHandle, RestartReason};

const UI_DIR: &str = "ui";

#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct WifiUpdate {
    pub ssid: Option<String>,
    pub pass: Option<String>,
}

#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct MqttUpdate {
    pub server: Option<String>,
    pub port: Option<u16>,
    pub interval: Option<u64>,
}

/// Body of `POST /api/save`, absent fields keep their current value
#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub wifi: WifiUpdate,
    #[serde(default)]
    pub mqtt: MqttUpdate,
    /// Replaces the whole meter list when present
    #[serde(default)]
    pub meters: Option<Vec<MeterEndpoint>>,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct WifiView {
    pub ssid: String,
    pub ap_mode: bool,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct MqttView {
    pub server: String,
    pub port: u16,
    pub device_id: String,
    pub interval: u64,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct SystemView {
    pub serial_id: String,
}

/* the WiFi password never leaves the device */
#[derive(Serialize, Debug, PartialEq)]
pub struct ConfigView {
    pub wifi: WifiView,
    pub mqtt: MqttView,
    pub meters: Vec<MeterEndpoint>,
    pub system: SystemView,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct StatusView {
    pub device_id: String,
    pub connectivity: ConnectivityState,
    pub hotspot: bool,
    pub link_up: bool,
    pub publisher: PublisherState,
}

#[derive(Debug)]
pub enum ApiCommand {
    GetConfig,
    Save(ConfigUpdate),
    Restart,
    FactoryReset,
    Status,
    Scan,
}

#[derive(Debug, PartialEq)]
pub enum ApiReply {
    Config(ConfigView),
    Saved,
    Restarting,
    Reset,
    Failed(String),
    Status(StatusView),
    Networks(Vec<WifiNetwork>),
}

/// Executes configuration commands against the single config owner
#[derive(Clone)]
pub struct ConfigService {
    config: ConfigHandle,
    store: Arc<ConfigStore>,
    restart: RestartHandle,
    identity: DeviceIdentity,
    link: ConnectivityHandle,
    publisher: watch::Receiver<PublisherState>,
}

impl ConfigService {
    pub fn new(
        config: ConfigHandle,
        store: Arc<ConfigStore>,
        restart: RestartHandle,
        identity: DeviceIdentity,
        link: ConnectivityHandle,
        publisher: watch::Receiver<PublisherState>,
    ) -> Self {
        return ConfigService { config, store, restart, identity, link, publisher };
    }

    pub async fn dispatch(&self, command: ApiCommand) -> ApiReply {
        match command {
            ApiCommand::GetConfig => ApiReply::Config(self.view()),
            ApiCommand::Save(update) => self.save(update),
            ApiCommand::Restart => {
                self.restart.request(RestartReason::Requested);
                ApiReply::Restarting
            }
            ApiCommand::FactoryReset => match self.store.reset() {
                Ok(()) => {
                    self.restart.request(RestartReason::FactoryReset);
                    ApiReply::Reset
                }
                Err(e) => {
                    error!("Factory reset failed: {e}");
                    ApiReply::Failed(e.to_string())
                }
            },
            ApiCommand::Status => ApiReply::Status(self.status()),
            ApiCommand::Scan => match self.link.scan().await {
                Ok(networks) => ApiReply::Networks(networks),
                Err(e) => {
                    error!("WiFi scan failed: {e}");
                    ApiReply::Failed(e.to_string())
                }
            },
        }
    }

    fn view(&self) -> ConfigView {
        let config = self.config.snapshot();
        return ConfigView {
            wifi: WifiView { ssid: config.wifi.ssid.clone(), ap_mode: config.wifi.ap_mode },
            mqtt: MqttView {
                server: config.mqtt.server.clone(),
                port: config.mqtt.port,
                device_id: config.mqtt.device_id.clone(),
                interval: config.mqtt.interval,
            },
            meters: config.meters.clone(),
            system: SystemView { serial_id: self.identity.to_string() },
        };
    }

    fn save(&self, update: ConfigUpdate) -> ApiReply {
        let mut next = (*self.config.snapshot()).clone();
        if let Some(ssid) = update.wifi.ssid { next.wifi.ssid = ssid; }
        if let Some(pass) = update.wifi.pass { next.wifi.pass = pass; }
        if let Some(server) = update.mqtt.server { next.mqtt.server = server; }
        if let Some(port) = update.mqtt.port { next.mqtt.port = port; }
        if let Some(interval) = update.mqtt.interval { next.mqtt.interval = interval; }
        if let Some(meters) = update.meters { next.meters = meters; }
        /* a saved configuration is always tried in client mode first */
        next.wifi.ap_mode = false;

        match self.store.save(&next) {
            Ok(()) => {
                self.config.replace(next);
                self.restart.request(RestartReason::ConfigSaved);
                ApiReply::Saved
            }
            Err(e) => {
                error!("Unable to save config: {e}");
                ApiReply::Failed(e.to_string())
            }
        }
    }

    fn status(&self) -> StatusView {
        let link = self.link.status();
        return StatusView {
            device_id: self.identity.to_string(),
            connectivity: link.state,
            hotspot: link.is_hotspot_mode(),
            link_up: link.link_up,
            publisher: *self.publisher.borrow(),
        };
    }
}

fn respond(reply: ApiReply) -> HttpResponse {
    match reply {
        ApiReply::Config(view) => HttpResponse::Ok().json(view),
        ApiReply::Status(view) => HttpResponse::Ok().json(view),
        ApiReply::Networks(networks) => HttpResponse::Ok().json(networks),
        ApiReply::Saved => HttpResponse::Ok().json(serde_json::json!({
            "status": "success",
            "msg": "Configuration saved, restarting"
        })),
        ApiReply::Restarting => HttpResponse::Ok().json(serde_json::json!({ "msg": "Rebooting..." })),
        ApiReply::Reset => HttpResponse::Ok().json(serde_json::json!({ "msg": "Reset done, rebooting as hotspot" })),
        ApiReply::Failed(msg) => HttpResponse::InternalServerError().json(serde_json::json!({
            "status": "error",
            "msg": msg
        })),
    }
}

async fn get_config(service: web::Data<ConfigService>) -> impl Responder {
    respond(service.dispatch(ApiCommand::GetConfig).await)
}

async fn save_config(service: web::Data<ConfigService>, update: web::Json<ConfigUpdate>) -> impl Responder {
    info!("Configuration update received");
    respond(service.dispatch(ApiCommand::Save(update.into_inner())).await)
}

async fn restart(service: web::Data<ConfigService>) -> impl Responder {
    respond(service.dispatch(ApiCommand::Restart).await)
}

async fn factory_reset(service: web::Data<ConfigService>) -> impl Responder {
    respond(service.dispatch(ApiCommand::FactoryReset).await)
}

async fn status(service: web::Data<ConfigService>) -> impl Responder {
    respond(service.dispatch(ApiCommand::Status).await)
}

async fn scan(service: web::Data<ConfigService>) -> impl Responder {
    respond(service.dispatch(ApiCommand::Scan).await)
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let response = HttpResponse::BadRequest().json(serde_json::json!({
            "status": "error",
            "msg": "Invalid JSON"
        }));
        InternalError::from_response(err, response).into()
    })
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .route("/api/config", web::get().to(get_config))
        .route("/api/save", web::post().to(save_config))
        .route("/api/restart", web::post().to(restart))
        .route("/api/reset", web::post().to(factory_reset))
        .route("/api/status", web::get().to(status))
        .route("/api/scan", web::get().to(scan));
}

pub struct ApiManager {
    service: ConfigService,
}

impl ApiManager {
    pub fn new(service: ConfigService) -> Self {
        return ApiManager { service };
    }

    pub async fn start_thread(self, port: u16) -> std::io::Result<()> {
        info!("Configuration API listening on port {port}");
        let data = web::Data::new(self.service);

        HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .configure(configure)
                .service(actix_files::Files::new("/", UI_DIR).index_file("index.html").use_last_modified(true))
        })
        .bind(("0.0.0.0", port))?
        .run()
        .await
    }
}
