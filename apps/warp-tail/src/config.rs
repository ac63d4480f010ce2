use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use warp_client::ClientConfig;
use warp_transport_websocket::WebSocketTransportConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct TailConfig {
    /// Default host for relative node URIs.
    pub host: Option<String>,
    /// Credentials sent as `auth` on every session.
    pub auth_token: Option<String>,
    pub keep_online: bool,
    #[serde(with = "humantime_serde")]
    pub reconnect_initial: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_max: Duration,
    #[serde(with = "humantime_serde")]
    pub link_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub relink_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub max_outbound_queue: Option<usize>,
    pub outbound_queue_capacity: usize,
}

impl TailConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("host", None::<String>)?
            .set_default("auth_token", None::<String>)?
            .set_default("keep_online", true)?
            .set_default("reconnect_initial", "500ms")?
            .set_default("reconnect_max", "30s")?
            .set_default("link_timeout", "30s")?
            .set_default("idle_timeout", "1s")?
            .set_default("relink_delay", "500ms")?
            .set_default("tick_interval", "10ms")?
            .set_default("connect_timeout", "10s")?
            .set_default("max_outbound_queue", None::<u64>)?
            .set_default("outbound_queue_capacity", 1024)?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // .env files feed the WARP_TAIL environment source below.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("WARP_TAIL").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            keep_online: self.keep_online,
            reconnect_initial: self.reconnect_initial,
            reconnect_max: self.reconnect_max,
            link_timeout: self.link_timeout,
            idle_timeout: self.idle_timeout,
            relink_delay: self.relink_delay,
            max_outbound_queue: self.max_outbound_queue,
            tick_interval: self.tick_interval,
        }
    }

    pub fn transport_config(&self) -> WebSocketTransportConfig {
        WebSocketTransportConfig {
            outbound_queue_capacity: self.outbound_queue_capacity,
            connect_timeout: self.connect_timeout,
            ..WebSocketTransportConfig::default()
        }
    }
}
