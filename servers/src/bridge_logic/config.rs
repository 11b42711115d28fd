use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Portal to telescope-state bridge", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "BRIDGE_URL", help = "WebSocket URL of the portal to connect to.")]
    pub url: Option<String>,

    #[clap(long, env = "BRIDGE_STORE_URL", help = "Redis URL of the telescope state store.")]
    pub store_url: Option<String>,

    #[clap(long, env = "BRIDGE_NAMESPACE", help = "Namespace to create in the portal [sp_subarray_N].")]
    pub namespace: Option<String>,

    #[clap(
        long,
        env = "BRIDGE_STREAMS",
        help = "Comma-separated full_stream_name:stream_type[:instrument] tuples."
    )]
    pub streams: Option<String>,

    #[clap(
        long,
        env = "BRIDGE_COLLAPSE_STREAMS",
        help = "Collapse instrument and stream prefixes for backwards-compatible state keys."
    )]
    #[serde(default)]
    pub collapse_streams: bool,

    #[clap(short = 'a', long, env = "BRIDGE_HOST", help = "Hostname to bind for the operator interface.")]
    pub host: Option<String>,

    #[clap(short = 'p', long, env = "BRIDGE_PORT", help = "Port to bind for the operator interface [2047].")]
    pub port: Option<u16>,

    #[clap(long, env = "BRIDGE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "BRIDGE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "BRIDGE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,
}

/// Fully resolved configuration, after defaults, config file and CLI merging.
#[derive(Debug, Clone)]
pub struct Settings {
    pub url: String,
    pub store_url: String,
    pub namespace: Option<String>,
    pub streams: String,
    pub collapse_streams: bool,
    pub host: String,
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            url: other.url.or(self.url),
            store_url: other.store_url.or(self.store_url),
            namespace: other.namespace.or(self.namespace),
            streams: other.streams.or(self.streams),
            collapse_streams: other.collapse_streams || self.collapse_streams,
            host: other.host.or(self.host),
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }

    /// Validate that the required arguments ended up set, from whichever
    /// layer provided them.
    pub fn into_settings(self) -> anyhow::Result<Settings> {
        let url = self.url.ok_or_else(|| anyhow::anyhow!("argument --url is required"))?;
        let store_url = self
            .store_url
            .ok_or_else(|| anyhow::anyhow!("argument --store-url is required"))?;
        let streams = self
            .streams
            .ok_or_else(|| anyhow::anyhow!("argument --streams is required"))?;
        Ok(Settings {
            url,
            store_url,
            namespace: self.namespace,
            streams,
            collapse_streams: self.collapse_streams,
            host: self.host.unwrap_or_default(),
            port: self.port.unwrap_or(2047),
            log_dir: self.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }
}

pub fn load_config() -> Config {
    // 1. Defaults that make sense without any other source
    let default_config = Config {
        port: Some(2047),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        ..Default::default()
    };

    // 2. Parse CLI early to pick up a config-file path override
    let cli_args = Config::parse();
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_bridge.conf"));

    let mut current_config = default_config;

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(err) => log::warn!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    err
                ),
            },
            Err(err) => log::warn!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                err
            ),
        }
    }

    // 3. Environment variables and CLI arguments override the file
    current_config.merge(cli_args)
}
