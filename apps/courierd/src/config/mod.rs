use std::path::{Path, PathBuf};

use config::Config;
use serde::Deserialize;

mod cluster;
pub use cluster::ClusterConfig;

mod limits;
pub use limits::LimitsConfig;

mod listen;
pub use listen::ListenConfig;

mod logger;
pub use logger::LoggerConfig;

/// The daemon's TOML configuration file.
#[derive(Deserialize)]
pub struct DaemonConfigFile {
    #[serde(default = "default_server_name")]
    pub server_name: String,

    pub listen: ListenConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub logger: LoggerConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default = "default_services_dir")]
    pub services_dir: PathBuf,

    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
}

fn default_server_name() -> String {
    courier_daemon::config::hostname()
}

fn default_services_dir() -> PathBuf {
    PathBuf::from(courier_daemon::config::DEFAULT_SERVICES_DIR)
}

fn default_data_path() -> PathBuf {
    PathBuf::from(courier_daemon::config::DEFAULT_DATA_PATH)
}

impl DaemonConfigFile {
    pub fn from_path(path: &Path) -> eyre::Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Flatten the file sections into the daemon's configuration.
    pub fn into_daemon_config(self) -> eyre::Result<courier_daemon::Config> {
        let mut config = courier_daemon::Config::new(self.listen.local);

        config.server_name = self.server_name;
        config.remote_listen = self.listen.remote;
        config.secure_listen = self.listen.secure;
        config.certificate = self.listen.certificate;
        config.private_key = self.listen.private_key;
        config.unix_listen = self.listen.unix;
        config.signal = self.listen.signal;
        config.signal_secret = self.listen.signal_secret;
        config.my_address = self.cluster.my_address;
        config.neighbors = self.cluster.neighbors;
        config.services_dir = self.services_dir;
        config.data_path = self.data_path;
        config.max_connections = self.limits.max_connections;
        config.max_pending_connections = self.limits.max_pending_connections;
        config.debug_all_messages = self.logger.debug_all_messages;

        Ok(config)
    }
}
