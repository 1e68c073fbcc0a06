use serde::Deserialize;

#[derive(Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_max_pending_connections")]
    pub max_pending_connections: i32,
}

fn default_max_connections() -> usize {
    courier_daemon::config::DEFAULT_MAX_CONNECTIONS
}

fn default_max_pending_connections() -> i32 {
    courier_daemon::config::DEFAULT_MAX_PENDING_CONNECTIONS
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_pending_connections: default_max_pending_connections(),
        }
    }
}
