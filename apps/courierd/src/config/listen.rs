use std::path::PathBuf;

use serde::Deserialize;

use courier_types::Endpoint;

/// Where the daemon accepts connections.
#[derive(Deserialize)]
pub struct ListenConfig {
    /// Loopback TCP endpoint for local services. Required.
    pub local: Endpoint,

    /// TCP endpoint for peer daemons.
    #[serde(default)]
    pub remote: Option<Endpoint>,

    /// TLS endpoint for peer daemons; requires an external TLS provider.
    #[serde(default)]
    pub secure: Option<Endpoint>,

    #[serde(default)]
    pub certificate: Option<PathBuf>,

    #[serde(default)]
    pub private_key: Option<PathBuf>,

    /// Unix-stream endpoint for local services.
    #[serde(default)]
    pub unix: Option<Endpoint>,

    /// UDP endpoint answering pings.
    #[serde(default)]
    pub signal: Option<Endpoint>,

    /// Shared secret required on signal datagrams.
    #[serde(default)]
    pub signal_secret: Option<String>,
}
