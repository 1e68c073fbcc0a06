//! Daemon configuration surface.
use std::net::IpAddr;
use std::path::PathBuf;

use courier_types::Endpoint;

use crate::error::DaemonError;

/// Default maximum number of concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;
/// Default listen backlog.
pub const DEFAULT_MAX_PENDING_CONNECTIONS: i32 = 25;
/// Accepted backlog range.
pub const MAX_PENDING_CONNECTIONS_RANGE: (i32, i32) = (5, 1000);
/// Default directory of service declarations.
pub const DEFAULT_SERVICES_DIR: &str = "/usr/share/courier/services";
/// Default directory of runtime state (neighbor cache, cluster status).
pub const DEFAULT_DATA_PATH: &str = "/var/lib/courier";

/// Everything the daemon needs to come up.
///
/// `local_listen` is required and must be a loopback TCP address;
/// `my_address` must name one of the host's interfaces since it is
/// advertised to the rest of the cluster.
#[derive(Debug, Clone)]
pub struct Config {
    /// Loopback TCP endpoint for local services. Required.
    pub local_listen: Endpoint,
    /// Non-loopback TCP endpoint for peer daemons.
    pub remote_listen: Option<Endpoint>,
    /// TLS endpoint for peer daemons; needs an external TLS provider.
    pub secure_listen: Option<Endpoint>,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    /// Unix-stream endpoint for local services.
    pub unix_listen: Option<Endpoint>,
    /// UDP endpoint answering pings (LOG_ROTATE, STOP and friends).
    pub signal: Option<Endpoint>,
    /// Shared secret required on signal datagrams.
    pub signal_secret: Option<String>,
    /// This daemon's name; defaults to the hostname.
    pub server_name: String,
    /// Public endpoint advertised to peers.
    pub my_address: Option<Endpoint>,
    /// Initial neighbor endpoints.
    pub neighbors: Vec<Endpoint>,
    pub services_dir: PathBuf,
    /// Where the neighbor cache and cluster status files live.
    pub data_path: PathBuf,
    pub max_connections: usize,
    pub max_pending_connections: i32,
    /// Soft cap on a connection's output buffer; exceeding it closes the
    /// connection once the current write completes.
    pub output_buffer_cap: Option<usize>,
    /// Log every message going through the daemon.
    pub debug_all_messages: bool,
}

impl Config {
    /// A configuration listening on the given loopback endpoint, with
    /// defaults everywhere else.
    pub fn new(local_listen: Endpoint) -> Self {
        Self {
            local_listen,
            remote_listen: None,
            secure_listen: None,
            certificate: None,
            private_key: None,
            unix_listen: None,
            signal: None,
            signal_secret: None,
            server_name: hostname(),
            my_address: None,
            neighbors: Vec::new(),
            services_dir: PathBuf::from(DEFAULT_SERVICES_DIR),
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_pending_connections: DEFAULT_MAX_PENDING_CONNECTIONS,
            output_buffer_cap: None,
            debug_all_messages: false,
        }
    }

    /// Validate option ranges and relationships.
    pub fn validate(&self) -> Result<(), DaemonError> {
        match self.local_listen.socket_addr() {
            Some(addr) if addr.ip().is_loopback() => {}
            Some(addr) => {
                return Err(DaemonError::Config(format!(
                    "local_listen must be a loopback address, not {addr}"
                )))
            }
            None => {
                return Err(DaemonError::Config(
                    "local_listen must be a TCP address:port".to_string(),
                ))
            }
        }

        let (min, max) = MAX_PENDING_CONNECTIONS_RANGE;
        if self.max_pending_connections < min || self.max_pending_connections > max {
            return Err(DaemonError::Config(format!(
                "max_pending_connections must be in [{min}, {max}]"
            )));
        }

        if let Some(remote) = &self.remote_listen {
            match remote.socket_addr() {
                // Loopback is tolerated for single-machine clusters.
                Some(_) => {}
                None => {
                    return Err(DaemonError::Config(
                        "remote_listen must be a TCP address:port".to_string(),
                    ))
                }
            }
        }

        if self.secure_listen.is_some()
            && (self.certificate.is_none() || self.private_key.is_none())
        {
            return Err(DaemonError::Config(
                "secure_listen requires certificate and private_key".to_string(),
            ));
        }

        if self.server_name.is_empty() {
            return Err(DaemonError::Config("server_name cannot be empty".to_string()));
        }

        if let Some(my_address) = &self.my_address {
            let Some(addr) = my_address.socket_addr() else {
                return Err(DaemonError::Config(
                    "my_address must be a TCP address".to_string(),
                ));
            };
            if !is_local_interface(addr.ip()) {
                return Err(DaemonError::Config(format!(
                    "my_address {addr} is not an address of a local interface"
                )));
            }
        }

        Ok(())
    }

    /// The endpoint advertised to peers: `my_address`, or the remote
    /// listener when unset.
    pub fn advertised_address(&self) -> Option<Endpoint> {
        self.my_address.clone().or_else(|| self.remote_listen.clone())
    }

    pub fn neighbors_cache_file(&self) -> PathBuf {
        self.data_path.join("neighbors.txt")
    }

    pub fn cluster_status_file(&self) -> PathBuf {
        self.data_path.join("cluster-status.txt")
    }
}

/// This host's name, used as the default server name.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "courier".to_string())
}

/// Whether `ip` is assigned to one of the host's interfaces.
fn is_local_interface(ip: IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }

    let Ok(interfaces) = nix::ifaddrs::getifaddrs() else {
        return false;
    };

    for interface in interfaces {
        let Some(address) = interface.address else {
            continue;
        };
        if let Some(sin) = address.as_sockaddr_in() {
            if IpAddr::from(sin.ip()) == ip {
                return true;
            }
        }
        if let Some(sin6) = address.as_sockaddr_in6() {
            if IpAddr::from(sin6.ip()) == ip {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new(Endpoint::parse("127.0.0.1:4040", 0).unwrap())
    }

    #[test]
    fn test_defaults_validate() {
        assert!(config().validate().is_ok());
        assert!(!config().server_name.is_empty());
    }

    #[test]
    fn test_local_listen_must_be_loopback() {
        let cfg = Config::new(Endpoint::parse("192.168.1.1:4040", 0).unwrap());
        assert!(cfg.validate().is_err());

        let cfg = Config::new(Endpoint::parse("/tmp/x.sock", 0).unwrap());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_backlog_range() {
        let mut cfg = config();

        cfg.max_pending_connections = 4;
        assert!(cfg.validate().is_err());

        cfg.max_pending_connections = 1001;
        assert!(cfg.validate().is_err());

        cfg.max_pending_connections = 1000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_secure_listen_needs_keys() {
        let mut cfg = config();

        cfg.secure_listen = Some(Endpoint::parse("0.0.0.0:4043", 0).unwrap());
        assert!(cfg.validate().is_err());

        cfg.certificate = Some(PathBuf::from("/etc/courier/cert.pem"));
        cfg.private_key = Some(PathBuf::from("/etc/courier/key.pem"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_loopback_my_address_is_local() {
        let mut cfg = config();

        cfg.my_address = Some(Endpoint::parse("127.0.0.1:4042", 0).unwrap());
        assert!(cfg.validate().is_ok());
    }
}
