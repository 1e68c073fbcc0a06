use serde::Deserialize;

use courier_types::Endpoint;

/// Cluster membership options.
#[derive(Deserialize, Default)]
pub struct ClusterConfig {
    /// Public endpoint advertised to peers; must be a local interface.
    #[serde(default)]
    pub my_address: Option<Endpoint>,

    /// Endpoints of the other daemons in the cluster.
    #[serde(default)]
    pub neighbors: Vec<Endpoint>,
}
