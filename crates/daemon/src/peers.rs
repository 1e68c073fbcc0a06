//! Peer daemon bookkeeping: connection state, directionality, gossip and
//! failure flagging.
use std::collections::{BTreeSet, HashMap};

use tracing::{error, info};

use courier_net::time::{LocalDuration, LocalTime};
use courier_net::ConnectionId;
use courier_types::Endpoint;

/// Lowest handshake version we still talk to.
pub const MIN_PROTOCOL_VERSION: i64 = 1;

/// Initial pause between GOSSIP announcements.
pub const GOSSIP_INITIAL_PAUSE: LocalDuration = LocalDuration::from_secs(5);
/// Cap on the gossip back-off.
pub const GOSSIP_MAX_PAUSE: LocalDuration = LocalDuration::from_mins(60);

/// Park time after a REFUSE without a reason.
pub const REFUSE_PARK: LocalDuration = LocalDuration::from_mins(1);
/// Park time after REFUSE{shutdown}.
pub const REFUSE_SHUTDOWN_PARK: LocalDuration = LocalDuration::from_mins(5);
/// Park time after REFUSE{busy}.
pub const REFUSE_BUSY_PARK: LocalDuration = LocalDuration::from_mins(24 * 60);

/// Consecutive failures before the operator is flagged.
pub const FAILURE_FLAG_COUNT: u32 = 20;
/// The failures must span at least this long.
pub const FAILURE_FLAG_SPAN: LocalDuration = LocalDuration::from_mins(60);

/// Connection state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    #[default]
    Down,
    Connecting,
    Connected,
    /// Peer refused our CONNECT; retry after the park time.
    Refused,
    ShuttingDown,
}

/// Who is responsible for the connection between us and a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Peer orders below us: we own the outbound connection.
    Outbound,
    /// Peer orders above us: we gossip until it connects to us.
    Gossip,
    /// Our own endpoint; ignored.
    Same,
}

/// Decide responsibility from the endpoint order.
pub fn direction(us: &Endpoint, peer: &Endpoint) -> Direction {
    match peer.cmp(us) {
        std::cmp::Ordering::Less => Direction::Outbound,
        std::cmp::Ordering::Greater => Direction::Gossip,
        std::cmp::Ordering::Equal => Direction::Same,
    }
}

/// Everything we know about one peer daemon.
#[derive(Debug, Default)]
pub struct PeerRecord {
    pub state: PeerState,
    /// Name learned during the handshake.
    pub server_name: Option<String>,
    /// Services registered on that daemon.
    pub services: BTreeSet<String>,
    /// Services that daemon has heard of elsewhere.
    pub heard_of: BTreeSet<String>,
    /// Command vocabulary, learned from the peer's `COMMANDS` reply.
    pub commands: BTreeSet<String>,
    /// Last load average reported by the peer.
    pub load: Option<f64>,
    /// The live message connection, once the handshake completed.
    pub connection: Option<ConnectionId>,
    /// The gossip connection, while we are announcing ourselves.
    pub gossip: Option<ConnectionId>,
    /// Do not reconnect before this time (REFUSE park).
    pub retry_at: Option<LocalTime>,
    failures: u32,
    first_failure: Option<LocalTime>,
    flagged: bool,
}

impl PeerRecord {
    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    pub fn is_flagged(&self) -> bool {
        self.flagged
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn hosts(&self, service: &str) -> bool {
        self.services.contains(service)
    }

    pub fn heard_of(&self, service: &str) -> bool {
        self.heard_of.contains(service)
    }
}

/// The peer table, keyed by endpoint.
#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<Endpoint, PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&mut self, endpoint: &Endpoint) -> &mut PeerRecord {
        self.peers.entry(endpoint.clone()).or_default()
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<&PeerRecord> {
        self.peers.get(endpoint)
    }

    pub fn get_mut(&mut self, endpoint: &Endpoint) -> Option<&mut PeerRecord> {
        self.peers.get_mut(endpoint)
    }

    pub fn remove(&mut self, endpoint: &Endpoint) -> Option<PeerRecord> {
        self.peers.remove(endpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Endpoint, &PeerRecord)> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Endpoint, &mut PeerRecord)> {
        self.peers.iter_mut()
    }

    /// Peers with a completed handshake.
    pub fn connected(&self) -> impl Iterator<Item = (&Endpoint, &PeerRecord)> {
        self.peers.iter().filter(|(_, peer)| peer.is_connected())
    }

    /// Number of live remote connections, for the cluster quorum.
    pub fn live_count(&self) -> usize {
        self.connected().count()
    }

    pub fn find_by_server_name(&self, server_name: &str) -> Option<(&Endpoint, &PeerRecord)> {
        self.peers
            .iter()
            .find(|(_, peer)| peer.server_name.as_deref() == Some(server_name))
    }

    pub fn by_connection(&self, id: ConnectionId) -> Option<(&Endpoint, &PeerRecord)> {
        self.peers
            .iter()
            .find(|(_, peer)| peer.connection == Some(id))
    }

    /// Pick the peer to carry a message for `service`: among connected
    /// peers hosting it, tie-break by lowest load then lowest endpoint;
    /// fall back to peers that heard of it.
    pub fn choose_host(&self, service: &str) -> Option<&Endpoint> {
        fn best<'a>(mut candidates: Vec<(&'a Endpoint, &PeerRecord)>) -> Option<&'a Endpoint> {
            candidates.sort_by(|(ea, pa), (eb, pb)| {
                let la = pa.load.unwrap_or(f64::MAX);
                let lb = pb.load.unwrap_or(f64::MAX);

                la.partial_cmp(&lb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| ea.cmp(eb))
            });
            candidates.first().map(|(endpoint, _)| *endpoint)
        }

        let hosting: Vec<_> = self
            .connected()
            .filter(|(_, peer)| peer.hosts(service))
            .collect();
        if !hosting.is_empty() {
            return best(hosting);
        }

        let heard: Vec<_> = self
            .connected()
            .filter(|(_, peer)| peer.heard_of(service))
            .collect();
        best(heard)
    }

    /// Record one more connection failure. Returns true when the failure
    /// streak crosses the operator-flag threshold.
    pub fn record_failure(&mut self, endpoint: &Endpoint, now: LocalTime) -> bool {
        let peer = self.entry(endpoint);

        peer.failures += 1;
        let since = *peer.first_failure.get_or_insert(now);

        if !peer.flagged
            && peer.failures >= FAILURE_FLAG_COUNT
            && now - since >= FAILURE_FLAG_SPAN
        {
            peer.flagged = true;
            error!(
                target: "courier",
                "Peer {} unreachable: {} consecutive failures since {}",
                endpoint,
                peer.failures,
                since,
            );
            return true;
        }
        false
    }

    /// Record a successful connection, clearing the failure streak and
    /// any operator flag.
    pub fn record_success(&mut self, endpoint: &Endpoint) {
        let peer = self.entry(endpoint);

        if peer.flagged {
            info!(target: "courier", "Peer {} is reachable again", endpoint);
        }
        peer.failures = 0;
        peer.first_failure = None;
        peer.flagged = false;
    }

    /// The union of every service known across the cluster, for the
    /// `heard_of` handshake parameter.
    pub fn services_heard_of(&self) -> BTreeSet<String> {
        let mut all = BTreeSet::new();

        for peer in self.peers.values() {
            all.extend(peer.services.iter().cloned());
            all.extend(peer.heard_of.iter().cloned());
        }
        all
    }
}

/// Park duration for a REFUSE reply.
pub fn refuse_park(busy: bool, shutdown: bool) -> LocalDuration {
    if busy {
        REFUSE_BUSY_PARK
    } else if shutdown {
        REFUSE_SHUTDOWN_PARK
    } else {
        REFUSE_PARK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::connection_ids;

    fn ep(s: &str) -> Endpoint {
        Endpoint::parse(s, 0).unwrap()
    }

    #[test]
    fn test_directionality() {
        let us = ep("10.0.0.5:4040");

        assert_eq!(direction(&us, &ep("10.0.0.1:4040")), Direction::Outbound);
        assert_eq!(direction(&us, &ep("10.0.0.9:4040")), Direction::Gossip);
        assert_eq!(direction(&us, &ep("10.0.0.5:4040")), Direction::Same);
        // Port breaks ties.
        assert_eq!(direction(&us, &ep("10.0.0.5:4039")), Direction::Outbound);
    }

    #[test]
    fn test_choose_host_prefers_load_then_endpoint() {
        let ids = connection_ids(3);
        let mut table = PeerTable::new();

        for (i, (endpoint, load)) in [
            (ep("10.0.0.1:1"), Some(2.0)),
            (ep("10.0.0.2:1"), Some(0.5)),
            (ep("10.0.0.3:1"), Some(0.5)),
        ]
        .into_iter()
        .enumerate()
        {
            let peer = table.entry(&endpoint);

            peer.state = PeerState::Connected;
            peer.connection = Some(ids[i]);
            peer.load = load;
            peer.services.insert("backend".to_string());
        }

        // 0.5 ties between .2 and .3; the smaller endpoint wins.
        assert_eq!(table.choose_host("backend"), Some(&ep("10.0.0.2:1")));
    }

    #[test]
    fn test_choose_host_falls_back_to_heard_of() {
        let mut table = PeerTable::new();

        let peer = table.entry(&ep("10.0.0.1:1"));
        peer.state = PeerState::Connected;
        peer.heard_of.insert("mystery".to_string());

        assert_eq!(table.choose_host("mystery"), Some(&ep("10.0.0.1:1")));
        assert_eq!(table.choose_host("nowhere"), None);
    }

    #[test]
    fn test_failure_flag_needs_count_and_span() {
        let mut table = PeerTable::new();
        let endpoint = ep("10.0.0.1:1");
        let start = LocalTime::from_secs(1000);

        // Twenty failures within a minute: not flagged yet.
        for i in 0..FAILURE_FLAG_COUNT {
            let now = start + LocalDuration::from_secs(i as u64);
            assert!(!table.record_failure(&endpoint, now));
        }

        // One more an hour later crosses both thresholds.
        let later = start + FAILURE_FLAG_SPAN;
        assert!(table.record_failure(&endpoint, later));
        assert!(table.get(&endpoint).unwrap().is_flagged());

        // Success clears everything.
        table.record_success(&endpoint);
        let peer = table.get(&endpoint).unwrap();
        assert!(!peer.is_flagged());
        assert_eq!(peer.failures(), 0);
    }

    #[test]
    fn test_refuse_park_durations() {
        assert_eq!(refuse_park(true, false), REFUSE_BUSY_PARK);
        assert_eq!(refuse_park(false, true), REFUSE_SHUTDOWN_PARK);
        assert_eq!(refuse_park(false, false), REFUSE_PARK);
    }

    #[test]
    fn test_services_heard_of_union() {
        let mut table = PeerTable::new();

        table
            .entry(&ep("10.0.0.1:1"))
            .services
            .insert("a".to_string());
        table
            .entry(&ep("10.0.0.2:1"))
            .heard_of
            .insert("b".to_string());

        let heard: Vec<_> = table.services_heard_of().into_iter().collect();
        assert_eq!(heard, vec!["a".to_string(), "b".to_string()]);
    }
}
