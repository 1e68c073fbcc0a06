//! The communicator daemon: accepts local service registrations and peer
//! daemon connections, and routes named messages between them.
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use nix::sys::signal::Signal;
use tracing::{debug, error, info, warn};

use courier_net::dispatch::timespec_now;
use courier_net::framing::{MessageConnection, MessageHandler, MessageStream};
use courier_net::signals::SignalConnection;
use courier_net::stream::{MessageSink, StreamIo};
use courier_net::tcp::TcpServer;
use courier_net::time::{LocalDuration, LocalTime};
use courier_net::udp::DgramServer;
use courier_net::unix::UnixServer;
use courier_net::watch::FileWatcher;
use courier_net::{ConnectionId, Control, PermanentClient, Reactor, Timer};
use courier_types::{Endpoint, Message, MESSAGE_VERSION};

use crate::cache::{cache_ttl, MessageCache};
use crate::cluster::ClusterTracker;
use crate::config::Config;
use crate::error::DaemonError;
use crate::loadavg::{self, LoadAvg, LOADAVG_PERIOD_SECS};
use crate::neighbors::NeighborList;
use crate::peers::{self, direction, Direction, PeerState, PeerTable};
use crate::registry::Registry;
use crate::router::{self, BroadcastTable, BROADCAST_HOP_LIMIT};

/// How often the maintenance timer sweeps caches and retries peers.
const MAINTENANCE_PERIOD: LocalDuration = LocalDuration::from_secs(10);

/// Commands the daemon handles itself.
const DAEMON_COMMANDS: &[&str] = &[
    "ACCEPT",
    "ALIVE",
    "CLUSTER_STATUS",
    "COMMANDS",
    "CONNECT",
    "DISCONNECT",
    "FORGET",
    "GOSSIP",
    "HANGUP",
    "HELP",
    "INVALID",
    "LEAK",
    "LIST_SERVICES",
    "LISTEN_LOAD_AVG",
    "LOAD_AVG",
    "LOG_ROTATE",
    "PUBLIC_IP",
    "QUITTING",
    "RECEIVED",
    "REFUSE",
    "REGISTER",
    "REGISTER_FOR_LOAD_AVG",
    "RELOAD_CONFIG",
    "SERVICE_STATUS",
    "SERVICE_UNAVAILABLE",
    "SHUTDOWN",
    "STOP",
    "TRANSMISSION_REPORT",
    "UNKNOWN",
    "UNREGISTER",
    "UNREGISTER_FOR_LOAD_AVG",
];

/// How a daemon run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Clean stop; exit code 0.
    Clean,
    /// Restart requested (RELOAD_CONFIG); exit code 1 so the supervisor
    /// brings the daemon back up.
    Restart,
}

/// What kind of connection a message arrived on.
#[derive(Debug, Clone)]
pub enum SenderKind {
    /// Local service connection (TCP loopback or Unix-stream).
    Service { registered: Option<String> },
    /// Peer connection accepted on the remote listener.
    PeerIn {
        endpoint: Option<Endpoint>,
        server_name: Option<String>,
    },
    /// Outbound connection we own to a numerically-smaller peer.
    PeerOut { endpoint: Endpoint },
    /// The UDP signal endpoint; there is no reply channel.
    Udp,
}

impl SenderKind {
    fn peer_endpoint(&self) -> Option<&Endpoint> {
        match self {
            Self::PeerIn { endpoint, .. } => endpoint.as_ref(),
            Self::PeerOut { endpoint } => Some(endpoint),
            _ => None,
        }
    }
}

/// The connection a message is being processed for.
pub struct Sender<'a> {
    pub id: ConnectionId,
    pub kind: &'a mut SenderKind,
    pub sink: &'a mut dyn MessageSink,
}

impl Sender<'_> {
    fn reply(&mut self, msg: &Message) {
        if let Err(err) = self.sink.send_message(msg) {
            warn!(target: "courier", "Cannot reply with {}: {}", msg.command(), err);
        }
    }

    fn is_service(&self) -> bool {
        matches!(self.kind, SenderKind::Service { .. })
    }
}

/// The daemon's entire mutable state, owned by the reactor thread.
pub struct State {
    pub config: Config,
    pub registry: Registry,
    pub cache: MessageCache,
    pub broadcasts: BroadcastTable,
    pub peers: PeerTable,
    pub cluster: ClusterTracker,
    pub neighbors: NeighborList,
    pub loadavg: LoadAvg,
    /// Message connections by reactor id, for routing.
    links: HashMap<ConnectionId, Weak<RefCell<dyn MessageConnection>>>,
    /// Replies that could not be delivered because the target connection
    /// is the one currently being dispatched.
    deferred: Vec<(ConnectionId, Message)>,
    /// Listeners, the signal endpoint and timers; removed on shutdown.
    core: Vec<ConnectionId>,
    /// Services declared in `services_dir`, expected to register sooner
    /// or later.
    known_services: std::collections::BTreeSet<String>,
    /// Back-reference used to hand out handler state.
    handle: Weak<RefCell<State>>,
    /// Actual address of the local listener (relevant when the
    /// configuration asked for an ephemeral port).
    bound_local: Option<SocketAddr>,
    shutting_down: bool,
    outcome: Option<Shutdown>,
    started_at: LocalTime,
}

impl State {
    fn new(config: Config) -> Self {
        let neighbors = NeighborList::load(
            Some(config.neighbors_cache_file()),
            &config.neighbors,
        );
        let cluster = ClusterTracker::new(Some(config.cluster_status_file()));

        Self {
            registry: Registry::new(),
            cache: MessageCache::new(),
            broadcasts: BroadcastTable::new(),
            peers: PeerTable::new(),
            cluster,
            neighbors,
            loadavg: LoadAvg::new(),
            links: HashMap::new(),
            deferred: Vec::new(),
            core: Vec::new(),
            known_services: std::collections::BTreeSet::new(),
            handle: Weak::new(),
            bound_local: None,
            shutting_down: false,
            outcome: None,
            started_at: LocalTime::now(),
            config,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// The address local services should use to reach us.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.bound_local
    }

    /// The endpoint advertised to the cluster.
    fn advertised(&self) -> Option<Endpoint> {
        self.config.advertised_address()
    }

    fn register_link(&mut self, id: ConnectionId, link: &Rc<RefCell<dyn MessageConnection>>) {
        self.links.insert(id, Rc::downgrade(link));
    }

    /// Queue a message on another connection. Delivery to the connection
    /// currently being dispatched is deferred to its own handler.
    fn send_to(&mut self, id: ConnectionId, msg: &Message) {
        let Some(conn) = self.links.get(&id).and_then(Weak::upgrade) else {
            debug!(target: "courier", "Dropping {}: connection is gone", msg.command());
            self.links.remove(&id);
            return;
        };

        match conn.try_borrow_mut() {
            Ok(mut conn) => {
                if let Err(err) = conn.send_message(msg) {
                    warn!(target: "courier", "Cannot send {}: {}", msg.command(), err);
                }
            }
            Err(_) => self.deferred.push((id, msg.clone())),
        };
    }

    /// Replies owed to the given connection, queued while it was being
    /// dispatched.
    pub fn take_deferred(&mut self, id: ConnectionId) -> Vec<Message> {
        let (mine, rest): (Vec<_>, Vec<_>) = self
            .deferred
            .drain(..)
            .partition(|(target, _)| *target == id);

        self.deferred = rest;
        mine.into_iter().map(|(_, msg)| msg).collect()
    }

    /// Process one inbound message: de-duplicate, stamp the origin,
    /// handle daemon commands, route the rest.
    pub fn process(&mut self, sender: &mut Sender, msg: &Message, ctl: &mut Control) {
        if self.config.debug_all_messages {
            debug!(target: "courier", "Processing: {}", msg);
        }

        if !self.broadcasts.check(msg, ctl.now()) {
            debug!(target: "courier", "Dropping duplicate broadcast {}", msg.command());
            return;
        }

        let mut msg = msg.clone();

        // Stamp the origin so replies can find their way back.
        if msg.sent_from_server().is_empty() && sender.is_service() {
            msg.set_sent_from_server(&self.config.server_name);
        }
        if msg.sent_from_service().is_empty() {
            if let SenderKind::Service {
                registered: Some(name),
            } = sender.kind
            {
                msg.set_sent_from_service(name.clone());
            }
        }

        let for_us = msg.is_for_daemon()
            && (msg.server().is_empty()
                || msg.server() == "."
                || msg.server() == self.config.server_name);

        if for_us {
            if DAEMON_COMMANDS.contains(&msg.command()) {
                self.daemon_command(sender, &msg, ctl);
                return;
            }
            if msg.service().is_empty() {
                // Addressed at the daemon with a command we do not know.
                debug!(target: "courier", "Unknown command: {}", msg);

                let mut reply = Message::reply_to(&msg);

                reply.set_command("UNKNOWN");
                reply.set_parameter("command", msg.command());
                sender.reply(&reply);
                return;
            }
            // A `"."` service with a foreign command is a local broadcast.
        }

        self.route(sender, &msg, ctl);
    }

    /// The command table of the daemon itself.
    fn daemon_command(&mut self, sender: &mut Sender, msg: &Message, ctl: &mut Control) {
        match msg.command() {
            "ALIVE" => {
                let mut reply = Message::reply_to(msg);

                reply.set_command("ABSOLUTELY");
                for echoed in ["serial", "timestamp"] {
                    if let Some(value) = msg.parameter(echoed) {
                        reply.set_parameter(echoed, value);
                    }
                }
                reply.set_parameter("reply_timestamp", timespec_now());
                sender.reply(&reply);
            }
            "HELP" => {
                let mut reply = Message::reply_to(msg);

                reply.set_command("COMMANDS");
                reply.set_parameter("list", DAEMON_COMMANDS.join(","));
                sender.reply(&reply);
            }
            "COMMANDS" => self.msg_commands(sender, msg),
            "REGISTER" => self.msg_register(sender, msg, ctl),
            "UNREGISTER" => self.msg_unregister(sender, ctl),
            "CONNECT" => self.msg_connect(sender, msg, ctl),
            "ACCEPT" => self.msg_accept(sender, msg, ctl),
            "REFUSE" => self.msg_refuse(sender, msg, ctl),
            "GOSSIP" => self.msg_gossip(sender, msg, ctl),
            "RECEIVED" => {} // handled by the gossip connection itself
            "FORGET" => self.msg_forget(sender, msg, ctl),
            "DISCONNECT" => self.msg_peer_gone(sender, ctl, "disconnect requested"),
            "QUITTING" => self.msg_peer_gone(sender, ctl, "peer is quitting"),
            "CLUSTER_STATUS" => {
                if matches!(sender.kind, SenderKind::Udp) {
                    error!(target: "courier", "CLUSTER_STATUS is only accepted over a stream connection");
                    return;
                }
                for status in self.cluster.current(self.neighbors.len()) {
                    sender.reply(&status);
                }
            }
            "LIST_SERVICES" => {
                let mut reply = Message::reply_to(msg);

                reply.set_command("SERVICES");
                reply.set_parameter("list", self.registry.to_list());
                sender.reply(&reply);
            }
            "SERVICE_STATUS" => self.msg_service_status(sender, msg),
            "PUBLIC_IP" => {
                let mut reply = Message::reply_to(msg);

                reply.set_command("SERVER_PUBLIC_IP");
                if let Some(advertised) = self.advertised() {
                    reply.set_parameter("public_ip", advertised);
                }
                sender.reply(&reply);
            }
            "LOAD_AVG" => self.msg_load_avg(sender, msg),
            "LISTEN_LOAD_AVG" => {
                if let Some(endpoint) = sender.kind.peer_endpoint() {
                    self.loadavg.listen(endpoint.clone());
                }
            }
            "REGISTER_FOR_LOAD_AVG" => self.msg_loadavg_registration(sender, true),
            "UNREGISTER_FOR_LOAD_AVG" => self.msg_loadavg_registration(sender, false),
            "LOG_ROTATE" => {
                info!(target: "courier", "Rotating logs on request");
                let targets: Vec<ConnectionId> = self
                    .registry
                    .interested_in("LOG_ROTATE")
                    .map(|r| r.id)
                    .filter(|id| *id != sender.id)
                    .collect();

                for id in targets {
                    self.send_to(id, &Message::new("LOG_ROTATE"));
                }
            }
            "STOP" => self.start_shutdown(false, ctl),
            "SHUTDOWN" => self.start_shutdown(true, ctl),
            "RELOAD_CONFIG" => {
                // A graceful stop with a restart exit code; the supervisor
                // restarts us against the new configuration.
                self.outcome = Some(Shutdown::Restart);
                self.start_shutdown(false, ctl);
            }
            "INVALID" | "UNKNOWN" => {
                debug!(target: "courier", "Peer did not understand: {}", msg);
            }
            "TRANSMISSION_REPORT" => {
                debug!(target: "courier", "Transmission report: {}", msg);
            }
            "SERVICE_UNAVAILABLE" | "HANGUP" => {}
            "LEAK" => {
                debug!(
                    target: "courier",
                    "Up since {}: {} link(s), {} cached message(s), {} broadcast id(s)",
                    self.started_at,
                    self.links.len(),
                    self.cache.len(),
                    self.broadcasts.len(),
                );
            }
            other => {
                debug!(target: "courier", "Unknown daemon command {:?}", other);
                let mut reply = Message::reply_to(msg);

                reply.set_command("UNKNOWN");
                reply.set_parameter("command", other);
                sender.reply(&reply);
            }
        }
    }

    // Registrar ///////////////////////////////////////////////////////////

    fn msg_register(&mut self, sender: &mut Sender, msg: &Message, ctl: &mut Control) {
        if !sender.is_service() {
            error!(target: "courier", "REGISTER is only accepted over a local connection");
            return;
        }
        if self.shutting_down {
            sender.reply(&Message::new("QUITTING"));
            ctl.done(sender.id);
            return;
        }

        let (Some(service), true) = (msg.parameter("service"), msg.has_parameter("version"))
        else {
            error!(target: "courier", "REGISTER requires \"service\" and \"version\" parameters");
            return;
        };
        let service = service.to_string();

        match msg.integer_parameter("version") {
            Ok(version) if version >= MESSAGE_VERSION => {}
            _ => {
                error!(
                    target: "courier",
                    "REGISTER with an incompatible version; expected at least {}",
                    MESSAGE_VERSION,
                );
                return;
            }
        }

        let now = ctl.now();
        if self.registry.register(&service, sender.id, now).is_err() {
            error!(target: "courier", "Service {:?} is already registered", service);
            ctl.done(sender.id);
            return;
        }
        *sender.kind = SenderKind::Service {
            registered: Some(service.clone()),
        };

        // Learn the service's vocabulary, then let it start working.
        sender.reply(&Message::new("HELP"));

        let mut ready = Message::new("READY");
        if let Some(addr) = self.bound_local {
            ready.set_parameter("my_address", addr);
        }
        sender.reply(&ready);

        self.send_status(&service, true, now, sender.id);

        // Whatever was waiting for this service goes out now, in order.
        for cached in self.cache.take(&service, now) {
            sender.reply(&cached);
        }
    }

    fn msg_unregister(&mut self, sender: &mut Sender, ctl: &mut Control) {
        let SenderKind::Service {
            registered: Some(service),
        } = sender.kind.clone()
        else {
            error!(target: "courier", "UNREGISTER from an unregistered connection");
            return;
        };

        self.registry.unregister(&service);
        *sender.kind = SenderKind::Service { registered: None };
        self.send_status(&service, false, ctl.now(), sender.id);
        ctl.done(sender.id);
    }

    fn msg_commands(&mut self, sender: &mut Sender, msg: &Message) {
        let Some(list) = msg.parameter("list") else {
            error!(target: "courier", "COMMANDS without a \"list\" parameter");
            return;
        };
        let commands = list
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        match &sender.kind {
            SenderKind::Service {
                registered: Some(service),
            } => {
                if let Some(registration) = self.registry.get_mut(service) {
                    registration.commands = commands.collect();
                    registration.is_ready = true;
                }
            }
            kind => {
                if let Some(endpoint) = kind.peer_endpoint().cloned() {
                    self.peers.entry(&endpoint).commands = commands.collect();
                }
            }
        }
    }

    fn msg_loadavg_registration(&mut self, sender: &mut Sender, wanted: bool) {
        let SenderKind::Service {
            registered: Some(service),
        } = sender.kind
        else {
            return;
        };
        if let Some(registration) = self.registry.get_mut(service) {
            registration.wants_loadavg = wanted;
        }
    }

    fn msg_service_status(&mut self, sender: &mut Sender, msg: &Message) {
        let Some(service) = msg.parameter("service") else {
            error!(target: "courier", "SERVICE_STATUS requires a \"service\" parameter");
            return;
        };

        let mut reply = Message::reply_to(msg);
        reply.set_command("STATUS");
        reply.set_parameter("service", service);
        reply.set_parameter("cache", "no");

        match self.registry.get(service) {
            Some(registration) => {
                reply.set_parameter("status", "up");
                reply.set_parameter("up_since", registration.registered_at.as_secs());
            }
            None => {
                reply.set_parameter("status", "down");
            }
        }
        sender.reply(&reply);
    }

    /// Broadcast a service up/down STATUS to the local services that
    /// declared interest in it.
    fn send_status(&mut self, service: &str, up: bool, now: LocalTime, exclude: ConnectionId) {
        let mut status = Message::new("STATUS");

        status.set_parameter("service", service);
        status.set_parameter("server_name", &self.config.server_name);
        status.set_parameter("cache", "no");
        if up {
            status.set_parameter("status", "up");
            status.set_parameter("up_since", now.as_secs());
        } else {
            status.set_parameter("status", "down");
            status.set_parameter("down_since", now.as_secs());
        }

        let targets: Vec<ConnectionId> = self
            .registry
            .interested_in("STATUS")
            .map(|r| r.id)
            .filter(|id| *id != exclude)
            .collect();

        for id in targets {
            self.send_to(id, &status);
        }
    }

    // Peer manager ////////////////////////////////////////////////////////

    /// The CONNECT we send when dialing a peer.
    fn connect_message(&self) -> Message {
        let mut msg = Message::new("CONNECT");

        msg.set_parameter("version", MESSAGE_VERSION);
        msg.set_parameter("server_name", &self.config.server_name);
        if let Some(advertised) = self.advertised() {
            msg.set_parameter("my_address", advertised);
        }
        let services = self.registry.to_list();
        if !services.is_empty() {
            msg.set_parameter("services", services);
        }
        let heard_of = self
            .peers
            .services_heard_of()
            .into_iter()
            .collect::<Vec<_>>()
            .join(",");
        if !heard_of.is_empty() {
            msg.set_parameter("heard_of", heard_of);
        }
        if !self.neighbors.is_empty() {
            msg.set_parameter("neighbors", self.neighbors.to_list());
        }
        msg
    }

    fn msg_connect(&mut self, sender: &mut Sender, msg: &Message, ctl: &mut Control) {
        if !matches!(sender.kind, SenderKind::PeerIn { .. }) {
            error!(target: "courier", "CONNECT is only accepted on the remote listener");
            return;
        }

        let refuse = |reason: Option<(&str, &str)>| {
            let mut reply = Message::new("REFUSE");
            if let Some((name, value)) = reason {
                reply.set_parameter(name, value);
            }
            reply
        };

        if self.shutting_down {
            sender.reply(&refuse(Some(("shutdown", "true"))));
            ctl.done(sender.id);
            return;
        }

        match msg.integer_parameter("version") {
            Ok(version) if version >= peers::MIN_PROTOCOL_VERSION => {}
            _ => {
                error!(target: "courier", "CONNECT with an incompatible version");
                sender.reply(&refuse(None));
                ctl.done(sender.id);
                return;
            }
        }

        let (Some(server_name), Some(his_address)) =
            (msg.parameter("server_name"), msg.parameter("my_address"))
        else {
            error!(target: "courier", "CONNECT requires \"server_name\" and \"my_address\"");
            sender.reply(&refuse(None));
            ctl.done(sender.id);
            return;
        };
        let server_name = server_name.to_string();

        if server_name == self.config.server_name {
            error!(target: "courier", "CONNECT from a peer claiming our own name {:?}", server_name);
            sender.reply(&refuse(Some(("conflict", "name"))));
            ctl.done(sender.id);
            return;
        }

        if self.links.len() >= self.config.max_connections {
            sender.reply(&refuse(Some(("busy", "true"))));
            ctl.done(sender.id);
            return;
        }

        let endpoint = match Endpoint::parse(his_address, 0) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                error!(target: "courier", "CONNECT with a bad my_address: {}", err);
                sender.reply(&refuse(None));
                ctl.done(sender.id);
                return;
            }
        };

        *sender.kind = SenderKind::PeerIn {
            endpoint: Some(endpoint.clone()),
            server_name: Some(server_name.clone()),
        };

        self.neighbors.add(vec![endpoint.clone()]);
        if let Some(neighbors) = msg.parameter("neighbors") {
            self.neighbors.add(NeighborList::parse_list(neighbors));
        }

        {
            let peer = self.peers.entry(&endpoint);

            peer.state = PeerState::Connected;
            peer.connection = Some(sender.id);
            peer.server_name = Some(server_name.clone());
            peer.services = split_list(msg.parameter("services"));
            peer.heard_of = split_list(msg.parameter("heard_of"));

            // The peer found us; no need to keep announcing ourselves.
            if let Some(gossip) = peer.gossip.take() {
                ctl.remove(gossip);
            }
        }
        self.peers.record_success(&endpoint);

        let mut accept = Message::new("ACCEPT");
        accept.set_parameter("server_name", &self.config.server_name);
        if let Some(advertised) = self.advertised() {
            accept.set_parameter("my_address", advertised);
        }
        let services = self.registry.to_list();
        if !services.is_empty() {
            accept.set_parameter("services", services);
        }
        let heard_of = self
            .peers
            .services_heard_of()
            .into_iter()
            .collect::<Vec<_>>()
            .join(",");
        if !heard_of.is_empty() {
            accept.set_parameter("heard_of", heard_of);
        }
        sender.reply(&accept);
        sender.reply(&Message::new("HELP"));

        info!(target: "courier", "Peer {} ({}) connected", server_name, endpoint);
        self.peer_established(&server_name, sender.id);
    }

    fn msg_accept(&mut self, sender: &mut Sender, msg: &Message, _ctl: &mut Control) {
        let SenderKind::PeerOut { endpoint } = sender.kind.clone() else {
            error!(target: "courier", "ACCEPT on a connection we did not initiate");
            return;
        };

        let server_name = msg.parameter("server_name").unwrap_or_default().to_string();

        {
            let peer = self.peers.entry(&endpoint);

            peer.state = PeerState::Connected;
            peer.connection = Some(sender.id);
            peer.server_name = Some(server_name.clone());
            peer.services = split_list(msg.parameter("services"));
            peer.heard_of = split_list(msg.parameter("heard_of"));
        }
        self.peers.record_success(&endpoint);

        sender.reply(&Message::new("HELP"));

        info!(target: "courier", "Peer {} ({}) accepted us", server_name, endpoint);
        self.peer_established(&server_name, sender.id);
    }

    fn msg_refuse(&mut self, sender: &mut Sender, msg: &Message, ctl: &mut Control) {
        let SenderKind::PeerOut { endpoint } = sender.kind.clone() else {
            return;
        };

        let busy = msg.parameter("busy").is_some();
        let shutdown = msg.parameter("shutdown").is_some();
        let park = peers::refuse_park(busy, shutdown);
        let now = ctl.now();

        warn!(
            target: "courier",
            "Peer {} refused us ({}); retrying in {}",
            endpoint,
            msg.parameters()
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
            park,
        );

        {
            let peer = self.peers.entry(&endpoint);

            peer.state = PeerState::Refused;
            peer.retry_at = Some(now + park);
            peer.connection = None;
        }
        self.links.remove(&sender.id);
        ctl.remove(sender.id);
    }

    fn msg_gossip(&mut self, sender: &mut Sender, msg: &Message, ctl: &mut Control) {
        let Some(his_address) = msg.parameter("my_address") else {
            error!(target: "courier", "GOSSIP without a \"my_address\" parameter");
            return;
        };
        let Ok(endpoint) = Endpoint::parse(his_address, 0) else {
            error!(target: "courier", "GOSSIP with a bad address {:?}", his_address);
            return;
        };

        sender.reply(&Message::new("RECEIVED"));
        self.neighbors.add(vec![endpoint.clone()]);

        // A gossiping peer orders below us, so the connection is ours to
        // make, unless one is already on its way.
        if let Some(advertised) = self.advertised() {
            if direction(&advertised, &endpoint) == Direction::Outbound {
                let needs_connect = {
                    let peer = self.peers.entry(&endpoint);

                    peer.connection.is_none() && peer.state != PeerState::ShuttingDown
                };
                if needs_connect {
                    self.connect_to_peer(&endpoint, ctl);
                }
            }
        }
    }

    fn msg_forget(&mut self, _sender: &mut Sender, msg: &Message, ctl: &mut Control) {
        let Some(ip) = msg.parameter("ip") else {
            error!(target: "courier", "FORGET requires an \"ip\" parameter");
            return;
        };
        let Ok(endpoint) = Endpoint::parse(ip, 0) else {
            return;
        };

        info!(target: "courier", "Forgetting neighbor {}", endpoint);
        self.neighbors.remove(&endpoint);

        if let Some(peer) = self.peers.remove(&endpoint) {
            if let Some(id) = peer.connection {
                ctl.remove(id);
            }
            if let Some(id) = peer.gossip {
                ctl.remove(id);
            }
        }
        self.cluster_reevaluate();
    }

    fn msg_peer_gone(&mut self, sender: &mut Sender, ctl: &mut Control, why: &str) {
        if let Some(endpoint) = sender.kind.peer_endpoint().cloned() {
            debug!(target: "courier", "Peer {}: {}", endpoint, why);

            if let Some(peer) = self.peers.get_mut(&endpoint) {
                peer.state = PeerState::ShuttingDown;
                peer.connection = None;
            }
        }
        ctl.done(sender.id);
        self.cluster_reevaluate();
    }

    fn msg_load_avg(&mut self, sender: &mut Sender, msg: &Message) {
        let endpoint = sender
            .kind
            .peer_endpoint()
            .cloned()
            .or_else(|| {
                msg.parameter("my_address")
                    .and_then(|a| Endpoint::parse(a, 0).ok())
            });
        let (Some(endpoint), Some(avg)) = (
            endpoint,
            msg.parameter("avg").and_then(|a| a.parse::<f64>().ok()),
        ) else {
            return;
        };

        self.peers.entry(&endpoint).load = Some(avg);
    }

    /// After a handshake completes: learn the vocabulary, tell local
    /// services, re-evaluate the cluster.
    fn peer_established(&mut self, server_name: &str, _id: ConnectionId) {
        let mut notice = Message::new("NEW_REMOTE_CONNECTION");

        notice.set_parameter("server_name", server_name);
        self.deliver_local_broadcast(&notice, None);
        self.cluster_reevaluate();
    }

    /// Create the outbound permanent connection to a smaller peer.
    fn connect_to_peer(&mut self, endpoint: &Endpoint, ctl: &mut Control) {
        let Some(addr) = endpoint.socket_addr() else {
            return;
        };
        let state = self.handle.upgrade().expect("daemon state is alive");
        let handler = PeerOutHandler {
            state,
            kind: SenderKind::PeerOut {
                endpoint: endpoint.clone(),
            },
            endpoint: endpoint.clone(),
        };
        let client = Rc::new(RefCell::new(PermanentClient::new(
            format!("peer connection: {}", endpoint),
            addr,
            Box::new(handler),
        )));

        let id = ctl.add(client.clone());
        let link: Rc<RefCell<dyn MessageConnection>> = client;

        self.register_link(id, &link);

        let peer = self.peers.entry(endpoint);
        peer.state = PeerState::Connecting;
        peer.connection = Some(id);
        peer.retry_at = None;

        debug!(target: "courier", "Connecting to peer {}", endpoint);
    }

    /// Create the gossip connection announcing us to a larger peer.
    fn gossip_to_peer(&mut self, endpoint: &Endpoint, ctl: &mut Control) {
        let Some(addr) = endpoint.socket_addr() else {
            return;
        };
        let Some(advertised) = self.advertised() else {
            return;
        };
        let handler = GossipHandler {
            state: self.handle.upgrade().expect("daemon state is alive"),
            endpoint: endpoint.clone(),
            my_address: advertised,
        };
        let client = Rc::new(RefCell::new(
            PermanentClient::new(
                format!("gossip to peer: {}", endpoint),
                addr,
                Box::new(handler),
            )
            .with_pause(Some(peers::GOSSIP_INITIAL_PAUSE))
            .with_max_pause(peers::GOSSIP_MAX_PAUSE),
        ));

        let id = ctl.add(client.clone());
        let link: Rc<RefCell<dyn MessageConnection>> = client;

        self.register_link(id, &link);
        self.peers.entry(endpoint).gossip = Some(id);

        debug!(target: "courier", "Gossiping to peer {}", endpoint);
    }

    /// Periodic upkeep: sweep caches, retry parked peers, make sure every
    /// neighbor has its connection or gossip channel.
    fn maintain(&mut self, ctl: &mut Control) {
        let now = ctl.now();

        self.cache.sweep(now);
        self.broadcasts.sweep(now);

        if self.shutting_down {
            return;
        }
        let Some(advertised) = self.advertised() else {
            // Not participating in a cluster.
            return;
        };

        let neighbors: Vec<Endpoint> = self.neighbors.iter().cloned().collect();
        for endpoint in neighbors {
            match direction(&advertised, &endpoint) {
                Direction::Same => {}
                Direction::Outbound => {
                    let needs_connect = {
                        let peer = self.peers.entry(&endpoint);

                        match peer.state {
                            PeerState::Connected | PeerState::Connecting => {
                                peer.connection.is_none()
                            }
                            PeerState::Refused => {
                                peer.retry_at.map_or(true, |at| at <= now)
                            }
                            PeerState::ShuttingDown => false,
                            PeerState::Down => true,
                        }
                    };
                    if needs_connect {
                        self.connect_to_peer(&endpoint, ctl);
                    }
                }
                Direction::Gossip => {
                    let needs_gossip = {
                        let peer = self.peers.entry(&endpoint);

                        !peer.is_connected() && peer.gossip.is_none()
                    };
                    if needs_gossip {
                        self.gossip_to_peer(&endpoint, ctl);
                    }
                }
            }
        }
    }

    fn cluster_reevaluate(&mut self) {
        let live = self.peers.live_count();
        let transitions = self.cluster.reevaluate(live, self.neighbors.len());

        for status in transitions {
            self.deliver_local_broadcast(&status, None);
        }
    }

    // Router //////////////////////////////////////////////////////////////

    /// Route a message that is not for the daemon itself.
    fn route(&mut self, sender: &mut Sender, msg: &Message, ctl: &mut Control) {
        let service = msg.service().to_string();
        let server = msg.server().to_string();
        let command = msg.command().to_string();

        // Broadcast destinations.
        if msg.is_broadcast() {
            self.route_broadcast(sender, msg, ctl);
            return;
        }

        // `*` addresses every server including us; `?` excludes whichever
        // daemon originated the message, so it only skips local delivery
        // when one of our own services sent it.
        let except_self = server == "?";
        let all_servers = server == "*" || except_self;
        let from_peer = matches!(
            sender.kind,
            SenderKind::PeerIn { .. } | SenderKind::PeerOut { .. }
        );
        let locally_addressed = server.is_empty()
            || server == "."
            || server == self.config.server_name
            || server == "*"
            || (except_self && from_peer);

        if locally_addressed {
            if let Some(registration) = self.registry.get(&service) {
                if !registration.understands(&command) {
                    debug!(
                        target: "courier",
                        "Service {:?} does not declare {:?}; forwarding anyway",
                        service,
                        command,
                    );
                }
                let id = registration.id;

                self.send_to(id, msg);
                if !all_servers {
                    return;
                }
            } else if !all_servers && (server == self.config.server_name || server == ".") {
                // Strictly ours and not registered: cache or fail.
                self.cache_or_fail(sender, msg, ctl.now());
                return;
            }
        }

        if self.shutting_down {
            return;
        }

        // A message for one specific foreign server.
        if !server.is_empty() && !all_servers && server != "." && server != self.config.server_name
        {
            let target = self
                .peers
                .find_by_server_name(&server)
                .and_then(|(_, peer)| peer.connection);

            match target {
                Some(id) => self.send_to(id, msg),
                None => {
                    debug!(target: "courier", "No connection to server {:?}", server);
                    self.cache_or_fail(sender, msg, ctl.now());
                }
            }
            return;
        }

        if all_servers {
            // Every server runs this service; peers get a copy each. A
            // copy received from a peer is not forwarded again: the
            // originator already addressed the whole cluster.
            if !from_peer {
                let targets: Vec<ConnectionId> = self
                    .peers
                    .connected()
                    .filter_map(|(_, peer)| peer.connection)
                    .filter(|id| *id != sender.id)
                    .collect();

                for id in targets {
                    self.send_to(id, msg);
                }
            }
            return;
        }

        // Server unspecified: find the best peer hosting (or having heard
        // of) the service.
        if let Some(endpoint) = self.peers.choose_host(&service).cloned() {
            if let Some(id) = self.peers.get(&endpoint).and_then(|peer| peer.connection) {
                self.send_to(id, msg);
                return;
            }
        }

        // Nobody knows it yet; maybe it registers here soon.
        self.cache_or_fail(sender, msg, ctl.now());
    }

    /// Deliver a broadcast locally and forward it across the cluster.
    fn route_broadcast(&mut self, sender: &mut Sender, msg: &Message, ctl: &mut Control) {
        let service = msg.service().to_string();
        let exclude_sender = service == "?";

        // Cluster-wide commands (SHUTDOWN, FORGET, ...) travel as
        // broadcasts; this daemon acts on them too.
        if DAEMON_COMMANDS.contains(&msg.command()) {
            self.daemon_command(sender, msg, ctl);
        }

        // Local delivery: every service understanding the command, once.
        let targets: Vec<ConnectionId> = self
            .registry
            .interested_in(msg.command())
            .map(|r| r.id)
            .filter(|id| !(exclude_sender && *id == sender.id))
            .collect();

        for id in targets {
            self.send_to(id, msg);
        }

        // "." stays on this daemon.
        if service == "." || self.shutting_down {
            return;
        }

        let hops = router::broadcast_hops(msg);
        if hops >= BROADCAST_HOP_LIMIT {
            debug!(target: "courier", "Not re-broadcasting {} (hop limit)", msg.command());
            return;
        }

        let informed = router::informed_neighbors(msg);
        let sender_endpoint = sender.kind.peer_endpoint().cloned();

        let targets: Vec<(Endpoint, ConnectionId)> = self
            .peers
            .connected()
            .filter(|(endpoint, _)| !informed.contains(&endpoint.to_string()))
            .filter(|(endpoint, _)| {
                // "?" skips the daemon the message came from; "*" includes
                // it.
                !(exclude_sender && sender_endpoint.as_ref() == Some(*endpoint))
            })
            .filter_map(|(endpoint, peer)| {
                peer.connection.map(|id| (endpoint.clone(), id))
            })
            .filter(|(_, id)| *id != sender.id)
            .collect();

        if targets.is_empty() {
            return;
        }

        let advertised = self.advertised().map(|a| a.to_string());
        let informed: Vec<String> = targets
            .iter()
            .map(|(endpoint, _)| endpoint.to_string())
            .chain(advertised)
            .collect();
        let forward = router::prepare_forward(
            msg,
            &mut self.broadcasts,
            &self.config.server_name,
            ctl.now(),
            informed,
        );

        for (_, id) in targets {
            self.send_to(id, &forward);
        }
    }

    /// Reload the service declarations from `services_dir`.
    fn load_known_services(&mut self) {
        let Ok(entries) = std::fs::read_dir(&self.config.services_dir) else {
            return;
        };

        self.known_services = entries
            .flatten()
            .filter_map(|entry| {
                entry
                    .path()
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
            })
            .collect();

        debug!(
            target: "courier",
            "{} declared service(s) in {}",
            self.known_services.len(),
            self.config.services_dir.display(),
        );
    }

    /// The destination service is not reachable: cache when allowed,
    /// otherwise drop and report per the sender's options.
    fn cache_or_fail(&mut self, sender: &mut Sender, msg: &Message, now: LocalTime) {
        if let Some(ttl) = cache_ttl(msg) {
            if !self.known_services.is_empty() && !self.known_services.contains(msg.service()) {
                debug!(
                    target: "courier",
                    "Caching for {:?}, which is not a declared service",
                    msg.service(),
                );
            }
            self.cache.cache(msg.clone(), ttl, now);
            return;
        }

        debug!(
            target: "courier",
            "Dropping {} for unavailable service {:?}",
            msg.command(),
            msg.service(),
        );

        if msg.parameter("transmission_report") == Some("failure") {
            let mut reply = Message::reply_to(msg);

            reply.set_command("SERVICE_UNAVAILABLE");
            reply.set_parameter("service", msg.service());
            reply.set_parameter("command", msg.command());
            sender.reply(&reply);
        }
    }

    // Lifecycle ///////////////////////////////////////////////////////////

    /// Orderly teardown: refuse new work, disconnect peers and services,
    /// drop the listeners, and let the reactor run dry.
    pub fn start_shutdown(&mut self, cluster_wide: bool, ctl: &mut Control) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        if self.outcome.is_none() {
            self.outcome = Some(Shutdown::Clean);
        }

        info!(
            target: "courier",
            "Shutting down{}",
            if cluster_wide { " (cluster-wide)" } else { "" },
        );

        // No more gossiping.
        let gossips: Vec<ConnectionId> = self
            .peers
            .iter_mut()
            .filter_map(|(_, peer)| peer.gossip.take())
            .collect();
        for id in gossips {
            ctl.remove(id);
        }

        // Tell the peers.
        let farewell = Message::new(if cluster_wide { "SHUTDOWN" } else { "DISCONNECT" });
        let peer_connections: Vec<ConnectionId> = self
            .peers
            .iter()
            .filter_map(|(_, peer)| peer.connection)
            .collect();

        for id in &peer_connections {
            self.send_to(*id, &farewell);
            ctl.done(*id);
        }
        for (_, peer) in self.peers.iter_mut() {
            peer.state = PeerState::ShuttingDown;
        }

        // Tell the services that asked, drain the rest.
        let services: Vec<(ConnectionId, bool)> = self
            .registry
            .iter()
            .map(|r| (r.id, r.understands("DISCONNECTING")))
            .collect();

        let mut handled: std::collections::HashSet<ConnectionId> = services
            .iter()
            .map(|(id, _)| *id)
            .chain(peer_connections)
            .collect();

        for (id, wants_notice) in services {
            if wants_notice {
                self.send_to(id, &Message::new("DISCONNECTING"));
            }
            ctl.done(id);
        }

        // Everything else still attached (unregistered clients, gossip
        // leftovers) drains and goes away too.
        handled.extend(self.core.iter().copied());
        let leftover: Vec<ConnectionId> = self
            .links
            .keys()
            .copied()
            .filter(|id| !handled.contains(id))
            .collect();

        for id in leftover {
            ctl.done(id);
        }

        // Listeners, the signal endpoint and timers go away immediately.
        for id in std::mem::take(&mut self.core) {
            ctl.remove(id);
        }
    }

    fn connection_lost(&mut self, id: ConnectionId, kind: &SenderKind, ctl: &mut Control) {
        self.links.remove(&id);

        match kind {
            SenderKind::Service {
                registered: Some(_),
            } => {
                if let Some(registration) = self.registry.unregister_connection(id) {
                    self.send_status(&registration.name, false, ctl.now(), id);
                }
            }
            kind => {
                let Some(endpoint) = kind.peer_endpoint().cloned() else {
                    return;
                };
                let Some(peer) = self.peers.get_mut(&endpoint) else {
                    return;
                };
                if peer.connection != Some(id) {
                    return;
                }

                peer.connection = None;
                if peer.state == PeerState::Connected {
                    peer.state = PeerState::Down;

                    let server_name = peer.server_name.clone().unwrap_or_default();
                    let mut notice = Message::new("HANGUP");

                    notice.set_parameter("server_name", server_name);
                    self.deliver_local_broadcast(&notice, Some(id));
                }
                self.cluster_reevaluate();
            }
        }
    }

    fn peer_connect_failed(&mut self, endpoint: &Endpoint, now: LocalTime) {
        self.peers.record_failure(endpoint, now);
    }

    /// Send a message to every local service whose vocabulary includes it.
    fn deliver_local_broadcast(&mut self, msg: &Message, exclude: Option<ConnectionId>) {
        let targets: Vec<ConnectionId> = self
            .registry
            .interested_in(msg.command())
            .map(|r| r.id)
            .filter(|id| Some(*id) != exclude)
            .collect();

        for id in targets {
            self.send_to(id, msg);
        }
    }

    /// Sample and distribute the load average to whoever asked.
    fn distribute_loadavg(&mut self) {
        let local: Vec<ConnectionId> = self
            .registry
            .iter()
            .filter(|r| r.wants_loadavg)
            .map(|r| r.id)
            .collect();
        let remote: Vec<ConnectionId> = self
            .loadavg
            .remote_listeners()
            .filter_map(|endpoint| self.peers.get(endpoint))
            .filter_map(|peer| peer.connection)
            .collect();

        if local.is_empty() && remote.is_empty() {
            return;
        }
        let Some(avg) = loadavg::sample() else {
            return;
        };

        let mut msg = Message::new("LOAD_AVG");

        msg.set_parameter("avg", avg);
        if let Some(advertised) = self.advertised() {
            msg.set_parameter("my_address", advertised);
        }
        msg.set_parameter("timestamp", timespec_now());

        for id in local.into_iter().chain(remote) {
            self.send_to(id, &msg);
        }
    }
}

fn split_list(list: Option<&str>) -> std::collections::BTreeSet<String> {
    list.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

// Connection handlers /////////////////////////////////////////////////////

/// Handler shared by accepted stream connections: local services and
/// inbound peers.
struct Link {
    state: Rc<RefCell<State>>,
    kind: SenderKind,
}

impl Link {
    fn service(state: Rc<RefCell<State>>) -> Self {
        Self {
            state,
            kind: SenderKind::Service { registered: None },
        }
    }

    fn peer_in(state: Rc<RefCell<State>>) -> Self {
        Self {
            state,
            kind: SenderKind::PeerIn {
                endpoint: None,
                server_name: None,
            },
        }
    }
}

impl MessageHandler for Link {
    fn process_message(&mut self, sink: &mut dyn MessageSink, msg: &Message, ctl: &mut Control) {
        let state = self.state.clone();
        let mut state = state.borrow_mut();
        let id = ctl.connection_id();

        state.process(
            &mut Sender {
                id,
                kind: &mut self.kind,
                sink: &mut *sink,
            },
            msg,
            ctl,
        );

        for deferred in state.take_deferred(id) {
            sink.send_message(&deferred).ok();
        }
    }

    fn disconnected(&mut self, ctl: &mut Control) {
        let state = self.state.clone();

        state
            .borrow_mut()
            .connection_lost(ctl.connection_id(), &self.kind, ctl);
    }
}

/// Handler of the outbound permanent connection to a smaller peer.
struct PeerOutHandler {
    state: Rc<RefCell<State>>,
    kind: SenderKind,
    endpoint: Endpoint,
}

impl MessageHandler for PeerOutHandler {
    fn process_message(&mut self, sink: &mut dyn MessageSink, msg: &Message, ctl: &mut Control) {
        let state = self.state.clone();
        let mut state = state.borrow_mut();
        let id = ctl.connection_id();

        state.process(
            &mut Sender {
                id,
                kind: &mut self.kind,
                sink: &mut *sink,
            },
            msg,
            ctl,
        );

        for deferred in state.take_deferred(id) {
            sink.send_message(&deferred).ok();
        }
    }

    fn connected(&mut self, sink: &mut dyn MessageSink, _ctl: &mut Control) {
        let state = self.state.clone();
        let connect = state.borrow().connect_message();

        if sink.send_message(&connect).is_ok() {
            debug!(target: "courier", "Sent CONNECT to {}", self.endpoint);
        }
    }

    fn connect_failed(&mut self, ctl: &mut Control) {
        let state = self.state.clone();

        state
            .borrow_mut()
            .peer_connect_failed(&self.endpoint, ctl.now());
    }

    fn disconnected(&mut self, ctl: &mut Control) {
        let state = self.state.clone();

        state
            .borrow_mut()
            .connection_lost(ctl.connection_id(), &self.kind, ctl);
    }
}

/// Handler of the gossip connection to a larger peer: announce ourselves
/// until a `RECEIVED` (or an inbound CONNECT) tells us to stop.
struct GossipHandler {
    state: Rc<RefCell<State>>,
    endpoint: Endpoint,
    my_address: Endpoint,
}

impl MessageHandler for GossipHandler {
    fn process_message(&mut self, _sink: &mut dyn MessageSink, msg: &Message, ctl: &mut Control) {
        if msg.command() == "RECEIVED" {
            debug!(target: "courier", "Peer {} heard our gossip", self.endpoint);

            let state = self.state.clone();
            let mut state = state.borrow_mut();

            if let Some(peer) = state.peers.get_mut(&self.endpoint) {
                peer.gossip = None;
            }
            state.links.remove(&ctl.connection_id());
            ctl.remove_self();
        }
    }

    fn connected(&mut self, sink: &mut dyn MessageSink, _ctl: &mut Control) {
        let mut gossip = Message::new("GOSSIP");

        gossip.set_parameter("my_address", &self.my_address);
        sink.send_message(&gossip).ok();
    }

    fn disconnected(&mut self, _ctl: &mut Control) {}
}

// Server //////////////////////////////////////////////////////////////////

/// The daemon process: a reactor wired with listeners, the signal
/// endpoints and the shared [`State`].
pub struct Server {
    state: Rc<RefCell<State>>,
    reactor: Reactor,
}

impl Server {
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        Self::build(config, true)
    }

    /// Build without the signalfd interrupt; tests run many daemons in
    /// one process and must not fight over the signal mask.
    pub fn without_signals(config: Config) -> Result<Self, DaemonError> {
        Self::build(config, false)
    }

    fn build(config: Config, with_signals: bool) -> Result<Self, DaemonError> {
        config.validate()?;

        let mut reactor = Reactor::new()?;
        let state = Rc::new(RefCell::new(State::new(config)));

        state.borrow_mut().handle = Rc::downgrade(&state);

        let config = state.borrow().config.clone();

        info!(
            target: "courier",
            "Daemon {:?} starting on {}",
            config.server_name,
            config.local_listen,
        );

        // Local services connect here.
        let st = state.clone();
        let local = TcpServer::bind(
            "local listener",
            config
                .local_listen
                .socket_addr()
                .expect("validated as a TCP endpoint"),
            config.max_pending_connections,
            Box::new(move |stream, addr, ctl| {
                accept_stream(&st, format!("service connection: {}", addr), stream, true, ctl);
            }),
        )?;
        let bound = local.local_addr()?;
        let id = reactor.add(Rc::new(RefCell::new(local)))?;
        {
            let mut state = state.borrow_mut();

            state.bound_local = Some(bound);
            state.core.push(id);
        }

        // Peer daemons connect here.
        if let Some(remote_listen) = &config.remote_listen {
            let st = state.clone();
            let remote = TcpServer::bind(
                "remote listener",
                remote_listen.socket_addr().expect("validated"),
                config.max_pending_connections,
                Box::new(move |stream, addr, ctl| {
                    accept_stream(&st, format!("peer connection: {}", addr), stream, false, ctl);
                }),
            )?;
            let id = reactor.add(Rc::new(RefCell::new(remote)))?;
            state.borrow_mut().core.push(id);
        }

        // Local services may prefer a Unix socket.
        if let Some(unix_listen) = config.unix_listen.clone() {
            let st = state.clone();
            let unix = UnixServer::bind(
                "unix listener",
                &unix_listen,
                Box::new(move |stream, ctl| {
                    accept_stream(&st, "service connection: unix".to_string(), stream, true, ctl);
                }),
            )?;
            let id = reactor.add(Rc::new(RefCell::new(unix)))?;
            state.borrow_mut().core.push(id);
        }

        // Datagram pings (LOG_ROTATE, STOP and friends).
        if let Some(signal_endpoint) = &config.signal {
            let st = state.clone();
            let udp = DgramServer::bind(
                "signal endpoint",
                signal_endpoint,
                config.signal_secret.clone(),
                Box::new(move |msg, ctl| {
                    let state = st.clone();
                    let mut state = state.borrow_mut();
                    let mut kind = SenderKind::Udp;
                    let mut sink = NullSink;

                    state.process(
                        &mut Sender {
                            id: ctl.connection_id(),
                            kind: &mut kind,
                            sink: &mut sink,
                        },
                        &msg,
                        ctl,
                    );
                }),
            )?;
            let id = reactor.add(Rc::new(RefCell::new(udp)))?;
            state.borrow_mut().core.push(id);
        }

        // SIGINT/SIGTERM tear the daemon down like a STOP.
        if with_signals {
            let st = state.clone();
            let interrupt = SignalConnection::new(
                "interrupt",
                &[Signal::SIGINT, Signal::SIGTERM],
                Box::new(move |signal, ctl| {
                    info!(target: "courier", "Received {}, stopping", signal);
                    st.borrow_mut().start_shutdown(false, ctl);
                }),
            )?;
            let id = reactor.add(Rc::new(RefCell::new(interrupt)))?;
            state.borrow_mut().core.push(id);
        }

        // Periodic upkeep, plus an immediate first run so peer
        // connections come up without waiting a full period.
        let st = state.clone();
        let maintenance = Timer::repeating(
            "maintenance",
            MAINTENANCE_PERIOD,
            Box::new(move |ctl| st.borrow_mut().maintain(ctl)),
        );
        let id = reactor.add(Rc::new(RefCell::new(maintenance)))?;
        state.borrow_mut().core.push(id);

        let st = state.clone();
        let bootstrap = Timer::once(
            "peer bootstrap",
            LocalTime::now(),
            Box::new(move |ctl| {
                st.borrow_mut().maintain(ctl);
                ctl.remove_self();
            }),
        );
        let id = reactor.add(Rc::new(RefCell::new(bootstrap)))?;
        state.borrow_mut().core.push(id);

        let st = state.clone();
        let loadavg_timer = Timer::repeating(
            "loadavg",
            LocalDuration::from_secs(LOADAVG_PERIOD_SECS),
            Box::new(move |_ctl| st.borrow_mut().distribute_loadavg()),
        );
        let id = reactor.add(Rc::new(RefCell::new(loadavg_timer)))?;
        state.borrow_mut().core.push(id);

        // Service declarations; kept current while the daemon runs.
        state.borrow_mut().load_known_services();
        if config.services_dir.is_dir() {
            use nix::sys::inotify::AddWatchFlags;

            let st = state.clone();
            let mut watcher = FileWatcher::new(
                "services watch",
                Box::new(move |_path, _mask, _ctl| st.borrow_mut().load_known_services()),
            )?;
            watcher.watch(
                config.services_dir.clone(),
                AddWatchFlags::IN_CREATE
                    | AddWatchFlags::IN_DELETE
                    | AddWatchFlags::IN_MOVED_TO
                    | AddWatchFlags::IN_MOVED_FROM,
            )?;
            let id = reactor.add(Rc::new(RefCell::new(watcher)))?;
            state.borrow_mut().core.push(id);
        }

        // Starting state of the cluster (usually DOWN until peers come
        // up); also persists the initial status file.
        state.borrow_mut().cluster_reevaluate();

        Ok(Self { state, reactor })
    }

    /// The shared daemon state.
    pub fn state(&self) -> Rc<RefCell<State>> {
        self.state.clone()
    }

    /// The actual local listener address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.borrow().bound_local
    }

    /// One reactor iteration; testing.
    pub fn poll(&mut self, timeout: LocalDuration) -> Result<(), DaemonError> {
        self.reactor.poll(timeout)?;
        Ok(())
    }

    /// Run until stopped.
    pub async fn run(
        mut self,
        cancellation: tokio_util::sync::CancellationToken,
    ) -> Result<Shutdown, DaemonError> {
        self.reactor.run(cancellation).await?;

        let outcome = self.state.borrow_mut().outcome.take();
        Ok(outcome.unwrap_or(Shutdown::Clean))
    }
}

/// Wrap an accepted stream into a message connection driven by a
/// [`Link`] handler.
fn accept_stream<R: StreamIo + 'static>(
    state: &Rc<RefCell<State>>,
    name: String,
    raw: R,
    local: bool,
    ctl: &mut Control,
) {
    {
        let state = state.borrow();

        if state.links.len() >= state.config.max_connections {
            warn!(target: "courier", "Too many connections; dropping {}", name);
            return;
        }
    }

    let handler = if local {
        Link::service(state.clone())
    } else {
        Link::peer_in(state.clone())
    };
    let mut stream = MessageStream::new(name, raw, Box::new(handler));

    stream.set_output_cap(state.borrow().config.output_buffer_cap);

    let conn = Rc::new(RefCell::new(stream));
    let id = ctl.add(conn.clone());
    let link: Rc<RefCell<dyn MessageConnection>> = conn;

    state.borrow_mut().register_link(id, &link);
}

/// Reply channel of the datagram endpoint: there is none.
struct NullSink;

impl MessageSink for NullSink {
    fn send_message(&mut self, msg: &Message) -> Result<(), courier_net::Error> {
        debug!(target: "courier", "No reply channel for {}", msg.command());
        Ok(())
    }
}
