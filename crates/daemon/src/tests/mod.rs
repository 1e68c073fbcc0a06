//! Daemon end-to-end tests: real listeners, real clients, one reactor
//! iteration at a time.
use std::cell::RefCell;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;

use courier_net::time::LocalDuration;
use courier_net::{ConnectionId, Reactor, Timer};
use courier_types::{Endpoint, Message};

use crate::config::Config;
use crate::server::{Server, Shutdown};

/// Hand out real reactor ids for table tests.
pub(crate) fn connection_ids(count: usize) -> Vec<ConnectionId> {
    let mut reactor = Reactor::new().unwrap();

    (0..count)
        .map(|_| {
            let timer = Timer::repeating(
                "test",
                LocalDuration::from_mins(60),
                Box::new(|_ctl| {}),
            );
            reactor.add(Rc::new(RefCell::new(timer))).unwrap()
        })
        .collect()
}

/// A TCP port the OS considers free right now.
fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn test_config(dir: &std::path::Path, server_name: &str) -> Config {
    let mut config = Config::new(Endpoint::parse("127.0.0.1:0", 0).unwrap());

    config.server_name = server_name.to_string();
    config.data_path = dir.to_path_buf();
    config
}

/// A test client: a blocking stream with line-based helpers.
struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    fn connect(server: &Server) -> Self {
        let addr = server.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();

        stream
            .set_read_timeout(Some(std::time::Duration::from_millis(20)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());

        Self { stream, reader }
    }

    fn send(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).unwrap();
        self.stream.write_all(b"\n").unwrap();
    }

    fn send_message(&mut self, msg: &Message) {
        self.send(&msg.to_text().unwrap());
    }

    /// Read one message, polling the server while we wait. A line may
    /// arrive in pieces; keep accumulating until the terminator shows up.
    fn recv(&mut self, server: &mut Server) -> Message {
        let mut line = String::new();

        for _ in 0..100 {
            server.poll(LocalDuration::from_millis(10)).unwrap();

            match self.reader.read_line(&mut line) {
                Ok(0) => panic!("server closed the connection"),
                Ok(_) if line.ends_with('\n') => return Message::parse(&line).unwrap(),
                Ok(_) => {}
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => panic!("read error: {e}"),
            }
        }
        panic!("no message from server");
    }
}

fn settle(server: &mut Server, iterations: usize) {
    for _ in 0..iterations {
        server.poll(LocalDuration::from_millis(10)).unwrap();
    }
}

#[test]
fn test_help_lists_daemon_commands() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::without_signals(test_config(dir.path(), "alpha")).unwrap();
    let mut client = Client::connect(&server);

    client.send("HELP");
    let reply = client.recv(&mut server);

    assert_eq!(reply.command(), "COMMANDS");
    let list = reply.parameter("list").unwrap();
    assert!(list.contains("REGISTER"));
    assert!(list.contains("CONNECT"));
    assert!(list.contains("CLUSTER_STATUS"));
}

#[test]
fn test_alive_echoes_serial() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::without_signals(test_config(dir.path(), "alpha")).unwrap();
    let mut client = Client::connect(&server);

    client.send("ALIVE serial=77");
    let reply = client.recv(&mut server);

    assert_eq!(reply.command(), "ABSOLUTELY");
    assert_eq!(reply.parameter("serial"), Some("77"));
    assert!(reply.has_parameter("reply_timestamp"));
}

#[test]
fn test_unknown_command_answered() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::without_signals(test_config(dir.path(), "alpha")).unwrap();
    let mut client = Client::connect(&server);

    client.send("FLY_TO_THE_MOON");
    let reply = client.recv(&mut server);

    assert_eq!(reply.command(), "UNKNOWN");
    assert_eq!(reply.parameter("command"), Some("FLY_TO_THE_MOON"));
}

#[test]
fn test_register_ready_and_cache_flush() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::without_signals(test_config(dir.path(), "alpha")).unwrap();

    // A message for service "blackbox" arrives before it registers, with
    // caching allowed.
    let mut sender = Client::connect(&server);
    let mut event = Message::new("EVENT");
    event.set_service("blackbox");
    event.set_parameter("param1", "hello");
    event.set_parameter("cache", "ttl=10");
    sender.send_message(&event);
    settle(&mut server, 5);
    assert_eq!(server.state().borrow().cache.len(), 1);

    // The service registers and gets HELP, READY, then the cached event.
    let mut service = Client::connect(&server);
    service.send("REGISTER service=blackbox;version=1");

    let help = service.recv(&mut server);
    assert_eq!(help.command(), "HELP");

    let ready = service.recv(&mut server);
    assert_eq!(ready.command(), "READY");
    assert!(ready.has_parameter("my_address"));

    let flushed = service.recv(&mut server);
    assert_eq!(flushed.command(), "EVENT");
    assert_eq!(flushed.parameter("param1"), Some("hello"));
    assert!(server.state().borrow().cache.is_empty());
}

#[test]
fn test_route_between_local_services() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::without_signals(test_config(dir.path(), "alpha")).unwrap();

    let mut receiver = Client::connect(&server);
    receiver.send("REGISTER service=receiver;version=1");
    receiver.recv(&mut server); // HELP
    receiver.recv(&mut server); // READY
    receiver.send("COMMANDS list=PING,DISCONNECTING");
    settle(&mut server, 5);

    let mut sender = Client::connect(&server);
    sender.send("REGISTER service=sender;version=1");
    sender.recv(&mut server); // HELP
    sender.recv(&mut server); // READY

    sender.send("receiver/PING count=3");
    let ping = receiver.recv(&mut server);

    assert_eq!(ping.command(), "PING");
    assert_eq!(ping.parameter("count"), Some("3"));
    // The daemon stamped the origin on the way through.
    assert_eq!(ping.sent_from_server(), "alpha");
    assert_eq!(ping.sent_from_service(), "sender");
}

#[test]
fn test_duplicate_registration_refused() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::without_signals(test_config(dir.path(), "alpha")).unwrap();

    let mut first = Client::connect(&server);
    first.send("REGISTER service=unique;version=1");
    first.recv(&mut server); // HELP

    let mut second = Client::connect(&server);
    second.send("REGISTER service=unique;version=1");
    settle(&mut server, 10);

    assert_eq!(server.state().borrow().registry.len(), 1);
}

#[test]
fn test_unavailable_service_reports_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::without_signals(test_config(dir.path(), "alpha")).unwrap();
    let mut client = Client::connect(&server);

    let mut msg = Message::new("ORDER");
    msg.set_service("nowhere");
    msg.set_parameter("cache", "no");
    msg.set_parameter("transmission_report", "failure");
    client.send_message(&msg);

    let report = client.recv(&mut server);
    assert_eq!(report.command(), "SERVICE_UNAVAILABLE");
    assert_eq!(report.parameter("service"), Some("nowhere"));
    assert_eq!(report.parameter("command"), Some("ORDER"));
    assert!(server.state().borrow().cache.is_empty());
}

#[test]
fn test_stop_cascade() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::without_signals(test_config(dir.path(), "alpha")).unwrap();

    let mut service = Client::connect(&server);
    service.send("REGISTER service=steady;version=1");
    service.recv(&mut server); // HELP
    service.recv(&mut server); // READY
    service.send("COMMANDS list=DISCONNECTING");
    settle(&mut server, 5);

    let mut admin = Client::connect(&server);
    admin.send("STOP");

    // The service supporting DISCONNECTING is told before its connection
    // goes away.
    let notice = service.recv(&mut server);
    assert_eq!(notice.command(), "DISCONNECTING");
    assert!(server.state().borrow().is_shutting_down());

    // New registrations are rejected while shutting down.
    settle(&mut server, 20);
}

#[test]
fn test_cluster_of_two_forms() {
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();

    let port1 = free_port();
    let port2 = free_port();
    let remote1 = Endpoint::parse(&format!("127.0.0.1:{port1}"), 0).unwrap();
    let remote2 = Endpoint::parse(&format!("127.0.0.1:{port2}"), 0).unwrap();

    let mut config1 = test_config(dir1.path(), "alpha");
    config1.remote_listen = Some(remote1.clone());
    config1.my_address = Some(remote1.clone());
    config1.neighbors = vec![remote2.clone()];

    let mut config2 = test_config(dir2.path(), "beta");
    config2.remote_listen = Some(remote2.clone());
    config2.my_address = Some(remote2.clone());
    config2.neighbors = vec![remote1.clone()];

    let mut d1 = Server::without_signals(config1).unwrap();
    let mut d2 = Server::without_signals(config2).unwrap();

    // Let both daemons discover each other: one dials, the other may
    // gossip first, but the handshake converges either way.
    for _ in 0..200 {
        d1.poll(LocalDuration::from_millis(5)).unwrap();
        d2.poll(LocalDuration::from_millis(5)).unwrap();

        if d1.state().borrow().peers.live_count() == 1
            && d2.state().borrow().peers.live_count() == 1
        {
            break;
        }
    }

    assert_eq!(d1.state().borrow().peers.live_count(), 1);
    assert_eq!(d2.state().borrow().peers.live_count(), 1);

    // Each learned the other's name.
    assert!(d1
        .state()
        .borrow()
        .peers
        .find_by_server_name("beta")
        .is_some());
    assert!(d2
        .state()
        .borrow()
        .peers
        .find_by_server_name("alpha")
        .is_some());

    // With one live connection out of one known neighbor, the cluster is
    // both up and complete on each side.
    use crate::cluster::{Completeness, Quorum};
    assert_eq!(d1.state().borrow().cluster.quorum(), Some(Quorum::Up));
    assert_eq!(
        d1.state().borrow().cluster.completeness(),
        Some(Completeness::Complete)
    );
    assert_eq!(d2.state().borrow().cluster.quorum(), Some(Quorum::Up));
}

#[tokio::test]
async fn test_run_returns_clean_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::without_signals(test_config(dir.path(), "alpha")).unwrap();
    let addr = server.local_addr().unwrap();

    let handle = tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        stream.write_all(b"STOP\n").unwrap();
        stream.flush().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
    });

    let cancellation = tokio_util::sync::CancellationToken::new();
    let outcome = server.run(cancellation).await.unwrap();

    assert_eq!(outcome, Shutdown::Clean);
    handle.await.unwrap();
}
