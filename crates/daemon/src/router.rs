//! Broadcast bookkeeping for the message router.
use std::collections::{BTreeSet, HashMap};

use courier_net::time::{LocalDuration, LocalTime};
use courier_types::Message;

/// Messages are not re-broadcast to remote peers once they travelled
/// this many hops; local delivery still happens.
pub const BROADCAST_HOP_LIMIT: i64 = 5;

/// Lifetime of a broadcast when the sender did not set one.
pub const BROADCAST_DEFAULT_TIMEOUT: LocalDuration = LocalDuration::from_secs(10);

/// De-duplication table for broadcast messages.
///
/// Every broadcast carries a `broadcast_msgid` (`<server_name>-<seq>`);
/// a message whose id was already seen, or whose timeout passed, is
/// dropped instead of delivered or forwarded again.
#[derive(Default)]
pub struct BroadcastTable {
    seen: HashMap<String, LocalTime>,
    serial: u64,
}

impl BroadcastTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check an inbound message against the table, recording it. Returns
    /// false when the message must be dropped.
    pub fn check(&mut self, msg: &Message, now: LocalTime) -> bool {
        let Some(msgid) = msg.parameter("broadcast_msgid") else {
            return true;
        };

        let timeout = match msg.integer_parameter("broadcast_timeout") {
            Ok(secs) if secs >= 0 => LocalTime::from_secs(secs as u64),
            _ => now + BROADCAST_DEFAULT_TIMEOUT,
        };
        if timeout < now {
            return false;
        }
        if self.seen.contains_key(msgid) {
            return false;
        }

        self.seen.insert(msgid.to_string(), timeout);
        true
    }

    /// Drop expired entries.
    pub fn sweep(&mut self, now: LocalTime) {
        self.seen.retain(|_, timeout| *timeout >= now);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// The next broadcast id originated by this daemon.
    pub fn next_msgid(&mut self, server_name: &str) -> String {
        self.serial += 1;
        format!("{}-{}", server_name, self.serial)
    }
}

/// The endpoints already informed of a broadcast.
pub fn informed_neighbors(msg: &Message) -> BTreeSet<String> {
    msg.parameter("broadcast_informed_neighbors")
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Hops this broadcast already travelled.
pub fn broadcast_hops(msg: &Message) -> i64 {
    msg.integer_parameter("broadcast_hops").unwrap_or(0)
}

/// Prepare a broadcast for forwarding to peers: stamp the id, originator
/// and timeout when we are the origin, increment the hop count, and
/// extend the informed list with `adding`.
pub fn prepare_forward(
    msg: &Message,
    table: &mut BroadcastTable,
    server_name: &str,
    now: LocalTime,
    adding: impl IntoIterator<Item = String>,
) -> Message {
    let mut forward = msg.clone();

    if !forward.has_parameter("broadcast_msgid") {
        let msgid = table.next_msgid(server_name);

        // Record our own broadcast so an echo cannot come back to us.
        forward.set_parameter("broadcast_msgid", &msgid);
        table
            .seen
            .insert(msgid, now + BROADCAST_DEFAULT_TIMEOUT);
    }
    if !forward.has_parameter("broadcast_originator") {
        forward.set_parameter("broadcast_originator", server_name);
    }
    if !forward.has_parameter("broadcast_timeout") {
        forward.set_parameter(
            "broadcast_timeout",
            (now + BROADCAST_DEFAULT_TIMEOUT).as_secs(),
        );
    }
    forward.set_parameter("broadcast_hops", broadcast_hops(msg) + 1);

    let mut informed = informed_neighbors(msg);
    informed.extend(adding);
    forward.set_parameter(
        "broadcast_informed_neighbors",
        informed.into_iter().collect::<Vec<_>>().join(","),
    );

    forward
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_by_msgid() {
        let mut table = BroadcastTable::new();
        let now = LocalTime::from_secs(1000);

        let mut msg = Message::new("EVENT");
        assert!(table.check(&msg, now)); // no msgid: always passes

        msg.set_parameter("broadcast_msgid", "alpha-1");
        assert!(table.check(&msg, now));
        assert!(!table.check(&msg, now));
    }

    #[test]
    fn test_expired_broadcast_dropped() {
        let mut table = BroadcastTable::new();
        let now = LocalTime::from_secs(1000);

        let mut msg = Message::new("EVENT");
        msg.set_parameter("broadcast_msgid", "alpha-2");
        msg.set_parameter("broadcast_timeout", 999);
        assert!(!table.check(&msg, now));
    }

    #[test]
    fn test_sweep() {
        let mut table = BroadcastTable::new();
        let now = LocalTime::from_secs(1000);

        let mut msg = Message::new("EVENT");
        msg.set_parameter("broadcast_msgid", "alpha-3");
        msg.set_parameter("broadcast_timeout", 1001);
        table.check(&msg, now);
        assert_eq!(table.len(), 1);

        table.sweep(LocalTime::from_secs(1002));
        assert!(table.is_empty());
    }

    #[test]
    fn test_msgid_serial() {
        let mut table = BroadcastTable::new();

        assert_eq!(table.next_msgid("alpha"), "alpha-1");
        assert_eq!(table.next_msgid("alpha"), "alpha-2");
    }

    #[test]
    fn test_prepare_forward_stamps_origin() {
        let mut table = BroadcastTable::new();
        let now = LocalTime::from_secs(1000);

        let mut msg = Message::new("EVENT");
        msg.set_service("*");

        let forward = prepare_forward(
            &msg,
            &mut table,
            "alpha",
            now,
            vec!["10.0.0.2:4040".to_string()],
        );

        assert_eq!(forward.parameter("broadcast_msgid"), Some("alpha-1"));
        assert_eq!(forward.parameter("broadcast_originator"), Some("alpha"));
        assert_eq!(forward.integer_parameter("broadcast_hops").unwrap(), 1);
        assert_eq!(
            forward.parameter("broadcast_informed_neighbors"),
            Some("10.0.0.2:4040")
        );
        assert_eq!(forward.integer_parameter("broadcast_timeout").unwrap(), 1010);

        // Our own id is recorded: an echo is dropped.
        assert!(!table.check(&forward, now));
    }

    #[test]
    fn test_prepare_forward_extends_informed() {
        let mut table = BroadcastTable::new();
        let now = LocalTime::from_secs(1000);

        let mut msg = Message::new("EVENT");
        msg.set_service("*");
        msg.set_parameter("broadcast_msgid", "beta-7");
        msg.set_parameter("broadcast_hops", 2);
        msg.set_parameter("broadcast_informed_neighbors", "10.0.0.1:1,10.0.0.2:1");

        let forward = prepare_forward(
            &msg,
            &mut table,
            "alpha",
            now,
            vec!["10.0.0.3:1".to_string()],
        );

        assert_eq!(forward.parameter("broadcast_msgid"), Some("beta-7"));
        assert_eq!(forward.integer_parameter("broadcast_hops").unwrap(), 3);

        let informed = informed_neighbors(&forward);
        assert!(informed.contains("10.0.0.1:1"));
        assert!(informed.contains("10.0.0.3:1"));
    }
}
