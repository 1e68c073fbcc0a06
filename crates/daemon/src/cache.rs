//! Cache for messages whose destination service is not registered yet.
use std::collections::HashMap;
use std::collections::VecDeque;

use tracing::debug;

use courier_net::time::LocalTime;
use courier_types::Message;

/// Longest a message may ask to be cached, in seconds.
const MAX_CACHE_TTL: i64 = 3600;

struct Entry {
    deadline: LocalTime,
    msg: Message,
}

/// Per-service FIFO of messages waiting for a registration.
///
/// Entries whose deadline passed are dropped on the next sweep or flush.
#[derive(Default)]
pub struct MessageCache {
    by_service: HashMap<String, VecDeque<Entry>>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached messages across all services.
    pub fn len(&self) -> usize {
        self.by_service.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep a message for `ttl_secs` seconds.
    pub fn cache(&mut self, msg: Message, ttl_secs: i64, now: LocalTime) {
        let ttl_secs = ttl_secs.clamp(1, MAX_CACHE_TTL) as u64;
        let deadline = now + courier_net::LocalDuration::from_secs(ttl_secs);

        debug!(
            target: "courier",
            "Caching {} for service {:?} ({}s)",
            msg.command(),
            msg.service(),
            ttl_secs,
        );
        self.by_service
            .entry(msg.service().to_string())
            .or_default()
            .push_back(Entry { deadline, msg });
    }

    /// Drop expired entries.
    pub fn sweep(&mut self, now: LocalTime) {
        for entries in self.by_service.values_mut() {
            entries.retain(|entry| entry.deadline > now);
        }
        self.by_service.retain(|_, entries| !entries.is_empty());
    }

    /// Take the pending messages for a newly-registered service, in FIFO
    /// order, dropping the expired ones.
    pub fn take(&mut self, service: &str, now: LocalTime) -> Vec<Message> {
        let Some(entries) = self.by_service.remove(service) else {
            return Vec::new();
        };

        entries
            .into_iter()
            .filter(|entry| entry.deadline > now)
            .map(|entry| entry.msg)
            .collect()
    }
}

/// Parse the `cache` parameter of a message: `no` disables caching,
/// `ttl=<seconds>` (or a bare number of seconds) bounds it.
pub fn cache_ttl(msg: &Message) -> Option<i64> {
    let value = msg.parameter("cache")?;

    for field in value.split(';') {
        let field = field.trim();

        if field == "no" {
            return None;
        }
        let number = field.strip_prefix("ttl=").unwrap_or(field);
        if let Ok(ttl) = number.parse::<i64>() {
            if ttl > 0 {
                return Some(ttl);
            }
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_net::LocalDuration;

    fn msg(service: &str, command: &str) -> Message {
        let mut m = Message::new(command);
        m.set_service(service);
        m
    }

    #[test]
    fn test_fifo_per_service() {
        let mut cache = MessageCache::new();
        let now = LocalTime::from_secs(1000);

        cache.cache(msg("a", "ONE"), 10, now);
        cache.cache(msg("b", "OTHER"), 10, now);
        cache.cache(msg("a", "TWO"), 10, now);
        assert_eq!(cache.len(), 3);

        let taken = cache.take("a", now);
        let commands: Vec<_> = taken.iter().map(|m| m.command()).collect();
        assert_eq!(commands, vec!["ONE", "TWO"]);
        assert_eq!(cache.len(), 1);

        // A second take finds nothing.
        assert!(cache.take("a", now).is_empty());
    }

    #[test]
    fn test_expiry() {
        let mut cache = MessageCache::new();
        let now = LocalTime::from_secs(1000);

        cache.cache(msg("a", "EARLY"), 5, now);
        cache.cache(msg("a", "LATER"), 60, now);

        let later = now + LocalDuration::from_secs(30);
        cache.sweep(later);
        assert_eq!(cache.len(), 1);

        let taken = cache.take("a", later);
        assert_eq!(taken[0].command(), "LATER");
    }

    #[test]
    fn test_take_skips_expired() {
        let mut cache = MessageCache::new();
        let now = LocalTime::from_secs(1000);

        cache.cache(msg("a", "GONE"), 5, now);
        assert!(cache
            .take("a", now + LocalDuration::from_secs(10))
            .is_empty());
    }

    #[test]
    fn test_cache_ttl_parsing() {
        let mut m = Message::new("EVENT");
        assert_eq!(cache_ttl(&m), None);

        m.set_parameter("cache", "ttl=10");
        assert_eq!(cache_ttl(&m), Some(10));

        m.set_parameter("cache", "60");
        assert_eq!(cache_ttl(&m), Some(60));

        m.set_parameter("cache", "no");
        assert_eq!(cache_ttl(&m), None);

        m.set_parameter("cache", "ttl=0");
        assert_eq!(cache_ttl(&m), None);
    }
}
