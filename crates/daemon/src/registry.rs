//! Local service registrations.
use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use courier_net::time::LocalTime;
use courier_net::ConnectionId;

/// One registered local service.
#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    /// The reactor connection the service talks through.
    pub id: ConnectionId,
    pub registered_at: LocalTime,
    /// Command vocabulary, learned from the service's `COMMANDS` reply.
    pub commands: BTreeSet<String>,
    pub wants_loadavg: bool,
    pub is_ready: bool,
}

impl Registration {
    pub fn understands(&self, command: &str) -> bool {
        self.commands.contains(command)
    }
}

/// Services registered with this daemon, by name.
#[derive(Default)]
pub struct Registry {
    services: HashMap<String, Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Record a registration. Duplicate names on one daemon are refused.
    pub fn register(
        &mut self,
        name: &str,
        id: ConnectionId,
        now: LocalTime,
    ) -> Result<&Registration, ()> {
        if self.services.contains_key(name) {
            return Err(());
        }

        debug!(target: "courier", "Service {:?} registered", name);
        Ok(self
            .services
            .entry(name.to_string())
            .or_insert(Registration {
                name: name.to_string(),
                id,
                registered_at: now,
                commands: BTreeSet::new(),
                wants_loadavg: false,
                is_ready: false,
            }))
    }

    /// Evict a registration by name.
    pub fn unregister(&mut self, name: &str) -> Option<Registration> {
        let removed = self.services.remove(name);

        if removed.is_some() {
            debug!(target: "courier", "Service {:?} unregistered", name);
        }
        removed
    }

    /// Evict whatever service was registered over the given connection.
    pub fn unregister_connection(&mut self, id: ConnectionId) -> Option<Registration> {
        let name = self
            .services
            .values()
            .find(|r| r.id == id)
            .map(|r| r.name.clone())?;

        self.unregister(&name)
    }

    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.services.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Registration> {
        self.services.get_mut(name)
    }

    pub fn by_connection(&self, id: ConnectionId) -> Option<&Registration> {
        self.services.values().find(|r| r.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.services.values()
    }

    /// Services whose vocabulary includes `command`.
    pub fn interested_in<'a>(
        &'a self,
        command: &'a str,
    ) -> impl Iterator<Item = &'a Registration> {
        self.services.values().filter(move |r| r.understands(command))
    }

    /// Sorted service names, for `LIST_SERVICES` and handshakes.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();

        names.sort();
        names
    }

    /// Comma-separated service list for handshake messages.
    pub fn to_list(&self) -> String {
        self.names().join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::connection_ids;

    #[test]
    fn test_register_and_duplicate() {
        let ids = connection_ids(2);
        let mut registry = Registry::new();
        let now = LocalTime::from_secs(1);

        assert!(registry.register("firewall", ids[0], now).is_ok());
        assert!(registry.register("firewall", ids[1], now).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_by_connection() {
        let ids = connection_ids(3);
        let mut registry = Registry::new();
        let now = LocalTime::from_secs(1);

        registry.register("firewall", ids[0], now).unwrap();
        registry.register("watchdog", ids[1], now).unwrap();

        let removed = registry.unregister_connection(ids[0]).unwrap();
        assert_eq!(removed.name, "firewall");
        assert_eq!(registry.names(), vec!["watchdog"]);
        assert!(registry.unregister_connection(ids[2]).is_none());
    }

    #[test]
    fn test_interested_in() {
        let ids = connection_ids(2);
        let mut registry = Registry::new();
        let now = LocalTime::from_secs(1);

        registry.register("firewall", ids[0], now).unwrap();
        registry
            .get_mut("firewall")
            .unwrap()
            .commands
            .extend(["STATUS".to_string(), "BLOCK".to_string()]);
        registry.register("watchdog", ids[1], now).unwrap();

        let interested: Vec<_> = registry.interested_in("STATUS").map(|r| &r.name).collect();
        assert_eq!(interested, vec!["firewall"]);
        assert!(registry.get("firewall").unwrap().understands("BLOCK"));
        assert!(!registry.get("watchdog").unwrap().understands("BLOCK"));
    }
}
