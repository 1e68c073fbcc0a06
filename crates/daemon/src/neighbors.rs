//! Known-neighbor list, persisted to a flat cache file.
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, warn};

use courier_types::Endpoint;

/// The set of neighbor endpoints this daemon knows about, merged from
/// configuration, gossip and peer handshakes.
///
/// The cache file holds one endpoint per line; lines starting with `#`
/// are comments. Writes are sequential, there are no concurrent writers.
pub struct NeighborList {
    path: Option<PathBuf>,
    neighbors: BTreeSet<Endpoint>,
}

impl NeighborList {
    /// Start from the configured neighbors, merging whatever a previous
    /// run persisted.
    pub fn load(path: Option<PathBuf>, configured: &[Endpoint]) -> Self {
        let mut list = Self {
            path,
            neighbors: configured.iter().cloned().collect(),
        };

        if let Some(path) = &list.path {
            match fs::read_to_string(path) {
                Ok(contents) => {
                    for line in contents.lines() {
                        let line = line.trim();

                        if line.is_empty() || line.starts_with('#') {
                            continue;
                        }
                        match Endpoint::parse(line, 0) {
                            Ok(endpoint) => {
                                list.neighbors.insert(endpoint);
                            }
                            Err(err) => {
                                warn!(target: "courier", "Ignoring bad neighbor {:?}: {}", line, err);
                            }
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(target: "courier", "Cannot read neighbor cache: {}", err);
                }
            }
        }
        list
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.neighbors.contains(endpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.neighbors.iter()
    }

    /// Merge new endpoints; returns those that were actually new.
    pub fn add(&mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> Vec<Endpoint> {
        let added: Vec<Endpoint> = endpoints
            .into_iter()
            .filter(|endpoint| self.neighbors.insert(endpoint.clone()))
            .collect();

        if !added.is_empty() {
            debug!(target: "courier", "Learned {} new neighbor(s)", added.len());
            self.save();
        }
        added
    }

    /// Forget one endpoint. Returns whether it was known.
    pub fn remove(&mut self, endpoint: &Endpoint) -> bool {
        let removed = self.neighbors.remove(endpoint);

        if removed {
            self.save();
        }
        removed
    }

    /// Parse a comma-separated neighbor list, ignoring bad entries.
    pub fn parse_list(list: &str) -> Vec<Endpoint> {
        list.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .filter_map(|part| Endpoint::parse(part, 0).ok())
            .collect()
    }

    /// Comma-separated form for handshake messages.
    pub fn to_list(&self) -> String {
        let parts: Vec<String> = self.neighbors.iter().map(Endpoint::to_string).collect();
        parts.join(",")
    }

    fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };

        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::File::create(path)?;

            writeln!(file, "# Known neighbors, one endpoint per line.")?;
            for endpoint in &self.neighbors {
                writeln!(file, "{}", endpoint)?;
            }
            Ok(())
        };
        if let Err(err) = write() {
            warn!(target: "courier", "Cannot save neighbor cache: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        Endpoint::parse(s, 0).unwrap()
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("neighbors.txt");

        let mut list = NeighborList::load(Some(path.clone()), &[ep("10.0.0.1:4040")]);
        list.add(vec![ep("10.0.0.2:4040"), ep("10.0.0.3:4040")]);
        list.remove(&ep("10.0.0.2:4040"));

        let reloaded = NeighborList::load(Some(path), &[]);
        let names: Vec<String> = reloaded.iter().map(Endpoint::to_string).collect();
        assert_eq!(names, vec!["10.0.0.1:4040", "10.0.0.3:4040"]);
    }

    #[test]
    fn test_comments_and_bad_lines_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("neighbors.txt");
        fs::write(&path, "# comment\n10.0.0.9:4040\nnot an endpoint\n\n").unwrap();

        let list = NeighborList::load(Some(path), &[]);
        assert_eq!(list.len(), 1);
        assert!(list.contains(&ep("10.0.0.9:4040")));
    }

    #[test]
    fn test_add_reports_new_only() {
        let mut list = NeighborList::load(None, &[ep("10.0.0.1:4040")]);

        let added = list.add(vec![ep("10.0.0.1:4040"), ep("10.0.0.2:4040")]);
        assert_eq!(added, vec![ep("10.0.0.2:4040")]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_parse_list() {
        let parsed = NeighborList::parse_list("10.0.0.1:1, 10.0.0.2:2,, bad");
        assert_eq!(parsed, vec![ep("10.0.0.1:1"), ep("10.0.0.2:2")]);
    }
}
