//! Cluster quorum tracking.
//!
//! A cluster is "up" while this daemon sees a majority of the known
//! neighbors (itself included), and "complete" while it sees all of
//! them. Status changes are broadcast to local services and persisted so
//! late-coming daemons can read the last known state.
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use tracing::{info, warn};

use courier_types::Message;

/// Quorum status half of the cluster state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quorum {
    Up,
    Down,
}

/// Completeness half of the cluster state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    Incomplete,
}

impl Quorum {
    pub fn command(self) -> &'static str {
        match self {
            Self::Up => "CLUSTER_UP",
            Self::Down => "CLUSTER_DOWN",
        }
    }
}

impl Completeness {
    pub fn command(self) -> &'static str {
        match self {
            Self::Complete => "CLUSTER_COMPLETE",
            Self::Incomplete => "CLUSTER_INCOMPLETE",
        }
    }
}

/// Watches the live-connection count against the neighbor count.
pub struct ClusterTracker {
    status_file: Option<PathBuf>,
    quorum: Option<Quorum>,
    completeness: Option<Completeness>,
}

impl ClusterTracker {
    pub fn new(status_file: Option<PathBuf>) -> Self {
        Self {
            status_file,
            quorum: None,
            completeness: None,
        }
    }

    pub fn quorum(&self) -> Option<Quorum> {
        self.quorum
    }

    pub fn completeness(&self) -> Option<Completeness> {
        self.completeness
    }

    /// Re-evaluate with `live` live remote connections and `neighbors`
    /// known remote neighbors. Returns the status messages that must be
    /// broadcast, i.e. only the transitions.
    pub fn reevaluate(&mut self, live: usize, neighbors: usize) -> Vec<Message> {
        // Count ourselves on both sides.
        let total = neighbors + 1;
        let count = live + 1;
        let quorum = total / 2 + 1;

        let new_quorum = if count >= quorum {
            Quorum::Up
        } else {
            Quorum::Down
        };
        let new_completeness = if count == total {
            Completeness::Complete
        } else {
            Completeness::Incomplete
        };

        let mut transitions = Vec::new();

        if self.quorum != Some(new_quorum) {
            self.quorum = Some(new_quorum);
            info!(target: "courier", "Cluster status: {} ({}/{})", new_quorum.command(), count, total);
            transitions.push(status_message(new_quorum.command(), total));
        }
        if self.completeness != Some(new_completeness) {
            self.completeness = Some(new_completeness);
            info!(
                target: "courier",
                "Cluster status: {} ({}/{})",
                new_completeness.command(),
                count,
                total,
            );
            transitions.push(status_message(new_completeness.command(), total));
        }

        if !transitions.is_empty() {
            self.persist();
        }
        transitions
    }

    /// The current status pair, as sent in direct reply to a
    /// `CLUSTER_STATUS` request.
    pub fn current(&self, neighbors: usize) -> Vec<Message> {
        let total = neighbors + 1;
        let mut messages = Vec::new();

        if let Some(quorum) = self.quorum {
            messages.push(status_message(quorum.command(), total));
        }
        if let Some(completeness) = self.completeness {
            messages.push(status_message(completeness.command(), total));
        }
        messages
    }

    fn persist(&self) {
        let (Some(path), Some(quorum), Some(completeness)) =
            (&self.status_file, self.quorum, self.completeness)
        else {
            return;
        };

        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::File::create(path)?;

            writeln!(file, "{}", quorum.command())?;
            writeln!(file, "{}", completeness.command())?;
            Ok(())
        };
        if let Err(err) = write() {
            warn!(target: "courier", "Cannot save cluster status: {}", err);
        }
    }
}

fn status_message(command: &str, total: usize) -> Message {
    let mut msg = Message::new(command);

    msg.set_service(".");
    msg.set_parameter("neighbors_count", total);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_threshold() {
        let mut tracker = ClusterTracker::new(None);

        // Three daemons total: quorum is two, so one live remote
        // connection is enough.
        let up = tracker.reevaluate(1, 2);
        let commands: Vec<_> = up.iter().map(|m| m.command().to_string()).collect();
        assert_eq!(commands, vec!["CLUSTER_UP", "CLUSTER_INCOMPLETE"]);

        // No change, no messages.
        assert!(tracker.reevaluate(1, 2).is_empty());

        // All connected: complete.
        let complete = tracker.reevaluate(2, 2);
        let commands: Vec<_> = complete.iter().map(|m| m.command().to_string()).collect();
        assert_eq!(commands, vec!["CLUSTER_COMPLETE"]);

        // Losing both drops the quorum.
        let down = tracker.reevaluate(0, 2);
        let commands: Vec<_> = down.iter().map(|m| m.command().to_string()).collect();
        assert_eq!(commands, vec!["CLUSTER_DOWN", "CLUSTER_INCOMPLETE"]);
    }

    #[test]
    fn test_single_daemon_is_its_own_cluster() {
        let mut tracker = ClusterTracker::new(None);

        let up = tracker.reevaluate(0, 0);
        let commands: Vec<_> = up.iter().map(|m| m.command().to_string()).collect();
        assert_eq!(commands, vec!["CLUSTER_UP", "CLUSTER_COMPLETE"]);
    }

    #[test]
    fn test_status_message_shape() {
        let mut tracker = ClusterTracker::new(None);
        let messages = tracker.reevaluate(1, 1);

        assert_eq!(messages[0].service(), ".");
        assert_eq!(messages[0].parameter("neighbors_count"), Some("2"));
    }

    #[test]
    fn test_persisted_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster-status.txt");
        let mut tracker = ClusterTracker::new(Some(path.clone()));

        tracker.reevaluate(2, 2);

        let contents = fs::read_to_string(path).unwrap();
        assert_eq!(contents, "CLUSTER_UP\nCLUSTER_COMPLETE\n");
    }

    #[test]
    fn test_current_for_direct_query() {
        let mut tracker = ClusterTracker::new(None);

        assert!(tracker.current(2).is_empty());
        tracker.reevaluate(2, 2);

        let commands: Vec<_> = tracker
            .current(2)
            .iter()
            .map(|m| m.command().to_string())
            .collect();
        assert_eq!(commands, vec!["CLUSTER_UP", "CLUSTER_COMPLETE"]);
    }
}
