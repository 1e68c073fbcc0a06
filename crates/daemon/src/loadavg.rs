//! Load-average sampling and distribution.
//!
//! Services opt in with `REGISTER_FOR_LOAD_AVG`; peers ask with
//! `LISTEN_LOAD_AVG`. A repeating timer samples `/proc/loadavg` and
//! pushes `LOAD_AVG` messages to whoever asked. Peer samples feed the
//! remote-route tie-breaking.
use std::collections::BTreeSet;

use courier_types::Endpoint;

/// How often load averages are sampled and sent.
pub const LOADAVG_PERIOD_SECS: u64 = 1;

/// Who asked for load averages.
#[derive(Default)]
pub struct LoadAvg {
    /// Peer endpoints that sent LISTEN_LOAD_AVG.
    remote_listeners: BTreeSet<Endpoint>,
}

impl LoadAvg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&mut self, endpoint: Endpoint) {
        self.remote_listeners.insert(endpoint);
    }

    pub fn forget(&mut self, endpoint: &Endpoint) {
        self.remote_listeners.remove(endpoint);
    }

    pub fn remote_listeners(&self) -> impl Iterator<Item = &Endpoint> {
        self.remote_listeners.iter()
    }

    pub fn has_listeners(&self) -> bool {
        !self.remote_listeners.is_empty()
    }
}

/// The 1-minute load average, if the platform exposes it.
pub fn sample() -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/loadavg").ok()?;

    contents
        .split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listeners() {
        let mut loadavg = LoadAvg::new();
        let endpoint = Endpoint::parse("10.0.0.1:4040", 0).unwrap();

        assert!(!loadavg.has_listeners());
        loadavg.listen(endpoint.clone());
        loadavg.listen(endpoint.clone());
        assert_eq!(loadavg.remote_listeners().count(), 1);

        loadavg.forget(&endpoint);
        assert!(!loadavg.has_listeners());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sample_parses() {
        let avg = sample().unwrap();
        assert!(avg >= 0.0);
    }
}
