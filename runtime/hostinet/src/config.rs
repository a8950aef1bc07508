use std::time::Duration;

/// Which network stack serves guest sockets for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Guest sockets are host sockets.
    HostPassthrough,
    /// Guest sockets are served by an in-sandbox stack.
    Netstack,
}

impl BackendKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "host" | "hostinet" | "passthrough" => Some(BackendKind::HostPassthrough),
            "netstack" | "sandbox" => Some(BackendKind::Netstack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostNetConfig {
    pub backend: BackendKind,
    /// Upper bound on a single wait of the readiness worker.
    pub poll_interval: Duration,
    /// Number of readiness events drained per worker iteration.
    pub event_capacity: usize,
    pub trace_poller: bool,
    pub trace_socket: bool,
    pub profile: bool,
}

const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_EVENT_CAPACITY: usize = 256;

impl Default for HostNetConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::HostPassthrough,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            trace_poller: false,
            trace_socket: false,
            profile: false,
        }
    }
}

impl HostNetConfig {
    /// Reads `HOSTINET_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Malformed values keep
    /// the default and log a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup("HOSTINET_BACKEND") {
            match BackendKind::parse(&raw) {
                Some(kind) => config.backend = kind,
                None => log::warn!("ignoring HOSTINET_BACKEND={raw:?}"),
            }
        }
        if let Some(raw) = lookup("HOSTINET_POLL_INTERVAL_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.poll_interval = Duration::from_millis(ms),
                _ => log::warn!("ignoring HOSTINET_POLL_INTERVAL_MS={raw:?}"),
            }
        }
        if let Some(raw) = lookup("HOSTINET_EVENT_CAPACITY") {
            match raw.trim().parse::<usize>() {
                Ok(cap) if cap > 0 => config.event_capacity = cap,
                _ => log::warn!("ignoring HOSTINET_EVENT_CAPACITY={raw:?}"),
            }
        }
        config.trace_poller = lookup("HOSTINET_TRACE_POLLER").is_some_and(|v| flag_enabled(&v));
        config.trace_socket = lookup("HOSTINET_TRACE_SOCKET").is_some_and(|v| flag_enabled(&v));
        config.profile = lookup("HOSTINET_PROFILE").is_some_and(|v| flag_enabled(&v));
        config
    }
}

pub(crate) fn flag_enabled(val: &str) -> bool {
    !val.is_empty() && val != "0"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_in(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = HostNetConfig::from_lookup(|_| None);
        assert_eq!(config, HostNetConfig::default());
        assert_eq!(config.backend, BackendKind::HostPassthrough);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn values_are_parsed() {
        let config = HostNetConfig::from_lookup(lookup_in(&[
            ("HOSTINET_BACKEND", "netstack"),
            ("HOSTINET_POLL_INTERVAL_MS", "20"),
            ("HOSTINET_EVENT_CAPACITY", "64"),
            ("HOSTINET_TRACE_POLLER", "1"),
            ("HOSTINET_PROFILE", "yes"),
        ]));
        assert_eq!(config.backend, BackendKind::Netstack);
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.event_capacity, 64);
        assert!(config.trace_poller);
        assert!(!config.trace_socket);
        assert!(config.profile);
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let config = HostNetConfig::from_lookup(lookup_in(&[
            ("HOSTINET_BACKEND", "carrier-pigeon"),
            ("HOSTINET_POLL_INTERVAL_MS", "0"),
            ("HOSTINET_EVENT_CAPACITY", "lots"),
            ("HOSTINET_TRACE_SOCKET", "0"),
        ]));
        assert_eq!(config, HostNetConfig::default());
    }
}
