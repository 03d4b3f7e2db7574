use serde_derive::Deserialize;
use std::path::PathBuf;

/// Runtime tunables. Every field can come from the command line or from a
/// TOML config file; the defaults below apply otherwise.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// TCP port to listen on.
    pub port: u16,
    /// UDP port to listen on, 0 disables UDP.
    pub udp_port: u16,
    /// Bind address, `None` means all interfaces.
    pub inter: Option<String>,
    /// Unix domain socket path. When set, network listeners are disabled.
    pub socket_path: Option<PathBuf>,
    /// Access mask for the unix socket.
    pub access: u32,
    /// Memory budget for item storage, in bytes.
    pub max_bytes: usize,
    /// Maximum simultaneous connections.
    pub max_conns: usize,
    /// Verbosity level (0 info, 1 debug, 2 trace).
    pub verbose: u8,
    /// Evict cold items when a slab class is full instead of failing stores.
    pub evict_to_free: bool,
    /// Slab class growth factor.
    pub factor: f64,
    /// Minimum space allocated for key + suffix + value.
    pub chunk_size: usize,
    /// Number of worker threads (the dispatcher is extra).
    pub num_threads: usize,
    /// Parsed requests served per connection per reactor wake-up.
    pub reqs_per_event: usize,
    /// Assign CAS tokens on store.
    pub use_cas: bool,
    /// Carve the initial slab page of every class at startup.
    pub preallocate: bool,
    /// PID file path.
    pub pid_file: Option<PathBuf>,
    /// User to switch to when started as root.
    pub user: Option<String>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            port: 11211,
            udp_port: 11211,
            inter: None,
            socket_path: None,
            access: 0o700,
            max_bytes: 64 * 1024 * 1024,
            max_conns: 1024,
            verbose: 0,
            evict_to_free: true,
            factor: 1.25,
            chunk_size: 48,
            num_threads: 4,
            reqs_per_event: 20,
            use_cas: true,
            preallocate: false,
            pid_file: None,
            user: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.port, 11211);
        assert_eq!(s.udp_port, 11211);
        assert_eq!(s.max_bytes, 64 * 1024 * 1024);
        assert_eq!(s.access, 0o700);
        assert!(s.evict_to_free);
        assert!(s.use_cas);
        assert_eq!(s.reqs_per_event, 20);
    }
}
