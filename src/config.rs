use std::net::Ipv4Addr;

pub const DEFAULT_BUS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 3);
pub const DEFAULT_BUS_PORT: u16 = 7570;

/// Seconds without a keepalive after which a peer is declared unresponsive.
pub const DEFAULT_TIMEOUT_SEC: u32 = 10;

/// Interval between `/sync` keepalives once registered.
pub const DEFAULT_PING_SEC: u32 = 2;

// Config is used to configure a mapping device or a standalone observer.
#[derive(Debug, Clone)]
pub struct Config {
    // bus_group/bus_port identify the multicast group shared by every
    // device participating in the same mapping network.
    pub bus_group: Ipv4Addr,
    pub bus_port: u16,

    // interfaces are candidate interface names tried in order; the first
    // one carrying an IPv4 address is used. An empty name matches any
    // non-loopback interface.
    pub interfaces: Vec<String>,

    // timeout_sec is the soft-state expiry window for peer records.
    pub timeout_sec: u32,

    pub ping_sec: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bus_group: DEFAULT_BUS_GROUP,
            bus_port: DEFAULT_BUS_PORT,
            interfaces: [
                "eth0", "eth1", "eth2", "eth3", "eth4", "en0", "en1", "en2", "en3", "en4", "lo",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            timeout_sec: DEFAULT_TIMEOUT_SEC,
            ping_sec: DEFAULT_PING_SEC,
        }
    }
}
