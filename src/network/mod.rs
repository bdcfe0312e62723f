//! Network subsystem: port leasing, target discovery, local addressing

pub mod addr;
pub mod discovery;
pub mod port;

pub use addr::local_ip_for_remote;
pub use discovery::{
    normalize_name, DiscoveryEvent, DiscoverySource, DiscoveryWatcher, MdnsDiscovery,
    ServiceAnnouncement, WatcherNotification,
};
pub use port::{find_available_port, PortAllocator, PortLease};
