// Beacon - peer discovery for clustered servers
//
// Servers advertise themselves as ephemeral records in a coordination
// service; watchers keep a live, deduplicated list of server URLs.

pub mod node;

pub use node::{Node, NodeBuilder};

// Re-export discovery
pub use beacon_discovery::*;

// Re-export member crates
pub use beacon_config;
pub use beacon_discovery;
pub use beacon_log;
