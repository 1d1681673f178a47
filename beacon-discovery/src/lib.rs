//! Peer discovery for beacon clusters
//!
//! Every server advertises itself as an ephemeral record in a shared
//! coordination namespace; watchers turn the set of live records into a
//! deduplicated list of server URLs for request routing.
//!
//! ## Features
//!
//! - **Advertiser** - One ephemeral record per process, removed on stop or by session expiry
//! - **MembershipWatcher** - Initial listing plus change notifications, lock-free snapshots
//! - **CoordinationClient** - Bounded connect, finite fixed-interval retry, optional credential
//! - **Backends** - etcd (feature `etcd`) or in-memory
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use beacon_config::ConfigManager;
//! use beacon_discovery::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let namespace = InMemoryNamespace::new();
//!     let config = ConfigManager::from_pairs([("beacon.connection", "memory")]);
//!
//!     // Register this server
//!     let advertiser = Advertiser::new(namespace.clone(), config.clone(), "host1:8080".into());
//!     advertiser.start().await?;
//!
//!     // Follow the cluster
//!     let watcher = MembershipWatcher::new(namespace, config);
//!     watcher.start().await?;
//!
//!     for url in watcher.urls().iter() {
//!         println!("Found: {}", url);
//!     }
//!
//!     watcher.stop().await;
//!     advertiser.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ### etcd
//!
//! ```rust,ignore
//! use beacon_discovery::*;
//!
//! let config = ConfigManager::from_pairs([("beacon.connection", "http://localhost:2379")]);
//! let advertiser = Advertiser::new(EtcdConnector::new(), config, "host1:8080".into());
//! advertiser.start().await?;
//! ```

pub mod advertiser;
pub mod client;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod identity;
pub mod memory;
pub mod session;
pub mod settings;
pub mod url_list;
pub mod watcher;

pub use advertiser::Advertiser;
pub use client::CoordinationClient;
#[cfg(feature = "etcd")]
pub use etcd::{EtcdConnector, EtcdSession};
pub use identity::ServerIdentity;
pub use memory::{InMemoryNamespace, InMemorySession};
pub use session::{
    ChildEvent, ChildEventKind, ChildRecord, ChildWatch, Connector, CoordinationSession,
    DiscoveryError,
};
pub use settings::{
    ConnectionSettings, Credential, RecordMode, RetryPolicy, UpdatePolicy, WatcherSettings,
    ROOT_PATH,
};
pub use url_list::{UrlList, UrlSource};
pub use watcher::MembershipWatcher;
