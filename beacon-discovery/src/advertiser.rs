//! Advertiser: registers this server in the membership namespace
//!
//! On `start()` the advertiser opens its own coordination session and writes
//! one ephemeral record under [`ROOT_PATH`] whose payload is the server
//! identity. On `stop()` it deletes the record and closes the session; if the
//! process dies first, session expiry removes the record instead.
//!
//! When no connection is configured the advertiser stays inert, unless it was
//! built with [`Advertiser::require_connection`]. `beacon.record_mode` set to
//! `persistent` keeps the record past session expiry.

use beacon_config::ConfigManager;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::CoordinationClient;
use crate::identity::ServerIdentity;
use crate::session::{child_path, Connector, DiscoveryError};
use crate::settings::{ConnectionSettings, RecordMode, ROOT_PATH};

struct Registration {
    client: CoordinationClient,
    path: String,
    mode: RecordMode,
}

/// Owns this process's membership record.
pub struct Advertiser {
    connector: Arc<dyn Connector>,
    config: ConfigManager,
    identity: ServerIdentity,
    registration: Mutex<Option<Registration>>,
    require_connection: bool,
}

impl Advertiser {
    pub fn new<C>(connector: C, config: ConfigManager, identity: ServerIdentity) -> Self
    where
        C: Connector + 'static,
    {
        Self {
            connector: Arc::new(connector),
            config,
            identity,
            registration: Mutex::new(None),
            require_connection: false,
        }
    }

    /// Treat a missing connection setting as a configuration error instead
    /// of disabling the advertiser.
    pub fn require_connection(mut self) -> Self {
        self.require_connection = true;
        self
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Register the record.
    ///
    /// Failing to connect within the retry budget is returned as an error:
    /// a server that cannot register would run undiscoverable.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        let mut registration = self.registration.lock().await;

        if registration.is_none() {
            let Some(settings) = ConnectionSettings::resolve(&self.config)? else {
                if self.require_connection {
                    return Err(DiscoveryError::InvalidConfiguration(
                        "no coordination connection configured".to_string(),
                    ));
                }
                info!("No coordination connection configured, advertiser disabled");
                return Ok(());
            };
            let mode = RecordMode::resolve(&self.config)?;

            let client = CoordinationClient::connect(self.connector.as_ref(), &settings).await?;
            let path = child_path(ROOT_PATH, &Uuid::new_v4().to_string());
            *registration = Some(Registration { client, path, mode });
        }

        let Some(Registration { client, path, mode }) = registration.as_ref() else {
            return Ok(());
        };

        if !client.exists(path).await? {
            let data = self.identity.as_bytes();
            let created = match mode {
                RecordMode::Ephemeral => client.create_ephemeral(path, data).await,
                RecordMode::Persistent => client.create_persistent(path, data).await,
            };
            match created {
                Ok(()) => {
                    info!(
                        path = %path,
                        identity = %self.identity,
                        mode = ?mode,
                        "Registered membership record"
                    );
                    return Ok(());
                }
                // An earlier attempt committed before its reply was lost
                Err(DiscoveryError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        client.set_data(path, self.identity.as_bytes()).await?;
        debug!(path = %path, identity = %self.identity, "Updated membership record");

        Ok(())
    }

    /// Delete the record and close the session.
    ///
    /// Deletion is best-effort: a failure is logged and session expiry
    /// removes the record eventually.
    pub async fn stop(&self) {
        let Some(Registration { client, path, .. }) = self.registration.lock().await.take() else {
            return;
        };

        match client.delete(&path).await {
            Ok(()) => info!(path = %path, "Removed membership record"),
            Err(e) => warn!(
                path = %path,
                error = %e,
                "Failed to remove membership record, leaving it to session expiry"
            ),
        }

        client.close().await;
    }

    /// Path of the record owned by this advertiser, while started
    pub async fn record_path(&self) -> Option<String> {
        self.registration
            .lock()
            .await
            .as_ref()
            .map(|r| r.path.clone())
    }

    /// Whether a session is currently held
    pub async fn is_active(&self) -> bool {
        self.registration.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryNamespace;
    use crate::session::{is_direct_child, ChildRecord, ChildWatch, CoordinationSession};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Connector whose sessions commit the first ephemeral create but report
    /// a timeout for it, as if the reply never arrived.
    struct LostReplyConnector {
        namespace: InMemoryNamespace,
        lost: Arc<AtomicBool>,
    }

    struct LostReplySession {
        inner: Arc<dyn CoordinationSession>,
        lost: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connector for LostReplyConnector {
        async fn connect(
            &self,
            settings: &ConnectionSettings,
        ) -> Result<Arc<dyn CoordinationSession>, DiscoveryError> {
            let inner = self.namespace.connect(settings).await?;
            Ok(Arc::new(LostReplySession {
                inner,
                lost: self.lost.clone(),
            }))
        }
    }

    #[async_trait]
    impl CoordinationSession for LostReplySession {
        fn id(&self) -> String {
            self.inner.id()
        }

        async fn exists(&self, path: &str) -> Result<bool, DiscoveryError> {
            self.inner.exists(path).await
        }

        async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<(), DiscoveryError> {
            self.inner.create_ephemeral(path, data).await?;
            if !self.lost.swap(true, Ordering::SeqCst) {
                return Err(DiscoveryError::Timeout(Duration::from_millis(1)));
            }
            Ok(())
        }

        async fn create_persistent(&self, path: &str, data: &[u8]) -> Result<(), DiscoveryError> {
            self.inner.create_persistent(path, data).await
        }

        async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), DiscoveryError> {
            self.inner.set_data(path, data).await
        }

        async fn delete(&self, path: &str) -> Result<(), DiscoveryError> {
            self.inner.delete(path).await
        }

        async fn list_children(&self, root: &str) -> Result<Vec<ChildRecord>, DiscoveryError> {
            self.inner.list_children(root).await
        }

        async fn watch_children(&self, root: &str) -> Result<ChildWatch, DiscoveryError> {
            self.inner.watch_children(root).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    fn config() -> ConfigManager {
        ConfigManager::from_pairs([("beacon.connection", "memory"), ("beacon.retry_interval", "1")])
    }

    #[tokio::test]
    async fn test_start_registers_ephemeral_record() {
        let namespace = InMemoryNamespace::new();
        let advertiser = Advertiser::new(namespace.clone(), config(), "host1:8080".into());

        advertiser.start().await.unwrap();

        let path = advertiser.record_path().await.unwrap();
        assert!(is_direct_child(ROOT_PATH, &path));

        let records = namespace.records(ROOT_PATH);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, path);
        assert_eq!(records[0].data.as_deref(), Some(&b"host1:8080"[..]));
        assert!(namespace.owner_of(&path).is_some());
    }

    #[tokio::test]
    async fn test_repeated_start_keeps_one_record() {
        let namespace = InMemoryNamespace::new();
        let advertiser = Advertiser::new(namespace.clone(), config(), "host1:8080".into());

        advertiser.start().await.unwrap();
        let first = advertiser.record_path().await;
        advertiser.start().await.unwrap();

        assert_eq!(advertiser.record_path().await, first);
        assert_eq!(namespace.records(ROOT_PATH).len(), 1);
        assert_eq!(namespace.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_fresh_path_per_instance() {
        let namespace = InMemoryNamespace::new();
        let a = Advertiser::new(namespace.clone(), config(), "host1:8080".into());
        let b = Advertiser::new(namespace.clone(), config(), "host1:8080".into());

        a.start().await.unwrap();
        b.start().await.unwrap();

        assert_ne!(a.record_path().await, b.record_path().await);
        assert_eq!(namespace.records(ROOT_PATH).len(), 2);
    }

    #[tokio::test]
    async fn test_stop_removes_record() {
        let namespace = InMemoryNamespace::new();
        let advertiser = Advertiser::new(namespace.clone(), config(), "host1:8080".into());

        advertiser.start().await.unwrap();
        advertiser.stop().await;

        assert!(namespace.records(ROOT_PATH).is_empty());
        assert!(!advertiser.is_active().await);
        assert!(advertiser.record_path().await.is_none());
        assert_eq!(namespace.session_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_swallows_delete_failure() {
        let namespace = InMemoryNamespace::new();
        let advertiser = Advertiser::new(namespace.clone(), config(), "host1:8080".into());
        advertiser.start().await.unwrap();

        // Someone else already removed the record
        let path = advertiser.record_path().await.unwrap();
        assert!(namespace.remove(&path));

        advertiser.stop().await;
        assert!(!advertiser.is_active().await);
    }

    #[tokio::test]
    async fn test_unconfigured_advertiser_is_inert() {
        let namespace = InMemoryNamespace::new();
        let advertiser =
            Advertiser::new(namespace.clone(), ConfigManager::new(), "host1:8080".into());

        advertiser.start().await.unwrap();
        advertiser.stop().await;

        assert!(!advertiser.is_active().await);
        assert_eq!(namespace.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_fatal() {
        let namespace = InMemoryNamespace::new();
        namespace.set_available(false);
        let advertiser = Advertiser::new(namespace.clone(), config(), "host1:8080".into());

        let result = advertiser.start().await;

        assert!(matches!(result, Err(DiscoveryError::ConnectionLoss(_))));
        assert!(!advertiser.is_active().await);
        assert_eq!(namespace.connect_attempts(), 4);
    }

    #[tokio::test]
    async fn test_create_retried_after_lost_reply() {
        let namespace = InMemoryNamespace::new();
        let connector = LostReplyConnector {
            namespace: namespace.clone(),
            lost: Arc::new(AtomicBool::new(false)),
        };
        let advertiser = Advertiser::new(connector, config(), "host1:8080".into());

        advertiser.start().await.unwrap();

        let path = advertiser.record_path().await.unwrap();
        let records = namespace.records(ROOT_PATH);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, path);
        assert_eq!(records[0].data.as_deref(), Some(&b"host1:8080"[..]));
    }

    #[tokio::test]
    async fn test_required_connection_missing() {
        let namespace = InMemoryNamespace::new();
        let advertiser =
            Advertiser::new(namespace.clone(), ConfigManager::new(), "host1:8080".into())
                .require_connection();

        let result = advertiser.start().await;

        assert!(matches!(result, Err(DiscoveryError::InvalidConfiguration(_))));
        assert_eq!(namespace.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_persistent_record_outlives_session() {
        let namespace = InMemoryNamespace::new();
        let config = config();
        config.set("beacon.record_mode", "persistent").unwrap();
        let advertiser = Advertiser::new(namespace.clone(), config, "host1:8080".into());

        advertiser.start().await.unwrap();
        let path = advertiser.record_path().await.unwrap();
        assert!(namespace.owner_of(&path).is_none());

        namespace.expire_session(1);
        let records = namespace.records(ROOT_PATH);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, path);
    }

    #[tokio::test]
    async fn test_invalid_record_mode() {
        let namespace = InMemoryNamespace::new();
        let config = config();
        config.set("beacon.record_mode", "sequential").unwrap();
        let advertiser = Advertiser::new(namespace.clone(), config, "host1:8080".into());

        let result = advertiser.start().await;

        assert!(matches!(result, Err(DiscoveryError::InvalidConfiguration(_))));
        assert_eq!(namespace.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let advertiser =
            Advertiser::new(InMemoryNamespace::new(), config(), "host1:8080".into());
        advertiser.stop().await;
        assert!(!advertiser.is_active().await);
    }
}
