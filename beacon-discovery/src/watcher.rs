//! MembershipWatcher: keeps a live list of server URLs
//!
//! The watcher opens its own coordination session, subscribes to the
//! children of [`ROOT_PATH`], reads one full listing and then applies
//! add/update/remove notifications to a [`UrlList`] that routing code reads
//! through lock-free snapshots.
//!
//! Notifications for different records may interleave with each other and
//! with the initial listing, so entries are deduplicated by URL. Bookkeeping
//! is keyed by record path: a URL stays listed while any record maps to it.
//!
//! Without a configured connection the watcher serves a static URL list
//! instead and never connects.

use beacon_config::ConfigManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::CoordinationClient;
use crate::identity::ServerIdentity;
use crate::session::{ChildEvent, ChildEventKind, ChildRecord, ChildWatch, Connector, DiscoveryError};
use crate::settings::{ConnectionSettings, UpdatePolicy, WatcherSettings, ROOT_PATH};
use crate::url_list::{UrlList, UrlSource};

// ============================================================================
// Membership bookkeeping
// ============================================================================

/// Writer side of the URL list, owned by the watch task.
struct Membership {
    settings: WatcherSettings,
    by_path: HashMap<String, String>,
    urls: Arc<UrlList>,
}

impl Membership {
    fn new(settings: WatcherSettings, urls: Arc<UrlList>) -> Self {
        Self {
            settings,
            by_path: HashMap::new(),
            urls,
        }
    }

    fn url_of(&self, record: &ChildRecord) -> Option<String> {
        ServerIdentity::decode(record.data.as_deref())
            .map(|identity| self.settings.url_for(identity.as_str()))
    }

    /// Replace all membership with a full listing
    fn rebuild(&mut self, records: Vec<ChildRecord>) {
        self.by_path.clear();

        let mut ordered = Vec::with_capacity(records.len());
        for record in records {
            match self.url_of(&record) {
                Some(url) => {
                    ordered.push(url.clone());
                    self.by_path.insert(record.path, url);
                }
                None => debug!(path = %record.path, "Skipping record without identity"),
            }
        }

        self.urls.replace(ordered);
        info!(servers = self.urls.len(), "Loaded server list");
    }

    fn apply(&mut self, event: ChildEvent) {
        let ChildEvent { kind, record } = event;
        match kind {
            ChildEventKind::Added => self.on_added(record),
            ChildEventKind::Updated => self.on_updated(record),
            ChildEventKind::Removed => self.on_removed(record),
        }
    }

    fn on_added(&mut self, record: ChildRecord) {
        let Some(url) = self.url_of(&record) else {
            debug!(path = %record.path, "Ignoring added record without identity");
            return;
        };

        self.track(record.path, url.clone());
        if self.urls.insert(&url) {
            info!(url = %url, "Server joined");
        }
    }

    fn on_updated(&mut self, record: ChildRecord) {
        match self.settings.update_policy {
            UpdatePolicy::Ignore => {
                warn!(
                    path = %record.path,
                    "Membership record payload changed, server list left as is"
                );
            }
            UpdatePolicy::Reconcile => {
                let Some(url) = self.url_of(&record) else {
                    debug!(path = %record.path, "Ignoring updated record without identity");
                    return;
                };

                match self.by_path.get(&record.path) {
                    Some(previous) if *previous == url => {}
                    Some(previous) => {
                        let previous = previous.clone();
                        self.by_path.insert(record.path, url.clone());
                        if self.is_referenced(&previous) {
                            self.urls.insert(&url);
                        } else {
                            self.urls.replace_entry(&previous, &url);
                        }
                        info!(from = %previous, to = %url, "Server address changed");
                    }
                    None => self.on_added(record),
                }
            }
        }
    }

    fn on_removed(&mut self, record: ChildRecord) {
        let tracked = self.by_path.remove(&record.path);
        let Some(url) = self.url_of(&record) else {
            // The path no longer vouches for its URL; the list itself is kept
            debug!(path = %record.path, "Removed record without identity");
            return;
        };

        self.release(&url);
        if let Some(tracked) = tracked.filter(|t| *t != url) {
            self.release(&tracked);
        }
    }

    fn track(&mut self, path: String, url: String) {
        if let Some(previous) = self.by_path.insert(path, url.clone()) {
            if previous != url {
                self.release(&previous);
            }
        }
    }

    fn release(&self, url: &str) {
        if !self.is_referenced(url) && self.urls.remove(url) {
            info!(url = %url, "Server left");
        }
    }

    fn is_referenced(&self, url: &str) -> bool {
        self.by_path.values().any(|u| u == url)
    }
}

// ============================================================================
// Watch task
// ============================================================================

/// Register the watch, then read the listing it will be applied on top of.
///
/// Subscribing first means no removal can slip in between the two; the
/// replayed additions are absorbed by URL deduplication.
async fn subscribe(
    client: &CoordinationClient,
    membership: &mut Membership,
) -> Result<ChildWatch, DiscoveryError> {
    let watch = client.watch_children(ROOT_PATH).await?;
    let records = client.list_children(ROOT_PATH).await?;
    membership.rebuild(records);
    Ok(watch)
}

struct WatchLoop {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    client: CoordinationClient,
    membership: Membership,
}

impl WatchLoop {
    async fn run(mut self, mut watch: ChildWatch, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = watch.recv() => match event {
                    Some(event) => self.membership.apply(event),
                    None => {
                        warn!(session = %self.client.session_id(), "Membership watch ended, resubscribing");
                        tokio::select! {
                            _ = &mut shutdown => break,
                            result = self.resubscribe() => match result {
                                Ok(next) => watch = next,
                                Err(e) => {
                                    error!(error = %e, "Membership watch lost, server list is no longer updated");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        self.client.close().await;
    }

    async fn resubscribe(&mut self) -> Result<ChildWatch, DiscoveryError> {
        tokio::time::sleep(self.settings.retry.interval).await;

        match subscribe(&self.client, &mut self.membership).await {
            Err(DiscoveryError::SessionClosed) => {
                warn!("Coordination session expired, reconnecting");
                self.client.close().await;
                self.client =
                    CoordinationClient::connect(self.connector.as_ref(), &self.settings).await?;
                subscribe(&self.client, &mut self.membership).await
            }
            other => other,
        }
    }
}

// ============================================================================
// MembershipWatcher
// ============================================================================

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Maintains the deduplicated list of live server URLs.
pub struct MembershipWatcher {
    connector: Arc<dyn Connector>,
    config: ConfigManager,
    urls: Arc<UrlList>,
    running: Mutex<Option<Running>>,
    static_mode: AtomicBool,
}

impl MembershipWatcher {
    pub fn new<C>(connector: C, config: ConfigManager) -> Self
    where
        C: Connector + 'static,
    {
        Self {
            connector: Arc::new(connector),
            config,
            urls: Arc::new(UrlList::new()),
            running: Mutex::new(None),
            static_mode: AtomicBool::new(false),
        }
    }

    /// Build the initial list and start following changes.
    ///
    /// Returns once the initial listing has been applied. Connection failure
    /// is returned as an error; the static fallback never connects.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        let mut running = self.running.lock().await;
        if let Some(Running { task, .. }) = running.take_if(|r| r.task.is_finished()) {
            if let Err(e) = task.await {
                error!(error = %e, "Membership watch task failed");
            }
            info!("Membership watch ended, starting again");
        }
        if running.is_some() || self.is_static() {
            debug!("Membership watcher already started");
            return Ok(());
        }

        let watcher_settings = WatcherSettings::resolve(&self.config)?;
        let Some(settings) = ConnectionSettings::resolve(&self.config)? else {
            self.start_static(&watcher_settings);
            return Ok(());
        };

        let client = CoordinationClient::connect(self.connector.as_ref(), &settings).await?;
        let mut membership = Membership::new(watcher_settings, Arc::clone(&self.urls));

        let watch = match subscribe(&client, &mut membership).await {
            Ok(watch) => watch,
            Err(e) => {
                client.close().await;
                return Err(e);
            }
        };

        let (shutdown, shutdown_rx) = oneshot::channel();
        let watch_loop = WatchLoop {
            connector: Arc::clone(&self.connector),
            settings,
            client,
            membership,
        };
        let task = tokio::spawn(watch_loop.run(watch, shutdown_rx));

        *running = Some(Running { shutdown, task });
        Ok(())
    }

    fn start_static(&self, settings: &WatcherSettings) {
        match settings.static_url_list() {
            Some(urls) if !urls.is_empty() => {
                warn!(
                    servers = urls.len(),
                    "No coordination connection configured, using static server list"
                );
                self.urls.replace(urls);
            }
            _ => {
                error!("No coordination connection and no static server list configured");
                self.urls.clear();
            }
        }
        self.static_mode.store(true, Ordering::Release);
    }

    /// Stop following changes, close the session and discard the list.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(Running { shutdown, task }) = running {
            let _ = shutdown.send(());
            if let Err(e) = task.await {
                error!(error = %e, "Membership watch task failed");
            }
            info!("Membership watcher stopped");
        }

        self.static_mode.store(false, Ordering::Release);
        self.urls.clear();
    }

    /// Current snapshot of server URLs. Never blocks.
    pub fn urls(&self) -> Arc<Vec<String>> {
        self.urls.snapshot()
    }

    /// Shared handle to the underlying list
    pub fn url_list(&self) -> Arc<UrlList> {
        Arc::clone(&self.urls)
    }

    /// Number of list mutations so far
    pub fn version(&self) -> u64 {
        self.urls.version()
    }

    /// Whether the static fallback list is being served
    pub fn is_static(&self) -> bool {
        self.static_mode.load(Ordering::Acquire)
    }

    pub async fn is_watching(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }
}

impl UrlSource for MembershipWatcher {
    fn urls(&self) -> Arc<Vec<String>> {
        self.urls.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryNamespace;
    use crate::session::child_path;
    use std::time::Duration;

    fn membership(policy: UpdatePolicy) -> Membership {
        let settings = WatcherSettings {
            update_policy: policy,
            ..WatcherSettings::default()
        };
        Membership::new(settings, Arc::new(UrlList::new()))
    }

    fn path(name: &str) -> String {
        child_path(ROOT_PATH, name)
    }

    fn data(identity: &str) -> Option<Vec<u8>> {
        Some(identity.as_bytes().to_vec())
    }

    fn config() -> ConfigManager {
        ConfigManager::from_pairs([("beacon.connection", "memory"), ("beacon.retry_interval", "1")])
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_rebuild_from_listing() {
        let mut m = membership(UpdatePolicy::Ignore);
        m.rebuild(vec![
            ChildRecord::new(path("a"), data("host1:8080")),
            ChildRecord::new(path("b"), data("host2:8080")),
            ChildRecord::new(path("c"), None),
        ]);

        assert_eq!(
            *m.urls.snapshot(),
            vec!["http://host1:8080/remoting", "http://host2:8080/remoting"]
        );
    }

    #[test]
    fn test_add_for_listed_record_does_not_duplicate() {
        let mut m = membership(UpdatePolicy::Ignore);
        m.rebuild(vec![ChildRecord::new(path("a"), data("host1:8080"))]);

        m.apply(ChildEvent::added(path("a"), data("host1:8080")));

        assert_eq!(*m.urls.snapshot(), vec!["http://host1:8080/remoting"]);
    }

    #[test]
    fn test_undecodable_remove_leaves_list_unchanged() {
        let mut m = membership(UpdatePolicy::Ignore);
        m.rebuild(vec![ChildRecord::new(path("a"), data("host1:8080"))]);
        let version = m.urls.version();

        m.apply(ChildEvent::removed(path("a"), None));
        m.apply(ChildEvent::removed(path("a"), Some(vec![0xff, 0xfe])));

        assert_eq!(*m.urls.snapshot(), vec!["http://host1:8080/remoting"]);
        assert_eq!(m.urls.version(), version);
    }

    #[test]
    fn test_undecodable_remove_forgets_path() {
        let mut m = membership(UpdatePolicy::Ignore);
        m.rebuild(vec![ChildRecord::new(path("a"), data("host1:8080"))]);

        m.apply(ChildEvent::removed(path("a"), None));
        assert_eq!(*m.urls.snapshot(), vec!["http://host1:8080/remoting"]);

        // The URL is released once its last tracked record goes
        m.apply(ChildEvent::added(path("b"), data("host1:8080")));
        m.apply(ChildEvent::removed(path("b"), data("host1:8080")));
        assert!(m.urls.is_empty());
    }

    #[test]
    fn test_add_without_identity_is_ignored() {
        let mut m = membership(UpdatePolicy::Ignore);
        m.apply(ChildEvent::added(path("a"), Some(Vec::new())));
        assert!(m.urls.is_empty());
    }

    #[test]
    fn test_shared_identity_stays_until_last_record_goes() {
        let mut m = membership(UpdatePolicy::Ignore);
        m.apply(ChildEvent::added(path("old"), data("host1:8080")));
        m.apply(ChildEvent::added(path("new"), data("host1:8080")));
        assert_eq!(m.urls.len(), 1);

        m.apply(ChildEvent::removed(path("old"), data("host1:8080")));
        assert_eq!(*m.urls.snapshot(), vec!["http://host1:8080/remoting"]);

        m.apply(ChildEvent::removed(path("new"), data("host1:8080")));
        assert!(m.urls.is_empty());
    }

    #[test]
    fn test_update_ignored_by_default() {
        let mut m = membership(UpdatePolicy::Ignore);
        m.apply(ChildEvent::added(path("a"), data("host1:8080")));

        m.apply(ChildEvent::updated(path("a"), data("host9:8080")));

        assert_eq!(*m.urls.snapshot(), vec!["http://host1:8080/remoting"]);
    }

    #[test]
    fn test_update_reconciled_by_path() {
        let mut m = membership(UpdatePolicy::Reconcile);
        m.apply(ChildEvent::added(path("a"), data("host1:8080")));
        m.apply(ChildEvent::added(path("b"), data("host2:8080")));

        m.apply(ChildEvent::updated(path("a"), data("host9:8080")));
        assert_eq!(
            *m.urls.snapshot(),
            vec!["http://host9:8080/remoting", "http://host2:8080/remoting"]
        );

        m.apply(ChildEvent::removed(path("a"), data("host9:8080")));
        assert_eq!(*m.urls.snapshot(), vec!["http://host2:8080/remoting"]);
    }

    #[test]
    fn test_remove_after_ignored_update_drops_tracked_url() {
        let mut m = membership(UpdatePolicy::Ignore);
        m.apply(ChildEvent::added(path("a"), data("host1:8080")));
        m.apply(ChildEvent::updated(path("a"), data("host9:8080")));

        m.apply(ChildEvent::removed(path("a"), data("host9:8080")));

        assert!(m.urls.is_empty());
    }

    #[test]
    fn test_event_sequence_matches_live_records() {
        let mut m = membership(UpdatePolicy::Ignore);
        m.rebuild(vec![ChildRecord::new(path("a"), data("h1:1"))]);

        let events = vec![
            ChildEvent::added(path("b"), data("h2:1")),
            ChildEvent::added(path("a"), data("h1:1")),
            ChildEvent::added(path("c"), data("h3:1")),
            ChildEvent::removed(path("b"), data("h2:1")),
            ChildEvent::added(path("d"), data("h3:1")),
            ChildEvent::removed(path("c"), data("h3:1")),
            ChildEvent::removed(path("x"), data("h7:1")),
        ];
        for event in events {
            m.apply(event);
        }

        let mut urls = (*m.urls.snapshot()).clone();
        urls.sort();
        assert_eq!(urls, vec!["http://h1:1/remoting", "http://h3:1/remoting"]);
    }

    #[tokio::test]
    async fn test_fresh_watcher_lists_existing_servers() {
        let namespace = InMemoryNamespace::new();
        namespace.put_persistent(&path("a"), b"host1:8080");
        namespace.put_persistent(&path("b"), b"host2:8080");

        let watcher = MembershipWatcher::new(namespace.clone(), config());
        watcher.start().await.unwrap();

        assert_eq!(
            *watcher.urls(),
            vec!["http://host1:8080/remoting", "http://host2:8080/remoting"]
        );
        assert!(!watcher.is_static());
        assert!(watcher.is_watching().await);

        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_follows_changes() {
        let namespace = InMemoryNamespace::new();
        let watcher = MembershipWatcher::new(namespace.clone(), config());
        watcher.start().await.unwrap();
        assert!(watcher.urls().is_empty());

        namespace.put_persistent(&path("a"), b"host1:8080");
        eventually(|| watcher.urls().len() == 1).await;

        namespace.remove(&path("a"));
        eventually(|| watcher.urls().is_empty()).await;

        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_static_fallback() {
        let namespace = InMemoryNamespace::new();
        let config = ConfigManager::from_pairs([(
            "cluster.connection_url_list",
            "http://a:1;http://b:2, http://a:1",
        )]);

        let watcher = MembershipWatcher::new(namespace.clone(), config);
        watcher.start().await.unwrap();

        assert!(watcher.is_static());
        assert_eq!(*watcher.urls(), vec!["http://a:1/remoting", "http://b:2/remoting"]);
        assert_eq!(namespace.connect_attempts(), 0);

        watcher.stop().await;
        assert!(watcher.urls().is_empty());
    }

    #[tokio::test]
    async fn test_no_connection_and_no_static_list() {
        let watcher = MembershipWatcher::new(InMemoryNamespace::new(), ConfigManager::new());
        watcher.start().await.unwrap();

        assert!(watcher.is_static());
        assert!(watcher.urls().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_is_fatal() {
        let namespace = InMemoryNamespace::new();
        namespace.set_available(false);

        let watcher = MembershipWatcher::new(namespace.clone(), config());
        let result = watcher.start().await;

        assert!(matches!(result, Err(DiscoveryError::ConnectionLoss(_))));
        assert!(!watcher.is_watching().await);
    }

    #[tokio::test]
    async fn test_stop_closes_session_and_clears() {
        let namespace = InMemoryNamespace::new();
        namespace.put_persistent(&path("a"), b"host1:8080");

        let watcher = MembershipWatcher::new(namespace.clone(), config());
        watcher.start().await.unwrap();
        assert_eq!(namespace.session_count(), 1);

        watcher.stop().await;

        assert_eq!(namespace.session_count(), 0);
        assert!(watcher.urls().is_empty());
        assert!(!watcher.is_watching().await);
    }

    #[tokio::test]
    async fn test_start_again_after_watch_lost() {
        let namespace = InMemoryNamespace::new();
        namespace.put_persistent(&path("a"), b"host1:8080");

        let watcher = MembershipWatcher::new(namespace.clone(), config());
        watcher.start().await.unwrap();

        namespace.set_available(false);
        assert!(namespace.expire_session(1));
        for _ in 0..200 {
            if !watcher.is_watching().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!watcher.is_watching().await);

        namespace.set_available(true);
        namespace.put_persistent(&path("b"), b"host2:8080");
        watcher.start().await.unwrap();

        assert!(watcher.is_watching().await);
        assert_eq!(
            *watcher.urls(),
            vec!["http://host1:8080/remoting", "http://host2:8080/remoting"]
        );

        watcher.stop().await;
        assert_eq!(namespace.session_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnects_after_own_session_expires() {
        let namespace = InMemoryNamespace::new();
        namespace.put_persistent(&path("a"), b"host1:8080");

        let watcher = MembershipWatcher::new(namespace.clone(), config());
        watcher.start().await.unwrap();

        // The watcher holds the only session
        assert!(namespace.expire_session(1));
        namespace.put_persistent(&path("b"), b"host2:8080");

        eventually(|| watcher.urls().len() == 2).await;
        eventually(|| namespace.session_count() == 1).await;

        watcher.stop().await;
        assert_eq!(namespace.session_count(), 0);
    }
}
