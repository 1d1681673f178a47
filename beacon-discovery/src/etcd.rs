//! etcd coordination backend
//!
//! A session is an etcd lease. Ephemeral records are keys attached to the
//! lease, which a background task keeps alive at a third of its TTL. When
//! the process stops refreshing it (crash, partition) the lease expires and
//! etcd deletes the keys, which is how session expiry surfaces here.
//!
//! Child watches read the prefix at revision `R`, replay it as additions and
//! then watch from `R + 1` with previous values, so removals carry the last
//! payload.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, Event, EventType, GetOptions, LeaseKeepAliveStream,
    LeaseKeeper, PutOptions, Txn, TxnOp, WatchOptions, WatchStream, Watcher,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tonic::Code;
use tracing::{debug, error, info, trace, warn};

use crate::session::{
    is_direct_child, ChildEvent, ChildEventKind, ChildRecord, ChildWatch, Connector,
    CoordinationSession, DiscoveryError,
};
use crate::settings::ConnectionSettings;

impl From<etcd_client::Error> for DiscoveryError {
    fn from(e: etcd_client::Error) -> Self {
        match e {
            etcd_client::Error::TransportError(e) => DiscoveryError::ConnectionLoss(e.to_string()),
            etcd_client::Error::GRpcStatus(status) => match status.code() {
                // Leader elections and member restarts surface as these
                Code::Unavailable | Code::Cancelled => {
                    DiscoveryError::ConnectionLoss(status.message().to_string())
                }
                Code::DeadlineExceeded => DiscoveryError::Timeout(Duration::ZERO),
                _ => DiscoveryError::Backend(status.to_string()),
            },
            other => DiscoveryError::Backend(other.to_string()),
        }
    }
}

/// Lease TTL in whole seconds for a session timeout, at least one
pub fn lease_ttl_secs(session_timeout: Duration) -> i64 {
    let secs = session_timeout.as_millis().div_ceil(1000).max(1);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Keep-alive period for a lease TTL
pub fn keepalive_interval(ttl_secs: i64) -> Duration {
    let millis = u64::try_from(ttl_secs).unwrap_or(1).saturating_mul(1000) / 3;
    Duration::from_millis(millis.max(500))
}

fn event_kind(event_type: EventType, version: i64) -> ChildEventKind {
    match event_type {
        EventType::Put if version <= 1 => ChildEventKind::Added,
        EventType::Put => ChildEventKind::Updated,
        EventType::Delete => ChildEventKind::Removed,
    }
}

fn prefix_of(root: &str) -> String {
    format!("{}/", root.trim_end_matches('/'))
}

fn translate(root: &str, event: &Event) -> Option<ChildEvent> {
    let kv = event.kv()?;
    let path = kv.key_str().ok()?;
    if !is_direct_child(root, path) {
        return None;
    }

    let kind = event_kind(event.event_type(), kv.version());
    let data = match kind {
        // Delete events carry no value, only the previous key-value
        ChildEventKind::Removed => event.prev_kv().map(|prev| prev.value().to_vec()),
        _ => Some(kv.value().to_vec()),
    };

    Some(ChildEvent {
        kind,
        record: ChildRecord::new(path, data),
    })
}

/// Opens lease-backed sessions against an etcd cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct EtcdConnector;

impl EtcdConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for EtcdConnector {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn CoordinationSession>, DiscoveryError> {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(settings.connect_timeout)
            .with_timeout(settings.session_timeout);
        if let Some(credential) = &settings.credential {
            options = options.with_user(credential.user(), credential.secret());
        }

        let mut client = Client::connect(settings.ensemble.as_slice(), Some(options)).await?;

        let ttl = lease_ttl_secs(settings.session_timeout);
        let lease = client.lease_grant(ttl, None).await?.id();
        debug!(lease_id = lease, ttl, "Lease granted");

        let (keeper, stream) = client.lease_keep_alive(lease).await?;
        let (ended, _) = watch::channel(false);
        let ended = Arc::new(ended);
        let keepalive = spawn_keepalive_task(
            keeper,
            stream,
            lease,
            keepalive_interval(ttl),
            Arc::clone(&ended),
        );

        Ok(Arc::new(EtcdSession {
            client,
            lease,
            keepalive,
            pumps: Mutex::new(Vec::new()),
            ended,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Refresh the lease until the session ends; flag the session as ended if
/// the lease can no longer be kept alive.
fn spawn_keepalive_task(
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
    lease_id: i64,
    period: Duration,
    ended: Arc<watch::Sender<bool>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;

        loop {
            interval.tick().await;

            if let Err(e) = keeper.keep_alive().await {
                error!(lease_id, error = %e, "Keep-alive send failed");
                break;
            }

            match stream.message().await {
                Ok(Some(resp)) if resp.ttl() > 0 => {
                    trace!(lease_id, ttl = resp.ttl(), "Keep-alive OK");
                }
                Ok(Some(_)) => {
                    error!(lease_id, "Lease expired");
                    break;
                }
                Ok(None) => {
                    error!(lease_id, "Keep-alive stream closed");
                    break;
                }
                Err(e) => {
                    error!(lease_id, error = %e, "Keep-alive failed");
                    break;
                }
            }
        }

        ended.send_replace(true);
    })
}

/// Forward watch responses into a child watch until the session ends or
/// the receiver goes away.
async fn pump(
    root: String,
    mut watcher: Watcher,
    mut stream: WatchStream,
    tx: mpsc::UnboundedSender<ChildEvent>,
    mut ended: watch::Receiver<bool>,
) {
    'outer: loop {
        tokio::select! {
            _ = ended.changed() => break,
            _ = tx.closed() => break,
            message = stream.message() => match message {
                Ok(Some(resp)) => {
                    if resp.canceled() {
                        warn!(root = %root, "Watch canceled by server");
                        break;
                    }
                    for event in resp.events() {
                        if let Some(event) = translate(&root, event) {
                            if tx.send(event).is_err() {
                                break 'outer;
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(root = %root, error = %e, "Watch stream failed");
                    break;
                }
            }
        }
    }

    if let Err(e) = watcher.cancel().await {
        debug!(root = %root, error = %e, "Failed to cancel watch");
    }
}

/// Lease-backed session
pub struct EtcdSession {
    client: Client,
    lease: i64,
    keepalive: JoinHandle<()>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    ended: Arc<watch::Sender<bool>>,
    closed: AtomicBool,
}

impl EtcdSession {
    pub fn lease_id(&self) -> i64 {
        self.lease
    }

    fn client(&self) -> Result<Client, DiscoveryError> {
        if *self.ended.borrow() {
            return Err(DiscoveryError::SessionClosed);
        }
        Ok(self.client.clone())
    }

    fn stop_tasks(&self) {
        self.keepalive.abort();
        for task in self.pumps.lock().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl CoordinationSession for EtcdSession {
    fn id(&self) -> String {
        format!("{:x}", self.lease)
    }

    async fn exists(&self, path: &str) -> Result<bool, DiscoveryError> {
        let resp = self
            .client()?
            .get(path, Some(GetOptions::new().with_count_only()))
            .await?;
        Ok(resp.count() > 0)
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<(), DiscoveryError> {
        let txn = Txn::new()
            .when([Compare::create_revision(path, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(
                path,
                data,
                Some(PutOptions::new().with_lease(self.lease)),
            )]);

        if self.client()?.txn(txn).await?.succeeded() {
            Ok(())
        } else {
            Err(DiscoveryError::NodeExists(path.to_string()))
        }
    }

    async fn create_persistent(&self, path: &str, data: &[u8]) -> Result<(), DiscoveryError> {
        let txn = Txn::new()
            .when([Compare::create_revision(path, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(path, data, None)]);

        if self.client()?.txn(txn).await?.succeeded() {
            Ok(())
        } else {
            Err(DiscoveryError::NodeExists(path.to_string()))
        }
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), DiscoveryError> {
        let txn = Txn::new()
            .when([Compare::create_revision(path, CompareOp::Greater, 0)])
            .and_then([TxnOp::put(
                path,
                data,
                Some(PutOptions::new().with_ignore_lease()),
            )]);

        if self.client()?.txn(txn).await?.succeeded() {
            Ok(())
        } else {
            Err(DiscoveryError::NoNode(path.to_string()))
        }
    }

    async fn delete(&self, path: &str) -> Result<(), DiscoveryError> {
        if self.client()?.delete(path, None).await?.deleted() > 0 {
            Ok(())
        } else {
            Err(DiscoveryError::NoNode(path.to_string()))
        }
    }

    async fn list_children(&self, root: &str) -> Result<Vec<ChildRecord>, DiscoveryError> {
        let resp = self
            .client()?
            .get(prefix_of(root), Some(GetOptions::new().with_prefix()))
            .await?;

        Ok(resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                let path = kv.key_str().ok()?;
                is_direct_child(root, path)
                    .then(|| ChildRecord::new(path, Some(kv.value().to_vec())))
            })
            .collect())
    }

    async fn watch_children(&self, root: &str) -> Result<ChildWatch, DiscoveryError> {
        let mut client = self.client()?;
        let prefix = prefix_of(root);

        let listing = client
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = listing.header().map(|h| h.revision()).unwrap_or(0);

        let (tx, rx) = mpsc::unbounded_channel();
        for kv in listing.kvs() {
            let Ok(path) = kv.key_str() else { continue };
            if is_direct_child(root, path) {
                let _ = tx.send(ChildEvent::added(path, Some(kv.value().to_vec())));
            }
        }

        let options = WatchOptions::new()
            .with_prefix()
            .with_prev_key()
            .with_start_revision(revision + 1);
        let (watcher, stream) = client.watch(prefix.as_str(), Some(options)).await?;
        debug!(root = %root, revision, "Watch established");

        let task = tokio::spawn(pump(
            root.to_string(),
            watcher,
            stream,
            tx,
            self.ended.subscribe(),
        ));

        let mut pumps = self.pumps.lock();
        pumps.retain(|task| !task.is_finished());
        pumps.push(task);

        Ok(rx)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.ended.send_replace(true);
        self.stop_tasks();

        let mut client = self.client.clone();
        match client.lease_revoke(self.lease).await {
            Ok(_) => info!(lease_id = self.lease, "Lease revoked"),
            Err(e) => warn!(
                lease_id = self.lease,
                error = %e,
                "Failed to revoke lease, records expire with it"
            ),
        }
    }
}

impl Drop for EtcdSession {
    fn drop(&mut self) {
        // Without a revoke the lease runs out on its own
        self.stop_tasks();
    }
}
