//! CoordinationClient bootstrap
//!
//! Builds a session from resolved [`ConnectionSettings`] and runs every
//! operation under the finite, fixed-interval retry policy. Transient
//! failures (connection loss, timeouts) are retried; anything else is
//! returned to the caller immediately.

use backoff::future::retry_notify;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::session::{
    ChildRecord, ChildWatch, Connector, CoordinationSession, DiscoveryError,
};
use crate::settings::{ConnectionSettings, RetryPolicy};

/// A connected client owning one coordination session.
pub struct CoordinationClient {
    session: Arc<dyn CoordinationSession>,
    retry: RetryPolicy,
    closed: AtomicBool,
}

impl CoordinationClient {
    /// Connect, retrying under `settings.retry`.
    ///
    /// Each attempt is bounded by `settings.connect_timeout`. Once the retry
    /// budget is exhausted the last error is returned.
    pub async fn connect<C>(
        connector: &C,
        settings: &ConnectionSettings,
    ) -> Result<Self, DiscoveryError>
    where
        C: Connector + ?Sized,
    {
        let ensemble = settings.ensemble_string();
        debug!(
            ensemble = %ensemble,
            connect_timeout_ms = settings.connect_timeout.as_millis() as u64,
            session_timeout_ms = settings.session_timeout.as_millis() as u64,
            max_retries = settings.retry.max_retries,
            authenticated = settings.credential.is_some(),
            "Connecting to coordination service"
        );

        let session = with_retry("connect", settings.retry, move || async move {
            match tokio::time::timeout(settings.connect_timeout, connector.connect(settings)).await
            {
                Ok(result) => result,
                Err(_) => Err(DiscoveryError::Timeout(settings.connect_timeout)),
            }
        })
        .await?;

        info!(ensemble = %ensemble, session = %session.id(), "Connected to coordination service");

        Ok(Self::from_session(session, settings.retry))
    }

    /// Wrap an already established session
    pub fn from_session(session: Arc<dyn CoordinationSession>, retry: RetryPolicy) -> Self {
        Self {
            session,
            retry,
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> String {
        self.session.id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn exists(&self, path: &str) -> Result<bool, DiscoveryError> {
        self.ensure_open()?;
        with_retry("exists", self.retry, move || self.session.exists(path)).await
    }

    pub async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<(), DiscoveryError> {
        self.ensure_open()?;
        with_retry("create", self.retry, move || {
            self.session.create_ephemeral(path, data)
        })
        .await
    }

    pub async fn create_persistent(&self, path: &str, data: &[u8]) -> Result<(), DiscoveryError> {
        self.ensure_open()?;
        with_retry("create", self.retry, move || {
            self.session.create_persistent(path, data)
        })
        .await
    }

    pub async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), DiscoveryError> {
        self.ensure_open()?;
        with_retry("set_data", self.retry, move || self.session.set_data(path, data)).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), DiscoveryError> {
        self.ensure_open()?;
        with_retry("delete", self.retry, move || self.session.delete(path)).await
    }

    pub async fn list_children(&self, root: &str) -> Result<Vec<ChildRecord>, DiscoveryError> {
        self.ensure_open()?;
        with_retry("list_children", self.retry, move || {
            self.session.list_children(root)
        })
        .await
    }

    pub async fn watch_children(&self, root: &str) -> Result<ChildWatch, DiscoveryError> {
        self.ensure_open()?;
        with_retry("watch_children", self.retry, move || {
            self.session.watch_children(root)
        })
        .await
    }

    /// Close the session. Later operations fail with `SessionClosed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.session.close().await;
        info!(session = %self.session.id(), "Closed coordination session");
    }

    fn ensure_open(&self) -> Result<(), DiscoveryError> {
        if self.is_closed() {
            Err(DiscoveryError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for CoordinationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationClient")
            .field("session", &self.session.id())
            .field("retry", &self.retry)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Run `op` until it succeeds, fails permanently or the policy runs out.
async fn with_retry<T, F, Fut>(
    operation: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, DiscoveryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DiscoveryError>>,
{
    retry_notify(
        policy.backoff(),
        || {
            let attempt = op();
            async move {
                attempt.await.map_err(|e| {
                    if e.is_transient() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |e: DiscoveryError, delay: Duration| {
            warn!(
                operation = operation,
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Coordination operation failed, retrying"
            );
        },
    )
    .await
}
