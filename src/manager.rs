//! Token Manager Facade
//!
//! The only API surface consumers use. Holds the per-identity registry,
//! constructed once at startup and injected into consumers; there is no
//! process-wide singleton.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::{Clock, Sleeper, SystemClock, TokioSleeper};
use crate::config::ManagerConfig;
use crate::error::{TerminalRefreshError, TokenManagerError};
use crate::notifier::{FailureNotifier, MailTransport};
use crate::refresh::{build_registry, IdentityEntry, RefreshCoordinator};
use crate::store::{FileTokenStore, TokenStore};
use crate::transport::{HttpTransport, ReqwestHttpTransport};
use crate::types::{Credential, TokenState, TokenStatus};
use crate::validator::is_fresh;

/// Credential facade for mail and calendar consumers.
pub struct TokenManager {
    config: ManagerConfig,
    registry: HashMap<String, Arc<IdentityEntry>>,
    coordinator: Arc<RefreshCoordinator>,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
}

impl TokenManager {
    pub fn new(
        config: ManagerConfig,
        identities: Vec<String>,
        store: Arc<dyn TokenStore>,
        transport: Arc<dyn HttpTransport>,
        mail: Arc<dyn MailTransport>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let notifier = Arc::new(FailureNotifier::new(
            mail,
            clock.clone(),
            config.notify_cooldown,
        ));
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            transport,
            notifier,
            clock.clone(),
            sleeper,
            config.retry.clone(),
            config.http_timeout,
        );
        Self {
            registry: build_registry(&identities),
            config,
            coordinator: Arc::new(coordinator),
            store,
            clock,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Registered identities, sorted.
    pub fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.registry.keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Get usable credentials for an identity, refreshing when the cached
    /// record is inside the lead-time window.
    ///
    /// Degrades gracefully: after retryable exhaustion the last-known-good
    /// credential is returned, so callers whose token has not actually
    /// expired keep operating. Errors only when no usable credential exists:
    /// unknown identity, unreadable record, or a dead grant.
    pub async fn get_credentials(&self, identity: &str) -> Result<Credential, TokenManagerError> {
        let entry = self.entry(identity)?;
        self.ensure_loaded(entry).await?;

        if entry.state() == TokenState::Dead {
            return Err(TokenManagerError::Terminal(
                TerminalRefreshError::IdentityDead {
                    identity: identity.to_string(),
                },
            ));
        }

        // Fast path: an already-fresh cached record needs no lock.
        if let Some(record) = entry.cached_record() {
            if is_fresh(&record, self.config.reactive_lead_time, self.clock.now()) {
                return Ok(Credential::from_record(identity, &record));
            }
        }

        let record = self
            .coordinator
            .refresh(entry, self.config.reactive_lead_time)
            .await?;
        Ok(Credential::from_record(identity, &record))
    }

    /// Operator-triggered recovery: reload the on-disk record and refresh
    /// unconditionally. Returns whether a fresh credential was obtained.
    pub async fn force_refresh(&self, identity: &str) -> Result<bool, TokenManagerError> {
        let entry = self.entry(identity)?;
        match self.coordinator.force_refresh(entry).await {
            Ok(_) => Ok(entry.state() == TokenState::Fresh),
            Err(e @ TokenManagerError::Load(_)) => Err(e),
            Err(e) => {
                warn!(identity, error = %e, "forced refresh failed");
                Ok(false)
            }
        }
    }

    /// Read-only identity status for health checks. A missing or unreadable
    /// record is reported as a stale status carrying the error rather than
    /// raised, so observing never fails for a registered identity.
    pub async fn status(&self, identity: &str) -> Result<TokenStatus, TokenManagerError> {
        let entry = self.entry(identity)?;
        if let Err(e) = self.ensure_loaded(entry).await {
            return Ok(TokenStatus {
                state: TokenState::Stale,
                last_refreshed_at: None,
                last_error: Some(e.to_string()),
            });
        }

        let mut status = entry.status();
        // Fresh and stale are a function of the clock, not of events; report
        // them against the current time.
        if matches!(status.state, TokenState::Fresh | TokenState::Stale) {
            if let Some(record) = entry.cached_record() {
                status.state =
                    if is_fresh(&record, self.config.reactive_lead_time, self.clock.now()) {
                        TokenState::Fresh
                    } else {
                        TokenState::Stale
                    };
            }
        }
        Ok(status)
    }

    /// One proactive pass over all identities, refreshing those stale under
    /// the monitor lead time. A failure on one identity never stops the
    /// sweep over the rest. The sweep stops waiting on a slow refresh after
    /// a timeout, but the refresh itself runs to completion on its own task,
    /// so a hung provider call can neither wedge the sweep nor strand the
    /// identity mid-refresh.
    pub async fn proactive_sweep(&self) {
        for (identity, entry) in &self.registry {
            if entry.state() == TokenState::Dead {
                debug!(identity = %identity, "sweep skipping dead identity");
                continue;
            }

            if entry.cached_record().is_none() {
                if let Err(e) = self.ensure_loaded(entry).await {
                    warn!(identity = %identity, error = %e, "sweep could not load record");
                    continue;
                }
            }
            let Some(record) = entry.cached_record() else {
                continue;
            };
            if is_fresh(&record, self.config.monitor_lead_time, self.clock.now()) {
                continue;
            }

            // Timeout only the wait. Cancelling the refresh future itself
            // could drop a rotated refresh grant between the provider call
            // and the persist, or leave the entry stuck at refreshing.
            let coordinator = self.coordinator.clone();
            let task_entry = entry.clone();
            let lead = self.config.monitor_lead_time;
            let task = tokio::spawn(async move { coordinator.refresh(&task_entry, lead).await });
            match tokio::time::timeout(self.config.monitor_refresh_timeout, task).await {
                Ok(Ok(Ok(_))) => debug!(identity = %identity, "proactive refresh completed"),
                Ok(Ok(Err(e))) => {
                    warn!(identity = %identity, error = %e, "proactive refresh failed")
                }
                Ok(Err(e)) => warn!(identity = %identity, error = %e, "proactive refresh task failed"),
                Err(_) => warn!(
                    identity = %identity,
                    timeout_ms = self.config.monitor_refresh_timeout.as_millis() as u64,
                    "proactive refresh still running; sweep moving on"
                ),
            }
        }
    }

    fn entry(&self, identity: &str) -> Result<&Arc<IdentityEntry>, TokenManagerError> {
        self.registry
            .get(identity)
            .ok_or_else(|| TokenManagerError::UnknownIdentity {
                identity: identity.to_string(),
            })
    }

    async fn ensure_loaded(&self, entry: &IdentityEntry) -> Result<(), TokenManagerError> {
        if entry.cached_record().is_some() {
            return Ok(());
        }
        let record = self.store.load(entry.identity()).await?;
        let state = if is_fresh(&record, self.config.reactive_lead_time, self.clock.now()) {
            TokenState::Fresh
        } else {
            TokenState::Stale
        };
        entry.install_record_if_absent(record, state);
        Ok(())
    }
}

/// Wire a production token manager over a token directory, registering every
/// identity that has a record file.
pub async fn create_token_manager(
    config: ManagerConfig,
    token_dir: impl Into<PathBuf>,
    mail: Arc<dyn MailTransport>,
) -> Result<Arc<TokenManager>, TokenManagerError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(FileTokenStore::new(
        token_dir,
        config.backup_retention,
        clock.clone(),
    ));
    let identities = store.list_identities().await?;
    let transport = Arc::new(ReqwestHttpTransport::new(config.http_timeout));

    Ok(Arc::new(TokenManager::new(
        config,
        identities,
        store,
        transport,
        mail,
        clock,
        Arc::new(TokioSleeper),
    )))
}
