//! Refresh Coordinator
//!
//! Single-flight, retrying token refresh per identity. The refresh critical
//! section (network call plus disk write) is serialized by a per-identity
//! async mutex; a caller arriving while a refresh is in flight waits on the
//! same lock and adopts the winner's outcome instead of issuing a duplicate
//! network call, since some providers invalidate the prior refresh grant on
//! concurrent use.

use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, Sleeper};
use crate::config::RetryConfig;
use crate::error::{
    classify_refresh_failure, TerminalRefreshError, TokenManagerError, TransientRefreshError,
};
use crate::notifier::FailureNotifier;
use crate::store::TokenStore;
use crate::transport::{HttpRequest, HttpTransport};
use crate::types::{RefreshAttempt, TokenRecord, TokenResponse, TokenState, TokenStatus};
use crate::validator::is_fresh;

#[derive(Default)]
struct IdentityRuntime {
    record: Option<TokenRecord>,
    state: TokenState,
    last_error: Option<String>,
    // Bumped whenever a refresh cycle completes, so a waiter can tell that
    // the lock holder finished on its behalf.
    refresh_epoch: u64,
}

/// Per-identity registry entry: the refresh lock plus the cached runtime
/// state. Reads of an already-fresh record touch only the runtime mutex,
/// never the refresh lock.
pub struct IdentityEntry {
    identity: String,
    refresh_lock: tokio::sync::Mutex<()>,
    runtime: Mutex<IdentityRuntime>,
}

impl IdentityEntry {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            refresh_lock: tokio::sync::Mutex::new(()),
            runtime: Mutex::new(IdentityRuntime::default()),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> TokenState {
        self.runtime.lock().unwrap().state
    }

    pub fn cached_record(&self) -> Option<TokenRecord> {
        self.runtime.lock().unwrap().record.clone()
    }

    /// Read-only status snapshot for health checks.
    pub fn status(&self) -> TokenStatus {
        let rt = self.runtime.lock().unwrap();
        TokenStatus {
            state: rt.state,
            last_refreshed_at: rt.record.as_ref().and_then(|r| r.last_refreshed_at),
            last_error: rt.last_error.clone(),
        }
    }

    /// Cache a freshly loaded record.
    pub(crate) fn install_record(&self, record: TokenRecord, state: TokenState) {
        let mut rt = self.runtime.lock().unwrap();
        rt.last_error = record.last_error.clone();
        rt.record = Some(record);
        rt.state = state;
    }

    /// Cache a loaded record unless a refresh filled the cache in the
    /// meantime; the cached copy is never older than the disk read.
    pub(crate) fn install_record_if_absent(&self, record: TokenRecord, state: TokenState) {
        let mut rt = self.runtime.lock().unwrap();
        if rt.record.is_none() {
            rt.last_error = record.last_error.clone();
            rt.record = Some(record);
            rt.state = state;
        }
    }

    pub(crate) fn set_state(&self, state: TokenState) {
        self.runtime.lock().unwrap().state = state;
    }

    fn epoch(&self) -> u64 {
        self.runtime.lock().unwrap().refresh_epoch
    }

    fn complete_success(&self, record: TokenRecord) {
        let mut rt = self.runtime.lock().unwrap();
        rt.record = Some(record);
        rt.state = TokenState::Fresh;
        rt.last_error = None;
        rt.refresh_epoch += 1;
    }

    fn complete_failed(&self, error: String) {
        let mut rt = self.runtime.lock().unwrap();
        rt.state = TokenState::Failed;
        rt.last_error = Some(error);
        rt.refresh_epoch += 1;
    }

    fn complete_dead(&self, error: String) {
        let mut rt = self.runtime.lock().unwrap();
        rt.state = TokenState::Dead;
        rt.last_error = Some(error);
        rt.refresh_epoch += 1;
    }
}

/// Single-flight refresh executor shared by the reactive path and the
/// background monitor.
pub struct RefreshCoordinator {
    store: Arc<dyn TokenStore>,
    transport: Arc<dyn HttpTransport>,
    notifier: Arc<FailureNotifier>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    retry: RetryConfig,
    http_timeout: Duration,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn TokenStore>,
        transport: Arc<dyn HttpTransport>,
        notifier: Arc<FailureNotifier>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        retry: RetryConfig,
        http_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            notifier,
            clock,
            sleeper,
            retry,
            http_timeout,
        }
    }

    /// Refresh the identity unless a fresh record (for the given lead time)
    /// is already cached. Returns the refreshed record on success, the
    /// last-known-good record after retryable exhaustion, and an error only
    /// when no usable credential exists.
    pub async fn refresh(
        &self,
        entry: &IdentityEntry,
        lead_time: Duration,
    ) -> Result<TokenRecord, TokenManagerError> {
        let epoch_before = entry.epoch();
        let _guard = entry.refresh_lock.lock().await;

        if entry.epoch() != epoch_before {
            // The previous lock holder completed a refresh cycle while we
            // waited; adopt its outcome.
            let rt = entry.runtime.lock().unwrap();
            match rt.state {
                TokenState::Dead => {
                    return Err(TokenManagerError::Terminal(
                        TerminalRefreshError::IdentityDead {
                            identity: entry.identity.clone(),
                        },
                    ))
                }
                _ => {
                    if let Some(record) = &rt.record {
                        return Ok(record.clone());
                    }
                }
            }
        }

        self.refresh_locked(entry, lead_time, false).await
    }

    /// Bypass the freshness check and refresh unconditionally, reloading the
    /// record from disk first. Reloading is what lets an operator recover a
    /// dead identity: the manual re-authorization flow writes a new file,
    /// and this picks it up.
    pub async fn force_refresh(
        &self,
        entry: &IdentityEntry,
    ) -> Result<TokenRecord, TokenManagerError> {
        let _guard = entry.refresh_lock.lock().await;

        let record = self.store.load(&entry.identity).await?;
        {
            let mut rt = entry.runtime.lock().unwrap();
            rt.record = Some(record);
            rt.state = TokenState::Stale;
            rt.last_error = None;
        }

        self.refresh_locked(entry, Duration::ZERO, true).await
    }

    /// The refresh cycle proper. Caller must hold `entry.refresh_lock`.
    async fn refresh_locked(
        &self,
        entry: &IdentityEntry,
        lead_time: Duration,
        force: bool,
    ) -> Result<TokenRecord, TokenManagerError> {
        let identity = entry.identity.clone();

        let current = {
            let rt = entry.runtime.lock().unwrap();
            if rt.state == TokenState::Dead {
                return Err(TokenManagerError::Terminal(
                    TerminalRefreshError::IdentityDead {
                        identity: identity.clone(),
                    },
                ));
            }
            match &rt.record {
                Some(record) => {
                    if !force && is_fresh(record, lead_time, self.clock.now()) {
                        return Ok(record.clone());
                    }
                    Some(record.clone())
                }
                None => None,
            }
        };

        let current = match current {
            Some(record) => record,
            None => {
                let record = self.store.load(&identity).await?;
                entry.install_record(record.clone(), TokenState::Stale);
                record
            }
        };

        entry.set_state(TokenState::Refreshing);

        let started = std::time::Instant::now();
        let mut attempts: Vec<RefreshAttempt> = Vec::new();
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 0..max_attempts {
            debug!(identity = %identity, attempt, "requesting token refresh");

            match self.execute_refresh(&current).await {
                Ok(response) => {
                    let mut updated = current.clone();
                    updated.apply_refresh(&response, self.clock.now());

                    if let Err(e) = self.persist(&identity, &updated).await {
                        error!(identity = %identity, error = %e, "failed to persist refreshed token");
                        entry.complete_failed(e.to_string());
                        return Err(e);
                    }

                    entry.complete_success(updated.clone());
                    self.notifier.record_success(&identity);
                    info!(
                        identity = %identity,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "token refreshed"
                    );
                    return Ok(updated);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        identity = %identity,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        error = %e,
                        "transient refresh failure"
                    );
                    attempts.push(RefreshAttempt {
                        attempt,
                        error: e.to_string(),
                    });

                    if attempt + 1 == max_attempts {
                        entry.complete_failed(e.to_string());
                        self.notifier.notify_failure(&identity, &e, &attempts).await;
                        warn!(
                            identity = %identity,
                            attempts = max_attempts,
                            "refresh attempts exhausted; serving last-known-good record"
                        );
                        return Ok(current);
                    }

                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(
                        identity = %identity,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "backing off before retry"
                    );
                    self.sleeper.sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        identity = %identity,
                        error = %e,
                        "terminal refresh failure; identity marked dead"
                    );
                    attempts.push(RefreshAttempt {
                        attempt,
                        error: e.to_string(),
                    });
                    entry.complete_dead(e.to_string());
                    self.notifier.notify_failure(&identity, &e, &attempts).await;
                    return Err(e);
                }
            }
        }

        Err(TokenManagerError::Internal {
            message: format!("refresh loop for {identity} ended without a verdict"),
        })
    }

    /// Back up the previous record, then atomically replace it.
    async fn persist(
        &self,
        identity: &str,
        record: &TokenRecord,
    ) -> Result<(), TokenManagerError> {
        self.store.backup(identity).await?;
        self.store.save(identity, record).await
    }

    /// One `grant_type=refresh_token` call against the record's endpoint.
    async fn execute_refresh(
        &self,
        record: &TokenRecord,
    ) -> Result<TokenResponse, TokenManagerError> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "refresh_token")
            .append_pair("refresh_token", &record.refresh_token)
            .append_pair("client_id", &record.client_id)
            .append_pair("client_secret", record.client_secret.expose_secret())
            .finish();

        let headers = [
            (
                "content-type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            ),
            ("accept".to_string(), "application/json".to_string()),
        ]
        .into_iter()
        .collect();

        let response = self
            .transport
            .post(HttpRequest {
                url: record.token_endpoint.clone(),
                headers,
                body,
                timeout: Some(self.http_timeout),
            })
            .await?;

        if response.status != 200 {
            return Err(classify_refresh_failure(response.status, &response.body));
        }

        serde_json::from_str(&response.body).map_err(|e| {
            TokenManagerError::Transient(TransientRefreshError::ServerError {
                status: response.status,
                message: format!("invalid token response: {e}"),
            })
        })
    }
}

/// Per-identity registry constructed once at startup.
pub fn build_registry(identities: &[String]) -> HashMap<String, Arc<IdentityEntry>> {
    identities
        .iter()
        .map(|identity| (identity.clone(), Arc::new(IdentityEntry::new(identity.clone()))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, RecordingSleeper};
    use crate::notifier::MockMailTransport;
    use crate::store::MockTokenStore;
    use crate::transport::MockHttpTransport;
    use chrono::Utc;
    use secrecy::SecretString;

    struct Harness {
        store: Arc<MockTokenStore>,
        transport: Arc<MockHttpTransport>,
        mail: Arc<MockMailTransport>,
        clock: Arc<ManualClock>,
        sleeper: Arc<RecordingSleeper>,
        coordinator: RefreshCoordinator,
    }

    fn harness() -> Harness {
        let store = Arc::new(MockTokenStore::new());
        let transport = Arc::new(MockHttpTransport::new());
        let mail = Arc::new(MockMailTransport::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sleeper = Arc::new(RecordingSleeper::new());
        let notifier = Arc::new(FailureNotifier::new(
            mail.clone(),
            clock.clone(),
            Duration::from_secs(3600),
        ));
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            transport.clone(),
            notifier,
            clock.clone(),
            sleeper.clone(),
            RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
            },
            Duration::from_secs(30),
        );
        Harness {
            store,
            transport,
            mail,
            clock,
            sleeper,
            coordinator,
        }
    }

    fn record_expiring_in(clock: &ManualClock, secs: i64) -> TokenRecord {
        TokenRecord {
            access_token: "access-old".to_string(),
            refresh_token: "refresh-old".to_string(),
            token_endpoint: "https://provider.example/token".to_string(),
            client_id: "client-1".to_string(),
            client_secret: SecretString::new("secret-1".to_string()),
            scopes: vec!["mail.send".to_string()],
            expiry: Some(clock.now() + chrono::Duration::seconds(secs)),
            last_refreshed_at: None,
            last_error: None,
        }
    }

    fn success_body() -> serde_json::Value {
        serde_json::json!({
            "access_token": "access-new",
            "token_type": "Bearer",
            "expires_in": 3600
        })
    }

    const LEAD: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn test_successful_refresh_persists_and_goes_fresh() {
        let h = harness();
        let entry = IdentityEntry::new("mail_send");
        entry.install_record(record_expiring_in(&h.clock, 60), TokenState::Stale);
        h.transport.queue_json_response(200, &success_body());

        let old_expiry = entry.cached_record().unwrap().expiry.unwrap();
        let refreshed = h.coordinator.refresh(&entry, LEAD).await.unwrap();

        assert_eq!(refreshed.access_token, "access-new");
        assert_eq!(refreshed.refresh_token, "refresh-old", "grant preserved");
        assert!(refreshed.expiry.unwrap() > old_expiry, "expiry advanced");
        assert_eq!(entry.state(), TokenState::Fresh);

        // Backup before save, exactly once each.
        assert_eq!(h.store.backups(), vec!["mail_send"]);
        assert_eq!(h.store.saves().len(), 1);
        assert!(h.mail.sent().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_record_short_circuits_without_network() {
        let h = harness();
        let entry = IdentityEntry::new("mail_send");
        entry.install_record(record_expiring_in(&h.clock, 7200), TokenState::Fresh);

        let record = h.coordinator.refresh(&entry, LEAD).await.unwrap();
        assert_eq!(record.access_token, "access-old");
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_response_without_lifetime_keeps_record_expiring() {
        let h = harness();
        let entry = IdentityEntry::new("mail_send");
        entry.install_record(record_expiring_in(&h.clock, 60), TokenState::Stale);
        let old_expiry = entry.cached_record().unwrap().expiry.unwrap();

        let body = serde_json::json!({"access_token": "access-new", "token_type": "Bearer"});
        h.transport.queue_json_response(200, &body);

        let refreshed = h.coordinator.refresh(&entry, LEAD).await.unwrap();
        assert_eq!(refreshed.access_token, "access-new");
        assert_eq!(refreshed.expiry, Some(old_expiry), "prior expiry kept");

        // Much later the record must still count as stale and refresh again
        // instead of being treated as never expiring.
        h.clock.advance(chrono::Duration::days(365));
        h.transport.queue_json_response(200, &body);
        let _ = h.coordinator.refresh(&entry, LEAD).await.unwrap();
        assert_eq!(h.transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_loads_record_when_not_cached() {
        let h = harness();
        let entry = IdentityEntry::new("mail_send");
        h.store
            .add_record("mail_send", record_expiring_in(&h.clock, 60));
        h.transport.queue_json_response(200, &success_body());

        let refreshed = h.coordinator.refresh(&entry, LEAD).await.unwrap();
        assert_eq!(refreshed.access_token, "access-new");
    }

    #[tokio::test]
    async fn test_concurrent_callers_trigger_one_network_call() {
        let h = harness();
        let entry = Arc::new(IdentityEntry::new("mail_send"));
        entry.install_record(record_expiring_in(&h.clock, 60), TokenState::Stale);
        h.transport.set_response_delay(Duration::from_millis(100));
        h.transport.set_default_response(crate::transport::HttpResponse {
            status: 200,
            headers: Default::default(),
            body: success_body().to_string(),
        });

        let coordinator = Arc::new(h.coordinator);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let entry = entry.clone();
            tasks.push(tokio::spawn(async move {
                coordinator.refresh(&entry, LEAD).await
            }));
        }

        for task in tasks {
            let record = task.await.unwrap().unwrap();
            assert_eq!(record.access_token, "access-new");
        }
        assert_eq!(h.transport.requests().len(), 1, "single-flight violated");
    }

    #[tokio::test]
    async fn test_transient_exhaustion_fails_soft() {
        let h = harness();
        let entry = IdentityEntry::new("mail_send");
        entry.install_record(record_expiring_in(&h.clock, 60), TokenState::Stale);
        h.transport.set_default_response(crate::transport::HttpResponse {
            status: 503,
            headers: Default::default(),
            body: "overloaded".to_string(),
        });

        let record = h.coordinator.refresh(&entry, LEAD).await.unwrap();

        // Last-known-good record is served, not an error.
        assert_eq!(record.access_token, "access-old");
        assert_eq!(entry.state(), TokenState::Failed);
        assert_eq!(h.transport.requests().len(), 3);
        // Deterministic backoff between attempts, none after the last.
        assert_eq!(
            h.sleeper.requested(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        // Exactly one notification for the whole episode.
        assert_eq!(h.mail.sent().len(), 1);
        assert!(entry.status().last_error.is_some());
        assert!(h.store.saves().is_empty(), "nothing persisted on failure");
    }

    #[tokio::test]
    async fn test_failed_identity_retries_on_next_call() {
        let h = harness();
        let entry = IdentityEntry::new("mail_send");
        entry.install_record(record_expiring_in(&h.clock, 60), TokenState::Stale);
        h.transport.set_default_response(crate::transport::HttpResponse {
            status: 503,
            headers: Default::default(),
            body: "overloaded".to_string(),
        });

        let _ = h.coordinator.refresh(&entry, LEAD).await.unwrap();
        assert_eq!(entry.state(), TokenState::Failed);

        // Provider recovers; the next refresh succeeds and clears the error.
        h.transport.queue_json_response(200, &success_body());
        let record = h.coordinator.refresh(&entry, LEAD).await.unwrap();
        assert_eq!(record.access_token, "access-new");
        assert_eq!(entry.state(), TokenState::Fresh);
        assert!(entry.status().last_error.is_none());
    }

    #[tokio::test]
    async fn test_invalid_grant_is_dead_immediately() {
        let h = harness();
        let entry = IdentityEntry::new("mail_send");
        entry.install_record(record_expiring_in(&h.clock, 60), TokenState::Stale);
        h.transport.queue_response(crate::transport::HttpResponse {
            status: 400,
            headers: Default::default(),
            body: r#"{"error":"invalid_grant","error_description":"revoked"}"#.to_string(),
        });

        let error = h.coordinator.refresh(&entry, LEAD).await.unwrap_err();
        assert!(error.is_terminal());
        assert_eq!(entry.state(), TokenState::Dead);
        assert_eq!(h.transport.requests().len(), 1, "no retries after terminal");
        assert!(h.sleeper.requested().is_empty());
        assert_eq!(h.mail.sent().len(), 1);

        // Dead stays dead: no further network traffic.
        let error = h.coordinator.refresh(&entry, LEAD).await.unwrap_err();
        assert!(matches!(
            error,
            TokenManagerError::Terminal(TerminalRefreshError::IdentityDead { .. })
        ));
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_reloads_from_disk_and_recovers_dead() {
        let h = harness();
        let entry = IdentityEntry::new("mail_send");
        entry.install_record(record_expiring_in(&h.clock, 60), TokenState::Stale);
        h.transport.queue_response(crate::transport::HttpResponse {
            status: 400,
            headers: Default::default(),
            body: r#"{"error":"invalid_grant"}"#.to_string(),
        });
        let _ = h.coordinator.refresh(&entry, LEAD).await.unwrap_err();
        assert_eq!(entry.state(), TokenState::Dead);

        // Operator re-authorizes out of band: a new record lands on disk.
        let mut reauthorized = record_expiring_in(&h.clock, 60);
        reauthorized.refresh_token = "refresh-reissued".to_string();
        h.store.add_record("mail_send", reauthorized);
        h.transport.queue_json_response(200, &success_body());

        let record = h.coordinator.force_refresh(&entry).await.unwrap();
        assert_eq!(record.access_token, "access-new");
        assert_eq!(record.refresh_token, "refresh-reissued");
        assert_eq!(entry.state(), TokenState::Fresh);
    }

    #[tokio::test]
    async fn test_force_refresh_ignores_freshness() {
        let h = harness();
        let entry = IdentityEntry::new("mail_send");
        let record = record_expiring_in(&h.clock, 7200);
        h.store.add_record("mail_send", record.clone());
        entry.install_record(record, TokenState::Fresh);
        h.transport.queue_json_response(200, &success_body());

        let refreshed = h.coordinator.force_refresh(&entry).await.unwrap();
        assert_eq!(refreshed.access_token, "access-new");
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces_and_marks_failed() {
        let h = harness();
        let entry = IdentityEntry::new("mail_send");
        entry.install_record(record_expiring_in(&h.clock, 60), TokenState::Stale);
        h.store.set_fail_saves(true);
        h.transport.queue_json_response(200, &success_body());

        let error = h.coordinator.refresh(&entry, LEAD).await.unwrap_err();
        assert!(matches!(error, TokenManagerError::Storage(_)));
        assert_eq!(entry.state(), TokenState::Failed);
    }
}
