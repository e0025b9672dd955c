//! Failure Notifier
//!
//! Rate-limited operator alerting. One alert per failure episode: the first
//! failure after a period of success triggers a mail, consecutive failures
//! of the same open episode are suppressed until recovery or until the
//! cooldown window elapses. Mail delivery itself belongs to an external
//! collaborator behind [`MailTransport`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::error::TokenManagerError;
use crate::types::RefreshAttempt;

/// Outbound mail hand-off. The token manager decides when to alert, not how
/// mail is transported.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<(), TokenManagerError>;
}

#[derive(Default)]
struct EpisodeState {
    open: bool,
    last_alert_at: Option<DateTime<Utc>>,
}

/// Episode-scoped failure alerting for all identities.
pub struct FailureNotifier {
    mail: Arc<dyn MailTransport>,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
    episodes: Mutex<HashMap<String, EpisodeState>>,
}

impl FailureNotifier {
    pub fn new(mail: Arc<dyn MailTransport>, clock: Arc<dyn Clock>, cooldown: Duration) -> Self {
        Self {
            mail,
            clock,
            cooldown,
            episodes: Mutex::new(HashMap::new()),
        }
    }

    /// Close the failure episode for an identity after a successful refresh.
    /// The next failure opens a new episode and alerts again.
    pub fn record_success(&self, identity: &str) {
        let mut episodes = self.episodes.lock().unwrap();
        if episodes.remove(identity).map(|e| e.open).unwrap_or(false) {
            info!(identity, "failure episode closed after successful refresh");
        }
    }

    /// Report a refresh failure. Sends at most one alert per episode, with a
    /// repeat alert only once the cooldown elapses while the episode stays
    /// open. Delivery failures are logged, never propagated.
    pub async fn notify_failure(
        &self,
        identity: &str,
        failure: &TokenManagerError,
        attempts: &[RefreshAttempt],
    ) {
        let now = self.clock.now();
        let due = {
            let mut episodes = self.episodes.lock().unwrap();
            let episode = episodes.entry(identity.to_string()).or_default();

            let cooldown_elapsed = match (episode.last_alert_at, chrono::Duration::from_std(self.cooldown)) {
                (Some(last), Ok(cooldown)) => now - last >= cooldown,
                (Some(_), Err(_)) => false,
                (None, _) => true,
            };
            let due = !episode.open || cooldown_elapsed;

            episode.open = true;
            if due {
                episode.last_alert_at = Some(now);
            }
            due
        };

        if !due {
            debug!(identity, "alert suppressed for open failure episode");
            return;
        }

        let subject = format!("[token-manager] credential refresh failing for {identity}");
        let body = build_alert_body(identity, failure, attempts);

        match self.mail.send(&subject, &body).await {
            Ok(()) => info!(identity, "failure alert sent"),
            Err(e) => error!(identity, error = %e, "failed to deliver failure alert"),
        }
    }
}

fn build_alert_body(
    identity: &str,
    failure: &TokenManagerError,
    attempts: &[RefreshAttempt],
) -> String {
    let mut body = format!(
        "Token refresh is failing for identity '{identity}'.\n\nLatest error: {failure}\n"
    );
    if !attempts.is_empty() {
        body.push_str("\nAttempt history:\n");
        for attempt in attempts {
            body.push_str(&format!("  attempt {}: {}\n", attempt.attempt + 1, attempt.error));
        }
    }
    if failure.is_terminal() {
        body.push_str(
            "\nThe provider rejected the refresh grant. Manual re-authorization is required.\n",
        );
    } else {
        body.push_str("\nThe identity will be retried automatically.\n");
    }
    body
}

/// Mock mail transport for testing.
#[derive(Default)]
pub struct MockMailTransport {
    sent: Mutex<Vec<(String, String)>>,
    fail_sends: Mutex<bool>,
}

impl MockMailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get delivered (subject, body) pairs.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Make delivery fail.
    pub fn set_fail_sends(&self, fail: bool) -> &Self {
        *self.fail_sends.lock().unwrap() = fail;
        self
    }
}

#[async_trait]
impl MailTransport for MockMailTransport {
    async fn send(&self, subject: &str, body: &str) -> Result<(), TokenManagerError> {
        if *self.fail_sends.lock().unwrap() {
            return Err(TokenManagerError::Internal {
                message: "mock mail failure".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }
}
