//! Background Monitor
//!
//! Periodic proactive refresh loop. Runs one sweep per tick over every
//! registered identity, using the larger monitor lead time so tokens are
//! renewed well before any consumer would notice them going stale.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::manager::TokenManager;

/// Periodic sweep driver over a [`TokenManager`].
pub struct BackgroundMonitor {
    manager: Arc<TokenManager>,
    interval: Duration,
}

impl BackgroundMonitor {
    pub fn new(manager: Arc<TokenManager>) -> Self {
        let interval = manager.config().monitor_interval;
        Self { manager, interval }
    }

    /// Start the monitor loop on the runtime. The first sweep runs
    /// immediately, then once per interval until shutdown.
    pub fn spawn(self) -> MonitorHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "background monitor started");
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                debug!("monitor sweep starting");
                self.manager.proactive_sweep().await;

                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    changed = stop_rx.changed() => {
                        // A closed channel means the handle is gone; stop
                        // rather than spin.
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("background monitor stopped");
        });
        MonitorHandle {
            stop: stop_tx,
            task,
        }
    }
}

/// Handle for stopping a running monitor. Dropping the handle without
/// calling [`MonitorHandle::shutdown`] stops the loop at the next tick
/// without waiting for it.
pub struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal the loop to stop and wait for the in-flight sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, RecordingSleeper};
    use crate::config::ManagerConfig;
    use crate::notifier::MockMailTransport;
    use crate::store::MockTokenStore;
    use crate::transport::MockHttpTransport;
    use crate::types::TokenRecord;
    use chrono::Utc;
    use secrecy::SecretString;

    fn manager_with(
        interval: Duration,
        store: Arc<MockTokenStore>,
        transport: Arc<MockHttpTransport>,
    ) -> Arc<TokenManager> {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        Arc::new(TokenManager::new(
            ManagerConfig {
                monitor_interval: interval,
                ..ManagerConfig::default()
            },
            vec!["mail_send".to_string()],
            store,
            transport,
            Arc::new(MockMailTransport::new()),
            clock,
            Arc::new(RecordingSleeper::new()),
        ))
    }

    fn stale_record(now: chrono::DateTime<Utc>) -> TokenRecord {
        TokenRecord {
            access_token: "access-old".to_string(),
            refresh_token: "refresh-old".to_string(),
            token_endpoint: "https://provider.example/token".to_string(),
            client_id: "client-1".to_string(),
            client_secret: SecretString::new("secret-1".to_string()),
            scopes: Vec::new(),
            expiry: Some(now + chrono::Duration::seconds(60)),
            last_refreshed_at: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_monitor_refreshes_on_its_own() {
        let store = Arc::new(MockTokenStore::new());
        store.add_record("mail_send", stale_record(Utc::now()));
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_json_response(
            200,
            &serde_json::json!({
                "access_token": "access-new",
                "token_type": "Bearer",
                "expires_in": 3600
            }),
        );

        let manager = manager_with(Duration::from_millis(20), store, transport.clone());
        let handle = BackgroundMonitor::new(manager).spawn();

        // The first sweep runs before the first interval sleep.
        tokio::time::timeout(Duration::from_secs(1), async {
            while transport.requests().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.shutdown().await;
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_prompt_with_long_interval() {
        let store = Arc::new(MockTokenStore::new());
        let transport = Arc::new(MockHttpTransport::new());
        let manager = manager_with(Duration::from_secs(60), store, transport);
        let handle = BackgroundMonitor::new(manager).spawn();

        // Shutdown must not wait out the 60s interval sleep.
        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .unwrap();
    }
}
