//! OAuth Token Lifecycle Management
//!
//! Keeps a set of long-lived OAuth identities usable without manual token
//! babysitting: tokens are persisted crash-safely on disk, refreshed before
//! they expire (reactively on access and proactively from a background
//! monitor), and operators are alerted once per failure episode when a
//! refresh keeps failing.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use token_lifecycle::{create_token_manager, BackgroundMonitor, ManagerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mail = Arc::new(MyMailer::new());
//!     let manager = create_token_manager(ManagerConfig::default(), "/var/lib/app/tokens", mail).await?;
//!     let monitor = BackgroundMonitor::new(manager.clone()).spawn();
//!
//!     let credential = manager.get_credentials("mail_send").await?;
//!     let header = credential.authorization_header();
//!
//!     monitor.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - `types`: token records, states, statuses and credential values
//! - `error`: error hierarchy with transient/terminal classification
//! - `config`: manager and retry configuration
//! - `clock`: injectable time and sleep for deterministic tests
//! - `transport`: HTTP transport seam over reqwest
//! - `store`: crash-safe file persistence with timestamped backups
//! - `validator`: pure lead-time freshness check
//! - `refresh`: single-flight per-identity refresh coordination
//! - `notifier`: episode-scoped operator alerting over mail
//! - `monitor`: periodic proactive refresh loop
//! - `manager`: the facade consumers use

pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod notifier;
pub mod refresh;
pub mod store;
pub mod transport;
pub mod types;
pub mod validator;

// Re-export the facade
pub use manager::{create_token_manager, TokenManager};

// Re-export the monitor
pub use monitor::{BackgroundMonitor, MonitorHandle};

// Re-export configuration
pub use config::{ManagerConfig, RetryConfig};

// Re-export errors
pub use error::{
    StorageError, TerminalRefreshError, TokenLoadError, TokenManagerError, TokenResult,
    TransientRefreshError,
};

// Re-export types
pub use types::{Credential, RefreshAttempt, TokenRecord, TokenResponse, TokenState, TokenStatus};

// Re-export seams and their production implementations
pub use clock::{Clock, ManualClock, Sleeper, SystemClock, TokioSleeper};
pub use notifier::{FailureNotifier, MailTransport, MockMailTransport};
pub use store::{FileTokenStore, MockTokenStore, TokenStore};
pub use transport::{
    HttpRequest, HttpResponse, HttpTransport, MockHttpTransport, ReqwestHttpTransport,
};

// Re-export the freshness check
pub use validator::is_fresh;
