//! Token Store
//!
//! Durable per-identity persistence. Writes go to a sibling temp file, are
//! fsynced, and atomically replace the primary, so a reader never observes a
//! torn record. The primary is backed up to a timestamped sibling before
//! each overwrite, with only the newest K backups retained.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{StorageError, TokenLoadError, TokenManagerError};
use crate::types::TokenRecord;

/// Token store interface.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Load the record for an identity. Absent or unparsable files are
    /// errors; a partially populated record is never returned.
    async fn load(&self, identity: &str) -> Result<TokenRecord, TokenManagerError>;

    /// Durably persist the record for an identity. On failure the primary
    /// file is left untouched.
    async fn save(&self, identity: &str, record: &TokenRecord) -> Result<(), TokenManagerError>;

    /// Copy the current primary file to a timestamped backup, pruning old
    /// backups beyond the retention bound. A no-op when no primary exists.
    async fn backup(&self, identity: &str) -> Result<(), TokenManagerError>;

    /// Enumerate identities with a primary file.
    async fn list_identities(&self) -> Result<Vec<String>, TokenManagerError>;
}

/// File-backed token store, one JSON file per identity.
pub struct FileTokenStore {
    dir: PathBuf,
    backup_retention: usize,
    clock: std::sync::Arc<dyn Clock>,
    // Disambiguates backups taken within the same millisecond.
    backup_seq: AtomicU64,
}

impl FileTokenStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        backup_retention: usize,
        clock: std::sync::Arc<dyn Clock>,
    ) -> Self {
        Self {
            dir: dir.into(),
            backup_retention,
            clock,
            backup_seq: AtomicU64::new(0),
        }
    }

    fn primary_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{identity}.json"))
    }

    fn temp_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{identity}.json.tmp"))
    }

    fn backup_path(&self, identity: &str) -> PathBuf {
        let stamp = self.clock.now().format("%Y%m%dT%H%M%S%3f");
        let seq = self.backup_seq.fetch_add(1, Ordering::SeqCst);
        self.dir.join(format!("{identity}.{stamp}-{seq:04}.bak.json"))
    }

    fn is_backup_of(name: &str, identity: &str) -> bool {
        name.starts_with(&format!("{identity}.")) && name.ends_with(".bak.json")
    }

    async fn prune_backups(&self, identity: &str) -> std::io::Result<()> {
        let mut backups = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if Self::is_backup_of(name, identity) {
                    backups.push(name.to_string());
                }
            }
        }

        // Names embed a fixed-width timestamp and sequence number, so the
        // lexicographic order is the chronological order.
        backups.sort();
        while backups.len() > self.backup_retention {
            let victim = backups.remove(0);
            let path = self.dir.join(&victim);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(backup = %path.display(), error = %e, "failed to prune backup");
            } else {
                debug!(backup = %victim, "pruned backup");
            }
        }
        Ok(())
    }
}

fn load_io_error(path: &Path, e: std::io::Error) -> TokenManagerError {
    let error = if e.kind() == std::io::ErrorKind::NotFound {
        TokenLoadError::NotFound {
            path: path.display().to_string(),
        }
    } else {
        TokenLoadError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        }
    };
    TokenManagerError::Load(error)
}

fn write_error(path: &Path, message: impl ToString) -> TokenManagerError {
    TokenManagerError::Storage(StorageError::WriteFailed {
        path: path.display().to_string(),
        message: message.to_string(),
    })
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self, identity: &str) -> Result<TokenRecord, TokenManagerError> {
        let path = self.primary_path(identity);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| load_io_error(&path, e))?;

        serde_json::from_str(&contents).map_err(|e| {
            TokenManagerError::Load(TokenLoadError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })
        })
    }

    async fn save(&self, identity: &str, record: &TokenRecord) -> Result<(), TokenManagerError> {
        let primary = self.primary_path(identity);
        let temp = self.temp_path(identity);

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| write_error(&primary, e))?;

        let json = serde_json::to_string_pretty(record)
            .map_err(|e| write_error(&primary, e))?;

        let result: std::io::Result<()> = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);

            // Atomic replace; fall back to copy + delete where rename cannot
            // cross the boundary.
            if tokio::fs::rename(&temp, &primary).await.is_err() {
                tokio::fs::copy(&temp, &primary).await?;
                tokio::fs::remove_file(&temp).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(write_error(&primary, e));
        }

        debug!(identity, path = %primary.display(), "token record persisted");
        Ok(())
    }

    async fn backup(&self, identity: &str) -> Result<(), TokenManagerError> {
        let primary = self.primary_path(identity);
        match tokio::fs::try_exists(&primary).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => {
                return Err(TokenManagerError::Storage(StorageError::BackupFailed {
                    path: primary.display().to_string(),
                    message: e.to_string(),
                }))
            }
        }

        let backup = self.backup_path(identity);
        tokio::fs::copy(&primary, &backup).await.map_err(|e| {
            TokenManagerError::Storage(StorageError::BackupFailed {
                path: primary.display().to_string(),
                message: e.to_string(),
            })
        })?;

        if let Err(e) = self.prune_backups(identity).await {
            warn!(identity, error = %e, "backup pruning failed");
        }
        Ok(())
    }

    async fn list_identities(&self) -> Result<Vec<String>, TokenManagerError> {
        let mut identities = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| load_io_error(&self.dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| load_io_error(&self.dir, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(identity) = name.strip_suffix(".json") {
                    if !identity.contains('.') {
                        identities.push(identity.to_string());
                    }
                }
            }
        }

        identities.sort();
        Ok(identities)
    }
}

/// Mock token store for testing.
#[derive(Default)]
pub struct MockTokenStore {
    records: Mutex<HashMap<String, TokenRecord>>,
    save_history: Mutex<Vec<(String, TokenRecord)>>,
    backup_history: Mutex<Vec<String>>,
    fail_saves: Mutex<bool>,
}

impl MockTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a record.
    pub fn add_record(&self, identity: &str, record: TokenRecord) -> &Self {
        self.records
            .lock()
            .unwrap()
            .insert(identity.to_string(), record);
        self
    }

    /// Make every save fail.
    pub fn set_fail_saves(&self, fail: bool) -> &Self {
        *self.fail_saves.lock().unwrap() = fail;
        self
    }

    /// Get save history.
    pub fn saves(&self) -> Vec<(String, TokenRecord)> {
        self.save_history.lock().unwrap().clone()
    }

    /// Get backup history.
    pub fn backups(&self) -> Vec<String> {
        self.backup_history.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenStore for MockTokenStore {
    async fn load(&self, identity: &str) -> Result<TokenRecord, TokenManagerError> {
        self.records.lock().unwrap().get(identity).cloned().ok_or_else(|| {
            TokenManagerError::Load(TokenLoadError::NotFound {
                path: format!("{identity}.json"),
            })
        })
    }

    async fn save(&self, identity: &str, record: &TokenRecord) -> Result<(), TokenManagerError> {
        if *self.fail_saves.lock().unwrap() {
            return Err(TokenManagerError::Storage(StorageError::WriteFailed {
                path: format!("{identity}.json"),
                message: "mock save failure".to_string(),
            }));
        }
        self.save_history
            .lock()
            .unwrap()
            .push((identity.to_string(), record.clone()));
        self.records
            .lock()
            .unwrap()
            .insert(identity.to_string(), record.clone());
        Ok(())
    }

    async fn backup(&self, identity: &str) -> Result<(), TokenManagerError> {
        self.backup_history.lock().unwrap().push(identity.to_string());
        Ok(())
    }

    async fn list_identities(&self) -> Result<Vec<String>, TokenManagerError> {
        let mut identities: Vec<String> =
            self.records.lock().unwrap().keys().cloned().collect();
        identities.sort();
        Ok(identities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::TokenLoadError;
    use chrono::Utc;
    use secrecy::SecretString;
    use std::sync::Arc;

    fn test_record() -> TokenRecord {
        TokenRecord {
            access_token: "access-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            token_endpoint: "https://provider.example/token".to_string(),
            client_id: "client-1".to_string(),
            client_secret: SecretString::new("secret-1".to_string()),
            scopes: vec!["mail.send".to_string()],
            expiry: Some(Utc::now() + chrono::Duration::seconds(3600)),
            last_refreshed_at: None,
            last_error: None,
        }
    }

    fn file_store(dir: &Path) -> FileTokenStore {
        FileTokenStore::new(dir, 3, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(dir.path());

        store.save("mail_send", &test_record()).await.unwrap();
        let loaded = store.load("mail_send").await.unwrap();
        assert_eq!(loaded.access_token, "access-1");
        assert_eq!(loaded.refresh_token, "refresh-1");
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(dir.path());

        let error = store.load("calendar").await.unwrap_err();
        assert!(matches!(
            error,
            TokenManagerError::Load(TokenLoadError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(dir.path());
        std::fs::write(dir.path().join("mail_send.json"), "{not valid json").unwrap();

        let error = store.load("mail_send").await.unwrap_err();
        assert!(matches!(
            error,
            TokenManagerError::Load(TokenLoadError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_temp_file_never_corrupts_primary() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(dir.path());
        store.save("mail_send", &test_record()).await.unwrap();

        // A crash mid-save leaves a half-written temp sibling behind. The
        // primary must stay valid and the next save must replace cleanly.
        std::fs::write(dir.path().join("mail_send.json.tmp"), "garbage{{{").unwrap();

        let loaded = store.load("mail_send").await.unwrap();
        assert_eq!(loaded.access_token, "access-1");

        let mut updated = test_record();
        updated.access_token = "access-2".to_string();
        store.save("mail_send", &updated).await.unwrap();
        assert_eq!(store.load("mail_send").await.unwrap().access_token, "access-2");
    }

    #[tokio::test]
    async fn test_backup_retention_keeps_newest_k() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(dir.path());
        store.save("mail_send", &test_record()).await.unwrap();

        for _ in 0..6 {
            store.backup("mail_send").await.unwrap();
        }

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.unwrap().file_name().into_string().ok())
            .filter(|n| n.ends_with(".bak.json"))
            .collect();
        assert_eq!(backups.len(), 3);
    }

    #[tokio::test]
    async fn test_backup_without_primary_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(dir.path());
        store.backup("calendar").await.unwrap();

        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 0);
    }

    #[tokio::test]
    async fn test_list_identities_ignores_backups_and_temps() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(dir.path());
        store.save("mail_send", &test_record()).await.unwrap();
        store.save("calendar", &test_record()).await.unwrap();
        store.backup("mail_send").await.unwrap();
        std::fs::write(dir.path().join("calendar.json.tmp"), "x").unwrap();

        let identities = store.list_identities().await.unwrap();
        assert_eq!(identities, vec!["calendar", "mail_send"]);
    }

    #[tokio::test]
    async fn test_mock_store_records_history() {
        let store = MockTokenStore::new();
        store.save("mail_send", &test_record()).await.unwrap();
        store.backup("mail_send").await.unwrap();

        assert_eq!(store.saves().len(), 1);
        assert_eq!(store.backups(), vec!["mail_send"]);
        assert!(store.load("mail_send").await.is_ok());
    }
}
