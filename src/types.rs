//! Credential Types
//!
//! Durable token records, provider responses, and the credential wrapper
//! handed to consumers.

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Durable credential record for one identity, persisted as a JSON file.
///
/// Created once by the external authorization flow and mutated in place by
/// every successful refresh. `last_refreshed_at` and `last_error` use serde
/// defaults so files written by the authorization flow, which omits them,
/// still parse.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Current access token.
    pub access_token: String,
    /// Refresh grant. Write-once-per-grant: a refresh response lacking a new
    /// refresh token must preserve this one.
    pub refresh_token: String,
    /// Provider token endpoint URL.
    pub token_endpoint: String,
    /// OAuth client identifier.
    pub client_id: String,
    /// OAuth client secret.
    #[serde(
        serialize_with = "serialize_secret",
        deserialize_with = "deserialize_secret"
    )]
    pub client_secret: SecretString,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Access token expiry. Unset means the token never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    /// When the record was last refreshed successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refreshed_at: Option<DateTime<Utc>>,
    /// Last refresh error, cleared on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn serialize_secret<S: Serializer>(secret: &SecretString, ser: S) -> Result<S::Ok, S::Error> {
    ser.serialize_str(secret.expose_secret())
}

fn deserialize_secret<'de, D: Deserializer<'de>>(de: D) -> Result<SecretString, D::Error> {
    String::deserialize(de).map(SecretString::new)
}

impl TokenRecord {
    /// Apply a successful refresh response.
    ///
    /// Preserves the existing refresh token when the provider does not rotate
    /// it, records the new expiry relative to `now`, and clears the failure
    /// metadata. A response without a lifetime keeps the previous expiry, so
    /// an omitted `expires_in` can never turn an expiring record into a
    /// never-stale one.
    pub fn apply_refresh(&mut self, response: &TokenResponse, now: DateTime<Utc>) {
        self.access_token = response.access_token.clone();
        if let Some(rotated) = &response.refresh_token {
            self.refresh_token = rotated.clone();
        }
        if let Some(secs) = response.expires_in {
            self.expiry = Some(now + Duration::seconds(secs as i64));
        }
        if let Some(scope) = &response.scope {
            self.scopes = scope.split_whitespace().map(String::from).collect();
        }
        self.last_refreshed_at = Some(now);
        self.last_error = None;
    }
}

impl std::fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("token_endpoint", &self.token_endpoint)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("scopes", &self.scopes)
            .field("expiry", &self.expiry)
            .field("last_refreshed_at", &self.last_refreshed_at)
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Token response from the provider's token endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenResponse {
    /// New access token.
    pub access_token: String,
    /// Token type (usually "Bearer").
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Rotated refresh token, if the provider issued one.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scopes.
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Lifecycle state of one identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    /// Cached record is within the lead-time window.
    Fresh,
    /// Record needs a refresh before the next use.
    #[default]
    Stale,
    /// A refresh is in flight.
    Refreshing,
    /// Retryable attempts exhausted; last-known-good record still served,
    /// eligible for automatic retry.
    Failed,
    /// Provider rejected the refresh grant. Requires manual
    /// re-authorization; never auto-recovered.
    Dead,
}

impl TokenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Refreshing => "refreshing",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }
}

/// Read-only identity status for health checks.
#[derive(Clone, Debug, Serialize)]
pub struct TokenStatus {
    pub state: TokenState,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// One refresh attempt, recorded for the failure notification body.
#[derive(Clone, Debug)]
pub struct RefreshAttempt {
    pub attempt: u32,
    pub error: String,
}

/// Credential handed to mail and calendar consumers.
#[derive(Clone)]
pub struct Credential {
    /// Identity this credential belongs to.
    pub identity: String,
    /// Access token value (secret).
    value: SecretString,
    /// Expiry of the underlying access token.
    pub expires_at: Option<DateTime<Utc>>,
    /// Granted scopes.
    pub scopes: Vec<String>,
}

impl Credential {
    /// Build a credential from a stored record.
    pub fn from_record(identity: &str, record: &TokenRecord) -> Self {
        Self {
            identity: identity.to_string(),
            value: SecretString::new(record.access_token.clone()),
            expires_at: record.expiry,
            scopes: record.scopes.clone(),
        }
    }

    /// Get the token value.
    pub fn secret(&self) -> &str {
        self.value.expose_secret()
    }

    /// Format as an Authorization header value.
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.value.expose_secret())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}
