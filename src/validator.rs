//! Credential Validator
//!
//! Pure freshness check against a lead-time window.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::types::TokenRecord;

/// Check whether a record is fresh for the given lead time.
///
/// A record with no expiry never goes stale. Otherwise the record is fresh
/// only while `now + lead_time < expiry`; at the boundary the record is
/// already stale, so refresh triggers at or before the lead-time line, never
/// after.
pub fn is_fresh(record: &TokenRecord, lead_time: Duration, now: DateTime<Utc>) -> bool {
    let Some(expiry) = record.expiry else {
        return true;
    };

    let lead = match chrono::Duration::from_std(lead_time) {
        Ok(lead) => lead,
        Err(_) => return false,
    };

    match now.checked_add_signed(lead) {
        Some(threshold) => threshold < expiry,
        // Overflowing the time axis counts as stale rather than fresh.
        None => false,
    }
}
