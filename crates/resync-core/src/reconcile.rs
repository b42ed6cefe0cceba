//! Drift detection between the upstream listing and a destination.
//!
//! Both sides are sorted with [`compare_keys`] before the merge walk, so a
//! backend's native collation never decides the result.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::AppError;
use crate::models::{key_string, Record};

/// Primary key with the tracked timestamp values, in timestamp-field order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRow {
    pub key: String,
    pub timestamps: Vec<Option<DateTime<Utc>>>,
}

impl ListingRow {
    pub fn from_record(record: &Record, primary_key: &str, timestamp_fields: &[&str]) -> Option<Self> {
        let key = record.get(primary_key).and_then(key_string)?;
        let timestamps = timestamp_fields
            .iter()
            .map(|f| record.get(*f).and_then(parse_timestamp).map(|t| t.trunc_subsecs(3)))
            .collect();
        Some(Self { key, timestamps })
    }
}

/// Total order on primary keys shared by both sides of a diff.
///
/// Integer keys sort before all other keys and compare numerically among
/// themselves. Everything else compares byte-wise.
pub fn compare_keys(a: &str, b: &str) -> Ordering {
    match (a.parse::<i128>(), b.parse::<i128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

pub fn sort_keys(keys: &mut [String]) {
    keys.sort_by(|a, b| compare_keys(a, b));
}

/// Parses the timestamp representations seen upstream and in destinations.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?;
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|t| t.and_utc())
}

/// Keys present upstream but missing or stale at the destination, ascending.
///
/// Inputs must already be sorted by [`compare_keys`]. Keys only present at
/// the destination are left to the purger.
pub fn diff_listings(source: &[ListingRow], destination: &[ListingRow]) -> Vec<String> {
    let mut out = Vec::new();
    let mut j = 0;
    for row in source {
        while j < destination.len() && compare_keys(&destination[j].key, &row.key) == Ordering::Less {
            j += 1;
        }
        match destination.get(j) {
            Some(dest) if dest.key == row.key => {
                if is_stale(row, dest) {
                    out.push(row.key.clone());
                }
                j += 1;
            }
            _ => out.push(row.key.clone()),
        }
    }
    out
}

/// Timestamps compare at millisecond precision, the precision destinations
/// store.
fn is_stale(source: &ListingRow, destination: &ListingRow) -> bool {
    source.timestamps.iter().enumerate().any(|(i, theirs)| {
        let ours = destination.timestamps.get(i).copied().flatten();
        match (theirs, ours) {
            (Some(t), Some(o)) => t.timestamp_millis() > o.timestamp_millis(),
            (Some(_), None) => true,
            (None, _) => false,
        }
    })
}

/// Input of one isolated diff computation.
#[derive(Debug, Clone, Default)]
pub struct DiffRequest {
    pub source: Vec<ListingRow>,
    pub destination: Vec<ListingRow>,
}

/// Runs the diff on the blocking thread pool so a listing of hundreds of
/// thousands of rows never stalls network I/O or scheduler ticks.
///
/// The task owns its inputs and either yields the full id list or fails as a
/// whole; it cannot be cancelled once started.
pub async fn run_diff(request: DiffRequest) -> Result<Vec<String>, AppError> {
    let handle = tokio::task::spawn_blocking(move || {
        let DiffRequest {
            mut source,
            mut destination,
        } = request;
        source.sort_by(|a, b| compare_keys(&a.key, &b.key));
        source.dedup_by(|a, b| a.key == b.key);
        destination.sort_by(|a, b| compare_keys(&a.key, &b.key));
        destination.dedup_by(|a, b| a.key == b.key);
        diff_listings(&source, &destination)
    });
    let ids = handle
        .await
        .map_err(|e| AppError::DiffTask(e.to_string()))?;
    debug!(flagged = ids.len(), "Diff task finished");
    Ok(ids)
}
