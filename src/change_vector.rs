//! Change vector parsing and comparison.
//!
//! A change vector is a comma separated list of `TAG:ETAG-DBID` entries, one per database
//! instance which ever wrote to the database.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};

/// A single entry of a change vector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeVectorEntry {
    pub node_tag: String,
    pub etag: i64,
    pub db_id: String,
}

/// The relation between two change vectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictStatus {
    /// The remote vector strictly supersedes the local one.
    Update,
    /// The two vectors diverged.
    Conflict,
    /// The local vector already contains everything in the remote one.
    AlreadyMerged,
}

/// Parse a change vector string. An empty string yields no entries.
pub fn parse(change_vector: &str) -> Result<Vec<ChangeVectorEntry>> {
    let mut entries = vec![];
    for raw in change_vector.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (tag, rest) = match raw.split_once(':') {
            Some(parts) => parts,
            None => bail!("invalid change vector entry '{}', expected TAG:ETAG-DBID", raw),
        };
        let (etag, db_id) = match rest.split_once('-') {
            Some(parts) => parts,
            None => bail!("invalid change vector entry '{}', expected TAG:ETAG-DBID", raw),
        };
        let etag = etag
            .parse::<i64>()
            .with_context(|| format!("invalid etag in change vector entry '{}'", raw))?;
        entries.push(ChangeVectorEntry {
            node_tag: tag.to_string(),
            etag,
            db_id: db_id.to_string(),
        });
    }
    Ok(entries)
}

/// Render entries back into change vector form.
pub fn format(entries: &[ChangeVectorEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{}:{}-{}", e.node_tag, e.etag, e.db_id))
        .collect::<Vec<_>>()
        .join(", ")
}

fn etags_by_id(change_vector: Option<&str>) -> HashMap<String, i64> {
    change_vector
        .and_then(|cv| parse(cv).ok())
        .unwrap_or_default()
        .into_iter()
        .map(|e| (e.db_id, e.etag))
        .collect()
}

/// The etag recorded for the given database id, or 0 when absent.
pub fn etag_by_id(change_vector: Option<&str>, db_id: &str) -> i64 {
    etags_by_id(change_vector).get(db_id).copied().unwrap_or(0)
}

/// How far `first` is ahead of `second`, summed over the database ids of `first`.
///
/// A positive value means `first` is ahead.
pub fn distance(first: Option<&str>, second: Option<&str>) -> i64 {
    let (first, second) = (etags_by_id(first), etags_by_id(second));
    first
        .iter()
        .map(|(db_id, etag)| etag - second.get(db_id).copied().unwrap_or(0))
        .sum()
}

/// Compare a remote change vector against a local one.
pub fn conflict_status(remote: Option<&str>, local: Option<&str>) -> ConflictStatus {
    let (remote, local) = (etags_by_id(remote), etags_by_id(local));
    let remote_has_larger = remote.iter().any(|(id, etag)| *etag > local.get(id).copied().unwrap_or(0));
    let local_has_larger = local.iter().any(|(id, etag)| *etag > remote.get(id).copied().unwrap_or(0));
    match (remote_has_larger, local_has_larger) {
        (true, false) => ConflictStatus::Update,
        (true, true) => ConflictStatus::Conflict,
        (false, _) => ConflictStatus::AlreadyMerged,
    }
}

/// Merge two change vectors, keeping the highest etag per database id.
pub fn merge(first: Option<&str>, second: Option<&str>) -> String {
    let mut merged: Vec<ChangeVectorEntry> = first.and_then(|cv| parse(cv).ok()).unwrap_or_default();
    for entry in second.and_then(|cv| parse(cv).ok()).unwrap_or_default() {
        match merged.iter_mut().find(|e| e.db_id == entry.db_id) {
            Some(existing) if existing.etag < entry.etag => existing.etag = entry.etag,
            Some(_) => (),
            None => merged.push(entry),
        }
    }
    format(&merged)
}
