//! Conflict copy naming
//!
//! The remote version of a conflicted file lands beside the original as
//! `<name>.conflict-<timestamp>`, extension preserved inside the marker so
//! the copy keeps opening with the right application.

use chrono::{DateTime, Utc};

/// Builds the conflict copy name for `original` at `timestamp`
///
/// `"report.docx"` becomes `"report.docx.conflict-20260801T120000Z"`.
#[must_use]
pub fn conflict_copy_name(original: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{original}.conflict-{}",
        timestamp.format("%Y%m%dT%H%M%SZ")
    )
}

/// Like [`conflict_copy_name`], but avoids names the caller reports taken
///
/// Appends an incrementing suffix on collision; collisions only happen when
/// two conflicts on the same file resolve within one second.
pub fn unique_conflict_copy_name<F>(
    original: &str,
    timestamp: DateTime<Utc>,
    mut exists: F,
) -> String
where
    F: FnMut(&str) -> bool,
{
    let candidate = conflict_copy_name(original, timestamp);
    if !exists(&candidate) {
        return candidate;
    }

    for i in 2..=99 {
        let numbered = format!("{candidate}-{i}");
        if !exists(&numbered) {
            return numbered;
        }
    }

    // A pathological caller claims everything exists; suffix with nanos.
    format!("{candidate}-{}", timestamp.timestamp_nanos_opt().unwrap_or(0))
}
