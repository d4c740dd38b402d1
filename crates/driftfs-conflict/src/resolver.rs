//! Strategy execution planning
//!
//! [`plan`] turns a strategy plus the conflict's facts into a
//! [`ResolutionPlan`] the pipelines execute. Keeping the file operations
//! out of this crate makes every strategy decision testable without a
//! remote store, and guarantees the resolution log line is emitted exactly
//! once per conflict.

use chrono::{DateTime, Utc};
use tracing::info;

use driftfs_core::domain::{ETag, NodeId};

use crate::namer::conflict_copy_name;
use crate::strategy::Strategy;

/// Facts about one detected conflict
#[derive(Debug, Clone)]
pub struct ConflictContext {
    pub node: NodeId,
    /// Mount-relative path, for logging and policy evaluation
    pub path: String,
    /// Entry name within its directory
    pub name: String,
    pub local_etag: Option<ETag>,
    pub remote_etag: Option<ETag>,
    pub local_modified: Option<DateTime<Utc>>,
    pub remote_modified: Option<DateTime<Utc>>,
    /// When the resolution runs; also stamps conflict copy names
    pub resolved_at: DateTime<Utc>,
}

/// What the pipelines must do to resolve a conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionPlan {
    /// Upload the local body under the original name; hydrate the remote
    /// version as a sibling with the given name
    KeepBoth { remote_copy_name: String },
    /// Force-upload the local body over the remote version
    KeepLocal,
    /// Discard local edits, demote to ghost, re-hydrate from remote
    KeepRemote,
    /// Keep both sides, both under conflict-marked names
    RenameBoth {
        local_name: String,
        remote_copy_name: String,
    },
    /// Leave the item in Conflict for an external agent
    Defer,
}

impl ResolutionPlan {
    /// Short outcome label for the resolution log line
    fn outcome(&self) -> &'static str {
        match self {
            ResolutionPlan::KeepBoth { .. } => "both-kept",
            ResolutionPlan::KeepLocal => "local-kept",
            ResolutionPlan::KeepRemote => "remote-kept",
            ResolutionPlan::RenameBoth { .. } => "both-renamed",
            ResolutionPlan::Defer => "deferred",
        }
    }
}

/// Produces the execution plan for a conflict under `strategy`
///
/// Every call emits the resolution log line
/// `{path, local_etag, remote_etag, strategy, outcome}`.
#[must_use]
pub fn plan(strategy: Strategy, ctx: &ConflictContext) -> ResolutionPlan {
    let plan = match strategy {
        Strategy::KeepBoth => ResolutionPlan::KeepBoth {
            remote_copy_name: conflict_copy_name(&ctx.name, ctx.resolved_at),
        },
        Strategy::KeepLocal => ResolutionPlan::KeepLocal,
        Strategy::KeepRemote => ResolutionPlan::KeepRemote,
        Strategy::LastWriterWins => {
            // Missing timestamps count as oldest so a side with a known
            // mtime wins over one without.
            let local = ctx.local_modified.unwrap_or(DateTime::<Utc>::MIN_UTC);
            let remote = ctx.remote_modified.unwrap_or(DateTime::<Utc>::MIN_UTC);
            if local >= remote {
                ResolutionPlan::KeepLocal
            } else {
                ResolutionPlan::KeepRemote
            }
        }
        Strategy::Rename => {
            let marked = conflict_copy_name(&ctx.name, ctx.resolved_at);
            ResolutionPlan::RenameBoth {
                local_name: format!("{marked}.local"),
                remote_copy_name: format!("{marked}.remote"),
            }
        }
        Strategy::UserChoice => ResolutionPlan::Defer,
    };

    info!(
        path = %ctx.path,
        local_etag = ctx.local_etag.as_ref().map(|e| e.as_str()).unwrap_or("-"),
        remote_etag = ctx.remote_etag.as_ref().map(|e| e.as_str()).unwrap_or("-"),
        strategy = %strategy,
        outcome = plan.outcome(),
        "Conflict resolved"
    );

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(local_modified: Option<DateTime<Utc>>, remote_modified: Option<DateTime<Utc>>) -> ConflictContext {
        ConflictContext {
            node: NodeId::new(2),
            path: "docs/b.txt".into(),
            name: "b.txt".into(),
            local_etag: Some(ETag::new("E1").unwrap()),
            remote_etag: Some(ETag::new("E2").unwrap()),
            local_modified,
            remote_modified,
            resolved_at: Utc.with_ymd_and_hms(2026, 8, 1, 9, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_keep_both_names_remote_copy() {
        let plan = plan(Strategy::KeepBoth, &ctx(None, None));
        assert_eq!(
            plan,
            ResolutionPlan::KeepBoth {
                remote_copy_name: "b.txt.conflict-20260801T093000Z".into()
            }
        );
    }

    #[test]
    fn test_keep_local_and_keep_remote() {
        assert_eq!(plan(Strategy::KeepLocal, &ctx(None, None)), ResolutionPlan::KeepLocal);
        assert_eq!(
            plan(Strategy::KeepRemote, &ctx(None, None)),
            ResolutionPlan::KeepRemote
        );
    }

    #[test]
    fn test_last_writer_wins_picks_newer_side() {
        let older = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2026, 7, 2, 0, 0, 0).unwrap();

        assert_eq!(
            plan(Strategy::LastWriterWins, &ctx(Some(newer), Some(older))),
            ResolutionPlan::KeepLocal
        );
        assert_eq!(
            plan(Strategy::LastWriterWins, &ctx(Some(older), Some(newer))),
            ResolutionPlan::KeepRemote
        );
    }

    #[test]
    fn test_last_writer_wins_with_missing_timestamps() {
        let known = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap();
        assert_eq!(
            plan(Strategy::LastWriterWins, &ctx(Some(known), None)),
            ResolutionPlan::KeepLocal
        );
        assert_eq!(
            plan(Strategy::LastWriterWins, &ctx(None, Some(known))),
            ResolutionPlan::KeepRemote
        );
    }

    #[test]
    fn test_rename_marks_both_sides() {
        match plan(Strategy::Rename, &ctx(None, None)) {
            ResolutionPlan::RenameBoth {
                local_name,
                remote_copy_name,
            } => {
                assert!(local_name.ends_with(".local"));
                assert!(remote_copy_name.ends_with(".remote"));
                assert!(local_name.contains("conflict-20260801T093000Z"));
            }
            other => panic!("expected RenameBoth, got {other:?}"),
        }
    }

    #[test]
    fn test_user_choice_defers() {
        assert_eq!(plan(Strategy::UserChoice, &ctx(None, None)), ResolutionPlan::Defer);
    }
}
