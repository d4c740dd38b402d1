//! Conflict resolution strategies

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use driftfs_core::domain::DriftError;

/// How a detected conflict is resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Keep the local body under the original name, land the remote version
    /// as a conflict copy
    #[default]
    KeepBoth,
    /// Newer modification timestamp wins, the other side is discarded
    LastWriterWins,
    /// Upload local over remote
    KeepLocal,
    /// Discard local edits and adopt remote
    KeepRemote,
    /// Keep both sides, both under conflict-marked names
    Rename,
    /// Leave the item in Conflict for an external agent
    UserChoice,
}

impl Strategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::KeepBoth => "keep-both",
            Strategy::LastWriterWins => "last-writer-wins",
            Strategy::KeepLocal => "keep-local",
            Strategy::KeepRemote => "keep-remote",
            Strategy::Rename => "rename",
            Strategy::UserChoice => "user-choice",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = DriftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep-both" => Ok(Strategy::KeepBoth),
            "last-writer-wins" => Ok(Strategy::LastWriterWins),
            "keep-local" => Ok(Strategy::KeepLocal),
            "keep-remote" => Ok(Strategy::KeepRemote),
            "rename" => Ok(Strategy::Rename),
            "user-choice" => Ok(Strategy::UserChoice),
            other => Err(DriftError::Config {
                field: "conflict.strategy".into(),
                message: format!("unknown strategy '{other}'"),
            }),
        }
    }
}
