use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Coarse lifecycle status recorded by the catalog for an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    Initiated,
    Resumed,
    Paused,
    Uploaded,
}

impl LifecycleStatus {
    /// Wire/catalog representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::Resumed => "RESUMED",
            Self::Paused => "PAUSED",
            Self::Uploaded => "UPLOADED",
        }
    }

    /// `UPLOADED` is the only terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Uploaded)
    }

    /// A paused upload may be picked up by a later session.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Paused)
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIATED" => Ok(Self::Initiated),
            "RESUMED" => Ok(Self::Resumed),
            "PAUSED" => Ok(Self::Paused),
            "UPLOADED" => Ok(Self::Uploaded),
            other => Err(format!("unknown lifecycle status: {other}")),
        }
    }
}
