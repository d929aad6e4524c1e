//! Operation kinds a scheduler can be bound to

use serde::{Deserialize, Serialize};

/// Client operation a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Ls,
    Get,
    Put,
    BringOnline,
    Copy,
    ReserveSpace,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        Self::Ls,
        Self::Get,
        Self::Put,
        Self::BringOnline,
        Self::Copy,
        Self::ReserveSpace,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ls => "LS",
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::BringOnline => "BRING_ONLINE",
            Self::Copy => "COPY",
            Self::ReserveSpace => "RESERVE_SPACE",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("Unknown job kind: {}", s))
    }
}
