use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::process::RemovalKind;

/// Excess-removal mode carried by `ReqRemoveExcess`, ordered by strength.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RemovalMode {
    #[default]
    No,
    /// Unsubmitted idle glideins only
    Wait,
    /// Every idle glidein
    Idle,
    /// Idle, running and held glideins
    All,
}

impl RemovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalMode::No => "NO",
            RemovalMode::Wait => "WAIT",
            RemovalMode::Idle => "IDLE",
            RemovalMode::All => "ALL",
        }
    }

    /// Reads a mode sent by a frontend; anything unknown is `NO`.
    pub fn parse_lenient(value: &str) -> RemovalMode {
        value.parse().unwrap_or_else(|_| {
            log::info!("Unknown removal mode `{value}`, assuming NO");
            RemovalMode::No
        })
    }
}

impl From<RemovalKind> for RemovalMode {
    fn from(kind: RemovalKind) -> Self {
        match kind {
            RemovalKind::Wait => RemovalMode::Wait,
            RemovalKind::Idle => RemovalMode::Idle,
            RemovalKind::All => RemovalMode::All,
        }
    }
}

impl FromStr for RemovalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "NO" => RemovalMode::No,
            "WAIT" => RemovalMode::Wait,
            "IDLE" => RemovalMode::Idle,
            "ALL" => RemovalMode::All,
            _ => return Err(format!("Unknown removal mode `{s}`")),
        })
    }
}

impl Display for RemovalMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
