//! Session kinds and session-creation argument parsing.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Separator between the components of a session label.
const LABEL_SEPARATOR: &str = " -> ";

/// The kernel services the supervisor intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Protection domain.
    Pd,
    /// Memory allocation.
    Ram,
    /// Region-map creation.
    Rm,
    /// Threads.
    Cpu,
    /// Read-only modules.
    Rom,
    /// Log output.
    Log,
    /// Timeouts.
    Timer,
}

impl SessionKind {
    /// Every kind in sequential checkpoint order.
    pub const ALL: [Self; 7] = [
        Self::Pd,
        Self::Ram,
        Self::Cpu,
        Self::Rm,
        Self::Rom,
        Self::Log,
        Self::Timer,
    ];

    /// Service name used when a child requests the session.
    #[must_use]
    pub fn service_name(self) -> &'static str {
        match self {
            Self::Pd => "PD",
            Self::Ram => "RAM",
            Self::Rm => "RM",
            Self::Cpu => "CPU",
            Self::Rom => "ROM",
            Self::Log => "LOG",
            Self::Timer => "Timer",
        }
    }

    /// Worker unit name used in configuration and reports.
    #[must_use]
    pub fn unit_name(self) -> &'static str {
        match self {
            Self::Pd => "pd",
            Self::Ram => "ram",
            Self::Rm => "rm",
            Self::Cpu => "cpu",
            Self::Rom => "rom",
            Self::Log => "log",
            Self::Timer => "timer",
        }
    }

    /// Resolve a service name as requested by a child.
    #[must_use]
    pub fn from_service_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.service_name() == name)
    }
}

impl Display for SessionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.service_name())
    }
}

/// Parsed session-creation arguments (`label="child", ram_quota=16K`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionArgs {
    /// Full session label.
    pub label: String,
    /// Donated quota in bytes.
    pub ram_quota: usize,
}

impl SessionArgs {
    /// Build arguments directly.
    #[must_use]
    pub fn new(label: impl Into<String>, ram_quota: usize) -> Self {
        Self {
            label: label.into(),
            ram_quota,
        }
    }

    /// Parse a comma-separated `key=value` argument string.
    ///
    /// Unknown keys are ignored. Quota values accept `K`, `M` and `G`
    /// suffixes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the label is missing or empty, or if
    /// the quota is not a number.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut label = None;
        let mut ram_quota = 0;

        for part in split_args(raw) {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "label" => label = Some(value.to_owned()),
                "ram_quota" => ram_quota = parse_quota(value)?,
                _ => {}
            }
        }

        let label = label
            .filter(|l| !l.is_empty())
            .ok_or_else(|| AppError::Config(format!("session args carry no label: {raw}")))?;

        Ok(Self { label, ram_quota })
    }

    /// Name of the child the session belongs to (first label component).
    #[must_use]
    pub fn child_name(&self) -> &str {
        self.label
            .split(LABEL_SEPARATOR)
            .next()
            .map_or(self.label.as_str(), str::trim)
    }
}

/// Split on commas that are not inside a quoted value.
fn split_args(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, ch) in raw.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&raw[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

fn parse_quota(value: &str) -> Result<usize> {
    let (digits, factor) = match value.chars().last() {
        Some('K' | 'k') => (&value[..value.len() - 1], 1 << 10),
        Some('M' | 'm') => (&value[..value.len() - 1], 1 << 20),
        Some('G' | 'g') => (&value[..value.len() - 1], 1 << 30),
        _ => (value, 1),
    };
    digits
        .parse::<usize>()
        .map(|n| n * factor)
        .map_err(|err| AppError::Config(format!("invalid ram_quota '{value}': {err}")))
}
