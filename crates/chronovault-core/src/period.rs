//! Temporal value types.
//!
//! A [`Period`] is a point in time, a closed interval, or a relative span.
//! A [`Hook`] names the temporal constraint applied to a period. Both are
//! plain values; all evaluation semantics live in [`crate::eval`].
//!
//! All absolute timestamps are UTC. Serde uses the default externally-tagged
//! representation so these types round-trip through the binary store payload;
//! the human-editable document form lives in [`crate::policy`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// A temporal value: a single instant, a closed interval, or a relative span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Period {
    /// A single point in time.
    Instant { value: DateTime<Utc> },
    /// A closed interval. Invariant: `start <= end`.
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// A relative span with no absolute anchor of its own; the anchor is
    /// supplied by the evaluation context.
    Duration { seconds: u64 },
}

impl Period {
    /// A single-instant period.
    #[must_use]
    pub fn instant(value: DateTime<Utc>) -> Self {
        Self::Instant { value }
    }

    /// A closed interval, validating `start <= end`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Invalid`] if `start > end`.
    pub fn range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, PolicyError> {
        if start > end {
            return Err(PolicyError::Invalid {
                reason: format!("range start {start} is after end {end}"),
            });
        }
        Ok(Self::Range { start, end })
    }

    /// A relative span of whole seconds.
    #[must_use]
    pub fn duration(seconds: u64) -> Self {
        Self::Duration { seconds }
    }

    pub(crate) fn validate(&self) -> Result<(), PolicyError> {
        if let Self::Range { start, end } = self {
            if start > end {
                return Err(PolicyError::Invalid {
                    reason: format!("range start {start} is after end {end}"),
                });
            }
        }
        Ok(())
    }
}

/// A named temporal constraint over a [`Period`].
///
/// Hooks are stateless; combining a hook with an evaluation context is what
/// produces a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hook {
    /// Valid only before a cutoff (the instant, or a range's start).
    OnlyBefore { period: Period },
    /// Valid only after a floor (the instant, or a range's end).
    OnlyAfter { period: Period },
    /// Valid only inside a closed window.
    OnlyWithin { period: Period },
    /// Valid only for a span after an externally supplied anchor.
    OnlyFor { duration_secs: u64 },
}

impl Hook {
    /// The hook's discriminant, used in diagnostics and documents.
    #[must_use]
    pub fn kind(&self) -> HookKind {
        match self {
            Self::OnlyBefore { .. } => HookKind::OnlyBefore,
            Self::OnlyAfter { .. } => HookKind::OnlyAfter,
            Self::OnlyWithin { .. } => HookKind::OnlyWithin,
            Self::OnlyFor { .. } => HookKind::OnlyFor,
        }
    }

    /// Check that the hook's period kind is one the evaluation table can
    /// resolve to a boundary.
    pub(crate) fn validate(&self) -> Result<(), PolicyError> {
        match self {
            Self::OnlyBefore { period } | Self::OnlyAfter { period } => {
                period.validate()?;
                if matches!(period, Period::Duration { .. }) {
                    return Err(PolicyError::Invalid {
                        reason: format!(
                            "{} cannot resolve a relative duration to a boundary",
                            self.kind().as_str()
                        ),
                    });
                }
                Ok(())
            }
            Self::OnlyWithin { period } => {
                period.validate()?;
                if !matches!(period, Period::Range { .. }) {
                    return Err(PolicyError::Invalid {
                        reason: "onlyWithin requires a range period".to_owned(),
                    });
                }
                Ok(())
            }
            Self::OnlyFor { .. } => Ok(()),
        }
    }
}

/// Discriminant of a [`Hook`]. Serialized with the document-format names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookKind {
    OnlyBefore,
    OnlyAfter,
    OnlyWithin,
    OnlyFor,
}

impl HookKind {
    /// The document-format name (`"onlyBefore"`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnlyBefore => "onlyBefore",
            Self::OnlyAfter => "onlyAfter",
            Self::OnlyWithin => "onlyWithin",
            Self::OnlyFor => "onlyFor",
        }
    }
}
