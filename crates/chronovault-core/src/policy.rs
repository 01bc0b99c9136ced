//! Time-gated validity policies and their text document format.
//!
//! A [`Policy`] is an ordered set of [`Hook`]s plus auxiliary constraints
//! (clock-skew tolerance, attempt limits, single-use). Policies are plain
//! data; evaluation lives in [`crate::eval`].
//!
//! The human-editable document form round-trips losslessly:
//!
//! ```toml
//! id = "deploy-window"
//! version = 1
//! clock_skew_secs = 60
//! single_use = false
//!
//! [[hooks]]
//! type = "onlyWithin"
//! start = "2026-02-01T09:00:00Z"
//! end = "2026-02-01T17:00:00Z"
//! ```
//!
//! Timestamps are ISO-8601 UTC strings. Relative hooks carry
//! `duration_secs` instead of absolute bounds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PolicyError;
use crate::period::{Hook, HookKind, Period};

/// A time-gated validity policy for credentials.
///
/// `id` is immutable once persisted; `version` increments on any field
/// change. Hooks combine with logical AND: every hook must pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique, immutable identifier.
    pub id: String,
    /// Ordered temporal constraints, evaluated in declared order.
    pub hooks: Vec<Hook>,
    /// Optional IANA timezone name, display-only. All comparisons are UTC.
    pub timezone: Option<String>,
    /// Symmetric widening applied to every boundary, in seconds.
    pub clock_skew_secs: u64,
    /// Maximum number of attempts (successes and failures both count).
    pub max_attempts: Option<u32>,
    /// Permanently invalidate the credential after its first accepted use.
    pub single_use: bool,
    /// Bumped on every field change.
    pub version: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            hooks: Vec::new(),
            timezone: Some("UTC".to_owned()),
            clock_skew_secs: 0,
            max_attempts: None,
            single_use: false,
            version: 1,
        }
    }
}

impl Policy {
    /// A policy with the given id and no constraints (accepts always).
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Append a hook, builder-style.
    #[must_use]
    pub fn with_hook(mut self, hook: Hook) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Check structural invariants: non-empty id, well-formed ranges, and
    /// hook/period combinations the evaluation table can resolve.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Invalid`] on the first violated invariant.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.id.is_empty() {
            return Err(PolicyError::Invalid {
                reason: "policy id must not be empty".to_owned(),
            });
        }
        for hook in &self.hooks {
            hook.validate()?;
        }
        Ok(())
    }

    /// Parse a policy from its text document form.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Parse`] if the document is not valid TOML or a
    /// hook is missing its required fields, and [`PolicyError::Invalid`] if
    /// the parsed policy violates a structural invariant.
    pub fn from_toml_str(doc: &str) -> Result<Self, PolicyError> {
        let doc: PolicyDoc = toml::from_str(doc).map_err(|e| PolicyError::Parse {
            reason: e.to_string(),
        })?;
        let policy = Self::try_from(doc)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Render the policy as its text document form.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Serialize`] if a hook cannot be expressed in
    /// the document format (only possible for policies that would also fail
    /// [`Policy::validate`]).
    pub fn to_toml_string(&self) -> Result<String, PolicyError> {
        let doc = PolicyDoc::try_from(self)?;
        toml::to_string_pretty(&doc).map_err(|e| PolicyError::Serialize {
            reason: e.to_string(),
        })
    }
}

/// Serde bridge for the TOML document form. Hooks flatten their period
/// fields (`value`/`start`/`end`/`duration_secs`) next to the `type` tag.
#[derive(Serialize, Deserialize)]
struct PolicyDoc {
    id: String,
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timezone: Option<String>,
    #[serde(default)]
    clock_skew_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_attempts: Option<u32>,
    #[serde(default)]
    single_use: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    hooks: Vec<HookDoc>,
}

#[derive(Serialize, Deserialize)]
struct HookDoc {
    #[serde(rename = "type")]
    kind: HookKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration_secs: Option<u64>,
}

impl TryFrom<PolicyDoc> for Policy {
    type Error = PolicyError;

    fn try_from(doc: PolicyDoc) -> Result<Self, PolicyError> {
        let hooks = doc
            .hooks
            .into_iter()
            .map(Hook::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            id: doc.id,
            hooks,
            timezone: doc.timezone,
            clock_skew_secs: doc.clock_skew_secs,
            max_attempts: doc.max_attempts,
            single_use: doc.single_use,
            version: doc.version,
        })
    }
}

impl TryFrom<HookDoc> for Hook {
    type Error = PolicyError;

    fn try_from(doc: HookDoc) -> Result<Self, PolicyError> {
        let kind = doc.kind;
        let period_for_bound = |doc: HookDoc| -> Result<Period, PolicyError> {
            match (doc.value, doc.start, doc.end) {
                (Some(value), None, None) => Ok(Period::instant(value)),
                (None, Some(start), Some(end)) => Period::range(start, end),
                _ => Err(PolicyError::Parse {
                    reason: format!(
                        "{} requires either 'value' or both 'start' and 'end'",
                        kind.as_str()
                    ),
                }),
            }
        };

        match kind {
            HookKind::OnlyBefore => Ok(Self::OnlyBefore {
                period: period_for_bound(doc)?,
            }),
            HookKind::OnlyAfter => Ok(Self::OnlyAfter {
                period: period_for_bound(doc)?,
            }),
            HookKind::OnlyWithin => match (doc.start, doc.end) {
                (Some(start), Some(end)) => Ok(Self::OnlyWithin {
                    period: Period::range(start, end)?,
                }),
                _ => Err(PolicyError::Parse {
                    reason: "onlyWithin requires both 'start' and 'end'".to_owned(),
                }),
            },
            HookKind::OnlyFor => match doc.duration_secs {
                Some(duration_secs) => Ok(Self::OnlyFor { duration_secs }),
                None => Err(PolicyError::Parse {
                    reason: "onlyFor requires 'duration_secs'".to_owned(),
                }),
            },
        }
    }
}

impl TryFrom<&Policy> for PolicyDoc {
    type Error = PolicyError;

    fn try_from(policy: &Policy) -> Result<Self, PolicyError> {
        let hooks = policy
            .hooks
            .iter()
            .map(HookDoc::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            id: policy.id.clone(),
            version: policy.version,
            timezone: policy.timezone.clone(),
            clock_skew_secs: policy.clock_skew_secs,
            max_attempts: policy.max_attempts,
            single_use: policy.single_use,
            hooks,
        })
    }
}

impl TryFrom<&Hook> for HookDoc {
    type Error = PolicyError;

    fn try_from(hook: &Hook) -> Result<Self, PolicyError> {
        let mut doc = Self {
            kind: hook.kind(),
            value: None,
            start: None,
            end: None,
            duration_secs: None,
        };
        match hook {
            Hook::OnlyBefore { period } | Hook::OnlyAfter { period } | Hook::OnlyWithin { period } => {
                match period {
                    Period::Instant { value } => doc.value = Some(*value),
                    Period::Range { start, end } => {
                        doc.start = Some(*start);
                        doc.end = Some(*end);
                    }
                    Period::Duration { .. } => {
                        return Err(PolicyError::Serialize {
                            reason: format!(
                                "{} over a relative duration has no document form",
                                doc.kind.as_str()
                            ),
                        });
                    }
                }
            }
            Hook::OnlyFor { duration_secs } => doc.duration_secs = Some(*duration_secs),
        }
        Ok(doc)
    }
}
