//! Policy evaluation engine.
//!
//! Pure, side-effect-free, deterministic: for a fixed `(policy, context)`
//! pair, [`Policy::evaluate`] returns an identical [`PolicyEvaluation`] on
//! every call, from any thread, with no I/O and no mutation.
//!
//! Evaluation order is fixed and stops at the first disqualifying condition:
//!
//! 1. presented-value integrity check (`InvalidSignature`),
//! 2. single-use and attempt-limit checks (`PolicyViolation`),
//! 3. hooks in declared order, AND-combined; a too-early failure is
//!    `NotYetValid`, a too-late failure is `Expired`,
//! 4. otherwise `Accept`.
//!
//! `clock_skew_secs` widens every boundary outward symmetrically, and all
//! boundaries are inclusive.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::crypto::Secret;
use crate::period::{Hook, HookKind, Period};
use crate::policy::Policy;

/// Outcome category of one evaluation. Mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// Every check passed; the credential may be released.
    Accept,
    /// Generic refusal, reserved for collaborator layers. The engine itself
    /// always reports one of the specific verdicts below.
    Reject,
    /// The context time is past an effective upper boundary.
    Expired,
    /// The context time is before an effective lower boundary.
    NotYetValid,
    /// The presented value does not match the stored credential.
    InvalidSignature,
    /// A non-temporal constraint failed (usage caps, missing anchor,
    /// unresolvable hook).
    PolicyViolation,
}

impl Verdict {
    /// Stable label used in diagnostics and audit entries.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::InvalidSignature => "invalid_signature",
            Self::PolicyViolation => "policy_violation",
        }
    }

    #[must_use]
    pub fn is_accept(self) -> bool {
        self == Self::Accept
    }
}

/// The runtime facts a policy is evaluated against.
///
/// Built fresh per evaluation call, never persisted.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    /// The current time, UTC.
    pub now_utc: DateTime<Utc>,
    /// When the credential was created, the primary `onlyFor` anchor.
    pub created_at: Option<DateTime<Utc>>,
    /// When the credential was last used, the fallback anchor.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Prior attempts against this credential (successes, plus failures when
    /// the policy tracks them).
    pub usage_count: u32,
    /// A presented secret to check against the stored credential.
    pub attempted_value: Option<Secret>,
    /// SHA-256 commitment of the true secret, supplied by the store so the
    /// engine can check `attempted_value` without ever seeing the stored
    /// plaintext.
    pub secret_digest: Option<[u8; 32]>,
}

impl EvaluationContext {
    /// A context with only the clock set.
    #[must_use]
    pub fn at(now_utc: DateTime<Utc>) -> Self {
        Self {
            now_utc,
            created_at: None,
            last_used_at: None,
            usage_count: 0,
            attempted_value: None,
            secret_digest: None,
        }
    }
}

/// Descriptor of a hook that was checked and passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedHook {
    /// Position in the policy's declared hook order.
    pub index: usize,
    pub kind: HookKind,
}

/// The result of one evaluation: a verdict plus secret-free diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    pub verdict: Verdict,
    /// Every hook that was checked and passed, in declared order.
    pub matched_hooks: Vec<MatchedHook>,
    /// Diagnostic key/value pairs (`reason`, `failed_hook`, `margin_secs`,
    /// `seconds_until_valid`, `seconds_since_expiry`). Never contains the
    /// presented secret.
    pub details: BTreeMap<String, String>,
}

impl PolicyEvaluation {
    /// An unconditional `Accept`, used for credentials with no policy
    /// attached.
    #[must_use]
    pub fn unconditional_accept() -> Self {
        Self {
            verdict: Verdict::Accept,
            matched_hooks: Vec::new(),
            details: BTreeMap::new(),
        }
    }
}

/// Per-hook resolution against the context clock.
enum HookOutcome {
    Pass { margin_secs: i64 },
    TooEarly { by_secs: i64 },
    TooLate { by_secs: i64 },
    Unresolvable { reason: String },
    NoAnchor,
}

impl Policy {
    /// Evaluate this policy against a context.
    ///
    /// Pure and deterministic; safe to call concurrently. Returns a
    /// [`PolicyEvaluation`]; temporal refusals are verdicts, not errors.
    #[must_use]
    pub fn evaluate(&self, ctx: &EvaluationContext) -> PolicyEvaluation {
        let mut details = BTreeMap::new();

        // 1. Presented-value integrity.
        if let (Some(attempt), Some(expected)) = (&ctx.attempted_value, &ctx.secret_digest) {
            let digest: [u8; 32] = Sha256::digest(attempt.as_bytes()).into();
            if !bool::from(digest.ct_eq(expected)) {
                details.insert(
                    "reason".to_owned(),
                    "presented value does not match stored credential".to_owned(),
                );
                return PolicyEvaluation {
                    verdict: Verdict::InvalidSignature,
                    matched_hooks: Vec::new(),
                    details,
                };
            }
        }

        // 2. Usage caps.
        if self.single_use && ctx.usage_count >= 1 {
            details.insert(
                "reason".to_owned(),
                "single-use credential already consumed".to_owned(),
            );
            return PolicyEvaluation {
                verdict: Verdict::PolicyViolation,
                matched_hooks: Vec::new(),
                details,
            };
        }
        if let Some(max) = self.max_attempts {
            if ctx.usage_count >= max {
                details.insert("reason".to_owned(), "attempt limit reached".to_owned());
                details.insert("max_attempts".to_owned(), max.to_string());
                return PolicyEvaluation {
                    verdict: Verdict::PolicyViolation,
                    matched_hooks: Vec::new(),
                    details,
                };
            }
        }

        // 3. Hooks, in declared order, AND-combined.
        let skew = seconds(self.clock_skew_secs);
        let mut matched_hooks = Vec::new();
        let mut min_margin: Option<i64> = None;

        for (index, hook) in self.hooks.iter().enumerate() {
            match check_hook(hook, ctx, skew) {
                HookOutcome::Pass { margin_secs } => {
                    matched_hooks.push(MatchedHook {
                        index,
                        kind: hook.kind(),
                    });
                    min_margin = Some(min_margin.map_or(margin_secs, |m| m.min(margin_secs)));
                }
                HookOutcome::TooEarly { by_secs } => {
                    details.insert("failed_hook".to_owned(), index.to_string());
                    details.insert("reason".to_owned(), "before effective lower boundary".to_owned());
                    details.insert("seconds_until_valid".to_owned(), by_secs.to_string());
                    return PolicyEvaluation {
                        verdict: Verdict::NotYetValid,
                        matched_hooks,
                        details,
                    };
                }
                HookOutcome::TooLate { by_secs } => {
                    details.insert("failed_hook".to_owned(), index.to_string());
                    details.insert("reason".to_owned(), "past effective upper boundary".to_owned());
                    details.insert("seconds_since_expiry".to_owned(), by_secs.to_string());
                    return PolicyEvaluation {
                        verdict: Verdict::Expired,
                        matched_hooks,
                        details,
                    };
                }
                HookOutcome::Unresolvable { reason } => {
                    details.insert("failed_hook".to_owned(), index.to_string());
                    details.insert("reason".to_owned(), reason);
                    return PolicyEvaluation {
                        verdict: Verdict::PolicyViolation,
                        matched_hooks,
                        details,
                    };
                }
                HookOutcome::NoAnchor => {
                    details.insert("failed_hook".to_owned(), index.to_string());
                    details.insert("reason".to_owned(), "no anchor available".to_owned());
                    return PolicyEvaluation {
                        verdict: Verdict::PolicyViolation,
                        matched_hooks,
                        details,
                    };
                }
            }
        }

        // 4. Accept.
        if let Some(margin) = min_margin {
            details.insert("margin_secs".to_owned(), margin.to_string());
        }
        PolicyEvaluation {
            verdict: Verdict::Accept,
            matched_hooks,
            details,
        }
    }
}

fn seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Resolve one hook to a boundary comparison. Boundaries are inclusive and
/// widened outward by `skew`. Arithmetic overflow saturates to "unbounded",
/// which can only relax a check, never tighten it.
fn check_hook(hook: &Hook, ctx: &EvaluationContext, skew: Duration) -> HookOutcome {
    let now = ctx.now_utc;
    match hook {
        Hook::OnlyBefore { period } => {
            let cutoff = match period {
                Period::Instant { value } => *value,
                Period::Range { start, .. } => *start,
                Period::Duration { .. } => {
                    return HookOutcome::Unresolvable {
                        reason: "onlyBefore cannot resolve a relative duration".to_owned(),
                    };
                }
            };
            check_upper(now, cutoff.checked_add_signed(skew))
        }
        Hook::OnlyAfter { period } => {
            let floor = match period {
                Period::Instant { value } => *value,
                Period::Range { end, .. } => *end,
                Period::Duration { .. } => {
                    return HookOutcome::Unresolvable {
                        reason: "onlyAfter cannot resolve a relative duration".to_owned(),
                    };
                }
            };
            check_lower(now, floor.checked_sub_signed(skew))
        }
        Hook::OnlyWithin { period } => match period {
            Period::Range { start, end } => check_window(
                now,
                start.checked_sub_signed(skew),
                end.checked_add_signed(skew),
            ),
            Period::Instant { .. } | Period::Duration { .. } => HookOutcome::Unresolvable {
                reason: "onlyWithin requires a range period".to_owned(),
            },
        },
        Hook::OnlyFor { duration_secs } => {
            let Some(anchor) = ctx.created_at.or(ctx.last_used_at) else {
                return HookOutcome::NoAnchor;
            };
            let upper = anchor
                .checked_add_signed(seconds(*duration_secs))
                .and_then(|end| end.checked_add_signed(skew));
            check_window(now, anchor.checked_sub_signed(skew), upper)
        }
    }
}

fn check_window(
    now: DateTime<Utc>,
    lower: Option<DateTime<Utc>>,
    upper: Option<DateTime<Utc>>,
) -> HookOutcome {
    if let HookOutcome::TooEarly { by_secs } = check_lower(now, lower) {
        return HookOutcome::TooEarly { by_secs };
    }
    if let HookOutcome::TooLate { by_secs } = check_upper(now, upper) {
        return HookOutcome::TooLate { by_secs };
    }
    let lower_margin = lower.map(|b| (now - b).num_seconds());
    let upper_margin = upper.map(|b| (b - now).num_seconds());
    let margin_secs = match (lower_margin, upper_margin) {
        (Some(a), Some(b)) => a.min(b),
        (Some(m), None) | (None, Some(m)) => m,
        (None, None) => i64::MAX,
    };
    HookOutcome::Pass { margin_secs }
}

fn check_lower(now: DateTime<Utc>, floor: Option<DateTime<Utc>>) -> HookOutcome {
    match floor {
        Some(floor) if now < floor => HookOutcome::TooEarly {
            by_secs: (floor - now).num_seconds(),
        },
        Some(floor) => HookOutcome::Pass {
            margin_secs: (now - floor).num_seconds(),
        },
        None => HookOutcome::Pass {
            margin_secs: i64::MAX,
        },
    }
}

fn check_upper(now: DateTime<Utc>, cutoff: Option<DateTime<Utc>>) -> HookOutcome {
    match cutoff {
        Some(cutoff) if now > cutoff => HookOutcome::TooLate {
            by_secs: (now - cutoff).num_seconds(),
        },
        Some(cutoff) => HookOutcome::Pass {
            margin_secs: (cutoff - now).num_seconds(),
        },
        None => HookOutcome::Pass {
            margin_secs: i64::MAX,
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn business_hours() -> Policy {
        Policy::new("window").with_hook(Hook::OnlyWithin {
            period: Period::range(ts("2026-02-01T09:00:00Z"), ts("2026-02-01T17:00:00Z")).unwrap(),
        })
    }

    #[test]
    fn window_boundaries_are_inclusive() {
        let policy = business_hours();
        for now in ["2026-02-01T09:00:00Z", "2026-02-01T17:00:00Z"] {
            let eval = policy.evaluate(&EvaluationContext::at(ts(now)));
            assert_eq!(eval.verdict, Verdict::Accept, "at {now}");
        }
    }

    #[test]
    fn window_rejects_outside() {
        let policy = business_hours();
        let early = policy.evaluate(&EvaluationContext::at(ts("2026-02-01T08:59:59Z")));
        assert_eq!(early.verdict, Verdict::NotYetValid);
        assert_eq!(early.details.get("seconds_until_valid").unwrap(), "1");

        let late = policy.evaluate(&EvaluationContext::at(ts("2026-02-01T17:00:01Z")));
        assert_eq!(late.verdict, Verdict::Expired);
        assert_eq!(late.details.get("seconds_since_expiry").unwrap(), "1");
    }

    #[test]
    fn clock_skew_widens_boundaries_symmetrically() {
        let mut policy = business_hours();
        policy.clock_skew_secs = 60;

        // 55 seconds early: inside the widened window.
        let eval = policy.evaluate(&EvaluationContext::at(ts("2026-02-01T08:59:05Z")));
        assert_eq!(eval.verdict, Verdict::Accept);

        // 120 seconds early: still too early.
        let eval = policy.evaluate(&EvaluationContext::at(ts("2026-02-01T08:58:00Z")));
        assert_eq!(eval.verdict, Verdict::NotYetValid);

        // 55 seconds late: inside on the other side.
        let eval = policy.evaluate(&EvaluationContext::at(ts("2026-02-01T17:00:55Z")));
        assert_eq!(eval.verdict, Verdict::Accept);
    }

    #[test]
    fn absurd_clock_skew_saturates_to_unbounded() {
        let mut policy = business_hours();
        policy.clock_skew_secs = u64::MAX;
        let eval = policy.evaluate(&EvaluationContext::at(ts("1990-01-01T00:00:00Z")));
        assert_eq!(eval.verdict, Verdict::Accept);
    }

    #[test]
    fn only_for_anchors_to_created_at() {
        let policy = Policy::new("p").with_hook(Hook::OnlyFor { duration_secs: 7200 });
        let mut ctx = EvaluationContext::at(ts("2026-02-01T03:59:59Z"));
        ctx.created_at = Some(ts("2026-02-01T02:00:00Z"));
        assert_eq!(policy.evaluate(&ctx).verdict, Verdict::Accept);

        ctx.now_utc = ts("2026-02-01T04:00:01Z");
        assert_eq!(policy.evaluate(&ctx).verdict, Verdict::Expired);
    }

    #[test]
    fn only_for_falls_back_to_last_used_at() {
        let policy = Policy::new("p").with_hook(Hook::OnlyFor { duration_secs: 600 });
        let mut ctx = EvaluationContext::at(ts("2026-02-01T02:05:00Z"));
        ctx.last_used_at = Some(ts("2026-02-01T02:00:00Z"));
        assert_eq!(policy.evaluate(&ctx).verdict, Verdict::Accept);
    }

    #[test]
    fn only_for_without_anchor_is_policy_violation() {
        let policy = Policy::new("p").with_hook(Hook::OnlyFor { duration_secs: 600 });
        let eval = policy.evaluate(&EvaluationContext::at(ts("2026-02-01T02:00:00Z")));
        assert_eq!(eval.verdict, Verdict::PolicyViolation);
        assert_eq!(eval.details.get("reason").unwrap(), "no anchor available");
    }

    #[test]
    fn only_before_range_uses_start() {
        let policy = Policy::new("p").with_hook(Hook::OnlyBefore {
            period: Period::range(ts("2026-02-01T09:00:00Z"), ts("2026-02-01T17:00:00Z")).unwrap(),
        });
        let eval = policy.evaluate(&EvaluationContext::at(ts("2026-02-01T10:00:00Z")));
        assert_eq!(eval.verdict, Verdict::Expired);
    }

    #[test]
    fn only_after_range_uses_end() {
        let policy = Policy::new("p").with_hook(Hook::OnlyAfter {
            period: Period::range(ts("2026-02-01T09:00:00Z"), ts("2026-02-01T17:00:00Z")).unwrap(),
        });
        let eval = policy.evaluate(&EvaluationContext::at(ts("2026-02-01T10:00:00Z")));
        assert_eq!(eval.verdict, Verdict::NotYetValid);

        let eval = policy.evaluate(&EvaluationContext::at(ts("2026-02-01T17:00:00Z")));
        assert_eq!(eval.verdict, Verdict::Accept);
    }

    #[test]
    fn hooks_combine_with_and() {
        let policy = Policy::new("p")
            .with_hook(Hook::OnlyAfter {
                period: Period::instant(ts("2026-02-01T09:00:00Z")),
            })
            .with_hook(Hook::OnlyBefore {
                period: Period::instant(ts("2026-02-01T17:00:00Z")),
            });

        let eval = policy.evaluate(&EvaluationContext::at(ts("2026-02-01T12:00:00Z")));
        assert_eq!(eval.verdict, Verdict::Accept);
        assert_eq!(eval.matched_hooks.len(), 2);
        assert_eq!(eval.matched_hooks[0].kind, HookKind::OnlyAfter);

        // The second hook fails even though the first passes.
        let eval = policy.evaluate(&EvaluationContext::at(ts("2026-02-01T18:00:00Z")));
        assert_eq!(eval.verdict, Verdict::Expired);
        assert_eq!(eval.matched_hooks.len(), 1);
        assert_eq!(eval.details.get("failed_hook").unwrap(), "1");
    }

    #[test]
    fn first_failing_hook_decides_verdict() {
        let policy = Policy::new("p")
            .with_hook(Hook::OnlyBefore {
                period: Period::instant(ts("2026-02-01T09:00:00Z")),
            })
            .with_hook(Hook::OnlyAfter {
                period: Period::instant(ts("2026-02-01T17:00:00Z")),
            });
        // now fails both; the first hook in declared order wins.
        let eval = policy.evaluate(&EvaluationContext::at(ts("2026-02-01T12:00:00Z")));
        assert_eq!(eval.verdict, Verdict::Expired);
        assert_eq!(eval.details.get("failed_hook").unwrap(), "0");
    }

    #[test]
    fn single_use_blocks_second_use() {
        let mut policy = Policy::new("p");
        policy.single_use = true;
        let mut ctx = EvaluationContext::at(ts("2026-02-01T12:00:00Z"));
        assert_eq!(policy.evaluate(&ctx).verdict, Verdict::Accept);

        ctx.usage_count = 1;
        let eval = policy.evaluate(&ctx);
        assert_eq!(eval.verdict, Verdict::PolicyViolation);
        assert_eq!(
            eval.details.get("reason").unwrap(),
            "single-use credential already consumed"
        );
    }

    #[test]
    fn max_attempts_blocks_at_cap() {
        let mut policy = Policy::new("p");
        policy.max_attempts = Some(3);
        let mut ctx = EvaluationContext::at(ts("2026-02-01T12:00:00Z"));
        ctx.usage_count = 2;
        assert_eq!(policy.evaluate(&ctx).verdict, Verdict::Accept);

        ctx.usage_count = 3;
        assert_eq!(policy.evaluate(&ctx).verdict, Verdict::PolicyViolation);
    }

    #[test]
    fn usage_caps_checked_before_hooks() {
        let mut policy = business_hours();
        policy.single_use = true;
        // Outside the window AND already used: the usage check wins.
        let mut ctx = EvaluationContext::at(ts("2026-02-01T20:00:00Z"));
        ctx.usage_count = 1;
        assert_eq!(policy.evaluate(&ctx).verdict, Verdict::PolicyViolation);
    }

    #[test]
    fn digest_mismatch_is_invalid_signature() {
        let policy = business_hours();
        let mut ctx = EvaluationContext::at(ts("2026-02-01T12:00:00Z"));
        ctx.attempted_value = Some(Secret::from("wrong-guess"));
        ctx.secret_digest = Some(Sha256::digest(b"the-real-secret").into());
        let eval = policy.evaluate(&ctx);
        assert_eq!(eval.verdict, Verdict::InvalidSignature);
        assert!(eval.matched_hooks.is_empty());
    }

    #[test]
    fn digest_match_passes_through_to_hooks() {
        let policy = business_hours();
        let mut ctx = EvaluationContext::at(ts("2026-02-01T12:00:00Z"));
        ctx.attempted_value = Some(Secret::from("the-real-secret"));
        ctx.secret_digest = Some(Sha256::digest(b"the-real-secret").into());
        assert_eq!(policy.evaluate(&ctx).verdict, Verdict::Accept);
    }

    #[test]
    fn integrity_check_precedes_usage_caps() {
        let mut policy = Policy::new("p");
        policy.single_use = true;
        let mut ctx = EvaluationContext::at(ts("2026-02-01T12:00:00Z"));
        ctx.usage_count = 5;
        ctx.attempted_value = Some(Secret::from("wrong"));
        ctx.secret_digest = Some(Sha256::digest(b"right").into());
        assert_eq!(policy.evaluate(&ctx).verdict, Verdict::InvalidSignature);
    }

    #[test]
    fn accept_reports_margin_to_nearest_boundary() {
        let policy = business_hours();
        let eval = policy.evaluate(&EvaluationContext::at(ts("2026-02-01T16:59:00Z")));
        assert_eq!(eval.verdict, Verdict::Accept);
        assert_eq!(eval.details.get("margin_secs").unwrap(), "60");
    }

    #[test]
    fn evaluation_is_deterministic() {
        let mut policy = business_hours();
        policy.clock_skew_secs = 60;
        policy.max_attempts = Some(10);
        let mut ctx = EvaluationContext::at(ts("2026-02-01T12:34:56Z"));
        ctx.created_at = Some(ts("2026-02-01T09:30:00Z"));
        ctx.usage_count = 4;

        let first = policy.evaluate(&ctx);
        for _ in 0..16 {
            assert_eq!(policy.evaluate(&ctx), first);
        }
        // Serialized form is bit-identical too (ordered details map).
        let a = serde_json::to_vec(&first).unwrap();
        let b = serde_json::to_vec(&policy.evaluate(&ctx)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn evaluation_is_identical_across_threads() {
        let mut policy = business_hours();
        policy.clock_skew_secs = 60;
        let mut ctx = EvaluationContext::at(ts("2026-02-01T12:34:56Z"));
        ctx.created_at = Some(ts("2026-02-01T09:30:00Z"));
        let expected = policy.evaluate(&ctx);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| assert_eq!(policy.evaluate(&ctx), expected));
            }
        });
    }

    #[test]
    fn empty_policy_accepts() {
        let policy = Policy::new("open");
        let eval = policy.evaluate(&EvaluationContext::at(ts("2026-02-01T12:00:00Z")));
        assert_eq!(eval.verdict, Verdict::Accept);
        assert!(eval.matched_hooks.is_empty());
        assert!(eval.details.is_empty());
    }
}
