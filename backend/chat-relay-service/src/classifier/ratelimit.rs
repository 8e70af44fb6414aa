//! Daily intro quota.
//!
//! Each verification tier grants a number of intros per rolling day. Every recent report, and every
//! two recent rude messages, halves the quota.

use crate::store::{RateLimitSnapshot, VerificationLevel};

pub fn daily_quota(level: VerificationLevel) -> u32 {
    match level {
        VerificationLevel::None => 0,
        VerificationLevel::Unverified => 10,
        VerificationLevel::Basics => 20,
        VerificationLevel::Photos => 30,
    }
}

pub fn effective_quota(snapshot: &RateLimitSnapshot) -> u32 {
    let penalty = snapshot
        .recent_reports
        .saturating_add(snapshot.recent_rude_messages / 2);
    daily_quota(snapshot.verification_level)
        .checked_shr(penalty)
        .unwrap_or(0)
}

/// The tier the sender is limited at, or `None` when another intro is allowed.
///
/// A quota of zero is reported as the top tier so the client doesn't suggest verifying further.
pub fn limited_tier(snapshot: &RateLimitSnapshot) -> Option<VerificationLevel> {
    let quota = effective_quota(snapshot);
    if quota == 0 {
        return Some(VerificationLevel::Photos);
    }
    (snapshot.intros_today >= quota).then_some(snapshot.verification_level)
}
