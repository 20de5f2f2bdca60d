//! Guard-violation audit channel
//!
//! Guard mismatches are reported on two channels: the caller receives an
//! ordinary [`RightError::IncorrectGuard`](crate::error::RightError), and
//! a violation record is appended here for security tooling to consume.

use alloc::vec::Vec;

use spin::RwLock;

use crate::{name::Name, space::SpaceId};

/// A recorded guard violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardViolation {
    /// Space the offending operation targeted
    pub space: SpaceId,
    /// Name of the guarded right
    pub name: Name,
    /// Operation that presented the wrong context
    pub operation: &'static str,
    /// Context registered on the port
    pub expected: u64,
    /// Context presented by the caller, if any
    pub presented: Option<u64>,
}

lazy_static::lazy_static! {
    static ref VIOLATIONS: RwLock<Vec<GuardViolation>> = RwLock::new(Vec::new());
}

/// Record a guard violation for auditing
pub(crate) fn record(violation: GuardViolation) {
    log::warn!(
        "guard violation: {} on {:?} in space {} (expected {:#x}, presented {:?})",
        violation.operation,
        violation.name,
        violation.space.0,
        violation.expected,
        violation.presented,
    );
    VIOLATIONS.write().push(violation);
}

/// Number of violations recorded since the last drain
pub fn count() -> usize {
    VIOLATIONS.read().len()
}

/// Take all recorded violations, leaving the record empty
pub fn drain() -> Vec<GuardViolation> {
    let mut violations = VIOLATIONS.write();
    core::mem::take(&mut *violations)
}
