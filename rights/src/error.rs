//! Right operation error types and result definitions

use core::fmt;

/// Right operation result type
pub type Result<T> = core::result::Result<T, RightError>;

/// Errors returned by right operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RightError {
    /// The space has been terminated
    InvalidTask,
    /// No such slot, or the generation does not match
    InvalidName,
    /// The right kind does not support the requested operation
    InvalidRight,
    /// Reference-count delta out of range
    InvalidValue,
    /// Operation forbidden by immovability or pinning
    InvalidCapability,
    /// Guard context mismatch on a guarded receive right
    IncorrectGuard,
    /// Table growth or entry allocation failure
    ResourceShortage,
}

impl RightError {
    /// Get a static string description of the error
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidTask => "Space has been terminated",
            Self::InvalidName => "No such name in space",
            Self::InvalidRight => "Right kind does not support operation",
            Self::InvalidValue => "Reference-count delta out of range",
            Self::InvalidCapability => "Operation forbidden by immovability or pinning",
            Self::IncorrectGuard => "Guard context mismatch",
            Self::ResourceShortage => "Entry allocation failure",
        }
    }

    /// Convert error to a numeric code for system calls
    pub fn to_errno(self) -> i32 {
        match self {
            Self::InvalidTask => -1,
            Self::InvalidName => -2,
            Self::InvalidRight => -3,
            Self::InvalidValue => -4,
            Self::InvalidCapability => -5,
            Self::IncorrectGuard => -6,
            Self::ResourceShortage => -7,
        }
    }
}

impl fmt::Display for RightError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
