//! Port name codec
//!
//! A name is the caller-visible handle for a right: a packed
//! (table index, generation) pair. The generation half is bumped every
//! time the underlying slot transitions to or from the unused state, so
//! a recycled index never aliases a stale name.

use core::fmt;

/// 64-bit port name with packed fields
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(u64);

impl Name {
    /// Create a name from a slot index and the slot's current generation
    pub fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    /// Get the table index (low 32 bits)
    #[inline]
    pub fn index(&self) -> u32 {
        self.0 as u32
    }

    /// Get the generation counter (high 32 bits)
    #[inline]
    pub fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Convert to raw u64 value
    #[inline]
    pub fn to_u64(self) -> u64 {
        self.0
    }

    /// Create from raw u64 value
    #[inline]
    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// The null name; never denotes an entry
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// The distinguished dead name returned when a right could not be
    /// installed because its port was already destroyed
    #[inline]
    pub const fn dead() -> Self {
        Self(u64::MAX)
    }

    /// Check if this is the null name
    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Check if this is the distinguished dead name
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Name(null)")
        } else if self.is_dead() {
            write!(f, "Name(dead)")
        } else {
            write!(f, "Name({}/{})", self.index(), self.generation())
        }
    }
}
