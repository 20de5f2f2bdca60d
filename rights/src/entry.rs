//! Table entries
//!
//! An entry binds a name to a port together with the kind of right the
//! space holds through that name, a user-reference count, and at most
//! one pending notification registration. Entries are owned exclusively
//! by one slot of one space and are only mutated under the space's
//! write lock.

use crate::{
    notify::NotifyKind,
    object::{PortRef, SendOnceRight},
};

/// Maximum user-reference count. Counts peg here instead of
/// overflowing; further increments are silently absorbed and only an
/// all-at-once removal can un-peg them.
pub const UREFS_MAX: u32 = 0xFFFF;

/// The kind of right an entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RightKind {
    Send,
    Receive,
    SendReceive,
    SendOnce,
    PortSet,
    DeadName,
}

impl RightKind {
    /// Whether the kind carries send rights
    #[inline]
    pub fn holds_send(self) -> bool {
        matches!(self, Self::Send | Self::SendReceive)
    }

    /// Whether the kind carries the receive right
    #[inline]
    pub fn holds_receive(self) -> bool {
        matches!(self, Self::Receive | Self::SendReceive)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Receive => "receive",
            Self::SendReceive => "send-receive",
            Self::SendOnce => "send-once",
            Self::PortSet => "port-set",
            Self::DeadName => "dead-name",
        }
    }
}

/// The single notification registration slot of an entry
pub(crate) struct EntryNotify {
    pub(crate) kind: NotifyKind,
    pub(crate) soright: SendOnceRight,
}

/// A table slot binding a name to a port and a right kind
pub struct Entry {
    pub(crate) kind: RightKind,
    /// User references. For `Send`/`SendReceive` this counts send
    /// references (each owning one of the port's `send_rights`); for
    /// `DeadName` it counts dead references; the remaining kinds hold
    /// exactly one.
    pub(crate) user_refs: u32,
    /// Ownership link to the port; `None` for dead names and port sets
    pub(crate) object: Option<PortRef>,
    /// Pending dead-name/port-deleted registration; set only while
    /// `object` is present
    pub(crate) notify: Option<EntryNotify>,
    /// Marker that the entry held the receive right at some point
    pub(crate) ever_received: bool,
}

impl Entry {
    pub(crate) fn new(kind: RightKind, user_refs: u32, object: Option<PortRef>) -> Self {
        Self {
            kind,
            user_refs,
            object,
            notify: None,
            ever_received: kind.holds_receive(),
        }
    }

    /// Right kind currently held
    #[inline]
    pub fn kind(&self) -> RightKind {
        self.kind
    }

    /// Current user-reference count
    #[inline]
    pub fn user_refs(&self) -> u32 {
        self.user_refs
    }

    /// Whether the entry held the receive right at some point
    #[inline]
    pub fn ever_received(&self) -> bool {
        self.ever_received
    }

    /// Whether the count sits at its pegged maximum
    #[inline]
    pub(crate) fn is_pegged(&self) -> bool {
        self.user_refs == UREFS_MAX
    }

    /// Add user references, pegging at [`UREFS_MAX`]. Returns how many
    /// were actually added (the rest were absorbed by the peg).
    pub(crate) fn add_urefs(&mut self, count: u32) -> u32 {
        let added = count.min(UREFS_MAX - self.user_refs);
        self.user_refs += added;
        added
    }
}
