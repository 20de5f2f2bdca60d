//! Notification kinds and deferred delivery
//!
//! A registered notification is a send-once right held until its
//! triggering condition occurs, then consumed to deliver a
//! [`Notification`] message to the right's target port.
//!
//! Delivery never happens while a space's table lock is held: operations
//! accumulate work in a [`Deferred`] queue and run it after releasing
//! their locks, because delivery can re-enter another port.

use alloc::vec::Vec;

use crate::{
    name::Name,
    object::{Port, PortRef, SendOnceRight},
};

/// Notification kinds that can be registered against a name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    /// Fires when the name's port is destroyed and the entry folds to a
    /// dead name
    DeadName,
    /// Fires when the name's right is deleted out from under it (moved
    /// away or deallocated)
    PortDeleted,
    /// Fires when the port's outstanding send-right count reaches zero
    NoSenders,
}

impl NotifyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeadName => "dead-name",
            Self::PortDeleted => "port-deleted",
            Self::NoSenders => "no-senders",
        }
    }
}

/// The message a consumed notification registration carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The named right now denotes a dead name
    DeadName { name: Name },
    /// The named right was deleted from its space
    PortDeleted { name: Name },
    /// The port has no outstanding send rights; carries the
    /// make-send count observed at arming time
    NoSenders { mscount: u32 },
}

/// A notification whose trigger has fired but whose delivery is still
/// pending on lock release
pub(crate) struct PendingNotice {
    pub(crate) soright: SendOnceRight,
    pub(crate) note: Notification,
}

impl PendingNotice {
    pub(crate) fn fire(self) {
        self.soright.deliver(self.note);
    }
}

/// Work deferred until all table locks are released
pub(crate) struct Deferred {
    notices: Vec<PendingNotice>,
    releases: Vec<SendOnceRight>,
    destroys: Vec<PortRef>,
}

impl Deferred {
    pub(crate) fn new() -> Self {
        Self {
            notices: Vec::new(),
            releases: Vec::new(),
            destroys: Vec::new(),
        }
    }

    pub(crate) fn push_notice(&mut self, notice: PendingNotice) {
        self.notices.push(notice);
    }

    pub(crate) fn push_opt(&mut self, notice: Option<PendingNotice>) {
        if let Some(n) = notice {
            self.notices.push(n);
        }
    }

    /// Queue a send-once right to be released without delivery
    pub(crate) fn push_release(&mut self, soright: SendOnceRight) {
        self.releases.push(soright);
    }

    /// Queue a port destruction
    pub(crate) fn push_destroy(&mut self, port: PortRef) {
        self.destroys.push(port);
    }

    /// Destroy queued ports, release cancelled registrations, then
    /// deliver fired notifications
    pub(crate) fn run(mut self) {
        for port in self.destroys.drain(..) {
            if let Some(cancelled) = Port::destroy(&port) {
                self.releases.push(cancelled);
            }
        }
        for soright in self.releases.drain(..) {
            soright.release();
        }
        for notice in self.notices.drain(..) {
            notice.fire();
        }
    }
}
