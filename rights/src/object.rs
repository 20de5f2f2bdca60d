//! Port objects
//!
//! A port is the shared, reference-counted target of rights. Every entry
//! in every space that holds a right to the port shares one `Arc<Port>`;
//! the mutable state behind it is protected by the port lock.
//!
//! Lock order: the port lock is acquired only after the holder has a
//! stable reference to the owning entry (table lock first, never the
//! reverse).

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};

use spin::Mutex;

use crate::{
    error::{Result, RightError},
    name::Name,
    notify::{Notification, PendingNotice},
    space::SpaceId,
};

/// Shared reference to a port
pub type PortRef = Arc<Port>;

/// Guard value installed on a receive right
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortGuard {
    /// Opaque context that must be presented to guarded operations
    pub context: u64,
    /// Strict guards also forbid moving the receive right
    pub strict: bool,
}

/// Creation-time port attributes
#[derive(Debug, Clone, Copy, Default)]
pub struct PortOptions {
    pub guard: Option<PortGuard>,
    pub immovable_send: bool,
    pub immovable_receive: bool,
    pub pinned: bool,
    pub reply_port: bool,
    pub special_reply: bool,
}

/// Mutable port state, protected by the port lock
pub(crate) struct PortState {
    pub(crate) active: bool,
    pub(crate) send_rights: u32,
    pub(crate) send_once_rights: u32,
    pub(crate) make_send_count: u32,
    /// Back-reference to the space and name holding the receive right.
    /// Never an ownership edge.
    pub(crate) receiver: Option<(SpaceId, Name)>,
    pub(crate) guard: Option<PortGuard>,
    pub(crate) immovable_send: bool,
    pub(crate) immovable_receive: bool,
    pub(crate) pinned: bool,
    pub(crate) reply_port: bool,
    pub(crate) special_reply: bool,
    /// Send-once right armed to fire when `send_rights` reaches zero
    pub(crate) no_senders_notify: Option<SendOnceRight>,
    /// Notification messages delivered to this port
    pub(crate) delivered: VecDeque<Notification>,
}

/// A lockable, reference-counted target of rights
pub struct Port {
    pub(crate) state: Mutex<PortState>,
}

impl Port {
    /// Create an active port and the unique receive right for it
    pub fn create() -> (PortRef, ReceiveRight) {
        Self::create_with(PortOptions::default())
    }

    /// Create a port with explicit attributes
    pub fn create_with(opts: PortOptions) -> (PortRef, ReceiveRight) {
        let port = Arc::new(Port {
            state: Mutex::new(PortState {
                active: true,
                send_rights: 0,
                send_once_rights: 0,
                make_send_count: 0,
                receiver: None,
                guard: opts.guard,
                // pinned implies immovable_send
                immovable_send: opts.immovable_send || opts.pinned,
                immovable_receive: opts.immovable_receive,
                pinned: opts.pinned,
                reply_port: opts.reply_port,
                special_reply: opts.special_reply,
                no_senders_notify: None,
                delivered: VecDeque::new(),
            }),
        });
        let receive = ReceiveRight::from_raw(port.clone());
        (port, receive)
    }

    /// Whether the port has not been destroyed
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Outstanding send-right count
    pub fn send_rights(&self) -> u32 {
        self.state.lock().send_rights
    }

    /// Outstanding send-once-right count
    pub fn send_once_rights(&self) -> u32 {
        self.state.lock().send_once_rights
    }

    /// Number of send rights ever made from the receive right
    pub fn make_send_count(&self) -> u32 {
        self.state.lock().make_send_count
    }

    /// Whether a no-senders notification is currently armed
    pub fn has_no_senders_notify(&self) -> bool {
        self.state.lock().no_senders_notify.is_some()
    }

    /// Validate a caller-presented guard context.
    ///
    /// Unguarded ports accept any context.
    pub fn check_guard(&self, context: u64) -> Result<()> {
        match self.state.lock().guard {
            Some(guard) if guard.context != context => Err(RightError::IncorrectGuard),
            _ => Ok(()),
        }
    }

    pub(crate) fn guard_context(&self) -> Option<u64> {
        self.state.lock().guard.map(|g| g.context)
    }

    /// Make a new send right from the receive right.
    ///
    /// The caller must hold the receive right for this port.
    pub fn make_send(self: &Arc<Self>) -> SendRight {
        let mut st = self.state.lock();
        st.send_rights = st.send_rights.saturating_add(1);
        st.make_send_count = st.make_send_count.wrapping_add(1);
        drop(st);
        SendRight::from_raw(self.clone())
    }

    /// Make a new send-once right from the receive right.
    ///
    /// The caller must hold the receive right for this port.
    pub fn make_send_once(self: &Arc<Self>) -> SendOnceRight {
        let mut st = self.state.lock();
        st.send_once_rights = st.send_once_rights.saturating_add(1);
        drop(st);
        SendOnceRight::from_raw(self.clone())
    }

    /// Take the notification messages delivered to this port so far
    pub fn drain_notifications(&self) -> Vec<Notification> {
        self.state.lock().delivered.drain(..).collect()
    }

    /// Mark the port inactive and clear the receiver back-reference.
    ///
    /// Returns the cancelled no-senders registration, if any; the caller
    /// releases it outside the port lock.
    pub(crate) fn destroy(port: &PortRef) -> Option<SendOnceRight> {
        let mut st = port.state.lock();
        if !st.active {
            return None;
        }
        st.active = false;
        st.receiver = None;
        st.no_senders_notify.take()
    }

    /// Release `count` send rights at once.
    ///
    /// When the count reaches zero on an active port, the no-senders
    /// notification is disarmed and returned for delivery.
    pub(crate) fn release_send_n(port: &PortRef, count: u32) -> Option<PendingNotice> {
        let mut st = port.state.lock();
        st.send_rights = st.send_rights.saturating_sub(count);
        if st.active && st.send_rights == 0 {
            if let Some(soright) = st.no_senders_notify.take() {
                let mscount = st.make_send_count;
                return Some(PendingNotice {
                    soright,
                    note: Notification::NoSenders { mscount },
                });
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// In-flight rights
// ---------------------------------------------------------------------------

/// An in-flight send right: owns one of the port's `send_rights`.
///
/// Cloning copies the right (bumping the count); dropping releases it,
/// arming the no-senders notification when the last one goes away.
pub struct SendRight {
    port: Option<PortRef>,
}

impl SendRight {
    /// Wrap a port reference whose send-right count the caller has
    /// already accounted for
    pub(crate) fn from_raw(port: PortRef) -> Self {
        Self { port: Some(port) }
    }

    /// The port this right names
    pub fn port(&self) -> &PortRef {
        self.port.as_ref().expect("send right already consumed")
    }

    /// Unwrap without releasing; the count transfers to the caller
    pub(crate) fn into_raw(mut self) -> PortRef {
        self.port.take().expect("send right already consumed")
    }

    /// Release the right explicitly
    pub fn release(self) {
        drop(self);
    }
}

impl Clone for SendRight {
    fn clone(&self) -> Self {
        let port = self.port().clone();
        {
            let mut st = port.state.lock();
            st.send_rights = st.send_rights.saturating_add(1);
        }
        Self { port: Some(port) }
    }
}

impl Drop for SendRight {
    fn drop(&mut self) {
        if let Some(port) = self.port.take() {
            if let Some(notice) = Port::release_send_n(&port, 1) {
                notice.fire();
            }
        }
    }
}

/// An in-flight send-once right: owns one of the port's
/// `send_once_rights`. Consumed either by delivering a notification
/// message or by explicit release; dropping releases.
pub struct SendOnceRight {
    port: Option<PortRef>,
}

impl SendOnceRight {
    pub(crate) fn from_raw(port: PortRef) -> Self {
        Self { port: Some(port) }
    }

    /// The port this right names
    pub fn port(&self) -> &PortRef {
        self.port.as_ref().expect("send-once right already consumed")
    }

    pub(crate) fn into_raw(mut self) -> PortRef {
        self.port.take().expect("send-once right already consumed")
    }

    /// Consume the right by delivering a notification message to its
    /// target port. Messages to an inactive port are discarded.
    pub(crate) fn deliver(mut self, note: Notification) {
        if let Some(port) = self.port.take() {
            let mut st = port.state.lock();
            st.send_once_rights = st.send_once_rights.saturating_sub(1);
            if st.active {
                st.delivered.push_back(note);
            }
        }
    }

    /// Consume the right without delivering anything
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(port) = self.port.take() {
            let mut st = port.state.lock();
            st.send_once_rights = st.send_once_rights.saturating_sub(1);
        }
    }
}

impl Drop for SendOnceRight {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// An in-flight receive right. Exactly one exists per port; dropping it
/// without re-homing destroys the port.
pub struct ReceiveRight {
    port: Option<PortRef>,
}

impl ReceiveRight {
    pub(crate) fn from_raw(port: PortRef) -> Self {
        Self { port: Some(port) }
    }

    /// The port this right names
    pub fn port(&self) -> &PortRef {
        self.port.as_ref().expect("receive right already consumed")
    }

    pub(crate) fn into_raw(mut self) -> PortRef {
        self.port.take().expect("receive right already consumed")
    }
}

impl Drop for ReceiveRight {
    fn drop(&mut self) {
        if let Some(port) = self.port.take() {
            if let Some(cancelled) = Port::destroy(&port) {
                cancelled.release();
            }
        }
    }
}
