//! Rights engine
//!
//! The policy layer over [`Space`] and [`Port`]: copy-in consumes a name
//! under a disposition and produces a transferable right, copy-out
//! installs a right into a space as a new or strengthened entry, and the
//! delta/destroy/destruct family adjusts or removes what a space holds.
//!
//! Every operation is atomic under the space write lock plus the port
//! lock; notification delivery and port destruction are deferred until
//! both are released.

use log::trace;

use crate::{
    audit::{self, GuardViolation},
    entry::{Entry, EntryNotify, RightKind},
    error::{Result, RightError},
    name::Name,
    notify::{Deferred, Notification, NotifyKind, PendingNotice},
    object::{Port, PortOptions, PortRef, PortState, ReceiveRight, SendOnceRight, SendRight},
    space::{port_key, EntryGuard, Space},
};

/// Dispositions a caller can apply to a name on copy-in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgDisposition {
    /// Mint a send right from a held receive right
    MakeSend,
    /// Mint a send-once right from a held receive right
    MakeSendOnce,
    /// Move the receive right out of the space
    MoveReceive,
    /// Copy a held send right
    CopySend,
    /// Move one send reference out of the space
    MoveSend,
    /// Move a held send-once right out of the space
    MoveSendOnce,
}

/// Dispositions for installing a right on copy-out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyoutDisposition {
    PortSend,
    PortSendOnce,
    PortReceive,
}

bitflags::bitflags! {
    /// Options accepted by [`copyin`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CopyinFlags: u32 {
        /// Accept dead names, yielding a dead placeholder
        const DEADOK = 1 << 0;
        /// Permit moving an immovable or strictly guarded receive right
        const MOVE_IMMOVABLE_RECEIVE = 1 << 1;
        /// Permit transferring rights of a reply port
        const MOVE_REPLY_PORT = 1 << 2;
        /// Permit moving the receive right of a special-reply port
        const MOVE_SPECIAL_REPLY = 1 << 3;
    }
}

/// A transferable right produced by [`copyin`]
pub enum CapRef {
    Send(SendRight),
    SendOnce(SendOnceRight),
    Receive(ReceiveRight),
    /// Placeholder for a dead name accepted under `DEADOK`
    Dead,
}

impl CapRef {
    /// The port the right names, if it is not a dead placeholder
    pub fn port(&self) -> Option<&PortRef> {
        match self {
            Self::Send(r) => Some(r.port()),
            Self::SendOnce(r) => Some(r.port()),
            Self::Receive(r) => Some(r.port()),
            Self::Dead => None,
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Dead)
    }
}

/// The result of a copy-in
pub struct CopiedRight {
    /// The right produced for the caller to transfer
    pub cap: CapRef,
    /// A dead-name registration displaced when the receive right was
    /// moved out; the caller delivers it as a port-deleted notification
    /// or releases it
    pub displaced_notify: Option<SendOnceRight>,
}

/// Entry kinds creatable by explicit allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// A fresh port, held through its receive right
    Receive,
    /// An empty port set in formation
    PortSet,
    /// A dead name with one user reference
    DeadName,
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Allocate a fresh entry of the requested kind
pub fn allocate(space: &Space, kind: AllocKind) -> Result<Name> {
    match kind {
        AllocKind::Receive => allocate_with(space, PortOptions::default()),
        AllocKind::PortSet => allocate_objectless(space, RightKind::PortSet),
        AllocKind::DeadName => allocate_objectless(space, RightKind::DeadName),
    }
}

/// Allocate a fresh port with explicit attributes, installing its
/// receive right in the space
pub fn allocate_with(space: &Space, opts: PortOptions) -> Result<Name> {
    let (port, receive) = Port::create_with(opts);
    let mut table = space.write_table();
    if !table.active {
        return Err(RightError::InvalidTask);
    }
    let entry = Entry::new(RightKind::Receive, 1, Some(port.clone()));
    let (index, name) = table.alloc(entry)?;
    table.reverse.insert(port_key(&port), index);
    port.state.lock().receiver = Some((space.id(), name));
    let _ = receive.into_raw();
    space.note_alloc();
    trace!("allocated receive {:?} in space {}", name, space.id().0);
    Ok(name)
}

fn allocate_objectless(space: &Space, kind: RightKind) -> Result<Name> {
    let mut table = space.write_table();
    if !table.active {
        return Err(RightError::InvalidTask);
    }
    let (_, name) = table.alloc(Entry::new(kind, 1, None))?;
    space.note_alloc();
    trace!("allocated {} {:?} in space {}", kind.as_str(), name, space.id().0);
    Ok(name)
}

// ---------------------------------------------------------------------------
// Dead-name folding
// ---------------------------------------------------------------------------

/// Fold an entry whose port has gone inactive into a dead name.
///
/// This is the single choke point that guarantees an entry is never
/// left pointing at an inactive port outside of the dead-name kind: a
/// registered dead-name notification is delivered here, folding its
/// implicit reference into the surviving dead name.
fn check_entry(guard: &mut EntryGuard<'_>, deferred: &mut Deferred) {
    let port = match guard.entry().object.clone() {
        Some(port) => port,
        None => return,
    };
    if port.is_active() {
        return;
    }
    let name = guard.name();
    {
        let mut st = port.state.lock();
        match guard.entry().kind() {
            RightKind::Send | RightKind::SendReceive => {
                st.send_rights = st.send_rights.saturating_sub(guard.entry().user_refs());
            }
            RightKind::SendOnce => {
                st.send_once_rights = st.send_once_rights.saturating_sub(1);
            }
            _ => {}
        }
    }
    guard.remove_reverse();
    let entry = guard.entry_mut();
    entry.kind = RightKind::DeadName;
    entry.object = None;
    if let Some(EntryNotify { kind, soright }) = entry.notify.take() {
        match kind {
            NotifyKind::DeadName => {
                entry.add_urefs(1);
                deferred.push_notice(PendingNotice {
                    soright,
                    note: Notification::DeadName { name },
                });
            }
            _ => deferred.push_release(soright),
        }
    }
    log::debug!("{:?} folded to dead name", name);
}

fn entry_port(guard: &EntryGuard<'_>) -> Result<PortRef> {
    guard.entry().object.clone().ok_or(RightError::InvalidRight)
}

/// Constraints shared by copying and moving send rights out of a space
fn check_send_transfer(st: &PortState, flags: CopyinFlags) -> Result<()> {
    if st.immovable_send {
        return Err(RightError::InvalidCapability);
    }
    if st.reply_port && !flags.contains(CopyinFlags::MOVE_REPLY_PORT) {
        return Err(RightError::InvalidCapability);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Copy-in
// ---------------------------------------------------------------------------

/// Consume a name under a disposition, producing a transferable right
pub fn copyin(
    space: &Space,
    name: Name,
    disposition: MsgDisposition,
    flags: CopyinFlags,
) -> Result<CopiedRight> {
    let mut deferred = Deferred::new();
    let result = copyin_inner(space, name, disposition, flags, &mut deferred);
    deferred.run();
    result
}

fn copyin_inner(
    space: &Space,
    name: Name,
    disposition: MsgDisposition,
    flags: CopyinFlags,
    deferred: &mut Deferred,
) -> Result<CopiedRight> {
    let mut guard = space.lookup_write(name)?;
    check_entry(&mut guard, deferred);
    trace!(
        "copyin {:?} {:?} from space {}",
        disposition,
        name,
        space.id().0
    );
    let deadok = flags.contains(CopyinFlags::DEADOK);
    match disposition {
        MsgDisposition::MakeSend => {
            if !guard.entry().kind().holds_receive() {
                return Err(RightError::InvalidRight);
            }
            let port = entry_port(&guard)?;
            let sright = port.make_send();
            Ok(CopiedRight {
                cap: CapRef::Send(sright),
                displaced_notify: None,
            })
        }
        MsgDisposition::MakeSendOnce => {
            if !guard.entry().kind().holds_receive() {
                return Err(RightError::InvalidRight);
            }
            let port = entry_port(&guard)?;
            let soright = port.make_send_once();
            Ok(CopiedRight {
                cap: CapRef::SendOnce(soright),
                displaced_notify: None,
            })
        }
        MsgDisposition::MoveReceive => {
            if !guard.entry().kind().holds_receive() {
                return Err(RightError::InvalidRight);
            }
            let port = entry_port(&guard)?;
            {
                let mut st = port.state.lock();
                let strict_guard = st.guard.map_or(false, |g| g.strict);
                if (st.immovable_receive || strict_guard)
                    && !flags.contains(CopyinFlags::MOVE_IMMOVABLE_RECEIVE)
                {
                    return Err(RightError::InvalidCapability);
                }
                if st.reply_port && !flags.contains(CopyinFlags::MOVE_REPLY_PORT) {
                    return Err(RightError::InvalidCapability);
                }
                if st.special_reply && !flags.contains(CopyinFlags::MOVE_SPECIAL_REPLY) {
                    return Err(RightError::InvalidCapability);
                }
                st.receiver = None;
            }
            let displaced = if guard.entry().kind() == RightKind::SendReceive {
                guard.entry_mut().kind = RightKind::Send;
                None
            } else {
                let displaced = guard.entry_mut().notify.take().map(|n| n.soright);
                guard.free();
                space.note_free();
                displaced
            };
            Ok(CopiedRight {
                cap: CapRef::Receive(ReceiveRight::from_raw(port)),
                displaced_notify: displaced,
            })
        }
        MsgDisposition::CopySend => match guard.entry().kind() {
            RightKind::DeadName => {
                if deadok {
                    Ok(CopiedRight {
                        cap: CapRef::Dead,
                        displaced_notify: None,
                    })
                } else {
                    Err(RightError::InvalidRight)
                }
            }
            kind if kind.holds_send() => {
                let port = entry_port(&guard)?;
                {
                    let mut st = port.state.lock();
                    check_send_transfer(&st, flags)?;
                    st.send_rights = st.send_rights.saturating_add(1);
                }
                Ok(CopiedRight {
                    cap: CapRef::Send(SendRight::from_raw(port)),
                    displaced_notify: None,
                })
            }
            _ => Err(RightError::InvalidRight),
        },
        MsgDisposition::MoveSend => match guard.entry().kind() {
            RightKind::DeadName => {
                if !deadok {
                    return Err(RightError::InvalidRight);
                }
                consume_dead_ref(guard, space);
                Ok(CopiedRight {
                    cap: CapRef::Dead,
                    displaced_notify: None,
                })
            }
            kind if kind.holds_send() => {
                let port = entry_port(&guard)?;
                {
                    let st = port.state.lock();
                    check_send_transfer(&st, flags)?;
                    if st.pinned && guard.entry().user_refs() == 1 {
                        return Err(RightError::InvalidCapability);
                    }
                }
                if guard.entry().is_pegged() {
                    // pegged counts absorb the move; account it as a copy
                    let mut st = port.state.lock();
                    st.send_rights = st.send_rights.saturating_add(1);
                } else {
                    let name = guard.name();
                    let remaining = {
                        let entry = guard.entry_mut();
                        entry.user_refs -= 1;
                        entry.user_refs
                    };
                    if remaining == 0 {
                        if guard.entry().kind() == RightKind::SendReceive {
                            let entry = guard.entry_mut();
                            entry.kind = RightKind::Receive;
                            entry.user_refs = 1;
                        } else {
                            if let Some(n) = guard.entry_mut().notify.take() {
                                deferred.push_notice(PendingNotice {
                                    soright: n.soright,
                                    note: Notification::PortDeleted { name },
                                });
                            }
                            guard.free();
                            space.note_free();
                        }
                    }
                }
                Ok(CopiedRight {
                    cap: CapRef::Send(SendRight::from_raw(port)),
                    displaced_notify: None,
                })
            }
            _ => Err(RightError::InvalidRight),
        },
        MsgDisposition::MoveSendOnce => match guard.entry().kind() {
            RightKind::SendOnce => {
                let port = entry_port(&guard)?;
                let name = guard.name();
                if let Some(n) = guard.entry_mut().notify.take() {
                    deferred.push_notice(PendingNotice {
                        soright: n.soright,
                        note: Notification::PortDeleted { name },
                    });
                }
                guard.free();
                space.note_free();
                Ok(CopiedRight {
                    cap: CapRef::SendOnce(SendOnceRight::from_raw(port)),
                    displaced_notify: None,
                })
            }
            RightKind::DeadName if deadok => {
                consume_dead_ref(guard, space);
                Ok(CopiedRight {
                    cap: CapRef::Dead,
                    displaced_notify: None,
                })
            }
            _ => Err(RightError::InvalidRight),
        },
    }
}

/// Consume one reference of a dead name, vacating the entry at zero.
/// Pegged counts absorb the decrement.
fn consume_dead_ref(mut guard: EntryGuard<'_>, space: &Space) {
    if guard.entry().is_pegged() {
        return;
    }
    let remaining = {
        let entry = guard.entry_mut();
        entry.user_refs -= 1;
        entry.user_refs
    };
    if remaining == 0 {
        guard.free();
        space.note_free();
    }
}

// ---------------------------------------------------------------------------
// Copy-out
// ---------------------------------------------------------------------------

/// Install a right into a space, returning the name it lands under.
///
/// Rights naming an already-destroyed port are released and the
/// distinguished dead name is returned.
pub fn copyout(space: &Space, disposition: CopyoutDisposition, cap: CapRef) -> Result<Name> {
    let mut deferred = Deferred::new();
    let result = copyout_inner(space, disposition, cap, &mut deferred);
    deferred.run();
    result
}

fn copyout_inner(
    space: &Space,
    disposition: CopyoutDisposition,
    cap: CapRef,
    deferred: &mut Deferred,
) -> Result<Name> {
    match (disposition, cap) {
        (CopyoutDisposition::PortSend, CapRef::Send(sright)) => {
            copyout_send(space, sright, deferred)
        }
        (CopyoutDisposition::PortSendOnce, CapRef::SendOnce(soright)) => {
            copyout_send_once(space, soright)
        }
        (CopyoutDisposition::PortReceive, CapRef::Receive(receive)) => {
            copyout_receive(space, receive)
        }
        (_, CapRef::Dead) => Ok(Name::dead()),
        // Disposition and right disagree; the right is released on drop
        _ => Err(RightError::InvalidRight),
    }
}

fn copyout_send(space: &Space, sright: SendRight, deferred: &mut Deferred) -> Result<Name> {
    let port = sright.port().clone();
    if !port.is_active() {
        drop(sright);
        return Ok(Name::dead());
    }
    let mut table = space.write_table();
    if !table.active {
        return Err(RightError::InvalidTask);
    }
    let key = port_key(&port);
    if let Some(&index) = table.reverse.get(&key) {
        let generation = table.slots[index as usize].generation;
        let name = Name::new(index, generation);
        let entry = table.slots[index as usize]
            .entry
            .as_mut()
            .ok_or(RightError::InvalidName)?;
        match entry.kind() {
            RightKind::Receive => {
                entry.kind = RightKind::SendReceive;
                entry.user_refs = 1;
                let _ = sright.into_raw();
            }
            kind if kind.holds_send() => {
                if entry.add_urefs(1) == 1 {
                    let _ = sright.into_raw();
                } else {
                    // pegged: the increment is absorbed and the
                    // incoming right's count is given back
                    let raw = sright.into_raw();
                    deferred.push_opt(Port::release_send_n(&raw, 1));
                }
            }
            _ => return Err(RightError::InvalidRight),
        }
        trace!("copyout send merged into {:?}", name);
        return Ok(name);
    }
    let entry = Entry::new(RightKind::Send, 1, Some(port.clone()));
    let (index, name) = table.alloc(entry)?;
    table.reverse.insert(key, index);
    let _ = sright.into_raw();
    space.note_alloc();
    trace!("copyout send installed at {:?}", name);
    Ok(name)
}

fn copyout_send_once(space: &Space, soright: SendOnceRight) -> Result<Name> {
    let port = soright.port().clone();
    if !port.is_active() {
        drop(soright);
        return Ok(Name::dead());
    }
    let mut table = space.write_table();
    if !table.active {
        return Err(RightError::InvalidTask);
    }
    // Send-once rights never coalesce; always a fresh single-use entry
    let entry = Entry::new(RightKind::SendOnce, 1, Some(port));
    let (_, name) = table.alloc(entry)?;
    let _ = soright.into_raw();
    space.note_alloc();
    trace!("copyout send-once installed at {:?}", name);
    Ok(name)
}

fn copyout_receive(space: &Space, receive: ReceiveRight) -> Result<Name> {
    let port = receive.port().clone();
    if !port.is_active() {
        drop(receive);
        return Ok(Name::dead());
    }
    {
        let st = port.state.lock();
        if st.receiver.is_some() {
            return Err(RightError::InvalidCapability);
        }
    }
    let mut table = space.write_table();
    if !table.active {
        return Err(RightError::InvalidTask);
    }
    let key = port_key(&port);
    let name = if let Some(&index) = table.reverse.get(&key) {
        let generation = table.slots[index as usize].generation;
        let name = Name::new(index, generation);
        let entry = table.slots[index as usize]
            .entry
            .as_mut()
            .ok_or(RightError::InvalidName)?;
        if entry.kind() != RightKind::Send {
            return Err(RightError::InvalidCapability);
        }
        entry.kind = RightKind::SendReceive;
        entry.ever_received = true;
        name
    } else {
        let entry = Entry::new(RightKind::Receive, 1, Some(port.clone()));
        let (index, name) = table.alloc(entry)?;
        table.reverse.insert(key, index);
        space.note_alloc();
        name
    };
    port.state.lock().receiver = Some((space.id(), name));
    let _ = receive.into_raw();
    trace!("copyout receive installed at {:?}", name);
    Ok(name)
}

// ---------------------------------------------------------------------------
// Reference-count deltas
// ---------------------------------------------------------------------------

/// Adjust the user-reference count a space holds for a right kind.
///
/// A zero delta never changes observable state. Negative deltas release
/// references; releasing the last send reference arms the no-senders
/// notification, and releasing a pinned port's last send reference
/// fails `InvalidCapability`.
pub fn delta(space: &Space, name: Name, kind: RightKind, delta: i32) -> Result<()> {
    let mut deferred = Deferred::new();
    let result = delta_inner(space, name, kind, delta, &mut deferred);
    deferred.run();
    result
}

fn delta_inner(
    space: &Space,
    name: Name,
    kind: RightKind,
    delta: i32,
    deferred: &mut Deferred,
) -> Result<()> {
    let mut guard = space.lookup_write(name)?;
    check_entry(&mut guard, deferred);
    trace!(
        "delta {} {} on {:?} in space {}",
        kind.as_str(),
        delta,
        name,
        space.id().0
    );
    match kind {
        RightKind::Send => delta_send(space, guard, delta, deferred),
        RightKind::Receive => delta_receive(space, guard, delta, deferred),
        RightKind::SendOnce => delta_send_once(space, guard, delta, deferred),
        RightKind::PortSet => delta_port_set(space, guard, delta),
        RightKind::DeadName => delta_dead_name(space, guard, delta),
        RightKind::SendReceive => Err(RightError::InvalidValue),
    }
}

fn delta_send(
    space: &Space,
    mut guard: EntryGuard<'_>,
    delta: i32,
    deferred: &mut Deferred,
) -> Result<()> {
    if !guard.entry().kind().holds_send() {
        return Err(RightError::InvalidRight);
    }
    if delta == 0 {
        return Ok(());
    }
    let port = entry_port(&guard)?;
    if delta > 0 {
        let added = guard.entry_mut().add_urefs(delta as u32);
        if added > 0 {
            let mut st = port.state.lock();
            st.send_rights = st.send_rights.saturating_add(added);
        }
        return Ok(());
    }
    let magnitude = delta.unsigned_abs();
    let urefs = guard.entry().user_refs();
    if magnitude > urefs {
        return Err(RightError::InvalidValue);
    }
    if guard.entry().is_pegged() && magnitude < urefs {
        // pegged counts absorb partial decrements
        return Ok(());
    }
    if magnitude == urefs {
        {
            let st = port.state.lock();
            if st.pinned {
                return Err(RightError::InvalidCapability);
            }
        }
        deferred.push_opt(Port::release_send_n(&port, urefs));
        if guard.entry().kind() == RightKind::SendReceive {
            let entry = guard.entry_mut();
            entry.kind = RightKind::Receive;
            entry.user_refs = 1;
        } else {
            let name = guard.name();
            if let Some(n) = guard.entry_mut().notify.take() {
                deferred.push_notice(PendingNotice {
                    soright: n.soright,
                    note: Notification::PortDeleted { name },
                });
            }
            guard.free();
            space.note_free();
        }
    } else {
        guard.entry_mut().user_refs -= magnitude;
        deferred.push_opt(Port::release_send_n(&port, magnitude));
    }
    Ok(())
}

fn delta_receive(
    space: &Space,
    guard: EntryGuard<'_>,
    delta: i32,
    deferred: &mut Deferred,
) -> Result<()> {
    if !guard.entry().kind().holds_receive() {
        return Err(RightError::InvalidRight);
    }
    if delta == 0 {
        return Ok(());
    }
    if delta != -1 {
        return Err(RightError::InvalidValue);
    }
    let port = entry_port(&guard)?;
    if let Some(expected) = port.guard_context() {
        audit::record(GuardViolation {
            space: space.id(),
            name: guard.name(),
            operation: "mod_refs",
            expected,
            presented: None,
        });
        return Err(RightError::IncorrectGuard);
    }
    destroy_receive(space, guard, port, deferred);
    Ok(())
}

fn delta_send_once(
    space: &Space,
    mut guard: EntryGuard<'_>,
    delta: i32,
    deferred: &mut Deferred,
) -> Result<()> {
    if guard.entry().kind() != RightKind::SendOnce {
        return Err(RightError::InvalidRight);
    }
    if delta == 0 {
        return Ok(());
    }
    if delta != -1 {
        return Err(RightError::InvalidValue);
    }
    let port = entry_port(&guard)?;
    let name = guard.name();
    if let Some(n) = guard.entry_mut().notify.take() {
        deferred.push_notice(PendingNotice {
            soright: n.soright,
            note: Notification::PortDeleted { name },
        });
    }
    guard.free();
    space.note_free();
    deferred.push_release(SendOnceRight::from_raw(port));
    Ok(())
}

fn delta_port_set(space: &Space, guard: EntryGuard<'_>, delta: i32) -> Result<()> {
    if guard.entry().kind() != RightKind::PortSet {
        return Err(RightError::InvalidRight);
    }
    match delta {
        0 => Ok(()),
        -1 => {
            guard.free();
            space.note_free();
            Ok(())
        }
        _ => Err(RightError::InvalidValue),
    }
}

fn delta_dead_name(space: &Space, mut guard: EntryGuard<'_>, delta: i32) -> Result<()> {
    if guard.entry().kind() != RightKind::DeadName {
        return Err(RightError::InvalidRight);
    }
    if delta == 0 {
        return Ok(());
    }
    if delta > 0 {
        guard.entry_mut().add_urefs(delta as u32);
        return Ok(());
    }
    let magnitude = delta.unsigned_abs();
    let urefs = guard.entry().user_refs();
    if magnitude > urefs {
        return Err(RightError::InvalidValue);
    }
    if guard.entry().is_pegged() && magnitude < urefs {
        return Ok(());
    }
    if magnitude == urefs {
        guard.free();
        space.note_free();
    } else {
        guard.entry_mut().user_refs -= magnitude;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Destruction
// ---------------------------------------------------------------------------

/// Tear down the receive side of an entry. Residual send references
/// survive as a dead name; the port itself is destroyed once locks drop.
fn destroy_receive(
    space: &Space,
    mut guard: EntryGuard<'_>,
    port: PortRef,
    deferred: &mut Deferred,
) {
    let name = guard.name();
    if guard.entry().kind() == RightKind::SendReceive {
        let send_refs = guard.entry().user_refs();
        {
            let mut st = port.state.lock();
            st.send_rights = st.send_rights.saturating_sub(send_refs);
        }
        guard.remove_reverse();
        let entry = guard.entry_mut();
        entry.kind = RightKind::DeadName;
        entry.object = None;
        if let Some(EntryNotify { kind, soright }) = entry.notify.take() {
            match kind {
                NotifyKind::DeadName => {
                    entry.add_urefs(1);
                    deferred.push_notice(PendingNotice {
                        soright,
                        note: Notification::DeadName { name },
                    });
                }
                _ => deferred.push_release(soright),
            }
        }
    } else {
        if let Some(n) = guard.entry_mut().notify.take() {
            deferred.push_notice(PendingNotice {
                soright: n.soright,
                note: Notification::PortDeleted { name },
            });
        }
        guard.free();
        space.note_free();
    }
    deferred.push_destroy(port);
}

/// Remove an entry wholesale, whatever right kind it holds.
///
/// Guarded receive rights demand the matching context via `check_guard`;
/// a missing or wrong context is reported on both the error and audit
/// channels. Destruction is the explicit path pinning permits.
pub fn destroy(space: &Space, name: Name, check_guard: Option<u64>) -> Result<()> {
    let mut deferred = Deferred::new();
    let result = destroy_inner(space, name, check_guard, &mut deferred);
    deferred.run();
    result
}

fn destroy_inner(
    space: &Space,
    name: Name,
    check_guard: Option<u64>,
    deferred: &mut Deferred,
) -> Result<()> {
    let mut guard = space.lookup_write(name)?;
    check_entry(&mut guard, deferred);
    trace!("destroy {:?} in space {}", name, space.id().0);
    match guard.entry().kind() {
        RightKind::DeadName | RightKind::PortSet => {
            guard.free();
            space.note_free();
            Ok(())
        }
        RightKind::SendOnce => {
            let port = entry_port(&guard)?;
            if let Some(n) = guard.entry_mut().notify.take() {
                deferred.push_notice(PendingNotice {
                    soright: n.soright,
                    note: Notification::PortDeleted { name },
                });
            }
            guard.free();
            space.note_free();
            deferred.push_release(SendOnceRight::from_raw(port));
            Ok(())
        }
        RightKind::Send => {
            let port = entry_port(&guard)?;
            let urefs = guard.entry().user_refs();
            deferred.push_opt(Port::release_send_n(&port, urefs));
            if let Some(n) = guard.entry_mut().notify.take() {
                deferred.push_notice(PendingNotice {
                    soright: n.soright,
                    note: Notification::PortDeleted { name },
                });
            }
            guard.free();
            space.note_free();
            Ok(())
        }
        RightKind::Receive | RightKind::SendReceive => {
            let port = entry_port(&guard)?;
            if let Some(expected) = port.guard_context() {
                match check_guard {
                    Some(context) if context == expected => {}
                    presented => {
                        audit::record(GuardViolation {
                            space: space.id(),
                            name,
                            operation: "destroy",
                            expected,
                            presented,
                        });
                        return Err(RightError::IncorrectGuard);
                    }
                }
            }
            // wholesale: no residual dead name for the send half
            if guard.entry().kind() == RightKind::SendReceive {
                let urefs = guard.entry().user_refs();
                deferred.push_opt(Port::release_send_n(&port, urefs));
            }
            if let Some(n) = guard.entry_mut().notify.take() {
                deferred.push_notice(PendingNotice {
                    soright: n.soright,
                    note: Notification::PortDeleted { name },
                });
            }
            guard.free();
            space.note_free();
            deferred.push_destroy(port);
            Ok(())
        }
    }
}

/// Destroy a receive right after applying a send-reference delta, under
/// guard validation. Unguarded ports accept only a zero context.
pub fn destruct(space: &Space, name: Name, srdelta: i32, guard_context: u64) -> Result<()> {
    let mut deferred = Deferred::new();
    let result = destruct_inner(space, name, srdelta, guard_context, &mut deferred);
    deferred.run();
    result
}

fn destruct_inner(
    space: &Space,
    name: Name,
    srdelta: i32,
    context: u64,
    deferred: &mut Deferred,
) -> Result<()> {
    let mut guard = space.lookup_write(name)?;
    check_entry(&mut guard, deferred);
    if !guard.entry().kind().holds_receive() {
        return Err(RightError::InvalidRight);
    }
    let port = entry_port(&guard)?;
    match port.guard_context() {
        Some(expected) if expected != context => {
            audit::record(GuardViolation {
                space: space.id(),
                name,
                operation: "destruct",
                expected,
                presented: Some(context),
            });
            return Err(RightError::IncorrectGuard);
        }
        None if context != 0 => {
            audit::record(GuardViolation {
                space: space.id(),
                name,
                operation: "destruct",
                expected: 0,
                presented: Some(context),
            });
            return Err(RightError::IncorrectGuard);
        }
        _ => {}
    }
    if srdelta > 0 {
        return Err(RightError::InvalidValue);
    }
    let magnitude = srdelta.unsigned_abs();
    if magnitude > 0 {
        if guard.entry().kind() != RightKind::SendReceive {
            return Err(RightError::InvalidValue);
        }
        let urefs = guard.entry().user_refs();
        if magnitude > urefs {
            return Err(RightError::InvalidValue);
        }
        if !(guard.entry().is_pegged() && magnitude < urefs) {
            guard.entry_mut().user_refs -= magnitude;
            deferred.push_opt(Port::release_send_n(&port, magnitude));
            if guard.entry().user_refs() == 0 {
                let entry = guard.entry_mut();
                entry.kind = RightKind::Receive;
                entry.user_refs = 1;
            }
        }
    }
    trace!("destruct {:?} in space {}", name, space.id().0);
    destroy_receive(space, guard, port, deferred);
    Ok(())
}

// ---------------------------------------------------------------------------
// Notification registration
// ---------------------------------------------------------------------------

/// Register, replace, or cancel a notification on a name.
///
/// Exactly one registration is outstanding per slot; the previous one,
/// if any, is displaced and returned to the caller for disposal, never
/// silently dropped. Registering a dead-name notification on a name
/// that is already dead fires it immediately.
pub fn request_notification(
    space: &Space,
    name: Name,
    kind: NotifyKind,
    notify: Option<SendOnceRight>,
) -> Result<Option<SendOnceRight>> {
    let mut deferred = Deferred::new();
    let result = request_inner(space, name, kind, notify, &mut deferred);
    deferred.run();
    result
}

fn request_inner(
    space: &Space,
    name: Name,
    kind: NotifyKind,
    notify: Option<SendOnceRight>,
    deferred: &mut Deferred,
) -> Result<Option<SendOnceRight>> {
    let mut guard = space.lookup_write(name)?;
    check_entry(&mut guard, deferred);
    match kind {
        NotifyKind::DeadName => match guard.entry().kind() {
            RightKind::DeadName => {
                if let Some(soright) = notify {
                    // fires immediately; its implicit reference folds
                    // into the dead name
                    guard.entry_mut().add_urefs(1);
                    deferred.push_notice(PendingNotice {
                        soright,
                        note: Notification::DeadName { name },
                    });
                }
                Ok(None)
            }
            RightKind::PortSet => Err(RightError::InvalidRight),
            _ => install_entry_notify(&mut guard, NotifyKind::DeadName, notify),
        },
        NotifyKind::PortDeleted => match guard.entry().kind() {
            RightKind::DeadName | RightKind::PortSet => Err(RightError::InvalidRight),
            _ => install_entry_notify(&mut guard, NotifyKind::PortDeleted, notify),
        },
        NotifyKind::NoSenders => {
            if !guard.entry().kind().holds_receive() {
                return Err(RightError::InvalidRight);
            }
            let port = entry_port(&guard)?;
            let mut st = port.state.lock();
            let previous = st.no_senders_notify.take();
            if let Some(soright) = notify {
                if st.send_rights == 0 {
                    let mscount = st.make_send_count;
                    deferred.push_notice(PendingNotice {
                        soright,
                        note: Notification::NoSenders { mscount },
                    });
                } else {
                    st.no_senders_notify = Some(soright);
                }
            }
            Ok(previous)
        }
    }
}

fn install_entry_notify(
    guard: &mut EntryGuard<'_>,
    kind: NotifyKind,
    notify: Option<SendOnceRight>,
) -> Result<Option<SendOnceRight>> {
    let entry = guard.entry_mut();
    let previous = entry.notify.take().map(|n| n.soright);
    if let Some(soright) = notify {
        entry.notify = Some(EntryNotify { kind, soright });
    }
    Ok(previous)
}

// ---------------------------------------------------------------------------
// Introspection and teardown
// ---------------------------------------------------------------------------

/// Report the right kind and user-reference count a name holds.
///
/// Folds the entry first if its port has gone inactive, so the caller
/// always observes dead names, never stale rights.
pub fn info(space: &Space, name: Name) -> Result<(RightKind, u32)> {
    let mut deferred = Deferred::new();
    let result = (|| {
        let mut guard = space.lookup_write(name)?;
        check_entry(&mut guard, &mut deferred);
        Ok((guard.entry().kind(), guard.entry().user_refs()))
    })();
    deferred.run();
    result
}

/// Tear down every live entry and deactivate the space.
///
/// Receive rights destroy their ports, send and send-once references
/// are released, and pending registrations are honored as port-deleted
/// notifications. Idempotent; never fails.
pub fn terminate(space: &Space) {
    let mut deferred = Deferred::new();
    {
        let mut table = space.write_table();
        if !table.active {
            return;
        }
        table.active = false;
        for index in 0..table.slots.len() {
            let generation = table.slots[index].generation;
            let entry = match table.slots[index].entry.take() {
                Some(entry) => entry,
                None => continue,
            };
            let name = Name::new(index as u32, generation);
            let Entry {
                kind,
                user_refs,
                object,
                notify,
                ..
            } = entry;
            if let Some(n) = notify {
                // termination still honors the registration
                deferred.push_notice(PendingNotice {
                    soright: n.soright,
                    note: Notification::PortDeleted { name },
                });
            }
            match (kind, object) {
                (RightKind::Send, Some(port)) => {
                    deferred.push_opt(Port::release_send_n(&port, user_refs));
                }
                (RightKind::SendOnce, Some(port)) => {
                    deferred.push_release(SendOnceRight::from_raw(port));
                }
                (RightKind::Receive, Some(port)) => {
                    deferred.push_destroy(port);
                }
                (RightKind::SendReceive, Some(port)) => {
                    {
                        let mut st = port.state.lock();
                        st.send_rights = st.send_rights.saturating_sub(user_refs);
                    }
                    deferred.push_destroy(port);
                }
                _ => {}
            }
            table.slots[index].bump_generation();
            space.note_free();
        }
        table.reverse.clear();
        table.free_head = None;
    }
    trace!("space {} terminated", space.id().0);
    deferred.run();
}
