//! Port-right management
//!
//! Per-task capability tables over reference-counted IPC ports. A task's
//! [`Space`] maps generation-tagged [`Name`]s to entries holding send,
//! receive, send-once, port-set, or dead-name rights; the engine in
//! [`rights`] implements the transfer operations (copy-in under a
//! disposition, copy-out into a space), reference-count deltas,
//! destruction, guard enforcement, and the dead-name, port-deleted, and
//! no-senders notification protocols.
//!
//! The crate is `no_std` + `alloc` and uses spinlocks throughout, so it
//! can sit inside a kernel or run hosted under the test harness.

#![no_std]

extern crate alloc;

pub mod audit;
pub mod entry;
pub mod error;
pub mod name;
pub mod notify;
pub mod object;
pub mod rights;
pub mod space;


pub use entry::{RightKind, UREFS_MAX};
pub use error::{Result, RightError};
pub use name::Name;
pub use notify::{Notification, NotifyKind};
pub use object::{Port, PortGuard, PortOptions, PortRef, ReceiveRight, SendOnceRight, SendRight};
pub use rights::{
    allocate, allocate_with, copyin, copyout, delta, destroy, destruct, info,
    request_notification, terminate, AllocKind, CapRef, CopiedRight, CopyinFlags,
    CopyoutDisposition, MsgDisposition,
};
pub use space::{Space, SpaceId, SpaceStats};
