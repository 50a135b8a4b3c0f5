//! Single-word handles for in-flight ring operations
//!
//! An in-flight operation is described by two capabilities: building its
//! submission entry (`prepare`) and reacting to the kernel's completion
//! (`handle_completion`). Both travel through the ring's user-data word as a
//! tagged pointer: the upper bits address an [`Operation`] header whose first
//! field is a static vtable, and the low alignment bits carry the kind tags.
//! Operations without a prepare step act as pure triggers and are fired
//! directly by whoever holds their handle.

use io_uring::{cqueue, squeue};

/// Low bits available for tags; `Operation` headers are at least 8-aligned.
const TAG_MASK: u64 = 0b111;

/// Set when the operation populates a submission entry.
const TAG_PREPARE: u64 = 0b001;

/// Set on user-data words injected into a ring by another ring
/// (`IORING_OP_MSG_RING`). Such completions have no local submission entry
/// and are exempt from in-flight accounting.
const TAG_REMOTE: u64 = 0b010;

/// Reserved user-data word for a pure loop wakeup: a remote-tagged null
/// handle. The run loop discards it without dispatching.
pub(crate) const WAKEUP_USER_DATA: u64 = TAG_REMOTE;

/// Behaviour of a ring operation.
///
/// Implementations use interior mutability; the reactor invokes them through
/// shared references on the owning thread only.
pub trait RingOperation {
    /// Whether this operation submits a kernel entry. Operations that leave
    /// this `false` are pure triggers: `prepare` is never called and
    /// `handle_completion` fires with no completion entry.
    const HAS_PREPARE: bool = true;

    /// Build the submission entry for this operation. `handle` is the
    /// operation's own canonical handle, for operations that need to embed a
    /// self-reference in the entry payload.
    fn prepare(&self, handle: OpHandle) -> squeue::Entry {
        let _ = handle;
        unreachable!("trigger-only operation has no prepare step");
    }

    /// React to a completion. `cqe` is `None` when the operation fired as a
    /// pure trigger, or when a submission was abandoned because the reactor
    /// is draining for shutdown.
    fn handle_completion(&self, handle: OpHandle, cqe: Option<&cqueue::Entry>);
}

pub(crate) struct OpVtable {
    pub(crate) prepare: unsafe fn(*const (), OpHandle) -> squeue::Entry,
    pub(crate) complete: unsafe fn(*const (), OpHandle, Option<&cqueue::Entry>),
}

unsafe fn prepare_thunk<T: RingOperation>(ptr: *const (), handle: OpHandle) -> squeue::Entry {
    let operation = &*(ptr as *const Operation<T>);
    operation.op.prepare(handle)
}

unsafe fn complete_thunk<T: RingOperation>(
    ptr: *const (),
    handle: OpHandle,
    cqe: Option<&cqueue::Entry>,
) {
    let operation = &*(ptr as *const Operation<T>);
    operation.op.handle_completion(handle, cqe);
}

/// Header wrapper giving a [`RingOperation`] a stable, single-word identity.
///
/// The vtable reference must stay the first field: handles recover it by
/// reading the first word behind the pointer.
#[repr(C)]
pub struct Operation<T: RingOperation> {
    vtable: &'static OpVtable,
    op: T,
}

impl<T: RingOperation> Operation<T> {
    const VTABLE: OpVtable = OpVtable {
        prepare: prepare_thunk::<T>,
        complete: complete_thunk::<T>,
    };

    pub fn new(op: T) -> Self {
        Self {
            vtable: &Self::VTABLE,
            op,
        }
    }

    /// Produce the tagged handle for this operation.
    ///
    /// # Safety
    ///
    /// The caller must keep this `Operation` at its current address, alive
    /// and unmoved, until the final completion for the handle has been
    /// delivered (or the handle is provably never submitted).
    pub unsafe fn handle(&self) -> OpHandle {
        let ptr = self as *const Self as u64;
        debug_assert_eq!(ptr & TAG_MASK, 0, "operation header under-aligned");
        let mut data = ptr;
        if T::HAS_PREPARE {
            data |= TAG_PREPARE;
        }
        OpHandle { data }
    }

    pub fn get(&self) -> &T {
        &self.op
    }
}

impl<T: RingOperation> std::ops::Deref for Operation<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.op
    }
}

/// Tagged single-word reference to an in-flight [`Operation`].
///
/// Copyable and freely passed between threads as the payload of the
/// cross-ring dispatch protocol; dereferenced only on the thread that owns
/// the destination ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHandle {
    data: u64,
}

impl OpHandle {
    /// Reconstruct a handle from a completion's user-data word.
    pub(crate) fn from_user_data(data: u64) -> Self {
        Self { data }
    }

    /// The word stamped into submission entries and msg-ring payloads.
    pub(crate) fn user_data(self) -> u64 {
        self.data
    }

    pub(crate) fn has_prepare(self) -> bool {
        self.data & TAG_PREPARE != 0
    }

    pub(crate) fn is_remote(self) -> bool {
        self.data & TAG_REMOTE != 0
    }

    /// The same handle with the remote tag set, for msg-ring payloads.
    pub(crate) fn as_remote(self) -> Self {
        Self {
            data: self.data | TAG_REMOTE,
        }
    }

    /// The handle as originally produced by [`Operation::handle`].
    fn canonical(self) -> Self {
        Self {
            data: self.data & !TAG_REMOTE,
        }
    }

    fn ptr(self) -> *const () {
        (self.data & !TAG_MASK) as *const ()
    }

    unsafe fn vtable(self) -> &'static OpVtable {
        *(self.ptr() as *const &'static OpVtable)
    }

    /// Build the submission entry for the referenced operation.
    ///
    /// # Safety
    ///
    /// The referenced operation must be alive and `has_prepare()` true.
    pub(crate) unsafe fn prepare(self) -> squeue::Entry {
        debug_assert!(self.has_prepare());
        (self.vtable().prepare)(self.ptr(), self.canonical())
    }

    /// Invoke the referenced operation's completion callback.
    ///
    /// # Safety
    ///
    /// The referenced operation must be alive.
    pub(crate) unsafe fn complete(self, cqe: Option<&cqueue::Entry>) {
        (self.vtable().complete)(self.ptr(), self.canonical(), cqe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Trigger {
        fired: Cell<u32>,
    }

    impl RingOperation for Trigger {
        const HAS_PREPARE: bool = false;

        fn handle_completion(&self, _handle: OpHandle, cqe: Option<&cqueue::Entry>) {
            assert!(cqe.is_none());
            self.fired.set(self.fired.get() + 1);
        }
    }

    struct Prepared;

    impl RingOperation for Prepared {
        fn prepare(&self, _handle: OpHandle) -> squeue::Entry {
            io_uring::opcode::Nop::new().build()
        }

        fn handle_completion(&self, _handle: OpHandle, _cqe: Option<&cqueue::Entry>) {}
    }

    #[test]
    fn test_trigger_handle_tags() {
        let op = Operation::new(Trigger {
            fired: Cell::new(0),
        });
        let handle = unsafe { op.handle() };
        assert!(!handle.has_prepare());
        assert!(!handle.is_remote());
        assert!(handle.as_remote().is_remote());
    }

    #[test]
    fn test_prepared_handle_tags() {
        let op = Operation::new(Prepared);
        let handle = unsafe { op.handle() };
        assert!(handle.has_prepare());
    }

    #[test]
    fn test_user_data_round_trip() {
        let op = Operation::new(Prepared);
        let handle = unsafe { op.handle() };
        let restored = OpHandle::from_user_data(handle.user_data());
        assert_eq!(handle, restored);
    }

    #[test]
    fn test_remote_tag_survives_round_trip() {
        let op = Operation::new(Trigger {
            fired: Cell::new(0),
        });
        let remote = unsafe { op.handle() }.as_remote();
        let restored = OpHandle::from_user_data(remote.user_data());
        assert!(restored.is_remote());
    }

    #[test]
    fn test_complete_dispatches_through_vtable() {
        let op = Operation::new(Trigger {
            fired: Cell::new(0),
        });
        let handle = unsafe { op.handle() };
        unsafe { handle.complete(None) };
        unsafe { handle.complete(None) };
        assert_eq!(op.get().fired.get(), 2);
    }

    #[test]
    fn test_wakeup_word_is_remote_null() {
        let handle = OpHandle::from_user_data(WAKEUP_USER_DATA);
        assert!(handle.is_remote());
        assert_eq!(handle.ptr(), std::ptr::null());
    }
}
