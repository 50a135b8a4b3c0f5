//! Raw `io_uring_register(2)` calls not exposed by the io-uring crate
//!
//! Ring fd registration is done at loop start and undone on clean exit so
//! transient reactors do not exhaust the per-task registered-ring table.

use std::io;
use std::os::unix::io::RawFd;

const IORING_REGISTER_RING_FDS: libc::c_uint = 20;
const IORING_UNREGISTER_RING_FDS: libc::c_uint = 21;

/// Sentinel offset asking the kernel to pick a free slot.
const IORING_RSRC_ALLOC: u32 = u32::MAX;

#[repr(C)]
struct RsrcUpdate {
    offset: u32,
    resv: u32,
    data: u64,
}

fn io_uring_register(
    fd: RawFd,
    opcode: libc::c_uint,
    update: &mut RsrcUpdate,
) -> io::Result<()> {
    // Safety: `update` is a valid io_uring_rsrc_update of length 1.
    let res = unsafe {
        libc::syscall(
            libc::SYS_io_uring_register,
            fd as libc::c_long,
            opcode as libc::c_long,
            update as *mut RsrcUpdate,
            1 as libc::c_long,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Register `fd` in the calling task's ring-fd table.
///
/// Returns the allocated table offset, needed to unregister.
pub(crate) fn register_ring_fd(fd: RawFd) -> io::Result<u32> {
    let mut update = RsrcUpdate {
        offset: IORING_RSRC_ALLOC,
        resv: 0,
        data: fd as u64,
    };
    io_uring_register(fd, IORING_REGISTER_RING_FDS, &mut update)?;
    Ok(update.offset)
}

/// Release a ring-fd table slot obtained from [`register_ring_fd`].
pub(crate) fn unregister_ring_fd(fd: RawFd, offset: u32) -> io::Result<()> {
    let mut update = RsrcUpdate {
        offset,
        resv: 0,
        data: 0,
    };
    io_uring_register(fd, IORING_UNREGISTER_RING_FDS, &mut update)
}
