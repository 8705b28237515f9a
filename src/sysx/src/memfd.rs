use std::{
    ffi::CStr,
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
};

use libc::{c_int, c_uint};

use crate::err;

pub const MFD_CLOEXEC: c_uint = libc::MFD_CLOEXEC;
pub const MFD_ALLOW_SEALING: c_uint = libc::MFD_ALLOW_SEALING;
// kernel 6.3, not in musl
pub const MFD_EXEC: c_uint = 0x0010;

pub const F_SEAL_SEAL: c_int = libc::F_SEAL_SEAL;
pub const F_SEAL_SHRINK: c_int = libc::F_SEAL_SHRINK;
pub const F_SEAL_GROW: c_int = libc::F_SEAL_GROW;
pub const F_SEAL_WRITE: c_int = libc::F_SEAL_WRITE;
// kernel 5.1
pub const F_SEAL_FUTURE_WRITE: c_int = 0x0010;
// kernel 6.3
pub const F_SEAL_EXEC: c_int = 0x0020;

pub fn memfd_create(name: &CStr, flags: c_uint) -> nix::Result<OwnedFd> {
    let fd = unsafe { err(libc::syscall(libc::SYS_memfd_create, name.as_ptr(), flags))? };
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

/// F_GET_SEALS. Fails with EINVAL for files that don't support sealing.
pub fn get_seals(fd: BorrowedFd<'_>) -> nix::Result<c_int> {
    unsafe { err(libc::fcntl(fd.as_raw_fd(), libc::F_GET_SEALS)) }
}

pub fn add_seals(fd: BorrowedFd<'_>, seals: c_int) -> nix::Result<()> {
    unsafe { err(libc::fcntl(fd.as_raw_fd(), libc::F_ADD_SEALS, seals))? };
    Ok(())
}
