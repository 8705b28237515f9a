use std::{
    ffi::CStr,
    mem::size_of,
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
};

use libc::{c_uint, syscall, SYS_mount_setattr, SYS_open_tree, AT_EMPTY_PATH, AT_FDCWD};

use crate::err;

pub const OPEN_TREE_CLONE: c_uint = 1;
pub const OPEN_TREE_CLOEXEC: c_uint = libc::O_CLOEXEC as c_uint;

pub const MOUNT_ATTR_RDONLY: u64 = 0x00000001;
pub const MOUNT_ATTR_NOSUID: u64 = 0x00000002;
pub const MOUNT_ATTR_NODEV: u64 = 0x00000004;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MountAttr {
    pub attr_set: u64,
    pub attr_clr: u64,
    pub propagation: u64,
    pub userns_fd: u64,
}

/// open_tree(2). With `dirfd` and an empty path, clones the mount of `dirfd` itself.
pub fn open_tree(dirfd: Option<BorrowedFd<'_>>, path: &CStr, flags: c_uint) -> nix::Result<OwnedFd> {
    let mut flags = flags;
    if path.is_empty() {
        flags |= AT_EMPTY_PATH as c_uint;
    }
    let fd = unsafe {
        err(syscall(
            SYS_open_tree,
            dirfd.map(|d| d.as_raw_fd()).unwrap_or(AT_FDCWD),
            path.as_ptr(),
            flags,
        ))?
    };
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

pub fn mount_setattr(
    dirfd: Option<BorrowedFd<'_>>,
    path: &CStr,
    flags: c_uint,
    attr: &MountAttr,
) -> nix::Result<()> {
    let mut flags = flags;
    if path.is_empty() {
        flags |= AT_EMPTY_PATH as c_uint;
    }
    unsafe {
        err(syscall(
            SYS_mount_setattr,
            dirfd.map(|d| d.as_raw_fd()).unwrap_or(AT_FDCWD),
            path.as_ptr(),
            flags,
            attr as *const MountAttr,
            size_of::<MountAttr>(),
        ))?
    };
    Ok(())
}
