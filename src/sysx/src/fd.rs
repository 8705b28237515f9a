use std::{
    ffi::CString,
    mem::MaybeUninit,
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    path::{Path, PathBuf},
};

use libc::c_int;
use nix::errno::Errno;

use crate::{err, retry};

fn path_cstr(path: &Path) -> nix::Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

pub fn open(path: impl AsRef<Path>, flags: c_int, mode: libc::mode_t) -> nix::Result<OwnedFd> {
    let path = path_cstr(path.as_ref())?;
    let fd = retry(|| unsafe { libc::open(path.as_ptr(), flags, mode as libc::c_uint) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Reopens `fd` through its procfs magic link with new access flags.
pub fn reopen(fd: BorrowedFd<'_>, flags: c_int) -> nix::Result<OwnedFd> {
    open(format!("/proc/self/fd/{}", fd.as_raw_fd()), flags, 0)
}

pub fn fstat(fd: BorrowedFd<'_>) -> nix::Result<libc::stat> {
    let mut stat = MaybeUninit::<libc::stat>::uninit();
    unsafe {
        err(libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()))?;
        Ok(stat.assume_init())
    }
}

pub fn fstatvfs(fd: BorrowedFd<'_>) -> nix::Result<libc::statvfs> {
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    unsafe {
        err(libc::fstatvfs(fd.as_raw_fd(), stat.as_mut_ptr()))?;
        Ok(stat.assume_init())
    }
}

pub fn fchmod(fd: BorrowedFd<'_>, mode: libc::mode_t) -> nix::Result<()> {
    unsafe { err(libc::fchmod(fd.as_raw_fd(), mode))? };
    Ok(())
}

pub fn ftruncate(fd: BorrowedFd<'_>, len: libc::off_t) -> nix::Result<()> {
    unsafe { err(libc::ftruncate(fd.as_raw_fd(), len))? };
    Ok(())
}

/// Single sendfile(2) call. Returns the number of bytes copied (0 at EOF).
pub fn sendfile(out_fd: BorrowedFd<'_>, in_fd: BorrowedFd<'_>, count: usize) -> nix::Result<usize> {
    let sent = retry(|| unsafe {
        libc::sendfile(out_fd.as_raw_fd(), in_fd.as_raw_fd(), std::ptr::null_mut(), count)
    })?;
    Ok(sent as usize)
}

/// mkostemp(3) with `prefix` + "XXXXXX". Returns the open file and its path.
pub fn mkostemp(prefix: impl AsRef<Path>, flags: c_int) -> nix::Result<(OwnedFd, PathBuf)> {
    use std::os::unix::ffi::OsStringExt;

    let mut template = path_cstr(prefix.as_ref())?.into_bytes_with_nul();
    template.pop();
    template.extend_from_slice(b"XXXXXX\0");
    let fd = retry(|| unsafe { libc::mkostemp(template.as_mut_ptr().cast(), flags) })?;
    template.pop();
    let path = PathBuf::from(std::ffi::OsString::from_vec(template));
    Ok((unsafe { OwnedFd::from_raw_fd(fd) }, path))
}

/// Whether two stat results describe the same inode.
pub fn same_inode(a: &libc::stat, b: &libc::stat) -> bool {
    a.st_dev == b.st_dev && a.st_ino == b.st_ino
}

#[cfg(test)]
mod test {
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn reopen_refers_to_same_inode() {
        let fd = open("/proc/self/exe", libc::O_RDONLY | libc::O_CLOEXEC, 0).unwrap();
        let path = open("/proc/self/exe", libc::O_PATH | libc::O_CLOEXEC, 0).unwrap();
        let again = reopen(path.as_fd(), libc::O_RDONLY | libc::O_CLOEXEC).unwrap();

        let a = fstat(fd.as_fd()).unwrap();
        let b = fstat(again.as_fd()).unwrap();
        assert!(same_inode(&a, &b));
    }

    #[test]
    fn mkostemp_creates_unique_files() {
        let dir = std::env::temp_dir().join("sysx-mkostemp-");
        let (a, path_a) = mkostemp(&dir, libc::O_CLOEXEC).unwrap();
        let (_b, path_b) = mkostemp(&dir, libc::O_CLOEXEC).unwrap();
        assert_ne!(path_a, path_b);
        assert!(path_a.to_string_lossy().starts_with(&*dir.to_string_lossy()));
        assert_eq!(fstat(a.as_fd()).unwrap().st_nlink, 1);
        std::fs::remove_file(path_a).unwrap();
        std::fs::remove_file(path_b).unwrap();
        assert_eq!(fstat(a.as_fd()).unwrap().st_nlink, 0);
    }

    #[test]
    fn open_missing_is_enoent() {
        let res = open("/nonexistent/sysx-test", libc::O_RDONLY, 0);
        assert_eq!(res.err(), Some(Errno::ENOENT));
    }
}
