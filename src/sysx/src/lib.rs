use std::os::fd::RawFd;

use libc::c_int;
use nix::errno::Errno;

pub mod fd;
pub mod memfd;
pub mod newmount;
pub mod process;

fn _err<T: IsMinusOne>(ret: T) -> nix::Result<T> {
    if ret.is_minus_one() {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

/// Converts a libc-style return value into a `nix::Result`. Use [`retry`] for
/// calls that can be interrupted.
pub fn err<T: IsMinusOne>(ret: T) -> nix::Result<T> {
    _err(ret)
}

/// Like [`err`], but re-runs the syscall on EINTR.
pub fn retry<T: IsMinusOne + Copy>(mut f: impl FnMut() -> T) -> nix::Result<T> {
    loop {
        match _err(f()) {
            Err(Errno::EINTR) => {}
            other => return other,
        }
    }
}

pub trait IsMinusOne {
    fn is_minus_one(&self) -> bool;
}

impl IsMinusOne for i64 {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

impl IsMinusOne for i32 {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

impl IsMinusOne for isize {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

pub fn set_cloexec(fd: RawFd) -> nix::Result<c_int> {
    let flags = unsafe { err(libc::fcntl(fd, libc::F_GETFD))? };
    unsafe { err(libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC)) }
}

#[cfg(test)]
mod test {
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn err_maps_minus_one_to_errno() {
        let ret = unsafe { libc::close(-1) };
        assert_eq!(err(ret), Err(Errno::EBADF));
        assert_eq!(err(3i64), Ok(3));
    }

    #[test]
    fn sets_cloexec() {
        let file = std::fs::File::open("/proc/self/status").unwrap();
        // dup never carries the flag over
        let fd = unsafe { libc::dup(file.as_raw_fd()) };
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);

        set_cloexec(fd).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, libc::FD_CLOEXEC);
        unsafe { libc::close(fd) };
    }
}
