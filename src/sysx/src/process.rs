use std::{
    convert::Infallible,
    ffi::{c_char, CStr, CString},
    os::fd::{AsRawFd, BorrowedFd},
    ptr::null,
};

use libc::c_ulong;
use nix::{
    errno::Errno,
    unistd::{ForkResult, Pid},
};

use crate::err;

// s390 swaps the first two clone(2) arguments: stack comes before flags
#[cfg(target_arch = "s390x")]
const FLAGS_ARG: usize = 1;
#[cfg(not(target_arch = "s390x"))]
const FLAGS_ARG: usize = 0;

/// Raw clone(2) arguments for a fork-like clone: no new stack, no tid or tls pointers.
fn fork_like_args(flags: c_ulong) -> [c_ulong; 5] {
    let mut args = [0; 5];
    args[FLAGS_ARG] = flags;
    args
}

/// clone(2) with fork semantics, except that the new process becomes a child of
/// our parent instead of us.
///
/// # Safety
/// Same constraints as `fork()`: the child of a multithreaded process may only
/// do async-signal-safe work.
pub unsafe fn clone_parent() -> nix::Result<ForkResult> {
    let [a, b, c, d, e] = fork_like_args((libc::CLONE_PARENT | libc::SIGCHLD) as c_ulong);
    let ret = err(libc::syscall(libc::SYS_clone, a, b, c, d, e))?;
    Ok(match ret {
        0 => ForkResult::Child,
        pid => ForkResult::Parent {
            child: Pid::from_raw(pid as i32),
        },
    })
}

fn to_ptrs<S: AsRef<CStr>>(strs: &[S]) -> Vec<*const c_char> {
    strs.iter()
        .map(|s| s.as_ref().as_ptr())
        .chain(std::iter::once(null()))
        .collect()
}

/// Replaces the process image with the file referred to by `fd` (which may be
/// an O_PATH descriptor). Only returns on failure.
pub fn fexecve<A: AsRef<CStr>, E: AsRef<CStr>>(
    fd: BorrowedFd<'_>,
    argv: &[A],
    envp: &[E],
) -> nix::Result<Infallible> {
    let argv = to_ptrs(argv);
    let envp = to_ptrs(envp);

    let res = unsafe {
        err(libc::syscall(
            libc::SYS_execveat,
            fd.as_raw_fd(),
            c"".as_ptr(),
            argv.as_ptr(),
            envp.as_ptr(),
            libc::AT_EMPTY_PATH,
        ))
    };
    match res {
        // kernel < 3.19
        Err(Errno::ENOSYS) => {}
        Err(e) => return Err(e),
        Ok(_) => unreachable!(),
    }

    let path = CString::new(format!("/proc/self/fd/{}", fd.as_raw_fd())).map_err(|_| Errno::EINVAL)?;
    unsafe { err(libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr()))? };
    unreachable!()
}
