//! Passing descriptors and credentials over unix sockets.
//!
//! Every message carries one dummy data byte; some platforms drop messages
//! that only have ancillary data.

use std::{
    io::IoSlice,
    mem::size_of,
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
};

use libc::c_int;
use nix::{
    errno::Errno,
    sys::socket::{
        sendmsg, setsockopt, sockopt::PassCred, ControlMessage, MsgFlags, UnixCredentials,
    },
    unistd::{getgid, getuid, Pid},
};
use sysx::retry;

#[derive(thiserror::Error, Debug)]
pub enum IpcError {
    #[error("failed to {what}: {source}")]
    Sys {
        what: &'static str,
        #[source]
        source: Errno,
    },
    #[error("received {0} bytes, expected 1")]
    ByteCount(usize),
    #[error("control message truncated")]
    Truncated,
    #[error("no control message received")]
    Missing,
    #[error("unexpected control message (level {level}, type {ty})")]
    UnexpectedMessage { level: c_int, ty: c_int },
    #[error("received {0} descriptors, expected 1")]
    FdCount(usize),
}

fn sys(what: &'static str) -> impl FnOnce(Errno) -> IpcError {
    move |source| IpcError::Sys { what, source }
}

fn send_with(sock: BorrowedFd<'_>, cmsg: ControlMessage<'_>) -> Result<(), IpcError> {
    let iov = [IoSlice::new(&[0u8])];
    let cmsgs = [cmsg];
    let sent = loop {
        match sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None) {
            Err(Errno::EINTR) => continue,
            res => break res.map_err(sys("sendmsg"))?,
        }
    };
    if sent != 1 {
        return Err(IpcError::ByteCount(sent));
    }
    Ok(())
}

pub fn send_fd(sock: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<(), IpcError> {
    let fds = [fd.as_raw_fd()];
    send_with(sock, ControlMessage::ScmRights(&fds))
}

/// Sends credentials naming `pid`. The kernel translates the pid into the
/// receiver's pid namespace. Naming any process but ourselves needs CAP_SYS_ADMIN.
pub fn send_pid(sock: BorrowedFd<'_>, pid: Pid) -> Result<(), IpcError> {
    let creds = UnixCredentials::from(libc::ucred {
        pid: pid.as_raw(),
        uid: getuid().as_raw(),
        gid: getgid().as_raw(),
    });
    send_with(sock, ControlMessage::ScmCredentials(&creds))
}

struct Cmsg {
    level: c_int,
    ty: c_int,
    data: Vec<u8>,
}

struct Received {
    bytes: usize,
    flags: c_int,
    cmsgs: Vec<Cmsg>,
}

fn recv_with(sock: BorrowedFd<'_>, payload_len: usize) -> Result<Received, IpcError> {
    let mut byte = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: byte.as_mut_ptr().cast(),
        iov_len: byte.len(),
    };
    let space = unsafe { libc::CMSG_SPACE(payload_len as u32) } as usize;
    // u64 for cmsghdr alignment
    let mut control = vec![0u64; space.div_ceil(size_of::<u64>())];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    let bytes = retry(|| unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) })
        .map_err(sys("recvmsg"))? as usize;

    let mut cmsgs = Vec::new();
    let header_len = unsafe { libc::CMSG_LEN(0) } as usize;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        let len = (hdr.cmsg_len as usize).saturating_sub(header_len);
        let data = unsafe { std::slice::from_raw_parts(libc::CMSG_DATA(cmsg), len) }.to_vec();
        cmsgs.push(Cmsg {
            level: hdr.cmsg_level,
            ty: hdr.cmsg_type,
            data,
        });
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    Ok(Received {
        bytes,
        flags: msg.msg_flags,
        cmsgs,
    })
}

impl Received {
    /// Takes ownership of every descriptor that arrived, wanted or not.
    fn take_fds(&self) -> Vec<OwnedFd> {
        self.cmsgs
            .iter()
            .filter(|c| c.level == libc::SOL_SOCKET && c.ty == libc::SCM_RIGHTS)
            .flat_map(|c| c.data.chunks_exact(size_of::<RawFd>()))
            .map(|raw| {
                let fd = RawFd::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]);
                unsafe { OwnedFd::from_raw_fd(fd) }
            })
            .collect()
    }

    fn check(&self, ty: c_int) -> Result<&[u8], IpcError> {
        if self.bytes != 1 {
            return Err(IpcError::ByteCount(self.bytes));
        }
        if self.flags & libc::MSG_CTRUNC != 0 {
            return Err(IpcError::Truncated);
        }
        match &self.cmsgs[..] {
            [] => Err(IpcError::Missing),
            [c] if c.level == libc::SOL_SOCKET && c.ty == ty => Ok(&c.data),
            [c, ..] => Err(IpcError::UnexpectedMessage {
                level: c.level,
                ty: c.ty,
            }),
        }
    }
}

/// Receives exactly one descriptor. Anything else (including extra
/// descriptors, which are closed) is an error.
pub fn recv_fd(sock: BorrowedFd<'_>) -> Result<OwnedFd, IpcError> {
    // room for two so that a second descriptor shows up as a count error
    let received = recv_with(sock, 2 * size_of::<RawFd>())?;

    // own everything first so nothing leaks on error
    let mut fds = received.take_fds();

    received.check(libc::SCM_RIGHTS)?;
    if fds.len() != 1 {
        return Err(IpcError::FdCount(fds.len()));
    }
    fds.pop().ok_or(IpcError::Missing)
}

/// Enables SO_PASSCRED. Must happen before the peer sends credentials.
pub fn enable_passcred(sock: BorrowedFd<'_>) -> Result<(), IpcError> {
    setsockopt(&sock, PassCred, &true).map_err(sys("set SO_PASSCRED"))
}

/// Receives the pid sent with [`send_pid`], as seen from our pid namespace.
pub fn recv_pid(sock: BorrowedFd<'_>) -> Result<Pid, IpcError> {
    let received = recv_with(sock, size_of::<libc::ucred>())?;
    let _stray = received.take_fds();
    let data = received.check(libc::SCM_CREDENTIALS)?;
    if data.len() < size_of::<libc::ucred>() {
        return Err(IpcError::Truncated);
    }
    let creds: libc::ucred = unsafe { std::ptr::read_unaligned(data.as_ptr().cast()) };
    Ok(Pid::from_raw(creds.pid))
}

#[cfg(test)]
mod test {
    use std::{
        fs::File,
        io::{Read, Seek, Write},
        os::{fd::AsFd, unix::net::UnixStream},
    };

    use nix::unistd::getpid;

    use super::*;

    #[test]
    fn passes_a_descriptor() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"through the socket").unwrap();

        send_fd(a.as_fd(), file.as_fd()).unwrap();
        let mut received = File::from(recv_fd(b.as_fd()).unwrap());
        received.rewind().unwrap();
        let mut text = String::new();
        received.read_to_string(&mut text).unwrap();
        assert_eq!(text, "through the socket");
    }

    #[test]
    fn plain_byte_is_not_a_descriptor() {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(&[0]).unwrap();
        assert!(matches!(recv_fd(b.as_fd()), Err(IpcError::Missing)));
    }

    #[test]
    fn two_descriptors_are_rejected() {
        let (a, b) = UnixStream::pair().unwrap();
        let f1 = tempfile::tempfile().unwrap();
        let f2 = tempfile::tempfile().unwrap();
        let fds = [f1.as_raw_fd(), f2.as_raw_fd()];
        send_with(a.as_fd(), ControlMessage::ScmRights(&fds)).unwrap();
        assert!(matches!(recv_fd(b.as_fd()), Err(IpcError::FdCount(2))));
    }

    #[test]
    fn closed_peer() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        assert!(matches!(recv_fd(b.as_fd()), Err(IpcError::ByteCount(0))));
    }

    #[test]
    fn passes_own_pid() {
        let (a, b) = UnixStream::pair().unwrap();
        enable_passcred(b.as_fd()).unwrap();
        send_pid(a.as_fd(), getpid()).unwrap();
        assert_eq!(recv_pid(b.as_fd()).unwrap(), getpid());
    }

    #[test]
    fn descriptor_then_sender() {
        let (a, b) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        send_fd(a.as_fd(), file.as_fd()).unwrap();
        send_pid(a.as_fd(), getpid()).unwrap();

        // credentials are only reported once asked for
        let fd = recv_fd(b.as_fd()).unwrap();
        assert!(same_file(&file, &File::from(fd)));
        enable_passcred(b.as_fd()).unwrap();
        assert_eq!(recv_pid(b.as_fd()).unwrap(), getpid());
    }

    fn same_file(a: &File, b: &File) -> bool {
        use std::os::unix::fs::MetadataExt;
        let (a, b) = (a.metadata().unwrap(), b.metadata().unwrap());
        (a.dev(), a.ino()) == (b.dev(), b.ino())
    }

    #[test]
    fn descriptor_is_not_credentials() {
        let (a, b) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        send_fd(a.as_fd(), file.as_fd()).unwrap();
        assert!(matches!(
            recv_pid(b.as_fd()),
            Err(IpcError::UnexpectedMessage { ty: libc::SCM_RIGHTS, .. })
        ));
    }
}
