//! Re-executing from an image the container cannot tamper with.
//!
//! A process started from a host binary can have its /proc/self/exe
//! overwritten from inside the container (CVE-2019-5736). Before doing anything
//! privileged we make sure the running image is either a sealed memfd, a
//! read-only bind mount, or an unlinked copy, and re-exec from such a copy if
//! it is not.

use std::{
    ffi::{CStr, CString},
    fmt,
    fs::File,
    io::{Seek, SeekFrom},
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
};

use anyhow::Context;
use libc::c_int;
use nix::{
    errno::Errno,
    mount::{mount, umount2, MntFlags, MsFlags},
    sched::{unshare, CloneFlags},
    sys::socket::{socketpair, AddressFamily, SockFlag, SockType},
    unistd::{fork, geteuid, getpid, unlink, ForkResult},
};
use sysx::{
    fd::{fchmod, fstat, fstatvfs, ftruncate, mkostemp, open, reopen, same_inode, sendfile},
    memfd::{
        add_seals, get_seals, memfd_create, F_SEAL_EXEC, F_SEAL_FUTURE_WRITE, F_SEAL_GROW,
        F_SEAL_SEAL, F_SEAL_SHRINK, F_SEAL_WRITE, MFD_ALLOW_SEALING, MFD_CLOEXEC, MFD_EXEC,
    },
    newmount::{
        mount_setattr, open_tree, MountAttr, MOUNT_ATTR_NODEV, MOUNT_ATTR_NOSUID,
        MOUNT_ATTR_RDONLY, OPEN_TREE_CLOEXEC, OPEN_TREE_CLONE,
    },
    process::fexecve,
};
use tracing::{debug, warn};

use crate::{
    env::{cloned_binary_marker, ENV_CLONED_BINARY},
    ipc::{self, IpcError},
    proc,
};

const SELF_EXE: &str = "/proc/self/exe";
const MEMFD_NAME: &CStr = c"runc_cloned:/proc/self/exe";
const FALLBACK_TMPDIR: &str = "/tmp";

/// Seals that make a memfd immutable. A memfd carrying all of them is trusted
/// without further evidence.
pub const REQUIRED_SEALS: c_int = F_SEAL_SEAL | F_SEAL_SHRINK | F_SEAL_GROW | F_SEAL_WRITE;

// execute-only, so nobody can open it for writing through /proc/self/fd
const TMPFILE_MODE: libc::mode_t = 0o100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    SealedMemfd,
    ReadOnlyBind,
    UnlinkedTmpfile,
}

/// Why a [`TrustedImage`] cannot change under us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proof {
    /// Kernel-reported seal set.
    Seals(c_int),
    /// Backing mount is read-only.
    ReadOnlyMount,
    /// No directory entry refers to the file.
    Unlinked,
}

/// An executable descriptor whose contents cannot change while it is open.
#[derive(Debug)]
pub struct TrustedImage {
    fd: OwnedFd,
    provenance: Provenance,
    proof: Proof,
}

impl TrustedImage {
    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn proof(&self) -> Proof {
        self.proof
    }
}

impl AsFd for TrustedImage {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TrustError {
    #[error("unable to open {SELF_EXE}: {0}")]
    NotRecoverable(#[source] Errno),
}

#[derive(thiserror::Error, Debug)]
pub enum CloneError {
    /// This strategy can't work here; try the next one.
    #[error("{0} not supported")]
    Unsupported(&'static str),
    #[error("failed to {what}")]
    Sys {
        what: &'static str,
        #[source]
        source: Errno,
    },
    #[error("failed to {what}")]
    Io {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to receive bind-mounted binary")]
    Ipc(#[from] IpcError),
    #[error("copy of self is not immutable ({0})")]
    NotImmutable(&'static str),
    #[error("no strategy could produce a trusted copy of self")]
    Exhausted,
}

fn sys(what: &'static str) -> impl FnOnce(Errno) -> CloneError {
    move |source| CloneError::Sys { what, source }
}

fn io(what: &'static str) -> impl FnOnce(std::io::Error) -> CloneError {
    move |source| CloneError::Io { what, source }
}

/// Whether the running image is already trusted. Two calls without an
/// intervening exec always agree.
pub fn is_trusted_self() -> Result<bool, TrustError> {
    let exe = open(SELF_EXE, libc::O_RDONLY | libc::O_CLOEXEC, 0).map_err(TrustError::NotRecoverable)?;
    Ok(is_trusted_fd(exe.as_fd(), cloned_binary_marker()))
}

fn is_trusted_fd(fd: BorrowedFd<'_>, marker: bool) -> bool {
    if let Ok(seals) = get_seals(fd) {
        if seals & REQUIRED_SEALS == REQUIRED_SEALS {
            return true;
        }
    }

    // weaker evidence only counts if we put it there ourselves
    if !marker {
        return false;
    }
    if matches!(fstat(fd), Ok(st) if st.st_nlink == 0) {
        return true;
    }
    matches!(fstatvfs(fd), Ok(vfs) if vfs.f_flag & libc::ST_RDONLY != 0)
}

fn open_self() -> Result<File, CloneError> {
    File::open(SELF_EXE).map_err(io("open /proc/self/exe"))
}

/// Copies `src` into `dst`, which must be empty. sendfile first, then a plain
/// read/write loop if that fails or comes up short.
fn copy_from(src: &mut File, dst: &File) -> Result<u64, CloneError> {
    let size = src.metadata().map_err(io("stat source binary"))?.len();

    let mut copied = 0u64;
    while copied < size {
        let chunk = (size - copied).min(1 << 30) as usize;
        match sendfile(dst.as_fd(), src.as_fd(), chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => copied += n as u64,
        }
    }
    if copied == size {
        return Ok(copied);
    }

    debug!("sendfile copied {}/{} bytes, falling back to read/write", copied, size);
    ftruncate(dst.as_fd(), 0).map_err(sys("truncate copy"))?;
    let mut dst = dst;
    dst.seek(SeekFrom::Start(0)).map_err(io("rewind copy"))?;
    src.seek(SeekFrom::Start(0)).map_err(io("rewind source binary"))?;
    let copied = std::io::copy(src, &mut dst).map_err(io("copy binary"))?;
    if copied != size {
        return Err(CloneError::Io {
            what: "copy binary",
            source: std::io::ErrorKind::UnexpectedEof.into(),
        });
    }
    Ok(copied)
}

fn tmp_dirs(state_dir: Option<&Path>) -> impl Iterator<Item = &Path> {
    state_dir.into_iter().chain(std::iter::once(Path::new(FALLBACK_TMPDIR)))
}

/// One way of producing a trusted copy.
pub trait CopyStrategy {
    fn name(&self) -> &'static str;
    fn attempt(&self, state_dir: Option<&Path>) -> Result<TrustedImage, CloneError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Read-only bind mount of the real binary, made in a throwaway mount namespace.
    BindMount,
    /// Sealed memfd copy.
    Memfd,
    /// Unlinked execute-only temporary file.
    TmpFile,
}

impl Strategy {
    pub const ORDER: [Strategy; 3] = [Strategy::BindMount, Strategy::Memfd, Strategy::TmpFile];
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl CopyStrategy for Strategy {
    fn name(&self) -> &'static str {
        match self {
            Strategy::BindMount => "bind-mount",
            Strategy::Memfd => "memfd",
            Strategy::TmpFile => "tmpfile",
        }
    }

    fn attempt(&self, state_dir: Option<&Path>) -> Result<TrustedImage, CloneError> {
        match self {
            Strategy::BindMount => bind_mount_copy(state_dir),
            Strategy::Memfd => memfd_copy(),
            Strategy::TmpFile => tmpfile_copy(state_dir),
        }
    }
}

/// Tries each strategy in order. Only [`CloneError::Unsupported`] moves on to
/// the next one; any other error is returned immediately.
pub fn make_trusted_copy_with(
    strategies: &[&dyn CopyStrategy],
    state_dir: Option<&Path>,
) -> Result<TrustedImage, CloneError> {
    for strategy in strategies {
        match strategy.attempt(state_dir) {
            Ok(image) => {
                debug!("cloned binary via {} ({:?})", strategy.name(), image.proof());
                return Ok(image);
            }
            Err(CloneError::Unsupported(why)) => {
                debug!("{} unavailable: {} not supported", strategy.name(), why);
            }
            Err(e) => return Err(e),
        }
    }
    Err(CloneError::Exhausted)
}

pub fn make_trusted_copy(state_dir: Option<&Path>) -> Result<TrustedImage, CloneError> {
    let order = Strategy::ORDER;
    let strategies = order.iter().map(|s| s as &dyn CopyStrategy).collect::<Vec<_>>();
    make_trusted_copy_with(&strategies, state_dir)
}

pub fn memfd_copy() -> Result<TrustedImage, CloneError> {
    sealed_memfd(&mut open_self()?, MEMFD_NAME)
}

/// Sealed, executable memfd holding the contents of `src`.
pub fn sealed_memfd(src: &mut File, name: &CStr) -> Result<TrustedImage, CloneError> {
    let flags = MFD_CLOEXEC | MFD_ALLOW_SEALING;
    // MFD_EXEC is only known to 6.3+; older kernels reject it with EINVAL
    let fd = match memfd_create(name, flags | MFD_EXEC) {
        Err(Errno::EINVAL) => memfd_create(name, flags),
        res => res,
    };
    let fd = match fd {
        Err(Errno::ENOSYS) => return Err(CloneError::Unsupported("memfd_create")),
        res => res.map_err(sys("create memfd"))?,
    };

    let file = File::from(fd);
    copy_from(src, &file)?;

    // best effort: not every kernel knows these
    let _ = add_seals(file.as_fd(), F_SEAL_FUTURE_WRITE);
    let _ = add_seals(file.as_fd(), F_SEAL_EXEC);
    match add_seals(file.as_fd(), REQUIRED_SEALS) {
        Err(Errno::EINVAL) => return Err(CloneError::Unsupported("memfd sealing")),
        res => res.map_err(sys("seal memfd"))?,
    }

    let seals = get_seals(file.as_fd()).map_err(sys("get memfd seals"))?;
    if seals & REQUIRED_SEALS != REQUIRED_SEALS {
        return Err(CloneError::NotImmutable("seals missing"));
    }
    Ok(TrustedImage {
        fd: file.into(),
        provenance: Provenance::SealedMemfd,
        proof: Proof::Seals(seals),
    })
}

/// O_TMPFILE in `dir`, or mkostemp + unlink where the filesystem lacks it.
fn open_unlinked(dir: &Path) -> nix::Result<OwnedFd> {
    match open(dir, libc::O_TMPFILE | libc::O_EXCL | libc::O_RDWR | libc::O_CLOEXEC, 0o711) {
        Ok(fd) => return Ok(fd),
        Err(Errno::EISDIR | Errno::EOPNOTSUPP | Errno::EINVAL) => {}
        Err(e) => return Err(e),
    }
    let (fd, path) = mkostemp(dir.join("runc-cloned-binary."), libc::O_CLOEXEC)?;
    unlink(&path)?;
    Ok(fd)
}

pub fn tmpfile_copy(state_dir: Option<&Path>) -> Result<TrustedImage, CloneError> {
    let mut last = Errno::ENOENT;
    let fd = tmp_dirs(state_dir).find_map(|dir| match open_unlinked(dir) {
        Ok(fd) => Some(fd),
        Err(e) => {
            debug!("cannot create unlinked file in {}: {}", dir.display(), e);
            last = e;
            None
        }
    });
    let file = File::from(fd.ok_or_else(|| sys("create temporary file")(last))?);

    copy_from(&mut open_self()?, &file)?;
    fchmod(file.as_fd(), TMPFILE_MODE).map_err(sys("chmod copy"))?;

    // exec refuses files with writers (ETXTBSY), so keep only a path handle
    let path_fd = reopen(file.as_fd(), libc::O_PATH | libc::O_CLOEXEC).map_err(sys("reopen copy"))?;
    drop(file);

    let st = fstat(path_fd.as_fd()).map_err(sys("stat copy"))?;
    if st.st_nlink != 0 {
        return Err(CloneError::NotImmutable("copy still linked"));
    }
    Ok(TrustedImage {
        fd: path_fd,
        provenance: Provenance::UnlinkedTmpfile,
        proof: Proof::Unlinked,
    })
}

fn mount_common(
    source: Option<&Path>,
    dest: &Path,
    flags: MsFlags,
) -> Result<(), CloneError> {
    mount(source, dest, None::<&str>, flags, None::<&str>).map_err(sys("mount"))
}

/// Runs inside the forked helper, in its own mount namespace. Sends the
/// read-only descriptor back over `sock`, followed by our credentials.
fn bind_mount_helper(sock: BorrowedFd<'_>, state_dir: Option<&Path>) -> Result<(), CloneError> {
    unshare(CloneFlags::CLONE_NEWNS).map_err(sys("unshare mount namespace"))?;
    mount_common(None, Path::new("/"), MsFlags::MS_REC | MsFlags::MS_PRIVATE)?;

    // resolve the path now, then make sure it is still the image we run from
    let exe_path = std::fs::read_link(SELF_EXE).map_err(io("resolve /proc/self/exe"))?;
    let exe = open(&exe_path, libc::O_PATH | libc::O_CLOEXEC | libc::O_NOFOLLOW, 0)
        .map_err(sys("open own binary"))?;
    let self_exe = open(SELF_EXE, libc::O_PATH | libc::O_CLOEXEC, 0).map_err(sys("open /proc/self/exe"))?;
    let (a, b) = (
        fstat(exe.as_fd()).map_err(sys("stat own binary"))?,
        fstat(self_exe.as_fd()).map_err(sys("stat /proc/self/exe"))?,
    );
    if !same_inode(&a, &b) {
        return Err(CloneError::NotImmutable("binary replaced during bind-mount"));
    }

    let ro = match detached_ro_mount(exe.as_fd()) {
        Ok(fd) => fd,
        Err(_) => legacy_ro_mount(exe.as_fd(), state_dir)?,
    };
    ipc::send_fd(sock, ro.as_fd())?;
    ipc::send_pid(sock, getpid())?;
    Ok(())
}

/// open_tree + mount_setattr: a read-only clone of the mount, never attached anywhere.
fn detached_ro_mount(exe: BorrowedFd<'_>) -> Result<OwnedFd, CloneError> {
    let tree = open_tree(Some(exe), c"", OPEN_TREE_CLONE | OPEN_TREE_CLOEXEC).map_err(sys("open_tree"))?;
    let attr = MountAttr {
        attr_set: MOUNT_ATTR_RDONLY | MOUNT_ATTR_NOSUID | MOUNT_ATTR_NODEV,
        ..Default::default()
    };
    mount_setattr(Some(tree.as_fd()), c"", 0, &attr).map_err(sys("mount_setattr"))?;
    Ok(tree)
}

/// Bind mount onto a scratch file, remount read-only, grab an O_PATH handle
/// and detach.
fn legacy_ro_mount(exe: BorrowedFd<'_>, state_dir: Option<&Path>) -> Result<OwnedFd, CloneError> {
    let (scratch, target) = tmp_dirs(state_dir)
        .find_map(|dir| mkostemp(dir.join("runc.sealed."), libc::O_CLOEXEC).ok())
        .ok_or(CloneError::Unsupported("scratch file for bind-mount"))?;
    drop(scratch);
    let _cleanup = scopeguard::guard(&target, |target| {
        let _ = unlink(target.as_path());
    });

    let source = PathBuf::from(format!("/proc/self/fd/{}", exe.as_raw_fd()));
    mount_common(Some(&source), &target, MsFlags::MS_BIND)?;
    mount_common(
        None,
        &target,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
    )?;
    let fd = open(&target, libc::O_PATH | libc::O_CLOEXEC, 0).map_err(sys("open bind-mount"))?;
    umount2(target.as_path(), MntFlags::MNT_DETACH).map_err(sys("detach bind-mount"))?;
    Ok(fd)
}

pub fn bind_mount_copy(state_dir: Option<&Path>) -> Result<TrustedImage, CloneError> {
    if !geteuid().is_root() {
        return Err(CloneError::Unsupported("bind-mount as non-root"));
    }

    let (ours, theirs) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(sys("create socketpair"))?;

    // the helper owns the mount namespace side effects; they die with it
    match unsafe { fork() }.map_err(sys("fork bind-mount helper"))? {
        ForkResult::Child => {
            drop(ours);
            let code = match bind_mount_helper(theirs.as_fd(), state_dir) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            unsafe { libc::_exit(code) };
        }
        ForkResult::Parent { child } => {
            drop(theirs);
            let status = proc::wait_for_exit(child).map_err(|e| CloneError::Io {
                what: "wait for bind-mount helper",
                source: std::io::Error::other(format!("{:#}", e)),
            })?;
            if !status.success() {
                warn!("bind-mount helper failed: {:?}", status);
                return Err(CloneError::Unsupported("bind-mount"));
            }

            let fd = ipc::recv_fd(ours.as_fd())?;
            // the descriptor is only as good as whoever sent it
            ipc::enable_passcred(ours.as_fd())?;
            let sender = ipc::recv_pid(ours.as_fd())?;
            if sender != child {
                return Err(CloneError::NotImmutable("bind-mount descriptor from unexpected sender"));
            }
            let vfs = fstatvfs(fd.as_fd()).map_err(sys("statvfs bind-mount"))?;
            if vfs.f_flag & libc::ST_RDONLY == 0 {
                return Err(CloneError::NotImmutable("bind-mount is writable"));
            }
            Ok(TrustedImage {
                fd,
                provenance: Provenance::ReadOnlyBind,
                proof: Proof::ReadOnlyMount,
            })
        }
    }
}

/// Ensures the process runs from a trusted image. Returns `Ok` only if it
/// already does; otherwise it re-executes and never returns, or fails.
pub fn ensure_cloned_binary(state_dir: Option<&Path>) -> anyhow::Result<()> {
    if is_trusted_self()? {
        return Ok(());
    }

    let image = make_trusted_copy(state_dir).context("could not create trusted copy of self")?;
    debug!("re-executing from {:?} copy", image.provenance());

    let argv = proc::read_cmdline()?;
    let marker = format!("{}=", ENV_CLONED_BINARY);
    let mut envp = proc::environ()
        .into_iter()
        .filter(|e| !e.as_bytes().starts_with(marker.as_bytes()))
        .collect::<Vec<_>>();
    envp.push(CString::new(format!("{}1", marker))?);

    match fexecve(image.as_fd(), &argv, &envp) {
        Ok(never) => match never {},
        Err(e) => Err(anyhow::Error::from(e).context("could not re-execute trusted copy of self")),
    }
}
