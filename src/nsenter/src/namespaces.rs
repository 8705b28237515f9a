use std::{
    fmt,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
    str::FromStr,
};

use bitflags::bitflags;
use nix::{
    errno::Errno,
    sched::{setns, unshare, CloneFlags},
    unistd::{setresuid, Uid},
};
use tracing::debug;

// not in every libc we build against
const CLONE_NEWTIME: u32 = 0x00000080;

// kernels before 4.3 can fail unshare with EINVAL while /proc/$pid/{status,maps} is being read
const UNSHARE_RETRIES: usize = 5;

bitflags! {
    /// A set of namespace kinds, encoded as their CLONE_NEW* bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Namespaces: u32 {
        const CGROUP = libc::CLONE_NEWCGROUP as u32;
        const IPC = libc::CLONE_NEWIPC as u32;
        const MNT = libc::CLONE_NEWNS as u32;
        const NET = libc::CLONE_NEWNET as u32;
        const PID = libc::CLONE_NEWPID as u32;
        const TIME = CLONE_NEWTIME;
        const USER = libc::CLONE_NEWUSER as u32;
        const UTS = libc::CLONE_NEWUTS as u32;
    }
}

impl Namespaces {
    pub fn clone_flags(self) -> CloneFlags {
        CloneFlags::from_bits_retain(self.bits() as libc::c_int)
    }
}

impl fmt::Display for Namespaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = NsKind::ALL
            .iter()
            .filter(|k| self.contains(k.flag()))
            .map(|k| k.name())
            .collect::<Vec<_>>();
        write!(f, "{}", names.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NsKind {
    Cgroup,
    Ipc,
    Mnt,
    Net,
    Pid,
    Time,
    User,
    Uts,
}

impl NsKind {
    pub const ALL: [NsKind; 8] = [
        NsKind::Cgroup,
        NsKind::Ipc,
        NsKind::Mnt,
        NsKind::Net,
        NsKind::Pid,
        NsKind::Time,
        NsKind::User,
        NsKind::Uts,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NsKind::Cgroup => "cgroup",
            NsKind::Ipc => "ipc",
            NsKind::Mnt => "mnt",
            NsKind::Net => "net",
            NsKind::Pid => "pid",
            NsKind::Time => "time",
            NsKind::User => "user",
            NsKind::Uts => "uts",
        }
    }

    pub fn flag(self) -> Namespaces {
        match self {
            NsKind::Cgroup => Namespaces::CGROUP,
            NsKind::Ipc => Namespaces::IPC,
            NsKind::Mnt => Namespaces::MNT,
            NsKind::Net => Namespaces::NET,
            NsKind::Pid => Namespaces::PID,
            NsKind::Time => Namespaces::TIME,
            NsKind::User => Namespaces::USER,
            NsKind::Uts => Namespaces::UTS,
        }
    }
}

impl fmt::Display for NsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NsKind {
    type Err = NamespaceError;

    // joining a kind we have no handling for could silently misbehave, so unknown kinds are fatal
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NsKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| NamespaceError::UnknownKind(s.to_string()))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum NamespaceError {
    #[error("ns paths are empty")]
    EmptyPaths,
    #[error("failed to parse {0}")]
    Malformed(String),
    #[error("unknown namespace type {0}")]
    UnknownKind(String),
    #[error("failed to open {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: Errno,
    },
    #[error("failed to setns into {kind} namespace")]
    Setns {
        kind: NsKind,
        #[source]
        source: Errno,
    },
    #[error("failed to become root in user namespace")]
    BecomeRoot(#[source] Errno),
    #[error("failed to join {{{0}}} namespaces: {1}")]
    FailedToJoin(Namespaces, Errno),
    #[error("namespaces {{{0}}} requested both to join and to create")]
    JoinAndCreate(Namespaces),
    #[error("failed to unshare {what}")]
    Unshare {
        what: String,
        #[source]
        source: Errno,
    },
}

/// Splits a `kind:path[,kind:path...]` list. Empty items are skipped.
pub fn parse_ns_paths(list: &str) -> Result<Vec<(NsKind, PathBuf)>, NamespaceError> {
    let items = list
        .split(',')
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (kind, path) = item
                .split_once(':')
                .ok_or_else(|| NamespaceError::Malformed(item.to_string()))?;
            Ok((kind.parse::<NsKind>()?, PathBuf::from(path)))
        })
        .collect::<Result<Vec<_>, NamespaceError>>()?;
    if items.is_empty() {
        return Err(NamespaceError::EmptyPaths);
    }
    Ok(items)
}

/// A namespace can't be both joined and created, except a user namespace:
/// joining an existing one and then nesting a new one inside is fine.
pub fn check_join_create(joining: Namespaces, creating: Namespaces) -> Result<(), NamespaceError> {
    let both = (joining & creating) - Namespaces::USER;
    if !both.is_empty() {
        return Err(NamespaceError::JoinAndCreate(both));
    }
    Ok(())
}

/// The kernel side of joining. Split out so the pass ordering can be tested.
pub trait NsOps {
    fn open(&mut self, path: &Path) -> nix::Result<OwnedFd>;
    fn setns(&mut self, fd: BorrowedFd<'_>, kind: NsKind) -> nix::Result<()>;
    fn become_root(&mut self) -> nix::Result<()>;
}

pub struct Kernel;

impl NsOps for Kernel {
    fn open(&mut self, path: &Path) -> nix::Result<OwnedFd> {
        sysx::fd::open(path, libc::O_RDONLY | libc::O_CLOEXEC, 0)
    }

    fn setns(&mut self, fd: BorrowedFd<'_>, kind: NsKind) -> nix::Result<()> {
        setns(fd, kind.flag().clone_flags())
    }

    fn become_root(&mut self) -> nix::Result<()> {
        let root = Uid::from_raw(0);
        setresuid(root, root, root)
    }
}

struct NamespaceEntry {
    kind: NsKind,
    path: PathBuf,
    // None once joined
    fd: Option<OwnedFd>,
}

/// Namespace descriptors opened for joining.
pub struct NamespaceSet {
    entries: Vec<NamespaceEntry>,
}

impl NamespaceSet {
    /// Opens every path up front: after switching mount or user namespaces they may no longer resolve.
    pub fn open(list: &str, ops: &mut impl NsOps) -> Result<Self, NamespaceError> {
        let entries = parse_ns_paths(list)?
            .into_iter()
            .map(|(kind, path)| {
                let fd = ops.open(&path).map_err(|source| NamespaceError::Open {
                    path: path.clone(),
                    source,
                })?;
                Ok(NamespaceEntry {
                    kind,
                    path,
                    fd: Some(fd),
                })
            })
            .collect::<Result<Vec<_>, NamespaceError>>()?;
        Ok(NamespaceSet { entries })
    }

    pub fn requested(&self) -> Namespaces {
        self.entries
            .iter()
            .fold(Namespaces::empty(), |acc, e| acc | e.kind.flag())
    }

    /// Joins every still-open namespace whose kind is in `allow`. EPERM skips the
    /// namespace (a later pass may succeed); anything else is fatal.
    fn join_pass(&mut self, allow: Namespaces, ops: &mut impl NsOps) -> Result<Namespaces, NamespaceError> {
        let mut joined = Namespaces::empty();
        for entry in self.entries.iter_mut() {
            if !allow.contains(entry.kind.flag()) {
                continue;
            }
            let Some(fd) = entry.fd.as_ref() else {
                continue;
            };

            let res = ops.setns(fd.as_fd(), entry.kind);
            debug!(
                "setns({:#x}) into {} namespace (with path {}): {}",
                entry.kind.flag().bits(),
                entry.kind,
                entry.path.display(),
                match res {
                    Ok(()) => "Success".to_string(),
                    Err(e) => e.desc().to_string(),
                }
            );
            match res {
                Ok(()) => {}
                Err(Errno::EPERM) => continue,
                Err(source) => {
                    return Err(NamespaceError::Setns {
                        kind: entry.kind,
                        source,
                    })
                }
            }
            joined |= entry.kind.flag();

            // same as after unshare(CLONE_NEWUSER): lots of things break if we aren't root in there
            if entry.kind == NsKind::User {
                ops.become_root().map_err(NamespaceError::BecomeRoot)?;
            }

            entry.fd = None;
        }
        Ok(joined)
    }

    /// Non-user namespaces first (we may lose the right to join them once in the
    /// container's userns), then the userns, then whatever was refused before
    /// because we lacked CAP_SYS_ADMIN in the owning userns (rootless).
    pub fn join_all(mut self, ops: &mut impl NsOps) -> Result<Namespaces, NamespaceError> {
        let to_join = self.requested();
        let mut joined = Namespaces::empty();

        joined |= self.join_pass(to_join - (joined | Namespaces::USER), ops)?;
        joined |= self.join_pass(Namespaces::USER, ops)?;
        joined |= self.join_pass(to_join - (joined | Namespaces::USER), ops)?;

        let mut failed = to_join - joined;
        for entry in self.entries.iter_mut() {
            if entry.fd.take().is_some() {
                failed |= entry.kind.flag();
                tracing::error!(
                    "failed to setns({:#x}) into {} namespace (with path {}): {}",
                    entry.kind.flag().bits(),
                    entry.kind,
                    entry.path.display(),
                    Errno::EPERM.desc()
                );
            }
        }
        if !failed.is_empty() {
            return Err(NamespaceError::FailedToJoin(failed, Errno::EPERM));
        }
        Ok(joined)
    }
}

/// Opens and joins every namespace listed in `list`. Returns the joined set.
pub fn join_namespaces(list: &str) -> Result<Namespaces, NamespaceError> {
    let mut ops = Kernel;
    NamespaceSet::open(list, &mut ops)?.join_all(&mut ops)
}

pub fn try_unshare(flags: Namespaces, what: &str) -> Result<(), NamespaceError> {
    try_unshare_with(flags, what, |flags| unshare(flags))
}

fn try_unshare_with(
    flags: Namespaces,
    what: &str,
    mut unshare_fn: impl FnMut(CloneFlags) -> nix::Result<()>,
) -> Result<(), NamespaceError> {
    debug!("unshare {}", what);
    let mut last = Errno::EINVAL;
    for _ in 0..UNSHARE_RETRIES {
        match unshare_fn(flags.clone_flags()) {
            Ok(()) => return Ok(()),
            Err(Errno::EINVAL) => last = Errno::EINVAL,
            Err(e) => {
                last = e;
                break;
            }
        }
    }
    Err(NamespaceError::Unshare {
        what: what.to_string(),
        source: last,
    })
}
