//! The bootstrap state machine.
//!
//! ```text
//! runtime ──spawns──▶ SETUP ═══▶ STAGE_CHILD ──clone(CLONE_PARENT)──▶ STAGE_INIT
//!                     (same process)   │ exit(0)                        │ returns
//! ```
//!
//! SETUP and STAGE_CHILD run in the process the runtime started. The leaf is
//! cloned as a sibling so the runtime ends up as the parent of both, and it is
//! the only process that returns to the caller.

use std::{
    fmt,
    fs::File,
    mem::ManuallyDrop,
    os::fd::{FromRawFd, RawFd},
};

use anyhow::{anyhow, Context};
use nix::{
    sys::signal::{kill, Signal},
    unistd::{setresuid, ForkResult, Uid},
};
use sysx::process::clone_parent;
use tracing::{debug, info_span};

use crate::{
    bootstrap::BootstrapConfig,
    cloned_binary::ensure_cloned_binary,
    env::BootstrapEnv,
    log::{self, LogPipe},
    namespaces::{check_join_create, join_namespaces, parse_ns_paths, try_unshare, Namespaces},
    proc,
    sync::{SyncChannel, SyncMsg},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Child,
    Init,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Setup => "nsexec",
            Stage::Child => "nsexec-1",
            Stage::Init => "nsexec-2",
        }
    }

    fn process_name(self) -> Option<&'static str> {
        match self {
            Stage::Setup => None,
            Stage::Child => Some("nsexec:[1:CHILD]"),
            Stage::Init => Some("nsexec:[2:INIT]"),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the caller of [`nsexec`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsExec {
    /// Not started as a bootstrap helper; nothing was done.
    Skipped,
    /// The leaf: namespaces are in place and the caller's init logic takes over.
    Init,
}

enum ChildOutcome {
    /// We are the cloned leaf and now own the config.
    Leaf(BootstrapConfig),
    /// We are the intermediate process and are done.
    Done,
}

/// Runs `body` as `stage`. Any error is fatal.
fn run_stage<T>(stage: Stage, pipe: Option<&LogPipe>, body: impl FnOnce() -> anyhow::Result<T>) -> T {
    let _span = info_span!("stage", stage = %stage).entered();
    let res = stage
        .process_name()
        .map_or(Ok(()), proc::set_name)
        .context("failed to set process name")
        .and_then(|()| body());
    match res {
        Ok(v) => v,
        Err(e) => log::fatal(pipe, &e),
    }
}

fn setup(env: &BootstrapEnv, init_fd: RawFd) -> anyhow::Result<BootstrapConfig> {
    ensure_cloned_binary(env.state_dir.as_deref()).context("could not ensure we are a cloned binary")?;
    debug!("nsexec started");

    // the init pipe stays open for the runtime's own init logic
    let init = ManuallyDrop::new(unsafe { File::from_raw_fd(init_fd) });
    let config = BootstrapConfig::read_from(&*init)?;

    // must happen before we drop dumpable: the file is root-owned afterwards
    if let Some(adj) = config.oom_score_adj()? {
        proc::write_oom_score_adj(adj.to_string().as_bytes())?;
    }

    // other processes in the namespaces we join must not be able to ptrace us.
    // without any joins there's nothing to protect, and rootless mapping
    // writes need us dumpable.
    if config.ns_paths()?.is_some() {
        proc::set_dumpable(false)?;
    }
    Ok(config)
}

fn become_root() -> anyhow::Result<()> {
    let root = Uid::from_raw(0);
    setresuid(root, root, root).context("failed to become root in user namespace")
}

fn stage_child(config: BootstrapConfig, sync: &mut SyncChannel) -> anyhow::Result<ChildOutcome> {
    let mut flags = config.namespaces();
    let ns_paths = config.ns_paths()?;

    if let Some(paths) = ns_paths {
        let joining = parse_ns_paths(paths)?
            .iter()
            .fold(Namespaces::empty(), |acc, (kind, _)| acc | kind.flag());
        check_join_create(joining, flags)?;

        // their paths may not resolve once we've switched namespaces
        let joined = join_namespaces(paths)?;
        debug!("joined namespaces {{{}}}", joined);
    }

    if flags.contains(Namespaces::USER) {
        debug!("unshare user namespace");
        try_unshare(Namespaces::USER, "user namespace")?;
        flags.remove(Namespaces::USER);

        // the parent writes our id maps through /proc/pid, which requires us dumpable
        if ns_paths.is_some() {
            proc::set_dumpable(true)?;
        }
        debug!("request stage-0 to map user namespace");
        sync.request(SyncMsg::UsermapPls)?;
        if ns_paths.is_some() {
            proc::set_dumpable(false)?;
        }

        become_root()?;
    }

    if !flags.is_empty() {
        try_unshare(flags, "remaining namespaces")?;
    }

    // offsets can only be written before anything inside reads a clock
    if config.time_offsets.is_some() {
        debug!("request stage-0 to write timens offsets");
        sync.request(SyncMsg::TimeOffsetsPls)?;
    }

    // a new pid namespace only applies to children, so the leaf has to be a new process
    match unsafe { clone_parent() }.context("unable to spawn stage-2")? {
        ForkResult::Child => Ok(ChildOutcome::Leaf(config)),
        ForkResult::Parent { child } => {
            let leaf = scopeguard::guard(child, |pid| {
                let _ = kill(pid, Signal::SIGKILL);
            });

            debug!("request stage-0 to forward stage-2 pid ({})", child);
            sync.send(SyncMsg::RecvPidPls)?;
            sync.send_pid(child.as_raw())?;
            sync.expect(SyncMsg::RecvPidAck)?;

            scopeguard::ScopeGuard::into_inner(leaf);
            debug!("<- stage-2 pid received, exiting");
            Ok(ChildOutcome::Done)
        }
    }
}

fn stage_init(config: BootstrapConfig, sync: SyncChannel) -> anyhow::Result<()> {
    drop(sync);
    drop(config);
    debug!("<= nsexec container setup");
    Ok(())
}

/// Entry point. Must run before the process grows any threads.
pub fn nsexec() -> NsExec {
    let env = match BootstrapEnv::from_env() {
        Ok(env) => env,
        Err(e) => log::fatal(None, &anyhow!(e)),
    };
    let Some((init_fd, sync_fd)) = env.bootstrap_pipes() else {
        return NsExec::Skipped;
    };
    let pipe = log::init(&env);
    let pipe = pipe.as_ref();

    let config = run_stage(Stage::Setup, pipe, || setup(&env, init_fd));

    let mut sync = unsafe { SyncChannel::from_raw_fd(sync_fd) };
    let config = match run_stage(Stage::Child, pipe, || stage_child(config, &mut sync)) {
        ChildOutcome::Leaf(config) => config,
        ChildOutcome::Done => std::process::exit(0),
    };

    run_stage(Stage::Init, pipe, || stage_init(config, sync));
    NsExec::Init
}
