use std::{
    fs::File,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
    sync::mpsc,
};

use anyhow::Context;
use clap::Parser;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nsenter::cloned_binary::sealed_memfd;
use sysx::fd::open;
use tracing::{debug, info, Level};

/// Bind-mounts a sealed memfd copy of a binary over the binary itself, so that
/// every later run already executes from a trusted image.
///
/// The mount only stays readable while this process is alive. If it dies, the
/// path is left with a mount that fails every access with EINVAL; run again
/// with --cleanup to remove it (plain umount(8) can't).
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Only remove stale mounts from PATH, don't create a new one
    #[arg(long)]
    cleanup: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Binary to protect
    path: PathBuf,
}

// a handle that works even when the file itself can't be opened
fn open_path(path: &Path) -> nix::Result<OwnedFd> {
    open(path, libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC, 0)
}

fn fd_path(fd: BorrowedFd<'_>) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()))
}

/// Detaches every mount stacked on `path`.
fn cleanup(path: &Path) -> anyhow::Result<()> {
    let mut count = 0;
    loop {
        // each detach uncovers the next layer, which needs a fresh handle
        let file = open_path(path).with_context(|| format!("cleanup: failed to open {}", path.display()))?;
        if umount2(&fd_path(file.as_fd()), MntFlags::MNT_DETACH).is_err() {
            break;
        }
        count += 1;
        debug!("unmounted one layer from {}", path.display());
    }
    info!("removed {} old mount(s) from {}", count, path.display());
    Ok(())
}

fn bind(path: &Path) -> anyhow::Result<()> {
    let mut src = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let image = sealed_memfd(&mut src, c"memfd-bind").context("memfd clone")?;
    drop(src);

    // registered before mounting so that a signal can't leave a stale mount behind
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    // mount(2) can't take the memfd path directly: the magic link itself has to be the source
    let link = open_path(&fd_path(image.as_fd())).context("failed to open /proc/self/fd magic-link for memfd")?;
    let target = open_path(path).with_context(|| format!("failed to open target {}", path.display()))?;
    mount(
        Some(&fd_path(link.as_fd())),
        &fd_path(target.as_fd()),
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .with_context(|| format!("failed to mount memfd on top of {}", path.display()))?;
    drop((link, target));
    info!("bind-mount of memfd over {} created, waiting for a signal", path.display());

    let _ = rx.recv();
    info!("exit signal caught, cleaning up the bind-mount on {}", path.display());
    let res = cleanup(path);
    drop(image);
    res
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let cleaned = cleanup(&cli.path);
    if cli.cleanup {
        return cleaned;
    }
    if let Err(e) = cleaned {
        debug!("{:#}", e);
    }
    bind(&cli.path)
}
