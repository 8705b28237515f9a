//! The privileged side of the SyncChannel: does what the bootstrap child
//! can't do for itself.

use std::{
    ffi::OsStr,
    fs::OpenOptions,
    io::{ErrorKind, Write},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{anyhow, bail, Context};
use nix::unistd::Pid;
use tracing::debug;

use crate::{
    bootstrap::{BootstrapConfig, IdMap},
    sync::{SyncChannel, SyncMsg},
};

pub trait SyncHandler {
    /// Write uid_map/gid_map (and setgroups) of `child`.
    fn map_ids(&mut self, child: Pid) -> anyhow::Result<()>;

    /// Write /proc/<child>/timens_offsets.
    fn write_time_offsets(&mut self, child: Pid) -> anyhow::Result<()>;

    fn pid_received(&mut self, _leaf: Pid) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Answers requests from `child` until it relays the leaf pid, which is returned.
pub fn serve(sync: &mut SyncChannel, child: Pid, handler: &mut impl SyncHandler) -> anyhow::Result<Pid> {
    loop {
        match sync.recv()? {
            SyncMsg::UsermapPls => {
                debug!("mapping ids for {}", child);
                handler.map_ids(child)?;
                sync.send(SyncMsg::UsermapAck)?;
            }
            SyncMsg::TimeOffsetsPls => {
                debug!("writing timens offsets for {}", child);
                handler.write_time_offsets(child)?;
                sync.send(SyncMsg::TimeOffsetsAck)?;
            }
            SyncMsg::RecvPidPls => {
                let leaf = Pid::from_raw(sync.recv_pid()?);
                handler.pid_received(leaf)?;
                sync.send(SyncMsg::RecvPidAck)?;
                return Ok(leaf);
            }
            other => bail!("unexpected sync message {}", other),
        }
    }
}

/// Does the writes through procfs, the way a real runtime would.
pub struct ProcfsHandler {
    config: BootstrapConfig,
    proc_root: PathBuf,
}

impl ProcfsHandler {
    pub fn new(config: BootstrapConfig) -> Self {
        Self::with_proc_root(config, "/proc")
    }

    pub fn with_proc_root(config: BootstrapConfig, proc_root: impl Into<PathBuf>) -> Self {
        ProcfsHandler {
            config,
            proc_root: proc_root.into(),
        }
    }

    fn proc_file(&self, pid: Pid, name: &str) -> PathBuf {
        self.proc_root.join(pid.to_string()).join(name)
    }

    fn setgroups_policy(&self) -> Option<&'static str> {
        if self.config.setgroup {
            Some("allow")
        } else if self.config.rootless_euid {
            Some("deny")
        } else {
            None
        }
    }

    fn write_setgroups(&self, pid: Pid, policy: &str) -> anyhow::Result<()> {
        match write_proc(&self.proc_file(pid, "setgroups"), policy.as_bytes()) {
            // pre-3.19 kernels have no setgroups file
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            res => res.with_context(|| format!("failed to write setgroups={}", policy)),
        }
    }

    /// The whole map has to go in with a single write. If we aren't allowed,
    /// the setuid helper (newuidmap/newgidmap) can do it for us.
    fn write_id_map(&self, pid: Pid, file: &str, maps: &[IdMap], helper: Option<&[u8]>) -> anyhow::Result<()> {
        let err = match write_proc(&self.proc_file(pid, file), &IdMap::render_table(maps)) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        match helper.filter(|h| !h.is_empty()) {
            Some(helper) if err.kind() == ErrorKind::PermissionDenied => {
                run_map_helper(Path::new(OsStr::from_bytes(helper)), pid, maps)
            }
            _ => Err(anyhow!(err).context(format!("failed to update /proc/{}/{}", pid, file))),
        }
    }
}

// never create: a missing file means the process is gone or the kernel lacks the feature
fn write_proc(path: &Path, data: &[u8]) -> std::io::Result<()> {
    OpenOptions::new().write(true).open(path)?.write_all(data)
}

fn run_map_helper(helper: &Path, pid: Pid, maps: &[IdMap]) -> anyhow::Result<()> {
    let mut cmd = Command::new(helper);
    cmd.arg(pid.to_string());
    for m in maps {
        cmd.args([m.container_id, m.host_id, m.size].map(|n| n.to_string()));
    }
    let status = cmd
        .status()
        .with_context(|| format!("failed to run {}", helper.display()))?;
    if !status.success() {
        bail!("{} failed: {}", helper.display(), status);
    }
    Ok(())
}

impl SyncHandler for ProcfsHandler {
    fn map_ids(&mut self, child: Pid) -> anyhow::Result<()> {
        // reject a bad table before touching anything
        let uid_maps = self.config.uid_mappings()?;
        let gid_maps = self.config.gid_mappings()?;

        if let Some(policy) = self.setgroups_policy() {
            self.write_setgroups(child, policy)?;
        }
        if !uid_maps.is_empty() {
            self.write_id_map(child, "uid_map", &uid_maps, self.config.uid_map_path.as_deref())?;
        }
        if !gid_maps.is_empty() {
            self.write_id_map(child, "gid_map", &gid_maps, self.config.gid_map_path.as_deref())?;
        }
        Ok(())
    }

    fn write_time_offsets(&mut self, child: Pid) -> anyhow::Result<()> {
        let offsets = self.config.time_offsets()?;
        if offsets.is_empty() {
            return Ok(());
        }
        let path = self.proc_file(child, "timens_offsets");
        // one clock per write
        for offset in &offsets {
            write_proc(&path, offset.to_string().as_bytes())
                .with_context(|| format!("failed to write {} offset to {}", offset.clock, path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{os::fd::OwnedFd, os::unix::net::UnixStream};

    use super::*;
    use crate::bootstrap::TimeOffset;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl SyncHandler for Recorder {
        fn map_ids(&mut self, child: Pid) -> anyhow::Result<()> {
            self.events.push(format!("map {}", child));
            Ok(())
        }

        fn write_time_offsets(&mut self, child: Pid) -> anyhow::Result<()> {
            self.events.push(format!("time {}", child));
            Ok(())
        }

        fn pid_received(&mut self, leaf: Pid) -> anyhow::Result<()> {
            self.events.push(format!("leaf {}", leaf));
            Ok(())
        }
    }

    fn pair() -> (SyncChannel, SyncChannel) {
        let (a, b) = UnixStream::pair().unwrap();
        (SyncChannel::new(OwnedFd::from(a)), SyncChannel::new(OwnedFd::from(b)))
    }

    #[test]
    fn serves_until_pid_relay() {
        let (mut child, mut parent) = pair();
        let script = std::thread::spawn(move || {
            child.request(SyncMsg::UsermapPls).unwrap();
            child.request(SyncMsg::TimeOffsetsPls).unwrap();
            child.send(SyncMsg::RecvPidPls).unwrap();
            child.send_pid(77).unwrap();
            child.expect(SyncMsg::RecvPidAck).unwrap();
        });

        let mut recorder = Recorder::default();
        let leaf = serve(&mut parent, Pid::from_raw(10), &mut recorder).unwrap();
        script.join().unwrap();

        assert_eq!(leaf, Pid::from_raw(77));
        assert_eq!(recorder.events, vec!["map 10", "time 10", "leaf 77"]);
    }

    #[test]
    fn rejects_acks_from_child() {
        let (mut child, mut parent) = pair();
        child.send(SyncMsg::UsermapAck).unwrap();
        let err = serve(&mut parent, Pid::from_raw(10), &mut Recorder::default()).unwrap_err();
        assert!(err.to_string().contains("SYNC_USERMAP_ACK"));
    }

    fn fake_proc(pid: i32, files: &[&str]) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join(pid.to_string());
        std::fs::create_dir(&dir).unwrap();
        for f in files {
            std::fs::write(dir.join(f), "").unwrap();
        }
        root
    }

    #[test]
    fn writes_maps_and_setgroups() {
        let root = fake_proc(42, &["setgroups", "uid_map", "gid_map"]);
        let config = BootstrapConfig {
            uid_map: Some(b"0 1000 1\n".to_vec()),
            gid_map: Some(b"0 1000 1\n1 100000 10\n".to_vec()),
            rootless_euid: true,
            ..Default::default()
        };
        let mut handler = ProcfsHandler::with_proc_root(config, root.path());
        handler.map_ids(Pid::from_raw(42)).unwrap();

        let read = |f: &str| std::fs::read_to_string(root.path().join("42").join(f)).unwrap();
        assert_eq!(read("setgroups"), "deny");
        assert_eq!(read("uid_map"), "0 1000 1\n");
        assert_eq!(read("gid_map"), "0 1000 1\n1 100000 10\n");
    }

    #[test]
    fn setgroups_policy() {
        let handler = |setgroup, rootless_euid| {
            ProcfsHandler::new(BootstrapConfig {
                setgroup,
                rootless_euid,
                ..Default::default()
            })
        };
        assert_eq!(handler(true, true).setgroups_policy(), Some("allow"));
        assert_eq!(handler(false, true).setgroups_policy(), Some("deny"));
        assert_eq!(handler(false, false).setgroups_policy(), None);
    }

    #[test]
    fn missing_map_file_is_an_error() {
        let root = fake_proc(42, &[]);
        let config = BootstrapConfig {
            uid_map: Some(b"0 1000 1\n".to_vec()),
            ..Default::default()
        };
        let mut handler = ProcfsHandler::with_proc_root(config, root.path());
        let err = handler.map_ids(Pid::from_raw(42)).unwrap_err();
        assert!(err.to_string().contains("uid_map"));
    }

    #[test]
    fn malformed_map_writes_nothing() {
        let root = fake_proc(42, &["setgroups", "uid_map"]);
        let config = BootstrapConfig {
            uid_map: Some(b"0 1000\n".to_vec()),
            rootless_euid: true,
            ..Default::default()
        };
        let mut handler = ProcfsHandler::with_proc_root(config, root.path());
        assert!(handler.map_ids(Pid::from_raw(42)).is_err());
        assert_eq!(std::fs::read_to_string(root.path().join("42/setgroups")).unwrap(), "");
    }

    #[test]
    fn writes_time_offsets() {
        let root = fake_proc(7, &["timens_offsets"]);
        let offsets = [TimeOffset {
            clock: "boottime".to_string(),
            secs: -20,
            nanosecs: 5,
        }];
        let config = BootstrapConfig {
            time_offsets: Some(TimeOffset::render_table(&offsets)),
            ..Default::default()
        };
        let mut handler = ProcfsHandler::with_proc_root(config, root.path());
        handler.write_time_offsets(Pid::from_raw(7)).unwrap();
        let written = std::fs::read_to_string(root.path().join("7/timens_offsets")).unwrap();
        assert_eq!(written, "boottime -20 5\n");
    }
}
