use std::{
    ffi::CString,
    fs::OpenOptions,
    io::Write,
};

use anyhow::Context;
use nix::{
    sys::{
        prctl,
        signal::Signal,
        wait::{waitpid, WaitStatus},
    },
    unistd::Pid,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitResult {
    Code(i32),
    Signal(Signal),
}

impl ExitResult {
    pub fn success(self) -> bool {
        self == ExitResult::Code(0)
    }
}

pub fn wait_for_exit<P: Into<Option<Pid>>>(pid: P) -> anyhow::Result<ExitResult> {
    let pid: Option<Pid> = pid.into();
    loop {
        match waitpid(pid, None)? {
            WaitStatus::Exited(_, exit_code) => return Ok(ExitResult::Code(exit_code)),
            WaitStatus::Signaled(_, signal, _) => return Ok(ExitResult::Signal(signal)),
            _ => {}
        }
    }
}

/// Sets the comm name shown by ps and in /proc/pid/status.
pub fn set_name(name: &str) -> anyhow::Result<()> {
    let cstr = CString::new(name)?;
    prctl::set_name(&cstr)?;
    Ok(())
}

pub fn set_dumpable(dumpable: bool) -> anyhow::Result<()> {
    prctl::set_dumpable(dumpable).with_context(|| format!("failed to set process as dumpable={}", dumpable))
}

/// Writes /proc/self/oom_score_adj. Must happen while still dumpable: the
/// file belongs to root once we aren't.
pub fn write_oom_score_adj(value: &[u8]) -> anyhow::Result<()> {
    OpenOptions::new()
        .write(true)
        .open("/proc/self/oom_score_adj")
        .and_then(|mut f| f.write_all(value))
        .context("failed to update /proc/self/oom_score_adj")
}

/// Splits a NUL-terminated argument block (the format of /proc/pid/cmdline).
/// Empty arguments are kept: they are real argv entries.
pub fn parse_cmdline(raw: &[u8]) -> Vec<CString> {
    if raw.is_empty() {
        return Vec::new();
    }
    let raw = raw.strip_suffix(b"\0").unwrap_or(raw);
    raw.split(|&b| b == 0)
        .filter_map(|arg| CString::new(arg).ok())
        .collect()
}

/// Our own argv, recovered from procfs.
pub fn read_cmdline() -> anyhow::Result<Vec<CString>> {
    let raw = std::fs::read("/proc/self/cmdline").context("failed to read /proc/self/cmdline")?;
    let args = parse_cmdline(&raw);
    if args.is_empty() {
        anyhow::bail!("empty /proc/self/cmdline");
    }
    Ok(args)
}

/// Current environment as `KEY=VALUE` C strings.
pub fn environ() -> Vec<CString> {
    use std::os::unix::ffi::OsStrExt;

    std::env::vars_os()
        .filter_map(|(k, v)| {
            let mut entry = k.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(v.as_bytes());
            CString::new(entry).ok()
        })
        .collect()
}

#[cfg(test)]
mod test {
    use nix::unistd::{fork, ForkResult};

    use super::*;

    #[test]
    fn splits_cmdline() {
        let args = parse_cmdline(b"/usr/bin/runc\0init\0--flag=a b\0");
        assert_eq!(
            args,
            vec![
                CString::new("/usr/bin/runc").unwrap(),
                CString::new("init").unwrap(),
                CString::new("--flag=a b").unwrap(),
            ]
        );
        assert!(parse_cmdline(b"").is_empty());
    }

    #[test]
    fn keeps_empty_arguments() {
        let args = parse_cmdline(b"prog\0\0x\0");
        assert_eq!(
            args,
            vec![
                CString::new("prog").unwrap(),
                CString::new("").unwrap(),
                CString::new("x").unwrap(),
            ]
        );
        assert_eq!(parse_cmdline(b"prog\0\0").len(), 2);
        assert_eq!(parse_cmdline(b"\0"), vec![CString::new("").unwrap()]);
    }

    #[test]
    fn reads_own_cmdline() {
        let args = read_cmdline().unwrap();
        let exe = std::env::args_os().next().unwrap();
        use std::os::unix::ffi::OsStrExt;
        assert_eq!(args[0].as_bytes(), exe.as_bytes());
    }

    #[test]
    fn reports_exit_status() {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe { libc::_exit(7) },
            ForkResult::Parent { child } => {
                assert_eq!(wait_for_exit(child).unwrap(), ExitResult::Code(7));
            }
        }
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let _ = nix::sys::signal::raise(Signal::SIGKILL);
                unsafe { libc::_exit(0) }
            }
            ForkResult::Parent { child } => {
                assert_eq!(
                    wait_for_exit(child).unwrap(),
                    ExitResult::Signal(Signal::SIGKILL)
                );
            }
        }
    }

    #[test]
    fn environ_entries_are_key_value() {
        assert!(environ().iter().all(|e| e.as_bytes().contains(&b'=')));
    }
}
