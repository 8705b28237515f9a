use std::{ffi::OsString, os::fd::RawFd, path::PathBuf};

pub const ENV_INIT_PIPE: &str = "_LIBCONTAINER_INITPIPE";
pub const ENV_SYNC_PIPE: &str = "_LIBCONTAINER_STAGE1PIPE";
pub const ENV_LOG_PIPE: &str = "_LIBCONTAINER_LOGPIPE";
pub const ENV_LOG_LEVEL: &str = "_LIBCONTAINER_LOGLEVEL";
pub const ENV_STATE_DIR: &str = "_LIBCONTAINER_STATEDIR";
pub const ENV_CLONED_BINARY: &str = "_LIBCONTAINER_CLONED_BINARY";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EnvError {
    #[error("unable to parse {name}={value:?}")]
    Invalid { name: &'static str, value: OsString },
}

/// Bootstrap settings handed to us by the runtime through the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapEnv {
    pub init_pipe: Option<RawFd>,
    pub sync_pipe: Option<RawFd>,
    pub log_pipe: Option<RawFd>,
    pub log_level: Option<u32>,
    pub state_dir: Option<PathBuf>,
}

impl BootstrapEnv {
    pub fn from_env() -> Result<Self, EnvError> {
        Self::from_lookup(|name| std::env::var_os(name))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Result<Self, EnvError> {
        Ok(BootstrapEnv {
            init_pipe: parse_int(&lookup, ENV_INIT_PIPE)?,
            sync_pipe: parse_int(&lookup, ENV_SYNC_PIPE)?,
            log_pipe: parse_int(&lookup, ENV_LOG_PIPE)?,
            log_level: parse_int(&lookup, ENV_LOG_LEVEL)?.map(|v| v as u32),
            state_dir: lookup(ENV_STATE_DIR)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        })
    }

    /// Both pipes present: this process was started as a bootstrap helper.
    pub fn bootstrap_pipes(&self) -> Option<(RawFd, RawFd)> {
        Some((self.init_pipe?, self.sync_pipe?))
    }
}

fn parse_int(
    lookup: &impl Fn(&str) -> Option<OsString>,
    name: &'static str,
) -> Result<Option<i32>, EnvError> {
    let Some(value) = lookup(name) else {
        return Ok(None);
    };
    match value.to_str().and_then(|s| s.parse::<i32>().ok()) {
        Some(v) if v >= 0 => Ok(Some(v)),
        _ => Err(EnvError::Invalid { name, value }),
    }
}

/// Set by the trusted-copy step right before re-executing; see `cloned_binary`.
pub fn cloned_binary_marker() -> bool {
    std::env::var_os(ENV_CLONED_BINARY).is_some_and(|v| v == "1")
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn missing_pipes_mean_not_bootstrap() {
        let env = BootstrapEnv::from_lookup(lookup(&[(ENV_INIT_PIPE, "3")])).unwrap();
        assert_eq!(env.init_pipe, Some(3));
        assert_eq!(env.bootstrap_pipes(), None);

        let env = BootstrapEnv::from_lookup(lookup(&[])).unwrap();
        assert_eq!(env, BootstrapEnv::default());
    }

    #[test]
    fn parses_all_fields() {
        let env = BootstrapEnv::from_lookup(lookup(&[
            (ENV_INIT_PIPE, "3"),
            (ENV_SYNC_PIPE, "4"),
            (ENV_LOG_PIPE, "5"),
            (ENV_LOG_LEVEL, "6"),
            (ENV_STATE_DIR, "/run/ctr"),
        ]))
        .unwrap();
        assert_eq!(env.bootstrap_pipes(), Some((3, 4)));
        assert_eq!(env.log_pipe, Some(5));
        assert_eq!(env.log_level, Some(6));
        assert_eq!(env.state_dir, Some(PathBuf::from("/run/ctr")));
    }

    #[test]
    fn rejects_bad_numbers() {
        for bad in ["-1", "abc", "", "3x"] {
            let res = BootstrapEnv::from_lookup(lookup(&[(ENV_SYNC_PIPE, bad)]));
            assert_eq!(
                res,
                Err(EnvError::Invalid {
                    name: ENV_SYNC_PIPE,
                    value: OsString::from(bad)
                })
            );
        }
    }
}
