use std::{ffi::OsString, os::unix::process::CommandExt, process::Command};

use anyhow::anyhow;
use clap::Parser;
use nsenter::{env::BootstrapEnv, nsexec, NsExec};
use sysx::set_cloexec;
use tracing::debug;

/// Places itself into the namespaces described on the init pipe, then runs COMMAND.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Command to run in the leaf process
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

fn main() -> anyhow::Result<()> {
    // before anything can spawn a thread
    let stage = nsexec();

    let cli = Cli::parse();
    let Some((prog, args)) = cli.command.split_first() else {
        std::process::exit(127);
    };

    if stage == NsExec::Init {
        // the payload has no business with our pipes
        let env = BootstrapEnv::from_env()?;
        for fd in [env.init_pipe, env.log_pipe].into_iter().flatten() {
            let _ = set_cloexec(fd);
        }
        debug!("executing {:?}", cli.command);
    }

    let err = Command::new(prog).args(args).exec();
    Err(anyhow!(err).context(format!("failed to execute {:?}", prog)))
}
