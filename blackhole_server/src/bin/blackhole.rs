use blackhole_server::run::{run_child, run_supervisor, RunOptions};

use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "blackhole", rename_all = "kebab")]
struct Opts {
    /// Config file location
    #[structopt(short, long)]
    conf: Option<PathBuf>,

    /// Check the configuration and exit
    #[structopt(short, long)]
    test: bool,

    /// Enable debug logging
    #[structopt(short, long)]
    debug: bool,

    /// Fork into the background
    #[structopt(short, long)]
    background: bool,

    /// FD from which a child process reads its state
    #[structopt(long, hidden = true)]
    child_state_fd: Option<i32>,
}

pub fn main() -> Result<(), anyhow::Error> {
    let opts = Opts::from_args();

    if let Some(fd) = opts.child_state_fd {
        return run_child(fd);
    }

    let status = run_supervisor(RunOptions {
        config: opts.conf,
        test: opts.test,
        debug: opts.debug,
        background: opts.background,
    })?;

    std::process::exit(status)
}
