//! Process entry points for the supervisor and child modes.

use crate::{
    config::ServerConfig,
    tracing_config::{build_subscriber, ProcessRole},
    Child,
    ChildState,
    HeartbeatPolicy,
    Supervisor,
};

use anyhow::Context;
use std::{
    fs::File,
    os::unix::io::RawFd,
    path::PathBuf,
};
use tracing_subscriber::util::SubscriberInitExt;

/// Options for running as the supervisor.
#[derive(Debug,Default)]
pub struct RunOptions
{
    pub config: Option<PathBuf>,
    /// Validate the configuration and exit
    pub test: bool,
    pub debug: bool,
    pub background: bool,
}

/// Run a supervisor, returning the process exit status.
///
/// Configuration problems are reported on standard error, before logging is
/// set up. Sockets are bound before daemonising so that bind failures reach
/// the terminal too; the tokio runtime is only started afterwards, since it
/// can't survive forking.
pub fn run_supervisor(opts: RunOptions) -> anyhow::Result<i32>
{
    let loaded = match &opts.config
    {
        Some(path) => ServerConfig::load_file(path),
        None => Ok(ServerConfig::default()),
    };
    let mut config = match loaded.and_then(|config| config.validate().map(|_| config))
    {
        Ok(config) => config,
        Err(e) =>
        {
            eprintln!("{}", e);
            return Ok(e.exit_code());
        }
    };

    if opts.test
    {
        println!("blackhole: configuration is valid");
        return Ok(exitcode::OK);
    }

    config.log.debug |= opts.debug;

    build_subscriber(config.log.clone(), ProcessRole::Supervisor).context("Cannot set up logging")?.init();

    if nix::unistd::getuid().is_root() && config.user.is_none() && config.group.is_none()
    {
        tracing::warn!("Running as root without a user or group to switch to");
    }

    let exe = std::env::current_exe().context("Cannot find own executable")?;
    let mut supervisor = match Supervisor::create(&config, exe, HeartbeatPolicy::default())
    {
        Ok(supervisor) => supervisor,
        Err(e) =>
        {
            tracing::error!("{}", e);
            return Ok(e.exit_code());
        }
    };

    if opts.background
    {
        let mut daemon = daemonize::Daemonize::new()
            .exit_action(|| println!("Running in background mode"))
            .working_directory(std::env::current_dir()?);

        if let Some(stdout) = &config.log.stdout
        {
            daemon = daemon.stdout(File::create(config.log.prefix_file(stdout))?);
        }
        if let Some(stderr) = &config.log.stderr
        {
            daemon = daemon.stderr(File::create(config.log.prefix_file(stderr))?);
        }
        if let Some(pidfile) = &config.pidfile
        {
            daemon = daemon.pid_file(pidfile);
        }

        daemon.start().context("Failed to fork to background")?;
    }
    else if let Some(pidfile) = &config.pidfile
    {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))
            .with_context(|| format!("Cannot write pidfile {}", pidfile.display()))?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    Ok(runtime.block_on(supervisor.run()))
}

/// Run as a child process, with state left by a worker in `fd`. Only
/// returns if the state can't be read.
pub fn run_child(fd: RawFd) -> anyhow::Result<()>
{
    let state = unsafe { ChildState::read(fd) }.context("Failed to unpack child state")?;

    build_subscriber(state.log.clone(), ProcessRole::Child(state.index)).context("Cannot set up logging")?.init();
    tracing::debug!("Child {} started with state FD {}", state.index, fd);

    Child::start(state)
}
