use crate::{
    child::ChildState,
    config::LoggingConfig,
    privileges::{PrivilegeError, Privileges},
};
use blackhole_ipc::{pipe_pair, HeartbeatChannel, HeartbeatReader, HeartbeatWriter, Token};
use blackhole_listener::{SavedListener, TlsSettings};
use blackhole_smtp::SmtpSettings;

use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    process::{Child, Command},
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval_at, timeout, Instant},
};
use tracing::{debug, error, info, warn};

use std::{
    os::unix::io::{AsRawFd, RawFd},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

/// Timing of the worker/child heartbeat.
#[derive(Clone,Copy,Debug)]
pub struct HeartbeatPolicy
{
    /// How often the worker pings its child
    pub interval: Duration,
    /// How long the child may go without answering before it is replaced
    pub timeout: Duration,
    /// How long a child gets to exit after SIGTERM before it is killed
    pub stop_grace: Duration,
}

impl Default for HeartbeatPolicy
{
    fn default() -> Self
    {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug,Error)]
pub enum WorkerError
{
    #[error("Cannot create heartbeat channel: {0}")]
    Heartbeat(#[from] blackhole_ipc::Error),
    #[error("Cannot pass state to child: {0}")]
    State(std::io::Error),
    #[error("Cannot spawn child: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Privileges(#[from] PrivilegeError),
}

impl WorkerError
{
    pub fn exit_code(&self) -> i32
    {
        match self
        {
            Self::Privileges(e) => e.exit_code(),
            _ => exitcode::OSERR,
        }
    }
}

/// What every worker needs in order to spawn a child. Shared by all workers
/// of a supervisor.
#[derive(Debug)]
pub struct WorkerSetup
{
    /// The binary to run in child mode
    pub exe: PathBuf,
    pub policy: HeartbeatPolicy,
    pub privileges: Option<Privileges>,
    /// Listening sockets, owned by the supervisor, for the child to inherit
    pub listeners: Vec<SavedListener>,
    pub tls: Option<TlsSettings>,
    pub smtp: SmtpSettings,
    pub log: LoggingConfig,
}

/// Why a child is considered dead.
#[derive(Debug)]
enum Liveness
{
    Silent(Duration),
    ChannelFailed(blackhole_ipc::Error),
}

struct RunningChild
{
    process: Child,
    pid: u32,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns one child process at a time and replaces it when it stops answering
/// heartbeats.
pub struct Worker
{
    index: usize,
    setup: Arc<WorkerSetup>,
    child: Option<RunningChild>,
    last_pong: Arc<Mutex<Instant>>,
    liveness_send: mpsc::Sender<Liveness>,
    liveness_recv: mpsc::Receiver<Liveness>,
    pid: watch::Sender<Option<u32>>,
}

impl Worker
{
    pub fn new(index: usize, setup: Arc<WorkerSetup>) -> Self
    {
        let (liveness_send, liveness_recv) = mpsc::channel(4);
        Self {
            index,
            setup,
            child: None,
            last_pong: Arc::new(Mutex::new(Instant::now())),
            liveness_send,
            liveness_recv,
            pid: watch::channel(None).0,
        }
    }

    /// Follow the process id of the current child, `None` while there is none.
    pub fn pid_watch(&self) -> watch::Receiver<Option<u32>>
    {
        self.pid.subscribe()
    }

    /// Spawn a child and start its heartbeat tasks.
    pub async fn start(&mut self) -> Result<(), WorkerError>
    {
        let (worker_ends, child_ends) = pipe_pair()?;
        let (heartbeat_read, heartbeat_write) = child_ends.raw_fds();

        let state = ChildState {
            index: self.index,
            heartbeat_read,
            heartbeat_write,
            listeners: self.setup.listeners.clone(),
            tls: self.setup.tls.clone(),
            smtp: self.setup.smtp.clone(),
            log: self.setup.log.clone(),
        };
        let state_fd = state.prepare().map_err(WorkerError::State)?;
        let state_raw_fd = state_fd.as_file().as_raw_fd();

        let mut inherited: Vec<RawFd> = self.setup.listeners.iter().map(|l| l.fd).collect();
        inherited.extend([heartbeat_read, heartbeat_write, state_raw_fd]);
        let privileges = self.setup.privileges;

        let mut command = Command::new(&self.setup.exe);
        command.arg("--child-state-fd")
               .arg(state_raw_fd.to_string())
               .kill_on_drop(true);

        // Only async-signal-safe calls may happen between fork and exec.
        unsafe
        {
            command.pre_exec(move || {
                use libc::{fcntl, F_GETFD, F_SETFD, FD_CLOEXEC};

                for &fd in &inherited
                {
                    let flags = fcntl(fd, F_GETFD);
                    fcntl(fd, F_SETFD, flags & !FD_CLOEXEC);
                }
                if let Some(privileges) = privileges
                {
                    privileges.apply()?;
                }
                Ok(())
            });
        }

        let process = command.spawn().map_err(|e| match (e.raw_os_error(), privileges)
        {
            (Some(libc::EPERM), Some(p)) => WorkerError::Privileges(PrivilegeError::PermissionDenied { uid: p.uid, gid: p.gid }),
            _ => WorkerError::Spawn(e),
        })?;

        // The child has its own copies now.
        drop(child_ends);
        drop(state_fd);

        let pid = process.id().unwrap_or_default();
        *self.last_pong.lock() = Instant::now();

        let (reader, writer) = HeartbeatChannel::new(worker_ends)?.split();
        let tasks = vec![
            tokio::spawn(ping(writer, Arc::clone(&self.last_pong), self.setup.policy, self.liveness_send.clone())),
            tokio::spawn(listen(reader, Arc::clone(&self.last_pong), self.liveness_send.clone())),
        ];

        self.child = Some(RunningChild { process, pid, tasks });
        self.pid.send_replace(Some(pid));

        info!("Worker {} started child {}", self.index, pid);
        Ok(())
    }

    /// Stop the heartbeat tasks and terminate the child. Does nothing if
    /// there is no child.
    pub async fn stop(&mut self)
    {
        let Some(mut child) = self.child.take() else { return };

        for task in &child.tasks
        {
            task.abort();
        }
        for task in child.tasks.drain(..)
        {
            let _ = task.await;
        }

        match kill(Pid::from_raw(child.pid as i32), Signal::SIGTERM)
        {
            Ok(()) | Err(Errno::ESRCH) => (),
            Err(e) => warn!("Cannot signal child {}: {}", child.pid, e),
        }

        match timeout(self.setup.policy.stop_grace, child.process.wait()).await
        {
            Ok(Ok(status)) => debug!("Child {} exited: {}", child.pid, status),
            Ok(Err(e)) => warn!("Cannot wait for child {}: {}", child.pid, e),
            Err(_) =>
            {
                warn!("Child {} did not exit after SIGTERM; killing it", child.pid);
                if let Err(e) = child.process.kill().await
                {
                    error!("Cannot kill child {}: {}", child.pid, e);
                }
            }
        }

        // Reports from the tasks just cancelled are stale.
        while self.liveness_recv.try_recv().is_ok() { }

        self.pid.send_replace(None);
        info!("Worker {} stopped child {}", self.index, child.pid);
    }

    /// Keep a child running until `shutdown` becomes true, replacing it
    /// whenever it fails its heartbeat. A child that cannot be spawned at all
    /// is reported on `fatal` and ends the worker.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, fatal: mpsc::UnboundedSender<WorkerError>)
    {
        loop
        {
            if *shutdown.borrow()
            {
                break;
            }

            if let Err(e) = self.start().await
            {
                error!("Worker {} cannot start a child: {}", self.index, e);
                let _ = fatal.send(e);
                break;
            }

            select! {
                Some(failure) = self.liveness_recv.recv() => {
                    match failure {
                        Liveness::Silent(silent) => warn!("Worker {}: no heartbeat for {:?}; restarting child", self.index, silent),
                        Liveness::ChannelFailed(e) => warn!("Worker {}: heartbeat failed ({}); restarting child", self.index, e),
                    }
                },
                _ = shutdown.changed() => break,
            }

            self.stop().await;
        }
        self.stop().await;
    }
}

async fn ping(mut writer: HeartbeatWriter, last_pong: Arc<Mutex<Instant>>, policy: HeartbeatPolicy, failures: mpsc::Sender<Liveness>)
{
    let mut ticks = interval_at(Instant::now() + policy.interval, policy.interval);

    loop
    {
        ticks.tick().await;

        let silent = last_pong.lock().elapsed();
        if silent > policy.timeout
        {
            let _ = failures.send(Liveness::Silent(silent)).await;
            return;
        }

        if let Err(e) = writer.send(Token::Ping).await
        {
            let _ = failures.send(Liveness::ChannelFailed(e)).await;
            return;
        }
    }
}

async fn listen(mut reader: HeartbeatReader, last_pong: Arc<Mutex<Instant>>, failures: mpsc::Sender<Liveness>)
{
    loop
    {
        match reader.recv().await
        {
            Ok(Token::Pong) => *last_pong.lock() = Instant::now(),
            Ok(Token::Ping) => debug!("Ignoring ping from child"),
            Err(e) =>
            {
                let _ = failures.send(Liveness::ChannelFailed(e)).await;
                return;
            }
        }
    }
}
