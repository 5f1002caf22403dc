use crate::{
    config::{ConfigError, ServerConfig},
    worker::{HeartbeatPolicy, Worker, WorkerError, WorkerSetup},
};
use blackhole_listener::{build_tls_config, ListenerError, ListenerSet};

use thiserror::Error;
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
    sync::{mpsc, watch, Notify},
    task::JoinHandle,
};
use tracing::{error, info};

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};

#[derive(Debug,Error)]
pub enum SupervisorError
{
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

impl SupervisorError
{
    pub fn exit_code(&self) -> i32
    {
        match self
        {
            Self::Config(e) => e.exit_code(),
            Self::Listener(e) => e.exit_code(),
        }
    }
}

/// Requests that a running [`Supervisor`] stops, from outside its signal
/// handling.
#[derive(Clone)]
pub struct StopHandle(Arc<Notify>);

impl StopHandle
{
    pub fn stop(&self)
    {
        self.0.notify_one();
    }
}

/// The top-level process. Owns the listening sockets and one worker per
/// configured child.
pub struct Supervisor
{
    listeners: Option<ListenerSet>,
    setup: Arc<WorkerSetup>,
    worker_count: usize,
    workers: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    fatal_send: mpsc::UnboundedSender<WorkerError>,
    fatal_recv: mpsc::UnboundedReceiver<WorkerError>,
    stop_request: Arc<Notify>,
    pidfile: Option<PathBuf>,
    stopped: bool,
}

impl Supervisor
{
    /// Bind every listener and prepare, but don't start, the workers.
    ///
    /// `exe` is the binary children are run from. Does not need a tokio
    /// runtime, so it can run before daemonising.
    pub fn create(config: &ServerConfig, exe: PathBuf, policy: HeartbeatPolicy) -> Result<Self, SupervisorError>
    {
        let tls = config.tls_settings()?;
        if let Some(tls) = &tls
        {
            build_tls_config(tls)?;
        }
        let privileges = config.privileges().map_err(ConfigError::from)?;

        let listeners = ListenerSet::create(config.listener_specs())?;

        let setup = WorkerSetup {
            exe,
            policy,
            privileges,
            listeners: listeners.save(),
            tls,
            smtp: config.smtp_settings(),
            log: config.log.clone(),
        };
        let (fatal_send, fatal_recv) = mpsc::unbounded_channel();

        Ok(Self {
            listeners: Some(listeners),
            setup: Arc::new(setup),
            worker_count: config.workers(),
            workers: Vec::new(),
            shutdown: watch::channel(false).0,
            fatal_send,
            fatal_recv,
            stop_request: Arc::new(Notify::new()),
            pidfile: config.pidfile.clone(),
            stopped: false,
        })
    }

    /// Addresses actually bound, one per listener.
    pub fn local_addrs(&self) -> Vec<SocketAddr>
    {
        self.listeners.as_ref()
                      .and_then(|set| set.local_addrs().ok())
                      .unwrap_or_default()
    }

    pub fn stop_handle(&self) -> StopHandle
    {
        StopHandle(Arc::clone(&self.stop_request))
    }

    /// Start the workers and wait for SIGTERM, SIGINT, a stop request or a
    /// fatal worker error. Returns the process exit status.
    pub async fn run(&mut self) -> i32
    {
        let (mut terminate, mut interrupt) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt()))
        {
            (Ok(terminate), Ok(interrupt)) => (terminate, interrupt),
            (Err(e), _) | (_, Err(e)) =>
            {
                error!("Cannot install signal handlers: {}", e);
                self.stop().await;
                return exitcode::OSERR;
            }
        };

        for index in 0..self.worker_count
        {
            let worker = Worker::new(index, Arc::clone(&self.setup));
            let task = worker.run(self.shutdown.subscribe(), self.fatal_send.clone());
            self.workers.push(tokio::spawn(task));
        }
        info!("Started {} workers", self.worker_count);

        let status = select! {
            _ = terminate.recv() => { info!("Received SIGTERM"); exitcode::OK },
            _ = interrupt.recv() => { info!("Received SIGINT"); exitcode::OK },
            _ = self.stop_request.notified() => exitcode::OK,
            Some(e) = self.fatal_recv.recv() => {
                error!("Fatal worker error: {}", e);
                e.exit_code()
            },
        };

        self.stop().await;
        status
    }

    /// Stop every worker and its child, close the listening sockets and remove
    /// the pidfile. Only the first call does anything.
    pub async fn stop(&mut self) -> i32
    {
        if self.stopped
        {
            return exitcode::OK;
        }
        self.stopped = true;

        self.shutdown.send_replace(true);
        for worker in self.workers.drain(..)
        {
            if let Err(e) = worker.await
            {
                error!("Worker task failed: {}", e);
            }
        }

        self.listeners = None;

        if let Some(pidfile) = &self.pidfile
        {
            match std::fs::remove_file(pidfile)
            {
                Ok(()) => (),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => error!("Cannot remove pidfile {}: {}", pidfile.display(), e),
            }
        }

        info!("Stopped");
        exitcode::OK
    }
}
