use crate::config::LoggingConfig;
use blackhole_ipc::{HeartbeatChannel, Token};
use blackhole_listener::{build_tls_config, ListenerError, ListenerSet, SavedListener, Server, TlsSettings};
use blackhole_smtp::SmtpSettings;

use memfd::{Memfd, MemfdOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
};
use tracing::{debug, error, info, warn};

use std::{
    io::Seek,
    os::unix::io::{FromRawFd, RawFd},
    sync::Arc,
};

/// Everything a child process is started with, passed from its worker in a
/// memfd.
#[derive(Debug,Serialize,Deserialize)]
pub struct ChildState
{
    pub index: usize,
    pub heartbeat_read: RawFd,
    pub heartbeat_write: RawFd,
    pub listeners: Vec<SavedListener>,
    pub tls: Option<TlsSettings>,
    pub smtp: SmtpSettings,
    pub log: LoggingConfig,
}

impl ChildState
{
    /// Serialise into a fresh close-on-exec memfd, rewound for reading.
    pub fn prepare(&self) -> std::io::Result<Memfd>
    {
        let memfd = MemfdOptions::default()
            .close_on_exec(true)
            .create("child_state")
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let mut file = memfd.as_file();

        serde_json::to_writer(file, self)?;
        file.rewind()?;
        Ok(memfd)
    }

    /// Read the state left by [`prepare`](Self::prepare).
    ///
    /// # Safety
    ///
    /// `fd` must be an open memfd created by `prepare` and not owned by
    /// anything else in this process.
    pub unsafe fn read(fd: RawFd) -> Result<Self, serde_json::Error>
    {
        let memfd = Memfd::from_raw_fd(fd);
        serde_json::from_reader(memfd.as_file())
    }
}

#[derive(Debug,Error)]
pub enum ChildError
{
    #[error("Cannot open heartbeat channel: {0}")]
    Heartbeat(#[from] blackhole_ipc::Error),
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

impl ChildError
{
    pub fn exit_code(&self) -> i32
    {
        match self
        {
            Self::Heartbeat(_) => exitcode::OSERR,
            Self::Listener(e) => e.exit_code(),
        }
    }
}

/// A process serving SMTP on every inherited socket, for as long as its
/// worker keeps the heartbeat going.
pub struct Child
{
    index: usize,
    heartbeat: HeartbeatChannel,
    servers: Vec<Server>,
}

impl Child
{
    /// Run a child to completion on a single-threaded runtime and exit the
    /// process.
    pub fn start(state: ChildState) -> !
    {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build()
        {
            Ok(runtime) => runtime,
            Err(e) =>
            {
                error!("Cannot build runtime: {}", e);
                std::process::exit(exitcode::OSERR);
            }
        };

        let status = runtime.block_on(async move {
            match Self::create(state)
            {
                Ok(child) =>
                {
                    child.run().await;
                    exitcode::OK
                }
                Err(e) =>
                {
                    error!("Cannot start child: {}", e);
                    e.exit_code()
                }
            }
        });

        // Don't wait on anything still blocking the runtime.
        runtime.shutdown_background();
        std::process::exit(status)
    }

    /// Take ownership of the inherited descriptors and start a server on each
    /// socket. Must be called inside a tokio runtime.
    fn create(state: ChildState) -> Result<Self, ChildError>
    {
        let heartbeat = unsafe { HeartbeatChannel::from_raw_fds(state.heartbeat_read, state.heartbeat_write)? };
        let listeners = unsafe { ListenerSet::restore(state.listeners) };

        let tls_config = state.tls.as_ref().map(build_tls_config).transpose()?;
        let settings = Arc::new(state.smtp);

        let mut servers = Vec::new();
        for (spec, listener) in listeners.into_inner()
        {
            servers.push(Server::start(listener, spec, tls_config.clone(), Arc::clone(&settings))?);
        }

        Ok(Self { index: state.index, heartbeat, servers })
    }

    async fn run(mut self)
    {
        info!("Child {} serving {} listeners", self.index, self.servers.len());

        let (mut terminate, mut interrupt) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt()))
        {
            (Ok(terminate), Ok(interrupt)) => (terminate, interrupt),
            (Err(e), _) | (_, Err(e)) =>
            {
                error!("Cannot install signal handlers: {}", e);
                return self.stop().await;
            }
        };

        let index = self.index;
        {
            let heartbeat = Self::heartbeat(&mut self.heartbeat);
            tokio::pin!(heartbeat);

            loop
            {
                select! {
                    _ = terminate.recv() => {
                        info!("Child {} received SIGTERM", index);
                        break;
                    },
                    // The supervisor stops us on interrupt.
                    _ = interrupt.recv() => debug!("Child {} ignoring SIGINT", index),
                    e = &mut heartbeat => {
                        warn!("Child {} lost its worker: {}", index, e);
                        break;
                    }
                }
            }
        }

        self.stop().await
    }

    /// Answer pings until the channel fails.
    async fn heartbeat(channel: &mut HeartbeatChannel) -> blackhole_ipc::Error
    {
        loop
        {
            match channel.recv().await
            {
                Ok(Token::Ping) =>
                {
                    if let Err(e) = channel.send(Token::Pong).await
                    {
                        return e;
                    }
                }
                Ok(Token::Pong) => debug!("Ignoring pong from worker"),
                Err(e) => return e,
            }
        }
    }

    /// Close every server and its connections.
    async fn stop(self)
    {
        for mut server in self.servers
        {
            server.close().await;
        }
        info!("Child {} stopped", self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_survives_memfd() {
        let state = ChildState {
            index: 3,
            heartbeat_read: 10,
            heartbeat_write: 11,
            listeners: Vec::new(),
            tls: None,
            smtp: SmtpSettings::default(),
            log: LoggingConfig::default(),
        };

        let memfd = state.prepare().unwrap();
        let fd = std::os::unix::io::IntoRawFd::into_raw_fd(memfd.into_file());
        let restored = unsafe { ChildState::read(fd) }.unwrap();

        assert_eq!(restored.index, 3);
        assert_eq!((restored.heartbeat_read, restored.heartbeat_write), (10, 11));
        assert_eq!(restored.smtp.max_message_size, state.smtp.max_message_size);
    }
}
