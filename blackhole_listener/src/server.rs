use crate::*;
use blackhole_smtp::{SmtpConnection, SmtpSettings};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::mpsc::{channel, error::TrySendError, Receiver, Sender},
    task::{JoinHandle, JoinSet},
    select,
};
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

use std::{
    net::SocketAddr,
    sync::Arc,
};

#[derive(Debug)]
enum ServerControl
{
    Close,
}

/// The accept loop for one listening socket.
///
/// Each accepted client runs as its own task. Closing the server stops
/// accepting and aborts every one of those tasks.
pub struct Server
{
    spec: ListenerSpec,
    control_channel: Sender<ServerControl>,
    task: Option<JoinHandle<()>>,
}

impl Server
{
    /// Start serving on an already-bound socket. Must be called inside a tokio
    /// runtime.
    pub fn start(listener: std::net::TcpListener,
                 spec: ListenerSpec,
                 tls_config: Option<Arc<rustls::ServerConfig>>,
                 settings: Arc<SmtpSettings>,
            ) -> Result<Self, ListenerError>
    {
        let acceptor = match spec.conn_type
        {
            ConnectionType::Clear => None,
            ConnectionType::Tls => Some(TlsAcceptor::from(tls_config.ok_or(ListenerError::NoTlsConfig)?)),
        };

        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let (control_send, control_receive) = channel(8);

        let task = tokio::spawn(Self::listen_loop(listener, control_receive, spec.clone(), acceptor, settings));

        Ok(Self {
            spec,
            control_channel: control_send,
            task: Some(task),
        })
    }

    /// Stop accepting, drop every connection, and wait for that to finish.
    pub async fn close(&mut self)
    {
        let _ = self.control_channel.send(ServerControl::Close).await;

        if let Some(task) = self.task.take()
        {
            if let Err(e) = task.await
            {
                tracing::error!("Listener task for {} failed: {}", self.spec, e);
            }
        }
    }

    async fn listen_loop(
        listener: TcpListener,
        mut control_channel: Receiver<ServerControl>,
        spec: ListenerSpec,
        acceptor: Option<TlsAcceptor>,
        settings: Arc<SmtpSettings>,
    )
    {
        let mut connections = JoinSet::new();

        loop
        {
            select! {
                res = listener.accept() => {
                    match res {
                        Ok((stream, peer)) =>
                        {
                            let span = tracing::debug_span!("connection", %peer, listener = %spec.address);
                            let task = Self::serve(stream, peer, spec.clone(), acceptor.clone(), Arc::clone(&settings));
                            connections.spawn(task.instrument(span));
                        }
                        Err(e) =>
                        {
                            tracing::error!("Error accepting on {}: {}", spec, e);
                        }
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => { },
                control = control_channel.recv() => {
                    match control {
                        None | Some(ServerControl::Close) => break,
                    }
                }
            }
        }

        tracing::debug!("Closing {} with {} open connections", spec, connections.len());
        connections.shutdown().await;
    }

    async fn serve(stream: TcpStream,
                   peer: SocketAddr,
                   spec: ListenerSpec,
                   acceptor: Option<TlsAcceptor>,
                   settings: Arc<SmtpSettings>)
    {
        tracing::debug!("Accepted connection from {}", peer);

        match acceptor
        {
            None => Self::run_session(stream, spec, settings).await,
            Some(acceptor) =>
            {
                let handshake = tokio::time::timeout(settings.idle_timeout(), acceptor.accept(stream)).await;
                match handshake
                {
                    Ok(Ok(tls_stream)) => Self::run_session(tls_stream, spec, settings).await,
                    Ok(Err(e)) => tracing::debug!("TLS handshake failed: {}", e),
                    Err(_) => tracing::debug!("TLS handshake timed out"),
                }
            }
        }
    }

    async fn run_session<S>(stream: S, spec: ListenerSpec, settings: Arc<SmtpSettings>)
        where S: AsyncRead + AsyncWrite + Unpin
    {
        SmtpConnection::new(stream, settings, spec.flags).run().await
    }
}

impl Drop for Server
{
    fn drop(&mut self)
    {
        if let Err(TrySendError::Full(_)) = self.control_channel.try_send(ServerControl::Close)
        {
            tracing::error!("Error closing dropped listener {}", self.spec);
        }
    }
}
