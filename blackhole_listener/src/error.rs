use thiserror::Error;
use std::net::SocketAddr;

/// An error that might occur when creating or running a listener.
#[derive(Error,Debug)]
pub enum ListenerError
{
    #[error("Cannot bind to {address}: {source}")]
    Bind { address: SocketAddr, source: std::io::Error },
    #[error("TLS requested with no TLS config")]
    NoTlsConfig,
    #[error("Invalid TLS configuration: {0}")]
    BadTlsConfig(String),
    #[error("I/O Error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<rustls::Error> for ListenerError
{
    fn from(e: rustls::Error) -> Self
    {
        Self::BadTlsConfig(e.to_string())
    }
}

impl ListenerError
{
    /// The process exit status to use when this error is fatal.
    pub fn exit_code(&self) -> i32
    {
        match self
        {
            Self::Bind { .. } | Self::IoError(_) => exitcode::OSERR,
            Self::NoTlsConfig | Self::BadTlsConfig(_) => exitcode::USAGE,
        }
    }
}
