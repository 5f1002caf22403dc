//! The heartbeat channel between a worker and its child process.
//!
//! A channel is a pair of anonymous pipes, one in each direction. The only
//! messages ever sent are the fixed three-byte [`Token`]s; there is no framing,
//! so both ends always read exactly [`TOKEN_LEN`] bytes at a time.

use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::unix::pipe,
};
use std::{
    fs::File,
    io::ErrorKind,
    os::fd::{
        AsRawFd,
        FromRawFd,
        OwnedFd,
        RawFd,
    },
};
use nix::{
    fcntl::OFlag,
    unistd::pipe2,
};
use thiserror::Error;

/// Size in bytes of every message on a heartbeat channel.
pub const TOKEN_LEN: usize = 3;

#[derive(Debug,Error)]
pub enum Error
{
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Heartbeat channel closed")]
    Closed,
    #[error("Unknown heartbeat token {0:?}")]
    UnknownToken([u8; TOKEN_LEN]),
}

impl From<nix::Error> for Error
{
    fn from(e: nix::Error) -> Self
    {
        Self::Io(e.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A liveness message.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum Token
{
    /// Sent by the worker to ask the child whether it is alive.
    Ping,
    /// The child's answer to a [`Token::Ping`].
    Pong,
}

impl Token
{
    const PING: [u8; TOKEN_LEN] = *b"x01";
    const PONG: [u8; TOKEN_LEN] = *b"x02";

    pub fn as_bytes(&self) -> &'static [u8; TOKEN_LEN]
    {
        match self
        {
            Token::Ping => &Self::PING,
            Token::Pong => &Self::PONG,
        }
    }

    pub fn from_bytes(bytes: &[u8; TOKEN_LEN]) -> Option<Self>
    {
        match *bytes
        {
            Self::PING => Some(Token::Ping),
            Self::PONG => Some(Token::Pong),
            _ => None
        }
    }
}

/// The two pipe ends held by one side of a heartbeat channel.
#[derive(Debug)]
pub struct PipeEnds
{
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl PipeEnds
{
    pub fn raw_fds(&self) -> (RawFd, RawFd)
    {
        (self.read.as_raw_fd(), self.write.as_raw_fd())
    }
}

/// Create the pipes for a new heartbeat channel.
///
/// The first set of ends belongs to the worker, the second to the child. Both
/// are close-on-exec; whoever hands the child ends to another process is
/// responsible for clearing that flag on the descriptors it passes on.
pub fn pipe_pair() -> Result<(PipeEnds, PipeEnds)>
{
    let (up_read, up_write) = pipe2(OFlag::O_CLOEXEC)?;
    let (down_read, down_write) = pipe2(OFlag::O_CLOEXEC)?;

    Ok((
        PipeEnds { read: down_read, write: up_write },
        PipeEnds { read: up_read, write: down_write },
    ))
}

/// Receiving half of a heartbeat channel.
pub struct HeartbeatReader
{
    pipe: pipe::Receiver,
}

impl HeartbeatReader
{
    pub async fn recv(&mut self) -> Result<Token>
    {
        let mut buf = [0u8; TOKEN_LEN];

        match self.pipe.read_exact(&mut buf).await
        {
            Ok(_) => Token::from_bytes(&buf).ok_or(Error::UnknownToken(buf)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(Error::Closed),
            Err(e) => Err(e.into())
        }
    }
}

/// Sending half of a heartbeat channel.
pub struct HeartbeatWriter
{
    pipe: pipe::Sender,
}

impl HeartbeatWriter
{
    pub async fn send(&mut self, token: Token) -> Result<()>
    {
        match self.pipe.write_all(token.as_bytes()).await
        {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Err(Error::Closed),
            Err(e) => Err(e.into())
        }
    }
}

/// One side of a heartbeat channel. Must be constructed inside a tokio runtime.
pub struct HeartbeatChannel
{
    reader: HeartbeatReader,
    writer: HeartbeatWriter,
}

impl HeartbeatChannel
{
    pub fn new(ends: PipeEnds) -> Result<Self>
    {
        let reader = pipe::Receiver::from_file(File::from(ends.read))?;
        let writer = pipe::Sender::from_file(File::from(ends.write))?;

        Ok(Self {
            reader: HeartbeatReader { pipe: reader },
            writer: HeartbeatWriter { pipe: writer },
        })
    }

    /// Construct a channel which takes ownership of the given raw FDs.
    ///
    /// # Safety
    ///
    /// The provided FDs must be open pipe ends which nothing else in this process
    /// owns or will use after being passed to this function.
    pub unsafe fn from_raw_fds(read: RawFd, write: RawFd) -> Result<Self>
    {
        Self::new(PipeEnds {
            read: OwnedFd::from_raw_fd(read),
            write: OwnedFd::from_raw_fd(write),
        })
    }

    pub async fn send(&mut self, token: Token) -> Result<()>
    {
        self.writer.send(token).await
    }

    pub async fn recv(&mut self) -> Result<Token>
    {
        self.reader.recv().await
    }

    pub fn split(self) -> (HeartbeatReader, HeartbeatWriter)
    {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values() {
        assert_eq!(Token::Ping.as_bytes(), b"x01");
        assert_eq!(Token::Pong.as_bytes(), b"x02");
        assert_eq!(Token::from_bytes(b"x02"), Some(Token::Pong));
        assert_eq!(Token::from_bytes(b"x03"), None);
    }

    #[tokio::test]
    async fn ping_pong() {
        let (worker_ends, child_ends) = pipe_pair().unwrap();
        let mut worker = HeartbeatChannel::new(worker_ends).unwrap();
        let mut child = HeartbeatChannel::new(child_ends).unwrap();

        worker.send(Token::Ping).await.unwrap();
        assert_eq!(child.recv().await.unwrap(), Token::Ping);

        child.send(Token::Pong).await.unwrap();
        assert_eq!(worker.recv().await.unwrap(), Token::Pong);
    }

    #[tokio::test]
    async fn closed_peer() {
        let (worker_ends, child_ends) = pipe_pair().unwrap();
        let mut worker = HeartbeatChannel::new(worker_ends).unwrap();
        drop(child_ends);

        assert!(matches!(worker.recv().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn unknown_token() {
        let (worker_ends, child_ends) = pipe_pair().unwrap();
        let mut reader = HeartbeatChannel::new(worker_ends).unwrap().split().0;
        let mut raw = pipe::Sender::from_file(File::from(child_ends.write)).unwrap();

        raw.write_all(b"abc").await.unwrap();
        assert!(matches!(reader.recv().await, Err(Error::UnknownToken(t)) if &t == b"abc"));
    }
}
