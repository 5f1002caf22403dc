use crate::*;

use socket2::{Domain, Protocol, Socket, Type};
use std::{
    net::{SocketAddr, TcpListener},
    os::unix::io::{AsRawFd, FromRawFd},
};

/// Backlog passed to `listen(2)` for every socket.
pub const LISTEN_BACKLOG: i32 = 1024;

/// Every listening socket owned by one process. Dropping the set closes them.
#[derive(Debug)]
pub struct ListenerSet
{
    listeners: Vec<(ListenerSpec, TcpListener)>,
}

fn bind(address: SocketAddr) -> std::io::Result<TcpListener>
{
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    if address.is_ipv6()
    {
        socket.set_only_v6(true)?;
    }
    socket.bind(&address.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

impl ListenerSet
{
    /// Bind every listener in `specs`, in order.
    ///
    /// On failure, any sockets bound so far are closed before returning.
    pub fn create(specs: impl IntoIterator<Item = ListenerSpec>) -> Result<Self, ListenerError>
    {
        let mut listeners = Vec::new();

        for spec in specs
        {
            let listener = bind(spec.address).map_err(|source| ListenerError::Bind { address: spec.address, source })?;
            tracing::info!("Listening on {}", spec);
            listeners.push((spec, listener));
        }

        Ok(Self { listeners })
    }

    /// Reconstruct a set from sockets inherited from a parent process.
    ///
    /// # Safety
    ///
    /// Each provided FD must be an open, listening TCP socket which nothing else
    /// in this process owns or will use after being passed to this function.
    pub unsafe fn restore(saved: Vec<SavedListener>) -> Self
    {
        let listeners = saved.into_iter()
                             .map(|s| (s.spec, TcpListener::from_raw_fd(s.fd)))
                             .collect();
        Self { listeners }
    }

    /// Describe the set for a child process. The sockets stay owned by `self`.
    pub fn save(&self) -> Vec<SavedListener>
    {
        self.listeners.iter()
                      .map(|(spec, listener)| SavedListener { fd: listener.as_raw_fd(), spec: spec.clone() })
                      .collect()
    }

    /// Local addresses actually bound, which differ from the specs when a
    /// spec asked for port 0.
    pub fn local_addrs(&self) -> std::io::Result<Vec<SocketAddr>>
    {
        self.listeners.iter().map(|(_, listener)| listener.local_addr()).collect()
    }

    pub fn into_inner(self) -> Vec<(ListenerSpec, TcpListener)>
    {
        self.listeners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(address: &str) -> ListenerSpec {
        ListenerSpec { address: address.parse().unwrap(), conn_type: ConnectionType::Clear, flags: Default::default() }
    }

    #[test]
    fn bind_and_save() {
        let set = ListenerSet::create([spec("127.0.0.1:0"), spec("127.0.0.1:0")]).unwrap();

        let saved = set.save();
        assert_eq!(saved.len(), 2);
        assert_ne!(saved[0].fd, saved[1].fd);
        let addrs = set.local_addrs().unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs.iter().all(|a| a.port() != 0));
    }

    #[test]
    fn bind_failure() {
        // TEST-NET-1 is never assigned to a local interface.
        let result = ListenerSet::create([spec("127.0.0.1:0"), spec("192.0.2.1:2525")]);

        match result {
            Err(e @ ListenerError::Bind { .. }) => assert_eq!(e.exit_code(), exitcode::OSERR),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
