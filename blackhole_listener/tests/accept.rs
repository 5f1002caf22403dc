use blackhole_listener::*;
use blackhole_smtp::{ListenerFlags, Mode, SmtpSettings};

use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};

fn settings() -> Arc<SmtpSettings>
{
    Arc::new(SmtpSettings { fqdn: "listener.test".to_string(), version: "0.0.1".to_string(), ..Default::default() })
}

fn bind(conn_type: ConnectionType, flags: ListenerFlags) -> (ListenerSpec, std::net::TcpListener, std::net::SocketAddr)
{
    let spec = ListenerSpec { address: "127.0.0.1:0".parse().unwrap(), conn_type, flags };
    let set = ListenerSet::create([spec]).unwrap();
    let address = set.local_addrs().unwrap()[0];
    let (spec, listener) = set.into_inner().remove(0);
    (spec, listener, address)
}

async fn read_line(reader: &mut BufReader<TcpStream>) -> String
{
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    line
}

#[tokio::test]
async fn serves_smtp() {
    let (spec, listener, address) = bind(ConnectionType::Clear, ListenerFlags::default());
    let mut server = Server::start(listener, spec, None, settings()).unwrap();

    let mut client = BufReader::new(TcpStream::connect(address).await.unwrap());
    assert_eq!(read_line(&mut client).await, "220 listener.test ESMTP/0.0.1\r\n");

    client.get_mut().write_all(b"QUIT\r\n").await.unwrap();
    assert_eq!(read_line(&mut client).await, "221 2.0.0 Goodbye\r\n");
    assert_eq!(read_line(&mut client).await, "");

    server.close().await;
}

#[tokio::test]
async fn listener_flags_reach_connections() {
    let flags = ListenerFlags { mode: Some(Mode::Bounce), delay: None };
    let (spec, listener, address) = bind(ConnectionType::Clear, flags);
    let mut server = Server::start(listener, spec, None, settings()).unwrap();

    let mut client = BufReader::new(TcpStream::connect(address).await.unwrap());
    read_line(&mut client).await;

    client.get_mut().write_all(b"DATA\r\n").await.unwrap();
    assert!(read_line(&mut client).await.starts_with("354 "));
    client.get_mut().write_all(b"Subject: x\r\n\r\nbody\r\n.\r\n").await.unwrap();

    let reply = read_line(&mut client).await;
    assert!(reply.starts_with('4') || reply.starts_with('5'), "unexpected reply {}", reply);

    server.close().await;
}

#[tokio::test]
async fn close_drops_connections() {
    let (spec, listener, address) = bind(ConnectionType::Clear, ListenerFlags::default());
    let mut server = Server::start(listener, spec, None, settings()).unwrap();

    let mut client = BufReader::new(TcpStream::connect(address).await.unwrap());
    assert!(read_line(&mut client).await.starts_with("220 "));

    server.close().await;

    assert_eq!(read_line(&mut client).await, "");
    assert!(TcpStream::connect(address).await.is_err());
}

#[tokio::test]
async fn tls_needs_config() {
    let (spec, listener, _) = bind(ConnectionType::Tls, ListenerFlags::default());

    match Server::start(listener, spec, None, settings()) {
        Err(e @ ListenerError::NoTlsConfig) => assert_eq!(e.exit_code(), exitcode::USAGE),
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("TLS listener started without TLS config"),
    }
}
