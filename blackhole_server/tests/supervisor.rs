use blackhole_server::{config::ServerConfig, HeartbeatPolicy, Supervisor};

use std::{path::PathBuf, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};

const PATIENCE: Duration = Duration::from_secs(15);

fn config(pidfile: PathBuf) -> ServerConfig {
    let mut config: ServerConfig = json5::from_str(
        r#"{
            listen: [
                { address: "127.0.0.1:0" },
                { address: "127.0.0.1:0", flags: { mode: "bounce" } },
            ],
            workers: 1,
            mailname: "supervisor.test",
        }"#,
    )
    .unwrap();
    config.pidfile = Some(pidfile);
    config
}

struct Client {
    stream: BufReader<TcpStream>,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = timeout(PATIENCE, TcpStream::connect(addr)).await.unwrap().unwrap();
        Self { stream: BufReader::new(stream) }
    }

    async fn line(&mut self) -> String {
        let mut line = String::new();
        timeout(PATIENCE, self.stream.read_line(&mut line)).await.unwrap().unwrap();
        line
    }

    async fn send(&mut self, line: &str) -> String {
        self.stream.get_mut().write_all(format!("{}\r\n", line).as_bytes()).await.unwrap();
        self.line().await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_until_stopped() {
    let pidfile = std::env::temp_dir().join(format!("blackhole-test-{}.pid", std::process::id()));
    std::fs::write(&pidfile, "0\n").unwrap();

    let mut supervisor = Supervisor::create(
        &config(pidfile.clone()),
        PathBuf::from(env!("CARGO_BIN_EXE_blackhole")),
        HeartbeatPolicy::default(),
    )
    .unwrap();

    let addrs = supervisor.local_addrs();
    assert_eq!(addrs.len(), 2);
    assert!(addrs.iter().all(|addr| addr.port() != 0));

    let stop = supervisor.stop_handle();
    let task = tokio::spawn(async move {
        let status = supervisor.run().await;
        (status, supervisor)
    });

    let mut client = Client::connect(addrs[0]).await;
    assert!(client.line().await.starts_with("220 supervisor.test ESMTP"));
    assert_eq!(client.send("QUIT").await, "221 2.0.0 Goodbye\r\n");

    let mut client = Client::connect(addrs[1]).await;
    client.line().await;
    assert_eq!(client.send("MAIL FROM:<a@example.com>").await, "250 2.1.0 OK\r\n");
    assert_eq!(client.send("RCPT TO:<b@example.com>").await, "250 2.1.5 OK\r\n");
    assert!(client.send("DATA").await.starts_with("354"));
    client.stream.get_mut().write_all(b"Subject: hi\r\nx-blackhole-mode: accept\r\n\r\nbody\r\n").await.unwrap();
    let reply = client.send(".").await;
    assert!(reply.starts_with('4') || reply.starts_with('5'), "{}", reply);

    stop.stop();
    let (status, mut supervisor) = timeout(PATIENCE, task).await.unwrap().unwrap();
    assert_eq!(status, exitcode::OK);

    assert!(TcpStream::connect(addrs[0]).await.is_err());
    assert!(!pidfile.exists());

    // Stopping again is harmless.
    std::fs::write(&pidfile, "0\n").unwrap();
    assert_eq!(supervisor.stop().await, exitcode::OK);
    assert!(pidfile.exists());
    std::fs::remove_file(&pidfile).unwrap();
}

#[test]
fn bind_conflict_is_os_error() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = config(std::env::temp_dir().join("unused.pid"));
    config.listen.truncate(1);
    config.listen[0].address = taken.local_addr().unwrap();

    let err = Supervisor::create(&config, PathBuf::from("/bin/true"), HeartbeatPolicy::default())
        .err()
        .expect("bind should fail");
    assert_eq!(err.exit_code(), exitcode::OSERR);
}
