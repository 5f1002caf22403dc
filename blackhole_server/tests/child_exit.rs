use blackhole_ipc::pipe_pair;
use blackhole_listener::{ConnectionType, ListenerSet, ListenerSpec};
use blackhole_server::{config::LoggingConfig, ChildState};
use blackhole_smtp::SmtpSettings;

use std::{
    io::{BufRead, BufReader, Read},
    net::TcpStream,
    os::unix::{io::AsRawFd, process::CommandExt},
    process::Command,
    thread::sleep,
    time::{Duration, Instant},
};

const PATIENCE: Duration = Duration::from_secs(15);

#[test]
fn child_exits_when_its_worker_goes_away() {
    let spec = ListenerSpec {
        address: "127.0.0.1:0".parse().unwrap(),
        conn_type: ConnectionType::Clear,
        flags: Default::default(),
    };
    let listeners = ListenerSet::create([spec]).unwrap();
    let addr = listeners.local_addrs().unwrap()[0];

    let (worker_ends, child_ends) = pipe_pair().unwrap();
    let (heartbeat_read, heartbeat_write) = child_ends.raw_fds();
    let state = ChildState {
        index: 0,
        heartbeat_read,
        heartbeat_write,
        listeners: listeners.save(),
        tls: None,
        smtp: SmtpSettings { fqdn: "child.test".to_string(), ..Default::default() },
        log: LoggingConfig::default(),
    };
    let memfd = state.prepare().unwrap();
    let state_fd = memfd.as_file().as_raw_fd();

    let mut inherited: Vec<i32> = state.listeners.iter().map(|l| l.fd).collect();
    inherited.extend([heartbeat_read, heartbeat_write, state_fd]);

    let mut command = Command::new(env!("CARGO_BIN_EXE_blackhole"));
    command.arg("--child-state-fd").arg(state_fd.to_string());
    unsafe {
        command.pre_exec(move || {
            for &fd in &inherited {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
            }
            Ok(())
        });
    }
    let mut child = command.spawn().unwrap();
    drop(child_ends);
    drop(memfd);

    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(PATIENCE)).unwrap();
    let mut reader = BufReader::new(stream);
    let mut banner = String::new();
    reader.read_line(&mut banner).unwrap();
    assert!(banner.starts_with("220 child.test ESMTP"), "{}", banner);

    // Closing the worker's ends is all the child sees of a dead worker.
    drop(worker_ends);

    let deadline = Instant::now() + PATIENCE;
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        assert!(Instant::now() < deadline, "child still running");
        sleep(Duration::from_millis(50));
    };
    assert!(status.success(), "{}", status);

    // Its open connections went with it.
    let mut rest = Vec::new();
    assert_eq!(reader.read_to_end(&mut rest).unwrap_or(0), 0);
}
