use crate::privileges::{PrivilegeError, Privileges};
use blackhole_listener::{ConnectionType, ListenerError, ListenerSpec, TlsConfig, TlsSettings};
use blackhole_smtp::{DelaySpec, ListenerFlags, Mode, SmtpSettings};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_core::LevelFilter;
use std::{
    collections::{HashMap, HashSet},
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

/// Longest idle timeout a client may be given, in seconds.
pub const MAX_TIMEOUT: u64 = 180;

#[derive(Debug,Error)]
pub enum ConfigError
{
    #[error("Could not read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("Could not parse configuration: {0}")]
    Parse(#[from] json5::Error),
    #[error("You need to define at least one listener")]
    NoListeners,
    #[error("Cannot have multiple listeners on {0}")]
    DuplicateListener(SocketAddr),
    #[error("{0} does not have a usable port")]
    ZeroPort(SocketAddr),
    #[error("To use TLS listeners you must supply a certificate file and key file")]
    MissingTls,
    #[error("Could not load TLS files: {0}")]
    Tls(#[from] ListenerError),
    #[error("Workers must be at least 1")]
    NoWorkers,
    #[error("Cannot have more workers ({workers}) than processors ({cpus})")]
    TooManyWorkers { workers: usize, cpus: usize },
    #[error("Timeout of {0} seconds exceeds the maximum of {}", MAX_TIMEOUT)]
    Timeout(u64),
    #[error("Delay must be lower than timeout")]
    DelayNotBelowTimeout,
    #[error("The directory for pidfile {0} does not exist")]
    PidfileDirectory(PathBuf),
    #[error(transparent)]
    Privileges(#[from] PrivilegeError),
}

impl ConfigError
{
    pub fn exit_code(&self) -> i32
    {
        match self
        {
            Self::Privileges(e) => e.exit_code(),
            _ => exitcode::USAGE,
        }
    }
}

/// Severity threshold for a log sink or module.
#[derive(Clone,Copy,Debug,PartialEq,Eq,PartialOrd,Ord,Serialize,Deserialize)]
#[serde(rename_all="lowercase")]
pub enum LogLevel
{
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl From<LogLevel> for LevelFilter
{
    fn from(level: LogLevel) -> LevelFilter
    {
        match level
        {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info  => LevelFilter::INFO,
            LogLevel::Warn  => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off   => LevelFilter::OFF,
        }
    }
}

/// Where a sink writes: `"stdout"`, `"stderr"` or `{ file: "name" }`.
#[derive(Clone,Debug,PartialEq,Eq,Serialize,Deserialize)]
#[serde(rename_all="lowercase")]
pub enum LogOutput
{
    Stdout,
    Stderr,
    /// A file in the log directory, rolled over daily
    File(PathBuf),
}

#[derive(Clone,Debug,Serialize,Deserialize)]
pub struct LogSink
{
    pub output: LogOutput,
    /// Module path prefixes this sink shows; all of them if empty
    #[serde(default)]
    pub modules: Vec<String>,
    /// Everything the global filter lets through if unset
    pub level: Option<LogLevel>,
}

/// Logging for the supervisor and, passed on in their state, every child.
#[derive(Clone,Debug,Serialize,Deserialize)]
#[serde(default, rename_all="kebab-case")]
pub struct LoggingConfig
{
    pub dir: PathBuf,
    /// Where standard output goes once running in the background
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    /// Lower every threshold above debug to debug; set by `--debug`
    pub debug: bool,
    pub default_level: LogLevel,
    pub module_levels: HashMap<String, LogLevel>,
    pub sinks: Vec<LogSink>,
}

impl Default for LoggingConfig
{
    fn default() -> Self
    {
        Self {
            dir: PathBuf::from("."),
            stdout: None,
            stderr: None,
            debug: false,
            default_level: LogLevel::Info,
            module_levels: HashMap::new(),
            sinks: vec![LogSink { output: LogOutput::Stderr, modules: Vec::new(), level: None }],
        }
    }
}

impl LoggingConfig
{
    pub fn prefix_file(&self, filename: impl AsRef<Path>) -> PathBuf
    {
        self.dir.join(filename)
    }
}

/// One configured listening address.
#[derive(Clone,Debug,Serialize,Deserialize)]
pub struct ListenConfig
{
    pub address: SocketAddr,
    #[serde(default)]
    pub flags: ListenerFlags,
}

fn default_listen() -> Vec<ListenConfig>
{
    ["127.0.0.1:25", "127.0.0.1:587"].iter()
                                     .filter_map(|a| a.parse().ok())
                                     .map(|address| ListenConfig { address, flags: ListenerFlags::default() })
                                     .collect()
}

#[derive(Clone,Debug,Serialize,Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig
{
    pub listen: Vec<ListenConfig>,
    pub tls_listen: Vec<ListenConfig>,
    pub tls: Option<TlsConfig>,
    /// Number of worker processes; one fewer than the processor count if unset
    pub workers: Option<usize>,
    pub user: Option<String>,
    pub group: Option<String>,
    /// Idle timeout for clients, in seconds
    pub timeout: u64,
    pub max_message_size: usize,
    pub dynamic_switch: bool,
    pub mode: Mode,
    pub delay: Option<DelaySpec>,
    /// Name to announce to clients; read from /etc/mailname or the host name if unset
    pub mailname: Option<String>,
    pub pidfile: Option<PathBuf>,
    pub log: LoggingConfig,
}

impl Default for ServerConfig
{
    fn default() -> Self
    {
        let smtp = SmtpSettings::default();
        Self {
            listen: default_listen(),
            tls_listen: Vec::new(),
            tls: None,
            workers: None,
            user: None,
            group: None,
            timeout: smtp.timeout,
            max_message_size: smtp.max_message_size,
            dynamic_switch: smtp.dynamic_switch,
            mode: smtp.mode,
            delay: smtp.delay,
            mailname: None,
            pidfile: None,
            log: LoggingConfig::default(),
        }
    }
}

fn cpu_count() -> usize
{
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn host_mailname() -> String
{
    if let Ok(contents) = fs::read_to_string("/etc/mailname")
    {
        if let Some(name) = contents.lines().next().map(str::trim).filter(|n| !n.is_empty())
        {
            return name.to_string();
        }
    }

    nix::unistd::gethostname().ok()
                              .and_then(|name| name.into_string().ok())
                              .unwrap_or_else(|| "localhost".to_string())
}

impl ServerConfig
{
    pub fn load_file<P: AsRef<Path>>(filename: P) -> Result<Self, ConfigError>
    {
        let path = filename.as_ref();
        let config = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
        Ok(json5::from_str(&config)?)
    }

    /// Check everything that can be checked without binding sockets.
    pub fn validate(&self) -> Result<(), ConfigError>
    {
        if self.listen.is_empty() && self.tls_listen.is_empty()
        {
            return Err(ConfigError::NoListeners);
        }

        let mut seen = HashSet::new();
        for entry in self.listen.iter().chain(&self.tls_listen)
        {
            if entry.address.port() == 0
            {
                return Err(ConfigError::ZeroPort(entry.address));
            }
            if !seen.insert(entry.address)
            {
                return Err(ConfigError::DuplicateListener(entry.address));
            }
        }

        if !self.tls_listen.is_empty() && self.tls.is_none()
        {
            return Err(ConfigError::MissingTls);
        }
        self.tls_settings()?;

        match self.workers
        {
            Some(0) => return Err(ConfigError::NoWorkers),
            Some(workers) if workers > cpu_count() => return Err(ConfigError::TooManyWorkers { workers, cpus: cpu_count() }),
            _ => ()
        }

        if self.timeout > MAX_TIMEOUT
        {
            return Err(ConfigError::Timeout(self.timeout));
        }

        let delays = self.listen.iter()
                                .chain(&self.tls_listen)
                                .filter_map(|entry| entry.flags.delay)
                                .chain(self.delay);
        for delay in delays
        {
            let longest = match delay { DelaySpec::Fixed(secs) => secs, DelaySpec::Range(_, max) => max };
            if longest >= self.timeout
            {
                return Err(ConfigError::DelayNotBelowTimeout);
            }
        }

        if let Some(pidfile) = &self.pidfile
        {
            let dir = pidfile.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            if !dir.is_dir()
            {
                return Err(ConfigError::PidfileDirectory(pidfile.clone()));
            }
        }

        self.privileges()?;

        Ok(())
    }

    pub fn workers(&self) -> usize
    {
        self.workers.unwrap_or_else(|| cpu_count().saturating_sub(1).max(1))
    }

    pub fn listener_specs(&self) -> Vec<ListenerSpec>
    {
        let clear = self.listen.iter().map(|entry| (entry, ConnectionType::Clear));
        let tls = self.tls_listen.iter().map(|entry| (entry, ConnectionType::Tls));

        clear.chain(tls)
             .map(|(entry, conn_type)| ListenerSpec { address: entry.address, conn_type, flags: entry.flags })
             .collect()
    }

    /// Load the certificate and key, if any TLS listener needs them.
    pub fn tls_settings(&self) -> Result<Option<TlsSettings>, ConfigError>
    {
        match &self.tls
        {
            Some(tls) if !self.tls_listen.is_empty() => Ok(Some(tls.load_from_disk()?)),
            _ => Ok(None),
        }
    }

    pub fn privileges(&self) -> Result<Option<Privileges>, PrivilegeError>
    {
        Privileges::resolve(self.user.as_deref(), self.group.as_deref())
    }

    pub fn smtp_settings(&self) -> SmtpSettings
    {
        SmtpSettings {
            fqdn: self.mailname.clone().unwrap_or_else(host_mailname),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timeout: self.timeout,
            max_message_size: self.max_message_size,
            dynamic_switch: self.dynamic_switch,
            mode: self.mode,
            delay: self.delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(text: &str) -> ServerConfig {
        json5::from_str(text).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse("{}");
        assert!(config.validate().is_ok());

        let addrs: Vec<String> = config.listener_specs().iter().map(|s| s.address.to_string()).collect();
        assert_eq!(addrs, vec!["127.0.0.1:25", "127.0.0.1:587"]);
        assert_eq!(config.timeout, 60);
        assert_eq!(config.max_message_size, 512000);
        assert_eq!(config.mode, Mode::Accept);
        assert!(config.dynamic_switch);
        assert!(config.workers() >= 1);
    }

    #[test]
    fn full_file() {
        let config = parse(r#"{
            // comments are allowed
            listen: [
                { address: "0.0.0.0:25" },
                { address: "[::]:25", flags: { mode: "bounce", delay: "5-10" } },
            ],
            workers: 1,
            timeout: 45,
            max_message_size: 1024,
            dynamic_switch: false,
            mode: "random",
            delay: 10,
            mailname: "mx.example.org",
            log: { "default-level": "debug", sinks: [ { output: "stdout" }, { output: { file: "smtp.log" }, level: "warn" } ] },
        }"#);

        assert!(config.validate().is_ok());

        let specs = config.listener_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].flags.mode, Some(Mode::Bounce));
        assert_eq!(specs[1].flags.delay, Some(DelaySpec::Range(5, 10)));

        let smtp = config.smtp_settings();
        assert_eq!(smtp.fqdn, "mx.example.org");
        assert_eq!(smtp.timeout, 45);
        assert_eq!(smtp.mode, Mode::Random);
        assert_eq!(smtp.delay, Some(DelaySpec::Fixed(10)));
        assert_eq!(config.log.default_level, LogLevel::Debug);
        assert_eq!(config.log.sinks[1].output, LogOutput::File(PathBuf::from("smtp.log")));
        assert_eq!(config.log.sinks[1].level, Some(LogLevel::Warn));
    }

    #[test]
    fn sample_config() {
        let config = parse(include_str!("../../configs/blackhole.json5"));
        assert!(config.validate().is_ok());
        assert_eq!(config.listener_specs()[1].flags.mode, Some(Mode::Bounce));
        assert_eq!(config.log.prefix_file("blackhole.log"), PathBuf::from("log/blackhole.log"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(json5::from_str::<ServerConfig>(r#"{ mode: "sideways" }"#).is_err());
        assert!(json5::from_str::<ServerConfig>(r#"{ delay: 61 }"#).is_err());
        assert!(json5::from_str::<ServerConfig>(r#"{ unknown_option: 1 }"#).is_err());

        let cases = [
            (r#"{ listen: [] }"#, "NoListeners"),
            (r#"{ listen: [ { address: "127.0.0.1:25" }, { address: "127.0.0.1:25" } ] }"#, "DuplicateListener"),
            (r#"{ listen: [ { address: "127.0.0.1:0" } ] }"#, "ZeroPort"),
            (r#"{ tls_listen: [ { address: "127.0.0.1:465" } ] }"#, "MissingTls"),
            (r#"{ workers: 0 }"#, "NoWorkers"),
            (r#"{ workers: 100000 }"#, "TooManyWorkers"),
            (r#"{ timeout: 181 }"#, "Timeout"),
            (r#"{ timeout: 30, delay: "10-30" }"#, "DelayNotBelowTimeout"),
            (r#"{ timeout: 30, listen: [ { address: "127.0.0.1:25", flags: { delay: 40 } } ] }"#, "DelayNotBelowTimeout"),
            (r#"{ pidfile: "/nonexistent/dir/blackhole.pid" }"#, "PidfileDirectory"),
            (r#"{ user: "no-such-user-for-blackhole" }"#, "Privileges"),
        ];

        for (text, expected) in cases {
            let err = parse(text).validate().unwrap_err();
            assert!(format!("{:?}", err).starts_with(expected), "{} gave {:?}", text, err);
            assert_eq!(err.exit_code(), exitcode::USAGE);
        }
    }
}
