//! Turning a [`LoggingConfig`] into a tracing subscriber.
//!
//! The supervisor and each of its children build their own subscriber from
//! the same configuration, usually writing to the same sinks. Every line is
//! therefore stamped with the role of the process that wrote it.

use crate::config::*;
use tracing_subscriber::{
    prelude::*,
    filter::{filter_fn, Targets},
    fmt::{
        format::Writer,
        time::{FormatTime, SystemTime},
    },
    registry::LookupSpan,
    Layer,
};
use tracing_core::LevelFilter;
use tracing::Subscriber;

use std::{
    fmt,
    io::Error as IoError,
    sync::Arc,
};

/// Which part of the process tree is logging.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum ProcessRole
{
    Supervisor,
    /// The child run by the worker with this index
    Child(usize),
}

impl fmt::Display for ProcessRole
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self
        {
            Self::Supervisor => f.write_str("supervisor"),
            Self::Child(index) => write!(f, "child {} pid {}", index, std::process::id()),
        }
    }
}

/// Timestamp followed by the process role.
#[derive(Clone)]
struct RoleStamp(Arc<str>);

impl From<ProcessRole> for RoleStamp
{
    fn from(role: ProcessRole) -> Self
    {
        Self(role.to_string().into())
    }
}

impl FormatTime for RoleStamp
{
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result
    {
        SystemTime.format_time(w)?;
        write!(w, " [{}]", self.0)
    }
}

/// The threshold actually applied, once `debug` has had its say.
fn effective(level: LogLevel, debug: bool) -> LogLevel
{
    if debug { level.min(LogLevel::Debug) } else { level }
}

fn sink_layer<S>(sink: LogSink, conf: &LoggingConfig, stamp: &RoleStamp) -> Result<Box<dyn Layer<S> + Send + Sync + 'static>, IoError>
    where S: Subscriber + Send + Sync,
          for<'span> S: LookupSpan<'span>,
{
    let layer = tracing_subscriber::fmt::layer().with_timer(stamp.clone());
    let layer = match sink.output
    {
        LogOutput::File(filename) =>
        {
            layer.with_writer(tracing_appender::rolling::daily(&conf.dir, filename))
                 .with_ansi(false)
                 .boxed()
        }
        LogOutput::Stdout => layer.with_writer(std::io::stdout).boxed(),
        LogOutput::Stderr => layer.with_writer(std::io::stderr).boxed(),
    };

    let level = sink.level.map_or(LevelFilter::TRACE, |level| effective(level, conf.debug).into());
    let modules = sink.modules;

    let filter = filter_fn(move |metadata| {
        metadata.level() <= &level
            && (modules.is_empty()
                || metadata.module_path().map_or(true, |path| modules.iter().any(|m| path.starts_with(m.as_str()))))
    });

    Ok(layer.with_filter(filter).boxed())
}

/// Build the subscriber for one process of the tree, creating the log
/// directory if needed.
pub fn build_subscriber(conf: LoggingConfig, role: ProcessRole) -> Result<impl Subscriber, IoError>
{
    std::fs::create_dir_all(&conf.dir)?;

    let stamp = RoleStamp::from(role);
    let layers = conf.sinks.iter()
                           .cloned()
                           .map(|sink| sink_layer(sink, &conf, &stamp))
                           .collect::<Result<Vec<_>, _>>()?;

    // Per-module levels quieten dependencies; the sinks do the rest.
    let filter = Targets::new().with_default(effective(conf.default_level, conf.debug))
                               .with_targets(conf.module_levels.clone());

    Ok(tracing_subscriber::registry()
            .with(filter)
            .with(layers)
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn debug_lowers_thresholds() {
        assert_eq!(effective(LogLevel::Warn, true), LogLevel::Debug);
        assert_eq!(effective(LogLevel::Trace, true), LogLevel::Trace);
        assert_eq!(effective(LogLevel::Warn, false), LogLevel::Warn);
    }

    #[test]
    fn stamp_names_the_role() {
        let mut out = String::new();
        RoleStamp::from(ProcessRole::Supervisor).format_time(&mut Writer::new(&mut out)).unwrap();
        assert!(out.ends_with(" [supervisor]"), "{}", out);

        let mut out = String::new();
        RoleStamp::from(ProcessRole::Child(2)).format_time(&mut Writer::new(&mut out)).unwrap();
        assert!(out.ends_with(&format!(" [child 2 pid {}]", std::process::id())), "{}", out);
    }

    #[test]
    fn file_sink_records_role_and_debug() {
        let dir = std::env::temp_dir().join(format!("blackhole-log-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let conf = LoggingConfig {
            dir: dir.clone(),
            debug: true,
            sinks: vec![LogSink { output: LogOutput::File(PathBuf::from("test.log")), modules: Vec::new(), level: Some(LogLevel::Info) }],
            ..Default::default()
        };
        let subscriber = build_subscriber(conf, ProcessRole::Child(4)).unwrap();

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("shown only with debug");
            tracing::trace!("never shown");
        });

        let mut contents = String::new();
        for entry in std::fs::read_dir(&dir).unwrap() {
            contents += &std::fs::read_to_string(entry.unwrap().path()).unwrap();
        }
        assert!(contents.contains("[child 4 pid"), "{}", contents);
        assert!(contents.contains("shown only with debug"));
        assert!(!contents.contains("never shown"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
