//! The blackhole process tree.
//!
//! A [`Supervisor`] binds every listening socket and starts a [`Worker`]
//! per configured child. Each worker re-executes the binary in child mode,
//! handing it the sockets, and keeps a [`Child`] alive via a heartbeat on a
//! pair of pipes, replacing it whenever it stops answering.

pub mod config;
pub mod privileges;

mod tracing_config;
pub use tracing_config::{build_subscriber, ProcessRole};

mod worker;
pub use worker::*;

mod child;
pub use child::*;

mod supervisor;
pub use supervisor::*;

pub mod run;
