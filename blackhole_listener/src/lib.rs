//! Listening sockets and the servers that accept on them.
//!
//! The supervisor binds every configured address once, as a [`ListenerSet`].
//! The sockets are then inherited by each child process, which restores them
//! and runs one [`Server`] per socket. Every accepted client is handed to its
//! own [`blackhole_smtp::SmtpConnection`].

pub mod error;
pub use error::*;

mod protocols;
pub use protocols::*;

mod listener_set;
pub use listener_set::*;

mod tls;
pub use tls::*;

mod server;
pub use server::*;
