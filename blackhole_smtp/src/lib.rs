//! The blackhole SMTP engine.
//!
//! One [`SmtpConnection`] drives one client socket from the greeting to
//! close. Every message handed over in `DATA` is discarded; the reply the
//! client sees depends on the resolved [`Mode`], and its timing on the
//! resolved delay.

mod settings;
pub use settings::*;

mod switch;
pub use switch::*;

mod reply;
pub use reply::*;

pub mod command;

mod message_id;
pub use message_id::*;

mod connection;
pub use connection::*;

mod auth;
pub use auth::AuthMechanism;

mod help;
mod expn;
