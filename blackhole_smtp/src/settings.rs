use crate::{DelaySpec, Mode};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings shared read-only by every connection in a process.
#[derive(Clone,Debug,Serialize,Deserialize)]
pub struct SmtpSettings
{
    /// Name announced in the greeting, EHLO response and message ids
    pub fqdn: String,
    /// Version string announced in the greeting
    pub version: String,
    /// Idle timeout for client reads, in seconds
    pub timeout: u64,
    pub max_message_size: usize,
    /// Whether `X-Blackhole-*` headers may change the mode or delay
    pub dynamic_switch: bool,
    pub mode: Mode,
    pub delay: Option<DelaySpec>,
}

impl SmtpSettings
{
    pub fn idle_timeout(&self) -> Duration
    {
        Duration::from_secs(self.timeout)
    }

    pub fn banner(&self) -> String
    {
        format!("{} ESMTP/{}", self.fqdn, self.version)
    }
}

impl Default for SmtpSettings
{
    fn default() -> Self
    {
        Self {
            fqdn: "localhost".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timeout: 60,
            max_message_size: 512000,
            dynamic_switch: true,
            mode: Mode::Accept,
            delay: None,
        }
    }
}
