//! Response mode and delay, and how each is resolved for a message.
//!
//! Both can be set in three places. In order of precedence: a flag on the
//! listener the client connected to, an `X-Blackhole-*` header sent earlier on
//! the same connection, and the global configuration.

use crate::{Reply, SmtpConnection, SmtpSettings};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    str::FromStr,
};
use thiserror::Error;

/// Upper bound, in seconds, on any delay before replying to a message.
pub const MAX_DELAY: u64 = 60;

/// How to answer a completed message. Parsed case-insensitively, from
/// configuration as well as headers.
#[derive(Clone,Copy,Debug,PartialEq,Eq,Serialize,Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Mode
{
    Accept,
    Bounce,
    Random,
}

#[derive(Debug,Error)]
#[error("'{0}' is not a valid mode; expected accept, bounce or random")]
pub struct InvalidMode(String);

impl FromStr for Mode
{
    type Err = InvalidMode;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.trim().to_ascii_lowercase().as_str()
        {
            "accept" => Ok(Mode::Accept),
            "bounce" => Ok(Mode::Bounce),
            "random" => Ok(Mode::Random),
            _ => Err(InvalidMode(s.to_string()))
        }
    }
}

impl TryFrom<String> for Mode
{
    type Error = InvalidMode;

    fn try_from(value: String) -> Result<Self, Self::Error>
    {
        value.parse()
    }
}

impl From<Mode> for String
{
    fn from(mode: Mode) -> Self
    {
        mode.to_string()
    }
}

impl fmt::Display for Mode
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(match self {
            Mode::Accept => "accept",
            Mode::Bounce => "bounce",
            Mode::Random => "random",
        })
    }
}

#[derive(Debug,Error,PartialEq,Eq)]
pub enum InvalidDelay
{
    #[error("'{0}' is not a delay in seconds or a min-max range")]
    Syntax(String),
    #[error("delay of {0} seconds exceeds the maximum of {}", MAX_DELAY)]
    TooLong(u64),
    #[error("delay range {0}-{1} has its minimum above its maximum")]
    Inverted(u64, u64),
}

/// A delay in whole seconds, either fixed or drawn from an inclusive range.
#[derive(Clone,Copy,Debug,PartialEq,Eq,Serialize,Deserialize)]
#[serde(try_from = "DelayValue", into = "DelayValue")]
pub enum DelaySpec
{
    Fixed(u64),
    Range(u64, u64),
}

/// Configuration files may give a delay as a bare integer or as a string.
#[derive(Serialize,Deserialize)]
#[serde(untagged)]
enum DelayValue
{
    Seconds(u64),
    Text(String),
}

impl TryFrom<DelayValue> for DelaySpec
{
    type Error = InvalidDelay;

    fn try_from(value: DelayValue) -> Result<Self, Self::Error>
    {
        match value
        {
            DelayValue::Seconds(secs) => DelaySpec::Fixed(secs).validated(),
            DelayValue::Text(text) => text.parse(),
        }
    }
}

impl From<DelaySpec> for DelayValue
{
    fn from(spec: DelaySpec) -> Self
    {
        match spec
        {
            DelaySpec::Fixed(secs) => DelayValue::Seconds(secs),
            DelaySpec::Range(min, max) => DelayValue::Text(format!("{}-{}", min, max)),
        }
    }
}

/// Strict parsing used for configuration values and listener flags: `"5"` or
/// `"5-10"`, nothing above [`MAX_DELAY`].
impl FromStr for DelaySpec
{
    type Err = InvalidDelay;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        let syntax = || InvalidDelay::Syntax(s.to_string());
        let number = |part: &str| part.trim().parse::<u64>().map_err(|_| syntax());

        let spec = match s.split_once('-')
        {
            Some((min, max)) => DelaySpec::Range(number(min)?, number(max)?),
            None => DelaySpec::Fixed(number(s)?),
        };
        spec.validated()
    }
}

impl DelaySpec
{
    fn validated(self) -> Result<Self, InvalidDelay>
    {
        match self
        {
            DelaySpec::Fixed(secs) if secs > MAX_DELAY => Err(InvalidDelay::TooLong(secs)),
            DelaySpec::Range(_, max) if max > MAX_DELAY => Err(InvalidDelay::TooLong(max)),
            DelaySpec::Range(min, max) if min > max => Err(InvalidDelay::Inverted(min, max)),
            spec => Ok(spec)
        }
    }

    /// Lenient parsing of an `X-Blackhole-Delay` header value: `n` or
    /// `min, max`.
    ///
    /// Values above [`MAX_DELAY`] are clamped to it. Anything negative,
    /// unparsable or with `min > max` yields `None`, meaning no delay.
    pub fn from_header(value: &str) -> Option<Self>
    {
        let parts: Vec<i64> = value.split(',')
                                   .map(|part| part.trim().parse::<i64>())
                                   .collect::<Result<_, _>>()
                                   .ok()?;
        let cap = MAX_DELAY as i64;

        match parts.as_slice()
        {
            [secs] if *secs >= 0 => Some(DelaySpec::Fixed((*secs).min(cap) as u64)),
            [min, max] if *min >= 0 && *max >= 0 && min <= max =>
            {
                let max = (*max).min(cap);
                let min = (*min).min(max);
                Some(DelaySpec::Range(min as u64, max as u64))
            }
            _ => None
        }
    }

    /// Pick a concrete delay, in seconds.
    pub fn sample(&self) -> u64
    {
        match *self
        {
            DelaySpec::Fixed(secs) => secs,
            DelaySpec::Range(min, max) => rand::thread_rng().gen_range(min..=max),
        }
    }
}

/// Per-listener overrides. A listener carrying either flag disables header
/// switching for its connections.
#[derive(Clone,Copy,Debug,Default,PartialEq,Eq,Serialize,Deserialize)]
pub struct ListenerFlags
{
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub delay: Option<DelaySpec>,
}

impl ListenerFlags
{
    pub fn allows_dynamic_switch(&self) -> bool
    {
        self.mode.is_none() && self.delay.is_none()
    }
}

/// Overrides set by headers on one connection. They persist across messages
/// until replaced.
#[derive(Clone,Copy,Debug,Default,PartialEq,Eq)]
pub struct Switches
{
    mode: Option<Mode>,
    delay: Option<u64>,
}

impl Switches
{
    /// Apply a header line if it is a switch header. Returns whether it was.
    ///
    /// An invalid value clears the corresponding override.
    pub fn apply_header(&mut self, line: &str) -> bool
    {
        let Some((name, value)) = line.split_once(':') else { return false };

        match name.trim().to_ascii_lowercase().as_str()
        {
            "x-blackhole-mode" =>
            {
                self.mode = value.parse().ok();
                true
            }
            "x-blackhole-delay" =>
            {
                self.delay = DelaySpec::from_header(value).map(|spec| spec.sample());
                true
            }
            _ => false
        }
    }

    pub fn mode(&self, flags: &ListenerFlags, settings: &SmtpSettings) -> Mode
    {
        flags.mode.or(self.mode).unwrap_or(settings.mode)
    }

    /// The delay in seconds to apply before the next reply to a message.
    /// Listener flag ranges are sampled afresh on each call.
    pub fn delay(&self, flags: &ListenerFlags, settings: &SmtpSettings) -> u64
    {
        if let Some(spec) = flags.delay
        {
            return spec.sample();
        }
        if let Some(secs) = self.delay
        {
            return secs;
        }
        settings.delay.map(|spec| spec.sample()).unwrap_or(0)
    }
}

/// Replies used when bouncing a message, as (code, text).
pub const BOUNCES: [(u16, &str); 10] = [
    (450, "Requested mail action not taken: mailbox unavailable"),
    (451, "Requested action aborted: local error in processing"),
    (452, "Requested action not taken: insufficient system storage"),
    (458, "Unable to queue message"),
    (521, "Machine does not accept mail"),
    (550, "Requested action not taken: mailbox unavailable"),
    (551, "User not local"),
    (552, "Requested mail action aborted: exceeded storage allocation"),
    (553, "Requested action not taken: mailbox name not allowed"),
    (571, "Blocked"),
];

fn bounce(index: usize) -> Reply
{
    let (code, text) = BOUNCES[index];
    Reply::new(code, text)
}

/// The reply for a message under the given mode.
pub fn reply_for_mode(mode: Mode, message_id: &str) -> Reply
{
    let accept = || Reply::new(250, format!("2.0.0 OK: queued as {}", message_id));
    let mut rng = rand::thread_rng();

    match mode
    {
        Mode::Accept => accept(),
        Mode::Bounce => bounce(rng.gen_range(0..BOUNCES.len())),
        Mode::Random =>
        {
            let pick = rng.gen_range(0..=BOUNCES.len());
            if pick == BOUNCES.len() { accept() } else { bounce(pick) }
        }
    }
}

impl<S> SmtpConnection<S>
{
    /// Apply `line` as a switch header if switching is allowed on this
    /// connection.
    pub(crate) fn process_header(&mut self, line: &str)
    {
        if !self.settings.dynamic_switch || !self.flags.allows_dynamic_switch()
        {
            return;
        }
        if self.switches.apply_header(line)
        {
            tracing::debug!(header = line, switches = ?self.switches, "Applied switch header");
        }
    }

    pub(crate) fn current_mode(&self) -> Mode
    {
        self.switches.mode(&self.flags, &self.settings)
    }

    pub(crate) fn current_delay(&self) -> u64
    {
        self.switches.delay(&self.flags, &self.settings)
    }
}
