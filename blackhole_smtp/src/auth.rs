//! `AUTH`. Any credentials are accepted unless the client's payload contains
//! `fail=`.

use crate::{Flow, Reply, SmtpConnection};

use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::io::{AsyncRead, AsyncWrite};
use std::io;

#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum AuthMechanism
{
    CramMd5,
    Login,
    Plain,
}

impl AuthMechanism
{
    /// Advertised mechanisms, in the order they are advertised.
    pub const ALL: [AuthMechanism; 3] = [AuthMechanism::CramMd5, AuthMechanism::Login, AuthMechanism::Plain];

    pub fn name(&self) -> &'static str
    {
        match self
        {
            AuthMechanism::CramMd5 => "CRAM-MD5",
            AuthMechanism::Login => "LOGIN",
            AuthMechanism::Plain => "PLAIN",
        }
    }

    pub fn parse(name: &str) -> Option<Self>
    {
        Self::ALL.into_iter().find(|m| m.name().eq_ignore_ascii_case(name))
    }

    /// Mechanism names separated by spaces.
    pub fn list() -> String
    {
        Self::ALL.map(|m| m.name()).join(" ")
    }
}

fn verdict(payload: &str) -> Reply
{
    if payload.to_ascii_lowercase().contains("fail=")
    {
        Reply::new(535, "5.7.8 Authentication failed")
    }
    else
    {
        Reply::new(235, "2.7.0 Authentication successful")
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpConnection<S>
{
    pub(crate) async fn do_auth(&mut self, args: &str) -> io::Result<Flow>
    {
        let (name, initial) = args.split_once(char::is_whitespace)
                                  .map(|(name, rest)| (name, rest.trim()))
                                  .unwrap_or((args, ""));

        let challenge = match AuthMechanism::parse(name)
        {
            None => return self.ok(Reply::new(501, "5.5.4 Syntax: AUTH mechanism")).await,
            Some(AuthMechanism::Plain) if !initial.is_empty() => return self.ok(verdict(initial)).await,
            Some(AuthMechanism::Plain) => " ".to_string(),
            Some(AuthMechanism::Login) => "VXNlcm5hbWU6".to_string(),
            Some(AuthMechanism::CramMd5) => STANDARD.encode(self.message_id.as_bytes()),
        };

        self.push(Reply::new(334, challenge)).await?;

        match self.wait().await?
        {
            Some(response) =>
            {
                tracing::debug!(line = response.as_str(), "RECV");
                self.ok(verdict(&response)).await
            }
            None => Ok(Flow::Close),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mechanisms() {
        assert_eq!(AuthMechanism::list(), "CRAM-MD5 LOGIN PLAIN");
        assert_eq!(AuthMechanism::parse("cram-md5"), Some(AuthMechanism::CramMd5));
        assert_eq!(AuthMechanism::parse("XOAUTH2"), None);
        assert_eq!(AuthMechanism::parse(""), None);
    }

    #[test]
    fn verdicts() {
        assert_eq!(verdict("pass=letmein").code(), 235);
        assert_eq!(verdict("FAIL=letmein").code(), 535);
        assert_eq!(verdict("anything").code(), 235);
    }
}
