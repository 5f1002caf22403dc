use crate::{
    command::{self, Verb},
    new_message_id,
    reply_for_mode,
    AuthMechanism,
    ListenerFlags,
    Reply,
    SmtpSettings,
    Switches,
};

use tokio::{
    io::{
        AsyncBufReadExt,
        AsyncRead,
        AsyncReadExt,
        AsyncWrite,
        AsyncWriteExt,
        BufReader,
    },
    time::{sleep, timeout, Duration},
};
use std::{
    io,
    sync::Arc,
};
use tracing::debug;

/// Longest single read from the client. Longer lines arrive in pieces.
pub const LINE_LIMIT: usize = 64 * 1024;

/// Number of unrecognised commands tolerated before the client is dropped.
pub const MAX_UNKNOWN_COMMANDS: usize = 10;

/// Whether the connection should keep going after a handler returns.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum Flow
{
    Continue,
    Close,
}

/// One client session, from greeting to close.
pub struct SmtpConnection<S>
{
    pub(crate) stream: BufReader<S>,
    pub(crate) settings: Arc<SmtpSettings>,
    pub(crate) flags: ListenerFlags,
    pub(crate) switches: Switches,
    pub(crate) message_id: String,
    failed_commands: usize,
}

impl<S: AsyncRead> SmtpConnection<S>
{
    pub fn new(stream: S, settings: Arc<SmtpSettings>, flags: ListenerFlags) -> Self
    {
        let message_id = new_message_id(&settings.fqdn);
        Self {
            stream: BufReader::new(stream),
            settings,
            flags,
            switches: Switches::default(),
            message_id,
            failed_commands: 0,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpConnection<S>
{
    /// Serve the session until the client quits, times out, misbehaves or
    /// disconnects. I/O errors end the session and are only logged.
    pub async fn run(mut self)
    {
        if let Err(e) = self.serve().await
        {
            debug!("Connection error: {}", e);
        }
        let _ = self.stream.shutdown().await;
        debug!("Connection closed");
    }

    async fn serve(&mut self) -> io::Result<()>
    {
        self.push(Reply::new(220, self.settings.banner())).await?;

        while let Some(line) = self.wait().await?
        {
            debug!(line = line.as_str(), "RECV");

            if self.dispatch(&line).await? == Flow::Close
            {
                break;
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, line: &str) -> io::Result<Flow>
    {
        let Some((word, args)) = command::split_line(line) else {
            return self.do_unknown().await;
        };

        match Verb::parse(word)
        {
            Some(Verb::Helo) => self.ok(Reply::new(250, "OK")).await,
            Some(Verb::Ehlo) => self.do_ehlo().await,
            Some(Verb::Mail) => self.do_mail(args).await,
            Some(Verb::Rcpt) => self.ok(Reply::new(250, "2.1.5 OK")).await,
            Some(Verb::Data) => self.do_data().await,
            Some(Verb::Rset) =>
            {
                self.message_id = new_message_id(&self.settings.fqdn);
                self.ok(Reply::new(250, "2.0.0 OK")).await
            }
            Some(Verb::Noop) => self.ok(Reply::new(250, "2.0.0 OK")).await,
            Some(Verb::Vrfy) => self.do_vrfy(args).await,
            Some(Verb::Expn) => self.do_expn(args).await,
            Some(Verb::Etrn) => self.ok(Reply::new(250, "Queueing started")).await,
            Some(Verb::Quit) =>
            {
                self.push(Reply::new(221, "2.0.0 Goodbye")).await?;
                Ok(Flow::Close)
            }
            Some(Verb::StartTls) => self.ok(Reply::new(500, "Not implemented")).await,
            Some(Verb::Help) => self.do_help(args).await,
            Some(Verb::Auth) => self.do_auth(args).await,
            None => self.do_unknown().await,
        }
    }

    /// Write a reply to the client.
    pub(crate) async fn push(&mut self, reply: Reply) -> io::Result<()>
    {
        let wire = reply.to_wire();
        debug!(reply = wire.trim_end(), "SEND");

        self.stream.write_all(wire.as_bytes()).await?;
        self.stream.flush().await
    }

    pub(crate) async fn ok(&mut self, reply: Reply) -> io::Result<Flow>
    {
        self.push(reply).await?;
        Ok(Flow::Continue)
    }

    /// Read one line from the client, with its line ending removed.
    ///
    /// `None` means the session is over: the client disconnected, or was idle
    /// past the timeout and has been told so. A line over [`LINE_LIMIT`] is
    /// refused as a whole and the next line read instead.
    pub(crate) async fn wait(&mut self) -> io::Result<Option<String>>
    {
        loop
        {
            let Some(piece) = self.read_piece().await? else { return Ok(None) };

            if piece.len() < LINE_LIMIT || piece.ends_with(b"\n")
            {
                let line = String::from_utf8_lossy(&piece).trim_end_matches(['\r', '\n']).to_string();
                return Ok(Some(line));
            }

            loop
            {
                let Some(rest) = self.read_piece().await? else { return Ok(None) };
                if rest.ends_with(b"\n")
                {
                    break;
                }
            }
            debug!("Line too long");
            self.push(Reply::new(500, "5.5.2 Line too long")).await?;
        }
    }

    /// Read up to one line, including its line ending. A line longer than
    /// [`LINE_LIMIT`] comes back in several pieces, of which only the last
    /// ends in `\n`.
    async fn read_piece(&mut self) -> io::Result<Option<Vec<u8>>>
    {
        let idle = self.settings.idle_timeout();
        let mut piece = Vec::new();

        let mut limited = (&mut self.stream).take(LINE_LIMIT as u64);
        let result = timeout(idle, limited.read_until(b'\n', &mut piece)).await;

        match result
        {
            Err(_) =>
            {
                debug!("Idle timeout");
                self.push(Reply::new(421, "Timeout")).await?;
                Ok(None)
            }
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(_)) => Ok(Some(piece)),
            Ok(Err(e)) => Err(e),
        }
    }

    async fn do_ehlo(&mut self) -> io::Result<Flow>
    {
        let mechanisms: Vec<&str> = AuthMechanism::ALL.iter().map(|m| m.name()).collect();
        let lines = vec![
            self.settings.fqdn.clone(),
            "HELP".to_string(),
            "PIPELINING".to_string(),
            format!("AUTH {}", mechanisms.join(" ")),
            format!("SIZE {}", self.settings.max_message_size),
            "VRFY".to_string(),
            "ETRN".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
            "8BITMIME".to_string(),
            "SMTPUTF8".to_string(),
            "EXPN".to_string(),
            "DSN".to_string(),
        ];
        self.ok(Reply::multiline(250, lines)).await
    }

    async fn do_mail(&mut self, args: &str) -> io::Result<Flow>
    {
        let max = self.settings.max_message_size;
        let oversized = args.split_whitespace()
                            .filter_map(|param| {
                                let (key, value) = param.split_once('=')?;
                                key.eq_ignore_ascii_case("size").then_some(value)
                            })
                            .any(|value| {
                                !value.is_empty()
                                    && value.bytes().all(|b| b.is_ascii_digit())
                                    && value.parse::<usize>().map_or(true, |size| size > max)
                            });

        if oversized
        {
            self.ok(size_exceeded()).await
        }
        else
        {
            self.ok(Reply::new(250, "2.1.0 OK")).await
        }
    }

    async fn do_vrfy(&mut self, args: &str) -> io::Result<Flow>
    {
        let lower = args.to_ascii_lowercase();
        let reply = if lower.contains("pass=")
        {
            Reply::new(250, format!("2.0.0 <{}> OK", args))
        }
        else if lower.contains("fail=")
        {
            Reply::new(550, format!("5.7.1 <{}> unknown", args))
        }
        else
        {
            Reply::new(252, "2.0.0 Will attempt delivery")
        };
        self.ok(reply).await
    }

    /// Capture a message, then delay and reply according to the resolved
    /// switches.
    async fn do_data(&mut self) -> io::Result<Flow>
    {
        self.push(Reply::new(354, "End data with <CR><LF>.<CR><LF>")).await?;

        let max = self.settings.max_message_size;
        let mut size = 0usize;
        let mut in_headers = true;
        let mut line_start = true;

        loop
        {
            let Some(piece) = self.read_piece().await? else { return Ok(Flow::Close) };

            if line_start && (piece == b".\r\n" || piece == b".\n" || piece == b".")
            {
                break;
            }

            size += piece.len();
            if size > max
            {
                debug!(size, max, "Message too large");
                self.push(size_exceeded()).await?;
                return Ok(Flow::Close);
            }

            if line_start && in_headers
            {
                if piece == b"\r\n" || piece == b"\n"
                {
                    in_headers = false;
                }
                else
                {
                    let line = String::from_utf8_lossy(&piece);
                    if line.trim_start().to_ascii_lowercase().starts_with("x-blackhole-")
                    {
                        self.process_header(line.trim_end_matches(['\r', '\n']));
                    }
                }
            }

            line_start = piece.ends_with(b"\n");
        }

        let delay = self.current_delay();
        if delay > 0
        {
            debug!(delay, "Delaying reply");
            sleep(Duration::from_secs(delay)).await;
        }

        let reply = reply_for_mode(self.current_mode(), &self.message_id);
        self.ok(reply).await
    }

    async fn do_unknown(&mut self) -> io::Result<Flow>
    {
        self.failed_commands += 1;

        if self.failed_commands > MAX_UNKNOWN_COMMANDS
        {
            self.push(Reply::new(502, "5.5.3 Too many unknown commands")).await?;
            return Ok(Flow::Close);
        }
        self.ok(Reply::new(502, "5.5.2 Command not recognised")).await
    }
}

fn size_exceeded() -> Reply
{
    Reply::new(552, "Message size exceeds fixed maximum message size")
}
