//! `HELP`.

use crate::{
    command::{Verb, HELP_VERBS},
    AuthMechanism,
    Flow,
    Reply,
    SmtpConnection,
};

use tokio::io::{AsyncRead, AsyncWrite};
use std::io;

fn supported_commands() -> String
{
    let names: Vec<&str> = HELP_VERBS.iter().map(|v| v.name()).collect();
    format!("Supported commands: {}", names.join(" "))
}

/// Usage text for a verb.
pub(crate) fn syntax(verb: Verb) -> String
{
    match verb
    {
        Verb::Helo | Verb::Ehlo => format!("Syntax: {} domain.tld", verb.name()),
        Verb::Mail => "Syntax: MAIL FROM: <address>".to_string(),
        Verb::Rcpt => "Syntax: RCPT TO: <address>".to_string(),
        Verb::Vrfy => "Syntax: VRFY <address>".to_string(),
        Verb::Expn => "Syntax: EXPN <list1 | list2 | list3 | all>".to_string(),
        Verb::Auth => format!("Syntax: AUTH {}", AuthMechanism::list()),
        _ => format!("Syntax: {}", verb.name()),
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpConnection<S>
{
    pub(crate) async fn do_help(&mut self, args: &str) -> io::Result<Flow>
    {
        let topic = args.split_whitespace().next();

        let reply = match topic
        {
            None => Reply::new(250, supported_commands()),
            Some(word) => match Verb::parse(word)
            {
                Some(verb) if HELP_VERBS.contains(&verb) => Reply::new(250, syntax(verb)),
                _ => Reply::new(501, supported_commands()),
            },
        };
        self.ok(reply).await
    }
}
