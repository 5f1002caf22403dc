//! Command verbs and line splitting.

/// Every verb the server recognises.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum Verb
{
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Vrfy,
    Expn,
    Etrn,
    Quit,
    StartTls,
    Help,
    Auth,
}

/// Verbs listed by `HELP`, in the order they are listed.
pub const HELP_VERBS: [Verb; 13] = [
    Verb::Auth,
    Verb::Data,
    Verb::Ehlo,
    Verb::Etrn,
    Verb::Expn,
    Verb::Helo,
    Verb::Mail,
    Verb::Noop,
    Verb::Quit,
    Verb::Rcpt,
    Verb::Rset,
    Verb::StartTls,
    Verb::Vrfy,
];

impl Verb
{
    /// Look up a verb, ignoring case.
    pub fn parse(word: &str) -> Option<Self>
    {
        let verb = match word.to_ascii_uppercase().as_str()
        {
            "HELO" => Verb::Helo,
            "EHLO" => Verb::Ehlo,
            "MAIL" => Verb::Mail,
            "RCPT" => Verb::Rcpt,
            "DATA" => Verb::Data,
            "RSET" => Verb::Rset,
            "NOOP" => Verb::Noop,
            "VRFY" => Verb::Vrfy,
            "EXPN" => Verb::Expn,
            "ETRN" => Verb::Etrn,
            "QUIT" => Verb::Quit,
            "STARTTLS" => Verb::StartTls,
            "HELP" => Verb::Help,
            "AUTH" => Verb::Auth,
            _ => return None
        };
        Some(verb)
    }

    pub fn name(&self) -> &'static str
    {
        match self
        {
            Verb::Helo => "HELO",
            Verb::Ehlo => "EHLO",
            Verb::Mail => "MAIL",
            Verb::Rcpt => "RCPT",
            Verb::Data => "DATA",
            Verb::Rset => "RSET",
            Verb::Noop => "NOOP",
            Verb::Vrfy => "VRFY",
            Verb::Expn => "EXPN",
            Verb::Etrn => "ETRN",
            Verb::Quit => "QUIT",
            Verb::StartTls => "STARTTLS",
            Verb::Help => "HELP",
            Verb::Auth => "AUTH",
        }
    }
}

/// Split a command line into its first word and the (trimmed) remainder.
/// Returns `None` for a blank line.
pub fn split_line(line: &str) -> Option<(&str, &str)>
{
    let line = line.trim();
    if line.is_empty()
    {
        return None;
    }

    match line.split_once(char::is_whitespace)
    {
        Some((word, rest)) => Some((word, rest.trim_start())),
        None => Some((line, "")),
    }
}
