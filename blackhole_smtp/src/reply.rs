use std::fmt;

/// A single SMTP reply, possibly spanning several lines.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct Reply
{
    code: u16,
    lines: Vec<String>,
}

impl Reply
{
    pub fn new(code: u16, text: impl Into<String>) -> Self
    {
        Self { code, lines: vec![text.into()] }
    }

    /// A reply with one line per entry. Every line but the last is sent with
    /// a `-` continuation marker.
    pub fn multiline(code: u16, lines: Vec<String>) -> Self
    {
        if lines.is_empty()
        {
            return Self::new(code, "");
        }
        Self { code, lines }
    }

    pub fn code(&self) -> u16
    {
        self.code
    }

    pub fn to_wire(&self) -> String
    {
        self.to_string()
    }
}

impl fmt::Display for Reply
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let last = self.lines.len() - 1;
        for (i, line) in self.lines.iter().enumerate()
        {
            let separator = if i == last { ' ' } else { '-' };
            write!(f, "{}{}{}\r\n", self.code, separator, line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line() {
        assert_eq!(Reply::new(250, "OK").to_wire(), "250 OK\r\n");
        assert_eq!(Reply::new(334, " ").to_wire(), "334  \r\n");
    }

    #[test]
    fn continuation_markers() {
        let reply = Reply::multiline(250, vec!["first".into(), "second".into(), String::new()]);
        assert_eq!(reply.to_wire(), "250-first\r\n250-second\r\n250 \r\n");
    }
}
