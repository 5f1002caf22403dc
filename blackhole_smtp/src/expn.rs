//! `EXPN`, answered from a fixed set of made-up mailing lists.

use crate::{Flow, Reply, SmtpConnection};

use tokio::io::{AsyncRead, AsyncWrite};
use std::io;

const LISTS: [(&str, &[&str]); 3] = [
    ("list1", &["Shadow", "Wednesday", "Low-key Liesmith"]),
    ("list2", &["Jim Holden", "Naomi Nagata", "Alex Kamal", "Amos Burton"]),
    ("list3", &[
        "Takeshi Kovacs",
        "Laurens Bancroft",
        "Kristin Ortega",
        "Quellcrist Falconer",
        "Virginia Vidaura",
        "Reileen Kawahara",
    ]),
];

/// Members of the named list, or of every list for `all`.
fn members(list: &str) -> Option<Vec<&'static str>>
{
    if list == "all"
    {
        return Some(LISTS.iter().flat_map(|(_, names)| names.iter().copied()).collect());
    }
    LISTS.iter()
         .find(|(name, _)| *name == list)
         .map(|(_, names)| names.to_vec())
}

fn address(name: &str, fqdn: &str) -> String
{
    format!("{} <{}@{}>", name, name.to_lowercase().replace(' ', "."), fqdn)
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpConnection<S>
{
    pub(crate) async fn do_expn(&mut self, args: &str) -> io::Result<Flow>
    {
        let not_authorised = Reply::new(550, "Not authorised");

        if args.to_ascii_lowercase().contains("fail=")
        {
            return self.ok(not_authorised).await;
        }

        let mut words = args.split_whitespace();
        let (Some(list), None) = (words.next(), words.next()) else {
            return self.ok(not_authorised).await;
        };

        let list = list.to_ascii_lowercase().replace(['<', '>'], "");
        let Some(names) = members(&list) else {
            return self.ok(not_authorised).await;
        };

        let lines = names.iter().map(|name| address(name, &self.settings.fqdn)).collect();
        self.ok(Reply::multiline(250, lines)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists() {
        assert_eq!(members("list1"), Some(vec!["Shadow", "Wednesday", "Low-key Liesmith"]));
        assert_eq!(members("list4"), None);

        let all = members("all").unwrap();
        assert_eq!(all.len(), 13);
        assert_eq!(all.first(), Some(&"Shadow"));
        assert_eq!(all.last(), Some(&"Reileen Kawahara"));
    }

    #[test]
    fn addresses() {
        assert_eq!(address("Low-key Liesmith", "mx.example.org"), "Low-key Liesmith <low-key.liesmith@mx.example.org>");
    }
}
