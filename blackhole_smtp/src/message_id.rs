use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a message id of the form `<hundredths.pid.nonce@fqdn>`.
pub fn new_message_id(fqdn: &str) -> String
{
    let hundredths = SystemTime::now().duration_since(UNIX_EPOCH)
                                      .map(|elapsed| elapsed.as_millis() / 10)
                                      .unwrap_or_default();
    let nonce: u64 = rand::random();

    format!("<{}.{}.{}@{}>", hundredths, std::process::id(), nonce, fqdn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape() {
        let id = new_message_id("mx.example.org");
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@mx.example.org>"));

        let local = id.trim_start_matches('<').split('@').next().unwrap();
        let fields: Vec<&str> = local.split('.').collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[1], std::process::id().to_string());
        assert!(fields.iter().all(|f| f.chars().all(|c| c.is_ascii_digit())));
    }

    #[test]
    fn unique() {
        assert_ne!(new_message_id("a"), new_message_id("a"));
    }
}
