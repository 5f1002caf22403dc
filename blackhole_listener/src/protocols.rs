use crate::ListenerError;
use blackhole_smtp::ListenerFlags;

use serde::{Serialize,Deserialize};
use std::{
    fmt,
    fs::File,
    io::BufReader,
    net::SocketAddr,
    os::unix::io::RawFd,
    path::PathBuf,
};

#[derive(Clone,Copy,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub enum ConnectionType
{
    Clear,
    Tls
}

/// Everything needed to create, and later serve, one listening socket.
#[derive(Clone,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub struct ListenerSpec
{
    pub address: SocketAddr,
    pub conn_type: ConnectionType,
    #[serde(default)]
    pub flags: ListenerFlags,
}

impl fmt::Display for ListenerSpec
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self.conn_type
        {
            ConnectionType::Clear => write!(f, "{}", self.address),
            ConnectionType::Tls => write!(f, "{} (tls)", self.address),
        }
    }
}

/// A bound socket as passed to a child process: an inherited FD number plus
/// the spec it was created from.
#[derive(Clone,Debug,Serialize,Deserialize)]
pub struct SavedListener
{
    pub fd: RawFd,
    pub spec: ListenerSpec,
}

/// Locations of the PEM files for TLS listeners.
#[derive(Clone,Debug,Serialize,Deserialize)]
pub struct TlsConfig
{
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// The certificate chain and private key, DER encoded, required to create a
/// TLS listener.
#[derive(Clone,Debug,Serialize,Deserialize)]
pub struct TlsSettings
{
    pub cert_chain: Vec<Vec<u8>>,
    pub key: Vec<u8>,
}

impl TlsConfig
{
    pub fn load_from_disk(&self) -> Result<TlsSettings, ListenerError>
    {
        let cert_file = File::open(&self.cert_file)?;
        let mut cert_reader = BufReader::new(cert_file);
        let cert_chain = rustls_pemfile::certs(&mut cert_reader)?;

        if cert_chain.is_empty()
        {
            return Err(ListenerError::BadTlsConfig(format!("No certificates in {}", self.cert_file.display())));
        }

        let key_file = File::open(&self.key_file)?;
        let mut key_reader = BufReader::new(key_file);

        use rustls_pemfile::Item;

        loop
        {
            match rustls_pemfile::read_one(&mut key_reader)?
            {
                Some(Item::RSAKey(key)) | Some(Item::PKCS8Key(key)) => return Ok(TlsSettings { cert_chain, key }),
                Some(_) => continue,
                None => return Err(ListenerError::BadTlsConfig(format!("No private key in {}", self.key_file.display()))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blackhole_smtp::{DelaySpec, Mode};

    #[test]
    fn spec_from_json() {
        let spec: ListenerSpec = serde_json::from_str(
            r#"{ "address": "[::1]:2525", "conn_type": "Clear", "flags": { "mode": "random", "delay": "5-10" } }"#
        ).unwrap();

        assert_eq!(spec.address, "[::1]:2525".parse().unwrap());
        assert_eq!(spec.flags.mode, Some(Mode::Random));
        assert_eq!(spec.flags.delay, Some(DelaySpec::Range(5, 10)));
        assert_eq!(spec.to_string(), "[::1]:2525");
    }

    #[test]
    fn missing_pem_files() {
        let config = TlsConfig { cert_file: "/nonexistent/cert.pem".into(), key_file: "/nonexistent/key.pem".into() };
        assert!(matches!(config.load_from_disk(), Err(ListenerError::IoError(_))));
    }
}
