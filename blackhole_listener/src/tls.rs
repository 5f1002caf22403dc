use crate::{ListenerError, TlsSettings};

use rustls::{Certificate, PrivateKey, ServerConfig};
use std::sync::Arc;

/// Build the rustls configuration shared by every TLS listener in a process.
/// Client certificates are not requested.
pub fn build_tls_config(settings: &TlsSettings) -> Result<Arc<ServerConfig>, ListenerError>
{
    let key = PrivateKey(settings.key.clone());
    let certs: Vec<Certificate> = settings.cert_chain
                                          .iter()
                                          .cloned()
                                          .map(Certificate)
                                          .collect();

    let mut config = ServerConfig::builder()
                        .with_safe_defaults()
                        .with_no_client_auth()
                        .with_single_cert(certs, key)?;
    config.ignore_client_order = true;

    Ok(Arc::new(config))
}
