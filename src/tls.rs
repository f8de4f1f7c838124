//! TLS configuration shared by the WSS chat listener and the HTTPS front
//!
//! Certificates are read once at startup from the configured PEM file pair;
//! rotation/reload is not a feature.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use crate::error::{ChatError, Result};

/// Build a rustls server config from a PEM certificate chain and key
pub fn load_tls_config(cert_path: &str, key_path: &str) -> Result<Arc<rustls::ServerConfig>> {
    let cert_file = File::open(cert_path)
        .map_err(|e| ChatError::config(format!("Cannot open certificate {}: {}", cert_path, e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| ChatError::config(format!("Invalid certificate {}: {}", cert_path, e)))?;
    if certs.is_empty() {
        return Err(ChatError::config(format!(
            "No certificates found in {}",
            cert_path
        )));
    }

    let key_file = File::open(key_path)
        .map_err(|e| ChatError::config(format!("Cannot open private key {}: {}", key_path, e)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| ChatError::config(format!("Invalid private key {}: {}", key_path, e)))?
        .ok_or_else(|| ChatError::config(format!("No private key found in {}", key_path)))?;

    // The provider is named explicitly: the upstream HTTP client pulls in
    // its own rustls backend, so relying on a process default would be
    // ambiguous.
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_self_signed_pair() {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let dir = std::env::temp_dir().join(format!("cherry-tls-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        File::create(&cert_path)
            .unwrap()
            .write_all(cert.pem().as_bytes())
            .unwrap();
        File::create(&key_path)
            .unwrap()
            .write_all(key_pair.serialize_pem().as_bytes())
            .unwrap();

        let config = load_tls_config(cert_path.to_str().unwrap(), key_path.to_str().unwrap());
        assert!(config.is_ok());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_files_are_config_errors() {
        let result = load_tls_config("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(result, Err(ChatError::Config(_))));
    }
}
