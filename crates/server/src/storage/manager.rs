//! Certificate loading on top of the blob store.
//!
//! Certificates are stored as PEM. A bundle blob holds the private key
//! followed by the certificate chain (the layout ACME issuance writes);
//! operator-managed certificates may instead keep the key in a separate
//! blob, as declared in the managed domain table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use ssl_cert_config::ManagedDomains;
use tracing::{debug, info};
use x509_parser::extensions::GeneralName;

use super::BlobStore;
use crate::error::StorageError;

/// A decoded certificate ready to be presented in a handshake
#[derive(Debug, Clone)]
pub struct LoadedCertificate {
    /// Chain and signing key
    pub certified_key: Arc<CertifiedKey>,
    /// Expiry of the leaf certificate
    pub not_after: DateTime<Utc>,
    /// DNS names from the leaf's subject alternative names
    pub dns_names: Vec<String>,
}

/// Source of decoded certificates, keyed by certificate key
#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn load_certificate_from_store(
        &self,
        cert_key: &str,
    ) -> Result<LoadedCertificate, StorageError>;
}

/// Loads and persists certificates through a [`BlobStore`]
pub struct StorageManager {
    store: Arc<dyn BlobStore>,
    /// Certificate key -> separate private key blob
    key_blobs: HashMap<String, String>,
}

impl StorageManager {
    /// Create a manager over `store`, learning separate key blobs from `managed`
    pub fn new(store: Arc<dyn BlobStore>, managed: &ManagedDomains) -> Self {
        let key_blobs = managed
            .iter()
            .filter(|m| m.priv_key() != m.cert_key())
            .map(|m| (m.cert_key().to_string(), m.priv_key().to_string()))
            .collect();

        Self { store, key_blobs }
    }

    /// Underlying blob store
    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Persist a certificate as a single key-then-chain bundle
    pub async fn store_certificate(
        &self,
        cert_key: &str,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<(), StorageError> {
        let mut bundle = String::with_capacity(key_pem.len() + cert_pem.len() + 1);
        bundle.push_str(key_pem);
        if !key_pem.ends_with('\n') {
            bundle.push('\n');
        }
        bundle.push_str(cert_pem);

        self.store.put(cert_key, bundle.as_bytes()).await?;
        info!(cert_key = %cert_key, "Saved certificate to storage");
        Ok(())
    }

    /// Remove a stored certificate and its separate key blob, if any
    pub async fn delete_certificate(&self, cert_key: &str) -> Result<(), StorageError> {
        self.store.delete(cert_key).await?;
        if let Some(key_blob) = self.key_blobs.get(cert_key) {
            self.store.delete(key_blob).await?;
        }
        info!(cert_key = %cert_key, "Deleted certificate from storage");
        Ok(())
    }
}

#[async_trait]
impl CertificateStore for StorageManager {
    async fn load_certificate_from_store(
        &self,
        cert_key: &str,
    ) -> Result<LoadedCertificate, StorageError> {
        let cert_pem = self.store.get(cert_key).await?;
        let loaded = match self.key_blobs.get(cert_key) {
            Some(key_blob) => {
                let key_pem = self.store.get(key_blob).await?;
                parse_certificate(cert_key, &cert_pem, &key_pem)?
            }
            None => parse_certificate(cert_key, &cert_pem, &cert_pem)?,
        };

        debug!(
            cert_key = %cert_key,
            expires = %loaded.not_after,
            chain_len = loaded.certified_key.cert.len(),
            "Loaded certificate from storage"
        );
        Ok(loaded)
    }
}

impl fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageManager")
            .field("backend", &self.store.backend())
            .field("key_blobs", &self.key_blobs.len())
            .finish()
    }
}

/// Decode a PEM chain and private key into a servable certificate
pub fn parse_certificate(
    cert_key: &str,
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<LoadedCertificate, StorageError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::invalid_certificate(cert_key, format!("bad PEM: {}", e)))?;

    if certs.is_empty() {
        return Err(StorageError::invalid_certificate(
            cert_key,
            "no certificates found",
        ));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| StorageError::invalid_certificate(cert_key, format!("bad PEM: {}", e)))?
        .ok_or_else(|| StorageError::invalid_certificate(cert_key, "no private key found"))?;

    let (not_after, dns_names) = {
        let (_, leaf) = x509_parser::parse_x509_certificate(certs[0].as_ref()).map_err(|e| {
            StorageError::invalid_certificate(cert_key, format!("invalid X509 certificate: {}", e))
        })?;

        let timestamp = leaf.validity().not_after.timestamp();
        let not_after = DateTime::<Utc>::from_timestamp(timestamp, 0).ok_or_else(|| {
            StorageError::invalid_certificate(cert_key, "expiry out of range")
        })?;

        let dns_names = match leaf.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        (not_after, dns_names)
    };

    let provider = CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    let signing_key = provider.key_provider.load_private_key(key).map_err(|e| {
        StorageError::invalid_certificate(cert_key, format!("unusable private key: {}", e))
    })?;

    Ok(LoadedCertificate {
        certified_key: Arc::new(CertifiedKey::new(certs, signing_key)),
        not_after,
        dns_names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DirCache;
    use crate::test_support::self_signed_pem;
    use ssl_cert_config::ManagedConfig;
    use tempfile::TempDir;

    fn setup(managed: &[ManagedConfig]) -> (TempDir, StorageManager) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(DirCache::new(temp_dir.path()).unwrap());
        let table = ManagedDomains::from_config(managed).unwrap();
        (temp_dir, StorageManager::new(store, &table))
    }

    #[test]
    fn test_parse_certificate() {
        let (cert_pem, key_pem) = self_signed_pem("parse.example.com");

        let loaded = parse_certificate("parse", cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();

        assert_eq!(loaded.certified_key.cert.len(), 1);
        assert_eq!(loaded.dns_names, vec!["parse.example.com".to_string()]);
        assert!(loaded.not_after > Utc::now());
    }

    #[test]
    fn test_parse_rejects_missing_material() {
        let (cert_pem, key_pem) = self_signed_pem("missing.example.com");

        let err = parse_certificate("k", b"", key_pem.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("no certificates found"));

        let err = parse_certificate("k", cert_pem.as_bytes(), cert_pem.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("no private key found"));
    }

    #[tokio::test]
    async fn test_bundle_round_trip() {
        let (_temp_dir, manager) = setup(&[]);
        let (cert_pem, key_pem) = self_signed_pem("bundle.example.com");

        manager
            .store_certificate("bundle.example.com", &cert_pem, &key_pem)
            .await
            .unwrap();

        let loaded = manager
            .load_certificate_from_store("bundle.example.com")
            .await
            .unwrap();
        assert_eq!(loaded.dns_names, vec!["bundle.example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_separate_key_blob() {
        let (_temp_dir, manager) = setup(&[ManagedConfig {
            pattern: r"^www\.example\.com$".to_string(),
            cert: "www.cert".to_string(),
            priv_key: "www.key".to_string(),
        }]);
        let (cert_pem, key_pem) = self_signed_pem("www.example.com");

        let store = manager.blob_store();
        store.put("www.cert", cert_pem.as_bytes()).await.unwrap();
        store.put("www.key", key_pem.as_bytes()).await.unwrap();

        let loaded = manager.load_certificate_from_store("www.cert").await.unwrap();
        assert_eq!(loaded.certified_key.cert.len(), 1);

        manager.delete_certificate("www.cert").await.unwrap();
        assert!(store.get("www.key").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_missing_certificate_is_not_found() {
        let (_temp_dir, manager) = setup(&[]);

        let err = manager
            .load_certificate_from_store("absent.example.com")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
