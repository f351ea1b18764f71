use std::{
    collections::HashMap,
    fmt,
    io,
    sync::{Arc, RwLock},
};
use thiserror::Error;
use tokio_rustls::rustls::{
    crypto::aws_lc_rs,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};

#[derive(Debug, Error)]
pub enum SniError {
    #[error("failed to parse certificate chain: {0}")]
    Chain(io::Error),
    #[error("failed to parse private key: {0}")]
    PrivateKey(io::Error),
    #[error("no private key found in the key material")]
    PrivateKeyNotFound,
    #[error("unusable private key: {0}")]
    Signing(tokio_rustls::rustls::Error),
}

/// Certificate lookup for the STARTTLS handshake. The map is replaced
/// wholesale on every update (copy-on-write), so the handshake hot path
/// takes a read lock, clones an `Arc`, and proceeds without contention.
/// Lookups never touch the database.
pub struct SniResolver {
    certs: RwLock<Arc<HashMap<String, Arc<CertifiedKey>>>>,
    default_cert: RwLock<Option<Arc<CertifiedKey>>>,
}

impl SniResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            certs: RwLock::new(Arc::new(HashMap::new())),
            default_cert: RwLock::new(None),
        })
    }

    /// Builds a rustls `CertifiedKey` from PEM material.
    pub fn certified_key(key_pem: &str, chain_pem: &str) -> Result<CertifiedKey, SniError> {
        let chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut chain_pem.as_bytes())
                .collect::<Result<_, io::Error>>()
                .map_err(SniError::Chain)?;

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(SniError::PrivateKey)?
            .ok_or(SniError::PrivateKeyNotFound)?;

        let signing_key = aws_lc_rs::sign::any_supported_type(&key).map_err(SniError::Signing)?;

        Ok(CertifiedKey::new(chain, signing_key))
    }

    pub fn insert(&self, domain: &str, key: Arc<CertifiedKey>) {
        let mut guard = self.certs.write().expect("sni map poisoned");
        let mut next = HashMap::clone(&guard);
        next.insert(domain.trim_end_matches('.').to_lowercase(), key);
        *guard = Arc::new(next);
    }

    pub fn remove(&self, domain: &str) {
        let mut guard = self.certs.write().expect("sni map poisoned");
        let mut next = HashMap::clone(&guard);
        next.remove(&domain.trim_end_matches('.').to_lowercase());
        *guard = Arc::new(next);
    }

    pub fn set_default(&self, key: Arc<CertifiedKey>) {
        *self.default_cert.write().expect("sni default poisoned") = Some(key);
    }

    /// O(1), case-insensitive.
    pub fn lookup(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let map = self.certs.read().expect("sni map poisoned").clone();
        map.get(&server_name.trim_end_matches('.').to_lowercase())
            .cloned()
    }

    fn default(&self) -> Option<Arc<CertifiedKey>> {
        self.default_cert
            .read()
            .expect("sni default poisoned")
            .clone()
    }

    /// Whether STARTTLS can be advertised at all.
    pub fn has_any(&self) -> bool {
        self.default().is_some() || !self.certs.read().expect("sni map poisoned").is_empty()
    }

    pub fn loaded_domains(&self) -> usize {
        self.certs.read().expect("sni map poisoned").len()
    }
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver")
            .field("loaded_domains", &self.loaded_domains())
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) => self.lookup(name).or_else(|| self.default()),
            None => self.default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn self_signed() -> (String, String) {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["inbox.foo.test".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        (key.serialize_pem(), cert.pem())
    }

    #[test]
    fn insert_lookup_remove() {
        let resolver = SniResolver::new();
        assert!(!resolver.has_any());

        let (key_pem, chain_pem) = self_signed();
        let certified = Arc::new(SniResolver::certified_key(&key_pem, &chain_pem).unwrap());

        resolver.insert("Foo.Test.", certified.clone());
        assert!(resolver.has_any());
        assert!(resolver.lookup("foo.test").is_some());
        assert!(resolver.lookup("FOO.TEST").is_some());
        assert!(resolver.lookup("other.test").is_none());

        resolver.remove("foo.test");
        assert!(resolver.lookup("foo.test").is_none());
    }

    #[test]
    fn default_cert_answers_unknown_names() {
        let resolver = SniResolver::new();
        let (key_pem, chain_pem) = self_signed();
        let certified = Arc::new(SniResolver::certified_key(&key_pem, &chain_pem).unwrap());

        resolver.set_default(certified);
        assert!(resolver.has_any());
        assert!(resolver.lookup("anything.test").is_none());
    }

    #[test]
    fn rejects_garbage_material() {
        assert!(SniResolver::certified_key("not a key", "not a cert").is_err());
    }
}
