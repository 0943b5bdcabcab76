//! Scope-keyed certificate storage with on-demand issuance and rotation.
//!
//! `resolve` is invoked synchronously from inside the TLS handshake (rustls'
//! `ResolvesServerCert` has no async variant), so the store is guarded by
//! [`std::sync::RwLock`] rather than `tokio::sync::RwLock` — lookups and
//! even a mint-on-miss are brief enough to hold the executor thread for.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use time::{Duration as TimeDuration, OffsetDateTime};

use crate::certificate::ParsedCertificate;
use crate::error::Error;

/// Sentinel scope matching any hostname not otherwise registered.
pub const ANY_SCOPE: &str = "*";

const DEFAULT_LIFETIME_DAYS: i64 = 365;

struct Entry {
    parsed: ParsedCertificate,
    key_der: rustls::PrivateKey,
}

/// A scope → certificate map with lazy registration and expiry-driven
/// rotation, optionally persisted to a directory of PEM pairs.
pub struct CertificateStore {
    entries: RwLock<HashMap<String, Option<Entry>>>,
    persist_dir: RwLock<Option<PathBuf>>,
}

impl CertificateStore {
    /// An empty store with no persistence configured.
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()), persist_dir: RwLock::new(None) }
    }

    /// Records that `scope` is expected, with no certificate yet. Without
    /// this, [`Self::get`] refuses to mint one.
    pub fn register(&self, scope: impl Into<String>) {
        let mut entries = self.entries.write().expect("cert store lock poisoned");
        entries.entry(scope.into()).or_insert(None);
    }

    /// Installs `der`/`key_der` under `scope`, persisting to disk first if a
    /// directory is configured.
    pub fn add(&self, scope: impl Into<String>, der: rustls::Certificate, key_der: rustls::PrivateKey) -> Result<(), Error> {
        let scope = scope.into();
        let parsed = ParsedCertificate::parse(der)?;

        if let Some(dir) = self.persist_dir.read().expect("cert store lock poisoned").as_ref() {
            persist_pem(dir, &scope, parsed.der(), &key_der)?;
        }

        let mut entries = self.entries.write().expect("cert store lock poisoned");
        entries.insert(scope, Some(Entry { parsed, key_der }));
        Ok(())
    }

    /// Exact-key lookup only; no wildcard fallback and no minting.
    pub fn lookup(&self, scope: &str) -> Option<ParsedCertificate> {
        let entries = self.entries.read().expect("cert store lock poisoned");
        entries.get(scope).and_then(|entry| entry.as_ref()).map(|entry| entry.parsed.clone())
    }

    /// The hot path driving TLS SNI resolution: exact, then `*.suffix`,
    /// then the `*` sentinel; mints a fresh certificate if the matched
    /// entry is empty or expired.
    pub fn get(&self, hostname: &str) -> Result<ParsedCertificate, Error> {
        let scope = {
            let entries = self.entries.read().expect("cert store lock poisoned");
            resolve_scope(&entries, hostname).ok_or_else(|| Error::UnrecognizedScope(hostname.to_string()))?
        };

        if let Some(cert) = self.fresh_entry(&scope) {
            return Ok(cert);
        }

        // Re-check under the exclusive lock: another worker may have
        // already minted while we didn't hold it.
        let mut entries = self.entries.write().expect("cert store lock poisoned");
        if let Some(Some(entry)) = entries.get(&scope) {
            if !entry.parsed.is_expired_at(SystemTime::now()) {
                return Ok(entry.parsed.clone());
            }
        }

        info!("minting certificate for scope {:?}", scope);
        let (der, key_der) = create_certificate(&scope)?;
        let parsed = ParsedCertificate::parse(der)?;

        if let Some(dir) = self.persist_dir.read().expect("cert store lock poisoned").as_ref() {
            persist_pem(dir, &scope, parsed.der(), &key_der)?;
        }

        entries.insert(scope, Some(Entry { parsed: parsed.clone(), key_der }));
        Ok(parsed)
    }

    fn fresh_entry(&self, scope: &str) -> Option<ParsedCertificate> {
        let entries = self.entries.read().expect("cert store lock poisoned");
        match entries.get(scope) {
            Some(Some(entry)) if !entry.parsed.is_expired_at(SystemTime::now()) => Some(entry.parsed.clone()),
            _ => None,
        }
    }

    /// Builds the signing material rustls needs for a handshake: the leaf's
    /// certificate and the private key that signs it. Mints on miss/expiry
    /// exactly as [`Self::get`] does.
    fn certified_key(&self, hostname: &str) -> Result<Arc<CertifiedKey>, Error> {
        // get() ensures the entry is present and fresh; re-read it to grab
        // the key material get() doesn't return.
        self.get(hostname)?;

        let scope = {
            let entries = self.entries.read().expect("cert store lock poisoned");
            resolve_scope(&entries, hostname).expect("get() just ensured this scope resolves")
        };

        let entries = self.entries.read().expect("cert store lock poisoned");
        let entry = entries.get(&scope).and_then(|e| e.as_ref()).expect("get() just populated this entry");

        let signing_key = rustls::sign::any_supported_type(&entry.key_der)
            .map_err(|err| Error::CertificateUnknown(format!("unsupported key for {:?}: {}", scope, err)))?;

        Ok(Arc::new(CertifiedKey::new(vec![entry.parsed.der().clone()], signing_key)))
    }

    /// Scans `dir` for `<scope>.crt` / `<scope>.key` PEM pairs and loads
    /// them, then uses `dir` for future [`Self::add`]/[`Self::get`]
    /// persistence. Entries whose scope was never [`Self::register`]ed are
    /// skipped.
    pub fn load(&self, dir: impl AsRef<Path>) -> Result<(), Error> {
        let dir = dir.as_ref();

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("crt") {
                continue;
            }

            let escaped_scope = match path.file_stem().and_then(|stem| stem.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            let scope = unescape_scope(&escaped_scope);

            {
                let entries = self.entries.read().expect("cert store lock poisoned");
                if !entries.contains_key(&scope) {
                    continue;
                }
            }

            let key_path = path.with_extension("key");
            let (der, key_der) = match load_pem_pair(&path, &key_path) {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("skipping unreadable certificate pair for scope {:?}: {}", scope, err);
                    continue;
                }
            };

            debug!("loaded persisted certificate for scope {:?}", scope);
            let parsed = ParsedCertificate::parse(der)?;
            let mut entries = self.entries.write().expect("cert store lock poisoned");
            entries.insert(scope, Some(Entry { parsed, key_der }));
        }

        *self.persist_dir.write().expect("cert store lock poisoned") = Some(dir.to_path_buf());
        Ok(())
    }
}

impl Default for CertificateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let hostname = client_hello.server_name()?;
        self.certified_key(hostname).ok()
    }
}

fn resolve_scope(entries: &HashMap<String, Option<Entry>>, hostname: &str) -> Option<String> {
    if entries.contains_key(hostname) {
        return Some(hostname.to_string());
    }

    if let Some((_, suffix)) = hostname.split_once('.') {
        let wildcard = format!("*.{}", suffix);
        if entries.contains_key(&wildcard) {
            return Some(wildcard);
        }
    }

    if entries.contains_key(ANY_SCOPE) {
        return Some(ANY_SCOPE.to_string());
    }

    None
}

fn escape_scope(scope: &str) -> String {
    scope.replace('/', ":")
}

fn unescape_scope(escaped: &str) -> String {
    escaped.replace(':', "/")
}

fn persist_pem(dir: &Path, scope: &str, der: &rustls::Certificate, key_der: &rustls::PrivateKey) -> Result<(), Error> {
    fs::create_dir_all(dir)?;

    let escaped = escape_scope(scope);
    let cert_pem = pem::encode(&pem::Pem { tag: "CERTIFICATE".to_string(), contents: der.0.clone() });
    let key_pem = pem::encode(&pem::Pem { tag: "PRIVATE KEY".to_string(), contents: key_der.0.clone() });

    let mut cert_file = fs::File::create(dir.join(format!("{}.crt", escaped)))?;
    cert_file.write_all(cert_pem.as_bytes())?;

    let mut key_file = fs::File::create(dir.join(format!("{}.key", escaped)))?;
    key_file.write_all(key_pem.as_bytes())?;

    Ok(())
}

fn load_pem_pair(cert_path: &Path, key_path: &Path) -> Result<(rustls::Certificate, rustls::PrivateKey), Error> {
    let cert_bytes = fs::read(cert_path)?;
    let mut cert_reader = std::io::Cursor::new(cert_bytes);
    let mut certs = rustls_pemfile::certs(&mut cert_reader)?;
    let der = certs.pop().ok_or_else(|| Error::CertificateUnknown(format!("no certificate in {:?}", cert_path)))?;

    let key_bytes = fs::read(key_path)?;
    let mut key_reader = std::io::Cursor::new(key_bytes);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)?;
    let key_der = keys.pop().ok_or_else(|| Error::CertificateUnknown(format!("no private key in {:?}", key_path)))?;

    Ok((rustls::Certificate(der), rustls::PrivateKey(key_der)))
}

/// Mints a self-signed ECDSA-P256 leaf for `scope`, valid for one year,
/// with `scope` placed in both the DNS-SAN and the CN.
fn create_certificate(scope: &str) -> Result<(rustls::Certificate, rustls::PrivateKey), Error> {
    let mut params = rcgen::CertificateParams::new(vec![scope.to_string()]);
    params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;

    let mut distinguished_name = rcgen::DistinguishedName::new();
    distinguished_name.push(rcgen::DnType::CommonName, scope);
    params.distinguished_name = distinguished_name;

    let not_before = OffsetDateTime::now_utc();
    params.not_before = not_before;
    params.not_after = not_before + TimeDuration::days(DEFAULT_LIFETIME_DAYS);

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|err| Error::CertificateUnknown(format!("failed to mint certificate for {:?}: {}", scope, err)))?;

    let cert_der = cert
        .serialize_der()
        .map_err(|err| Error::CertificateUnknown(format!("failed to serialize certificate for {:?}: {}", scope, err)))?;
    let key_der = cert.serialize_private_key_der();

    Ok((rustls::Certificate(cert_der), rustls::PrivateKey(key_der)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_without_register_is_unrecognized() {
        let store = CertificateStore::new();
        let err = store.get("example.com").unwrap_err();
        assert!(matches!(err, Error::UnrecognizedScope(_)));
    }

    #[test]
    fn get_mints_on_first_call() {
        let store = CertificateStore::new();
        store.register("localhost");

        let cert = store.get("localhost").unwrap();
        assert!(!cert.is_expired_at(SystemTime::now()));
        assert!(cert.dns_names().iter().any(|name| name == "localhost"));
    }

    #[test]
    fn get_reuses_unexpired_leaf() {
        let store = CertificateStore::new();
        store.register("localhost");

        let first = store.get("localhost").unwrap();
        let second = store.get("localhost").unwrap();
        assert_eq!(first.der().as_ref(), second.der().as_ref());
    }

    #[test]
    fn wildcard_scope_matches_subdomain() {
        let store = CertificateStore::new();
        store.register("*.example.com");

        let cert = store.get("mail.example.com").unwrap();
        assert!(cert.matches_hostname("mail.example.com"));
    }

    #[test]
    fn any_sentinel_is_last_resort() {
        let store = CertificateStore::new();
        store.register(ANY_SCOPE);

        assert!(store.get("anything.example.org").is_ok());
    }

    #[test]
    fn load_and_persist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new();
        store.register("localhost");
        *store.persist_dir.write().unwrap() = Some(dir.path().to_path_buf());

        let minted = store.get("localhost").unwrap();

        let reloaded = CertificateStore::new();
        reloaded.register("localhost");
        reloaded.load(dir.path()).unwrap();

        let loaded = reloaded.lookup("localhost").unwrap();
        assert_eq!(loaded.der().as_ref(), minted.der().as_ref());
    }

    #[test]
    fn escape_scope_replaces_slash() {
        assert_eq!(escape_scope("a/b"), "a:b");
        assert_eq!(unescape_scope("a:b"), "a/b");
    }
}
