//! Trust-On-First-Use host pinning: a thread-safe map from hostname to the
//! fingerprint of the leaf certificate first seen for it.
//!
//! Persisted as a line-oriented text file rather than JSON — one entry per
//! line keeps the format append-friendly and diffable, unlike the
//! serde_json snapshot approach.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha512};

use crate::error::Error;

const ALGORITHM: &str = "SHA-512";

/// A pinned host entry: the fingerprinting algorithm (always `SHA-512` for
/// entries this store creates, but parsed generically), the hex-colon
/// fingerprint, and an optional expiry after which the pin is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    algorithm: String,
    fingerprint: String,
    expiry: Option<u64>,
}

impl Host {
    fn new(hostname_leaf: &[u8], not_after: SystemTime) -> Self {
        let fingerprint = fingerprint(hostname_leaf);
        let expiry = not_after.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs());
        Self { algorithm: ALGORITHM.to_string(), fingerprint, expiry }
    }

    /// The fingerprinting algorithm name (`"SHA-512"` for entries this
    /// store creates).
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The hex-colon-separated fingerprint.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Unix seconds after which this pin should be treated as expired, if
    /// the entry carries one.
    pub fn expiry(&self) -> Option<u64> {
        self.expiry
    }

    fn is_expired_at(&self, now: SystemTime) -> bool {
        match self.expiry {
            Some(expiry) => now.duration_since(UNIX_EPOCH).map(|d| d.as_secs() > expiry).unwrap_or(false),
            None => false,
        }
    }
}

fn fingerprint(der: &[u8]) -> String {
    let digest = Sha512::digest(der);
    digest.iter().map(|byte| hex::encode_upper([*byte])).collect::<Vec<_>>().join(":")
}

/// A known-hosts database: `hostname -> Host`, behind a reader-writer lock.
pub struct TofuStore {
    hosts: RwLock<HashMap<String, Host>>,
    path: RwLock<Option<PathBuf>>,
}

impl TofuStore {
    /// An empty, unpersisted store.
    pub fn new() -> Self {
        Self { hosts: RwLock::new(HashMap::new()), path: RwLock::new(None) }
    }

    /// Applies the TOFU decision for `hostname` having just presented
    /// `leaf_der` with expiry `leaf_not_after`:
    ///
    /// 1. No entry, or the stored entry's expiry has passed: pin the new
    ///    leaf and return `Ok`.
    /// 2. Entry exists and the fingerprint matches: return `Ok`.
    /// 3. Entry exists and the fingerprint differs: return
    ///    [`Error::FingerprintMismatch`].
    pub fn tofu(&self, hostname: &str, leaf_der: &[u8], leaf_not_after: SystemTime) -> Result<(), Error> {
        let candidate = Host::new(leaf_der, leaf_not_after);

        {
            let hosts = self.hosts.read().expect("tofu store lock poisoned");
            match hosts.get(hostname) {
                None => {}
                Some(existing) if existing.is_expired_at(SystemTime::now()) => {
                    info!("pinned fingerprint for {} expired, re-pinning on next contact", hostname);
                }
                Some(existing) if existing.fingerprint == candidate.fingerprint => return Ok(()),
                Some(existing) => {
                    warn!("fingerprint mismatch for {}: pinned {}, got {}", hostname, existing.fingerprint, candidate.fingerprint);
                    return Err(Error::FingerprintMismatch {
                        host: hostname.to_string(),
                        expected: existing.fingerprint.clone(),
                        actual: candidate.fingerprint,
                    })
                }
            }
        }

        self.pin(hostname, candidate)
    }

    fn pin(&self, hostname: &str, host: Host) -> Result<(), Error> {
        debug!("pinning {} to fingerprint {}", hostname, host.fingerprint);

        if let Some(path) = self.path.read().expect("tofu store lock poisoned").as_ref() {
            append_line(path, hostname, &host)?;
        }

        let mut hosts = self.hosts.write().expect("tofu store lock poisoned");
        hosts.insert(hostname.to_string(), host);
        Ok(())
    }

    /// The pinned entry for `hostname`, if any.
    pub fn get(&self, hostname: &str) -> Option<Host> {
        self.hosts.read().expect("tofu store lock poisoned").get(hostname).cloned()
    }

    /// Loads entries from `path` (skipping blank/unparseable lines) and
    /// uses `path` for future pins.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.load_with(path, ParseMode::Lenient)
    }

    /// As [`Self::load`], but any malformed line aborts the whole load.
    pub fn load_strict(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.load_with(path, ParseMode::Strict)
    }

    fn load_with(&self, path: impl AsRef<Path>, mode: ParseMode) -> Result<(), Error> {
        let path = path.as_ref();

        if path.exists() {
            let contents = fs::read_to_string(path)?;
            let mut hosts = self.hosts.write().expect("tofu store lock poisoned");

            for line in contents.lines() {
                match parse_line(line) {
                    Some((hostname, host)) => {
                        hosts.insert(hostname, host);
                    }
                    None if line.trim().is_empty() => {}
                    None if mode == ParseMode::Strict => {
                        return Err(Error::InvalidRequest(format!("malformed known-hosts line: {:?}", line)));
                    }
                    None => {}
                }
            }
        }

        *self.path.write().expect("tofu store lock poisoned") = Some(path.to_path_buf());
        Ok(())
    }
}

impl Default for TofuStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(PartialEq, Eq)]
enum ParseMode {
    Lenient,
    Strict,
}

fn parse_line(line: &str) -> Option<(String, Host)> {
    let mut fields = line.split(' ');
    let hostname = fields.next()?.to_string();
    let algorithm = fields.next()?.to_string();
    let fingerprint = fields.next()?.to_string();
    let expiry = fields.next().and_then(|s| s.parse::<u64>().ok());

    if hostname.is_empty() || algorithm.is_empty() || fingerprint.is_empty() {
        return None;
    }

    Some((hostname, Host { algorithm, fingerprint, expiry }))
}

fn append_line(path: &Path, hostname: &str, host: &Host) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut line = format!("{} {} {}", hostname, host.algorithm, host.fingerprint);
    if let Some(expiry) = host.expiry {
        line.push(' ');
        line.push_str(&expiry.to_string());
    }
    line.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn leaf(byte: u8) -> Vec<u8> {
        vec![byte; 32]
    }

    fn far_future() -> SystemTime {
        SystemTime::now() + Duration::from_secs(365 * 24 * 60 * 60)
    }

    #[test]
    fn first_contact_pins_and_succeeds() {
        let store = TofuStore::new();
        assert!(store.tofu("example.com", &leaf(1), far_future()).is_ok());
        assert!(store.get("example.com").is_some());
    }

    #[test]
    fn repeat_contact_with_same_leaf_succeeds() {
        let store = TofuStore::new();
        store.tofu("example.com", &leaf(1), far_future()).unwrap();
        assert!(store.tofu("example.com", &leaf(1), far_future()).is_ok());
    }

    #[test]
    fn changed_leaf_is_rejected() {
        let store = TofuStore::new();
        store.tofu("example.com", &leaf(1), far_future()).unwrap();

        let err = store.tofu("example.com", &leaf(2), far_future()).unwrap_err();
        assert!(matches!(err, Error::FingerprintMismatch { .. }));
    }

    #[test]
    fn expired_pin_is_replaced() {
        let store = TofuStore::new();
        let past = SystemTime::now() - Duration::from_secs(60);
        store.tofu("example.com", &leaf(1), past).unwrap();

        assert!(store.tofu("example.com", &leaf(2), far_future()).is_ok());
        assert_eq!(store.get("example.com").unwrap().fingerprint(), fingerprint(&leaf(2)));
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        let store = TofuStore::new();
        store.load(&path).unwrap();
        store.tofu("example.com", &leaf(1), far_future()).unwrap();

        let reloaded = TofuStore::new();
        reloaded.load(&path).unwrap();
        assert_eq!(reloaded.get("example.com").unwrap().fingerprint(), fingerprint(&leaf(1)));
    }

    #[test]
    fn lenient_load_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, "\nnot-enough-fields\nexample.com SHA-512 AB:CD\n").unwrap();

        let store = TofuStore::new();
        store.load(&path).unwrap();
        assert!(store.get("example.com").is_some());
    }

    #[test]
    fn strict_load_rejects_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, "not-enough-fields\n").unwrap();

        let store = TofuStore::new();
        assert!(store.load_strict(&path).is_err());
    }
}
