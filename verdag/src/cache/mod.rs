//! Action cache
//!
//! Host-side bookkeeping that decides whether an existing success marker
//! still stands for the current inputs. Each unit's entry is a SHA-256
//! fingerprint over its invocation, its declared inputs and the entries of
//! its direct dependencies, so a change anywhere upstream reaches every
//! dependent. The marker itself stays empty. Stored as JSON next to the
//! markers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, VerifyError};
use crate::task::{ActionDeclaration, Invocation};

/// File name of the cache inside the output directory
pub const CACHE_FILE: &str = "action-cache.json";

/// Fingerprints of the last successful run per unit
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ActionCache {
    entries: BTreeMap<String, String>,

    #[serde(skip)]
    stats: CacheStats,
}

/// Hit/miss counters for the current process
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
}

impl CacheStats {
    /// Lookups made after `earlier` was taken
    pub fn since(&self, earlier: CacheStats) -> CacheStats {
        CacheStats {
            hits: self.hits - earlier.hits,
            misses: self.misses - earlier.misses,
        }
    }
}

impl ActionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `dir`, or start empty when there is no cache yet
    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::path_in(dir);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => {
                return Err(VerifyError::io_error(
                    format!("failed to read {}", path.display()),
                    e,
                ));
            }
        };
        serde_json::from_str(&json).map_err(|e| {
            VerifyError::io_error(
                format!("corrupt action cache {}", path.display()),
                std::io::Error::other(e),
            )
        })
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = Self::path_in(dir);
        let io_err = |e| VerifyError::io_error(format!("failed to write {}", path.display()), e);

        std::fs::create_dir_all(dir).map_err(io_err)?;
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other).map_err(io_err)?;
        std::fs::write(&path, json).map_err(io_err)
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(CACHE_FILE)
    }

    /// Whether `unit`'s marker exists and was produced from `fingerprint`
    pub fn is_fresh(&mut self, unit: &str, marker: &Path, fingerprint: &str) -> bool {
        let fresh = marker.exists() && self.entries.get(unit).is_some_and(|f| f == fingerprint);
        if fresh {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        fresh
    }

    /// Fingerprint recorded for `unit`'s last successful run
    pub fn entry(&self, unit: &str) -> Option<&str> {
        self.entries.get(unit).map(String::as_str)
    }

    pub fn record(&mut self, unit: &str, fingerprint: String) {
        self.entries.insert(unit.to_string(), fingerprint);
    }

    pub fn invalidate(&mut self, unit: &str) {
        self.entries.remove(unit);
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Fingerprint an action: program, arguments, environment, every declared
/// input (file content, or presence for empty markers), and the current
/// fingerprints of the direct dependencies
///
/// Markers carry no content, so `upstream` is what ties a dependent to the
/// exact inputs its dependencies were verified with. A dependency without a
/// recorded fingerprint is hashed as absent.
pub fn fingerprint(
    invocation: &Invocation,
    declaration: &ActionDeclaration,
    upstream: &[Option<&str>],
) -> Result<String> {
    let mut hasher = Sha256::new();

    hasher.update(invocation.program.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    for arg in &invocation.args {
        hasher.update(arg.as_bytes());
        hasher.update([0u8]);
    }
    for (key, value) in &invocation.env {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }

    for input in &declaration.inputs {
        hasher.update(input.to_string_lossy().as_bytes());
        match std::fs::read(input) {
            Ok(bytes) => {
                hasher.update(b"+");
                hasher.update(Sha256::digest(&bytes));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => hasher.update(b"-"),
            Err(e) => {
                return Err(VerifyError::io_error(
                    format!("failed to read input {}", input.display()),
                    e,
                ));
            }
        }
    }

    for dep in upstream {
        match dep {
            Some(fp) => {
                hasher.update(b"^");
                hasher.update(fp.as_bytes());
            }
            None => hasher.update(b"^-"),
        }
        hasher.update([0u8]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;
    use crate::task::MNEMONIC;

    fn invocation() -> Invocation {
        Invocation {
            program: PathBuf::from("/vb/rust_verify"),
            args: vec!["--crate-name".to_string(), "a".to_string()],
            env: BTreeMap::new(),
        }
    }

    fn declaration(inputs: Vec<PathBuf>) -> ActionDeclaration {
        ActionDeclaration {
            mnemonic: MNEMONIC,
            inputs,
            outputs: vec![],
            requirements: Platform::X86_64Linux.exec_requirements(),
        }
    }

    #[test]
    fn test_fingerprint_tracks_source_content() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("lib.rs");
        std::fs::write(&src, "fn a() {}").unwrap();
        let decl = declaration(vec![src.clone()]);

        let first = fingerprint(&invocation(), &decl, &[]).unwrap();
        assert_eq!(first, fingerprint(&invocation(), &decl, &[]).unwrap());

        std::fs::write(&src, "fn b() {}").unwrap();
        assert_ne!(first, fingerprint(&invocation(), &decl, &[]).unwrap());
    }

    #[test]
    fn test_fingerprint_tracks_arguments() {
        let decl = declaration(vec![]);
        let mut other = invocation();
        other.args.push("--rlimit".to_string());
        assert_ne!(
            fingerprint(&invocation(), &decl, &[]).unwrap(),
            fingerprint(&other, &decl, &[]).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_tracks_marker_presence() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("dep.success");
        let decl = declaration(vec![marker.clone()]);

        let absent = fingerprint(&invocation(), &decl, &[]).unwrap();
        std::fs::write(&marker, b"").unwrap();
        assert_ne!(absent, fingerprint(&invocation(), &decl, &[]).unwrap());
    }

    #[test]
    fn test_fingerprint_tracks_upstream_entries() {
        let decl = declaration(vec![]);
        let before = fingerprint(&invocation(), &decl, &[Some("aaa")]).unwrap();
        let after = fingerprint(&invocation(), &decl, &[Some("bbb")]).unwrap();
        let missing = fingerprint(&invocation(), &decl, &[None]).unwrap();

        assert_ne!(before, after);
        assert_ne!(before, missing);
        assert_eq!(before, fingerprint(&invocation(), &decl, &[Some("aaa")]).unwrap());
    }

    #[test]
    fn test_freshness_requires_marker_and_match() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("a.success");
        let mut cache = ActionCache::new();
        cache.record("a", "abc".to_string());

        assert!(!cache.is_fresh("a", &marker, "abc"));
        std::fs::write(&marker, b"").unwrap();
        assert!(cache.is_fresh("a", &marker, "abc"));
        assert!(!cache.is_fresh("a", &marker, "def"));
        assert!(!cache.is_fresh("b", &marker, "abc"));

        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 3);

        let snapshot = cache.stats();
        assert!(cache.is_fresh("a", &marker, "abc"));
        assert_eq!(cache.stats().since(snapshot), CacheStats { hits: 1, misses: 0 });
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ActionCache::new();
        cache.record("a", "abc".to_string());
        cache.record("b", "def".to_string());
        cache.invalidate("b");
        cache.save(dir.path()).unwrap();

        let loaded = ActionCache::load(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.entry("a"), Some("abc"));
        assert_eq!(loaded.entry("b"), None);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ActionCache::load(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_load_corrupt_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(ActionCache::path_in(dir.path()), "{not json").unwrap();
        assert!(ActionCache::load(dir.path()).is_err());
    }
}
