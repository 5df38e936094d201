//! Run-wide reservations of content hashes and destination paths.
//!
//! Every check-and-insert happens under one mutex so that two files with the
//! same content, or two files resolving to the same destination, can never
//! both be accepted.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::fs_ops::next_counter_path;

#[derive(Default)]
struct Inner {
    /// Content already present in the target: hash -> first path seen
    known: HashMap<String, PathBuf>,
    /// Hashes claimed by a source file this run
    hashes: HashSet<String>,
    /// Destinations claimed by a source file this run
    paths: HashSet<PathBuf>,
}

/// Shared reservation table for one run.
#[derive(Default)]
pub struct Reservations {
    inner: Mutex<Inner>,
}

impl Reservations {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned table is still consistent: every update is a single insert.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record content found in the target. The first path wins per hash.
    pub fn insert_known(&self, hash: &str, path: &Path) {
        self.lock()
            .known
            .entry(hash.to_string())
            .or_insert_with(|| path.to_path_buf());
    }

    /// Path already holding this content, if any.
    pub fn known_path(&self, hash: &str) -> Option<PathBuf> {
        self.lock().known.get(hash).cloned()
    }

    pub fn known_len(&self) -> usize {
        self.lock().known.len()
    }

    /// Claim a hash for this run.
    ///
    /// Returns false when the content is already in the target or another
    /// file claimed it first.
    pub fn claim_hash(&self, hash: &str) -> bool {
        let mut inner = self.lock();
        if inner.known.contains_key(hash) || inner.hashes.contains(hash) {
            return false;
        }
        inner.hashes.insert(hash.to_string());
        true
    }

    /// Give a hash back after its copy failed, so later files may claim it.
    pub fn release_hash(&self, hash: &str) {
        self.lock().hashes.remove(hash);
    }

    /// Claim `path` as a destination. Returns false if already claimed.
    pub fn claim_path(&self, path: &Path) -> bool {
        self.lock().paths.insert(path.to_path_buf())
    }

    /// Claim `resolved`, or when another file holds it, the first counter
    /// variant of `desired` that is free both on disk and in this table.
    pub fn claim_destination(&self, desired: &Path, resolved: PathBuf) -> PathBuf {
        let mut inner = self.lock();
        if inner.paths.insert(resolved.clone()) {
            return resolved;
        }
        let fallback = next_counter_path(desired, |p| inner.paths.contains(p) || p.exists());
        inner.paths.insert(fallback.clone());
        fallback
    }

    /// Make a finished copy visible as known content.
    pub fn record_copied(&self, hash: &str, path: &Path) {
        self.insert_known(hash, path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_known_content_cannot_be_claimed() {
        let table = Reservations::new();
        table.insert_known("aa", Path::new("/t/images/a.jpg"));
        table.insert_known("aa", Path::new("/t/images/other.jpg"));

        assert_eq!(table.known_path("aa"), Some(PathBuf::from("/t/images/a.jpg")));
        assert!(!table.claim_hash("aa"));
        assert!(table.claim_hash("bb"));
        assert!(!table.claim_hash("bb"));
    }

    #[test]
    fn test_release_reopens_hash() {
        let table = Reservations::new();
        assert!(table.claim_hash("cc"));
        table.release_hash("cc");
        assert!(table.claim_hash("cc"));
    }

    #[test]
    fn test_claim_destination_falls_back_to_counter() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let desired = temp_dir.path().join("a.txt");
        std::fs::write(temp_dir.path().join("a_1.txt"), b"x").expect("Failed to write");

        let table = Reservations::new();
        assert_eq!(table.claim_destination(&desired, desired.clone()), desired);
        // a_1 exists on disk, so the next free slot is a_2.
        assert_eq!(
            table.claim_destination(&desired, desired.clone()),
            temp_dir.path().join("a_2.txt")
        );
        assert_eq!(
            table.claim_destination(&desired, desired.clone()),
            temp_dir.path().join("a_3.txt")
        );
        assert!(!table.claim_path(&temp_dir.path().join("a_2.txt")));
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let table = Arc::new(Reservations::new());
        let winners: usize = (0..16)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || table.claim_hash("same"))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().expect("thread panicked") as usize)
            .sum();
        assert_eq!(winners, 1);
    }
}
