//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Copying files atomically (temp sibling + rename) with metadata preservation
//! - Recreating symbolic links
//! - Resolving destination conflicts to an unused path
//! - Creating directories recursively

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::checksums::ChecksumValue;
use crate::error::EngineError;
use crate::model::ConflictStrategy;

/// Suffix of the temporary sibling written before the final rename.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Hex characters of the content hash used by `RenameHash`.
pub const HASH_SUFFIX_LEN: usize = 12;

/// `<dest>.partial`
pub fn partial_path(dst: &Path) -> PathBuf {
    let mut name = dst.file_name().map(OsString::from).unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    dst.with_file_name(name)
}

/// True for a leftover `<name>.partial` from an interrupted copy.
pub fn is_partial_path(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().ends_with(PARTIAL_SUFFIX))
        .unwrap_or(false)
}

/// Modification time as float seconds since the Unix epoch (0.0 if unknown).
pub fn mtime_secs(metadata: &fs::Metadata) -> f64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Copy a file so the destination is either absent or complete.
///
/// Bytes go to `<dst>.partial` (a stale one is removed first), are synced,
/// optionally get the source's modification time and permission bits, and
/// are then renamed onto `dst`.
///
/// # Returns
/// Number of bytes copied
pub fn copy_file_atomic(src: &Path, dst: &Path, preserve_metadata: bool) -> Result<u64, EngineError> {
    ensure_parent_dir_exists(dst)?;

    let tmp = partial_path(dst);
    if tmp.exists() {
        let _ = fs::remove_file(&tmp);
    }

    let result = write_partial(src, &tmp, preserve_metadata).and_then(|bytes| {
        fs::rename(&tmp, dst).map_err(|e| EngineError::WriteError {
            path: dst.to_path_buf(),
            source: e,
        })?;
        Ok(bytes)
    });

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_partial(src: &Path, tmp: &Path, preserve_metadata: bool) -> Result<u64, EngineError> {
    let mut src_file = fs::File::open(src).map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;

    let src_metadata = src_file.metadata().map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;

    let mut dst_file = fs::File::create(tmp).map_err(|e| EngineError::WriteError {
        path: tmp.to_path_buf(),
        source: e,
    })?;

    let bytes_copied = io::copy(&mut src_file, &mut dst_file).map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            EngineError::WriteError {
                path: tmp.to_path_buf(),
                source: e,
            }
        } else {
            EngineError::ReadError {
                path: src.to_path_buf(),
                source: e,
            }
        }
    })?;

    dst_file
        .flush()
        .and_then(|_| dst_file.sync_all())
        .map_err(|e| EngineError::WriteError {
            path: tmp.to_path_buf(),
            source: e,
        })?;
    drop(dst_file);

    if preserve_metadata {
        // Best effort: a filesystem without mtime/permission support still gets the bytes.
        let mtime = filetime::FileTime::from_last_modification_time(&src_metadata);
        let atime = filetime::FileTime::from_last_access_time(&src_metadata);
        let _ = filetime::set_file_times(tmp, atime, mtime);
        let _ = fs::set_permissions(tmp, src_metadata.permissions());
    }

    Ok(bytes_copied)
}

/// Recreate the symlink `src` at `dst`, replacing whatever is there.
pub fn copy_symlink(src: &Path, dst: &Path) -> Result<(), EngineError> {
    ensure_parent_dir_exists(dst)?;

    let link_target = fs::read_link(src).map_err(|e| EngineError::SymlinkFailed {
        path: src.to_path_buf(),
        source: e,
    })?;

    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst).map_err(|e| EngineError::WriteError {
            path: dst.to_path_buf(),
            source: e,
        })?;
    }

    create_symlink(&link_target, dst).map_err(|e| EngineError::SymlinkFailed {
        path: dst.to_path_buf(),
        source: e,
    })
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    let resolved = link.parent().map(|p| p.join(target)).unwrap_or_else(|| target.to_path_buf());
    if resolved.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}

/// Split a file name into stem and extension (with its dot).
fn split_name(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, ext)
}

/// `<stem>_<suffix><ext>` next to `dest`.
pub fn suffixed_path(dest: &Path, suffix: &str) -> PathBuf {
    let (stem, ext) = split_name(dest);
    dest.with_file_name(format!("{}_{}{}", stem, suffix, ext))
}

/// First `<stem>_<n><ext>` (n = 1, 2, ...) for which `taken` is false.
pub fn next_counter_path(dest: &Path, taken: impl Fn(&Path) -> bool) -> PathBuf {
    let mut counter: u64 = 1;
    loop {
        let candidate = suffixed_path(dest, &counter.to_string());
        if !taken(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Resolve the path to write to for a desired destination.
///
/// `Overwrite` and `Skip` return `dest` unchanged (skipping is the caller's
/// job). The rename strategies return `dest` when it does not exist yet;
/// otherwise they try their own suffix and fall back to the counter.
pub fn unique_dest_path(dest: &Path, strategy: ConflictStrategy, content_hash: &ChecksumValue) -> PathBuf {
    match strategy {
        ConflictStrategy::Overwrite | ConflictStrategy::Skip => return dest.to_path_buf(),
        _ => {}
    }
    if !dest.exists() {
        return dest.to_path_buf();
    }

    let candidate = match strategy {
        ConflictStrategy::RenameHash => Some(suffixed_path(dest, content_hash.short(HASH_SUFFIX_LEN))),
        ConflictStrategy::RenameTime => {
            let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
            Some(suffixed_path(dest, &stamp))
        }
        _ => None,
    };

    match candidate {
        Some(path) if !path.exists() => path,
        _ => next_counter_path(dest, |p| p.exists()),
    }
}

/// Existing siblings of `dest` that a rename strategy could have produced:
/// `<stem>_<n><ext>`, `<stem>_<YYYYMMDD_HHMMSS><ext>` or `<stem>_<hash><ext>`.
///
/// Sorted by name. An unreadable parent yields no siblings.
pub fn renamed_siblings(dest: &Path) -> Vec<PathBuf> {
    let parent = match dest.parent() {
        Some(parent) => parent,
        None => return Vec::new(),
    };
    let (stem, ext) = split_name(dest);
    let prefix = format!("{}_", stem);

    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut siblings: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| !t.is_dir()).unwrap_or(false))
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(ext.as_str()))
                .map(is_rename_suffix)
                .unwrap_or(false)
        })
        .map(|entry| entry.path())
        .collect();
    siblings.sort();
    siblings
}

fn is_rename_suffix(suffix: &str) -> bool {
    let counter_or_time = suffix.chars().all(|c| c.is_ascii_digit() || c == '_');
    let hash = suffix.len() == HASH_SUFFIX_LEN && suffix.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'));
    !suffix.is_empty() && !suffix.starts_with('_') && (counter_or_time || hash)
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns EngineError if directory creation fails
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(()),
    };

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}
