//! Destination planning.
//!
//! Decides where a source file lands: by the first matching rule (archive
//! modes) or by its path relative to a source root (mirror mode). Also expands
//! the user's mixed list of files and folders into concrete files.

use regex::Regex;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::classify::{compile_regex, extension_of, guess_mime, sanitize_folder_name};
use crate::error::EngineError;
use crate::model::{Profile, Rule, SymlinkMode, DEFAULT_MIRROR_SUBDIR, MISC_FOLDER};

/// A rule with its regex compiled once per run.
struct CompiledRule {
    rule: Rule,
    folder: String,
    regex: Option<Regex>,
}

impl CompiledRule {
    fn matches(&self, path: &Path, mime: &str, size: u64) -> bool {
        let rule = &self.rule;
        if !rule.enabled {
            return false;
        }

        if !rule.extensions.is_empty() {
            let ext = extension_of(path);
            if !rule.extensions.iter().any(|e| *e == ext) {
                return false;
            }
        }

        if !rule.mime_prefixes.is_empty() {
            if mime.is_empty() || !rule.mime_prefixes.iter().any(|p| mime.starts_with(p.as_str())) {
                return false;
            }
        }

        if !rule.name_regex.is_empty() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match &self.regex {
                Some(re) if re.is_match(&name) => {}
                _ => return false,
            }
        }

        if !rule.path_contains.is_empty() {
            let haystack = path.to_string_lossy().to_lowercase();
            if !haystack.contains(&rule.path_contains.to_lowercase()) {
                return false;
            }
        }

        if rule.min_size > 0 && size < rule.min_size {
            return false;
        }
        if rule.max_size > 0 && size > rule.max_size {
            return false;
        }

        true
    }
}

/// Rule-based placement for archive and incremental modes.
pub struct RulePlanner {
    rules: Vec<CompiledRule>,
}

impl RulePlanner {
    pub fn new(rules: &[Rule]) -> Self {
        let rules = rules
            .iter()
            .map(|rule| CompiledRule {
                folder: sanitize_folder_name(&rule.target_folder),
                regex: compile_regex(&rule.name_regex),
                rule: rule.clone(),
            })
            .collect();
        RulePlanner { rules }
    }

    fn first_match(&self, source: &Path, size: u64) -> Option<&CompiledRule> {
        let mime = guess_mime(source);
        self.rules.iter().find(|r| r.matches(source, mime, size))
    }

    /// `target_root/<rule folder>/<file name>` for the first matching rule,
    /// else `target_root/misc/<file name>`.
    pub fn classify_destination(&self, target_root: &Path, source: &Path, size: u64) -> PathBuf {
        let folder = self
            .first_match(source, size)
            .map(|r| r.folder.as_str())
            .unwrap_or(MISC_FOLDER);
        let name = source.file_name().unwrap_or(source.as_os_str());
        target_root.join(folder).join(name)
    }
}

/// One-shot form of [`RulePlanner::classify_destination`].
pub fn classify_destination(profile: &Profile, target_root: &Path, source: &Path, size: u64) -> PathBuf {
    RulePlanner::new(&profile.rules).classify_destination(target_root, source, size)
}

/// Root a mirror run writes into: `target/<subdir>` with the subdir clamped
/// to plain components so it can never escape the target.
pub fn mirror_root(target_root: &Path, subdir: &str) -> PathBuf {
    let clamped: PathBuf = Path::new(subdir.trim())
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    if clamped.as_os_str().is_empty() {
        target_root.join(DEFAULT_MIRROR_SUBDIR)
    } else {
        target_root.join(clamped)
    }
}

/// Keep `source`'s path relative to the most specific root containing it.
///
/// # Errors
/// `PathNotUnderRoot` when no root contains `source`; callers then treat the
/// file's parent as its root.
pub fn mirror_destination(mirror_root: &Path, source_roots: &[PathBuf], source: &Path) -> Result<PathBuf, EngineError> {
    source_roots
        .iter()
        .filter_map(|root| source.strip_prefix(root).ok().map(|rel| (root, rel)))
        .filter(|(_, rel)| !rel.as_os_str().is_empty())
        .max_by_key(|(root, _)| root.components().count())
        .map(|(_, rel)| mirror_root.join(rel))
        .ok_or_else(|| EngineError::PathNotUnderRoot {
            path: source.to_path_buf(),
        })
}

/// Absolute form of a user-supplied path without resolving its final
/// component, so a symlink input stays a symlink.
pub fn absolute_input(path: &Path) -> PathBuf {
    let resolved_parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .and_then(|p| fs::canonicalize(p).ok());
    match (resolved_parent, path.file_name()) {
        (Some(parent), Some(name)) => parent.join(name),
        _ => fs::canonicalize(path).unwrap_or_else(|_| {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }),
    }
}

/// Roots used for mirror placement: each existing folder input, and the
/// parent folder of each existing file input.
pub fn source_roots(sources: &[PathBuf]) -> Vec<PathBuf> {
    sources
        .iter()
        .map(|s| absolute_input(s))
        .filter_map(|p| match fs::metadata(&p) {
            Ok(meta) if meta.is_dir() => Some(p),
            Ok(_) => p.parent().map(Path::to_path_buf),
            Err(_) => None,
        })
        .collect()
}

/// Expand files and folders into a lazy sequence of concrete files.
///
/// Missing inputs are skipped silently (the engine counts them). Symlinks are
/// dropped in `Skip` mode, traversed in `Follow` mode, and yielded unresolved
/// in `LinkAsSymlink` mode. Each call starts a fresh traversal.
pub fn discover_source_files(sources: &[PathBuf], symlinks: SymlinkMode) -> impl Iterator<Item = PathBuf> {
    let inputs: Vec<PathBuf> = sources.iter().map(|s| absolute_input(s)).collect();
    let follow = symlinks == SymlinkMode::Follow;

    inputs.into_iter().flat_map(move |input| -> Box<dyn Iterator<Item = PathBuf>> {
        let top = match fs::symlink_metadata(&input) {
            Ok(meta) => meta,
            Err(_) => return Box::new(std::iter::empty()),
        };

        if top.file_type().is_symlink() {
            match symlinks {
                SymlinkMode::Skip => return Box::new(std::iter::empty()),
                SymlinkMode::LinkAsSymlink => return Box::new(std::iter::once(input)),
                SymlinkMode::Follow => {}
            }
        }

        match fs::metadata(&input) {
            Ok(meta) if meta.is_file() => Box::new(std::iter::once(input)),
            Ok(meta) if meta.is_dir() => Box::new(walk_folder(input, symlinks, follow)),
            _ => Box::new(std::iter::empty()),
        }
    })
}

fn walk_folder(root: PathBuf, symlinks: SymlinkMode, follow: bool) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(root)
        .follow_links(follow)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping unreadable entry during discovery: {}", e);
                None
            }
        })
        .filter(move |entry| {
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                // Only reachable when links are not followed.
                symlinks == SymlinkMode::LinkAsSymlink
            } else {
                file_type.is_file()
            }
        })
        .map(|entry| entry.into_path())
}
