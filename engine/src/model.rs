//! Core data model for backup runs.
//!
//! This module defines the run configuration and the run output:
//! - Profile, Rule, PerformanceOptions: what a run should do
//! - BackupMode, ConflictStrategy, SymlinkMode, MirrorDeleteScope: enums controlling behavior
//! - PlanItem: one placement or deletion decision
//! - RunResult: aggregate counters produced once per run
//!
//! Deserialization of the configuration types is lenient and lives in
//! `config.rs`; serialization is derived here.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::checksums::ChecksumAlgorithm;

/// Folder used when no rule matches.
pub const MISC_FOLDER: &str = "misc";

/// Default mirror subfolder for `MirrorDeleteScope::SubfolderOnly`.
pub const DEFAULT_MIRROR_SUBDIR: &str = "mirror";

/// How sources are placed into the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    /// Rule-based placement with content deduplication
    #[default]
    ArchiveRules,
    /// Archive, restricted to files modified after the last completed run
    IncrementalRules,
    /// Mirror the source tree; optionally delete stale target files
    MirrorTree,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::ArchiveRules => "archive_rules",
            BackupMode::IncrementalRules => "incremental_rules",
            BackupMode::MirrorTree => "mirror_tree",
        }
    }

    /// Accepts the serialized names plus short CLI aliases.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "archive_rules" | "archive" => Some(BackupMode::ArchiveRules),
            "incremental_rules" | "incremental" => Some(BackupMode::IncrementalRules),
            "mirror_tree" | "mirror" => Some(BackupMode::MirrorTree),
            _ => None,
        }
    }

    /// Archive and incremental modes index the target and deduplicate.
    pub fn uses_rules(&self) -> bool {
        !matches!(self, BackupMode::MirrorTree)
    }
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Policy for a destination path that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Append `_1`, `_2`, ... to the file stem
    #[default]
    RenameCounter,
    /// Replace the existing file
    Overwrite,
    /// Leave the existing file and skip the source
    Skip,
    /// Append the first 12 hex characters of the content hash
    RenameHash,
    /// Append a `YYYYMMDD_HHMMSS` timestamp
    RenameTime,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::RenameCounter => "rename_counter",
            ConflictStrategy::Overwrite => "overwrite",
            ConflictStrategy::Skip => "skip",
            ConflictStrategy::RenameHash => "rename_hash",
            ConflictStrategy::RenameTime => "rename_time",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "rename_counter" | "rename" | "counter" => Some(ConflictStrategy::RenameCounter),
            "overwrite" => Some(ConflictStrategy::Overwrite),
            "skip" => Some(ConflictStrategy::Skip),
            "rename_hash" | "hash" => Some(ConflictStrategy::RenameHash),
            "rename_time" | "time" => Some(ConflictStrategy::RenameTime),
            _ => None,
        }
    }

    /// True for the strategies that write next to an occupied destination.
    pub fn renames(&self) -> bool {
        matches!(
            self,
            ConflictStrategy::RenameCounter | ConflictStrategy::RenameHash | ConflictStrategy::RenameTime
        )
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How symbolic links among the sources are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymlinkMode {
    /// Ignore symlinked sources
    #[default]
    Skip,
    /// Copy the content the link points at
    Follow,
    /// Recreate the link at the destination
    #[serde(alias = "link")]
    LinkAsSymlink,
}

/// Which part of the target a mirror run may delete from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorDeleteScope {
    /// Only below the mirror subfolder
    #[default]
    SubfolderOnly,
    /// Anywhere in the target tree
    WholeTarget,
    /// Never delete
    NoDelete,
}

/// A placement rule. Every non-empty predicate must hold for the rule to match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    pub enabled: bool,
    pub name: String,
    pub target_folder: String,
    /// Lower-case extensions without the leading dot
    pub extensions: Vec<String>,
    /// Lower-case MIME prefixes such as `image/`
    pub mime_prefixes: Vec<String>,
    /// Regex searched in the file name; an invalid pattern never matches
    pub name_regex: String,
    /// Case-insensitive substring of the full source path
    pub path_contains: String,
    /// Minimum size in bytes (0 = unset)
    pub min_size: u64,
    /// Maximum size in bytes (0 = unset)
    pub max_size: u64,
}

impl Default for Rule {
    fn default() -> Self {
        Rule {
            enabled: true,
            name: "Rule".to_string(),
            target_folder: MISC_FOLDER.to_string(),
            extensions: Vec::new(),
            mime_prefixes: Vec::new(),
            name_regex: String::new(),
            path_contains: String::new(),
            min_size: 0,
            max_size: 0,
        }
    }
}

impl Rule {
    /// Shorthand used by the built-in rule set.
    pub fn new(name: &str, target_folder: &str, extensions: &[&str], mime_prefixes: &[&str]) -> Self {
        Rule {
            name: name.to_string(),
            target_folder: target_folder.to_string(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            mime_prefixes: mime_prefixes.iter().map(|m| m.to_string()).collect(),
            ..Rule::default()
        }
    }
}

/// Built-in rules used whenever a profile has none.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            "Images",
            "images",
            &["jpg", "jpeg", "png", "gif", "webp", "heic", "tiff"],
            &["image/"],
        ),
        Rule::new("Videos", "videos", &["mp4", "mov", "mkv", "avi", "webm"], &["video/"]),
        Rule::new(
            "Audio",
            "audio",
            &["mp3", "wav", "flac", "m4a", "aac", "ogg"],
            &["audio/"],
        ),
        Rule::new(
            "Documents",
            "documents",
            &["pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "txt", "md"],
            &[],
        ),
        Rule::new("Archives", "archives", &["zip", "7z", "rar", "tar", "gz", "bz2", "xz"], &[]),
        Rule::new(
            "Code",
            "code",
            &["py", "js", "ts", "json", "yaml", "yml", "toml", "ini", "sh", "bat"],
            &[],
        ),
        Rule::new("Everything else", MISC_FOLDER, &[], &[]),
    ]
}

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PerformanceOptions {
    pub hash_threads: usize,
    pub copy_threads: usize,
    pub hash_chunk_mb: usize,
}

impl PerformanceOptions {
    pub const MAX_HASH_THREADS: usize = 64;
    pub const MAX_COPY_THREADS: usize = 16;
    pub const MAX_CHUNK_MB: usize = 64;

    /// Clamp every field into its supported range.
    pub fn clamped(self) -> Self {
        PerformanceOptions {
            hash_threads: self.hash_threads.clamp(1, Self::MAX_HASH_THREADS),
            copy_threads: self.copy_threads.clamp(1, Self::MAX_COPY_THREADS),
            hash_chunk_mb: self.hash_chunk_mb.clamp(1, Self::MAX_CHUNK_MB),
        }
    }

    pub fn hash_chunk_bytes(&self) -> usize {
        self.hash_chunk_mb.clamp(1, Self::MAX_CHUNK_MB) * 1024 * 1024
    }

    /// Number of hash results allowed in flight at once.
    pub fn hash_window(&self) -> usize {
        std::cmp::max(4, self.hash_threads * 3)
    }
}

impl Default for PerformanceOptions {
    fn default() -> Self {
        PerformanceOptions {
            hash_threads: 4,
            copy_threads: 2,
            hash_chunk_mb: 4,
        }
    }
}

/// Run configuration.
///
/// Read-only during a run except `last_run_utc`, which the engine advances
/// once a non-dry run completes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub mode: BackupMode,
    pub conflict: ConflictStrategy,
    pub symlinks: SymlinkMode,
    pub preserve_metadata: bool,
    /// Re-hash each destination after copying and compare
    pub verify_copies: bool,
    pub hash_algorithm: ChecksumAlgorithm,
    pub mirror_delete_scope: MirrorDeleteScope,
    pub mirror_scope_subdir: String,
    /// Extensions eligible for mirror deletion; empty means all
    pub mirror_delete_ext_whitelist: Vec<String>,
    pub rules: Vec<Rule>,
    pub perf: PerformanceOptions,
    /// Seconds since the Unix epoch of the last completed run
    pub last_run_utc: f64,
}

impl Profile {
    pub fn new(name: &str) -> Self {
        Profile {
            name: name.to_string(),
            ..Profile::default()
        }
    }
}

impl Default for Profile {
    fn default() -> Self {
        Profile {
            id: Uuid::new_v4().simple().to_string(),
            name: "Default".to_string(),
            mode: BackupMode::default(),
            conflict: ConflictStrategy::default(),
            symlinks: SymlinkMode::default(),
            preserve_metadata: true,
            verify_copies: false,
            hash_algorithm: ChecksumAlgorithm::default(),
            mirror_delete_scope: MirrorDeleteScope::default(),
            mirror_scope_subdir: DEFAULT_MIRROR_SUBDIR.to_string(),
            mirror_delete_ext_whitelist: Vec::new(),
            rules: default_rules(),
            perf: PerformanceOptions::default(),
            last_run_utc: 0.0,
        }
    }
}

/// What the engine decided to do with one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Copy,
    Skip,
    Delete,
}

/// A single placement or deletion decision. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanItem {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub action: PlanAction,
    pub reason: String,
}

impl PlanItem {
    pub fn new(source: PathBuf, destination: PathBuf, action: PlanAction, reason: &str) -> Self {
        PlanItem {
            source,
            destination,
            action,
            reason: reason.to_string(),
        }
    }
}

/// Lifecycle of a backup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, not yet started
    Pending,
    /// Counting source files for progress
    Counting,
    /// Hashing existing target content (archive modes only)
    Indexing,
    /// Hashing, placing and copying sources
    Processing,
    /// Removing stale target files (mirror mode only)
    MirrorDeleting,
    /// Finished normally
    Done,
    /// Stopped through the stop handle
    Cancelled,
    /// Aborted by a fatal error
    Failed,
}

impl JobState {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Cancelled | JobState::Failed)
    }
}

/// Named phase transitions reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Index,
    Run,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Index => "index",
            Phase::Run => "run",
            Phase::Done => "done",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggregate counters for one run.
///
/// In a dry run `copied`, `bytes_copied` and `deleted_mirror` count what
/// would have happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub total_sources: usize,
    pub copied: usize,
    pub skipped_duplicates: usize,
    /// Destination already present (Skip strategy, or unchanged mirror copy)
    pub skipped_existing: usize,
    /// Incremental mode: not modified since the last run
    pub skipped_not_modified: usize,
    pub missing_sources: usize,
    pub deleted_mirror: usize,
    pub failed: usize,
    pub bytes_copied: u64,
    pub dry_run: bool,
}
