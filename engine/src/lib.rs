//! # backsort engine - sorting backup library
//!
//! A headless engine that files an arbitrary set of source files and folders
//! into a managed target tree. Designed as the foundation for multiple front
//! ends (CLI, GUI, automation).
//!
//! ## Overview
//!
//! Three placement modes are supported:
//! - Archive: files are sorted into folders by ordered rules, and content
//!   already present in the target is never copied twice
//! - Incremental: archive, restricted to files modified since the last run
//! - Mirror: the source tree is reproduced, and target files absent from the
//!   sources may be deleted within a configurable scope
//!
//! A per-target SQLite index caches content hashes so repeated runs do not
//! re-hash unchanged files. Copies are atomic (`.partial` sibling + rename).
//!
//! ## Basic Usage
//!
//! ```no_run
//! use backsort_engine::{create_job, run_job, Profile, SilentProgress};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut job = create_job(
//!     Profile::default(),
//!     "/mnt/backup",
//!     vec![PathBuf::from("/home/me/Pictures")],
//!     false,
//! )?;
//!
//! let result = run_job(&mut job, &SilentProgress)?;
//! println!("Copied {} files, skipped {} duplicates", result.copied, result.skipped_duplicates);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Run configuration and result types (Profile, Rule, RunResult)
//! - **config**: Lenient JSON load/save of profiles
//! - **error**: Error types and handling
//! - **checksums**: Streaming content hashes
//! - **classify**: Extension, MIME and folder-name helpers
//! - **fs_ops**: Atomic copy, symlinks, conflict-free destination paths
//! - **index**: Persistent per-target hash cache
//! - **planner**: Destination placement and source discovery
//! - **reserve**: Run-wide hash and path reservations
//! - **job**: Job orchestration (create, run)
//! - **progress**: Progress callback trait and cancellation handle

pub mod checksums;
pub mod classify;
pub mod config;
pub mod error;
pub mod fs_ops;
pub mod index;
pub mod job;
pub mod model;
pub mod planner;
pub mod progress;
pub mod reserve;

// Re-export main types and functions
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use config::{load_config, save_config, AppConfig};
pub use error::EngineError;
pub use index::{HashIndex, IndexRecord, INDEX_FILE_NAME};
pub use job::{create_job, run_job, BackupJob};
pub use model::{
    default_rules, BackupMode, ConflictStrategy, JobState, MirrorDeleteScope, PerformanceOptions, Phase,
    PlanAction, PlanItem, Profile, Rule, RunResult, SymlinkMode,
};
pub use planner::{classify_destination, discover_source_files, mirror_destination};
pub use progress::{ChannelProgress, ProgressCallback, ProgressEvent, SilentProgress, StopHandle};
