//! Job orchestration module.
//!
//! This module provides the job lifecycle functions:
//! - Creating a job from a profile, a target folder and a list of sources
//! - Running a job through its phases (count, index, process, mirror delete)
//!
//! Processing runs two bounded worker pools inside one thread scope. Hash
//! workers digest source files; a single consumer on the calling thread
//! drains their results in submission order, reserves hashes and
//! destinations, and hands accepted files to the copy workers. The scope
//! joins every copy before mirror deletion starts.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::checksums::{checksum_bytes, compute_file_checksum, ChecksumValue};
use crate::classify::extension_of;
use crate::error::EngineError;
use crate::fs_ops::{
    copy_file_atomic, copy_symlink, is_partial_path, mtime_secs, renamed_siblings, unique_dest_path,
};
use crate::index::{is_index_file, HashIndex, INDEX_FILE_NAME};
use crate::model::{
    BackupMode, ConflictStrategy, JobState, MirrorDeleteScope, PerformanceOptions, Phase, PlanAction, PlanItem,
    Profile, RunResult, SymlinkMode,
};
use crate::planner::{self, discover_source_files, RulePlanner};
use crate::progress::{ProgressCallback, StopHandle};
use crate::reserve::Reservations;

/// One backup run: its inputs, lifecycle state and result.
#[derive(Debug)]
pub struct BackupJob {
    pub id: Uuid,
    /// Read during the run; `last_run_utc` is advanced on completion
    pub profile: Profile,
    /// Canonical target folder
    pub target_dir: PathBuf,
    pub sources: Vec<PathBuf>,
    pub dry_run: bool,
    pub state: JobState,
    pub result: RunResult,
    /// Message of the fatal error, if the job failed
    pub error: Option<String>,
    pub created_at: SystemTime,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    stop: StopHandle,
}

impl BackupJob {
    /// Handle for stopping the job from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }
}

fn validate_target(target: &Path) -> Result<PathBuf, EngineError> {
    match fs::metadata(target) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            return Err(EngineError::TargetNotDirectory {
                path: target.to_path_buf(),
            })
        }
        Err(_) => {
            return Err(EngineError::TargetNotFound {
                path: target.to_path_buf(),
            })
        }
    }
    fs::canonicalize(target).map_err(|_| EngineError::TargetNotFound {
        path: target.to_path_buf(),
    })
}

/// Create a new backup job.
///
/// # Errors
/// `TargetNotFound` / `TargetNotDirectory` when the target is unusable.
pub fn create_job<P: AsRef<Path>>(
    profile: Profile,
    target_dir: P,
    sources: Vec<PathBuf>,
    dry_run: bool,
) -> Result<BackupJob, EngineError> {
    let target_dir = validate_target(target_dir.as_ref())?;

    Ok(BackupJob {
        id: Uuid::new_v4(),
        profile,
        target_dir,
        sources,
        dry_run,
        state: JobState::Pending,
        result: RunResult {
            dry_run,
            ..RunResult::default()
        },
        error: None,
        created_at: SystemTime::now(),
        start_time: None,
        end_time: None,
        stop: StopHandle::new(),
    })
}

/// Run a job.
///
/// Per-file failures are reported and counted but never stop the job. A
/// stopped job ends `Cancelled` and still returns its partial result.
///
/// # Errors
/// Only job-level failures: the target became unusable, or the hash index
/// could not be opened. The job then ends `Failed`.
pub fn run_job(job: &mut BackupJob, progress: &dyn ProgressCallback) -> Result<RunResult, EngineError> {
    if job.state != JobState::Pending {
        return Err(EngineError::InvalidJobState { state: job.state });
    }

    let started = SystemTime::now();
    job.start_time = Some(started);
    info!(
        "Starting {} job {} ({} sources, dry_run={})",
        job.profile.mode,
        job.id,
        job.sources.len(),
        job.dry_run
    );

    if let Err(e) = execute(job, progress) {
        error!("Job {} failed: {}", job.id, e);
        progress.on_error(&e.to_string());
        job.state = JobState::Failed;
        job.error = Some(e.to_string());
        job.end_time = Some(SystemTime::now());
        progress.on_phase(Phase::Done);
        return Err(e);
    }

    job.state = if job.stop.is_stopped() {
        JobState::Cancelled
    } else {
        JobState::Done
    };
    // Anchored at the run's start so files changed mid-run are picked up next time.
    if job.state == JobState::Done && !job.dry_run {
        job.profile.last_run_utc = started
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
    }
    job.end_time = Some(SystemTime::now());

    let r = &job.result;
    let summary = format!(
        "{}Copied: {}, duplicates skipped: {}, already present: {}, not modified: {}, missing sources: {}, deleted: {}, failed: {}",
        if job.state == JobState::Cancelled { "Cancelled. " } else { "Done. " },
        r.copied,
        r.skipped_duplicates,
        r.skipped_existing,
        r.skipped_not_modified,
        r.missing_sources,
        r.deleted_mirror,
        r.failed
    );
    info!("{}", summary);
    progress.on_message(&summary);
    progress.on_phase(Phase::Done);

    Ok(job.result.clone())
}

fn execute(job: &mut BackupJob, progress: &dyn ProgressCallback) -> Result<(), EngineError> {
    let target = validate_target(&job.target_dir)?;
    let index_path = target.join(INDEX_FILE_NAME);
    let index = if job.dry_run {
        HashIndex::open_read_only(&index_path)?
    } else {
        HashIndex::open(&index_path)?
    };

    let mut ctx = RunContext::new(&job.profile, &target, &job.sources, job.dry_run, progress, &job.stop, index);

    job.state = JobState::Counting;
    ctx.count_sources(&job.sources);

    if job.profile.mode.uses_rules() && !job.stop.is_stopped() {
        job.state = JobState::Indexing;
        ctx.index_target();
    }

    if !job.stop.is_stopped() {
        job.state = JobState::Processing;
        let keep = ctx.process_sources(&job.sources);

        if job.profile.mode == BackupMode::MirrorTree
            && job.profile.mirror_delete_scope != MirrorDeleteScope::NoDelete
            && !job.stop.is_stopped()
        {
            job.state = JobState::MirrorDeleting;
            ctx.delete_stale(&keep);
        }
    }

    job.result = ctx.finish();
    Ok(())
}

type HashReply = Option<Result<ChecksumValue, EngineError>>;

struct HashTask {
    source: PathBuf,
    reply: Sender<HashReply>,
}

struct PendingHash {
    source: PathBuf,
    size: u64,
    reply: Receiver<HashReply>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyKind {
    File,
    Link,
}

struct CopyTask {
    source: PathBuf,
    destination: PathBuf,
    size: u64,
    /// Reserved content hash; `None` for recreated links
    hash: Option<ChecksumValue>,
    kind: CopyKind,
}

/// State shared by the consumer and both worker pools for one run.
struct RunContext<'a> {
    profile: &'a Profile,
    perf: PerformanceOptions,
    target: &'a Path,
    mirror_root: PathBuf,
    source_roots: Vec<PathBuf>,
    dry_run: bool,
    progress: &'a dyn ProgressCallback,
    stop: &'a StopHandle,
    planner: RulePlanner,
    reservations: Reservations,
    index: Mutex<HashIndex>,
    tally: Mutex<RunResult>,
    processed: AtomicUsize,
    total: usize,
}

impl<'a> RunContext<'a> {
    fn new(
        profile: &'a Profile,
        target: &'a Path,
        sources: &[PathBuf],
        dry_run: bool,
        progress: &'a dyn ProgressCallback,
        stop: &'a StopHandle,
        index: HashIndex,
    ) -> Self {
        let mirror_root = match profile.mirror_delete_scope {
            MirrorDeleteScope::WholeTarget => target.to_path_buf(),
            _ => planner::mirror_root(target, &profile.mirror_scope_subdir),
        };
        RunContext {
            profile,
            perf: profile.perf.clamped(),
            target,
            mirror_root,
            source_roots: planner::source_roots(sources),
            dry_run,
            progress,
            stop,
            planner: RulePlanner::new(&profile.rules),
            reservations: Reservations::new(),
            index: Mutex::new(index),
            tally: Mutex::new(RunResult {
                dry_run,
                ..RunResult::default()
            }),
            processed: AtomicUsize::new(0),
            total: 0,
        }
    }

    fn lock_index(&self) -> MutexGuard<'_, HashIndex> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tally(&self, update: impl FnOnce(&mut RunResult)) {
        let mut result = self.tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut result);
    }

    fn tick(&self) {
        let current = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        self.progress.on_progress(current, self.total);
    }

    fn emit(&self, item: PlanItem) {
        debug!(
            "{:?} {} -> {} ({})",
            item.action,
            item.source.display(),
            item.destination.display(),
            item.reason
        );
        self.progress.on_item(&item);
    }

    fn fail(&self, err: &EngineError) {
        warn!(os_error = ?err.raw_os_error(), "{}", err);
        self.tally(|r| r.failed += 1);
        self.progress.on_error(&err.to_string());
    }

    fn inside_target(&self, path: &Path) -> bool {
        path.starts_with(self.target)
    }

    // Counting

    fn count_sources(&mut self, sources: &[PathBuf]) {
        let mut missing = 0;
        for source in sources {
            if fs::symlink_metadata(source).is_err() {
                missing += 1;
                self.progress
                    .on_message(&format!("Skipped missing source: {}", source.display()));
            }
        }

        let total = discover_source_files(sources, self.profile.symlinks)
            .take_while(|_| !self.stop.is_stopped())
            .filter(|p| !self.inside_target(p))
            .count();

        self.total = total;
        self.tally(|r| {
            r.total_sources = total;
            r.missing_sources = missing;
        });
        info!("Counted {} source files ({} missing inputs)", total, missing);
        self.progress.on_progress(0, total);
    }

    // Indexing

    fn index_target(&self) {
        self.progress.on_phase(Phase::Index);
        self.progress.on_message("Indexing existing files in target...");

        let algorithm = self.profile.hash_algorithm;
        let chunk = self.perf.hash_chunk_bytes();
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut index = self.lock_index();
        let mut reused = 0usize;

        for entry in WalkDir::new(self.target).follow_links(false) {
            if self.stop.is_stopped() {
                info!("Indexing interrupted; keeping index records as they are");
                return;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable target entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if is_index_file(path) || is_partial_path(path) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("Cannot stat {}: {}", path.display(), e);
                    continue;
                }
            };
            seen.insert(path.to_path_buf());

            let (size, mtime) = (metadata.len(), mtime_secs(&metadata));
            let cached = match index.get(path) {
                Ok(record) => record.filter(|r| r.matches(size, mtime) && r.hash.algorithm() == algorithm),
                Err(e) => {
                    warn!("Index lookup failed for {}: {}", path.display(), e);
                    None
                }
            };

            let hash = match cached {
                Some(record) => {
                    reused += 1;
                    record.hash
                }
                None => match compute_file_checksum(path, algorithm, chunk) {
                    Ok(hash) => {
                        if let Err(e) = index.put(path, size, mtime, &hash) {
                            warn!("Index update failed for {}: {}", path.display(), e);
                        }
                        hash
                    }
                    Err(e) => {
                        self.fail(&e);
                        continue;
                    }
                },
            };
            self.reservations.insert_known(hash.hex(), path);
        }

        match index.reconcile(&seen) {
            Ok(removed) if removed > 0 => info!("Dropped {} stale index records", removed),
            Ok(_) => {}
            Err(e) => warn!("Index reconcile failed: {}", e),
        }
        if let Err(e) = index.flush() {
            warn!("Index flush failed: {}", e);
        }

        let unique = self.reservations.known_len();
        info!(
            "Indexed {} target files ({} from cache, {} unique)",
            seen.len(),
            reused,
            unique
        );
        self.progress
            .on_message(&format!("Index ready: {} unique files in target", unique));
    }

    // Processing

    fn process_sources(&self, sources: &[PathBuf]) -> HashSet<PathBuf> {
        self.progress.on_phase(Phase::Run);
        let mut keep = HashSet::new();

        thread::scope(|scope| {
            let (hash_tx, hash_rx) = bounded::<HashTask>(self.perf.hash_window());
            let (copy_tx, copy_rx) = bounded::<CopyTask>(self.perf.copy_threads * 4);

            for _ in 0..self.perf.hash_threads {
                let queue = hash_rx.clone();
                scope.spawn(move || self.hash_worker(queue));
            }
            for _ in 0..self.perf.copy_threads {
                let queue = copy_rx.clone();
                scope.spawn(move || self.copy_worker(queue));
            }
            drop(hash_rx);
            drop(copy_rx);

            self.feed(sources, &hash_tx, &copy_tx, &mut keep);
            // Dropping the senders here ends both pools; the scope joins them.
        });

        keep
    }

    fn feed(
        &self,
        sources: &[PathBuf],
        hash_tx: &Sender<HashTask>,
        copy_tx: &Sender<CopyTask>,
        keep: &mut HashSet<PathBuf>,
    ) {
        let window = self.perf.hash_window();
        let mut pending: VecDeque<PendingHash> = VecDeque::with_capacity(window);
        let incremental = self.profile.mode == BackupMode::IncrementalRules;

        for source in discover_source_files(sources, self.profile.symlinks) {
            if self.stop.is_stopped() {
                break;
            }
            if self.inside_target(&source) {
                debug!("Ignoring source inside target: {}", source.display());
                continue;
            }

            let metadata = match fs::symlink_metadata(&source) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    if self.profile.symlinks == SymlinkMode::LinkAsSymlink {
                        self.place_link(&source, copy_tx, keep);
                        self.tick();
                        continue;
                    }
                    fs::metadata(&source)
                }
                other => other,
            };
            let metadata = match metadata {
                Ok(metadata) => metadata,
                Err(e) => {
                    self.fail(&EngineError::ReadError { path: source, source: e });
                    self.tick();
                    continue;
                }
            };

            if incremental && mtime_secs(&metadata) <= self.profile.last_run_utc {
                self.tally(|r| r.skipped_not_modified += 1);
                self.emit(PlanItem::new(source, PathBuf::new(), PlanAction::Skip, "not modified"));
                self.tick();
                continue;
            }

            while pending.len() >= window {
                if let Some(next) = pending.pop_front() {
                    self.resolve_hash(next, copy_tx, keep);
                }
            }

            let (reply_tx, reply_rx) = bounded(1);
            let task = HashTask {
                source: source.clone(),
                reply: reply_tx,
            };
            if hash_tx.send(task).is_err() {
                break;
            }
            pending.push_back(PendingHash {
                source,
                size: metadata.len(),
                reply: reply_rx,
            });
        }

        while let Some(next) = pending.pop_front() {
            self.resolve_hash(next, copy_tx, keep);
        }
    }

    fn hash_worker(&self, queue: Receiver<HashTask>) {
        let algorithm = self.profile.hash_algorithm;
        let chunk = self.perf.hash_chunk_bytes();
        for task in queue {
            let outcome = if self.stop.is_stopped() {
                None
            } else {
                Some(compute_file_checksum(&task.source, algorithm, chunk))
            };
            let _ = task.reply.send(outcome);
        }
    }

    fn resolve_hash(&self, pending: PendingHash, copy_tx: &Sender<CopyTask>, keep: &mut HashSet<PathBuf>) {
        match pending.reply.recv() {
            Ok(Some(Ok(hash))) => {
                if self.stop.is_stopped() {
                    return;
                }
                self.place(pending.source, pending.size, hash, copy_tx, keep);
            }
            Ok(Some(Err(e))) => self.fail(&e),
            // Skipped after a stop request.
            Ok(None) | Err(_) => return,
        }
        self.tick();
    }

    fn mirror_destination(&self, source: &Path) -> PathBuf {
        planner::mirror_destination(&self.mirror_root, &self.source_roots, source).unwrap_or_else(|_| {
            self.mirror_root
                .join(source.file_name().unwrap_or(source.as_os_str()))
        })
    }

    fn place(
        &self,
        source: PathBuf,
        size: u64,
        hash: ChecksumValue,
        copy_tx: &Sender<CopyTask>,
        keep: &mut HashSet<PathBuf>,
    ) {
        let conflict = self.profile.conflict;
        let uses_rules = self.profile.mode.uses_rules();

        let desired = if uses_rules {
            if !self.reservations.claim_hash(hash.hex()) {
                let existing = self.reservations.known_path(hash.hex()).unwrap_or_default();
                self.tally(|r| r.skipped_duplicates += 1);
                self.emit(PlanItem::new(source, existing, PlanAction::Skip, "duplicate"));
                return;
            }
            self.planner.classify_destination(self.target, &source, size)
        } else {
            self.mirror_destination(&source)
        };

        if conflict == ConflictStrategy::Skip && entry_exists(&desired) {
            if uses_rules {
                self.reservations.release_hash(hash.hex());
            } else {
                keep.insert(desired.clone());
            }
            self.tally(|r| r.skipped_existing += 1);
            self.emit(PlanItem::new(source, desired, PlanAction::Skip, "exists"));
            return;
        }

        // Mirror: content already at its path, or at a name an earlier run
        // renamed it to, stays where it is. A stale file at `desired` is only
        // kept when some source lands there.
        if !uses_rules {
            let existing = self.find_existing_copy(&desired, |p| self.is_unchanged_copy(p, size, &hash));
            if let Some(existing) = existing {
                keep.insert(existing.clone());
                self.tally(|r| r.skipped_existing += 1);
                self.emit(PlanItem::new(source, existing, PlanAction::Skip, "unchanged"));
                return;
            }
        }

        let resolved = unique_dest_path(&desired, conflict, &hash);
        let destination = self.reservations.claim_destination(&desired, resolved);
        if !uses_rules {
            keep.insert(destination.clone());
        }

        let reason = if destination != desired {
            "renamed"
        } else if entry_exists(&desired) {
            "overwrite"
        } else {
            "new"
        };
        self.emit(PlanItem::new(source.clone(), destination.clone(), PlanAction::Copy, reason));
        self.dispatch(
            CopyTask {
                source,
                destination,
                size,
                hash: Some(hash),
                kind: CopyKind::File,
            },
            copy_tx,
        );
    }

    /// Links are placed by name only: no hashing, no deduplication.
    fn place_link(&self, source: &Path, copy_tx: &Sender<CopyTask>, keep: &mut HashSet<PathBuf>) {
        let conflict = self.profile.conflict;
        let uses_rules = self.profile.mode.uses_rules();
        let desired = if uses_rules {
            self.planner.classify_destination(self.target, source, 0)
        } else {
            self.mirror_destination(source)
        };

        if conflict == ConflictStrategy::Skip && entry_exists(&desired) {
            if !uses_rules {
                keep.insert(desired.clone());
            }
            self.tally(|r| r.skipped_existing += 1);
            self.emit(PlanItem::new(source.to_path_buf(), desired, PlanAction::Skip, "exists"));
            return;
        }
        if let Some(existing) = self.find_existing_copy(&desired, |p| same_link(source, p)) {
            if !uses_rules {
                keep.insert(existing.clone());
            }
            self.tally(|r| r.skipped_existing += 1);
            self.emit(PlanItem::new(source.to_path_buf(), existing, PlanAction::Skip, "unchanged"));
            return;
        }

        let identity = checksum_bytes(source.to_string_lossy().as_bytes(), self.profile.hash_algorithm);
        let resolved = unique_dest_path(&desired, conflict, &identity);
        let destination = self.reservations.claim_destination(&desired, resolved);
        if !uses_rules {
            keep.insert(destination.clone());
        }

        self.emit(PlanItem::new(
            source.to_path_buf(),
            destination.clone(),
            PlanAction::Copy,
            "symlink",
        ));
        self.dispatch(
            CopyTask {
                source: source.to_path_buf(),
                destination,
                size: 0,
                hash: None,
                kind: CopyKind::Link,
            },
            copy_tx,
        );
    }

    /// First of `desired` and, under a rename strategy, its renamed siblings
    /// that `holds` accepts and no other file claimed this run. The returned
    /// path is claimed.
    fn find_existing_copy(&self, desired: &Path, holds: impl Fn(&Path) -> bool) -> Option<PathBuf> {
        let mut candidates = vec![desired.to_path_buf()];
        if self.profile.conflict.renames() {
            candidates.extend(renamed_siblings(desired));
        }
        candidates
            .into_iter()
            .find(|candidate| holds(candidate) && self.reservations.claim_path(candidate))
    }

    /// True when `dest` is a regular file whose content equals `hash`.
    fn is_unchanged_copy(&self, dest: &Path, size: u64, hash: &ChecksumValue) -> bool {
        let metadata = match fs::symlink_metadata(dest) {
            Ok(metadata) if metadata.is_file() && metadata.len() == size => metadata,
            _ => return false,
        };
        let mtime = mtime_secs(&metadata);

        let cached = self
            .lock_index()
            .get(dest)
            .ok()
            .flatten()
            .filter(|r| r.matches(size, mtime) && r.hash.algorithm() == hash.algorithm());
        if let Some(record) = cached {
            return record.hash == *hash;
        }

        match compute_file_checksum(dest, hash.algorithm(), self.perf.hash_chunk_bytes()) {
            Ok(existing) => {
                if let Err(e) = self.lock_index().put(dest, size, mtime, &existing) {
                    warn!("Index update failed for {}: {}", dest.display(), e);
                }
                existing == *hash
            }
            Err(e) => {
                debug!("Cannot hash existing destination {}: {}", dest.display(), e);
                false
            }
        }
    }

    fn dispatch(&self, task: CopyTask, copy_tx: &Sender<CopyTask>) {
        if self.dry_run {
            self.tally(|r| {
                r.copied += 1;
                r.bytes_copied += task.size;
            });
            return;
        }
        if let Err(rejected) = copy_tx.send(task) {
            let task = rejected.into_inner();
            if let Some(hash) = &task.hash {
                self.reservations.release_hash(hash.hex());
            }
            self.fail(&EngineError::Unknown {
                message: format!("copy queue closed before {}", task.source.display()),
            });
        }
    }

    fn copy_worker(&self, queue: Receiver<CopyTask>) {
        for task in queue {
            // Drain without starting new copies once stopped.
            if self.stop.is_stopped() {
                continue;
            }
            match self.copy_one(&task) {
                Ok(bytes) => {
                    self.tally(|r| {
                        r.copied += 1;
                        r.bytes_copied += bytes;
                    });
                    if let Some(hash) = &task.hash {
                        self.reservations.record_copied(hash.hex(), &task.destination);
                    }
                    self.progress.on_message(&format!(
                        "Copied: {} -> {}",
                        task.source.display(),
                        task.destination.display()
                    ));
                }
                Err(e) => {
                    if let Some(hash) = &task.hash {
                        self.reservations.release_hash(hash.hex());
                    }
                    self.fail(&e);
                }
            }
        }
    }

    fn copy_one(&self, task: &CopyTask) -> Result<u64, EngineError> {
        let hash = match (&task.hash, task.kind) {
            (Some(hash), CopyKind::File) => hash,
            _ => {
                copy_symlink(&task.source, &task.destination)?;
                return Ok(0);
            }
        };

        let bytes = copy_file_atomic(&task.source, &task.destination, self.profile.preserve_metadata)?;

        if self.profile.verify_copies {
            let written = compute_file_checksum(&task.destination, hash.algorithm(), self.perf.hash_chunk_bytes())?;
            if written != *hash {
                let _ = fs::remove_file(&task.destination);
                return Err(EngineError::ChecksumMismatch {
                    path: task.destination.clone(),
                });
            }
        }

        match fs::metadata(&task.destination) {
            Ok(metadata) => {
                let put = self
                    .lock_index()
                    .put(&task.destination, metadata.len(), mtime_secs(&metadata), hash);
                if let Err(e) = put {
                    warn!("Index update failed for {}: {}", task.destination.display(), e);
                }
            }
            Err(e) => warn!("Cannot stat new copy {}: {}", task.destination.display(), e),
        }
        Ok(bytes)
    }

    // Mirror deletion

    fn delete_stale(&self, keep: &HashSet<PathBuf>) {
        let root = match self.profile.mirror_delete_scope {
            MirrorDeleteScope::WholeTarget => self.target.to_path_buf(),
            MirrorDeleteScope::SubfolderOnly => self.mirror_root.clone(),
            MirrorDeleteScope::NoDelete => return,
        };
        if !root.is_dir() {
            return;
        }
        info!("Removing stale mirror files under {}", root.display());

        let whitelist: Vec<String> = self
            .profile
            .mirror_delete_ext_whitelist
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();

        for entry in WalkDir::new(&root).follow_links(false) {
            if self.stop.is_stopped() {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry during mirror cleanup: {}", e);
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            if is_index_file(path) || keep.contains(path) {
                continue;
            }
            if !whitelist.is_empty() && !whitelist.contains(&extension_of(path)) {
                continue;
            }

            self.emit(PlanItem::new(
                PathBuf::new(),
                path.to_path_buf(),
                PlanAction::Delete,
                "not in sources",
            ));
            if self.dry_run {
                self.tally(|r| r.deleted_mirror += 1);
                continue;
            }
            match fs::remove_file(path) {
                Ok(()) => {
                    self.tally(|r| r.deleted_mirror += 1);
                    if let Err(e) = self.lock_index().remove(path) {
                        warn!("Index removal failed for {}: {}", path.display(), e);
                    }
                    self.progress.on_message(&format!("Deleted: {}", path.display()));
                }
                Err(e) => self.fail(&EngineError::WriteError {
                    path: path.to_path_buf(),
                    source: e,
                }),
            }
        }
    }

    fn finish(self) -> RunResult {
        let index = self.index.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = index.close() {
            warn!("Failed to close hash index: {}", e);
        }
        self.tally.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exists on disk, counting dangling links.
fn entry_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn same_link(source: &Path, dest: &Path) -> bool {
    match (fs::read_link(source), fs::read_link(dest)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
