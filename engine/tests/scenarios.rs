//! End-to-end runs against real temporary directories.

use backsort_engine::index::is_index_file;
use backsort_engine::{
    checksums::checksum_bytes, create_job, run_job, BackupMode, ChannelProgress, ChecksumAlgorithm, ConflictStrategy,
    JobState, MirrorDeleteScope, PlanAction, Profile, ProgressCallback, ProgressEvent, RunResult, SilentProgress,
    StopHandle, INDEX_FILE_NAME,
};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

struct Fixture {
    _temp_dir: tempfile::TempDir,
    src: PathBuf,
    dst: PathBuf,
}

fn fixture() -> Fixture {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let src = temp_dir.path().join("src");
    let dst = temp_dir.path().join("dst");
    fs::create_dir(&src).expect("Failed to create src dir");
    fs::create_dir(&dst).expect("Failed to create dst dir");
    Fixture {
        _temp_dir: temp_dir,
        src,
        dst,
    }
}

fn write(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    fs::write(path, content).expect("Failed to write file");
}

/// Files under `root`, relative and sorted, without the hash index.
fn list_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| !e.file_type().is_dir())
        .filter(|e| !is_index_file(e.path()))
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .expect("walked path is under root")
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    files.sort();
    files
}

fn run(profile: Profile, dst: &Path, sources: Vec<PathBuf>, dry_run: bool) -> (RunResult, Profile) {
    let mut job = create_job(profile, dst, sources, dry_run).expect("Failed to create job");
    let result = run_job(&mut job, &SilentProgress).expect("Failed to run job");
    assert_eq!(job.state, JobState::Done);
    (result, job.profile)
}

fn mirror_profile(scope: MirrorDeleteScope) -> Profile {
    let mut profile = Profile::new("Mirror");
    profile.mode = BackupMode::MirrorTree;
    profile.mirror_delete_scope = scope;
    profile
}

#[test]
fn identical_images_are_copied_once() {
    let f = fixture();
    let content: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| (i % 253) as u8).collect();
    write(&f.src.join("a.jpg"), &content);
    write(&f.src.join("b.jpg"), &content);

    let (result, _) = run(Profile::default(), &f.dst, vec![f.src.clone()], false);

    assert_eq!(result.copied, 1);
    assert_eq!(result.skipped_duplicates, 1);
    assert_eq!(result.bytes_copied, content.len() as u64);

    let files = list_files(&f.dst);
    assert_eq!(files.len(), 1);
    assert!(files[0] == "images/a.jpg" || files[0] == "images/b.jpg");

    let copied = fs::read(f.dst.join(&files[0])).expect("read copy");
    assert_eq!(
        checksum_bytes(&copied, ChecksumAlgorithm::Sha256),
        checksum_bytes(&content, ChecksumAlgorithm::Sha256)
    );
}

#[test]
fn second_archive_run_copies_nothing() {
    let f = fixture();
    write(&f.src.join("photos/x.png"), b"png data");
    write(&f.src.join("docs/readme.md"), b"# readme");
    write(&f.src.join("docs/copy-of-x.png"), b"png data");

    let (first, profile) = run(Profile::default(), &f.dst, vec![f.src.clone()], false);
    assert_eq!(first.copied, 2);
    assert_eq!(first.skipped_duplicates, 1);

    let before = list_files(&f.dst);
    let (second, _) = run(profile, &f.dst, vec![f.src.clone()], false);
    assert_eq!(second.copied, 0);
    assert_eq!(second.skipped_duplicates, 3);
    assert_eq!(list_files(&f.dst), before);
}

#[test]
fn content_already_in_target_is_not_copied() {
    let f = fixture();
    write(&f.dst.join("old/archive.zip"), b"zip bytes");
    write(&f.src.join("renamed.zip"), b"zip bytes");

    let (result, _) = run(Profile::default(), &f.dst, vec![f.src.clone()], false);
    assert_eq!(result.copied, 0);
    assert_eq!(result.skipped_duplicates, 1);
    assert!(!f.dst.join("archives").exists());
}

#[test]
fn mirror_subfolder_scope_deletes_only_inside_subfolder() {
    let f = fixture();
    write(&f.src.join("keep.txt"), b"keep");
    write(&f.dst.join("mirror/old.txt"), b"old");
    write(&f.dst.join("outside.txt"), b"outside");

    let (result, _) = run(
        mirror_profile(MirrorDeleteScope::SubfolderOnly),
        &f.dst,
        vec![f.src.clone()],
        false,
    );

    assert_eq!(result.copied, 1);
    assert_eq!(result.deleted_mirror, 1);
    assert!(f.dst.join("mirror/keep.txt").exists());
    assert!(!f.dst.join("mirror/old.txt").exists());
    assert!(f.dst.join("outside.txt").exists());
}

#[test]
fn mirror_whole_target_matches_sources_exactly() {
    let f = fixture();
    write(&f.src.join("a.txt"), b"a");
    write(&f.src.join("sub/b.bin"), b"b");
    write(&f.dst.join("stray.txt"), b"stray");
    write(&f.dst.join("deep/er/other.bin"), b"other");

    let (result, _) = run(
        mirror_profile(MirrorDeleteScope::WholeTarget),
        &f.dst,
        vec![f.src.clone()],
        false,
    );

    assert_eq!(result.copied, 2);
    assert_eq!(result.deleted_mirror, 2);
    assert_eq!(list_files(&f.dst), vec!["a.txt", "sub/b.bin"]);
    assert!(f.dst.join(INDEX_FILE_NAME).exists());
}

#[test]
fn mirror_no_delete_scope_keeps_everything() {
    let f = fixture();
    write(&f.src.join("new.txt"), b"new");
    write(&f.dst.join("mirror/old.txt"), b"old");

    let (result, _) = run(
        mirror_profile(MirrorDeleteScope::NoDelete),
        &f.dst,
        vec![f.src.clone()],
        false,
    );

    assert_eq!(result.deleted_mirror, 0);
    assert_eq!(list_files(&f.dst), vec!["mirror/new.txt", "mirror/old.txt"]);
}

#[test]
fn mirror_whitelist_limits_deletions() {
    let f = fixture();
    write(&f.src.join("keep.txt"), b"keep");
    write(&f.dst.join("mirror/scratch.tmp"), b"tmp");
    write(&f.dst.join("mirror/precious.doc"), b"doc");

    let mut profile = mirror_profile(MirrorDeleteScope::SubfolderOnly);
    profile.mirror_delete_ext_whitelist = vec!["tmp".to_string()];
    let (result, _) = run(profile, &f.dst, vec![f.src.clone()], false);

    assert_eq!(result.deleted_mirror, 1);
    assert_eq!(list_files(&f.dst), vec!["mirror/keep.txt", "mirror/precious.doc"]);
}

#[test]
fn mirror_rerun_is_idempotent() {
    let f = fixture();
    write(&f.src.join("a.txt"), b"a");
    write(&f.src.join("nested/b.txt"), b"b");

    let profile = mirror_profile(MirrorDeleteScope::SubfolderOnly);
    let (first, profile) = run(profile, &f.dst, vec![f.src.clone()], false);
    assert_eq!(first.copied, 2);

    let (second, _) = run(profile, &f.dst, vec![f.src.clone()], false);
    assert_eq!(second.copied, 0);
    assert_eq!(second.skipped_existing, 2);
    assert_eq!(second.deleted_mirror, 0);
    assert_eq!(list_files(&f.dst), vec!["mirror/a.txt", "mirror/nested/b.txt"]);
}

#[test]
fn mirror_settles_after_source_edit() {
    let f = fixture();
    write(&f.src.join("keep.txt"), b"first version");

    let profile = mirror_profile(MirrorDeleteScope::SubfolderOnly);
    let (first, profile) = run(profile, &f.dst, vec![f.src.clone()], false);
    assert_eq!(first.copied, 1);

    write(&f.src.join("keep.txt"), b"second, longer version");

    // The edit lands under a counter name and the outdated copy goes.
    let (edited, profile) = run(profile, &f.dst, vec![f.src.clone()], false);
    assert_eq!(edited.copied, 1);
    assert_eq!(edited.deleted_mirror, 1);
    assert_eq!(list_files(&f.dst), vec!["mirror/keep_1.txt"]);

    for _ in 0..2 {
        let (rerun, _) = run(profile.clone(), &f.dst, vec![f.src.clone()], false);
        assert_eq!(rerun.copied, 0);
        assert_eq!(rerun.skipped_existing, 1);
        assert_eq!(rerun.deleted_mirror, 0);
        assert_eq!(list_files(&f.dst), vec!["mirror/keep_1.txt"]);
    }
    assert_eq!(
        fs::read(f.dst.join("mirror/keep_1.txt")).expect("read copy"),
        b"second, longer version"
    );
}

#[test]
fn mirror_with_outdated_copy_in_target_settles() {
    let f = fixture();
    write(&f.dst.join("mirror/keep.txt"), b"old");
    write(&f.src.join("keep.txt"), b"new");

    let profile = mirror_profile(MirrorDeleteScope::SubfolderOnly);
    let (first, profile) = run(profile, &f.dst, vec![f.src.clone()], false);
    assert_eq!(first.copied, 1);
    assert_eq!(first.deleted_mirror, 1);

    let (second, _) = run(profile, &f.dst, vec![f.src.clone()], false);
    assert_eq!(second.copied, 0);
    assert_eq!(second.deleted_mirror, 0);
    assert_eq!(list_files(&f.dst), vec!["mirror/keep_1.txt"]);
}

#[test]
fn whole_target_mirror_with_hash_names_settles_after_edit() {
    let f = fixture();
    write(&f.src.join("a.txt"), b"a one");
    write(&f.src.join("b.txt"), b"b");

    let mut profile = mirror_profile(MirrorDeleteScope::WholeTarget);
    profile.conflict = ConflictStrategy::RenameHash;
    let (_, profile) = run(profile, &f.dst, vec![f.src.clone()], false);
    assert_eq!(list_files(&f.dst), vec!["a.txt", "b.txt"]);

    write(&f.src.join("a.txt"), b"a two");
    let (edited, profile) = run(profile, &f.dst, vec![f.src.clone()], false);
    assert_eq!(edited.copied, 1);
    assert_eq!(edited.skipped_existing, 1);
    assert_eq!(edited.deleted_mirror, 1);

    let short = checksum_bytes(b"a two", ChecksumAlgorithm::Sha256).short(12).to_string();
    let expected = vec![format!("a_{}.txt", short), "b.txt".to_string()];
    assert_eq!(list_files(&f.dst), expected);

    let (rerun, _) = run(profile, &f.dst, vec![f.src.clone()], false);
    assert_eq!(rerun.copied, 0);
    assert_eq!(rerun.deleted_mirror, 0);
    assert_eq!(list_files(&f.dst), expected);
}

#[test]
fn dry_run_predicts_mirror_run_after_source_edit() {
    let f = fixture();
    write(&f.src.join("notes.txt"), b"draft");
    write(&f.src.join("same.txt"), b"same");

    let profile = mirror_profile(MirrorDeleteScope::SubfolderOnly);
    let (_, profile) = run(profile, &f.dst, vec![f.src.clone()], false);
    write(&f.src.join("notes.txt"), b"final draft");

    for _ in 0..2 {
        let before = list_files(&f.dst);
        let (dry, _) = run(profile.clone(), &f.dst, vec![f.src.clone()], true);
        assert_eq!(list_files(&f.dst), before);

        let (real, _) = run(profile.clone(), &f.dst, vec![f.src.clone()], false);
        assert_eq!(dry.copied, real.copied);
        assert_eq!(dry.skipped_existing, real.skipped_existing);
        assert_eq!(dry.deleted_mirror, real.deleted_mirror);
        assert_eq!(dry.bytes_copied, real.bytes_copied);
    }
    assert_eq!(list_files(&f.dst), vec!["mirror/notes_1.txt", "mirror/same.txt"]);
}

#[test]
fn incremental_skips_files_not_modified_since_last_run() {
    let f = fixture();
    let old = f.src.join("old.txt");
    let new = f.src.join("new.txt");
    write(&old, b"old");
    write(&new, b"new");
    filetime::set_file_mtime(&old, filetime::FileTime::from_unix_time(1_000_000_000, 0)).expect("set mtime");
    filetime::set_file_mtime(&new, filetime::FileTime::from_unix_time(1_600_000_000, 0)).expect("set mtime");

    let mut profile = Profile::default();
    profile.mode = BackupMode::IncrementalRules;
    profile.last_run_utc = 1_500_000_000.0;

    let (result, profile) = run(profile, &f.dst, vec![f.src.clone()], false);
    assert_eq!(result.copied, 1);
    assert_eq!(result.skipped_not_modified, 1);
    assert_eq!(list_files(&f.dst), vec!["documents/new.txt"]);
    assert!(profile.last_run_utc > 1_500_000_000.0);

    // Both files are now older than the recorded run.
    let (again, _) = run(profile, &f.dst, vec![f.src.clone()], false);
    assert_eq!(again.copied, 0);
    assert_eq!(again.skipped_not_modified, 2);
}

#[test]
fn dry_run_leaves_target_untouched_and_predicts_real_run() {
    for profile in [Profile::default(), mirror_profile(MirrorDeleteScope::SubfolderOnly)] {
        let f = fixture();
        write(&f.src.join("a.jpg"), b"same");
        write(&f.src.join("b.jpg"), b"same");
        write(&f.src.join("c.pdf"), b"pdf");
        write(&f.src.join("sub/c.pdf"), b"other pdf");
        write(&f.dst.join("mirror/stale.txt"), b"stale");
        let before = list_files(&f.dst);

        let (dry, _) = run(profile.clone(), &f.dst, vec![f.src.clone()], true);
        assert!(dry.dry_run);
        assert_eq!(list_files(&f.dst), before);
        assert!(!f.dst.join(INDEX_FILE_NAME).exists());

        let (real, _) = run(profile, &f.dst, vec![f.src.clone()], false);
        assert_eq!(dry.copied, real.copied);
        assert_eq!(dry.skipped_duplicates, real.skipped_duplicates);
        assert_eq!(dry.skipped_existing, real.skipped_existing);
        assert_eq!(dry.deleted_mirror, real.deleted_mirror);
        assert_eq!(dry.bytes_copied, real.bytes_copied);
    }
}

#[test]
fn plan_items_cover_every_decision() {
    let f = fixture();
    write(&f.src.join("a.txt"), b"dup");
    write(&f.src.join("b.txt"), b"dup");

    let (tx, rx) = crossbeam_channel::unbounded();
    let progress = ChannelProgress::new(tx);
    let mut job = create_job(Profile::default(), &f.dst, vec![f.src.clone()], true).expect("Failed to create job");
    run_job(&mut job, &progress).expect("Failed to run job");

    let items: Vec<_> = rx
        .try_iter()
        .filter_map(|e| match e {
            ProgressEvent::Item(item) => Some(item),
            _ => None,
        })
        .collect();
    assert_eq!(items.len(), 2);
    assert_eq!(items.iter().filter(|i| i.action == PlanAction::Copy).count(), 1);
    assert_eq!(
        items
            .iter()
            .filter(|i| i.action == PlanAction::Skip && i.reason == "duplicate")
            .count(),
        1
    );
}

#[test]
fn corrupt_index_is_rebuilt() {
    let f = fixture();
    write(&f.src.join("a.txt"), b"a");
    write(&f.dst.join(INDEX_FILE_NAME), b"this is not a database at all, just some bytes");

    let (result, _) = run(Profile::default(), &f.dst, vec![f.src.clone()], false);
    assert_eq!(result.copied, 1);
}

/// Stops the job as soon as the first source file has been handled.
struct StopAfterFirst {
    handle: StopHandle,
}

impl ProgressCallback for StopAfterFirst {
    fn on_progress(&self, current: usize, _total: usize) {
        if current >= 1 {
            self.handle.stop();
        }
    }
}

#[test]
fn cancellation_stops_work_and_skips_deletion() {
    let f = fixture();
    for i in 0..60 {
        write(&f.src.join(format!("file_{:02}.txt", i)), format!("content {}", i).as_bytes());
    }
    write(&f.dst.join("stale.txt"), b"stale");

    let mut profile = mirror_profile(MirrorDeleteScope::WholeTarget);
    profile.perf.hash_threads = 2;
    profile.perf.copy_threads = 1;

    let mut job = create_job(profile, &f.dst, vec![f.src.clone()], false).expect("Failed to create job");
    let progress = StopAfterFirst {
        handle: job.stop_handle(),
    };
    let result = run_job(&mut job, &progress).expect("Cancelled run still returns a result");

    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(job.profile.last_run_utc, 0.0);
    assert!(result.copied < 60);
    assert_eq!(result.deleted_mirror, 0);
    assert!(f.dst.join("stale.txt").exists());
    assert!(list_files(&f.dst).iter().all(|p| !p.ends_with(".partial")));
}
