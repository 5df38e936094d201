//! backsort - command-line front end for the backup engine.
//!
//! Loads a profile, applies command-line overrides, runs one job with
//! progress on stderr and prints the result on stdout.

mod logging;

use backsort_engine::{
    config::{load_config, save_config, AppConfig},
    create_job, run_job, BackupMode, ChecksumAlgorithm, ConflictStrategy, JobState, Phase, PlanAction, PlanItem,
    Profile, ProgressCallback, RunResult,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// backsort - sort files into a deduplicated backup target
#[derive(Parser, Debug)]
#[command(name = "backsort")]
#[command(version)]
#[command(about = "Archive, incrementally archive or mirror files into a target folder")]
struct Args {
    /// Target directory (must exist)
    #[arg(long, value_name = "DIR")]
    target: PathBuf,

    /// Files and folders to back up
    #[arg(value_name = "SOURCES", required = true)]
    sources: Vec<PathBuf>,

    /// JSON config file with saved profiles
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Profile name or id from the config (default: the active profile)
    #[arg(long, value_name = "NAME|ID")]
    profile: Option<String>,

    /// Placement mode: archive, incremental or mirror
    #[arg(long, value_name = "MODE")]
    mode: Option<String>,

    /// Conflict strategy: rename, overwrite, skip, hash or time
    #[arg(long, value_name = "STRATEGY")]
    conflict: Option<String>,

    /// Content hash: sha256 or blake3
    #[arg(long, value_name = "ALGORITHM")]
    hash: Option<String>,

    /// Re-hash every copy and compare with its source
    #[arg(long)]
    verify: bool,

    /// Report what would happen without touching the target
    #[arg(long)]
    dry_run: bool,

    /// Print the result as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Print every decision and debug diagnostics
    #[arg(long)]
    verbose: bool,

    /// Also write a timestamped run log into this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

/// CLI implementation of ProgressCallback, writing to stderr
struct CliProgress {
    verbose: bool,
    start_time: Instant,
    last_progress_update: Mutex<Option<Instant>>,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
            last_progress_update: Mutex::new(None),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn progress_bar(current: usize, total: usize) -> String {
        let percent = if total == 0 { 100 } else { (current * 100 / total).min(100) };
        let filled = percent / 5;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(20 - filled), percent)
    }
}

impl ProgressCallback for CliProgress {
    fn on_phase(&self, phase: Phase) {
        match phase {
            Phase::Index => eprintln!("Indexing target..."),
            Phase::Run => eprintln!("Processing sources..."),
            Phase::Done => {
                eprintln!();
                eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));
            }
        }
    }

    fn on_progress(&self, current: usize, total: usize) {
        // Throttle to one redraw per 200ms, but always draw the last tick.
        let mut last = self
            .last_progress_update
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let due = last.map_or(true, |t| t.elapsed() >= Duration::from_millis(200));
        if !due && current < total {
            return;
        }
        *last = Some(Instant::now());

        eprint!("\rProgress: {} {}/{}", Self::progress_bar(current, total), current, total);
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }

    fn on_message(&self, message: &str) {
        if self.verbose {
            eprintln!("{}", message);
        }
    }

    fn on_error(&self, message: &str) {
        eprintln!("\n[error] {}", message);
    }

    fn on_item(&self, item: &PlanItem) {
        if !self.verbose {
            return;
        }
        match item.action {
            PlanAction::Copy => eprintln!(
                "\ncopy   {} -> {} ({})",
                item.source.display(),
                item.destination.display(),
                item.reason
            ),
            PlanAction::Skip => eprintln!("\nskip   {} ({})", item.source.display(), item.reason),
            PlanAction::Delete => eprintln!("\ndelete {} ({})", item.destination.display(), item.reason),
        }
    }
}

fn print_summary(result: &RunResult) {
    let verb = if result.dry_run { "Would copy" } else { "Copied" };
    println!("{}: {} files ({})", verb, result.copied, CliProgress::format_bytes(result.bytes_copied));
    println!("Sources found: {}", result.total_sources);
    println!("Duplicates skipped: {}", result.skipped_duplicates);
    println!("Already present: {}", result.skipped_existing);
    if result.skipped_not_modified > 0 {
        println!("Not modified since last run: {}", result.skipped_not_modified);
    }
    println!("Missing sources: {}", result.missing_sources);
    if result.deleted_mirror > 0 {
        let verb = if result.dry_run { "Would delete" } else { "Deleted" };
        println!("{} from mirror: {}", verb, result.deleted_mirror);
    }
    if result.failed > 0 {
        println!("Failed: {}", result.failed);
    }
}

/// Pick the profile to run and apply command-line overrides.
fn resolve_profile(args: &Args, cfg: &AppConfig) -> Result<Profile, String> {
    let mut profile = match &args.profile {
        Some(key) => cfg
            .find_profile(key)
            .cloned()
            .ok_or_else(|| format!("Unknown profile '{}'", key))?,
        None => cfg.active_profile().cloned().unwrap_or_default(),
    };

    if let Some(mode) = &args.mode {
        profile.mode = BackupMode::from_name(mode).ok_or_else(|| {
            format!("Invalid mode '{}'. Must be 'archive', 'incremental' or 'mirror'", mode)
        })?;
    }
    if let Some(conflict) = &args.conflict {
        profile.conflict = ConflictStrategy::from_name(conflict).ok_or_else(|| {
            format!(
                "Invalid conflict strategy '{}'. Must be 'rename', 'overwrite', 'skip', 'hash' or 'time'",
                conflict
            )
        })?;
    }
    if let Some(hash) = &args.hash {
        profile.hash_algorithm = ChecksumAlgorithm::from_name(hash)
            .ok_or_else(|| format!("Invalid hash algorithm '{}'. Must be 'sha256' or 'blake3'", hash))?;
    }
    if args.verify {
        profile.verify_copies = true;
    }
    debug!(
        profile = %profile.name,
        mode = %profile.mode,
        conflict = profile.conflict.as_str(),
        hash = %profile.hash_algorithm,
        "Resolved profile"
    );
    Ok(profile)
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> Result<RunResult, String> {
    let mut cfg = args.config.as_deref().map(load_config).unwrap_or_default();
    let profile = resolve_profile(args, &cfg)?;

    let mut job = create_job(profile, &args.target, args.sources.clone(), args.dry_run)
        .map_err(|e| format!("Job creation failed: {}", e))?;

    let progress = CliProgress::new(args.verbose);
    let result = run_job(&mut job, &progress).map_err(|e| format!("Job execution failed: {}", e))?;

    if args.json {
        let json = serde_json::to_string_pretty(&result).map_err(|e| e.to_string())?;
        println!("{}", json);
    } else {
        print_summary(&result);
    }

    // Only the run timestamp is written back; overrides stay one-off.
    if let Some(path) = &args.config {
        if job.state == JobState::Done && !args.dry_run {
            if let Some(saved) = cfg.profile_mut(&job.profile.id) {
                saved.last_run_utc = job.profile.last_run_utc;
            }
            if let Err(e) = save_config(path, &cfg) {
                eprintln!("Warning: could not save config {}: {}", path.display(), e);
            }
        }
    }

    Ok(result)
}

fn exit_code(outcome: &Result<RunResult, String>) -> i32 {
    match outcome {
        Ok(result) if result.failed > 0 => 1,
        Ok(_) => 0,
        Err(_) => 2,
    }
}

/// Parse and validate command-line arguments, then run the job
fn main() {
    let args = Args::parse();

    let code = {
        let _log_guard = logging::init_logger(args.verbose, args.log_dir.as_deref());
        let outcome = run_cli(&args);
        if let Err(msg) = &outcome {
            error!("{}", msg);
            eprintln!("Error: {}", msg);
        }
        exit_code(&outcome)
    };

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use backsort_engine::MirrorDeleteScope;
    use tempfile::TempDir;

    fn args(target: PathBuf, sources: Vec<PathBuf>) -> Args {
        Args {
            target,
            sources,
            config: None,
            profile: None,
            mode: None,
            conflict: None,
            hash: None,
            verify: false,
            dry_run: false,
            json: false,
            verbose: false,
            log_dir: None,
        }
    }

    #[test]
    fn test_cli_archives_sources() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(src_dir.path().join("test.txt"), "hello").expect("Failed to write file");

        let outcome = run_cli(&args(dst_dir.path().to_path_buf(), vec![src_dir.path().to_path_buf()]));
        assert_eq!(exit_code(&outcome), 0);
        assert_eq!(outcome.expect("CLI should succeed").copied, 1);
        assert!(dst_dir.path().join("documents").join("test.txt").exists());
    }

    #[test]
    fn test_cli_dry_run_with_verification_and_json() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(src_dir.path().join("test.txt"), "hello").expect("Failed to write file");

        let mut a = args(dst_dir.path().to_path_buf(), vec![src_dir.path().to_path_buf()]);
        a.dry_run = true;
        a.verify = true;
        a.json = true;
        a.hash = Some("blake3".to_string());

        let result = run_cli(&a).expect("CLI should succeed");
        assert!(result.dry_run);
        assert_eq!(result.copied, 1);
        assert!(!dst_dir.path().join("documents").exists());
    }

    #[test]
    fn test_cli_rejects_missing_target() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let outcome = run_cli(&args(
            PathBuf::from("/nonexistent/backsort/target"),
            vec![src_dir.path().to_path_buf()],
        ));
        assert_eq!(exit_code(&outcome), 2);
    }

    #[test]
    fn test_cli_rejects_invalid_overrides() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        let base = || args(dst_dir.path().to_path_buf(), vec![src_dir.path().to_path_buf()]);

        let mut bad_mode = base();
        bad_mode.mode = Some("sideways".to_string());
        assert!(run_cli(&bad_mode).is_err(), "CLI should reject invalid mode");

        let mut bad_conflict = base();
        bad_conflict.conflict = Some("ask".to_string());
        assert!(run_cli(&bad_conflict).is_err(), "CLI should reject invalid conflict strategy");

        let mut bad_hash = base();
        bad_hash.hash = Some("md5".to_string());
        assert!(run_cli(&bad_hash).is_err(), "CLI should reject invalid hash algorithm");

        let mut bad_profile = base();
        bad_profile.profile = Some("nope".to_string());
        assert!(run_cli(&bad_profile).is_err(), "CLI should reject unknown profile");
    }

    #[test]
    fn test_cli_uses_named_profile_and_persists_last_run() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        let cfg_dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(src_dir.path().join("a.txt"), "a").expect("Failed to write file");
        std::fs::create_dir(dst_dir.path().join("mirror")).expect("Failed to create dir");
        std::fs::write(dst_dir.path().join("mirror").join("stale.txt"), "x").expect("Failed to write file");

        let mut cfg = AppConfig::default();
        let mut mirror = Profile::new("Mirror");
        mirror.mode = BackupMode::MirrorTree;
        mirror.mirror_delete_scope = MirrorDeleteScope::SubfolderOnly;
        cfg.profiles.push(mirror);
        let cfg_path = cfg_dir.path().join("config.json");
        save_config(&cfg_path, &cfg).expect("Failed to save config");

        let mut a = args(dst_dir.path().to_path_buf(), vec![src_dir.path().to_path_buf()]);
        a.config = Some(cfg_path.clone());
        a.profile = Some("mirror".to_string());

        let result = run_cli(&a).expect("CLI should succeed");
        assert_eq!(result.copied, 1);
        assert_eq!(result.deleted_mirror, 1);
        assert!(dst_dir.path().join("mirror").join("a.txt").exists());

        let saved = load_config(&cfg_path);
        let mirror = saved.find_profile("Mirror").expect("profile kept");
        assert!(mirror.last_run_utc > 0.0);
        assert_eq!(saved.active_profile().expect("active").last_run_utc, 0.0);
    }

    #[test]
    fn test_exit_code_reports_failures() {
        let failed = RunResult {
            failed: 2,
            ..RunResult::default()
        };
        assert_eq!(exit_code(&Ok(failed)), 1);
        assert_eq!(exit_code(&Ok(RunResult::default())), 0);
        assert_eq!(exit_code(&Err("boom".to_string())), 2);
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(CliProgress::format_bytes(512), "512.00 B");
        assert_eq!(CliProgress::format_bytes(2 * 1024 * 1024), "2.00 MB");
        assert_eq!(CliProgress::format_duration(Duration::from_secs(3725)), "1h 2m 5s");
        assert_eq!(CliProgress::progress_bar(1, 2), "[==========          ] 50%");
    }
}
