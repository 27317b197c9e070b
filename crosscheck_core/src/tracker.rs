use crate::diverge::DivergenceGroup;
use crate::listener::Listener;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DATABASE_VERSION: u32 = 1;

/// How many iterations may pass between automatic checkpoints.
const CHECKPOINT_INTERVAL: u64 = 10;

/// On-disk form of the dedup database: a versioned pair of hex digest to
/// occurrence count maps, kept as JSON so it stays portable and
/// inspectable.
#[derive(Debug, Serialize, Deserialize)]
struct Database {
    version: u32,
    programs: HashMap<String, u64>,
    outputs: HashMap<String, u64>,
}

/// Content-hash deduplication of fuzzed programs and of observed outputs,
/// persisted across campaigns.
///
/// Checkpointing is crash-safe: the live database is first copied to a
/// `.old` backup, then the new state is written, and only after that write
/// succeeded is the backup removed. A crash mid-write leaves the backup as
/// recovery material.
pub struct UniqueProgramTracker {
    db_path: PathBuf,
    programs: HashMap<String, u64>,
    outputs: HashMap<String, u64>,
}

impl UniqueProgramTracker {
    /// Load the database at `db_path`; a missing or unreadable file starts
    /// an empty tracker.
    pub fn load(db_path: PathBuf) -> Self {
        let (programs, outputs) = match fs::read_to_string(&db_path) {
            Ok(text) => match serde_json::from_str::<Database>(&text) {
                Ok(db) if db.version == DATABASE_VERSION => (db.programs, db.outputs),
                Ok(db) => {
                    warn!(
                        path = %db_path.display(),
                        version = db.version,
                        "unsupported dedup database version; starting empty"
                    );
                    (HashMap::new(), HashMap::new())
                }
                Err(e) => {
                    warn!(path = %db_path.display(), "corrupt dedup database ({e}); starting empty");
                    (HashMap::new(), HashMap::new())
                }
            },
            Err(_) => (HashMap::new(), HashMap::new()),
        };
        Self {
            db_path,
            programs,
            outputs,
        }
    }

    /// Record one sighting of a program. Returns true when this content was
    /// never seen before.
    pub fn record_program(&mut self, bytes: &[u8]) -> bool {
        let digest = format!("{:x}", md5::compute(bytes));
        let count = self.programs.entry(digest).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Record one sighting of an output text. Returns true when new.
    pub fn record_output(&mut self, text: &str) -> bool {
        let digest = format!("{:x}", md5::compute(text.as_bytes()));
        let count = self.outputs.entry(digest).or_insert(0);
        *count += 1;
        *count == 1
    }

    pub fn unique_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn unique_outputs(&self) -> usize {
        self.outputs.len()
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.db_path.as_os_str().to_os_string();
        name.push(".old");
        PathBuf::from(name)
    }

    /// Backup-then-write-then-delete-backup. The backup is only removed
    /// after the new database was written completely.
    pub fn checkpoint(&self) -> std::io::Result<()> {
        let backup = self.backup_path();
        if self.db_path.exists() {
            fs::copy(&self.db_path, &backup)?;
        }
        let db = Database {
            version: DATABASE_VERSION,
            programs: self.programs.clone(),
            outputs: self.outputs.clone(),
        };
        let text = serde_json::to_string_pretty(&db)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&self.db_path, text)?;
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        Ok(())
    }
}

/// Listener wrapper around [`UniqueProgramTracker`]: watches the event
/// stream to hash fuzzed programs and divergent outputs, checkpoints
/// periodically and at shutdown, and preserves truly divergent programs
/// under `divergent_programs/{seed}.prog` for later reproduction.
pub struct UniqueProgramTrackerListener {
    tracker: UniqueProgramTracker,
    divergent_dir: PathBuf,
    report_unique: bool,
    seed: u64,
    current_program: Option<PathBuf>,
    divergent: bool,
    iterations_since_checkpoint: u64,
}

impl UniqueProgramTrackerListener {
    pub fn new(db_path: PathBuf, divergent_dir: PathBuf, report_unique: bool) -> Self {
        Self {
            tracker: UniqueProgramTracker::load(db_path),
            divergent_dir,
            report_unique,
            seed: 0,
            current_program: None,
            divergent: false,
            iterations_since_checkpoint: 0,
        }
    }

    fn checkpoint_quietly(&self) {
        if let Err(e) = self.tracker.checkpoint() {
            // A failed checkpoint leaves the .old backup behind as
            // recovery material; never fatal.
            warn!("dedup database checkpoint failed: {e}");
        }
    }

    fn preserve_divergent_program(&mut self) {
        let Some(program) = self.current_program.take() else {
            return;
        };
        if let Err(e) = fs::create_dir_all(&self.divergent_dir) {
            warn!("could not create {}: {e}", self.divergent_dir.display());
            return;
        }
        let target = self.divergent_dir.join(format!("{}.prog", self.seed));
        match fs::rename(&program, &target) {
            Ok(()) => info!("saved divergent program to {}", target.display()),
            Err(e) => warn!(
                "could not preserve divergent program {}: {e}",
                program.display()
            ),
        }
    }
}

impl Listener for UniqueProgramTrackerListener {
    fn handle_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    fn handle_successfully_fuzzed_file(&mut self, program: &Path) {
        self.divergent = false;
        self.current_program = Some(program.to_path_buf());
        match fs::read(program) {
            Ok(bytes) => {
                self.tracker.record_program(&bytes);
            }
            Err(e) => warn!("could not hash fuzzed program {}: {e}", program.display()),
        }
    }

    fn handle_divergences(&mut self, groups: &[DivergenceGroup]) {
        self.divergent = true;
        for group in groups {
            self.tracker.record_output(&group.key.flattened_output);
        }
    }

    fn handle_self_divergence(&mut self) {
        self.divergent = false;
    }

    fn handle_architecture_split(&mut self) {
        self.divergent = false;
    }

    fn handle_iteration_finished(&mut self, _iteration: u64) {
        if self.divergent {
            self.preserve_divergent_program();
            self.divergent = false;
        }
        self.iterations_since_checkpoint += 1;
        if self.iterations_since_checkpoint >= CHECKPOINT_INTERVAL {
            self.checkpoint_quietly();
            self.iterations_since_checkpoint = 0;
        }
    }

    fn handle_summary(&mut self) {
        if self.report_unique {
            println!(
                "unique programs: {}, unique outputs: {}",
                self.tracker.unique_programs(),
                self.tracker.unique_outputs()
            );
        }
    }

    fn shutdown(&mut self) {
        self.checkpoint_quietly();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diverge::ResultKey;
    use crate::result::ExecutionResult;

    #[test]
    fn records_count_occurrences_and_uniqueness() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = UniqueProgramTracker::load(dir.path().join("db.json"));
        assert!(tracker.record_program(b"one"));
        assert!(!tracker.record_program(b"one"));
        assert!(tracker.record_program(b"two"));
        assert_eq!(tracker.unique_programs(), 2);

        assert!(tracker.record_output("42"));
        assert!(!tracker.record_output("42"));
        assert_eq!(tracker.unique_outputs(), 1);
    }

    #[test]
    fn checkpoint_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("db.json");

        let mut tracker = UniqueProgramTracker::load(db_path.clone());
        tracker.record_program(b"alpha");
        tracker.record_program(b"alpha");
        tracker.record_output("out-1");
        tracker.checkpoint().unwrap();

        let reloaded = UniqueProgramTracker::load(db_path);
        assert_eq!(reloaded.programs, tracker.programs);
        assert_eq!(reloaded.outputs, tracker.outputs);
    }

    #[test]
    fn missing_database_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = UniqueProgramTracker::load(dir.path().join("absent.json"));
        assert_eq!(tracker.unique_programs(), 0);
        assert_eq!(tracker.unique_outputs(), 0);
    }

    #[test]
    fn corrupt_database_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("db.json");
        fs::write(&db_path, "not json at all {{{").unwrap();
        let tracker = UniqueProgramTracker::load(db_path);
        assert_eq!(tracker.unique_programs(), 0);
    }

    #[test]
    fn backup_survives_until_write_confirmed() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("db.json");
        let backup = dir.path().join("db.json.old");

        let mut tracker = UniqueProgramTracker::load(db_path.clone());
        tracker.record_program(b"first");
        tracker.checkpoint().unwrap();
        assert!(db_path.exists());
        assert!(!backup.exists(), "backup must be removed after success");

        // Simulate the crash window: the backup copy has happened but the
        // final write has not. The backup must be intact and readable.
        fs::copy(&db_path, &backup).unwrap();
        let recovered: Database =
            serde_json::from_str(&fs::read_to_string(&backup).unwrap()).unwrap();
        assert_eq!(recovered.programs.len(), 1);

        // The next successful checkpoint clears the leftover backup.
        tracker.record_program(b"second");
        tracker.checkpoint().unwrap();
        assert!(!backup.exists());
    }

    #[test]
    fn listener_preserves_truly_divergent_program() {
        let dir = tempfile::tempdir().unwrap();
        let divergent_dir = dir.path().join("divergent_programs");
        let program = dir.path().join("fuzzed.bin");
        fs::write(&program, b"payload").unwrap();

        let mut listener = UniqueProgramTrackerListener::new(
            dir.path().join("db.json"),
            divergent_dir.clone(),
            false,
        );
        listener.handle_seed(7);
        listener.handle_successfully_fuzzed_file(&program);
        let groups = vec![DivergenceGroup {
            key: ResultKey {
                flattened_output: "boom".to_string(),
                return_code: 0,
            },
            result: ExecutionResult::default(),
            members: Vec::new(),
        }];
        listener.handle_divergences(&groups);
        listener.handle_iteration_finished(0);

        assert!(divergent_dir.join("7.prog").exists());
        assert!(!program.exists(), "program is renamed, not copied");
    }

    #[test]
    fn benign_divergence_is_not_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let divergent_dir = dir.path().join("divergent_programs");
        let program = dir.path().join("fuzzed.bin");
        fs::write(&program, b"payload").unwrap();

        let mut listener = UniqueProgramTrackerListener::new(
            dir.path().join("db.json"),
            divergent_dir.clone(),
            false,
        );
        listener.handle_seed(3);
        listener.handle_successfully_fuzzed_file(&program);
        listener.handle_divergences(&[]);
        listener.handle_self_divergence();
        listener.handle_iteration_finished(0);

        assert!(!divergent_dir.join("3.prog").exists());
        assert!(program.exists());
    }
}
