use crate::diverge::{expected_text, DivergenceGroup};
use crate::executor::Executor;
use crate::listener::Listener;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::warn;

/// Directory bisection artifacts are persisted under.
pub const BISECTION_OUTPUT_DIR: &str = "bisection_outputs";

/// Narrow a true two-way divergence to a minimal reproducing mutation set.
///
/// Only meaningful with exactly two result groups; with more, there is no
/// unambiguous reference side and the search is skipped entirely. Each
/// bisectable executor is run against the *other* group's expected output
/// (its own group's output cannot disagree with itself). The search
/// algorithm lives behind [`Executor::run_bisection_search`]; this driver
/// supplies the reference file and persists the result and log under
/// `{out_dir}/{seed}_out.txt` and `{out_dir}/{seed}_log.txt`.
pub fn run_bisection(
    executors: &mut [Box<dyn Executor>],
    groups: &[DivergenceGroup],
    program: &Path,
    seed: u64,
    out_dir: &Path,
    listener: &mut dyn Listener,
) {
    if groups.len() != 2 {
        return;
    }
    let expected = [expected_text(&groups[0].result), expected_text(&groups[1].result)];

    if let Err(e) = fs::create_dir_all(out_dir) {
        warn!("could not create {}: {e}", out_dir.display());
        return;
    }
    let out_path = out_dir.join(format!("{seed}_out.txt"));
    let log_path = out_dir.join(format!("{seed}_log.txt"));

    for executor in executors.iter_mut() {
        if !executor.is_bisectable() {
            continue;
        }
        // Which side of the divergence did this executor land on?
        let own_group = groups
            .iter()
            .position(|group| group.members.iter().any(|m| m.name == executor.name()));
        let Some(own_group) = own_group else {
            continue;
        };
        let reference = &expected[1 - own_group];
        let other = &groups[1 - own_group];

        let mut reference_file = match tempfile::NamedTempFile::new() {
            Ok(file) => file,
            Err(e) => {
                warn!("could not create bisection reference file: {e}");
                continue;
            }
        };
        if let Err(e) = reference_file.write_all(reference.as_bytes()) {
            warn!("could not write bisection reference file: {e}");
            continue;
        }

        let other_names: Vec<_> = other.members.iter().map(|m| m.name.as_str()).collect();
        listener.handle_message(&format!(
            "bisecting {} against the output of [{}]",
            executor.name(),
            other_names.join(", ")
        ));

        match executor.run_bisection_search(program, reference_file.path(), &log_path) {
            Ok(result) => {
                if let Err(e) = fs::write(&out_path, result.flattened_output_with_newlines()) {
                    warn!("could not persist bisection output: {e}");
                    continue;
                }
                listener.handle_message(&format!(
                    "bisection output saved to {}",
                    out_path.display()
                ));
            }
            Err(e) => {
                warn!(executor = executor.name(), "bisection search failed: {e}");
                listener.handle_message(&format!(
                    "bisection search failed for {}: {e}",
                    executor.name()
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diverge::{group_results, ExecutorSummary};
    use crate::executor::{Architecture, Backend, ExecutorError};
    use crate::result::ExecutionResult;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    /// Records every bisection invocation: the reference file's content and
    /// the program it was asked to reproduce against.
    struct StubExecutor {
        name: String,
        bisectable: bool,
        calls: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl StubExecutor {
        fn boxed(
            name: &str,
            bisectable: bool,
            calls: &Arc<Mutex<Vec<(String, String)>>>,
        ) -> Box<dyn Executor> {
            Box::new(Self {
                name: name.to_string(),
                bisectable,
                calls: Arc::clone(calls),
            })
        }
    }

    impl Executor for StubExecutor {
        fn name(&self) -> &str {
            &self.name
        }
        fn architecture(&self) -> Architecture {
            Architecture::X86_64
        }
        fn backend(&self) -> Backend {
            Backend::Optimizing
        }
        fn is_bisectable(&self) -> bool {
            self.bisectable
        }
        fn run(&mut self, _program: &Path) -> Result<&ExecutionResult, ExecutorError> {
            unreachable!("bisection tests never run the executor")
        }
        fn result(&self) -> Option<&ExecutionResult> {
            None
        }
        fn reset(&mut self) {}
        fn run_bisection_search(
            &mut self,
            program: &Path,
            expected: &Path,
            _log: &Path,
        ) -> Result<ExecutionResult, ExecutorError> {
            let reference = fs::read_to_string(expected).unwrap();
            self.calls
                .lock()
                .unwrap()
                .push((self.name.clone(), reference));
            let _ = program;
            Ok(ExecutionResult::new(
                vec!["minimal".to_string()],
                Vec::new(),
                0,
            ))
        }
        fn shutdown(&mut self) {}
    }

    #[derive(Default)]
    struct SilentListener;
    impl Listener for SilentListener {}

    fn summary(name: &str, bisectable: bool) -> ExecutorSummary {
        ExecutorSummary {
            name: name.to_string(),
            architecture: Architecture::X86_64,
            backend: Backend::Optimizing,
            bisectable,
        }
    }

    fn result_with(lines: &[&str], code: i32) -> ExecutionResult {
        ExecutionResult::new(lines.iter().map(|s| s.to_string()).collect(), Vec::new(), code)
    }

    #[test]
    fn two_groups_bisect_each_bisectable_against_the_other_side() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut executors = vec![
            StubExecutor::boxed("left", true, &calls),
            StubExecutor::boxed("right", true, &calls),
        ];
        let runs = vec![
            (summary("left", true), result_with(&["L", "RETURN CODE: 0"], 0)),
            (summary("right", true), result_with(&["R", "RETURN CODE: 0"], 0)),
        ];
        let groups = group_results(&runs);
        let dir = tempfile::tempdir().unwrap();
        let mut listener = SilentListener;

        run_bisection(
            &mut executors,
            &groups,
            &PathBuf::from("fuzzed.bin"),
            9,
            dir.path(),
            &mut listener,
        );

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2, "exactly once per bisectable executor");
        assert!(calls.contains(&("left".to_string(), "R\n".to_string())));
        assert!(calls.contains(&("right".to_string(), "L\n".to_string())));
        assert!(dir.path().join("9_out.txt").exists());
    }

    #[test]
    fn non_bisectable_executors_are_skipped() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut executors = vec![
            StubExecutor::boxed("left", true, &calls),
            StubExecutor::boxed("right", false, &calls),
        ];
        let runs = vec![
            (summary("left", true), result_with(&["L"], 0)),
            (summary("right", false), result_with(&["R"], 0)),
        ];
        let groups = group_results(&runs);
        let dir = tempfile::tempdir().unwrap();

        run_bisection(
            &mut executors,
            &groups,
            &PathBuf::from("fuzzed.bin"),
            1,
            dir.path(),
            &mut SilentListener,
        );

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "left");
    }

    #[test]
    fn three_groups_never_bisect() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut executors = vec![
            StubExecutor::boxed("a", true, &calls),
            StubExecutor::boxed("b", true, &calls),
            StubExecutor::boxed("c", true, &calls),
        ];
        let runs = vec![
            (summary("a", true), result_with(&["1"], 0)),
            (summary("b", true), result_with(&["2"], 0)),
            (summary("c", true), result_with(&["3"], 0)),
        ];
        let groups = group_results(&runs);
        assert_eq!(groups.len(), 3);
        let dir = tempfile::tempdir().unwrap();

        run_bisection(
            &mut executors,
            &groups,
            &PathBuf::from("fuzzed.bin"),
            2,
            dir.path(),
            &mut SilentListener,
        );

        assert!(calls.lock().unwrap().is_empty());
        assert!(!dir.path().join("2_out.txt").exists());
    }
}
