use crate::bisect::{run_bisection, BISECTION_OUTPUT_DIR};
use crate::config::Config;
use crate::diverge::{group_results, is_architecture_split, DivergenceGroup, ExecutorSummary};
use crate::executor::Executor;
use crate::listener::{Listener, MultiplexerListener};
use crate::mutator::{FuzzedProgram, ProgramMutator};
use crate::result::ExecutionResult;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::warn;

/// Accumulates wall-clock time across a campaign phase, reported once at
/// the end through `handle_timing`.
struct Timer {
    name: &'static str,
    accumulated: Duration,
    started: Option<Instant>,
}

impl Timer {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            accumulated: Duration::ZERO,
            started: None,
        }
    }

    fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.accumulated += started.elapsed();
        }
    }

    fn report(&self, listener: &mut dyn Listener) {
        listener.handle_timing(self.name, self.accumulated.as_secs_f64());
    }
}

/// The campaign driver: mutate, execute across every backend, classify.
///
/// The first executor is the golden executor. It verifies programs on the
/// host before any device is touched, and it is the one re-run when a
/// divergence needs to be checked for nondeterminism.
pub struct Fuzzer {
    config: Config,
    executors: Vec<Box<dyn Executor>>,
    mutator: Box<dyn ProgramMutator>,
    listener: MultiplexerListener,
}

impl Fuzzer {
    pub fn new(
        config: Config,
        executors: Vec<Box<dyn Executor>>,
        mutator: Box<dyn ProgramMutator>,
        listener: MultiplexerListener,
    ) -> Self {
        Self {
            config,
            executors,
            mutator,
            listener,
        }
    }

    /// Run the whole campaign. Individual iterations never abort it; a
    /// failed mutation or execution skips to the next seed.
    pub fn run(&mut self) {
        let mut total = Timer::new("total");
        let mut generation = Timer::new("program generation");
        let mut execution = Timer::new("execution");

        total.start();
        self.listener.setup();
        for iteration in 0..self.config.repeat {
            let seed = self.config.seed.wrapping_add(iteration);
            self.listener.handle_iteration_started(iteration);
            self.listener.handle_seed(seed);

            generation.start();
            let fuzzed = self.mutator.fuzz(seed);
            generation.stop();
            match fuzzed {
                Ok(fuzzed) => {
                    execution.start();
                    self.execute_iteration(&fuzzed, seed);
                    execution.stop();
                }
                Err(e) => {
                    warn!("mutation failed: {e}");
                    self.listener.handle_mutation_fail();
                }
            }
            self.listener.handle_iteration_finished(iteration);
        }

        total.stop();
        self.listener.handle_summary();
        total.report(&mut self.listener);
        generation.report(&mut self.listener);
        execution.report(&mut self.listener);
        for executor in self.executors.iter_mut() {
            executor.shutdown();
        }
        self.listener.shutdown();
    }

    fn execute_iteration(&mut self, fuzzed: &FuzzedProgram, seed: u64) {
        let program = fuzzed.path.as_path();
        if self.executors.is_empty() {
            // Generation-only campaign; nothing to execute or compare.
            self.listener.handle_successfully_fuzzed_file(program);
            return;
        }

        if !self.config.skip_host_verify && !self.config.execute_on_host {
            if !self.verify_on_host(program) {
                return;
            }
        }

        let Some(runs) = self.run_all(program) else {
            return;
        };

        if self.executors.iter().any(|e| !e.target_verified()) {
            self.listener.handle_failed_target_verification();
            return;
        }
        self.listener.handle_successfully_fuzzed_file(program);

        self.analyse(&runs, fuzzed, seed);
    }

    /// Host verification through the golden executor. Returns whether the
    /// program verified and execution should proceed.
    fn verify_on_host(&mut self, program: &Path) -> bool {
        let result = match self.executors[0].verify_host(program) {
            Ok(result) => result,
            Err(e) => {
                warn!("host verification did not run: {e}");
                self.listener
                    .handle_message(&format!("host verification did not run: {e}"));
                return false;
            }
        };
        if self.config.dump_verify {
            let summary = ExecutorSummary::of(self.executors[0].as_ref());
            self.listener
                .handle_dump_output(result.flattened_all_with_newlines(), &summary);
        }
        if result.return_code() == 0 {
            self.listener.handle_successful_host_verification();
            true
        } else {
            self.listener.handle_failed_host_verification(&result);
            false
        }
    }

    /// Run the program under every backend. A run failure (spawn error,
    /// broken pipe) skips the iteration entirely; partial result sets must
    /// never reach divergence analysis.
    fn run_all(&mut self, program: &Path) -> Option<Vec<(ExecutorSummary, ExecutionResult)>> {
        let mut runs = Vec::with_capacity(self.executors.len());
        for executor in self.executors.iter_mut() {
            executor.reset();
            let summary = ExecutorSummary::of(executor.as_ref());
            match executor.run(program) {
                Ok(result) => runs.push((summary, result.clone())),
                Err(e) => {
                    warn!(executor = %summary.name, "execution failed: {e}");
                    self.listener
                        .handle_message(&format!("{} failed to run: {e}", summary.name));
                    return None;
                }
            }
        }
        Some(runs)
    }

    fn analyse(&mut self, runs: &[(ExecutorSummary, ExecutionResult)], fuzzed: &FuzzedProgram, seed: u64) {
        let (timed_out, completed): (Vec<_>, Vec<_>) = runs
            .iter()
            .partition(|(_, result)| result.is_timeout() || result.is_sigabort());
        if !timed_out.is_empty() {
            let timed_out: Vec<_> = timed_out.into_iter().map(|(s, _)| s.clone()).collect();
            let completed: Vec<_> = completed.into_iter().map(|(s, _)| s.clone()).collect();
            self.listener.handle_timeouts(&timed_out, &completed);
            return;
        }

        if self.config.dump_output {
            for (summary, result) in runs {
                self.listener
                    .handle_dump_output(result.flattened_all_with_newlines(), summary);
            }
        }

        let groups = group_results(runs);
        if groups.len() == 1 {
            self.listener.handle_success(&groups);
            return;
        }

        self.listener.handle_divergences(&groups);
        self.listener.handle_mutations(&fuzzed.mutations);

        if self.golden_self_diverges(&fuzzed.path, runs) {
            self.listener.handle_self_divergence();
            return;
        }
        if is_architecture_split(&groups) {
            self.listener.handle_architecture_split();
            return;
        }

        if self.config.bisection_search {
            self.bisect(&groups, &fuzzed.path, seed);
        }
    }

    /// Re-run the golden executor and compare against its first output. Any
    /// variation means the program itself is nondeterministic and the
    /// divergence says nothing about the backends.
    fn golden_self_diverges(
        &mut self,
        program: &Path,
        runs: &[(ExecutorSummary, ExecutionResult)],
    ) -> bool {
        let Some((_, reference)) = runs.first() else {
            return false;
        };
        let reference = reference.flattened_output().to_string();
        let golden = &mut self.executors[0];
        for _ in 0..self.config.divergence_retry {
            golden.reset();
            match golden.run(program) {
                Ok(result) => {
                    if result.flattened_output() != reference {
                        return true;
                    }
                }
                Err(e) => {
                    warn!("self-divergence check aborted: {e}");
                    return false;
                }
            }
        }
        false
    }

    fn bisect(&mut self, groups: &[DivergenceGroup], program: &Path, seed: u64) {
        run_bisection(
            &mut self.executors,
            groups,
            program,
            seed,
            Path::new(BISECTION_OUTPUT_DIR),
            &mut self.listener,
        );
    }
}
