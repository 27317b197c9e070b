use crate::diverge::{DivergenceGroup, ExecutorSummary};
use crate::mutator::ByteMutation;
use crate::result::ExecutionResult;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// The fixed vocabulary of campaign events. Every hook is a no-op by
/// default so sinks implement only what they care about.
///
/// Sinks are independent: the only ordering they may rely on is that a
/// [`MultiplexerListener`] dispatches each event to its sinks in
/// registration order.
pub trait Listener {
    fn setup(&mut self) {}
    fn shutdown(&mut self) {}

    fn handle_iteration_started(&mut self, _iteration: u64) {}
    fn handle_iteration_finished(&mut self, _iteration: u64) {}
    fn handle_seed(&mut self, _seed: u64) {}

    fn handle_successful_host_verification(&mut self) {}
    fn handle_failed_host_verification(&mut self, _result: &ExecutionResult) {}
    fn handle_failed_target_verification(&mut self) {}

    fn handle_mutation_fail(&mut self) {}
    fn handle_mutations(&mut self, _mutations: &[ByteMutation]) {}
    fn handle_successfully_fuzzed_file(&mut self, _program: &Path) {}

    fn handle_timeouts(&mut self, _timed_out: &[ExecutorSummary], _did_not: &[ExecutorSummary]) {}
    fn handle_divergences(&mut self, _groups: &[DivergenceGroup]) {}
    fn handle_success(&mut self, _groups: &[DivergenceGroup]) {}
    fn handle_self_divergence(&mut self) {}
    fn handle_architecture_split(&mut self) {}

    fn handle_dump_output(&mut self, _output: &str, _executor: &ExecutorSummary) {}
    fn handle_summary(&mut self) {}
    fn handle_message(&mut self, _message: &str) {}
    fn handle_timing(&mut self, _name: &str, _seconds: f64) {}
}

/// Fans every event out to an ordered list of sinks.
#[derive(Default)]
pub struct MultiplexerListener {
    sinks: Vec<Box<dyn Listener>>,
}

impl MultiplexerListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sink: Box<dyn Listener>) {
        self.sinks.push(sink);
    }
}

macro_rules! forward {
    ($self:ident, $method:ident $(, $arg:expr)*) => {
        for sink in $self.sinks.iter_mut() {
            sink.$method($($arg),*);
        }
    };
}

impl Listener for MultiplexerListener {
    fn setup(&mut self) {
        forward!(self, setup);
    }
    fn shutdown(&mut self) {
        forward!(self, shutdown);
    }
    fn handle_iteration_started(&mut self, iteration: u64) {
        forward!(self, handle_iteration_started, iteration);
    }
    fn handle_iteration_finished(&mut self, iteration: u64) {
        forward!(self, handle_iteration_finished, iteration);
    }
    fn handle_seed(&mut self, seed: u64) {
        forward!(self, handle_seed, seed);
    }
    fn handle_successful_host_verification(&mut self) {
        forward!(self, handle_successful_host_verification);
    }
    fn handle_failed_host_verification(&mut self, result: &ExecutionResult) {
        forward!(self, handle_failed_host_verification, result);
    }
    fn handle_failed_target_verification(&mut self) {
        forward!(self, handle_failed_target_verification);
    }
    fn handle_mutation_fail(&mut self) {
        forward!(self, handle_mutation_fail);
    }
    fn handle_mutations(&mut self, mutations: &[ByteMutation]) {
        forward!(self, handle_mutations, mutations);
    }
    fn handle_successfully_fuzzed_file(&mut self, program: &Path) {
        forward!(self, handle_successfully_fuzzed_file, program);
    }
    fn handle_timeouts(&mut self, timed_out: &[ExecutorSummary], did_not: &[ExecutorSummary]) {
        forward!(self, handle_timeouts, timed_out, did_not);
    }
    fn handle_divergences(&mut self, groups: &[DivergenceGroup]) {
        forward!(self, handle_divergences, groups);
    }
    fn handle_success(&mut self, groups: &[DivergenceGroup]) {
        forward!(self, handle_success, groups);
    }
    fn handle_self_divergence(&mut self) {
        forward!(self, handle_self_divergence);
    }
    fn handle_architecture_split(&mut self) {
        forward!(self, handle_architecture_split);
    }
    fn handle_dump_output(&mut self, output: &str, executor: &ExecutorSummary) {
        forward!(self, handle_dump_output, output, executor);
    }
    fn handle_summary(&mut self) {
        forward!(self, handle_summary);
    }
    fn handle_message(&mut self, message: &str) {
        forward!(self, handle_message, message);
    }
    fn handle_timing(&mut self, name: &str, seconds: f64) {
        forward!(self, handle_timing, name, seconds);
    }
}

/// Campaign-wide divergence bookkeeping.
///
/// A campaign is successful iff every observed divergence turned out to be
/// benign, i.e. `divergence == self_divergence + architecture_split`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CampaignStatus {
    pub divergence: u64,
    pub self_divergence: u64,
    pub architecture_split: u64,
}

impl CampaignStatus {
    pub fn is_successful(&self) -> bool {
        self.divergence == self.self_divergence + self.architecture_split
    }
}

/// Accumulates [`CampaignStatus`] counters; the shared handle outlives the
/// listener so the process exit code can be derived after shutdown.
pub struct FinalStatusListener {
    status: Arc<Mutex<CampaignStatus>>,
}

impl FinalStatusListener {
    pub fn new() -> (Self, Arc<Mutex<CampaignStatus>>) {
        let status = Arc::new(Mutex::new(CampaignStatus::default()));
        (
            Self {
                status: Arc::clone(&status),
            },
            status,
        )
    }
}

impl Listener for FinalStatusListener {
    fn handle_divergences(&mut self, _groups: &[DivergenceGroup]) {
        if let Ok(mut status) = self.status.lock() {
            status.divergence += 1;
        }
    }

    fn handle_self_divergence(&mut self) {
        if let Ok(mut status) = self.status.lock() {
            status.self_divergence += 1;
        }
    }

    fn handle_architecture_split(&mut self) {
        if let Ok(mut status) = self.status.lock() {
            status.architecture_split += 1;
        }
    }
}

/// Human-facing progress report on stdout. With `quiet` only divergences
/// and the summary are printed.
pub struct ConsoleListener {
    quiet: bool,
    iterations: u64,
}

impl ConsoleListener {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            iterations: 0,
        }
    }

    fn names(executors: &[ExecutorSummary]) -> String {
        executors
            .iter()
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Listener for ConsoleListener {
    fn handle_iteration_started(&mut self, iteration: u64) {
        self.iterations = iteration + 1;
        if !self.quiet {
            println!("--- iteration {iteration} ---");
        }
    }

    fn handle_seed(&mut self, seed: u64) {
        if !self.quiet {
            println!("using seed {seed}");
        }
    }

    fn handle_mutation_fail(&mut self) {
        if !self.quiet {
            println!("mutation failed; skipping iteration");
        }
    }

    fn handle_successful_host_verification(&mut self) {
        if !self.quiet {
            println!("program verified on host");
        }
    }

    fn handle_failed_host_verification(&mut self, result: &ExecutionResult) {
        println!(
            "host verification failed (return code {})",
            result.return_code()
        );
    }

    fn handle_failed_target_verification(&mut self) {
        println!("target verification failed; skipping analysis");
    }

    fn handle_timeouts(&mut self, timed_out: &[ExecutorSummary], did_not: &[ExecutorSummary]) {
        println!(
            "timed out: [{}]  completed: [{}]",
            Self::names(timed_out),
            Self::names(did_not)
        );
    }

    fn handle_divergences(&mut self, groups: &[DivergenceGroup]) {
        println!("DIVERGENCE across {} output groups:", groups.len());
        for group in groups {
            println!(
                "  [{}] -> return code {}, output \"{}\"",
                Self::names(&group.members),
                group.key.return_code,
                group.key.flattened_output
            );
        }
    }

    fn handle_success(&mut self, _groups: &[DivergenceGroup]) {
        if !self.quiet {
            println!("all backends agreed");
        }
    }

    fn handle_self_divergence(&mut self) {
        println!("self-divergent program; ignoring divergence");
    }

    fn handle_architecture_split(&mut self) {
        println!("divergence aligns with an accepted architecture split");
    }

    fn handle_dump_output(&mut self, output: &str, executor: &ExecutorSummary) {
        println!("--- output of {} ---", executor.name);
        print!("{output}");
        println!("---");
    }

    fn handle_message(&mut self, message: &str) {
        if !self.quiet {
            println!("{message}");
        }
    }

    fn handle_timing(&mut self, name: &str, seconds: f64) {
        println!("{name}: {seconds:.2}s");
    }

    fn handle_summary(&mut self) {
        println!("campaign finished after {} iteration(s)", self.iterations);
    }
}

/// Appends a line-oriented record of every event to a report file.
/// Write failures are logged and swallowed; reporting must never take the
/// campaign down.
pub struct LogFileListener {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl LogFileListener {
    pub fn new(path: PathBuf) -> Self {
        Self { path, writer: None }
    }

    fn log(&mut self, line: &str) {
        if let Some(writer) = self.writer.as_mut() {
            if writeln!(writer, "{line}").is_err() {
                warn!(path = %self.path.display(), "failed to write report line");
            }
        }
    }
}

impl Listener for LogFileListener {
    fn setup(&mut self) {
        match File::create(&self.path) {
            Ok(file) => self.writer = Some(BufWriter::new(file)),
            Err(e) => warn!(path = %self.path.display(), "failed to open report file: {e}"),
        }
    }

    fn shutdown(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if writer.flush().is_err() {
                warn!(path = %self.path.display(), "failed to flush report file");
            }
        }
    }

    fn handle_iteration_started(&mut self, iteration: u64) {
        self.log(&format!("iteration {iteration}"));
    }

    fn handle_iteration_finished(&mut self, _iteration: u64) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }

    fn handle_seed(&mut self, seed: u64) {
        self.log(&format!("seed {seed}"));
    }

    fn handle_mutation_fail(&mut self) {
        self.log("mutation failed");
    }

    fn handle_mutations(&mut self, mutations: &[ByteMutation]) {
        for mutation in mutations {
            self.log(&format!(
                "mutation offset={} delta={}",
                mutation.offset, mutation.delta
            ));
        }
    }

    fn handle_timeouts(&mut self, timed_out: &[ExecutorSummary], _did_not: &[ExecutorSummary]) {
        let names: Vec<_> = timed_out.iter().map(|e| e.name.as_str()).collect();
        self.log(&format!("timeouts: {}", names.join(", ")));
    }

    fn handle_divergences(&mut self, groups: &[DivergenceGroup]) {
        self.log(&format!("divergence: {} groups", groups.len()));
        for group in groups {
            let names: Vec<_> = group.members.iter().map(|e| e.name.as_str()).collect();
            self.log(&format!(
                "  group [{}] code={} output={}",
                names.join(", "),
                group.key.return_code,
                group.key.flattened_output
            ));
        }
    }

    fn handle_success(&mut self, _groups: &[DivergenceGroup]) {
        self.log("success");
    }

    fn handle_self_divergence(&mut self) {
        self.log("self-divergent");
    }

    fn handle_architecture_split(&mut self) {
        self.log("architecture split");
    }

    fn handle_message(&mut self, message: &str) {
        self.log(message);
    }

    fn handle_timing(&mut self, name: &str, seconds: f64) {
        self.log(&format!("timing {name}: {seconds:.2}s"));
    }
}
