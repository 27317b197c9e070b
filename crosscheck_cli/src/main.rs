use crosscheck_core::config::{CommandOverrides, Config};
use crosscheck_core::executor::{
    Architecture, Backend, CommandExecutor, CommandTemplates, Device, Executor,
};
use crosscheck_core::fuzzer::Fuzzer;
use crosscheck_core::listener::{
    ConsoleListener, FinalStatusListener, LogFileListener, MultiplexerListener,
};
use crosscheck_core::mutator::FileByteMutator;
use crosscheck_core::tracker::UniqueProgramTrackerListener;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Seed program(s) to mutate. More than one requires --repeat.
    #[clap(long = "input")]
    inputs: Vec<PathBuf>,

    /// Directory whose files are all used as seed programs.
    #[clap(long = "inputs")]
    input_dir: Option<PathBuf>,

    /// Where the fuzzed program is written each iteration.
    #[clap(long, default_value = "fuzzed.bin")]
    output: PathBuf,

    /// Execute fuzzed programs and compare backend outputs.
    #[clap(long)]
    execute: bool,

    /// Execute on the host instead of a device.
    #[clap(long)]
    host: bool,

    /// Execute on the named device.
    #[clap(long)]
    device: Option<String>,

    /// Working directory for host execution.
    #[clap(long)]
    execute_dir: Option<PathBuf>,

    /// Root of the runtime installation.
    #[clap(long, default_value = "/")]
    android_root: PathBuf,

    /// Run without a prebuilt boot image.
    #[clap(long)]
    no_boot_image: bool,

    /// Skip the host verification pass before execution.
    #[clap(long)]
    skip_host_verify: bool,

    /// Entry class executed in each fuzzed program.
    #[clap(long, default_value = "Main")]
    execute_class: String,

    /// Enable the interpreter backend.
    #[clap(long)]
    interpreter: bool,

    /// Enable the optimizing backend.
    #[clap(long)]
    optimizing: bool,

    #[clap(long)]
    arm: bool,
    #[clap(long)]
    arm64: bool,
    /// Shorthand for --arm --arm64.
    #[clap(long)]
    allarm: bool,
    #[clap(long)]
    x86: bool,
    #[clap(long = "x86-64")]
    x86_64: bool,
    #[clap(long)]
    mips: bool,
    #[clap(long)]
    mips64: bool,

    /// Dump every backend's full output each iteration.
    #[clap(long)]
    dump_output: bool,

    /// Dump the host verifier's output.
    #[clap(long)]
    dump_verify: bool,

    /// Number of fuzzing iterations.
    #[clap(long, default_value_t = 1)]
    repeat: u64,

    /// Use the short per-execution timeout.
    #[clap(long)]
    short_timeouts: bool,

    /// Re-runs of the golden backend when checking for self-divergence.
    #[clap(long, default_value_t = 10)]
    divergence_retry: u32,

    /// Fixed seed; reproduces exactly one program.
    #[clap(long)]
    seed: Option<u64>,

    /// Mutations applied per program.
    #[clap(long, default_value_t = 3)]
    method_mutations: u32,

    /// Collapse --method-mutations to a single mutation.
    #[clap(long)]
    one_mutation: bool,

    #[clap(long, default_value_t = 2)]
    min_methods: u32,
    #[clap(long, default_value_t = 10)]
    max_methods: u32,

    /// Leave the leading region of the program untouched.
    #[clap(long)]
    mutate_limit: bool,

    /// Pass the seed programs through unmutated.
    #[clap(long)]
    skip_mutation: bool,

    /// Mutation likelihood table, consumed by structure-aware mutators.
    #[clap(long = "likelihoods")]
    likelihoods: Option<PathBuf>,

    /// Dump the applied mutation list for replay.
    #[clap(long, num_args = 0..=1, default_missing_value = "mutations.dump")]
    dump_mutations: Option<PathBuf>,

    /// Replay a previously dumped mutation list.
    #[clap(long, num_args = 0..=1, default_missing_value = "mutations.dump")]
    load_mutations: Option<PathBuf>,

    /// Append a line-oriented campaign report to this file.
    #[clap(long = "report")]
    report_file: Option<PathBuf>,

    /// Report unique program and output counts in the summary.
    #[clap(long)]
    report_unique: bool,

    /// Path of the persistent deduplication database.
    #[clap(long, default_value = "unique_progs.db")]
    unique_db: PathBuf,

    /// Narrow true divergences with the external bisection search.
    #[clap(long)]
    bisection_search: bool,

    /// TOML file overriding the execute/verify/bisect command templates.
    #[clap(long)]
    commands: Option<PathBuf>,

    /// Only print divergences and the summary.
    #[clap(long)]
    quiet: bool,

    /// Log filter, e.g. "info" or "crosscheck_core=debug".
    #[clap(long, default_value = "info")]
    log: String,
}

impl Cli {
    fn architectures(&self) -> Vec<Architecture> {
        let flags = [
            (self.arm || self.allarm, Architecture::Arm),
            (self.arm64 || self.allarm, Architecture::Arm64),
            (self.x86, Architecture::X86),
            (self.x86_64, Architecture::X86_64),
            (self.mips, Architecture::Mips),
            (self.mips64, Architecture::Mips64),
        ];
        flags
            .into_iter()
            .filter_map(|(enabled, arch)| enabled.then_some(arch))
            .collect()
    }

    fn collect_inputs(&self) -> Result<Vec<PathBuf>, anyhow::Error> {
        let mut inputs = self.inputs.clone();
        if let Some(dir) = &self.input_dir {
            let mut from_dir = Vec::new();
            for entry in std::fs::read_dir(dir)
                .map_err(|e| anyhow::anyhow!("Failed to read input directory {:?}: {}", dir, e))?
            {
                let path = entry
                    .map_err(|e| anyhow::anyhow!("Failed to read input directory {:?}: {}", dir, e))?
                    .path();
                if path.is_file() {
                    from_dir.push(path);
                }
            }
            // Directory order is filesystem-dependent; sort so seed
            // selection stays reproducible.
            from_dir.sort();
            inputs.extend(from_dir);
        }
        Ok(inputs)
    }

    fn into_config(self, inputs: Vec<PathBuf>) -> Config {
        let architectures = self.architectures();
        // Neither backend flag selects both, matching the common case of
        // comparing the interpreter against the compiler.
        let neither = !self.interpreter && !self.optimizing;
        Config {
            inputs,
            output: self.output,
            execute: self.execute,
            execute_on_host: self.host,
            device_name: self.device,
            execute_dir: self.execute_dir,
            android_root: self.android_root,
            no_boot_image: self.no_boot_image,
            skip_host_verify: self.skip_host_verify,
            execute_class: self.execute_class,
            use_interpreter: self.interpreter || neither,
            use_optimizing: self.optimizing || neither,
            architectures,
            dump_output: self.dump_output,
            dump_verify: self.dump_verify,
            repeat: self.repeat,
            short_timeouts: self.short_timeouts,
            divergence_retry: self.divergence_retry,
            seed: self.seed.unwrap_or_else(time_seed),
            provided_seed: self.seed.is_some(),
            method_mutations: if self.one_mutation {
                1
            } else {
                self.method_mutations
            },
            min_methods: self.min_methods,
            max_methods: self.max_methods,
            mutate_limit: self.mutate_limit,
            skip_mutation: self.skip_mutation,
            dump_mutations: self.dump_mutations,
            load_mutations: self.load_mutations,
            likelihoods_file: self.likelihoods,
            report_file: self.report_file,
            report_unique: self.report_unique,
            unique_db: self.unique_db,
            bisection_search: self.bisection_search,
            quiet: self.quiet,
        }
    }
}

fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn build_executors(config: &Config, templates: &CommandTemplates) -> Vec<Box<dyn Executor>> {
    if !config.execute {
        return Vec::new();
    }
    let device = match &config.device_name {
        Some(name) => Device::remote(
            name.clone(),
            config.android_root.clone(),
            config.no_boot_image,
        ),
        None => Device::host(config.android_root.clone(), config.execute_dir.clone()),
    };

    let mut executors: Vec<Box<dyn Executor>> = Vec::new();
    for &architecture in &config.architectures {
        // The compiler backend goes first so it serves as the golden
        // executor for host verification and self-divergence checks.
        let mut backends = Vec::new();
        if config.use_optimizing {
            backends.push(Backend::Optimizing);
        }
        if config.use_interpreter {
            backends.push(Backend::Interpreter);
        }
        for backend in backends {
            executors.push(Box::new(CommandExecutor::new(
                backend,
                architecture,
                device.clone(),
                config.execute_class.clone(),
                config.timeout_secs(),
                templates.clone(),
            )));
        }
    }
    executors
}

fn main() -> Result<ExitCode, anyhow::Error> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log)?)
        .with_writer(std::io::stderr)
        .init();

    let commands = cli.commands.clone();
    let inputs = cli.collect_inputs()?;
    let config = cli.into_config(inputs);
    config.validate()?;

    let templates = match &commands {
        Some(path) => {
            let overrides = CommandOverrides::load_from_file(path)?;
            CommandTemplates {
                execute: overrides.execute,
                verify: overrides.verify,
                bisect: overrides.bisect,
            }
        }
        None => CommandTemplates::default(),
    };

    let executors = build_executors(&config, &templates);

    let mutator = FileByteMutator::new(
        config.inputs.clone(),
        config.output.clone(),
        config.method_mutations,
    )
    .with_mutate_limit(config.mutate_limit)
    .with_skip_mutation(config.skip_mutation)
    .with_dump_to(config.dump_mutations.clone())
    .with_load_from(config.load_mutations.clone());

    let mut listener = MultiplexerListener::new();
    listener.add(Box::new(ConsoleListener::new(config.quiet)));
    if let Some(report) = &config.report_file {
        listener.add(Box::new(LogFileListener::new(report.clone())));
    }
    listener.add(Box::new(UniqueProgramTrackerListener::new(
        config.unique_db.clone(),
        PathBuf::from("divergent_programs"),
        config.report_unique,
    )));
    let (final_status, status) = FinalStatusListener::new();
    listener.add(Box::new(final_status));

    let mut fuzzer = Fuzzer::new(config, executors, Box::new(mutator), listener);
    fuzzer.run();

    let successful = status.lock().map(|s| s.is_successful()).unwrap_or(false);
    Ok(if successful {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
