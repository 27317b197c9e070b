use crate::result::ExecutionResult;
use crate::stream::{StreamConsumer, StreamError};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;
use tracing::{debug, warn};

/// Target architectures a backend can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    Arm,
    Arm64,
    X86,
    X86_64,
    Mips,
    Mips64,
}

impl Architecture {
    pub fn as_str(self) -> &'static str {
        match self {
            Architecture::Arm => "arm",
            Architecture::Arm64 => "arm64",
            Architecture::X86 => "x86",
            Architecture::X86_64 => "x86_64",
            Architecture::Mips => "mips",
            Architecture::Mips64 => "mips64",
        }
    }

    pub fn is_64_bit(self) -> bool {
        matches!(
            self,
            Architecture::Arm64 | Architecture::X86_64 | Architecture::Mips64
        )
    }
}

/// Execution strategies the runtime under test supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Interpreter,
    Optimizing,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Interpreter => "interpreter",
            Backend::Optimizing => "optimizing",
        }
    }
}

/// Where and how programs are executed: directly on the host, or pushed to
/// a named device. Owns the pieces every invocation command shares.
#[derive(Debug, Clone)]
pub struct Device {
    name: Option<String>,
    android_root: PathBuf,
    no_boot_image: bool,
    execute_dir: Option<PathBuf>,
}

impl Device {
    pub fn host(android_root: PathBuf, execute_dir: Option<PathBuf>) -> Self {
        Self {
            name: None,
            android_root,
            no_boot_image: false,
            execute_dir,
        }
    }

    pub fn remote(name: String, android_root: PathBuf, no_boot_image: bool) -> Self {
        Self {
            name: Some(name),
            android_root,
            no_boot_image,
            execute_dir: None,
        }
    }

    pub fn is_host(&self) -> bool {
        self.name.is_none()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn execute_dir(&self) -> Option<&Path> {
        self.execute_dir.as_deref()
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("failed to wait for child process: {0}")]
    Wait(std::io::Error),

    #[error("child process had no {0} pipe")]
    MissingPipe(&'static str),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("executor '{0}' has no bisection command configured")]
    NotBisectable(String),

    #[error("executor '{0}' has an empty command template")]
    EmptyCommand(String),
}

/// One configured backend of the runtime under test.
///
/// An executor is created once per backend+architecture pair and reused
/// across every campaign iteration; it holds the result of its most recent
/// run until `reset`.
pub trait Executor {
    fn name(&self) -> &str;
    fn architecture(&self) -> Architecture;
    fn backend(&self) -> Backend;

    fn is_bisectable(&self) -> bool {
        false
    }

    /// Run the program under this backend and capture its result.
    fn run(&mut self, program: &Path) -> Result<&ExecutionResult, ExecutorError>;

    /// The result of the most recent `run`, if any.
    fn result(&self) -> Option<&ExecutionResult>;

    /// Drop per-iteration state before the next run.
    fn reset(&mut self);

    /// Verify the program on the host before touching a device. A zero
    /// return code means the program verified.
    fn verify_host(&mut self, _program: &Path) -> Result<ExecutionResult, ExecutorError> {
        Ok(ExecutionResult::new(Vec::new(), Vec::new(), 0))
    }

    /// Whether the runtime's own verifier accepted the program during the
    /// most recent `run`.
    fn target_verified(&self) -> bool {
        true
    }

    /// Hand the program to the external bisection search, comparing against
    /// the reference output in `expected`, logging to `log`.
    fn run_bisection_search(
        &mut self,
        program: &Path,
        expected: &Path,
        log: &Path,
    ) -> Result<ExecutionResult, ExecutorError>;

    /// Release worker threads. Must be called at campaign shutdown or the
    /// stream consumers leak.
    fn shutdown(&mut self);
}

/// Command templates for one backend. `{program}`, `{expected}` and `{log}`
/// placeholders are substituted per invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandTemplates {
    pub execute: Option<Vec<String>>,
    pub verify: Option<Vec<String>>,
    pub bisect: Option<Vec<String>>,
}

/// Subprocess-backed [`Executor`]: one invocation per run, a pair of
/// stream consumers draining stdout and stderr concurrently with the exit
/// wait.
pub struct CommandExecutor {
    name: String,
    backend: Backend,
    architecture: Architecture,
    device: Device,
    execute_class: String,
    timeout_secs: u64,
    templates: CommandTemplates,
    verify_failure_marker: Option<String>,
    stdout: StreamConsumer,
    stderr: StreamConsumer,
    last_result: Option<ExecutionResult>,
    target_verified: bool,
}

impl CommandExecutor {
    pub fn new(
        backend: Backend,
        architecture: Architecture,
        device: Device,
        execute_class: String,
        timeout_secs: u64,
        templates: CommandTemplates,
    ) -> Self {
        let name = format!("{}-{}", architecture.as_str(), backend.as_str());
        Self {
            name,
            backend,
            architecture,
            device,
            execute_class,
            timeout_secs,
            templates,
            verify_failure_marker: Some("Verification error".to_string()),
            stdout: StreamConsumer::new("stdout"),
            stderr: StreamConsumer::new("stderr"),
            last_result: None,
            target_verified: true,
        }
    }

    pub fn with_verify_failure_marker(mut self, marker: Option<String>) -> Self {
        self.verify_failure_marker = marker;
        self
    }

    /// The invocation command for `program`: a configured template when one
    /// was supplied, otherwise the built-in runtime invocation for this
    /// backend and architecture, wrapped in an external `timeout` so a hung
    /// target surfaces as the reserved return code.
    fn execute_command(&self, program: &Path) -> Vec<String> {
        if let Some(template) = &self.templates.execute {
            return substitute(template, program, None, None);
        }
        let vm = if self.architecture.is_64_bit() {
            "dalvikvm64"
        } else {
            "dalvikvm32"
        };
        let mut command = Vec::new();
        if let Some(device) = self.device.name() {
            command.extend(["adb", "-s", device, "shell"].map(str::to_string));
        }
        command.push("timeout".to_string());
        command.push(self.timeout_secs.to_string());
        command.push(
            self.device
                .android_root
                .join("bin")
                .join(vm)
                .display()
                .to_string(),
        );
        match self.backend {
            Backend::Interpreter => command.push("-Xint".to_string()),
            Backend::Optimizing => {
                command.push("-Xcompiler-option".to_string());
                command.push("--compiler-backend=Optimizing".to_string());
            }
        }
        if self.device.no_boot_image {
            command.push("-Ximage:/system/non-existent/core.art".to_string());
        }
        command.push("-cp".to_string());
        command.push(program.display().to_string());
        command.push(self.execute_class.clone());
        command
    }

    /// Spawn a command and capture its full output through the consumer
    /// pair: attach both, wait for exit, notify both, collect both.
    fn capture(
        &mut self,
        argv: &[String],
    ) -> Result<(Vec<String>, Vec<String>, i32), ExecutorError> {
        let Some(binary) = argv.first() else {
            return Err(ExecutorError::EmptyCommand(self.name.clone()));
        };
        debug!(executor = %self.name, command = ?argv, "spawning");
        let mut command = Command::new(binary);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = self.device.execute_dir() {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|source| ExecutorError::Spawn {
            command: argv.join(" "),
            source,
        })?;
        let out_pipe = child
            .stdout
            .take()
            .ok_or(ExecutorError::MissingPipe("stdout"))?;
        let err_pipe = child
            .stderr
            .take()
            .ok_or(ExecutorError::MissingPipe("stderr"))?;
        self.stdout.attach(Box::new(out_pipe))?;
        self.stderr.attach(Box::new(err_pipe))?;

        let status = child.wait().map_err(ExecutorError::Wait)?;

        self.stdout.notify_process_exited()?;
        self.stderr.notify_process_exited()?;
        let output = self.stdout.collect_output()?;
        let error = self.stderr.collect_output()?;
        Ok((output, error, exit_code(&status)))
    }
}

impl Executor for CommandExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn backend(&self) -> Backend {
        self.backend
    }

    fn is_bisectable(&self) -> bool {
        self.templates.bisect.is_some()
    }

    fn run(&mut self, program: &Path) -> Result<&ExecutionResult, ExecutorError> {
        let argv = self.execute_command(program);
        let (mut output, error, code) = self.capture(&argv)?;
        if let Some(marker) = &self.verify_failure_marker {
            if error.iter().any(|line| line.contains(marker.as_str())) {
                self.target_verified = false;
            }
        }
        // Synthetic trailing line so return codes participate in output
        // grouping; bisection strips it again.
        output.push(format!("RETURN CODE: {code}"));
        Ok(self
            .last_result
            .insert(ExecutionResult::new(output, error, code)))
    }

    fn result(&self) -> Option<&ExecutionResult> {
        self.last_result.as_ref()
    }

    fn reset(&mut self) {
        self.last_result = None;
        self.target_verified = true;
    }

    fn verify_host(&mut self, program: &Path) -> Result<ExecutionResult, ExecutorError> {
        let Some(template) = self.templates.verify.clone() else {
            // No verifier configured: treat the program as verified.
            return Ok(ExecutionResult::new(Vec::new(), Vec::new(), 0));
        };
        let argv = substitute(&template, program, None, None);
        let (output, error, code) = self.capture(&argv)?;
        Ok(ExecutionResult::new(output, error, code))
    }

    fn target_verified(&self) -> bool {
        self.target_verified
    }

    fn run_bisection_search(
        &mut self,
        program: &Path,
        expected: &Path,
        log: &Path,
    ) -> Result<ExecutionResult, ExecutorError> {
        let Some(template) = self.templates.bisect.clone() else {
            return Err(ExecutorError::NotBisectable(self.name.clone()));
        };
        let argv = substitute(&template, program, Some(expected), Some(log));
        let (output, error, code) = self.capture(&argv)?;
        if code != 0 {
            warn!(executor = %self.name, code, "bisection search exited non-zero");
        }
        Ok(ExecutionResult::new(output, error, code))
    }

    fn shutdown(&mut self) {
        self.stdout.terminate();
        self.stderr.terminate();
    }
}

fn substitute(
    template: &[String],
    program: &Path,
    expected: Option<&Path>,
    log: Option<&Path>,
) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            let mut arg = arg.replace("{program}", &program.display().to_string());
            if let Some(expected) = expected {
                arg = arg.replace("{expected}", &expected.display().to_string());
            }
            if let Some(log) = log {
                arg = arg.replace("{log}", &log.display().to_string());
            }
            arg
        })
        .collect()
}

fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            // Shell convention for signal deaths, e.g. SIGABRT becomes 134.
            return 128 + signal;
        }
    }
    -1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::TIMEOUT_RETURN_CODE;
    use std::io::Write;

    fn shell_executor(script: &str) -> CommandExecutor {
        let templates = CommandTemplates {
            execute: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                script.to_string(),
            ]),
            verify: None,
            bisect: None,
        };
        CommandExecutor::new(
            Backend::Optimizing,
            Architecture::X86_64,
            Device::host(PathBuf::from("/"), None),
            "Main".to_string(),
            10,
            templates,
        )
    }

    #[test]
    fn run_captures_output_and_appends_return_code_line() {
        let mut executor = shell_executor("cat {program}; exit 3");
        let mut program = tempfile::NamedTempFile::new().unwrap();
        writeln!(program, "alpha").unwrap();
        writeln!(program, "beta").unwrap();

        let result = executor.run(program.path()).unwrap();
        assert_eq!(result.output(), ["alpha", "beta", "RETURN CODE: 3"]);
        assert_eq!(result.return_code(), 3);
        executor.shutdown();
    }

    #[test]
    fn run_captures_stderr_separately() {
        let mut executor = shell_executor("echo out; echo err >&2");
        let program = tempfile::NamedTempFile::new().unwrap();
        let result = executor.run(program.path()).unwrap();
        assert_eq!(result.output(), ["out", "RETURN CODE: 0"]);
        assert_eq!(result.error(), ["err"]);
        executor.shutdown();
    }

    #[test]
    fn timeout_sentinel_is_classified_not_errored() {
        let mut executor = shell_executor("exit 124");
        let program = tempfile::NamedTempFile::new().unwrap();
        let result = executor.run(program.path()).unwrap();
        assert_eq!(result.return_code(), TIMEOUT_RETURN_CODE);
        assert!(result.is_timeout());
        executor.shutdown();
    }

    #[test]
    fn verify_failure_marker_flips_target_verified() {
        let mut executor = shell_executor("echo 'Verification error: bad flow' >&2; exit 1");
        let program = tempfile::NamedTempFile::new().unwrap();
        executor.reset();
        assert!(executor.target_verified());
        let _ = executor.run(program.path()).unwrap();
        assert!(!executor.target_verified());
        executor.shutdown();
    }

    #[test]
    fn executor_is_reusable_across_runs() {
        let mut executor = shell_executor("cat {program}");
        let mut first = tempfile::NamedTempFile::new().unwrap();
        writeln!(first, "one").unwrap();
        let mut second = tempfile::NamedTempFile::new().unwrap();
        writeln!(second, "two").unwrap();

        assert_eq!(
            executor.run(first.path()).unwrap().output(),
            ["one", "RETURN CODE: 0"]
        );
        executor.reset();
        assert!(executor.result().is_none());
        assert_eq!(
            executor.run(second.path()).unwrap().output(),
            ["two", "RETURN CODE: 0"]
        );
        executor.shutdown();
    }

    #[test]
    fn bisection_without_command_is_rejected() {
        let mut executor = shell_executor("true");
        let program = tempfile::NamedTempFile::new().unwrap();
        let err = executor
            .run_bisection_search(program.path(), program.path(), program.path())
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NotBisectable(_)));
        executor.shutdown();
    }

    #[test]
    fn spawn_failure_is_reported() {
        let templates = CommandTemplates {
            execute: Some(vec!["./no-such-binary-000".to_string()]),
            verify: None,
            bisect: None,
        };
        let mut executor = CommandExecutor::new(
            Backend::Interpreter,
            Architecture::X86,
            Device::host(PathBuf::from("/"), None),
            "Main".to_string(),
            10,
            templates,
        );
        let program = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            executor.run(program.path()),
            Err(ExecutorError::Spawn { .. })
        ));
        executor.shutdown();
    }
}
