use std::sync::OnceLock;

/// Return code produced by the external `timeout` wrapper when the wall
/// clock ran out before the target finished.
pub const TIMEOUT_RETURN_CODE: i32 = 124;

/// Return code produced when the target died with SIGABRT (128 + 6).
pub const SIGABORT_RETURN_CODE: i32 = 134;

/// The captured outcome of one backend invocation: ordered stdout lines,
/// ordered stderr lines and the process return code.
///
/// Immutable once constructed. The flattened views are derived lazily and
/// memoized, since the same result is flattened repeatedly during grouping
/// and reporting.
#[derive(Debug, Default)]
pub struct ExecutionResult {
    output: Vec<String>,
    error: Vec<String>,
    return_code: i32,
    flattened_output: OnceLock<String>,
    flattened_output_newlines: OnceLock<String>,
    flattened_error: OnceLock<String>,
    flattened_error_newlines: OnceLock<String>,
    flattened_all: OnceLock<String>,
}

impl Clone for ExecutionResult {
    fn clone(&self) -> Self {
        // Memoized views are cheap to recompute; start the clone cold.
        Self::new(self.output.clone(), self.error.clone(), self.return_code)
    }
}

impl PartialEq for ExecutionResult {
    fn eq(&self, other: &Self) -> bool {
        self.output == other.output
            && self.error == other.error
            && self.return_code == other.return_code
    }
}

impl Eq for ExecutionResult {}

impl ExecutionResult {
    pub fn new(output: Vec<String>, error: Vec<String>, return_code: i32) -> Self {
        Self {
            output,
            error,
            return_code,
            ..Default::default()
        }
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn error(&self) -> &[String] {
        &self.error
    }

    pub fn return_code(&self) -> i32 {
        self.return_code
    }

    /// Output lines joined with single spaces. This is the canonical form
    /// used for divergence grouping and output deduplication.
    pub fn flattened_output(&self) -> &str {
        self.flattened_output
            .get_or_init(|| self.output.join(" "))
    }

    pub fn flattened_output_with_newlines(&self) -> &str {
        self.flattened_output_newlines
            .get_or_init(|| join_with_newlines(&self.output))
    }

    pub fn flattened_error(&self) -> &str {
        self.flattened_error.get_or_init(|| self.error.join(" "))
    }

    pub fn flattened_error_with_newlines(&self) -> &str {
        self.flattened_error_newlines
            .get_or_init(|| join_with_newlines(&self.error))
    }

    /// Output followed by error, newline separated. Used when dumping a
    /// full invocation transcript.
    pub fn flattened_all_with_newlines(&self) -> &str {
        self.flattened_all.get_or_init(|| {
            let mut all = join_with_newlines(&self.output);
            all.push_str(&join_with_newlines(&self.error));
            all
        })
    }

    pub fn is_timeout(&self) -> bool {
        self.return_code == TIMEOUT_RETURN_CODE
    }

    pub fn is_sigabort(&self) -> bool {
        self.return_code == SIGABORT_RETURN_CODE
    }
}

fn join_with_newlines(lines: &[String]) -> String {
    let mut joined = String::new();
    for line in lines {
        joined.push_str(line);
        joined.push('\n');
    }
    joined
}
