pub mod bisect;
pub mod config;
pub mod diverge;
pub mod executor;
pub mod fuzzer;
pub mod listener;
pub mod mutator;
pub mod result;
pub mod stream;
pub mod tracker;

pub use bisect::{run_bisection, BISECTION_OUTPUT_DIR};
pub use config::{CommandOverrides, Config, ConfigError};
pub use diverge::{expected_text, group_results, is_architecture_split, DivergenceGroup, ExecutorSummary, ResultKey};
pub use executor::{
    Architecture, Backend, CommandExecutor, CommandTemplates, Device, Executor, ExecutorError,
};
pub use fuzzer::Fuzzer;
pub use listener::{
    CampaignStatus, ConsoleListener, FinalStatusListener, Listener, LogFileListener,
    MultiplexerListener,
};
pub use mutator::{ByteMutation, FileByteMutator, FuzzedProgram, MutationError, ProgramMutator};
pub use result::{ExecutionResult, SIGABORT_RETURN_CODE, TIMEOUT_RETURN_CODE};
pub use stream::{StreamConsumer, StreamError};
pub use tracker::{UniqueProgramTracker, UniqueProgramTrackerListener};
