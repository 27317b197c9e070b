use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum MutationError {
    #[error("failed to read seed program {path:?}: {source}")]
    ReadSeed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write fuzzed program {path:?}: {source}")]
    WriteFuzzed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("seed program {0:?} is empty")]
    EmptySeed(PathBuf),

    #[error("failed to load mutation list from {path:?}: {reason}")]
    LoadMutations { path: PathBuf, reason: String },

    #[error("failed to dump mutation list to {path:?}: {reason}")]
    DumpMutations { path: PathBuf, reason: String },
}

/// One atomic edit applied to the program bytes. Serialized as JSON so a
/// dumped mutation list stays hand-editable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteMutation {
    pub offset: u64,
    pub delta: u8,
}

/// A fuzzed program ready for differential execution: the path of the
/// written file plus the mutation list that produced it.
#[derive(Debug, Clone)]
pub struct FuzzedProgram {
    pub path: PathBuf,
    pub mutations: Vec<ByteMutation>,
}

/// The harness-facing contract of the mutation engine: per iteration, yield
/// a fuzzed program file, or a [`MutationError`] the campaign can survive.
pub trait ProgramMutator {
    fn fuzz(&mut self, seed: u64) -> Result<FuzzedProgram, MutationError>;
}

/// Byte-level mutator over a set of seed program files.
///
/// Deterministic for a given iteration seed: the same seed picks the same
/// input file and the same mutation list. Supports replaying a previously
/// dumped list instead of generating one, and skipping mutation entirely to
/// sanity-check the seed programs themselves.
pub struct FileByteMutator {
    inputs: Vec<PathBuf>,
    output: PathBuf,
    mutation_count: u32,
    mutate_limit: bool,
    skip_mutation: bool,
    dump_to: Option<PathBuf>,
    load_from: Option<PathBuf>,
}

impl FileByteMutator {
    pub fn new(inputs: Vec<PathBuf>, output: PathBuf, mutation_count: u32) -> Self {
        Self {
            inputs,
            output,
            mutation_count,
            mutate_limit: false,
            skip_mutation: false,
            dump_to: None,
            load_from: None,
        }
    }

    pub fn with_mutate_limit(mut self, limit: bool) -> Self {
        self.mutate_limit = limit;
        self
    }

    pub fn with_skip_mutation(mut self, skip: bool) -> Self {
        self.skip_mutation = skip;
        self
    }

    pub fn with_dump_to(mut self, path: Option<PathBuf>) -> Self {
        self.dump_to = path;
        self
    }

    pub fn with_load_from(mut self, path: Option<PathBuf>) -> Self {
        self.load_from = path;
        self
    }

    fn generate(&self, len: u64, rng: &mut ChaCha8Rng) -> Vec<ByteMutation> {
        // With --mutate-limit the leading quarter of the file is left
        // alone, keeping header-like regions intact.
        let floor = if self.mutate_limit { len / 4 } else { 0 };
        (0..self.mutation_count)
            .map(|_| ByteMutation {
                offset: rng.random_range(floor..len),
                delta: rng.random_range(1u8..=15u8),
            })
            .collect()
    }

    fn load_mutations(&self, path: &Path) -> Result<Vec<ByteMutation>, MutationError> {
        let text = fs::read_to_string(path).map_err(|e| MutationError::LoadMutations {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| MutationError::LoadMutations {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn dump_mutations(&self, path: &Path, mutations: &[ByteMutation]) -> Result<(), MutationError> {
        let text =
            serde_json::to_string_pretty(mutations).map_err(|e| MutationError::DumpMutations {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        fs::write(path, text).map_err(|e| MutationError::DumpMutations {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

impl ProgramMutator for FileByteMutator {
    fn fuzz(&mut self, seed: u64) -> Result<FuzzedProgram, MutationError> {
        let input = &self.inputs[(seed as usize) % self.inputs.len()];
        let mut bytes = fs::read(input).map_err(|source| MutationError::ReadSeed {
            path: input.clone(),
            source,
        })?;
        if bytes.is_empty() {
            return Err(MutationError::EmptySeed(input.clone()));
        }

        let mutations = if self.skip_mutation {
            info!("skipping mutation stage as requested");
            Vec::new()
        } else if let Some(path) = self.load_from.clone() {
            self.load_mutations(&path)?
        } else {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            self.generate(bytes.len() as u64, &mut rng)
        };

        for mutation in &mutations {
            let offset = (mutation.offset as usize) % bytes.len();
            bytes[offset] = bytes[offset].wrapping_add(mutation.delta);
        }

        fs::write(&self.output, &bytes).map_err(|source| MutationError::WriteFuzzed {
            path: self.output.clone(),
            source,
        })?;

        if let Some(path) = self.dump_to.clone() {
            self.dump_mutations(&path, &mutations)?;
        }

        Ok(FuzzedProgram {
            path: self.output.clone(),
            mutations,
        })
    }
}
