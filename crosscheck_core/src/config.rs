use crate::executor::Architecture;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Wall-clock budget handed to the external `timeout` wrapper, seconds.
const NORMAL_TIMEOUT_SECS: u64 = 10;
const SHORT_TIMEOUT_SECS: u64 = 2;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("at least one input program is required")]
    NoInputs,

    #[error("--repeat must be at least 1")]
    RepeatTooSmall,

    #[error("cannot use --repeat with --seed; a fixed seed repeats one program")]
    SeedWithRepeat,

    #[error("more than one input requires --repeat")]
    MultipleInputsWithoutRepeat,

    #[error("--max-methods ({max}) must be at least --min-methods ({min})")]
    MethodRangeInverted { min: u32, max: u32 },

    #[error("--min-methods must be at least 1")]
    MinMethodsTooSmall,

    #[error("execution requires at least one architecture flag")]
    NoArchitectures,

    #[error("execution requires --interpreter and/or --optimizing")]
    NoBackends,

    #[error("--device and --host are mutually exclusive")]
    DeviceAndHost,
}

/// Immutable campaign configuration, constructed once from parsed
/// arguments, validated eagerly, and passed by reference into every
/// component that needs it.
#[derive(Debug, Clone)]
pub struct Config {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,

    pub execute: bool,
    pub execute_on_host: bool,
    pub device_name: Option<String>,
    pub execute_dir: Option<PathBuf>,
    pub android_root: PathBuf,
    pub no_boot_image: bool,
    pub skip_host_verify: bool,
    pub execute_class: String,

    pub use_interpreter: bool,
    pub use_optimizing: bool,
    pub architectures: Vec<Architecture>,

    pub dump_output: bool,
    pub dump_verify: bool,

    pub repeat: u64,
    pub short_timeouts: bool,
    pub divergence_retry: u32,
    pub seed: u64,
    pub provided_seed: bool,

    pub method_mutations: u32,
    pub min_methods: u32,
    pub max_methods: u32,
    pub mutate_limit: bool,
    pub skip_mutation: bool,
    pub dump_mutations: Option<PathBuf>,
    pub load_mutations: Option<PathBuf>,
    pub likelihoods_file: Option<PathBuf>,

    pub report_file: Option<PathBuf>,
    pub report_unique: bool,
    pub unique_db: PathBuf,
    pub bisection_search: bool,
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            output: PathBuf::from("fuzzed.bin"),
            execute: false,
            execute_on_host: false,
            device_name: None,
            execute_dir: None,
            android_root: PathBuf::from("/"),
            no_boot_image: false,
            skip_host_verify: false,
            execute_class: "Main".to_string(),
            use_interpreter: true,
            use_optimizing: true,
            architectures: Vec::new(),
            dump_output: false,
            dump_verify: false,
            repeat: 1,
            short_timeouts: false,
            divergence_retry: 10,
            seed: 0,
            provided_seed: false,
            method_mutations: 3,
            min_methods: 2,
            max_methods: 10,
            mutate_limit: false,
            skip_mutation: false,
            dump_mutations: None,
            load_mutations: None,
            likelihoods_file: None,
            report_file: None,
            report_unique: false,
            unique_db: PathBuf::from("unique_progs.db"),
            bisection_search: false,
            quiet: false,
        }
    }
}

impl Config {
    pub fn timeout_secs(&self) -> u64 {
        if self.short_timeouts {
            SHORT_TIMEOUT_SECS
        } else {
            NORMAL_TIMEOUT_SECS
        }
    }

    /// Validate before any execution begins; violations are fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inputs.is_empty() {
            return Err(ConfigError::NoInputs);
        }
        if self.repeat < 1 {
            return Err(ConfigError::RepeatTooSmall);
        }
        if self.provided_seed && self.repeat > 1 {
            return Err(ConfigError::SeedWithRepeat);
        }
        if self.inputs.len() > 1 && self.repeat == 1 {
            return Err(ConfigError::MultipleInputsWithoutRepeat);
        }
        if self.min_methods < 1 {
            return Err(ConfigError::MinMethodsTooSmall);
        }
        if self.max_methods < self.min_methods {
            return Err(ConfigError::MethodRangeInverted {
                min: self.min_methods,
                max: self.max_methods,
            });
        }
        if self.execute {
            if self.architectures.is_empty() {
                return Err(ConfigError::NoArchitectures);
            }
            if !self.use_interpreter && !self.use_optimizing {
                return Err(ConfigError::NoBackends);
            }
            if self.device_name.is_some() && self.execute_on_host {
                return Err(ConfigError::DeviceAndHost);
            }
        }
        Ok(())
    }
}

/// Optional TOML overlay supplying explicit command templates for
/// execution, host verification and bisection, with `{program}`,
/// `{expected}` and `{log}` placeholders. When absent, the built-in
/// runtime invocation is used.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CommandOverrides {
    #[serde(default)]
    pub execute: Option<Vec<String>>,
    #[serde(default)]
    pub verify: Option<Vec<String>>,
    #[serde(default)]
    pub bisect: Option<Vec<String>>,
}

impl CommandOverrides {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read command file at {:?}: {}", path, e))?;
        let overrides: CommandOverrides = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML from {:?}: {}", path, e))?;
        Ok(overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config() -> Config {
        Config {
            inputs: vec![PathBuf::from("seed.bin")],
            execute: true,
            architectures: vec![Architecture::X86_64],
            ..Default::default()
        }
    }

    #[test]
    fn default_knobs_match_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.repeat, 1);
        assert_eq!(config.divergence_retry, 10);
        assert_eq!(config.method_mutations, 3);
        assert_eq!(config.min_methods, 2);
        assert_eq!(config.max_methods, 10);
        assert_eq!(config.execute_class, "Main");
        assert_eq!(config.unique_db, PathBuf::from("unique_progs.db"));
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn seed_with_repeat_is_rejected() {
        let config = Config {
            provided_seed: true,
            repeat: 5,
            ..valid_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SeedWithRepeat)
        ));
    }

    #[test]
    fn multiple_inputs_require_repeat() {
        let config = Config {
            inputs: vec![PathBuf::from("a"), PathBuf::from("b")],
            ..valid_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MultipleInputsWithoutRepeat)
        ));
    }

    #[test]
    fn inverted_method_range_is_rejected() {
        let config = Config {
            min_methods: 8,
            max_methods: 2,
            ..valid_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MethodRangeInverted { .. })
        ));
    }

    #[test]
    fn execution_needs_architectures_and_backends() {
        let no_arch = Config {
            architectures: Vec::new(),
            ..valid_config()
        };
        assert!(matches!(
            no_arch.validate(),
            Err(ConfigError::NoArchitectures)
        ));

        let no_backend = Config {
            use_interpreter: false,
            use_optimizing: false,
            ..valid_config()
        };
        assert!(matches!(no_backend.validate(), Err(ConfigError::NoBackends)));
    }

    #[test]
    fn short_timeouts_shrink_the_budget() {
        let mut config = valid_config();
        assert_eq!(config.timeout_secs(), NORMAL_TIMEOUT_SECS);
        config.short_timeouts = true;
        assert_eq!(config.timeout_secs(), SHORT_TIMEOUT_SECS);
    }

    #[test]
    fn command_overrides_parse_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "execute = [\"sh\", \"-c\", \"run {{program}}\"]\nbisect = [\"bisect\", \"{{expected}}\"]"
        )
        .unwrap();
        let overrides = CommandOverrides::load_from_file(&file.path().to_path_buf()).unwrap();
        assert_eq!(
            overrides.execute,
            Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "run {program}".to_string()
            ])
        );
        assert!(overrides.verify.is_none());
        assert!(overrides.bisect.is_some());
    }
}
