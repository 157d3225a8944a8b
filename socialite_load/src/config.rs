//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.

use std::{
    env, fs, io,
    net::SocketAddr,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use socialite_payload::{content, graph};
use tracing::debug;

use crate::{
    services::{self, Services, http, memory},
    transform,
};

/// Environment variable that, when set, holds the configuration YAML itself
pub const CONFIG_ENV: &str = "SOCIALITE_LOAD_CONFIG";
/// Location of the configuration file when none is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/socialite-load/socialite-load.yaml";

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error for IO operations when probing the config path
    #[error("Failed to inspect config path: {0}")]
    Io(#[from] io::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Generation settings are invalid.
    #[error(transparent)]
    Payload(#[from] socialite_payload::Error),
    /// Transform settings are invalid.
    #[error(transparent)]
    Transform(#[from] transform::Error),
    /// Target settings are invalid.
    #[error(transparent)]
    Services(#[from] services::Error),
}

fn default_queue_capacity() -> NonZeroUsize {
    NonZeroUsize::new(1_000).unwrap_or(NonZeroUsize::MIN)
}

fn default_progress_interval_seconds() -> u64 {
    10
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// The seed for all random generation. A random seed is chosen and logged
    /// when absent.
    #[serde(default)]
    pub seed: Option<[u8; 32]>,
    /// Maximum number of work items waiting for a worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: NonZeroUsize,
    /// Complete every graph item before the first messaging item is queued
    #[serde(default)]
    pub drain_between_phases: bool,
    /// Seconds between progress reports. Zero disables them.
    #[serde(default = "default_progress_interval_seconds")]
    pub progress_interval_seconds: u64,
    /// Follow graph shape
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub graph: graph::Config,
    /// Synthesized content shape
    #[serde(default)]
    pub content: content::Config,
    /// Settings for the encrypting transform
    #[serde(default)]
    pub transform: transform::Config,
    /// The services driven by the workload
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub target: Target,
    /// The method by which to express telemetry
    #[serde(default)]
    pub telemetry: Option<Telemetry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: None,
            queue_capacity: default_queue_capacity(),
            drain_between_phases: false,
            progress_interval_seconds: default_progress_interval_seconds(),
            graph: graph::Config::default(),
            content: content::Config::default(),
            transform: transform::Config::default(),
            target: Target::default(),
            telemetry: None,
        }
    }
}

/// The services a run is pointed at
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum Target {
    /// Drive the in-process memory backend
    Memory(memory::Config),
    /// Drive a live deployment over HTTP
    Http(http::Config),
}

impl Default for Target {
    fn default() -> Self {
        Target::Memory(memory::Config::default())
    }
}

impl Target {
    /// Construct the [`Services`] for this target.
    ///
    /// # Errors
    ///
    /// Function will error if the HTTP backend cannot be built.
    pub fn services(&self) -> Result<Services, services::Error> {
        match self {
            Target::Memory(config) => {
                let backend = memory::Memory::from_config(*config);
                Ok(Services::from_backend(Arc::new(backend)))
            }
            Target::Http(config) => {
                let backend = http::Http::new(config)?;
                Ok(Services::from_backend(Arc::new(backend)))
            }
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(untagged)]
/// Defines the manner of socialite-load's telemetry.
pub enum Telemetry {
    /// Emit internal telemetry for scraping at a prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

impl Config {
    /// Parse a [`Config`] from YAML. Empty input yields the defaults.
    ///
    /// # Errors
    ///
    /// Function will error if `contents` is not a valid configuration.
    pub fn parse(contents: &str) -> Result<Self, Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Load the configuration.
    ///
    /// The contents of [`CONFIG_ENV`] take precedence when set. Otherwise
    /// `path`, which must exist, is read. With neither, [`DEFAULT_CONFIG_PATH`]
    /// is read if present and the defaults are used if not.
    ///
    /// # Errors
    ///
    /// Function will error if the configuration cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        Self::load_from(
            env::var(CONFIG_ENV).ok(),
            path,
            Path::new(DEFAULT_CONFIG_PATH),
        )
    }

    fn load_from(
        env_contents: Option<String>,
        path: Option<&Path>,
        default_path: &Path,
    ) -> Result<Self, Error> {
        if let Some(contents) = env_contents {
            debug!("Using config from env var '{CONFIG_ENV}'");
            return Self::parse(&contents);
        }
        let path = match path {
            Some(path) => path,
            None if default_path.try_exists()? => default_path,
            None => {
                debug!(
                    "No configuration at {}, using defaults",
                    default_path.display()
                );
                return Ok(Self::default());
            }
        };
        debug!("Attempting to open configuration file at: {}", path.display());
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::parse(&contents)
    }

    /// Check every setting that can be checked before a run starts.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), Error> {
        graph::FanOut::new(0, self.graph.exponent)?;
        self.content.validate()?;
        transform::LocalKey::new(&self.transform)?;
        if let Target::Http(config) = &self.target {
            http::Http::new(config)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, num::NonZeroUsize, path::Path};

    use socialite_payload::{User, graph::Selection};

    use super::{Config, Error, Target, Telemetry};
    use crate::services::{self, http, memory};

    const MISSING: &str = "/nonexistent/socialite-load/socialite-load.yaml";

    #[test]
    fn missing_default_path_uses_defaults() {
        let config = Config::load_from(None, None, Path::new(MISSING)).expect("defaults");
        assert_eq!(config, Config::default());
        assert_eq!(config.queue_capacity.get(), 1_000);
        assert_eq!(config.progress_interval_seconds, 10);
        assert_eq!(config.target, Target::default());
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let res = Config::load_from(None, Some(Path::new(MISSING)), Path::new(MISSING));
        assert!(matches!(res, Err(Error::ReadFile { .. })));
    }

    #[test]
    fn environment_contents_take_precedence() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "queue_capacity: 7").expect("write");

        let config = Config::load_from(
            Some("queue_capacity: 3".to_string()),
            Some(file.path()),
            Path::new(MISSING),
        )
        .expect("valid config");
        assert_eq!(config.queue_capacity.get(), 3);
    }

    #[test]
    fn default_path_is_read_when_present() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "drain_between_phases: true").expect("write");

        let config = Config::load_from(None, None, file.path()).expect("valid config");
        assert!(config.drain_between_phases);
    }

    #[test]
    fn full_configuration_parses() {
        let seed: Vec<String> = (0..32).map(|i| i.to_string()).collect();
        let contents = format!(
            r"
seed: [{seed}]
queue_capacity: 16
drain_between_phases: true
progress_interval_seconds: 0
graph:
  exponent: 2.0
  selection:
    recent:
      window: 50
content:
  min_length: 5
  max_length: 6
  field_count: 2
transform:
  encrypt_fields: [field0]
target:
  http:
    base_uri: http://localhost:8080
telemetry:
  addr: 127.0.0.1:9000
  global_labels:
    env: test
",
            seed = seed.join(", ")
        );
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write");

        let config =
            Config::load_from(None, Some(file.path()), Path::new(MISSING)).expect("valid config");
        let mut expected_seed = [0u8; 32];
        for (i, byte) in expected_seed.iter_mut().enumerate() {
            *byte = u8::try_from(i).expect("small index");
        }
        assert_eq!(config.seed, Some(expected_seed));
        assert_eq!(config.queue_capacity.get(), 16);
        assert!(config.drain_between_phases);
        assert_eq!(config.progress_interval_seconds, 0);
        assert!((config.graph.exponent - 2.0).abs() < f64::EPSILON);
        assert_eq!(
            config.graph.selection,
            Selection::Recent {
                window: NonZeroUsize::new(50).expect("non-zero")
            }
        );
        assert_eq!(config.content.field_count, 2);
        assert_eq!(config.transform.encrypt_fields, vec!["field0".to_string()]);
        assert_eq!(
            config.target,
            Target::Http(http::Config {
                base_uri: "http://localhost:8080".parse().expect("valid uri"),
                request_timeout_millis: 5_000,
            })
        );
        let Some(Telemetry::Prometheus {
            addr,
            global_labels,
        }) = config.telemetry
        else {
            panic!("telemetry configured");
        };
        assert_eq!(addr.port(), 9000);
        assert_eq!(global_labels.get("env").map(String::as_str), Some("test"));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(matches!(
            Config::parse("queue_capacty: 10"),
            Err(Error::SerdeYaml(_))
        ));
    }

    #[test]
    fn zero_queue_capacity_rejected() {
        assert!(matches!(
            Config::parse("queue_capacity: 0"),
            Err(Error::SerdeYaml(_))
        ));
    }

    #[test]
    fn validate_catches_bad_settings() {
        let mut config = Config::default();
        config.validate().expect("defaults are valid");

        config.content.min_length = 50;
        config.content.max_length = 5;
        assert!(matches!(config.validate(), Err(Error::Payload(_))));

        let mut config = Config::default();
        config.graph.exponent = -1.0;
        assert!(matches!(config.validate(), Err(Error::Payload(_))));

        let mut config = Config::default();
        config.transform.key = Some("c2hvcnQ=".to_string());
        assert!(matches!(config.validate(), Err(Error::Transform(_))));

        let config = Config {
            target: Target::Http(http::Config {
                base_uri: "localhost".parse().expect("parsable uri"),
                request_timeout_millis: 10,
            }),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Services(_))));
    }

    #[tokio::test]
    async fn strict_memory_target_rejects_duplicate_users() {
        let config = Config::parse("target:\n  memory:\n    strict: true\n").expect("valid config");
        assert_eq!(config.target, Target::Memory(memory::Config { strict: true }));
        let target = config.target.services().expect("memory services");
        let user = User::new("1");
        target.graph.create_user(&user).await.expect("first create");
        assert!(matches!(
            target.graph.create_user(&user).await,
            Err(services::Error::Duplicate(_))
        ));
    }

    #[test]
    fn malformed_http_target_fails_check() {
        for base_uri in ["http://exa mple.com", "http://host:notaport", "http://[::1"] {
            let contents = format!("target:\n  http:\n    base_uri: '{base_uri}'\n");
            let res = Config::parse(&contents).and_then(|config| config.validate());
            assert!(res.is_err(), "{base_uri} passed the check");
        }
        let contents = "target:\n  http:\n    base_uri: 'http://localhost:8080/api'\n";
        let config = Config::parse(contents).expect("valid config");
        config.validate().expect("usable target");
    }
}
