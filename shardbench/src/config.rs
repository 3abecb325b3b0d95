//! Configuration for shardbench runs.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `SB__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! # Environment Variables
//!
//! Environment variables use `SB__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `SB__CONCURRENCY=8` issues up to eight requests at the same time
//! - `SB__SHARD_PATH=/api/shard` targets the router instead of a single shard
//! - `SB__LOGGING__LEVEL=debug` raises log verbosity
//!
//! # YAML Configuration File
//!
//! ```yaml
//! remotes:
//!   - http://localhost:8080
//!   - http://localhost:8090
//! shard_path: /shard
//! trials: 100
//! files:
//!   - testdata/configuration.yml
//!   - testdata/Chord.pdf
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use bytesize::ByteSize;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::corpus::MAX_SAMPLE_SIZE;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "SB__";

/// How downloaded objects are checked against what was uploaded.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verify {
    /// Do not look at response bodies.
    None,
    /// Compare the body with the uploaded sample.
    #[default]
    Content,
    /// Compare the body and require its hex SHA-256 digest to equal the object id.
    ///
    /// Only meaningful when the shard derives ids from plain SHA-256 hashes, not from keyed MACs.
    Sha256,
}

/// Format of the final report on stdout.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Output {
    /// Colored, human readable tables.
    #[default]
    Text,
    /// A single JSON document.
    Json,
}

/// Randomly generated payloads, used in place of files.
///
/// Sizes follow a log-normal distribution defined by its median and 99th percentile. This models
/// many small objects with a long tail of larger ones.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Synthetic {
    /// Number of distinct payloads.
    pub count: usize,
    /// Median payload size.
    pub p50: ByteSize,
    /// 99th percentile payload size.
    pub p99: ByteSize,
    /// Seed for sizes and contents. Random if omitted.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty for a TTY, simplified otherwise.
    #[default]
    Auto,
    /// Colored human readable output.
    Pretty,
    /// Plain text output without colors.
    Simplified,
    /// JSON lines.
    Json,
}

/// Logging configuration.
///
/// Logs are always written to stderr so they never interleave with the report.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output, unless overridden by `RUST_LOG`.
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,
    /// Log output format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Main configuration struct for a benchmark run.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Base URLs of the shard nodes. Requests are spread over them round-robin.
    pub remotes: Vec<String>,
    /// Base URLs serving the metrics endpoint. Empty means the same as [`Config::remotes`].
    pub admin_remotes: Vec<String>,
    /// Route of the shard resource, `/shard` for a node or `/api/shard` behind the router.
    pub shard_path: String,
    /// Route of the metrics document.
    pub metrics_path: String,

    /// Number of passes over the corpus and over the stored ids.
    pub trials: usize,
    /// Maximum number of requests in flight. `1` issues requests strictly one after another.
    pub concurrency: usize,
    /// Timeout for a single request.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// How downloads are verified.
    pub verify: Verify,

    /// Files to upload.
    pub files: Vec<PathBuf>,
    /// Generated payloads, used when no files are configured.
    pub synthetic: Option<Synthetic>,

    /// Fully-qualified names of the server-side timers to report.
    pub timers: Vec<String>,
    /// Report format.
    pub output: Output,
    /// Logging configuration.
    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remotes: vec!["http://localhost:8080".into()],
            admin_remotes: vec![],
            shard_path: "/shard".into(),
            metrics_path: "/admin/metrics".into(),

            trials: 100,
            concurrency: 1,
            timeout: Duration::from_secs(30),
            verify: Verify::default(),

            files: vec![],
            synthetic: None,

            timers: vec![
                "edu.stanford.cs244b.Shard.insertItem".into(),
                "edu.stanford.cs244b.Shard.getItem".into(),
            ],
            output: Output::default(),
            logging: Logging::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the provided arguments.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if provided)
    /// 3. Environment variables (prefixed with `SB__`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that cannot drive a run.
    pub fn validate(&self) -> Result<()> {
        if self.remotes.is_empty() {
            bail!("at least one remote is required");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        for (name, path) in [
            ("shard_path", &self.shard_path),
            ("metrics_path", &self.metrics_path),
        ] {
            if !path.starts_with('/') {
                bail!("{name} must start with `/`, got `{path}`");
            }
        }
        if let Some(synthetic) = &self.synthetic {
            if synthetic.count == 0 {
                bail!("synthetic.count must be at least 1");
            }
            if synthetic.p50.as_u64() == 0 {
                bail!("synthetic.p50 must be larger than zero");
            }
            if synthetic.p99 < synthetic.p50 {
                bail!(
                    "synthetic.p99 ({}) must not be smaller than synthetic.p50 ({})",
                    synthetic.p99,
                    synthetic.p50
                );
            }
            if synthetic.p99.as_u64() > MAX_SAMPLE_SIZE {
                bail!(
                    "synthetic.p99 ({}) must not exceed {}",
                    synthetic.p99,
                    ByteSize(MAX_SAMPLE_SIZE)
                );
            }
        }
        Ok(())
    }

    /// Checks the settings only needed by commands that upload objects.
    pub fn validate_workload(&self) -> Result<()> {
        if self.trials == 0 {
            bail!("trials must be at least 1");
        }
        if self.files.is_empty() && self.synthetic.is_none() {
            bail!("either `files` or `synthetic` must be configured");
        }
        Ok(())
    }

    /// The origins to scrape metrics from.
    pub fn admin_remotes(&self) -> &[String] {
        if self.admin_remotes.is_empty() {
            &self.remotes
        } else {
            &self.admin_remotes
        }
    }
}

impl fmt::Display for Verify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verify::None => f.write_str("none"),
            Verify::Content => f.write_str("content"),
            Verify::Sha256 => f.write_str("sha256"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_local_shard() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None).unwrap();

            assert_eq!(config.remotes, ["http://localhost:8080"]);
            assert_eq!(config.admin_remotes(), ["http://localhost:8080"]);
            assert_eq!(config.shard_path, "/shard");
            assert_eq!(config.metrics_path, "/admin/metrics");
            assert_eq!(config.concurrency, 1);
            assert_eq!(config.verify, Verify::Content);
            assert_eq!(config.output, Output::Text);
            assert_eq!(config.timers.len(), 2);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SB__SHARD_PATH", "/api/shard");
            jail.set_env("SB__TRIALS", "7");
            jail.set_env("SB__CONCURRENCY", "4");
            jail.set_env("SB__TIMEOUT", "250ms");
            jail.set_env("SB__VERIFY", "sha256");
            jail.set_env("SB__OUTPUT", "json");
            jail.set_env("SB__LOGGING__LEVEL", "debug");

            let config = Config::load(None).unwrap();

            assert_eq!(config.shard_path, "/api/shard");
            assert_eq!(config.trials, 7);
            assert_eq!(config.concurrency, 4);
            assert_eq!(config.timeout, Duration::from_millis(250));
            assert_eq!(config.verify, Verify::Sha256);
            assert_eq!(config.output, Output::Json);
            assert_eq!(config.logging.level, LevelFilter::DEBUG);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            remotes:
                - http://10.0.0.1:8080
                - http://10.0.0.2:8080
            admin_remotes:
                - http://10.0.0.1:8081
            trials: 3
            files:
                - testdata/configuration.yml
            synthetic:
                count: 10
                p50: 16KiB
                p99: 1MiB
                seed: 42
            timers:
                - edu.stanford.cs244b.Shard.insertItem
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path())).unwrap();

            assert_eq!(config.remotes.len(), 2);
            assert_eq!(config.admin_remotes(), ["http://10.0.0.1:8081"]);
            assert_eq!(config.trials, 3);
            assert_eq!(
                config.files,
                [PathBuf::from("testdata/configuration.yml")]
            );
            assert_eq!(
                config.synthetic,
                Some(Synthetic {
                    count: 10,
                    p50: ByteSize::kib(16),
                    p99: ByteSize::mib(1),
                    seed: Some(42),
                })
            );
            assert_eq!(config.timers, ["edu.stanford.cs244b.Shard.insertItem"]);

            Ok(())
        });
    }

    #[test]
    fn env_overrides_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile.write_all(b"concurrency: 2\n").unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("SB__CONCURRENCY", "16");

            let config = Config::load(Some(tempfile.path())).unwrap();
            assert_eq!(config.concurrency, 16);

            Ok(())
        });
    }

    #[test]
    fn rejects_invalid_settings() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SB__CONCURRENCY", "0");
            assert!(Config::load(None).is_err());
            Ok(())
        });

        figment::Jail::expect_with(|jail| {
            jail.set_env("SB__SHARD_PATH", "shard");
            let err = Config::load(None).unwrap_err();
            assert!(err.to_string().contains("shard_path"));
            Ok(())
        });

        let config = Config {
            synthetic: Some(Synthetic {
                count: 1,
                p50: ByteSize::mib(1),
                p99: ByteSize::kib(1),
                seed: None,
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            synthetic: Some(Synthetic {
                count: 1,
                p50: ByteSize::mib(1),
                p99: ByteSize::gib(4),
                seed: None,
            }),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed"), "{err}");
    }

    #[test]
    fn workload_requires_payloads() {
        let config = Config::default();
        assert!(config.validate_workload().is_err());

        let config = Config {
            files: vec!["payload.bin".into()],
            ..Default::default()
        };
        assert!(config.validate_workload().is_ok());

        let config = Config {
            files: vec!["payload.bin".into()],
            trials: 0,
            ..Default::default()
        };
        assert!(config.validate_workload().is_err());
    }
}
