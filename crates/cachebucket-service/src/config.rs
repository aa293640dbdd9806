use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Name of the cache directory below the user's cache directory.
const CACHE_DIR_NAME: &str = ".gocachebucket";

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
///
/// Logs always go to stderr, stdout is reserved for protocol traffic.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::ERROR,
            format: LogFormat::Auto,
            enable_backtraces: false,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "cachebucket".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Tuning of the background upload pipeline.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    /// The number of queued up uploads to the remote store.
    ///
    /// Once the queue is full, storing a new output waits for a free slot.
    pub max_upload_queue_size: usize,

    /// The number of uploads that run concurrently.
    pub max_concurrent_uploads: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_queue_size: 1000,
            max_concurrent_uploads: 20,
        }
    }
}

/// Settings for the S3 backend.
///
/// Both values can also be given as `region` and `endpoint` query parameters of the bucket URL,
/// which take precedence.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct S3Config {
    /// The AWS region, falls back to the usual AWS environment configuration.
    pub region: Option<String>,
    /// A custom endpoint, for S3 compatible stores such as MinIO.
    pub endpoint: Option<String>,
}

/// Settings for the GCS backend.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct GcsConfig {
    /// Path to a service account key file.
    ///
    /// Without one, the default GCP credentials of the environment are used.
    pub service_account_path: Option<PathBuf>,
    /// A custom endpoint, for GCS emulators.
    pub endpoint: Option<String>,
    /// Send requests without credentials, e.g. to a public bucket or an emulator.
    pub anonymous: bool,
}

/// Configuration of the remote tier.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// URL of the bucket, e.g. `s3://my-bucket`, `gs://my-bucket` or `file:///srv/cache`.
    pub url: Option<String>,

    /// A prefix that is prepended verbatim to every remote key.
    pub prefix: String,

    /// S3 specific settings.
    pub s3: S3Config,

    /// GCS specific settings.
    pub gcs: GcsConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the local disk cache.
    pub cache_dir: PathBuf,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The remote object store.
    pub remote: RemoteConfig,

    /// The background upload pipeline.
    pub uploads: UploadConfig,

    /// Disables the `put` command, nothing is ever written to either tier.
    pub readonly: bool,
}

/// Default value for the "cache_dir" configuration.
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join(CACHE_DIR_NAME)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: default_cache_dir(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            remote: RemoteConfig::default(),
            uploads: UploadConfig::default(),
            readonly: false,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
