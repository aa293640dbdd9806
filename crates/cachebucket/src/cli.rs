//! Exposes the command line application.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use cachebucket_service::caching::{Cacher, DiskStore, TieredCache};
use cachebucket_service::config::Config;
use cachebucket_service::remote::{self, RemoteLayout};
use cachebucket_service::{metrics, protocol};
use clap::Parser;
use tracing::level_filters::LevelFilter;

use crate::logging;

/// A Go build cache backed by an object store bucket.
///
/// Set `GOCACHEPROG="cachebucket s3://my-bucket"` to have the Go toolchain use it. Build outputs
/// are kept in a local disk cache and uploaded to the bucket in the background.
#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about)]
struct Cli {
    /// URL of the bucket, e.g. `s3://my-bucket`, `gs://my-bucket` or `file:///srv/cache`.
    ///
    /// Can also be set as `remote.url` in the configuration file.
    bucket: Option<String>,

    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Prefix prepended to every object key in the bucket.
    #[arg(long, short)]
    prefix: Option<String>,

    /// Log at least informational messages.
    #[arg(long, short)]
    verbose: bool,

    /// Only read from the cache, never store anything.
    #[arg(long)]
    readonly: bool,
}

impl Cli {
    /// Applies the command line overrides on top of the configuration file.
    fn apply(&self, config: &mut Config) {
        if let Some(bucket) = &self.bucket {
            config.remote.url = Some(bucket.clone());
        }
        if let Some(prefix) = &self.prefix {
            config.remote.prefix = prefix.clone();
        }
        if self.verbose {
            config.logging.level = config.logging.level.max(LevelFilter::INFO);
        }
        config.readonly |= self.readonly;
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    cli.apply(&mut config);

    let bucket_url = config
        .remote
        .url
        .clone()
        .context("missing bucket URL, pass it as an argument or set `remote.url`")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No other threads have been spawned yet.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure metrics")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("cachebucket")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(run(config, bucket_url))
}

/// Serves the build tool on stdin and stdout until it goes away.
async fn run(config: Config, bucket_url: String) -> Result<()> {
    let disk = DiskStore::new(&config.cache_dir).with_context(|| {
        format!(
            "failed to create cache directory {}",
            config.cache_dir.display()
        )
    })?;
    disk.clear_tmp()
        .context("failed to clear temporary cache files")?;

    let remote = remote::open(&bucket_url, &config.remote)
        .await
        .context("failed to open bucket")?;
    tracing::info!(
        cache_dir = %config.cache_dir.display(),
        remote = remote.name(),
        readonly = config.readonly,
        "Starting cachebucket",
    );

    let layout = RemoteLayout::new(config.remote.prefix.clone());
    let cache = TieredCache::new(disk, remote, layout, &config.uploads);
    let cacher = Arc::new(Cacher::new(Arc::new(cache)));

    let start = Instant::now();
    protocol::serve(
        cacher,
        config.readonly,
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await
    .context("cache session failed")?;
    tracing::info!(took = ?start.elapsed(), "Waited for uploads, exiting");

    Ok(())
}
