// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use journal_shipper::{
    cloudwatch::{sigv4::AwsCredentials, CloudwatchClient, MAX_BATCH_BYTES, MAX_BATCH_COUNT},
    config::ShipperConfig,
    cursor::CursorFile,
    error::ShipperError,
    http::get_client,
    journal::{JournalctlSource, StartPosition},
    metadata::{Metadata, DEFAULT_METADATA_ENDPOINT},
    routing::Router,
    tailer::{Tailer, TailerConfig},
    uploader::{RetryConfig, Uploader},
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(
    name = "journald-cloudwatch",
    version,
    about = "Tail the systemd journal into CloudWatch Logs"
)]
struct Args {
    /// File storing the last shipped journal cursor
    #[arg(long, env = "JOURNALD_CW_CURSOR")]
    cursor: PathBuf,

    /// Journal directory, usually /var/log/journal
    #[arg(long, env = "JOURNALD_CW_LOGS")]
    logs: PathBuf,

    /// Log group name template, e.g. '{"my-group"}'
    #[arg(long, env = "JOURNALD_CW_LOG_GROUP")]
    log_group: String,

    /// Log stream name template, e.g. '{$docker_container|$unit|"other"}'
    #[arg(long, env = "JOURNALD_CW_LOG_STREAM")]
    log_stream: String,

    /// AWS region; defaults to the environment, then the instance's region
    #[arg(long, env = "JOURNALD_CW_REGION")]
    region: Option<String>,

    /// CloudWatch Logs endpoint override
    #[arg(long, env = "JOURNALD_CW_ENDPOINT")]
    endpoint: Option<String>,

    /// HTTPS proxy URL; HTTPS_PROXY is used when unset
    #[arg(long, env = "JOURNALD_CW_HTTPS_PROXY")]
    https_proxy: Option<String>,

    /// Instance metadata service address
    #[arg(long, env = "JOURNALD_CW_METADATA_ENDPOINT", default_value = DEFAULT_METADATA_ENDPOINT)]
    metadata_endpoint: String,

    #[arg(long, env = "JOURNALD_CW_FLUSH_INTERVAL", default_value = "5s", value_parser = humantime::parse_duration)]
    flush_interval: Duration,

    /// Time allowed for the final flush on shutdown
    #[arg(long, env = "JOURNALD_CW_SHUTDOWN_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    shutdown_timeout: Duration,

    #[arg(long, env = "JOURNALD_CW_MAX_BATCH_COUNT", default_value_t = MAX_BATCH_COUNT)]
    max_batch_count: usize,

    #[arg(long, env = "JOURNALD_CW_MAX_BATCH_BYTES", default_value_t = MAX_BATCH_BYTES)]
    max_batch_bytes: usize,

    /// Events buffered per destination before reading pauses
    #[arg(long, env = "JOURNALD_CW_MAX_QUEUE_DEPTH", default_value_t = 50_000)]
    max_queue_depth: usize,

    #[arg(long, env = "JOURNALD_CW_MAX_CONCURRENT_UPLOADS", default_value_t = 4)]
    max_concurrent_uploads: usize,

    /// One of trace, debug, info, warn, error
    #[arg(long, env = "JOURNALD_CW_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> (ShipperConfig, String) {
        let https_proxy = self
            .https_proxy
            .or_else(|| std::env::var("HTTPS_PROXY").ok());
        let config = ShipperConfig {
            cursor_path: self.cursor,
            logs_dir: self.logs,
            log_group: self.log_group,
            log_stream: self.log_stream,
            region: self.region,
            endpoint: self.endpoint,
            https_proxy,
            flush_interval: self.flush_interval,
            shutdown_timeout: self.shutdown_timeout,
            max_batch_count: self.max_batch_count,
            max_batch_bytes: self.max_batch_bytes,
            max_queue_depth: self.max_queue_depth,
            max_concurrent_uploads: self.max_concurrent_uploads,
            log_level: self.log_level.to_lowercase(),
        };
        (config, self.metadata_endpoint)
    }
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let (config, metadata_endpoint) = Args::parse().into_config();

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);
    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("could not parse log level in configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
        return ExitCode::FAILURE;
    }

    debug!("Logging subsystem enabled");

    match run(config, metadata_endpoint).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ShipperConfig, metadata_endpoint: String) -> Result<()> {
    config.validate()?;

    let metadata = Metadata::new(metadata_endpoint);
    let facts = metadata.get_or_fetch().await.clone();
    let router = Router::new(&config.log_group, &config.log_stream, facts.clone())?;

    let region = config.resolve_region(&facts)?;
    let credentials = AwsCredentials::from_env();
    if credentials.is_none() {
        warn!("No AWS credentials in the environment, requests will be unsigned");
    }
    let client = CloudwatchClient::new(
        get_client(HTTP_TIMEOUT, config.https_proxy.as_deref()),
        &region,
        config.endpoint.as_deref(),
        credentials,
    )?;
    info!("Shipping to {} in {region}", client.endpoint());

    let cursor_file = CursorFile::new(&config.cursor_path);
    let cursor = cursor_file
        .load()
        .with_context(|| format!("loading cursor from {}", config.cursor_path.display()))?;
    let source = JournalctlSource::new(&config.logs_dir, StartPosition::from_cursor(cursor.clone()));

    let tailer_config = TailerConfig::from(&config);
    let uploader = Uploader::new(Arc::new(client), tailer_config.limits, RetryConfig::default());
    let tailer = Tailer::new(source, router, uploader, cursor_file, cursor, tailer_config);

    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(cancel.clone()));

    match tailer.run(cancel).await {
        Err(ShipperError::ShutdownTimeout) => {
            warn!("Some events were not confirmed before exit and will be sent again on restart");
            Ok(())
        }
        other => Ok(other?),
    }
}

/// Cancels `cancel` on SIGINT or SIGTERM.
async fn wait_for_shutdown(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {e}");
                return;
            }
            info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
    cancel.cancel();
}
