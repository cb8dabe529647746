// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::batcher::{BatchLimits, DEFAULT_MAX_QUEUE_DEPTH};
use crate::cloudwatch::{MAX_BATCH_BYTES, MAX_BATCH_COUNT, MAX_BATCH_SPAN};
use crate::error::ShipperError;
use crate::metadata::Facts;

/// Configuration for the journal shipper
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// File holding the last confirmed journal cursor
    pub cursor_path: PathBuf,
    /// Journal directory to read
    pub logs_dir: PathBuf,
    /// Log group name template
    pub log_group: String,
    /// Log stream name template
    pub log_stream: String,
    /// AWS region; resolved at startup when absent
    pub region: Option<String>,
    /// Override for the CloudWatch Logs endpoint
    pub endpoint: Option<String>,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
    /// How often open batches are flushed
    pub flush_interval: Duration,
    /// Grace period for in-flight uploads on shutdown
    pub shutdown_timeout: Duration,
    pub max_batch_count: usize,
    pub max_batch_bytes: usize,
    /// Events held per destination before reading pauses
    pub max_queue_depth: usize,
    /// Uploads allowed in flight across all destinations
    pub max_concurrent_uploads: usize,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            cursor_path: PathBuf::from("/var/lib/journald-cloudwatch/cursor"),
            logs_dir: PathBuf::from("/var/log/journal"),
            log_group: String::new(),
            log_stream: String::new(),
            region: None,
            endpoint: None,
            https_proxy: None,
            flush_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            max_batch_count: MAX_BATCH_COUNT,
            max_batch_bytes: MAX_BATCH_BYTES,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            max_concurrent_uploads: 4,
            log_level: "info".to_string(),
        }
    }
}

impl ShipperConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ShipperError> {
        if self.log_group.trim().is_empty() {
            return Err(ShipperError::InvalidConfig(
                "log group template cannot be empty".to_string(),
            ));
        }
        if self.log_stream.trim().is_empty() {
            return Err(ShipperError::InvalidConfig(
                "log stream template cannot be empty".to_string(),
            ));
        }

        if self.max_batch_count == 0 || self.max_batch_count > MAX_BATCH_COUNT {
            return Err(ShipperError::InvalidConfig(format!(
                "max batch count must be between 1 and {MAX_BATCH_COUNT}"
            )));
        }
        if self.max_batch_bytes == 0 || self.max_batch_bytes > MAX_BATCH_BYTES {
            return Err(ShipperError::InvalidConfig(format!(
                "max batch bytes must be between 1 and {MAX_BATCH_BYTES}"
            )));
        }
        if self.max_queue_depth < self.max_batch_count {
            return Err(ShipperError::InvalidConfig(
                "max queue depth must be at least the max batch count".to_string(),
            ));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(ShipperError::InvalidConfig(
                "max concurrent uploads must be greater than 0".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(ShipperError::InvalidConfig(
                "flush interval must be greater than 0".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ShipperError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_count: self.max_batch_count,
            max_bytes: self.max_batch_bytes,
            max_span: MAX_BATCH_SPAN,
        }
    }

    /// The configured region, else `AWS_DEFAULT_REGION` or `AWS_REGION`,
    /// else the instance's own region.
    pub fn resolve_region(&self, facts: &Facts) -> Result<String, ShipperError> {
        self.region
            .clone()
            .or_else(|| env::var("AWS_DEFAULT_REGION").ok())
            .or_else(|| env::var("AWS_REGION").ok())
            .filter(|region| !region.trim().is_empty())
            .or_else(|| facts.get("region").map(str::to_string))
            .ok_or(ShipperError::RegionUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn config() -> ShipperConfig {
        ShipperConfig {
            log_group: "{\"G\"}".to_string(),
            log_stream: "{$unit|\"other\"}".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_default_config_needs_templates() {
        let error = ShipperConfig::default().validate().unwrap_err();
        assert_eq!(
            error.to_string(),
            "Invalid configuration: log group template cannot be empty"
        );
    }

    #[test]
    fn test_validate_batch_limits() {
        let over = ShipperConfig {
            max_batch_count: MAX_BATCH_COUNT + 1,
            ..config()
        };
        assert!(over.validate().is_err());

        let zero = ShipperConfig {
            max_batch_bytes: 0,
            ..config()
        };
        assert!(zero.validate().is_err());

        let shallow = ShipperConfig {
            max_batch_count: 100,
            max_queue_depth: 10,
            ..config()
        };
        assert!(shallow.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = ShipperConfig {
            log_level: "verbose".to_string(),
            ..config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_region_from_flag() {
        env::set_var("AWS_DEFAULT_REGION", "eu-west-1");
        let config = ShipperConfig {
            region: Some("us-east-2".to_string()),
            ..config()
        };
        assert_eq!(config.resolve_region(&Facts::default()).unwrap(), "us-east-2");
        env::remove_var("AWS_DEFAULT_REGION");
    }

    #[test]
    #[serial]
    fn test_region_from_env() {
        env::remove_var("AWS_DEFAULT_REGION");
        env::set_var("AWS_REGION", "ap-south-1");
        let facts: Facts = [("region", "us-west-2")].into_iter().collect();
        assert_eq!(config().resolve_region(&facts).unwrap(), "ap-south-1");
        env::remove_var("AWS_REGION");
    }

    #[test]
    #[serial]
    fn test_region_from_metadata() {
        env::remove_var("AWS_DEFAULT_REGION");
        env::remove_var("AWS_REGION");
        let facts: Facts = [("region", "us-west-2")].into_iter().collect();
        assert_eq!(config().resolve_region(&facts).unwrap(), "us-west-2");
        assert!(matches!(
            config().resolve_region(&Facts::default()),
            Err(ShipperError::RegionUnavailable)
        ));
    }
}
