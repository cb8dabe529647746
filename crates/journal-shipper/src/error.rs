// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::cloudwatch::ApiError;
use crate::cursor::CursorError;
use crate::format::ParseError;
use crate::journal::SourceError;

/// Errors that stop the shipper as a whole.
///
/// Everything that can be recovered locally (unroutable messages, throttling,
/// journal gaps) is handled inside the pipeline and never surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum ShipperError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid {which} template: {source}")]
    Template {
        which: &'static str,
        #[source]
        source: ParseError,
    },

    #[error("Unable to determine the AWS region")]
    RegionUnavailable,

    #[error("Cursor file error: {0}")]
    Cursor(#[from] CursorError),

    #[error("Journal source error: {0}")]
    Source(#[from] SourceError),

    #[error("Ingestion API error: {0}")]
    Api(#[from] ApiError),

    #[error("Shutdown timeout exceeded")]
    ShutdownTimeout,
}
