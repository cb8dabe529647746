// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client construction shared by the ingestion client and the metadata
//! fetch.

use core::time::Duration;
use std::error::Error;
use tracing::error;

/// Builds a client with the given request timeout and optional HTTPS proxy.
///
/// An unparsable proxy is logged and ignored so the shipper keeps running
/// over a direct connection.
#[must_use]
pub fn get_client(timeout: Duration, https_proxy: Option<&str>) -> reqwest::Client {
    match build_client(timeout, https_proxy) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client(timeout, None) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(timeout: Duration, https_proxy: Option<&str>) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut client = reqwest::Client::builder()
        .timeout(timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if let Some(https_uri) = https_proxy {
        client = client.proxy(reqwest::Proxy::https(https_uri)?);
    }

    Ok(client.build()?)
}
