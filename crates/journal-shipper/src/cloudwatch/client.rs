// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;
use tracing::{debug, warn};

use super::sigv4::{sign_request, AwsCredentials, SigningParams};
use super::{ApiError, LogEvent, LogsApi, RejectedLogEventsInfo};
use crate::error::ShipperError;

const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const TARGET_PREFIX: &str = "Logs_20140328";
const SERVICE: &str = "logs";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(rename = "__type")]
    kind: Option<String>,
    #[serde(alias = "Message")]
    message: Option<String>,
    expected_sequence_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogStream {
    log_stream_name: String,
    upload_sequence_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogStreamsResponse {
    #[serde(default)]
    log_streams: Vec<LogStream>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutLogEventsResponse {
    next_sequence_token: Option<String>,
    rejected_log_events_info: Option<RejectedLogEventsInfo>,
}

/// CloudWatch Logs over the JSON 1.1 protocol.
#[derive(Debug, Clone)]
pub struct CloudwatchClient {
    client: reqwest::Client,
    endpoint: String,
    host: String,
    region: String,
    credentials: Option<AwsCredentials>,
}

impl CloudwatchClient {
    /// `endpoint` defaults to `https://logs.<region>.amazonaws.com`.
    /// Without credentials requests are sent unsigned.
    pub fn new(
        client: reqwest::Client,
        region: &str,
        endpoint: Option<&str>,
        credentials: Option<AwsCredentials>,
    ) -> Result<Self, ShipperError> {
        let endpoint = match endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://logs.{region}.amazonaws.com"),
        };
        let url = reqwest::Url::parse(&endpoint)
            .map_err(|e| ShipperError::InvalidConfig(format!("invalid endpoint {endpoint}: {e}")))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ShipperError::InvalidConfig(format!(
                    "endpoint {endpoint} has no host"
                )))
            }
        };
        Ok(Self {
            client,
            endpoint,
            host,
            region: region.to_string(),
            credentials,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call(&self, operation: &str, body: serde_json::Value) -> Result<String, ApiError> {
        let body = serde_json::to_vec(&body).map_err(|e| ApiError::InvalidParameter(e.to_string()))?;
        let target = format!("{TARGET_PREFIX}.{operation}");

        let mut request = self
            .client
            .post(format!("{}/", self.endpoint))
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-target", &target);
        if let Some(credentials) = &self.credentials {
            let params = SigningParams {
                credentials,
                region: &self.region,
                service: SERVICE,
                time: chrono::Utc::now(),
            };
            for (name, value) in sign_request(&params, &self.host, CONTENT_TYPE, &target, &body) {
                request = request.header(name, value);
            }
        }

        let start = Instant::now();
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        debug!(
            "CLOUDWATCH | {operation} returned {status} in {} ms",
            start.elapsed().as_millis()
        );

        if status.is_success() {
            Ok(text)
        } else {
            Err(classify(status, &text))
        }
    }
}

fn decode<T: Default + serde::de::DeserializeOwned>(text: &str) -> Result<T, ApiError> {
    if text.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(text).map_err(|e| ApiError::Unexpected {
        status: 200,
        code: "MalformedResponse".to_string(),
        message: e.to_string(),
    })
}

/// Maps an error response to [`ApiError`] using the `__type` code, which
/// may carry a namespace before `#`.
fn classify(status: StatusCode, text: &str) -> ApiError {
    let body: ErrorBody = serde_json::from_str(text).unwrap_or_default();
    let code = body
        .kind
        .as_deref()
        .and_then(|kind| kind.rsplit('#').next())
        .unwrap_or_default()
        .to_string();
    let message = body.message.unwrap_or_else(|| text.to_string());

    match code.as_str() {
        "ResourceAlreadyExistsException" => ApiError::AlreadyExists,
        "ResourceNotFoundException" => ApiError::ResourceNotFound(message),
        "InvalidSequenceTokenException" => ApiError::InvalidSequenceToken {
            expected: body.expected_sequence_token,
        },
        "DataAlreadyAcceptedException" => ApiError::DataAlreadyAccepted {
            expected: body.expected_sequence_token,
        },
        "ThrottlingException" => ApiError::Throttling(message),
        "ServiceUnavailableException" => ApiError::ServiceUnavailable(message),
        "InvalidParameterException" => ApiError::InvalidParameter(message),
        _ if status == StatusCode::TOO_MANY_REQUESTS => ApiError::Throttling(message),
        _ if status.is_server_error() => ApiError::ServiceUnavailable(message),
        _ => ApiError::Unexpected {
            status: status.as_u16(),
            code,
            message,
        },
    }
}

#[async_trait]
impl LogsApi for CloudwatchClient {
    async fn create_log_group(&self, group: &str) -> Result<(), ApiError> {
        self.call("CreateLogGroup", json!({ "logGroupName": group }))
            .await
            .map(|_| ())
    }

    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), ApiError> {
        self.call(
            "CreateLogStream",
            json!({ "logGroupName": group, "logStreamName": stream }),
        )
        .await
        .map(|_| ())
    }

    async fn describe_sequence_token(&self, group: &str, stream: &str) -> Result<Option<String>, ApiError> {
        let text = self
            .call(
                "DescribeLogStreams",
                json!({
                    "logGroupName": group,
                    "logStreamNamePrefix": stream,
                    "limit": 1,
                }),
            )
            .await?;
        let response: DescribeLogStreamsResponse = decode(&text)?;
        response
            .log_streams
            .into_iter()
            .find(|s| s.log_stream_name == stream)
            .map(|s| s.upload_sequence_token)
            .ok_or_else(|| ApiError::ResourceNotFound(format!("log stream {group}/{stream}")))
    }

    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        token: Option<&str>,
        events: &[LogEvent],
    ) -> Result<Option<String>, ApiError> {
        let mut body = json!({
            "logGroupName": group,
            "logStreamName": stream,
            "logEvents": events,
        });
        if let Some(token) = token {
            body["sequenceToken"] = json!(token);
        }

        let text = self.call("PutLogEvents", body).await?;
        let response: PutLogEventsResponse = decode(&text)?;
        if let Some(rejected) = response.rejected_log_events_info {
            warn!(
                "CLOUDWATCH | {group}/{stream} rejected some events: too new from {:?}, too old until {:?}, expired until {:?}",
                rejected.too_new_log_event_start_index,
                rejected.too_old_log_event_end_index,
                rejected.expired_log_event_end_index
            );
        }
        Ok(response.next_sequence_token)
    }
}
