use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::{Client, StatusCode, header};
use tracing::{debug, warn};

use domain::DomainError;
use domain::cloud::{
    ControlPlane, PollOutcome, RegisterOutcome, RegisterRequest, RegisterResponse, StateReport,
};
use domain::state::TargetStateDocument;

/// Report bodies above this size are gzip-compressed.
const COMPRESSION_THRESHOLD: usize = 4096;

/// HTTP client for the cloud control plane.
///
/// One shared `reqwest::Client` with a hard per-request timeout; every call
/// classifies the response status into the domain error taxonomy so callers
/// can apply their own retry policy.
pub struct CloudClient {
    base_url: String,
    client: Client,
}

impl CloudClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DomainError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DomainError::Fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn classify(status: StatusCode, context: &str) -> DomainError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                DomainError::Unauthenticated(format!("{context}: {status}"))
            }
            StatusCode::NOT_FOUND => DomainError::DeviceUnknown(context.to_string()),
            StatusCode::BAD_REQUEST => DomainError::BadRequest(context.to_string()),
            s if s.is_server_error() => {
                DomainError::Transport(format!("{context}: server returned {s}"))
            }
            s => DomainError::Protocol(format!("{context}: unexpected status {s}")),
        }
    }

    fn transport(e: reqwest::Error, context: &str) -> DomainError {
        DomainError::Transport(format!("{context}: {e}"))
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[async_trait]
impl ControlPlane for CloudClient {
    async fn register(
        &self,
        provisioning_key: &str,
        request: &RegisterRequest,
    ) -> Result<RegisterOutcome, DomainError> {
        let resp = self
            .client
            .post(self.url("/device/register"))
            .bearer_auth(provisioning_key)
            .json(request)
            .send()
            .await
            .map_err(|e| Self::transport(e, "register"))?;

        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let body: RegisterResponse = resp
                    .json()
                    .await
                    .map_err(|e| DomainError::Protocol(format!("register: bad body: {e}")))?;
                Ok(RegisterOutcome::Registered(body))
            }
            StatusCode::CONFLICT => {
                debug!("register returned 409, device already registered");
                Ok(RegisterOutcome::AlreadyRegistered)
            }
            status => Err(Self::classify(status, "register")),
        }
    }

    async fn exchange_key(&self, uuid: &str, device_key: &str) -> Result<(), DomainError> {
        let resp = self
            .client
            .post(self.url(&format!("/device/{uuid}/key-exchange")))
            .bearer_auth(device_key)
            .json(&serde_json::json!({ "uuid": uuid, "deviceKey": device_key }))
            .send()
            .await
            .map_err(|e| Self::transport(e, "key-exchange"))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify(resp.status(), "key-exchange"))
        }
    }

    async fn fetch_target_state(
        &self,
        uuid: &str,
        device_key: &str,
        etag: Option<String>,
    ) -> Result<PollOutcome, DomainError> {
        let mut req = self
            .client
            .get(self.url(&format!("/device/{uuid}/state")))
            .bearer_auth(device_key);
        if let Some(etag) = etag {
            req = req.header(header::IF_NONE_MATCH, etag);
        }

        let resp = req.send().await.map_err(|e| Self::transport(e, "poll"))?;

        match resp.status() {
            StatusCode::NOT_MODIFIED => Ok(PollOutcome::NotModified),
            StatusCode::OK => {
                let etag = resp
                    .headers()
                    .get(header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);

                // The body is keyed by device uuid.
                let mut body: HashMap<String, TargetStateDocument> = resp
                    .json()
                    .await
                    .map_err(|e| DomainError::Protocol(format!("poll: bad body: {e}")))?;
                let document = body.remove(uuid).ok_or_else(|| {
                    DomainError::Protocol(format!("poll: body missing entry for {uuid}"))
                })?;
                Ok(PollOutcome::Changed { document, etag })
            }
            status => Err(Self::classify(status, "poll")),
        }
    }

    async fn report_state(
        &self,
        uuid: &str,
        device_key: &str,
        report: &StateReport,
    ) -> Result<(), DomainError> {
        let body = serde_json::to_vec(report)
            .map_err(|e| DomainError::Protocol(format!("report: serialize: {e}")))?;

        let req = self
            .client
            .post(self.url(&format!("/device/{uuid}/state")))
            .bearer_auth(device_key)
            .header(header::CONTENT_TYPE, "application/json");

        let req = if body.len() > COMPRESSION_THRESHOLD {
            match gzip(&body) {
                Ok(compressed) => req
                    .header(header::CONTENT_ENCODING, "gzip")
                    .body(compressed),
                Err(e) => {
                    warn!(error = %e, "gzip failed, sending report uncompressed");
                    req.body(body)
                }
            }
        } else {
            req.body(body)
        };

        let resp = req.send().await.map_err(|e| Self::transport(e, "report"))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify(resp.status(), "report"))
        }
    }

    async fn deprovision(&self, uuid: &str, device_key: &str) -> Result<(), DomainError> {
        let resp = self
            .client
            .delete(self.url(&format!("/devices/{uuid}")))
            .bearer_auth(device_key)
            .send()
            .await
            .map_err(|e| Self::transport(e, "deprovision"))?;

        // 404 counts as already gone.
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::classify(resp.status(), "deprovision"))
        }
    }
}
