use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{
    Client, StatusCode,
    multipart::{Form, Part},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::warn;
use url::Url;

use crate::{
    camera::capture::{CAPTURE_MIME, CapturedImage},
    core::errors::PipelineError,
    location::Coordinates,
};

/// Who is uploading and for which festival. Injected per call; nothing is
/// read from ambient storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSession {
    pub user_id: String,
    pub festival_id: String,
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PhotoSubmission {
    pub image: CapturedImage,
    pub coords: Option<Coordinates>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPhoto {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub points: Option<i64>,
    #[serde(default)]
    pub has_trash: Option<bool>,
    #[serde(default)]
    pub trash_count: Option<u32>,
    #[serde(default)]
    pub max_trash_confidence: Option<f64>,
    #[serde(default)]
    pub yolo_raw: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    pub photo: UploadedPhoto,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinScanResponse {
    #[serde(default)]
    pub activated: i64,
    #[serde(default)]
    pub converted_count: i64,
    #[serde(default)]
    pub bin_name: Option<String>,
}

#[async_trait]
pub trait ScoringEndpoint: Send + Sync {
    async fn submit_photo(
        &self,
        session: &UserSession,
        submission: &PhotoSubmission,
    ) -> Result<UploadResponse, PipelineError>;
}

#[async_trait]
pub trait BinRedemption: Send + Sync {
    async fn redeem_bin(
        &self,
        session: &UserSession,
        code: &str,
        coords: Option<Coordinates>,
    ) -> Result<BinScanResponse, PipelineError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BinScanRequest<'a> {
    user_id: &'a str,
    bin_code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lng: Option<f64>,
}

#[derive(Deserialize)]
struct ErrorReply {
    #[serde(default)]
    detail: Value,
}

/// HTTP client for the Cash-Up API.
#[derive(Clone)]
pub struct CashUpApi {
    base: Url,
    client: Client,
}

impl CashUpApi {
    /// `timeout` bounds each request end to end, connection setup included.
    pub fn new(base: Url, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .context("failed to build Cash-Up API client")?;
        Ok(Self { base, client })
    }

    fn endpoint(&self, festival_id: &str, tail: &str) -> Result<Url, PipelineError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| PipelineError::NetworkFailure("API base url cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(["api", "festivals", festival_id])
            .extend(tail.split('/'));
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder, session: &UserSession) -> reqwest::RequestBuilder {
        match &session.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(
        request: reqwest::RequestBuilder,
    ) -> Result<T, PipelineError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport_error)?;
        interpret(status, &body)
    }
}

fn transport_error(err: reqwest::Error) -> PipelineError {
    if err.is_timeout() {
        warn!("Cash-Up API request timed out: {err}");
        PipelineError::NetworkFailure(format!("request timed out: {err}"))
    } else {
        PipelineError::NetworkFailure(err.to_string())
    }
}

/// Turns a status and body into the typed reply or the matching error.
fn interpret<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<T, PipelineError> {
    if !status.is_success() {
        let message = serde_json::from_slice::<ErrorReply>(body)
            .ok()
            .and_then(|reply| match reply.detail {
                Value::String(text) => Some(text),
                Value::Object(obj) => obj.get("message").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .unwrap_or_else(|| format!("server replied {status}"));
        return Err(PipelineError::Rejected {
            status: status.as_u16(),
            message,
        });
    }
    serde_json::from_slice(body).map_err(|err| PipelineError::InvalidResponse(err.to_string()))
}

#[async_trait]
impl ScoringEndpoint for CashUpApi {
    async fn submit_photo(
        &self,
        session: &UserSession,
        submission: &PhotoSubmission,
    ) -> Result<UploadResponse, PipelineError> {
        let url = self.endpoint(&session.festival_id, "trash-photos")?;
        let image = Part::bytes(submission.image.payload().to_vec())
            .file_name("capture.jpg")
            .mime_str(CAPTURE_MIME)
            .map_err(|err| PipelineError::CaptureFailed(err.to_string()))?;

        let mut form = Form::new()
            .text("userId", session.user_id.clone())
            .part("image", image);
        if let Some(coords) = submission.coords {
            form = form
                .text("lat", coords.latitude.to_string())
                .text("lng", coords.longitude.to_string());
        }

        let request = self.authorized(self.client.post(url).multipart(form), session);
        Self::send(request).await
    }
}

#[async_trait]
impl BinRedemption for CashUpApi {
    async fn redeem_bin(
        &self,
        session: &UserSession,
        code: &str,
        coords: Option<Coordinates>,
    ) -> Result<BinScanResponse, PipelineError> {
        let url = self.endpoint(&session.festival_id, "trash-bins/scan")?;
        let body = BinScanRequest {
            user_id: &session.user_id,
            bin_code: code,
            lat: coords.map(|c| c.latitude),
            lng: coords.map(|c| c.longitude),
        };
        let request = self.authorized(self.client.post(url).json(&body), session);
        Self::send(request).await
    }
}
