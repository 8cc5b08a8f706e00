//! `reqwest` adapter for the kiosk HTTP endpoints.

use std::time::Duration;

use async_trait::async_trait;
use kiosk_core::{
    CollectionSnapshot, KioskError, KioskErrorCategory, KioskSettings, NewSlide, SignedUrls,
    Slide, SlidePosition, StoredFile, classify_http_status,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode, header::RETRY_AFTER, multipart};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, warn};
use url::Url;

use crate::api::KioskApi;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct ReorderBody<'a> {
    positions: &'a [SlidePosition],
}

#[derive(Serialize)]
struct SignBody<'a> {
    paths: &'a [String],
}

#[derive(Deserialize)]
struct SignResponse {
    urls: SignedUrls,
}

/// HTTP client scoped to one scoreboard's kiosk.
#[derive(Clone)]
pub struct HttpKioskApi {
    client: Client,
    base_url: Url,
    token: Option<String>,
    scoreboard_id: String,
}

impl std::fmt::Debug for HttpKioskApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpKioskApi")
            .field("base_url", &self.base_url.as_str())
            .field("scoreboard_id", &self.scoreboard_id)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl HttpKioskApi {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        scoreboard_id: impl Into<String>,
    ) -> Result<Self, KioskError> {
        let base_url = Url::parse(base_url).map_err(|err| {
            KioskError::validation("invalid_base_url", format!("invalid API base URL: {err}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(KioskError::validation(
                "invalid_base_url",
                "API base URL cannot carry a path",
            ));
        }

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(map_transport_error)?;

        Ok(Self {
            client,
            base_url,
            token,
            scoreboard_id: scoreboard_id.into(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, KioskError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                KioskError::validation("invalid_base_url", "API base URL cannot carry a path")
            })?
            .pop_if_empty()
            .extend(["scoreboards", self.scoreboard_id.as_str(), "kiosk"])
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response, KioskError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            debug!(operation, status = status.as_u16(), "kiosk request succeeded");
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let mapped = map_status(operation, status, retry_after);
        warn!(operation, status = status.as_u16(), code = %mapped.code, "kiosk request failed");
        Err(mapped)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T, KioskError> {
        self.send(operation, request)
            .await?
            .json::<T>()
            .await
            .map_err(map_transport_error)
    }
}

#[async_trait]
impl KioskApi for HttpKioskApi {
    async fn fetch_collection(&self) -> Result<CollectionSnapshot, KioskError> {
        let url = self.endpoint(&[])?;
        self.send_json("fetch_collection", self.client.get(url)).await
    }

    async fn create_slide(&self, slide: NewSlide) -> Result<Slide, KioskError> {
        let url = self.endpoint(&["slides"])?;
        self.send_json("create_slide", self.client.post(url).json(&slide)).await
    }

    async fn reorder_slides(&self, positions: &[SlidePosition]) -> Result<(), KioskError> {
        let url = self.endpoint(&["slides", "order"])?;
        self.send(
            "reorder_slides",
            self.client.put(url).json(&ReorderBody { positions }),
        )
        .await
        .map(|_| ())
    }

    async fn delete_slide(&self, id: &str) -> Result<(), KioskError> {
        let url = self.endpoint(&["slides", id])?;
        self.send("delete_slide", self.client.delete(url))
            .await
            .map(|_| ())
    }

    async fn update_settings(&self, settings: &KioskSettings) -> Result<(), KioskError> {
        let url = self.endpoint(&["settings"])?;
        self.send("update_settings", self.client.put(url).json(settings))
            .await
            .map(|_| ())
    }

    async fn upload_file(
        &self,
        file_name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<StoredFile, KioskError> {
        let url = self.endpoint(&["files"])?;
        let part = multipart::Part::bytes(data)
            .file_name(file_name.to_owned())
            .mime_str(content_type)
            .map_err(|err| {
                KioskError::validation(
                    "unsupported_media_type",
                    format!("invalid content type '{content_type}': {err}"),
                )
            })?;
        let form = multipart::Form::new().part("file", part);
        self.send_json("upload_file", self.client.post(url).multipart(form)).await
    }

    async fn sign_urls(&self, paths: &[String]) -> Result<SignedUrls, KioskError> {
        if paths.is_empty() {
            return Ok(SignedUrls::new());
        }
        let url = self.endpoint(&["media", "sign"])?;
        let response: SignResponse = self
            .send_json("sign_urls", self.client.post(url).json(&SignBody { paths }))
            .await?;
        Ok(response.urls)
    }
}

fn map_status(operation: &str, status: StatusCode, retry_after: Option<Duration>) -> KioskError {
    let mut mapped = KioskError::new(
        classify_http_status(status.as_u16()),
        "http_error",
        format!("{operation} failed with HTTP {}", status.as_u16()),
    );
    if let Some(delay) = retry_after {
        mapped = mapped.with_retry_after(delay);
    }
    mapped
}

fn map_transport_error(err: reqwest::Error) -> KioskError {
    if err.is_decode() {
        return KioskError::new(
            KioskErrorCategory::Serialization,
            "decode_error",
            err.to_string(),
        );
    }
    KioskError::new(KioskErrorCategory::Network, "transport_error", err.to_string())
}
