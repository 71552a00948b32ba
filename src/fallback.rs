//! One-shot HTTP fallback for media generation.
//!
//! When no streaming connection is available, equivalent request/response
//! calls exist per paragraph. Results re-enter the session through the same
//! arrival path as streamed frames, so ordering and playback contracts do
//! not depend on the transport. The service returns media URLs; this client
//! downloads them so callers always receive bytes (video stays a URL, the
//! player for it is external).

use crate::error::{Result, StoryloomError};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY_MS: u64 = 500;
const MAX_RETRY_DELAY_MS: u64 = 5000;

/// Per-paragraph one-shot generation calls.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Synthesize narration for one paragraph, returning audio bytes.
    async fn synthesize_audio(&self, task_id: &str, text: &str, paragraph: u32) -> Result<Vec<u8>>;

    /// Generate the paragraph's image variants, returning their bytes.
    async fn generate_images(
        &self,
        task_id: &str,
        text: &str,
        paragraph: u32,
    ) -> Result<Vec<Vec<u8>>>;

    /// Generate a video clip seeded with an image, returning its URL.
    async fn generate_video(
        &self,
        task_id: &str,
        text: &str,
        paragraph: u32,
        image_base64: &str,
    ) -> Result<String>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    task_id: &'a str,
    text: &'a str,
    paragraph_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_base64: Option<&'a str>,
}

#[derive(Deserialize, Debug)]
struct AudioResponse {
    audio_url: String,
}

#[derive(Deserialize, Debug)]
struct ImagesResponse {
    image_urls: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct VideoResponse {
    video_url: String,
}

/// Reqwest-backed [`GenerationService`].
pub struct HttpGenerationClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGenerationClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Execute an async operation with exponential backoff retry logic.
    async fn with_retry<F, Fut, T>(operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut delay = Duration::from_millis(INITIAL_RETRY_DELAY_MS);

        for attempt in 0..MAX_RETRIES {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < MAX_RETRIES - 1 => {
                    warn!(
                        "{operation_name} attempt {} failed: {e}, retrying in {delay:?}",
                        attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_millis(MAX_RETRY_DELAY_MS));
                }
                Err(e) => {
                    return Err(StoryloomError::Http {
                        message: format!("{operation_name} failed after {MAX_RETRIES} attempts: {e}"),
                    });
                }
            }
        }
        unreachable!()
    }

    async fn post_generate<R: for<'de> Deserialize<'de>>(
        &self,
        route: &str,
        request: &GenerateRequest<'_>,
    ) -> Result<R> {
        let response = self
            .client
            .post(format!("{}/generate/{route}", self.base_url))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoryloomError::Http {
                message: format!("generate/{route} returned {status}: {body}"),
            });
        }

        Ok(response.json().await?)
    }

    /// Download a produced media URL to bytes.
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(StoryloomError::Http {
                message: format!("fetching {url} returned {}", response.status()),
            });
        }
        let bytes = response.bytes().await?;
        debug!("fetched {} bytes from {url}", bytes.len());
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl GenerationService for HttpGenerationClient {
    async fn synthesize_audio(&self, task_id: &str, text: &str, paragraph: u32) -> Result<Vec<u8>> {
        let request = GenerateRequest {
            task_id,
            text,
            paragraph_number: paragraph,
            image_base64: None,
        };
        let response: AudioResponse = Self::with_retry("Audio synthesis", || {
            self.post_generate("audio", &request)
        })
        .await?;
        Self::with_retry("Audio download", || self.fetch_bytes(&response.audio_url)).await
    }

    async fn generate_images(
        &self,
        task_id: &str,
        text: &str,
        paragraph: u32,
    ) -> Result<Vec<Vec<u8>>> {
        let request = GenerateRequest {
            task_id,
            text,
            paragraph_number: paragraph,
            image_base64: None,
        };
        let response: ImagesResponse = Self::with_retry("Image generation", || {
            self.post_generate("image", &request)
        })
        .await?;

        let mut images = Vec::with_capacity(response.image_urls.len());
        for url in &response.image_urls {
            images.push(Self::with_retry("Image download", || self.fetch_bytes(url)).await?);
        }
        Ok(images)
    }

    async fn generate_video(
        &self,
        task_id: &str,
        text: &str,
        paragraph: u32,
        image_base64: &str,
    ) -> Result<String> {
        let request = GenerateRequest {
            task_id,
            text,
            paragraph_number: paragraph,
            image_base64: Some(image_base64),
        };
        let response: VideoResponse = Self::with_retry("Video generation", || {
            self.post_generate("video", &request)
        })
        .await?;
        Ok(response.video_url)
    }
}
