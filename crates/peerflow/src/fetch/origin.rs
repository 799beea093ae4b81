// Origin (seeder) HTTP access: playlists, init segments, media segments.
// Bounded timeouts, retry with backoff, per-segment abort.

use crate::config::ConfigStore;
use crate::error::{EngineError, Result, is_retryable_reqwest_error};
use crate::media::SegmentDescriptor;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub struct OriginFetcher {
    client: reqwest::Client,
    config: Arc<ConfigStore>,
    token: CancellationToken,
    /// In-flight segment fetches by `quality:segment`, for `cancel`.
    aborts: Mutex<HashMap<String, CancellationToken>>,
}

impl OriginFetcher {
    pub fn new(config: Arc<ConfigStore>, token: CancellationToken) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(EngineError::from)?;
        Ok(Self {
            client,
            config,
            token,
            aborts: Mutex::new(HashMap::new()),
        })
    }

    fn base_url(&self) -> String {
        let mut base = self.config.read(|c| c.base_url.clone());
        while base.ends_with('/') {
            base.pop();
        }
        base
    }

    pub fn master_url(&self, stream_id: &str) -> String {
        format!("{}/streams/movies/{stream_id}/master.m3u8", self.base_url())
    }

    pub fn variant_url(&self, stream_id: &str, quality_id: &str) -> String {
        format!(
            "{}/streams/movies/{stream_id}/{quality_id}/playlist.m3u8",
            self.base_url()
        )
    }

    pub fn init_url(&self, stream_id: &str, quality_id: &str) -> String {
        format!(
            "{}/streams/movies/{stream_id}/{quality_id}/init.mp4",
            self.base_url()
        )
    }

    pub fn segment_url(&self, stream_id: &str, quality_id: &str, segment_id: &str) -> String {
        format!(
            "{}/streams/movies/{stream_id}/{quality_id}/{segment_id}",
            self.base_url()
        )
    }

    fn policy(&self) -> RetryPolicy {
        self.config.read(|c| RetryPolicy {
            max_retries: c.max_retries,
            base_delay: c.retry_delay_base(),
            max_delay: Duration::from_secs(10),
            jitter: true,
        })
    }

    /// One GET with timeout and status classification.
    async fn get_once(
        &self,
        url: &str,
        operation: &'static str,
        cancel: &CancellationToken,
    ) -> RetryAction<Bytes> {
        let timeout = self.config.read(|c| c.fetch_timeout());
        let request = self.client.get(url).timeout(timeout).send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return RetryAction::Fail(EngineError::Cancelled),
            response = request => response,
        };

        match response {
            Ok(response) if response.status().is_success() => {
                let bytes = tokio::select! {
                    _ = cancel.cancelled() => return RetryAction::Fail(EngineError::Cancelled),
                    bytes = response.bytes() => bytes,
                };
                match bytes {
                    Ok(bytes) => RetryAction::Success(bytes),
                    Err(e) => RetryAction::Retry(EngineError::from(e)),
                }
            }
            Ok(response) if response.status().is_client_error() => RetryAction::Fail(
                EngineError::http_status(response.status(), url, operation),
            ),
            Ok(response) => RetryAction::Retry(EngineError::http_status(
                response.status(),
                url,
                operation,
            )),
            Err(e) if is_retryable_reqwest_error(&e) => RetryAction::Retry(EngineError::from(e)),
            Err(e) => RetryAction::Fail(EngineError::from(e)),
        }
    }

    async fn get_with_retries(
        &self,
        url: &str,
        operation: &'static str,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let policy = self.policy();
        trace!(url, operation, "Origin GET");
        retry_with_backoff(&policy, cancel, |_attempt| self.get_once(url, operation, cancel)).await
    }

    pub async fn fetch_master_text(&self, stream_id: &str) -> Result<String> {
        let url = self.master_url(stream_id);
        let bytes = self.get_with_retries(&url, "master playlist", &self.token).await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| EngineError::playlist(format!("master playlist is not UTF-8: {e}")))
    }

    pub async fn fetch_variant_text(&self, stream_id: &str, quality_id: &str) -> Result<String> {
        let url = self.variant_url(stream_id, quality_id);
        let bytes = self.get_with_retries(&url, "variant playlist", &self.token).await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| EngineError::playlist(format!("variant playlist is not UTF-8: {e}")))
    }

    pub async fn fetch_init(&self, stream_id: &str, quality_id: &str) -> Result<Bytes> {
        let url = self.init_url(stream_id, quality_id);
        self.get_with_retries(&url, "init segment", &self.token).await
    }

    /// Fetch one media segment. Abortable through [`OriginFetcher::cancel`].
    pub async fn fetch_segment(&self, segment: &SegmentDescriptor) -> Result<Bytes> {
        let url = self.segment_url(&segment.stream_id, &segment.quality_id, &segment.segment_id);
        let abort_key = format!("{}:{}", segment.quality_id, segment.segment_id);
        let cancel = self.token.child_token();
        self.aborts.lock().insert(abort_key.clone(), cancel.clone());

        let result = self.get_with_retries(&url, "media segment", &cancel).await;
        self.aborts.lock().remove(&abort_key);
        result
    }

    /// Abort an outstanding segment fetch. Aborts surface as a non-retried
    /// cancellation.
    pub fn cancel(&self, quality_id: &str, segment_id: &str) {
        let key = format!("{quality_id}:{segment_id}");
        if let Some(token) = self.aborts.lock().remove(&key) {
            debug!(key, "Aborting origin fetch");
            token.cancel();
        }
    }
}
