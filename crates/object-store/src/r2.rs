//! The R2 bucket client.

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use log::debug;

use flowslide_core::errors::Result as CoreResult;
use flowslide_core::settings::R2Settings;
use flowslide_core::store::ObjectStore;

use crate::errors::ObjectStoreError;
use crate::rate_limit::TokenBucket;

/// Default operation budget against the bucket.
const DEFAULT_OPS_PER_SEC: u32 = 20;
const BURST: u32 = 20;

/// S3-compatible client bound to one bucket, rate limited by a token
/// bucket so sync and snapshot traffic cannot saturate the account.
pub struct R2Store {
    client: Client,
    bucket: String,
    limiter: TokenBucket,
}

impl R2Store {
    /// Build a client against an R2 (or any S3-compatible) endpoint.
    pub async fn connect(settings: &R2Settings) -> Self {
        let credentials = Credentials::new(
            settings.access_key_id.clone(),
            settings.secret_access_key.clone(),
            None,
            None,
            "flowslide",
        );
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new("auto"))
            .credentials_provider(credentials)
            .load()
            .await;
        let config = aws_sdk_s3::config::Builder::from(&shared)
            .endpoint_url(&settings.endpoint)
            .force_path_style(true)
            .build();
        debug!("Object store client ready for bucket '{}'", settings.bucket);
        Self {
            client: Client::from_conf(config),
            bucket: settings.bucket.clone(),
            limiter: TokenBucket::new(DEFAULT_OPS_PER_SEC, BURST),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn is_not_found(message: &str) -> bool {
        message.contains("NoSuchKey") || message.contains("NotFound") || message.contains("404")
    }
}

#[async_trait]
impl ObjectStore for R2Store {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> CoreResult<()> {
        self.limiter.acquire().await;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(bytes.len() as i64)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(format!("put '{key}': {e}")))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> CoreResult<Vec<u8>> {
        self.limiter.acquire().await;
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let message = format!("{e}");
                if Self::is_not_found(&message) {
                    ObjectStoreError::NotFound(key.to_string())
                } else {
                    ObjectStoreError::Request(format!("get '{key}': {message}"))
                }
            })?;
        let body = response
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Request(format!("read '{key}': {e}")))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn list_objects(&self, prefix: &str) -> CoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            self.limiter.acquire().await;
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| ObjectStoreError::Request(format!("list '{prefix}': {e}")))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|o| o.key().map(String::from)),
            );

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete_object(&self, key: &str) -> CoreResult<()> {
        self.limiter.acquire().await;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(format!("delete '{key}': {e}")))?;
        Ok(())
    }

    async fn ping(&self) -> CoreResult<()> {
        self.limiter.acquire().await;
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Unreachable(format!("bucket '{}': {e}", self.bucket)))?;
        Ok(())
    }
}
