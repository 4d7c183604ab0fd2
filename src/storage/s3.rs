//! S3 object store backed by the AWS SDK

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{ObjectMetadata, ObjectStore, SessionHandle, SessionProvider};
use crate::error::{Result, SyncError};
use crate::utils::config::IamOverride;

pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn metadata(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        let response = match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(response) => response,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    return Err(SyncError::not_found(format!("s3://{}/{}", bucket, key)));
                }
                return Err(SyncError::transport(service_error));
            }
        };

        let last_modified = response
            .last_modified()
            .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos()))
            .unwrap_or_else(Utc::now);

        Ok(ObjectMetadata {
            size: response.content_length().unwrap_or(0).max(0) as u64,
            last_modified,
        })
    }

    async fn upload(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| SyncError::transport(e.into_service_error()))?;

        debug!("Uploaded {} bytes to s3://{}/{}", size, bucket, key);
        Ok(())
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let response = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(response) => response,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Err(SyncError::not_found(format!("s3://{}/{}", bucket, key)));
                }
                return Err(SyncError::transport(service_error));
            }
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(SyncError::transport)?
            .into_bytes();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), bucket, key);
        Ok(data)
    }

    async fn copy(&self, src_bucket: &str, src_key: &str, dst_bucket: &str, dst_key: &str) -> Result<()> {
        self.client
            .copy_object()
            .copy_source(copy_source(src_bucket, src_key))
            .bucket(dst_bucket)
            .key(dst_key)
            .send()
            .await
            .map_err(|e| SyncError::transport(e.into_service_error()))?;

        debug!(
            "Copied s3://{}/{} to s3://{}/{}",
            src_bucket, src_key, dst_bucket, dst_key
        );
        Ok(())
    }
}

/// `x-amz-copy-source` value: each key segment URL-encoded, `/` kept
fn copy_source(bucket: &str, key: &str) -> String {
    let key = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/{}", bucket, key)
}

/// Hands out one shared session per distinct IAM override.
pub struct SessionFactory {
    base: SdkConfig,
    sessions: Mutex<HashMap<Option<IamOverride>, SessionHandle>>,
}

impl SessionFactory {
    /// Loads the default AWS configuration from the environment
    pub async fn from_env() -> Self {
        let base = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self {
            base,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionProvider for SessionFactory {
    async fn session(&self, iam_override: Option<&IamOverride>) -> Result<SessionHandle> {
        let cache_key = iam_override.cloned();
        let cached = self.sessions.lock().get(&cache_key).cloned();
        if let Some(existing) = cached {
            return Ok(existing);
        }

        let client = match iam_override {
            None => S3Client::new(&self.base),
            Some(role) => {
                info!("Assuming role {} for S3 access", role.iam_role);
                let mut builder = AssumeRoleProvider::builder(role.iam_role.clone())
                    .session_name(
                        role.session_name
                            .clone()
                            .unwrap_or_else(|| "s3-files-autosync".to_string()),
                    )
                    .configure(&self.base);
                if let Some(external_id) = &role.external_id {
                    builder = builder.external_id(external_id.clone());
                }
                let provider = builder.build().await;
                let config = aws_sdk_s3::config::Builder::from(&self.base)
                    .credentials_provider(provider)
                    .build();
                S3Client::from_conf(config)
            }
        };

        let session: SessionHandle = Arc::new(S3ObjectStore::new(client));
        Ok(self
            .sessions
            .lock()
            .entry(cache_key)
            .or_insert(session)
            .clone())
    }
}
