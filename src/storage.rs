use anyhow::{anyhow, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::config::AppConfig;

/// Blob storage for uploaded knowledge files.
#[derive(Clone, Debug)]
pub struct BlobStorage {
    client: Client,
    bucket: String,
    region: String,
}

impl BlobStorage {
    /// Builds the client when a bucket is configured; `None` disables file
    /// mirroring and uploads go to the AI backend only.
    pub async fn from_config(config: &AppConfig) -> Option<Self> {
        let bucket = config.s3_bucket.clone()?;
        let region = config
            .aws_region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(aws_config::Region::new(region.clone()));
        if let (Some(key_id), Some(secret)) = (&config.aws_access_key_id, &config.aws_secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "static",
            ));
        }
        let sdk_config = loader.load().await;

        info!("Blob storage enabled on bucket {}", bucket);
        Some(BlobStorage {
            client: Client::new(&sdk_config),
            bucket,
            region,
        })
    }

    pub fn object_key(workspace_id: &str, agent_id: &str, item_id: &str, file_name: &str) -> String {
        format!("knowledge/{}/{}/{}/{}", workspace_id, agent_id, item_id, file_name)
    }

    /// Uploads and returns the object URL.
    pub async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        debug!("Uploading s3://{}/{} ({} bytes)", self.bucket, key, bytes.len());
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to upload {}: {}", key, e))?;

        Ok(format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            self.bucket, self.region, key
        ))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to delete {}: {}", key, e))?;
        debug!("Deleted s3://{}/{}", self.bucket, key);
        Ok(())
    }

    /// Recovers the object key from a URL produced by [`put`](Self::put).
    pub fn key_from_url(&self, url: &str) -> Option<String> {
        let prefix = format!("https://{}.s3.{}.amazonaws.com/", self.bucket, self.region);
        url.strip_prefix(&prefix).map(str::to_string)
    }
}
