use crate::catalog::ObjectStore;
use crate::errors::{Result, StoreError};
use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::{config::Builder, primitives::ByteStream, Client};
use bytes::Bytes;

/// Catalog objects in a MinIO / S3 bucket.
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    pub async fn from_env() -> anyhow::Result<Self> {
        let endpoint = std::env::var("AWS_ENDPOINT_URL")
            .unwrap_or_else(|_| "http://minio:9000".to_string());
        let access_key = std::env::var("AWS_ACCESS_KEY_ID")
            .unwrap_or_else(|_| "minioadmin".to_string());
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .unwrap_or_else(|_| "minioadmin".to_string());
        let bucket_name = std::env::var("VEC_BUCKET")
            .unwrap_or_else(|_| crate::defaults::DEFAULT_BUCKET.to_string());

        let creds = aws_sdk_s3::config::Credentials::new(
            access_key,
            secret_key,
            None,
            None,
            "static",
        );

        let config = Builder::new()
            .endpoint_url(endpoint)
            .region(Region::new("us-east-1"))
            .credentials_provider(creds)
            .force_path_style(true)
            .build();

        let client = Client::from_conf(config);

        // Ensure bucket exists; "already owned" errors are expected here
        if let Err(e) = client.create_bucket().bucket(&bucket_name).send().await {
            tracing::debug!("create_bucket {}: {:?}", bucket_name, e);
        }

        tracing::info!("Using S3 catalog in bucket {}", bucket_name);
        Ok(Self {
            client,
            bucket: bucket_name,
        })
    }
}

fn s3_err(context: &str, key: &str, e: impl std::fmt::Debug) -> StoreError {
    StoreError::Storage(format!("{context} {key}: {e:?}"))
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        tracing::debug!("S3 put_object - bucket: {}, key: {}, data_size: {}", &self.bucket, key, data.len());
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                tracing::error!("S3 put_object failed - key: {}, error: {:?}", key, e);
                s3_err("Failed to put object", key, e)
            })?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Bytes>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Ok(None)
            }
            Err(e) => return Err(s3_err("Failed to get object", key, e)),
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| s3_err("Failed to read object body", key, e))?;

        Ok(Some(data.into_bytes()))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| s3_err("Failed to list objects", prefix, e))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            match response.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| s3_err("Failed to delete object", key, e))?;
        Ok(())
    }
}
