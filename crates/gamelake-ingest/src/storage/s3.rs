use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::{Delete, ObjectIdentifier, Tag, Tagging, TaggingDirective},
    Client,
};
use std::fmt::Debug;
use tracing::{debug, info, instrument};

use super::{BlobStore, StorageConfig, StorageError, StorageResult, Tags};

/// DeleteObjects accepts at most this many keys per request
const DELETE_CHUNK: usize = 1000;

/// `x-amz-copy-source` value: bucket plus the URL-encoded key, with the
/// `/` separators left intact
fn copy_source(bucket: &str, key: &str) -> String {
    let encoded: Vec<_> = key.split('/').map(urlencoding::encode).collect();
    format!("{bucket}/{}", encoded.join("/"))
}

/// Shared AWS configuration for S3 and CloudFront clients
///
/// Static credentials from the storage config win over the default
/// provider chain.
pub async fn load_sdk_config(config: &StorageConfig) -> SdkConfig {
    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

    if let Some((access_key, secret_key)) = config.static_credentials() {
        loader = loader.credentials_provider(Credentials::new(
            access_key,
            secret_key,
            None,
            None,
            "gamelake-storage",
        ));
    }

    loader.load().await
}

#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    pub async fn new(config: &StorageConfig) -> Self {
        let sdk_config = load_sdk_config(config).await;
        Self::from_sdk_config(&sdk_config, config)
    }

    pub fn from_sdk_config(sdk_config: &SdkConfig, config: &StorageConfig) -> Self {
        let mut builder =
            aws_sdk_s3::config::Builder::from(sdk_config).force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(bucket = %config.bucket, "Storage client initialized");

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }
}

/// Maps SDK failures, folding the missing-object codes into `NotFound`
fn map_sdk_error<E, R>(op: &'static str, key: &str, err: SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: Debug,
{
    match err.code() {
        Some("NoSuchKey") | Some("NotFound") => StorageError::NotFound {
            key: key.to_string(),
        },
        _ => StorageError::request(op, key, DisplayErrorContext(&err)),
    }
}

fn tagging_query(tags: &Tags) -> String {
    tags.iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn tag_set(key: &str, tags: &Tags) -> StorageResult<Tagging> {
    let tag_set = tags
        .iter()
        .map(|(k, v)| {
            Tag::builder()
                .key(k)
                .value(v)
                .build()
                .map_err(|e| StorageError::request("build_tag", key, e))
        })
        .collect::<StorageResult<Vec<_>>>()?;

    Tagging::builder()
        .set_tag_set(Some(tag_set))
        .build()
        .map_err(|e| StorageError::request("build_tagging", key, e))
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self))]
    async fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| map_sdk_error("list_objects_v2", prefix, e))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        debug!(count = keys.len(), "Listed objects");
        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn get_object(&self, key: &str) -> StorageResult<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error("get_object", key, e))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::request("get_object", key, e))?
            .into_bytes()
            .to_vec();

        debug!(bytes = data.len(), "Downloaded object");
        Ok(data)
    }

    #[instrument(skip(self, body))]
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        tags: &Tags,
    ) -> StorageResult<()> {
        let size = body.len();
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body));

        if !tags.is_empty() {
            request = request.tagging(tagging_query(tags));
        }

        request
            .send()
            .await
            .map_err(|e| map_sdk_error("put_object", key, e))?;

        debug!(bytes = size, "Uploaded s3://{}/{}", self.bucket, key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn put_object_tagging(&self, key: &str, tags: &Tags) -> StorageResult<()> {
        self.client
            .put_object_tagging()
            .bucket(&self.bucket)
            .key(key)
            .tagging(tag_set(key, tags)?)
            .send()
            .await
            .map_err(|e| map_sdk_error("put_object_tagging", key, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_object_tagging(&self, key: &str) -> StorageResult<Tags> {
        let response = self
            .client
            .get_object_tagging()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error("get_object_tagging", key, e))?;

        Ok(response
            .tag_set()
            .iter()
            .map(|tag| (tag.key().to_string(), tag.value().to_string()))
            .collect())
    }

    #[instrument(skip(self))]
    async fn copy_object(&self, source_key: &str, dest_key: &str) -> StorageResult<()> {
        let copy_source = copy_source(&self.bucket, source_key);

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(&copy_source)
            .key(dest_key)
            .tagging_directive(TaggingDirective::Copy)
            .send()
            .await
            .map_err(|e| map_sdk_error("copy_object", source_key, e))?;

        debug!("Copied s3://{}/{} to {}", self.bucket, source_key, dest_key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error("delete_object", key, e))?;
        Ok(())
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn delete_objects(&self, keys: &[String]) -> StorageResult<()> {
        for chunk in keys.chunks(DELETE_CHUNK) {
            let first = chunk.first().map(String::as_str).unwrap_or_default();
            let objects = chunk
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| StorageError::request("delete_objects", key, e))
                })
                .collect::<StorageResult<Vec<_>>>()?;

            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| StorageError::request("delete_objects", first, e))?;

            let response = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| map_sdk_error("delete_objects", first, e))?;

            if let Some(failed) = response.errors().first() {
                return Err(StorageError::request(
                    "delete_objects",
                    failed.key().unwrap_or(first),
                    failed.message().unwrap_or("unknown error"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagging_query() {
        let mut tags = Tags::new();
        tags.insert("status".to_string(), "temp".to_string());
        assert_eq!(tagging_query(&tags), "status=temp");

        tags.insert("owner".to_string(), "ingest".to_string());
        assert_eq!(tagging_query(&tags), "owner=ingest&status=temp");

        tags.insert("team".to_string(), "data & ml".to_string());
        assert_eq!(
            tagging_query(&tags),
            "owner=ingest&status=temp&team=data%20%26%20ml"
        );
    }

    #[test]
    fn test_copy_source_encodes_key_segments() {
        assert_eq!(
            copy_source("lake", "raw/popscore/dt=2025-01-15/batch-0.jsonl"),
            "lake/raw/popscore/dt%3D2025-01-15/batch-0.jsonl"
        );
        assert_eq!(
            copy_source("lake", "raw/games/a b+c#1.jsonl"),
            "lake/raw/games/a%20b%2Bc%231.jsonl"
        );
    }
}
