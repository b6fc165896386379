//! AWS S3 storage backend

use crate::config::Config;
use crate::digest::{ContentDigest, DigestCell};
use crate::error::{Error, Result};
use crate::storage::{
    emit, BackendKind, CompletedPart, Listing, MultipartUploader, Object, ObjectMetadata,
    ObjectReader, Store, UploadSession,
};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{MetadataDirective, ObjectCannedAcl, StorageClass};
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::any::Any;
use std::collections::HashMap;
use tokio::io::AsyncReadExt;

/// S3 minimum part size (5MB)
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Most parts one multipart upload may have
pub const S3_MAX_PARTS: u32 = 10_000;

/// Largest object CopyObject accepts in one request (5GB)
const COPY_OBJECT_LIMIT: u64 = 5 * 1024 * 1024 * 1024;

/// User metadata key holding the hex MD5 of the uploaded content
pub const CHECKSUM_METADATA_KEY: &str = "md5_checksum";

/// Upload options applied to every write
#[derive(Debug, Clone, Default)]
pub struct S3Options {
    pub acl: Option<String>,
    pub storage_class: Option<String>,
    pub listing_buffer: usize,
}

impl From<&Config> for S3Options {
    fn from(config: &Config) -> Self {
        Self {
            acl: config.acl.clone(),
            storage_class: config.storage_class.clone(),
            listing_buffer: config.listing_buffer,
        }
    }
}

/// AWS S3 storage backend
#[derive(Clone)]
pub struct S3Store {
    /// S3 client
    client: Client,
    /// Bucket name
    bucket: String,
    /// Prefix (like a subdirectory)
    prefix: String,
    options: S3Options,
}

impl S3Store {
    /// Build a client from the ambient AWS configuration plus overrides
    pub async fn connect(bucket: String, prefix: String, config: &Config) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.s3_endpoint {
            // S3-compatible services generally need path-style addressing
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self::with_client(
            Client::from_conf(builder.build()),
            bucket,
            prefix,
            S3Options::from(config),
        ))
    }

    pub fn with_client(client: Client, bucket: String, prefix: String, options: S3Options) -> Self {
        Self {
            client,
            bucket,
            prefix,
            options,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Whether the prefix names one existing object rather than a directory
    pub async fn prefix_is_object(&self) -> Result<bool> {
        if self.prefix.is_empty() || self.prefix.ends_with('/') {
            return Ok(false);
        }

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&self.prefix)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service = e.into_service_error();
                if service.is_not_found() {
                    Ok(false)
                } else {
                    Err(Error::aws(service))
                }
            }
        }
    }

    /// Resolve a relative path to a full S3 key
    fn resolve_key(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else if path.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), path)
        }
    }

    fn user_metadata(metadata: &ObjectMetadata) -> Option<HashMap<String, String>> {
        metadata.checksum.as_ref().map(|sum| {
            let mut map = HashMap::new();
            map.insert(CHECKSUM_METADATA_KEY.to_string(), sum.clone());
            map
        })
    }

    fn acl(&self) -> Option<ObjectCannedAcl> {
        self.options.acl.as_deref().map(ObjectCannedAcl::from)
    }

    async fn put_bytes(&self, key: &str, data: Bytes, metadata: &ObjectMetadata) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .set_content_type(metadata.content_type.clone())
            .set_storage_class(metadata.storage_class.as_deref().map(StorageClass::from))
            .set_acl(self.acl())
            .set_metadata(Self::user_metadata(metadata))
            .send()
            .await
            .map_err(Error::aws)?;
        Ok(())
    }

    /// Server-side copy from another object reachable with this client
    async fn copy_from(&self, src: &S3Object, key: &str, metadata: &ObjectMetadata) -> Result<()> {
        let copy_source = format!("{}/{}", src.bucket, encode_key(&src.key));
        tracing::debug!(source = %copy_source, key = %key, "Server-side copy");

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(key)
            .copy_source(copy_source)
            .metadata_directive(MetadataDirective::Replace)
            .set_content_type(metadata.content_type.clone())
            .set_storage_class(metadata.storage_class.as_deref().map(StorageClass::from))
            .set_acl(self.acl())
            .set_metadata(Self::user_metadata(metadata))
            .send()
            .await
            .map_err(Error::aws)?;
        Ok(())
    }
}

/// Relative path of `key` under `prefix`, or `None` when it lies outside.
///
/// A prefix that names a single object yields that object's file name.
fn relative_key(prefix: &str, key: &str) -> Option<String> {
    if prefix.is_empty() {
        return Some(key.to_string()).filter(|k| !k.is_empty());
    }
    if key == prefix && !prefix.ends_with('/') {
        return key.rsplit('/').next().map(str::to_string);
    }
    let dir = format!("{}/", prefix.trim_end_matches('/'));
    key.strip_prefix(&dir)
        .filter(|rest| !rest.is_empty())
        .map(str::to_string)
}

/// Percent-encode a key for the `x-amz-copy-source` header, keeping `/`
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[async_trait]
impl Store for S3Store {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    fn files(&self) -> Listing {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let prefix = self.prefix.clone();

        Listing::spawn(self.describe(), self.options.listing_buffer, move |tx| async move {
            let mut paginator = client
                .list_objects_v2()
                .bucket(&bucket)
                .prefix(&prefix)
                .into_paginator()
                .send();

            while let Some(page) = paginator.next().await {
                let output = page.map_err(Error::aws)?;

                for obj in output.contents() {
                    let Some(key) = obj.key() else { continue };
                    let Some(relative) = relative_key(&prefix, key) else {
                        continue;
                    };

                    let size = obj.size().unwrap_or(0).max(0) as u64;
                    let digest = obj
                        .e_tag()
                        .and_then(ContentDigest::from_etag)
                        .map(DigestCell::with_value)
                        .unwrap_or_default();

                    let object = S3Object {
                        client: client.clone(),
                        bucket: bucket.clone(),
                        key: key.to_string(),
                        is_dir: relative.ends_with('/') && size == 0,
                        relative,
                        size,
                        digest,
                    };
                    if !emit(&tx, std::sync::Arc::new(object)).await {
                        return Ok(());
                    }
                }
            }
            Ok(())
        })
    }

    async fn create(&self, src: &dyn Object, path: &str) -> Result<()> {
        let key = self.resolve_key(path);

        if src.is_dir() {
            let marker = if key.ends_with('/') { key } else { format!("{}/", key) };
            return self
                .put_bytes(&marker, Bytes::new(), &ObjectMetadata::default())
                .await;
        }

        let metadata = self.metadata_for(src).await?;

        if let Some(s3_src) = src.as_any().downcast_ref::<S3Object>() {
            if s3_src.size <= COPY_OBJECT_LIMIT {
                return self.copy_from(s3_src, &key, &metadata).await;
            }
        }

        let mut reader = src.reader().await?;
        let mut buf = Vec::with_capacity(src.size() as usize);
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| Error::io("reading source", e))?;

        self.put_bytes(&key, Bytes::from(buf), &metadata).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let key = self.resolve_key(path);

        // DeleteObject succeeds for missing keys
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(Error::aws)?;

        Ok(())
    }

    async fn metadata_for(&self, src: &dyn Object) -> Result<ObjectMetadata> {
        let Some(s3_src) = src.as_any().downcast_ref::<S3Object>() else {
            return Ok(ObjectMetadata {
                content_type: None,
                storage_class: self.options.storage_class.clone(),
                checksum: Some(src.checksum().await?.to_hex()),
            });
        };

        // headers and digest both come from the HEAD; the body is never read here
        let head = s3_src
            .client
            .head_object()
            .bucket(&s3_src.bucket)
            .key(&s3_src.key)
            .send()
            .await
            .map_err(Error::aws)?;

        Ok(ObjectMetadata {
            content_type: head.content_type().map(str::to_string),
            storage_class: head
                .storage_class()
                .map(|c| c.as_str().to_string())
                .or_else(|| self.options.storage_class.clone()),
            checksum: s3_src
                .digest
                .get()
                .or_else(|| checksum_from_metadata(head.metadata()))
                .map(|d| d.to_hex()),
        })
    }

    fn multipart(&self) -> Option<&dyn MultipartUploader> {
        Some(self)
    }
}

#[async_trait]
impl MultipartUploader for S3Store {
    fn min_part_size(&self) -> u64 {
        S3_MIN_PART_SIZE
    }

    fn max_parts(&self) -> u32 {
        S3_MAX_PARTS
    }

    async fn open_session(&self, path: &str, metadata: &ObjectMetadata) -> Result<String> {
        let key = self.resolve_key(path);

        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .set_content_type(metadata.content_type.clone())
            .set_storage_class(metadata.storage_class.as_deref().map(StorageClass::from))
            .set_acl(self.acl())
            .set_metadata(Self::user_metadata(metadata))
            .send()
            .await
            .map_err(Error::aws)?;

        output
            .upload_id()
            .map(|s| s.to_string())
            .ok_or_else(|| Error::storage("no upload ID returned"))
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        let key = self.resolve_key(&session.path);
        let content_length = data.len() as i64;

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&session.upload_id)
            .part_number(part_number as i32)
            .content_length(content_length)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(Error::aws)?;

        let etag = output
            .e_tag()
            .map(|s| s.to_string())
            .ok_or_else(|| Error::storage(format!("no ETag returned for part {}", part_number)))?;

        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_session(&self, session: &UploadSession) -> Result<()> {
        use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as AwsCompletedPart};

        let key = self.resolve_key(&session.path);

        let aws_parts: Vec<AwsCompletedPart> = session
            .parts
            .iter()
            .map(|p| {
                AwsCompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(p.etag.clone())
                    .build()
            })
            .collect();

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(aws_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&session.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(Error::aws)?;

        Ok(())
    }

    async fn abort_session(&self, session: &UploadSession) -> Result<()> {
        let key = self.resolve_key(&session.path);

        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&session.upload_id)
            .send()
            .await
            .map_err(Error::aws)?;

        Ok(())
    }
}

/// Object listed from an [`S3Store`]
pub struct S3Object {
    client: Client,
    bucket: String,
    key: String,
    relative: String,
    size: u64,
    is_dir: bool,
    digest: DigestCell,
}

impl std::fmt::Debug for S3Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Object")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("size", &self.size)
            .finish()
    }
}

impl S3Object {
    /// Digest from the `md5_checksum` metadata this tool writes, if present
    async fn stored_checksum(&self) -> Result<Option<ContentDigest>> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(Error::aws)?;

        Ok(checksum_from_metadata(head.metadata()))
    }
}

/// Digest recorded in `md5_checksum` user metadata, if present and well formed
fn checksum_from_metadata(metadata: Option<&HashMap<String, String>>) -> Option<ContentDigest> {
    metadata
        .and_then(|m| m.get(CHECKSUM_METADATA_KEY))
        .and_then(|hex| ContentDigest::from_hex(hex))
}

#[async_trait]
impl Object for S3Object {
    fn relative_path(&self) -> &str {
        &self.relative
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }

    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    async fn reader(&self) -> Result<ObjectReader> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(Error::aws)?;

        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn checksum(&self) -> Result<ContentDigest> {
        self.digest
            .get_or_compute(&self.relative, || async {
                // multipart ETags are not digests; fall back to metadata, then a full read
                if let Some(stored) = self.stored_checksum().await? {
                    return Ok(stored);
                }
                let reader = self.reader().await?;
                ContentDigest::from_reader(reader)
                    .await
                    .map_err(|e| Error::io("hashing object", e))
            })
            .await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
