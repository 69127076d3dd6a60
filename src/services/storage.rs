use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// What was written by a streaming upload.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub sha256: String,
    pub size: i64,
    pub key: String,
}

#[async_trait]
pub trait StorageService: Send + Sync {
    async fn upload_file(&self, key: &str, data: Vec<u8>) -> Result<()>;
    /// Streams `reader` into `key`, hashing the bytes on the way through.
    async fn upload_stream_with_hash<'a>(
        &self,
        key: &str,
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> Result<StoredObject>;
    async fn copy_object(&self, source_key: &str, dest_key: &str) -> Result<()>;
    /// Succeeds when the object is already gone.
    async fn delete_file(&self, key: &str) -> Result<()>;
    async fn file_exists(&self, key: &str) -> Result<bool>;
    async fn get_file(&self, key: &str) -> Result<Vec<u8>>;
    async fn get_object_stream(&self, key: &str) -> Result<Box<dyn AsyncRead + Unpin + Send>>;
}

pub struct S3StorageService {
    client: Client,
    bucket: String,
}

impl S3StorageService {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl StorageService for S3StorageService {
    async fn upload_file(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await?;
        Ok(())
    }

    async fn upload_stream_with_hash<'a>(
        &self,
        key: &str,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> Result<StoredObject> {
        let multipart_upload_res = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;

        let upload_id = multipart_upload_res
            .upload_id()
            .ok_or_else(|| anyhow::anyhow!("No upload ID"))?;
        let mut part_number = 1;
        let mut completed_parts = Vec::new();
        let mut hasher = Sha256::new();
        let mut total_size = 0;

        // S3 rejects non-final parts under 5 MB
        let part_size = 10 * 1024 * 1024;
        let mut buffer = vec![0u8; part_size];

        loop {
            let mut n = 0;
            while n < part_size {
                let read = reader.read(&mut buffer[n..]).await?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[n..n + read]);
                n += read;
            }

            if n == 0 {
                break;
            }

            total_size += n as i64;
            let upload_part_res = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .body(ByteStream::from(buffer[..n].to_vec()))
                .part_number(part_number)
                .send()
                .await?;

            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(upload_part_res.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );

            part_number += 1;
        }

        if completed_parts.is_empty() {
            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await?;
            anyhow::bail!("refusing to store an empty object at {}", key);
        }

        let completed_multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_multipart_upload)
            .send()
            .await?;

        Ok(StoredObject {
            sha256: hex::encode(hasher.finalize()),
            size: total_size,
            key: key.to_string(),
        })
    }

    async fn copy_object(&self, source_key: &str, dest_key: &str) -> Result<()> {
        let res = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, source_key))
            .key(dest_key)
            .send()
            .await;

        if let Err(e) = res {
            tracing::error!(
                "S3 copy_object failed: source={}/{}, dest={}, error={:?}",
                self.bucket,
                source_key,
                dest_key,
                e
            );
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        Ok(())
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        let res = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match res {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(anyhow::anyhow!(service_error))
                }
            }
        }
    }

    async fn get_file(&self, key: &str) -> Result<Vec<u8>> {
        let res = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        let data = res.body.collect().await?.to_vec();
        Ok(data)
    }

    async fn get_object_stream(&self, key: &str) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        let res = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        Ok(Box::new(Box::pin(res.body.into_async_read())))
    }
}

/// Keeps objects as plain files below `root`. Used for single-node setups and tests.
pub struct LocalStorageService {
    root: PathBuf,
}

impl LocalStorageService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            anyhow::bail!("invalid storage key '{}'", key);
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageService for LocalStorageService {
    async fn upload_file(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    async fn upload_stream_with_hash<'a>(
        &self,
        key: &str,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> Result<StoredObject> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;

        let mut file = tokio::fs::File::create(&path).await?;
        let mut hasher = Sha256::new();
        let mut total_size = 0i64;
        let mut buffer = vec![0u8; 64 * 1024];

        loop {
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            file.write_all(&buffer[..read]).await?;
            total_size += read as i64;
        }
        file.flush().await?;

        Ok(StoredObject {
            sha256: hex::encode(hasher.finalize()),
            size: total_size,
            key: key.to_string(),
        })
    }

    async fn copy_object(&self, source_key: &str, dest_key: &str) -> Result<()> {
        let source = self.path_for(source_key)?;
        let dest = self.path_for(dest_key)?;
        Self::ensure_parent(&dest).await?;
        tokio::fs::copy(&source, &dest).await?;
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn get_file(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn get_object_stream(&self, key: &str) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        let path = self.path_for(key)?;
        Ok(Box::new(tokio::fs::File::open(&path).await?))
    }
}
