use crate::services::storage::{LocalStorageService, S3StorageService, StorageService};
use anyhow::Context;
use aws_sdk_s3::config::Region;
use std::env;
use std::sync::Arc;
use tracing::info;

/// Picks the byte store from `STORAGE_BACKEND` (`local` or `s3`, default `local`).
pub async fn setup_storage() -> anyhow::Result<Arc<dyn StorageService>> {
    let backend = env::var("STORAGE_BACKEND").unwrap_or_else(|_| "local".to_string());

    match backend.to_lowercase().as_str() {
        "s3" | "minio" => setup_s3().await,
        "local" => {
            let root = env::var("STORAGE_ROOT").unwrap_or_else(|_| "./data".to_string());
            tokio::fs::create_dir_all(&root)
                .await
                .with_context(|| format!("Failed to create storage root {}", root))?;
            info!("💾 Local Storage: {}", root);
            Ok(Arc::new(LocalStorageService::new(root)))
        }
        other => anyhow::bail!("Unknown STORAGE_BACKEND '{}', expected 'local' or 's3'", other),
    }
}

async fn setup_s3() -> anyhow::Result<Arc<dyn StorageService>> {
    let endpoint_url = env::var("MINIO_ENDPOINT").context("MINIO_ENDPOINT must be set")?;
    let access_key = env::var("MINIO_ACCESS_KEY").context("MINIO_ACCESS_KEY must be set")?;
    let secret_key = env::var("MINIO_SECRET_KEY").context("MINIO_SECRET_KEY must be set")?;
    let bucket = env::var("MINIO_BUCKET").context("MINIO_BUCKET must be set")?;
    let region = env::var("MINIO_REGION").unwrap_or_else(|_| "us-east-1".to_string());

    info!("☁️  S3 Storage: {} (Bucket: {})", endpoint_url, bucket);

    let aws_config = aws_config::from_env()
        .endpoint_url(&endpoint_url)
        .region(Region::new(region))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key, secret_key, None, None, "static",
        ))
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();

    let s3_client = aws_sdk_s3::Client::from_conf(s3_config);
    Ok(Arc::new(S3StorageService::new(s3_client, bucket)))
}
