#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use chrono::Utc;
use http_body_util::BodyExt;
use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, Set};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiki_upload::config::UploadConfig;
use wiki_upload::entities::{files, user_blocks, users};
use wiki_upload::infrastructure::database;
use wiki_upload::services::scanner::NoOpScanner;
use wiki_upload::services::storage::{LocalStorageService, StorageService};
use wiki_upload::services::upload_service::UploadService;
use wiki_upload::services::verification::{PolicyCheck, VerificationPipeline};
use wiki_upload::utils::auth::create_jwt;
use wiki_upload::{AppState, create_app};

const BOUNDARY: &str = "----wikiuploadtestboundary";

pub struct TestApp {
    pub app: Router,
    pub db: DatabaseConnection,
    pub config: Arc<UploadConfig>,
    _storage_dir: tempfile::TempDir,
}

pub fn test_config() -> UploadConfig {
    UploadConfig {
        min_chunk_size: 1000,
        ..UploadConfig::default()
    }
}

pub async fn setup(config: UploadConfig) -> TestApp {
    setup_with_policy(config, None).await
}

pub async fn setup_with_policy(
    config: UploadConfig,
    policy: Option<Arc<dyn PolicyCheck>>,
) -> TestApp {
    build(config, policy, None).await
}

pub async fn setup_with_storage(config: UploadConfig, storage: Arc<dyn StorageService>) -> TestApp {
    build(config, None, Some(storage)).await
}

async fn build(
    config: UploadConfig,
    policy: Option<Arc<dyn PolicyCheck>>,
    storage: Option<Arc<dyn StorageService>>,
) -> TestApp {
    let _ = tracing_subscriber::fmt::try_init();
    let db = Database::connect("sqlite::memory:").await.unwrap();
    database::run_migrations(&db).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn StorageService> =
        storage.unwrap_or_else(|| Arc::new(LocalStorageService::new(dir.path())));
    let config = Arc::new(config);

    let mut verifier = VerificationPipeline::new(config.clone(), Arc::new(NoOpScanner));
    if let Some(policy) = policy {
        verifier = verifier.with_policy(policy);
    }
    let upload_service =
        UploadService::new(db.clone(), storage, config.clone(), verifier).unwrap();

    let state = AppState {
        db: db.clone(),
        config: config.clone(),
        upload_service,
    };

    TestApp {
        app: create_app(state),
        db,
        config,
        _storage_dir: dir,
    }
}

impl TestApp {
    /// Creates a user and returns a bearer token for it.
    pub async fn user(&self, name: &str, rights: &[&str]) -> String {
        let id = format!("user-{}", name.to_lowercase());
        users::ActiveModel {
            id: Set(id.clone()),
            username: Set(name.to_string()),
            rights: Set(serde_json::json!(rights)),
            watch_uploads: Set(false),
            created_at: Set(Some(Utc::now())),
        }
        .insert(&self.db)
        .await
        .unwrap();
        create_jwt(&id, &self.config.jwt_secret).unwrap()
    }

    pub async fn block(&self, name: &str, reason: &str) {
        user_blocks::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            user_id: Set(format!("user-{}", name.to_lowercase())),
            blocker_id: Set("user-admin".to_string()),
            reason: Set(reason.to_string()),
            expires_at: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await
        .unwrap();
    }

    /// Records a published file without storing any bytes for it.
    pub async fn existing_file(&self, name: &str, uploader: &str) {
        files::ActiveModel {
            name: Set(name.to_string()),
            storage_key: Set(format!("public/{}", name)),
            size: Set(1),
            sha256: Set("0".repeat(64)),
            mime_type: Set(None),
            uploader_id: Set(format!("user-{}", uploader.to_lowercase())),
            comment: Set(String::new()),
            description: Set(String::new()),
            tags: Set(serde_json::json!([])),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await
        .unwrap();
    }

    pub async fn upload(&self, token: Option<&str>, form: Form) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            );
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = builder.body(Body::from(form.finish())).unwrap();

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    /// Repeats `checkstatus` until the session leaves `Poll`.
    pub async fn wait_for_result(&self, token: &str, file_key: &str) -> (StatusCode, Value) {
        for _ in 0..100 {
            let (status, body) = self
                .upload(
                    Some(token),
                    Form::new().text("checkstatus", "1").text("filekey", file_key),
                )
                .await;
            if body["result"] != "Poll" {
                return (status, body);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("upload {} never left Poll", file_key);
    }
}

/// Hand-built `multipart/form-data` body.
#[derive(Default)]
pub struct Form {
    body: Vec<u8>,
}

impl Form {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
        self
    }

    pub fn file(self, name: &str, filename: &str, data: &[u8]) -> Self {
        self.binary(name, filename, data)
    }

    pub fn chunk(self, data: &[u8]) -> Self {
        self.binary("chunk", "blob", data)
    }

    fn binary(mut self, name: &str, filename: &str, data: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                BOUNDARY, name, filename
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(data);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    fn finish(mut self) -> Vec<u8> {
        self.body
            .extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        self.body
    }
}

/// Plain ASCII bytes; nothing in them looks like a script or an executable.
pub fn content(len: usize, fill: u8) -> Vec<u8> {
    vec![fill; len]
}
